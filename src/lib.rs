//! Flexible Server MCP Server
//!
//! A Model Context Protocol server in Rust that exposes an Azure Database for
//! PostgreSQL flexible server to MCP clients: read queries, committed writes,
//! schema and database listings, and server metadata from the management plane.

pub mod config;
pub mod connection;
pub mod credential;
pub mod error;
pub mod format;
pub mod identity;
pub mod management;
pub mod query;
pub mod server;

pub use config::{AuthMode, AzureConfig, Config, DatabaseConfig, McpConfig, ServerConfig, Transport};
pub use credential::CredentialResolver;
pub use error::{Result, ServerError};
pub use format::{PayloadShape, ResultFormatter};
pub use query::{QueryOutcome, ResultSet, Row, Scalar, WriteOutcome};

// Re-export server module for external use
pub use server::McpServer;
