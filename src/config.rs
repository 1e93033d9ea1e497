//! Configuration structures for the Flexible Server MCP server

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use crate::{Result, ServerError};

/// Complete server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub azure: AzureConfig,
    #[serde(default)]
    pub mcp: McpConfig,
}

/// Transport the MCP server speaks on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Newline-delimited JSON-RPC over stdin/stdout
    #[default]
    Stdio,
    /// JSON-RPC over HTTP POST at /mcp
    Http,
}

impl Transport {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "stdio" => Some(Transport::Stdio),
            "http" => Some(Transport::Http),
            _ => None,
        }
    }
}

/// How the database credential is obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Fixed password from configuration
    Password,
    /// Short-lived Microsoft Entra ID access token
    EntraId,
}

/// Server configuration section
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Transport to serve MCP on
    #[serde(default)]
    pub transport: Transport,
    /// Listening port for the HTTP transport
    #[serde(default = "default_http_port")]
    pub port: u16,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: Transport::default(),
            port: default_http_port(),
            log_level: default_log_level(),
        }
    }
}

/// Database configuration section
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Fully qualified server name (e.g., myserver.postgres.database.azure.com)
    pub host: String,
    /// Database port (default: 5432)
    #[serde(default = "default_postgres_port")]
    pub port: u16,
    /// Database user
    pub user: String,
    /// Static password, required unless Entra ID authentication is enabled
    #[serde(default)]
    pub password: Option<String>,
    /// Fixed database; when unset every tool call names its database
    #[serde(default)]
    pub database: Option<String>,
    /// libpq-style sslmode
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,
}

impl DatabaseConfig {
    /// Host name up to the first dot, used as the server name and in resource URIs
    pub fn server_name(&self) -> &str {
        self.host.split('.').next().unwrap_or(&self.host)
    }
}

/// Microsoft Entra ID and management plane configuration section
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AzureConfig {
    /// Use Entra ID access tokens instead of a static password
    #[serde(default)]
    pub use_aad: bool,
    /// Subscription that owns the flexible server
    #[serde(default)]
    pub subscription_id: Option<String>,
    /// Resource group that owns the flexible server
    #[serde(default)]
    pub resource_group: Option<String>,
    /// Tenant for the client secret credential
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Application (client) id for the client secret or user-assigned managed identity
    #[serde(default)]
    pub client_id: Option<String>,
    /// Client secret for the client secret credential
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Entra ID authority host
    #[serde(default)]
    pub authority_host: Option<String>,
}

impl AzureConfig {
    pub fn authority_host(&self) -> &str {
        self.authority_host
            .as_deref()
            .unwrap_or(DEFAULT_AUTHORITY_HOST)
    }
}

/// MCP protocol configuration section
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McpConfig {
    /// MCP protocol version
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// Server name
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// Server version
    #[serde(default = "default_server_version")]
    pub server_version: String,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            protocol_version: default_protocol_version(),
            server_name: default_server_name(),
            server_version: default_server_version(),
        }
    }
}

pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

const SSL_MODES: [&str; 6] = ["disable", "allow", "prefer", "require", "verify-ca", "verify-full"];

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ServerError::configuration_error(
                path.display().to_string(),
                "Configuration file not found".to_string(),
            ));
        }

        let content = fs::read_to_string(path)
            .map_err(|e| ServerError::io_error(e, format!("reading {}", path.display())))?;

        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| ServerError::configuration_error(
                "config.toml".to_string(),
                format!("Failed to parse configuration file: {}", e),
            ))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration with fallback to default file locations
    pub fn load() -> Result<Self> {
        let config_paths = [
            "config.toml",
            "./config.toml",
            "config/config.toml",
        ];

        for path in &config_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        Self::from_env()
    }

    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from a variable lookup (PGHOST, PGUSER, AZURE_USE_AAD, ...)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.is_empty());
        let required = |name: &str| {
            var(name).ok_or_else(|| ServerError::configuration_error(
                name.to_string(),
                format!("Environment variable {} not found", name),
            ))
        };

        let host = required("PGHOST")?;
        let user = required("PGUSER")?;

        let port = match var("PGPORT") {
            Some(port_str) => port_str.parse().map_err(|_| ServerError::configuration_error(
                "PGPORT".to_string(),
                format!("Invalid PGPORT value: {}", port_str),
            ))?,
            None => default_postgres_port(),
        };

        let http_port = match var("PORT") {
            Some(port_str) => port_str.parse().map_err(|_| ServerError::configuration_error(
                "PORT".to_string(),
                format!("Invalid PORT value: {}", port_str),
            ))?,
            None => default_http_port(),
        };

        let transport = match var("MCP_TRANSPORT") {
            Some(value) => Transport::parse(&value).ok_or_else(|| ServerError::configuration_error(
                "MCP_TRANSPORT".to_string(),
                format!("Unknown transport '{}', expected stdio or http", value),
            ))?,
            None => Transport::default(),
        };

        let config = Config {
            server: ServerConfig {
                transport,
                port: http_port,
                log_level: var("LOG_LEVEL").unwrap_or_else(default_log_level),
            },
            database: DatabaseConfig {
                host,
                port,
                user,
                password: var("PGPASSWORD"),
                database: var("PGDATABASE"),
                ssl_mode: var("PGSSLMODE").unwrap_or_else(default_ssl_mode),
            },
            azure: AzureConfig {
                use_aad: var("AZURE_USE_AAD").map(|v| is_enabled(&v)).unwrap_or(false),
                subscription_id: var("AZURE_SUBSCRIPTION_ID"),
                resource_group: var("AZURE_RESOURCE_GROUP"),
                tenant_id: var("AZURE_TENANT_ID"),
                client_id: var("AZURE_CLIENT_ID"),
                client_secret: var("AZURE_CLIENT_SECRET"),
                authority_host: var("AZURE_AUTHORITY_HOST"),
            },
            mcp: McpConfig::default(),
        };

        config.validate()?;

        Ok(config)
    }

    /// Authentication mode selected by the configuration
    pub fn auth_mode(&self) -> AuthMode {
        if self.azure.use_aad {
            AuthMode::EntraId
        } else {
            AuthMode::Password
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.host.trim().is_empty() {
            return Err(ServerError::configuration_error(
                "database.host".to_string(),
                "Database host cannot be empty".to_string(),
            ));
        }

        if self.database.user.trim().is_empty() {
            return Err(ServerError::configuration_error(
                "database.user".to_string(),
                "Database user cannot be empty".to_string(),
            ));
        }

        if matches!(&self.database.database, Some(name) if name.trim().is_empty()) {
            return Err(ServerError::configuration_error(
                "database.database".to_string(),
                "Database name cannot be empty when set".to_string(),
            ));
        }

        if self.database.port == 0 {
            return Err(ServerError::configuration_error(
                "database.port".to_string(),
                "Database port cannot be 0".to_string(),
            ));
        }

        if !SSL_MODES.contains(&self.database.ssl_mode.as_str()) {
            return Err(ServerError::configuration_error(
                "database.ssl_mode".to_string(),
                format!("Invalid sslmode '{}', expected one of {:?}", self.database.ssl_mode, SSL_MODES),
            ));
        }

        if self.server.transport == Transport::Http && self.server.port == 0 {
            return Err(ServerError::configuration_error(
                "server.port".to_string(),
                "Server port cannot be 0".to_string(),
            ));
        }

        match self.server.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ServerError::configuration_error(
                    "server.log_level".to_string(),
                    format!("Invalid log level: {}", self.server.log_level),
                ));
            }
        }

        match self.auth_mode() {
            AuthMode::Password => {
                if self.database.password.is_none() {
                    return Err(ServerError::configuration_error(
                        "PGPASSWORD".to_string(),
                        "A password is required when Entra ID authentication is disabled".to_string(),
                    ));
                }
            }
            AuthMode::EntraId => {
                if self.azure.subscription_id.as_deref().map_or(true, str::is_empty) {
                    return Err(ServerError::configuration_error(
                        "AZURE_SUBSCRIPTION_ID".to_string(),
                        "A subscription id is required with Entra ID authentication".to_string(),
                    ));
                }
                if self.azure.resource_group.as_deref().map_or(true, str::is_empty) {
                    return Err(ServerError::configuration_error(
                        "AZURE_RESOURCE_GROUP".to_string(),
                        "A resource group is required with Entra ID authentication".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}

fn is_enabled(value: &str) -> bool {
    !matches!(value.trim().to_lowercase().as_str(), "" | "0" | "false" | "no" | "off")
}

// Default value functions for serde
fn default_postgres_port() -> u16 {
    5432
}

fn default_http_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ssl_mode() -> String {
    "prefer".to_string()
}

fn default_protocol_version() -> String {
    "2024-11-05".to_string()
}

fn default_server_name() -> String {
    "Flex PG Explorer".to_string()
}

fn default_server_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_from_lookup_static_password() {
        let config = Config::from_lookup(lookup_from(&[
            ("PGHOST", "myserver.postgres.database.azure.com"),
            ("PGUSER", "admin@corp"),
            ("PGPASSWORD", "secret"),
            ("PGDATABASE", "inventory"),
        ]))
        .unwrap();

        assert_eq!(config.auth_mode(), AuthMode::Password);
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.database.ssl_mode, "prefer");
        assert_eq!(config.database.database.as_deref(), Some("inventory"));
        assert_eq!(config.database.server_name(), "myserver");
        assert_eq!(config.server.transport, Transport::Stdio);
    }

    #[test]
    fn test_from_lookup_missing_host_is_configuration_error() {
        let result = Config::from_lookup(lookup_from(&[("PGUSER", "u"), ("PGPASSWORD", "p")]));

        match result {
            Err(ServerError::Configuration { parameter, .. }) => assert_eq!(parameter, "PGHOST"),
            other => panic!("Expected configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_static_mode_requires_password() {
        let result = Config::from_lookup(lookup_from(&[("PGHOST", "h"), ("PGUSER", "u")]));

        match result {
            Err(ServerError::Configuration { parameter, .. }) => assert_eq!(parameter, "PGPASSWORD"),
            other => panic!("Expected configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_entra_mode_requires_subscription_and_resource_group() {
        let missing_rg = Config::from_lookup(lookup_from(&[
            ("PGHOST", "h"),
            ("PGUSER", "u"),
            ("AZURE_USE_AAD", "True"),
            ("AZURE_SUBSCRIPTION_ID", "sub"),
        ]));
        assert!(matches!(
            missing_rg,
            Err(ServerError::Configuration { ref parameter, .. }) if parameter == "AZURE_RESOURCE_GROUP"
        ));

        let config = Config::from_lookup(lookup_from(&[
            ("PGHOST", "h"),
            ("PGUSER", "u"),
            ("AZURE_USE_AAD", "True"),
            ("AZURE_SUBSCRIPTION_ID", "sub"),
            ("AZURE_RESOURCE_GROUP", "rg"),
        ]))
        .unwrap();
        assert_eq!(config.auth_mode(), AuthMode::EntraId);
        assert!(config.database.password.is_none());
    }

    #[test]
    fn test_aad_flag_values() {
        assert!(is_enabled("true"));
        assert!(is_enabled("1"));
        assert!(is_enabled("yes"));
        assert!(!is_enabled("false"));
        assert!(!is_enabled("0"));
        assert!(!is_enabled(""));
    }

    #[test]
    fn test_invalid_pgport() {
        let result = Config::from_lookup(lookup_from(&[
            ("PGHOST", "h"),
            ("PGUSER", "u"),
            ("PGPASSWORD", "p"),
            ("PGPORT", "not-a-port"),
        ]));
        assert!(matches!(result, Err(ServerError::Configuration { .. })));
    }

    #[test]
    fn test_config_from_toml() {
        let config_content = r#"
[server]
transport = "http"
port = 9999
log_level = "debug"

[database]
host = "testhost.postgres.database.azure.com"
port = 6432
user = "testuser"
password = "testpass"
ssl_mode = "require"

[mcp]
server_name = "test-server"
"#;

        let config = Config::from_toml_str(config_content).unwrap();

        assert_eq!(config.server.transport, Transport::Http);
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.database.host, "testhost.postgres.database.azure.com");
        assert_eq!(config.database.port, 6432);
        assert_eq!(config.database.user, "testuser");
        assert_eq!(config.database.password.as_deref(), Some("testpass"));
        assert!(config.database.database.is_none());
        assert_eq!(config.database.ssl_mode, "require");
        assert!(!config.azure.use_aad);
        assert_eq!(config.mcp.server_name, "test-server");
        assert_eq!(config.mcp.protocol_version, "2024-11-05");
    }

    #[test]
    fn test_config_rejects_unknown_ssl_mode_and_log_level() {
        let bad_ssl = r#"
[database]
host = "h"
user = "u"
password = "p"
ssl_mode = "sometimes"
"#;
        assert!(Config::from_toml_str(bad_ssl).is_err());

        let bad_level = r#"
[server]
log_level = "loud"

[database]
host = "h"
user = "u"
password = "p"
"#;
        assert!(Config::from_toml_str(bad_level).is_err());
    }

    #[test]
    fn test_server_name_without_dots() {
        let config = DatabaseConfig {
            host: "localhost".to_string(),
            port: 5432,
            user: "u".to_string(),
            password: None,
            database: None,
            ssl_mode: default_ssl_mode(),
        };
        assert_eq!(config.server_name(), "localhost");
    }
}
