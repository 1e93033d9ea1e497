//! Error types for the Flexible Server MCP server

use std::fmt;
use tracing::{debug, error, warn};

/// Result type alias for the server
pub type Result<T> = std::result::Result<T, ServerError>;

/// Main error type for the Flexible Server MCP server
#[derive(Debug)]
pub enum ServerError {
    /// Database connection errors
    Connection {
        /// The underlying database error
        source: sqlx::Error,
        /// User-friendly error message
        message: String,
        /// Whether this is a recoverable error
        recoverable: bool,
    },
    /// Statement execution errors
    Query {
        /// The SQL statement that failed
        sql: String,
        /// The underlying database error
        source: sqlx::Error,
        /// PostgreSQL SQLSTATE code if available
        error_code: Option<String>,
    },
    /// Request or descriptor validation errors
    Validation {
        /// The validation error message
        message: String,
        /// The invalid value that caused the error
        invalid_value: Option<String>,
    },
    /// Serialization/deserialization errors
    Serialization {
        /// The underlying serialization error
        source: serde_json::Error,
        /// Context about what was being serialized
        context: String,
    },
    /// Configuration errors
    Configuration {
        /// Configuration parameter that is invalid
        parameter: String,
        /// Error message
        message: String,
    },
    /// Access token acquisition errors
    Identity {
        /// Token source that failed (or "chain" when every source failed)
        provider: String,
        /// Error message
        message: String,
    },
    /// Management plane errors
    Management {
        /// Management operation that failed
        operation: String,
        /// Error message
        message: String,
    },
    /// Operation not available with the configured authentication mode
    Unsupported {
        /// Name of the rejected operation
        operation: String,
        /// Why the operation is unavailable
        message: String,
    },
    /// General I/O errors
    Io {
        /// The underlying I/O error
        source: std::io::Error,
        /// Context about the I/O operation
        context: String,
    },
    /// Protocol errors (MCP-specific)
    Protocol {
        /// Protocol error message
        message: String,
        /// Request ID if available
        request_id: Option<String>,
    },
    /// Internal server errors
    Internal {
        /// Error message (safe for client)
        message: String,
        /// Internal error details (for logging only)
        details: Option<String>,
    },
}

impl ServerError {
    /// Create a new connection error
    pub fn connection_error(source: sqlx::Error, recoverable: bool) -> Self {
        let message = Self::format_connection_error(&source, recoverable);
        error!("Connection error: {} (recoverable: {})", Self::sanitize_database_error(&source), recoverable);

        Self::Connection {
            source,
            message,
            recoverable,
        }
    }

    /// Create a new statement execution error
    pub fn query_error(sql: String, source: sqlx::Error) -> Self {
        let error_code = Self::extract_sqlstate(&source);
        error!("Statement execution failed: {} | SQL: {}", source, sql);

        Self::Query {
            sql,
            source,
            error_code,
        }
    }

    /// Create a new validation error
    pub fn validation_error(message: String, invalid_value: Option<String>) -> Self {
        warn!("Validation error: {} | Invalid value: {:?}", message, invalid_value);

        Self::Validation {
            message,
            invalid_value,
        }
    }

    /// Create a new serialization error
    pub fn serialization_error(source: serde_json::Error, context: String) -> Self {
        error!("Serialization error in {}: {}", context, source);

        Self::Serialization {
            source,
            context,
        }
    }

    /// Create a new configuration error
    pub fn configuration_error(parameter: String, message: String) -> Self {
        error!("Configuration error for '{}': {}", parameter, message);

        Self::Configuration {
            parameter,
            message,
        }
    }

    /// Create a new token acquisition error
    pub fn identity_error(provider: String, message: String) -> Self {
        error!("Failed to acquire access token from {}: {}", provider, message);

        Self::Identity {
            provider,
            message,
        }
    }

    /// Failure of one token source inside a chain; only the chain's summary is an error diagnostic
    pub fn token_source_failure(provider: String, message: String) -> Self {
        debug!("Token source {} failed: {}", provider, message);

        Self::Identity {
            provider,
            message,
        }
    }

    /// Create a new management plane error
    pub fn management_error(operation: String, message: String) -> Self {
        error!("Management operation '{}' failed: {}", operation, message);

        Self::Management {
            operation,
            message,
        }
    }

    /// Create a new unsupported operation error
    pub fn unsupported_operation(operation: String, message: String) -> Self {
        warn!("Unsupported operation '{}': {}", operation, message);

        Self::Unsupported {
            operation,
            message,
        }
    }

    /// Create a new I/O error
    pub fn io_error(source: std::io::Error, context: String) -> Self {
        error!("I/O error in {}: {}", context, source);

        Self::Io {
            source,
            context,
        }
    }

    /// Create a new protocol error
    pub fn protocol_error(message: String, request_id: Option<String>) -> Self {
        warn!("Protocol error: {} | Request ID: {:?}", message, request_id);

        Self::Protocol {
            message,
            request_id,
        }
    }

    /// Create a new internal error
    pub fn internal_error(message: String, details: Option<String>) -> Self {
        error!("Internal server error: {} | Details: {:?}", message, details);

        Self::Internal {
            message,
            details,
        }
    }

    /// Whether this error came from talking to the database
    pub fn is_database_error(&self) -> bool {
        matches!(self, ServerError::Connection { .. } | ServerError::Query { .. })
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            ServerError::Connection { recoverable, .. } => *recoverable,
            ServerError::Query { .. } => false,
            ServerError::Validation { .. } => false,
            ServerError::Serialization { .. } => false,
            ServerError::Configuration { .. } => false,
            ServerError::Identity { .. } => true, // tokens are re-requested on the next call
            ServerError::Management { .. } => true,
            ServerError::Unsupported { .. } => false,
            ServerError::Io { .. } => true,
            ServerError::Protocol { .. } => false,
            ServerError::Internal { .. } => false,
        }
    }

    /// Get a user-friendly error message (safe to send to clients)
    pub fn user_message(&self) -> String {
        match self {
            ServerError::Connection { message, .. } => message.clone(),
            ServerError::Query { source, .. } => {
                format!("Statement execution failed: {}", Self::sanitize_database_error(source))
            }
            ServerError::Validation { message, .. } => message.clone(),
            ServerError::Serialization { context, .. } => {
                format!("Data serialization error in {}", context)
            }
            ServerError::Configuration { parameter, message } => {
                format!("Configuration error for '{}': {}", parameter, message)
            }
            ServerError::Identity { .. } => {
                "Unable to acquire an access token for the database".to_string()
            }
            ServerError::Management { operation, .. } => {
                format!("Management operation '{}' failed", operation)
            }
            ServerError::Unsupported { message, .. } => message.clone(),
            ServerError::Io { context, .. } => {
                format!("I/O error during {}", context)
            }
            ServerError::Protocol { message, .. } => message.clone(),
            ServerError::Internal { message, .. } => message.clone(),
        }
    }

    /// Get detailed error information for logging
    pub fn detailed_message(&self) -> String {
        match self {
            ServerError::Connection { source, message, recoverable } => {
                format!(
                    "Connection error: {} | Recoverable: {} | Source: {}",
                    message,
                    recoverable,
                    Self::sanitize_database_error(source)
                )
            }
            ServerError::Query { sql, source, error_code } => {
                format!("Query error: {} | SQL: {} | SQLSTATE: {:?}", source, sql, error_code)
            }
            ServerError::Validation { message, invalid_value } => {
                format!("Validation error: {} | Invalid value: {:?}", message, invalid_value)
            }
            ServerError::Serialization { source, context } => {
                format!("Serialization error in {}: {}", context, source)
            }
            ServerError::Configuration { parameter, message } => {
                format!("Configuration error for '{}': {}", parameter, message)
            }
            ServerError::Identity { provider, message } => {
                format!("Identity error from {}: {}", provider, message)
            }
            ServerError::Management { operation, message } => {
                format!("Management error in {}: {}", operation, message)
            }
            ServerError::Unsupported { operation, message } => {
                format!("Unsupported operation {}: {}", operation, message)
            }
            ServerError::Io { source, context } => {
                format!("I/O error in {}: {}", context, source)
            }
            ServerError::Protocol { message, request_id } => {
                format!("Protocol error: {} | Request ID: {:?}", message, request_id)
            }
            ServerError::Internal { message, details } => {
                format!("Internal error: {} | Details: {:?}", message, details)
            }
        }
    }

    /// Format connection error message based on the underlying error
    fn format_connection_error(source: &sqlx::Error, recoverable: bool) -> String {
        match source {
            sqlx::Error::Io(_) => {
                if recoverable {
                    "Unable to connect to database. Please check network connectivity and try again.".to_string()
                } else {
                    "Database connection failed due to network error.".to_string()
                }
            }
            sqlx::Error::Tls(_) => {
                "Database connection failed due to TLS/SSL error. Please check the sslmode setting.".to_string()
            }
            sqlx::Error::Protocol(_) => {
                "Database connection failed due to protocol error.".to_string()
            }
            sqlx::Error::Configuration(_) => {
                "Database connection failed due to configuration error. Please check connection parameters.".to_string()
            }
            _ => {
                let text = source.to_string();
                if text.contains("password authentication failed") || text.contains("authentication") {
                    "Database connection failed: Invalid credentials or insufficient permissions.".to_string()
                } else if text.contains("does not exist") {
                    format!("Database connection failed: {}", Self::sanitize_database_error(source))
                } else if text.contains("timeout") || text.contains("timed out") {
                    "Database connection timed out. Please check network connectivity and database availability.".to_string()
                } else {
                    format!("Database connection failed: {}", Self::sanitize_database_error(source))
                }
            }
        }
    }

    /// Extract the SQLSTATE code from a database error if available
    fn extract_sqlstate(source: &sqlx::Error) -> Option<String> {
        match source {
            sqlx::Error::Database(db_error) => db_error.code().map(|code| code.into_owned()),
            _ => None,
        }
    }

    /// Sanitize database error messages to remove sensitive information
    fn sanitize_database_error(source: &sqlx::Error) -> String {
        let error_str = source.to_string();

        let sanitized = match error_str.find("password=") {
            Some(start) => {
                let rest = &error_str[start + "password=".len()..];
                let end = rest.find(|c: char| c.is_whitespace() || c == '&').unwrap_or(rest.len());
                format!("{}password=[REDACTED]{}", &error_str[..start], &rest[end..])
            }
            None => error_str,
        };

        // Limit error message length to prevent log flooding
        if sanitized.chars().count() > 500 {
            format!("{}...", sanitized.chars().take(497).collect::<String>())
        } else {
            sanitized
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Connection { source, .. } => Some(source),
            ServerError::Query { source, .. } => Some(source),
            ServerError::Serialization { source, .. } => Some(source),
            ServerError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for ServerError {
    fn from(err: sqlx::Error) -> Self {
        let recoverable = matches!(err,
            sqlx::Error::Io(_) |
            sqlx::Error::PoolTimedOut |
            sqlx::Error::PoolClosed
        );

        ServerError::connection_error(err, recoverable)
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::serialization_error(err, "unknown context".to_string())
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::io_error(err, "unknown context".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_operation_is_reported_verbatim() {
        let err = ServerError::unsupported_operation(
            "get_server_config".to_string(),
            "This tool is available only with Microsoft Entra ID authentication".to_string(),
        );

        assert!(!err.is_recoverable());
        assert!(!err.is_database_error());
        assert_eq!(
            err.to_string(),
            "This tool is available only with Microsoft Entra ID authentication"
        );
    }

    #[test]
    fn test_connection_error_classification() {
        let err = ServerError::from(sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        )));

        assert!(err.is_database_error());
        assert!(err.is_recoverable());
        assert!(err.user_message().contains("network connectivity"));
    }

    #[test]
    fn test_sanitize_hides_password() {
        let err = sqlx::Error::Configuration("bad descriptor host=h password=hunter2 user=u".into());
        let sanitized = ServerError::sanitize_database_error(&err);

        assert!(!sanitized.contains("hunter2"));
        assert!(sanitized.contains("password=[REDACTED]"));
        assert!(sanitized.contains("user=u"));
    }

    #[test]
    fn test_configuration_error_message_names_parameter() {
        let err = ServerError::configuration_error(
            "PGPASSWORD".to_string(),
            "must be set when Entra ID authentication is disabled".to_string(),
        );

        assert!(err.user_message().contains("PGPASSWORD"));
        assert!(err.detailed_message().contains("Entra ID"));
    }
}
