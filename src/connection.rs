//! Connection descriptors for per-call database connections

use crate::config::DatabaseConfig;
use crate::credential::CredentialResolver;
use crate::{Result, ServerError};
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use std::fmt;
use std::str::FromStr;
use tracing::debug;
use url::Url;

/// Everything needed to open one database connection
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub credential: String,
    pub ssl_mode: String,
}

impl ConnectionTarget {
    /// `postgres://` descriptor with the credential replaced by `****`, for logs
    pub fn masked_connection_url(&self) -> String {
        let fallback = || format!("postgres://****@{}:{}/{}", self.host, self.port, self.database);

        let mut url = match Url::parse(&format!("postgres://{}:{}", self.host, self.port)) {
            Ok(url) => url,
            Err(_) => return fallback(),
        };
        if url.set_username(&self.user).is_err() || url.set_password(Some("****")).is_err() {
            return fallback();
        }
        url.set_path(&self.database);
        url.query_pairs_mut().append_pair("sslmode", &self.ssl_mode);

        url.to_string()
    }

    /// Driver options; user and credential are passed verbatim, never through URL decoding
    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        let ssl_mode = PgSslMode::from_str(&self.ssl_mode).map_err(|e| ServerError::validation_error(
            format!("Invalid sslmode: {}", e),
            Some(self.ssl_mode.clone()),
        ))?;

        Ok(PgConnectOptions::new_without_pgpass()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.credential)
            .database(&self.database)
            .ssl_mode(ssl_mode))
    }
}

impl fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("credential", &"****")
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Builds a fresh [`ConnectionTarget`] for each call
#[derive(Debug, Clone)]
pub struct ConnectionDescriptorBuilder {
    host: String,
    port: u16,
    user: String,
    ssl_mode: String,
    default_database: Option<String>,
    resolver: CredentialResolver,
}

impl ConnectionDescriptorBuilder {
    pub fn new(config: &DatabaseConfig, resolver: CredentialResolver) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            user: config.user.clone(),
            ssl_mode: config.ssl_mode.clone(),
            default_database: config.database.clone(),
            resolver,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// The fixed database in the single-database variant
    pub fn default_database(&self) -> Option<&str> {
        self.default_database.as_deref()
    }

    pub fn resolver(&self) -> &CredentialResolver {
        &self.resolver
    }

    /// Pick the requested database, falling back to the fixed one
    pub fn database_or_default<'a>(&'a self, requested: Option<&'a str>) -> Result<&'a str> {
        match requested.filter(|name| !name.trim().is_empty()) {
            Some(name) => Ok(name),
            None => self.default_database().ok_or_else(|| ServerError::validation_error(
                "Missing required parameter: database".to_string(),
                Some("no database argument and no PGDATABASE configured".to_string()),
            )),
        }
    }

    /// Combine the fixed host/user with a freshly resolved credential
    pub async fn build_target(&self, database_name: &str) -> Result<ConnectionTarget> {
        if database_name.trim().is_empty() {
            return Err(ServerError::validation_error(
                "Database name cannot be empty".to_string(),
                Some("empty string".to_string()),
            ));
        }

        let credential = self.resolver.resolve_credential().await?;

        let target = ConnectionTarget {
            host: self.host.clone(),
            port: self.port,
            database: database_name.to_string(),
            user: self.user.clone(),
            credential,
            ssl_mode: self.ssl_mode.clone(),
        };

        debug!("Connection target: {}", target.masked_connection_url());
        Ok(target)
    }
}
