//! Microsoft Entra ID token sources
//!
//! Access tokens are used as the database password in Entra ID mode and as
//! the bearer token for management plane calls. Sources are tried in order by
//! [`DefaultTokenChain`]; nothing is cached, so every call asks the source for
//! a token again.

use crate::config::AzureConfig;
use crate::{Result, ServerError};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Scope for Azure Database for PostgreSQL access tokens
pub const DATABASE_TOKEN_SCOPE: &str = "https://ossrdbms-aad.database.windows.net/.default";

/// Scope for Azure Resource Manager access tokens
pub const MANAGEMENT_TOKEN_SCOPE: &str = "https://management.azure.com/.default";

const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

/// A bearer token returned by a token source
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: Option<DateTime<Utc>>,
}

/// A source of access tokens
#[async_trait]
pub trait TokenCredential: Send + Sync {
    /// Name used in logs and error messages
    fn name(&self) -> &str;

    /// Request a token for `scope` (e.g. `https://management.azure.com/.default`)
    async fn get_token(&self, scope: &str) -> Result<AccessToken>;
}

/// Strip the `/.default` suffix to get the v1 resource identifier
fn scope_to_resource(scope: &str) -> &str {
    scope.strip_suffix("/.default").unwrap_or(scope)
}

fn epoch_to_datetime(seconds: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0).single()
}

/// OAuth2 client credentials grant with an application secret
pub struct ClientSecretCredential {
    client: Client,
    authority_host: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
}

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    expires_in: Option<i64>,
}

impl ClientSecretCredential {
    pub fn new(
        authority_host: &str,
        tenant_id: String,
        client_id: String,
        client_secret: String,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ServerError::internal_error(
                "Failed to create HTTP client".to_string(),
                Some(e.to_string()),
            ))?;

        Ok(Self {
            client,
            authority_host: authority_host.trim_end_matches('/').to_string(),
            tenant_id,
            client_id,
            client_secret,
        })
    }

    fn token_url(&self) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.authority_host, self.tenant_id)
    }
}

#[async_trait]
impl TokenCredential for ClientSecretCredential {
    fn name(&self) -> &str {
        "client secret"
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken> {
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", scope),
        ];

        let response = self
            .client
            .post(self.token_url())
            .form(&params)
            .send()
            .await
            .map_err(|e| ServerError::token_source_failure(self.name().to_string(), e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ServerError::token_source_failure(
                self.name().to_string(),
                format!("token endpoint returned {}: {}", status, text),
            ));
        }

        let body: OAuthTokenResponse = response
            .json()
            .await
            .map_err(|e| ServerError::token_source_failure(self.name().to_string(), e.to_string()))?;

        Ok(AccessToken {
            token: body.access_token,
            expires_on: body
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
        })
    }
}

/// Managed identity via App Service's identity endpoint or the instance metadata service
pub struct ManagedIdentityCredential {
    client: Client,
    client_id: Option<String>,
    app_service: Option<(String, String)>,
}

#[derive(Debug, Deserialize)]
struct ManagedIdentityTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_on: Option<serde_json::Value>,
}

impl ManagedIdentityCredential {
    /// Build from the process environment (IDENTITY_ENDPOINT / IDENTITY_HEADER)
    pub fn new(client_id: Option<String>) -> Result<Self> {
        let app_service = match (
            std::env::var("IDENTITY_ENDPOINT").ok(),
            std::env::var("IDENTITY_HEADER").ok(),
        ) {
            (Some(endpoint), Some(header)) => Some((endpoint, header)),
            _ => None,
        };

        // IMDS is link-local; outside Azure the connect attempt should give up fast
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ServerError::internal_error(
                "Failed to create HTTP client".to_string(),
                Some(e.to_string()),
            ))?;

        Ok(Self {
            client,
            client_id,
            app_service,
        })
    }
}

#[async_trait]
impl TokenCredential for ManagedIdentityCredential {
    fn name(&self) -> &str {
        "managed identity"
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken> {
        let resource = scope_to_resource(scope);

        let mut request = match &self.app_service {
            Some((endpoint, header)) => self
                .client
                .get(endpoint)
                .header("X-IDENTITY-HEADER", header)
                .query(&[("api-version", "2019-08-01"), ("resource", resource)]),
            None => self
                .client
                .get(IMDS_ENDPOINT)
                .header("Metadata", "true")
                .query(&[("api-version", "2018-02-01"), ("resource", resource)]),
        };

        if let Some(client_id) = &self.client_id {
            request = request.query(&[("client_id", client_id.as_str())]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ServerError::token_source_failure(self.name().to_string(), e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ServerError::token_source_failure(
                self.name().to_string(),
                format!("identity endpoint returned {}: {}", status, text),
            ));
        }

        let body: ManagedIdentityTokenResponse = response
            .json()
            .await
            .map_err(|e| ServerError::token_source_failure(self.name().to_string(), e.to_string()))?;

        // expires_on arrives as epoch seconds, as a string or a number depending on the endpoint
        let expires_on = match body.expires_on {
            Some(serde_json::Value::String(s)) => s.parse().ok().and_then(epoch_to_datetime),
            Some(serde_json::Value::Number(n)) => n.as_i64().and_then(epoch_to_datetime),
            _ => None,
        };

        Ok(AccessToken {
            token: body.access_token,
            expires_on,
        })
    }
}

/// Token from the signed-in Azure CLI account
pub struct AzureCliCredential;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliTokenResponse {
    access_token: String,
    #[serde(default, rename = "expires_on")]
    expires_on: Option<i64>,
}

impl AzureCliCredential {
    fn parse_output(stdout: &[u8]) -> Result<AccessToken> {
        let body: CliTokenResponse = serde_json::from_slice(stdout)
            .map_err(|e| ServerError::token_source_failure("azure cli".to_string(), e.to_string()))?;

        Ok(AccessToken {
            token: body.access_token,
            expires_on: body.expires_on.and_then(epoch_to_datetime),
        })
    }
}

#[async_trait]
impl TokenCredential for AzureCliCredential {
    fn name(&self) -> &str {
        "azure cli"
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken> {
        let output = tokio::process::Command::new("az")
            .args([
                "account",
                "get-access-token",
                "--output",
                "json",
                "--resource",
                scope_to_resource(scope),
            ])
            .output()
            .await
            .map_err(|e| ServerError::token_source_failure(self.name().to_string(), e.to_string()))?;

        if !output.status.success() {
            return Err(ServerError::token_source_failure(
                self.name().to_string(),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Self::parse_output(&output.stdout)
    }
}

/// Tries each source in order and returns the first token obtained
pub struct DefaultTokenChain {
    sources: Vec<Arc<dyn TokenCredential>>,
}

impl DefaultTokenChain {
    pub fn with_sources(sources: Vec<Arc<dyn TokenCredential>>) -> Self {
        Self { sources }
    }

    /// Client secret (when fully configured), then managed identity, then Azure CLI
    pub fn from_config(config: &AzureConfig) -> Result<Self> {
        let mut sources: Vec<Arc<dyn TokenCredential>> = Vec::new();

        if let (Some(tenant_id), Some(client_id), Some(client_secret)) = (
            config.tenant_id.clone(),
            config.client_id.clone(),
            config.client_secret.clone(),
        ) {
            sources.push(Arc::new(ClientSecretCredential::new(
                config.authority_host(),
                tenant_id,
                client_id,
                client_secret,
            )?));
        }

        let managed_client_id = match config.client_secret {
            Some(_) => None,
            None => config.client_id.clone(),
        };
        sources.push(Arc::new(ManagedIdentityCredential::new(managed_client_id)?));
        sources.push(Arc::new(AzureCliCredential));

        Ok(Self { sources })
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }
}

#[async_trait]
impl TokenCredential for DefaultTokenChain {
    fn name(&self) -> &str {
        "default chain"
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken> {
        let mut failures = Vec::new();

        for source in &self.sources {
            match source.get_token(scope).await {
                Ok(token) => {
                    debug!("Acquired token for {} from {}", scope, source.name());
                    return Ok(token);
                }
                Err(ServerError::Identity { message, .. }) => {
                    failures.push(format!("{}: {}", source.name(), message))
                }
                Err(e) => failures.push(format!("{}: {}", source.name(), e.detailed_message())),
            }
        }

        Err(ServerError::identity_error(
            self.name().to_string(),
            format!("no token source succeeded [{}]", failures.join("; ")),
        ))
    }
}
