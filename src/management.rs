//! Azure Resource Manager client for flexible server metadata
//!
//! Only used with Entra ID authentication; the bearer token comes from the
//! same token chain as the database credential.

use crate::identity::{TokenCredential, MANAGEMENT_TOKEN_SCOPE};
use crate::{Result, ServerError};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

pub const MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";
pub const API_VERSION: &str = "2022-12-01";

/// Server summary returned by `get_server_config`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfiguration {
    pub name: Option<String>,
    pub location: Option<String>,
    pub version: Option<String>,
    pub sku: Option<String>,
    pub storage_profile: StorageProfile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageProfile {
    pub storage_size_gb: Option<i64>,
    pub backup_retention_days: Option<i64>,
    pub geo_redundant_backup: Option<String>,
}

/// Value of one server parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerParameter {
    pub param: Option<String>,
    pub value: Option<String>,
}

/// Management plane operations for one server
#[async_trait]
pub trait ServerManagement: Send + Sync {
    async fn get_server(&self) -> Result<ServerConfiguration>;

    async fn get_parameter(&self, name: &str) -> Result<ServerParameter>;
}

// ARM response types
#[derive(Debug, Deserialize)]
struct ArmServer {
    name: Option<String>,
    location: Option<String>,
    sku: Option<ArmSku>,
    #[serde(default)]
    properties: ArmServerProperties,
}

#[derive(Debug, Deserialize)]
struct ArmSku {
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmServerProperties {
    version: Option<String>,
    storage: Option<ArmStorage>,
    backup: Option<ArmBackup>,
}

#[derive(Debug, Deserialize)]
struct ArmStorage {
    #[serde(rename = "storageSizeGB")]
    storage_size_gb: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmBackup {
    backup_retention_days: Option<i64>,
    geo_redundant_backup: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ArmConfiguration {
    name: Option<String>,
    #[serde(default)]
    properties: ArmConfigurationProperties,
}

#[derive(Debug, Default, Deserialize)]
struct ArmConfigurationProperties {
    value: Option<String>,
}

impl From<ArmServer> for ServerConfiguration {
    fn from(server: ArmServer) -> Self {
        let ArmServerProperties { version, storage, backup } = server.properties;

        Self {
            name: server.name,
            location: server.location,
            version,
            sku: server.sku.and_then(|sku| sku.name),
            storage_profile: StorageProfile {
                storage_size_gb: storage.and_then(|s| s.storage_size_gb),
                backup_retention_days: backup.as_ref().and_then(|b| b.backup_retention_days),
                geo_redundant_backup: backup.and_then(|b| b.geo_redundant_backup),
            },
        }
    }
}

impl From<ArmConfiguration> for ServerParameter {
    fn from(configuration: ArmConfiguration) -> Self {
        Self {
            param: configuration.name,
            value: configuration.properties.value,
        }
    }
}

/// REST client for `Microsoft.DBforPostgreSQL/flexibleServers`
pub struct FlexibleServerClient {
    client: Client,
    credential: Arc<dyn TokenCredential>,
    endpoint: String,
    subscription_id: String,
    resource_group: String,
    server_name: String,
}

impl FlexibleServerClient {
    pub fn new(
        credential: Arc<dyn TokenCredential>,
        subscription_id: String,
        resource_group: String,
        server_name: String,
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
            credential,
            endpoint: MANAGEMENT_ENDPOINT.to_string(),
            subscription_id,
            resource_group,
            server_name,
        })
    }

    /// Point the client at a different management endpoint (sovereign clouds)
    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.trim_end_matches('/').to_string();
        self
    }

    fn server_url(&self) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.DBforPostgreSQL/flexibleServers/{}",
            self.endpoint, self.subscription_id, self.resource_group, self.server_name
        )
    }

    /// The parameter name is pushed as one path segment, so `/`, `?` and `#` stay inside it
    fn configuration_url(&self, name: &str) -> Result<Url> {
        let mut url = Url::parse(&self.server_url()).map_err(|e| {
            ServerError::management_error("configurations.get".to_string(), e.to_string())
        })?;
        url.path_segments_mut()
            .map_err(|_| ServerError::management_error(
                "configurations.get".to_string(),
                "management endpoint cannot carry a path".to_string(),
            ))?
            .push("configurations")
            .push(name);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, operation: &str, url: &str) -> Result<T> {
        let token = self.credential.get_token(MANAGEMENT_TOKEN_SCOPE).await?;
        debug!("GET {} ({})", url, operation);

        let response = self
            .client
            .get(url)
            .query(&[("api-version", API_VERSION)])
            .bearer_auth(&token.token)
            .send()
            .await
            .map_err(|e| ServerError::management_error(operation.to_string(), e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ServerError::management_error(
                operation.to_string(),
                format!("{}: {}", status, text),
            ));
        }

        response
            .json()
            .await
            .map_err(|e| ServerError::management_error(operation.to_string(), e.to_string()))
    }
}

#[async_trait]
impl ServerManagement for FlexibleServerClient {
    async fn get_server(&self) -> Result<ServerConfiguration> {
        let server: ArmServer = self.get_json("servers.get", &self.server_url()).await?;
        Ok(server.into())
    }

    async fn get_parameter(&self, name: &str) -> Result<ServerParameter> {
        let url = self.configuration_url(name)?;
        let configuration: ArmConfiguration = self.get_json("configurations.get", url.as_str()).await?;
        Ok(configuration.into())
    }
}
