//! Database credential resolution

use crate::config::{AuthMode, Config};
use crate::identity::{DefaultTokenChain, TokenCredential, DATABASE_TOKEN_SCOPE};
use crate::{Result, ServerError};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

enum CredentialSource {
    Static(String),
    IdentityToken(Arc<dyn TokenCredential>),
}

/// Resolves the password used to open database connections
#[derive(Clone)]
pub struct CredentialResolver {
    source: Arc<CredentialSource>,
}

impl CredentialResolver {
    /// Resolver that always returns `secret`
    pub fn static_secret(secret: impl Into<String>) -> Self {
        Self {
            source: Arc::new(CredentialSource::Static(secret.into())),
        }
    }

    /// Resolver that asks `credential` for a database-scoped token on every call
    pub fn identity_token(credential: Arc<dyn TokenCredential>) -> Self {
        Self {
            source: Arc::new(CredentialSource::IdentityToken(credential)),
        }
    }

    /// Build the resolver selected by the configured auth mode
    pub fn from_config(config: &Config) -> Result<Self> {
        match config.auth_mode() {
            AuthMode::Password => {
                let secret = config.database.password.clone().ok_or_else(|| {
                    ServerError::configuration_error(
                        "PGPASSWORD".to_string(),
                        "A password is required when Entra ID authentication is disabled".to_string(),
                    )
                })?;
                Ok(Self::static_secret(secret))
            }
            AuthMode::EntraId => {
                let chain = DefaultTokenChain::from_config(&config.azure)?;
                Ok(Self::identity_token(Arc::new(chain)))
            }
        }
    }

    pub fn mode(&self) -> AuthMode {
        match self.source.as_ref() {
            CredentialSource::Static(_) => AuthMode::Password,
            CredentialSource::IdentityToken(_) => AuthMode::EntraId,
        }
    }

    /// Token source behind an Entra ID resolver
    pub fn token_credential(&self) -> Option<Arc<dyn TokenCredential>> {
        match self.source.as_ref() {
            CredentialSource::Static(_) => None,
            CredentialSource::IdentityToken(credential) => Some(Arc::clone(credential)),
        }
    }

    /// Return the credential to use for the next connection
    pub async fn resolve_credential(&self) -> Result<String> {
        match self.source.as_ref() {
            CredentialSource::Static(secret) => Ok(secret.clone()),
            CredentialSource::IdentityToken(credential) => {
                let token = credential.get_token(DATABASE_TOKEN_SCOPE).await?;
                debug!(
                    "Resolved database access token from {} (expires: {:?})",
                    credential.name(),
                    token.expires_on
                );
                Ok(token.token)
            }
        }
    }
}

impl fmt::Debug for CredentialResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialResolver")
            .field("mode", &self.mode())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::tests::FakeCredential;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_static_secret() {
        let resolver = CredentialResolver::static_secret("s3cret");

        assert_eq!(resolver.mode(), AuthMode::Password);
        assert!(resolver.token_credential().is_none());
        assert_eq!(tokio_test::block_on(resolver.resolve_credential()).unwrap(), "s3cret");
    }

    #[tokio::test]
    async fn test_identity_token_is_requested_on_every_call() {
        let fake = Arc::new(FakeCredential::ok());
        let resolver = CredentialResolver::identity_token(fake.clone());

        let first = resolver.resolve_credential().await.unwrap();
        let second = resolver.resolve_credential().await.unwrap();

        assert_eq!(resolver.mode(), AuthMode::EntraId);
        assert_eq!(first, "token-1-https://ossrdbms-aad.database.windows.net");
        assert_eq!(second, "token-2-https://ossrdbms-aad.database.windows.net");
        assert_eq!(fake.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_identity_failure_propagates() {
        let resolver = CredentialResolver::identity_token(Arc::new(FakeCredential::failing()));

        assert!(matches!(
            resolver.resolve_credential().await,
            Err(ServerError::Identity { .. })
        ));
    }

    #[test]
    fn test_debug_hides_secret() {
        let resolver = CredentialResolver::static_secret("hunter2");
        assert!(!format!("{:?}", resolver).contains("hunter2"));
    }
}
