//! Authentication and telemetry providers for player sessions

use crate::config::AuthSection;
use async_trait::async_trait;
use log::{debug, info};
use shared::{PlayerContext, ProfileId, SessionId};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid credentials for profile {0}")]
    InvalidCredentials(ProfileId),
    #[error("authentication is shut down")]
    Disposed,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate(&self, context: &PlayerContext, token: &str) -> Result<(), AuthError>;
}

pub struct AllowAllAuthProvider;

#[async_trait]
impl AuthProvider for AllowAllAuthProvider {
    async fn authenticate(&self, _context: &PlayerContext, _token: &str) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Every player presents the same pre-shared token
pub struct SharedSecretAuthProvider {
    secret: String,
}

impl SharedSecretAuthProvider {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }
}

#[async_trait]
impl AuthProvider for SharedSecretAuthProvider {
    async fn authenticate(&self, context: &PlayerContext, token: &str) -> Result<(), AuthError> {
        if token == self.secret {
            Ok(())
        } else {
            Err(AuthError::InvalidCredentials(context.profile_id))
        }
    }
}

/// Owns the configured auth provider until the front-end shuts down
pub struct AuthProviderManager {
    provider: RwLock<Option<Arc<dyn AuthProvider>>>,
}

impl AuthProviderManager {
    pub fn new(provider: Arc<dyn AuthProvider>) -> Self {
        Self {
            provider: RwLock::new(Some(provider)),
        }
    }

    pub fn from_config(auth: &AuthSection) -> Self {
        if auth.shared_secret.is_empty() {
            info!("No shared secret configured, admitting every player");
            Self::new(Arc::new(AllowAllAuthProvider))
        } else {
            Self::new(Arc::new(SharedSecretAuthProvider::new(auth.shared_secret.clone())))
        }
    }

    pub fn provider(&self) -> Option<Arc<dyn AuthProvider>> {
        self.provider.read().ok()?.clone()
    }

    /// After disposal every authentication attempt fails
    pub fn dispose(&self) {
        if let Ok(mut provider) = self.provider.write() {
            if provider.take().is_some() {
                debug!("Auth provider disposed");
            }
        }
    }

    pub async fn authenticate(&self, context: &PlayerContext, token: &str) -> Result<(), AuthError> {
        match self.provider() {
            Some(provider) => provider.authenticate(context, token).await,
            None => Err(AuthError::Disposed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSample {
    pub active_connections: usize,
    pub accepted_total: u64,
    pub rejected_total: u64,
    pub throttled_total: u64,
}

pub trait TelemetryProvider: Send + Sync {
    fn player_joined(&self, session_id: SessionId, profile_id: ProfileId);
    fn player_left(&self, session_id: SessionId, profile_id: ProfileId);
    fn report(&self, sample: &MetricsSample);
}

pub struct LogTelemetryProvider {
    scope: String,
}

impl LogTelemetryProvider {
    pub fn new(scope: impl Into<String>) -> Self {
        Self { scope: scope.into() }
    }
}

impl TelemetryProvider for LogTelemetryProvider {
    fn player_joined(&self, session_id: SessionId, profile_id: ProfileId) {
        debug!("[{}] player {} joined session {}", self.scope, profile_id, session_id);
    }

    fn player_left(&self, session_id: SessionId, profile_id: ProfileId) {
        debug!("[{}] player {} left session {}", self.scope, profile_id, session_id);
    }

    fn report(&self, sample: &MetricsSample) {
        info!(
            "[{}] connections: {} active, {} accepted, {} rejected, {} throttled",
            self.scope,
            sample.active_connections,
            sample.accepted_total,
            sample.rejected_total,
            sample.throttled_total
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(profile_id: ProfileId) -> PlayerContext {
        PlayerContext {
            profile_id,
            display_name: "p".to_string(),
        }
    }

    #[tokio::test]
    async fn test_shared_secret_checks_token() {
        let manager = AuthProviderManager::from_config(&AuthSection {
            shared_secret: "hunter2".to_string(),
        });

        assert!(manager.authenticate(&context(1), "hunter2").await.is_ok());
        assert_eq!(
            manager.authenticate(&context(1), "guess").await,
            Err(AuthError::InvalidCredentials(1))
        );
    }

    #[tokio::test]
    async fn test_disposed_manager_rejects_everyone() {
        let manager = AuthProviderManager::from_config(&AuthSection::default());
        assert!(manager.authenticate(&context(2), "").await.is_ok());

        manager.dispose();
        manager.dispose();
        assert!(manager.provider().is_none());
        assert_eq!(
            manager.authenticate(&context(2), "").await,
            Err(AuthError::Disposed)
        );
    }
}
