use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::orchestrator::SessionManager;
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::validator::{self, CredentialValidator, DenyAll, HttpValidator};

/// Everything a connection or admin request needs, shared behind an `Arc`.
pub struct State {
    pub registry: Arc<ConnectionRegistry>,
    pub sessions: Arc<SessionManager>,
    pub validator: Arc<dyn CredentialValidator>,
    pub config: Config,
    next_connection_id: AtomicU64,
}

pub type StateType = Arc<State>;

impl State {
    pub fn new(config: &Config) -> StateType {
        let validator: Arc<dyn CredentialValidator> = match &config.passkey_validation_url {
            Some(url) => Arc::new(HttpValidator::new(url.clone(), config.validation_timeout())),
            None => {
                warn!("No passkey validation URL configured, every connection will be refused");
                Arc::new(DenyAll)
            }
        };
        Self::with_validator(config, validator)
    }

    pub fn with_validator(config: &Config, validator: Arc<dyn CredentialValidator>) -> StateType {
        let registry = Arc::new(ConnectionRegistry::new(config.send_timeout()));
        Arc::new(State {
            sessions: SessionManager::new(registry.clone(), config.settings()),
            registry,
            validator,
            config: config.clone(),
            next_connection_id: AtomicU64::new(1),
        })
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn authenticate(
        &self,
        username: Option<&str>,
        passkey: Option<&str>,
    ) -> Result<String> {
        validator::authenticate(self.validator.as_ref(), username, passkey).await
    }

    pub async fn shutdown(&self) {
        info!("Shutting down");
        self.sessions.shutdown().await;
    }
}
