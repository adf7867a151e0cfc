//! OS credential store backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::{BackendError, SecretBackend};
use crate::platform::CredentialStore;

pub const BACKEND_NAME: &str = "keychain";

/// Credential store service used when `backend_config.service` is unset.
pub const DEFAULT_SERVICE: &str = "imbued";

/// Secrets stored as generic passwords under one service, keyed by name.
pub struct KeychainBackend {
    store: Arc<dyn CredentialStore>,
    service: Option<String>,
}

impl KeychainBackend {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            service: None,
        }
    }

    fn service(&self) -> Result<&str, BackendError> {
        self.service
            .as_deref()
            .ok_or(BackendError::NotInitialized(BACKEND_NAME))
    }
}

impl std::fmt::Debug for KeychainBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeychainBackend")
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

impl SecretBackend for KeychainBackend {
    fn initialize(&mut self, config: &HashMap<String, String>) -> Result<(), BackendError> {
        let service = config
            .get("service")
            .filter(|s| !s.is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_SERVICE.to_string());
        self.service = Some(service);
        Ok(())
    }

    fn get_secret(&self, key: &str) -> Result<String, BackendError> {
        let service = self.service()?;
        if key.is_empty() {
            return Err(BackendError::NotFound(key.to_string()));
        }

        self.store
            .get(service, key)
            .map_err(BackendError::Command)?
            .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }

    fn store_secrets(&mut self, secrets: &BTreeMap<String, String>) -> Result<(), BackendError> {
        let service = self.service()?.to_string();
        for (key, value) in secrets {
            self.store
                .set(&service, key, value)
                .map_err(BackendError::Command)?;
        }
        tracing::info!(service = %service, count = secrets.len(), "stored secrets in credential store");
        Ok(())
    }

    fn close(&mut self) -> Result<(), BackendError> {
        self.service = None;
        Ok(())
    }

    fn name(&self) -> &'static str {
        BACKEND_NAME
    }
}
