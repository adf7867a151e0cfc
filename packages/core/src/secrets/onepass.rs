//! 1Password backend.
//!
//! Credentials come from the credential store (see
//! `imbued credentials set-onepass`), never from the `.imbued` file.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::{BackendError, SecretBackend};
use crate::platform::onepassword::load_session;
use crate::platform::{CredentialStore, OnePassSession, PasswordManager};

pub const BACKEND_NAME: &str = "onepass";

/// Password items in a 1Password vault, looked up by title.
pub struct OnePassBackend {
    credentials: Arc<dyn CredentialStore>,
    password_manager: Arc<dyn PasswordManager>,
    session: Option<OnePassSession>,
}

impl OnePassBackend {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        password_manager: Arc<dyn PasswordManager>,
    ) -> Self {
        Self {
            credentials,
            password_manager,
            session: None,
        }
    }

    fn session(&self) -> Result<&OnePassSession, BackendError> {
        self.session
            .as_ref()
            .ok_or(BackendError::NotInitialized(BACKEND_NAME))
    }
}

impl std::fmt::Debug for OnePassBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnePassBackend")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl SecretBackend for OnePassBackend {
    fn initialize(&mut self, _config: &HashMap<String, String>) -> Result<(), BackendError> {
        self.password_manager
            .verify()
            .map_err(|e| BackendError::Command(e.context("1Password CLI verification failed")))?;

        let session = load_session(self.credentials.as_ref()).map_err(BackendError::Command)?;
        self.session = Some(session);
        Ok(())
    }

    fn get_secret(&self, key: &str) -> Result<String, BackendError> {
        let session = self.session()?;
        self.password_manager
            .get_password(session, key)
            .map_err(BackendError::Command)?
            .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }

    /// Refuses the whole batch if any key already exists, then creates each item.
    fn store_secrets(&mut self, secrets: &BTreeMap<String, String>) -> Result<(), BackendError> {
        let session = self.session()?;

        for key in secrets.keys() {
            let existing = self
                .password_manager
                .get_password(session, key)
                .map_err(BackendError::Command)?;
            if existing.is_some() {
                return Err(BackendError::AlreadyExists(key.clone()));
            }
        }

        for (key, value) in secrets {
            self.password_manager
                .create_password(session, key, value)
                .map_err(BackendError::Command)?;
        }

        tracing::info!(vault = %session.vault_id, count = secrets.len(), "stored secrets in 1Password");
        Ok(())
    }

    fn close(&mut self) -> Result<(), BackendError> {
        self.session = None;
        Ok(())
    }

    fn name(&self) -> &'static str {
        BACKEND_NAME
    }
}
