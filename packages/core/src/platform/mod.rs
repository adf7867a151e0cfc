//! Host integrations the daemon core talks to through narrow traits.
//!
//! - [`CredentialStore`]: OS credential storage (macOS keychain via the
//!   `security` tool, or an in-memory store elsewhere)
//! - [`PresenceCheck`](crate::auth::PresenceCheck) implementations: Touch ID
//!   and a terminal confirmation
//! - [`onepassword::PasswordManager`]: the 1Password CLI
//!
//! Nothing outside this module knows a binary name or a command line.

pub mod keychain;
pub mod onepassword;

use anyhow::Result;
use dialoguer::{theme::ColorfulTheme, Confirm};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::auth::PresenceCheck;

pub use keychain::{SecurityCli, TouchIdPrompt};
pub use onepassword::{OnePassSession, OpCli, PasswordManager};

/// Generic password storage keyed by `(service, account)`.
pub trait CredentialStore: Send + Sync {
    /// Fetch a secret; `Ok(None)` when no such item exists.
    fn get(&self, service: &str, account: &str) -> Result<Option<String>>;

    /// Create or replace a secret.
    fn set(&self, service: &str, account: &str, secret: &str) -> Result<()>;

    /// Remove a secret. Removing a missing item is not an error.
    fn delete(&self, service: &str, account: &str) -> Result<()>;
}

/// Process-local [`CredentialStore`]; contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    items: Mutex<HashMap<(String, String), String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), String>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, service: &str, account: &str) -> Result<Option<String>> {
        Ok(self
            .items()
            .get(&(service.to_string(), account.to_string()))
            .cloned())
    }

    fn set(&self, service: &str, account: &str, secret: &str) -> Result<()> {
        self.items()
            .insert((service.to_string(), account.to_string()), secret.to_string());
        Ok(())
    }

    fn delete(&self, service: &str, account: &str) -> Result<()> {
        self.items()
            .remove(&(service.to_string(), account.to_string()));
        Ok(())
    }
}

/// Presence check answered on the daemon's own terminal.
///
/// Meant for a daemon running in the foreground on a host without Touch ID.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

impl PresenceCheck for TerminalPrompt {
    fn confirm(&self, reason: &str) -> bool {
        let theme = ColorfulTheme::default();
        match Confirm::with_theme(&theme)
            .with_prompt(format!("🔐 {}. Allow?", reason))
            .default(false)
            .interact()
        {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(error = %e, "terminal presence prompt failed");
                false
            }
        }
    }
}

/// The host integrations handed to secret backends.
#[derive(Clone)]
pub struct Platform {
    pub credentials: Arc<dyn CredentialStore>,
    pub password_manager: Arc<dyn PasswordManager>,
}

impl Platform {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        password_manager: Arc<dyn PasswordManager>,
    ) -> Self {
        Self {
            credentials,
            password_manager,
        }
    }

    /// Integrations for the current host.
    pub fn native() -> Self {
        Self::new(native_credential_store(), Arc::new(OpCli::new()))
    }
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}

/// The OS credential store, or an in-memory stand-in where none is supported.
pub fn native_credential_store() -> Arc<dyn CredentialStore> {
    if cfg!(target_os = "macos") {
        Arc::new(SecurityCli::new())
    } else {
        tracing::warn!("no OS credential store on this platform, using an in-memory store");
        Arc::new(MemoryCredentialStore::new())
    }
}
