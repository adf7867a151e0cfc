//! Pluggable secret backends.
//!
//! A backend is selected by the `backend_type` string of a `.imbued` file and
//! built through [`BackendRegistry`]. Handlers create a fresh instance per
//! request; instances are never shared between connections.
//!
//! Lifecycle: `initialize` must succeed before `get_secret` or
//! `store_secrets`; `close` is idempotent and safe on an uninitialized
//! backend. [`BackendHandle`] closes its backend on drop.

pub mod env_file;
pub mod keychain;
pub mod onepass;
pub mod remote;

use std::collections::{BTreeMap, HashMap};
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::platform::Platform;

pub use env_file::EnvFileBackend;
pub use keychain::KeychainBackend;
pub use onepass::OnePassBackend;
pub use remote::RemoteBackend;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{key} is required for {backend} backend")]
    MissingConfig { backend: &'static str, key: &'static str },

    #[error("{0} backend not initialized")]
    NotInitialized(&'static str),

    #[error("secret not found: {0}")]
    NotFound(String),

    #[error("{0} backend does not support storing secrets")]
    NotSupported(&'static str),

    #[error("unsupported backend type: {0}")]
    UnsupportedBackend(String),

    #[error("secret with key {0} already exists")]
    AlreadyExists(String),

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("{0:#}")]
    Command(anyhow::Error),
}

impl BackendError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// A source of secret values.
pub trait SecretBackend: Send {
    /// Validate `config` and prepare the backend for use.
    fn initialize(&mut self, config: &HashMap<String, String>) -> Result<(), BackendError>;

    /// Value stored under `key`.
    fn get_secret(&self, key: &str) -> Result<String, BackendError>;

    /// Persist every pair in `secrets`.
    fn store_secrets(&mut self, secrets: &BTreeMap<String, String>) -> Result<(), BackendError> {
        let _ = secrets;
        Err(BackendError::NotSupported(self.name()))
    }

    /// Release resources. Idempotent.
    fn close(&mut self) -> Result<(), BackendError>;

    /// Registry name of this variant.
    fn name(&self) -> &'static str;
}

type Constructor = Arc<dyn Fn() -> Box<dyn SecretBackend> + Send + Sync>;

/// Maps `backend_type` strings to backend constructors.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    constructors: BTreeMap<String, Constructor>,
}

impl BackendRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in variant.
    pub fn with_defaults(platform: &Platform) -> Self {
        let mut registry = Self::new();

        registry.register(env_file::BACKEND_NAME, || Box::new(EnvFileBackend::new()));

        let credentials = Arc::clone(&platform.credentials);
        registry.register(keychain::BACKEND_NAME, move || {
            Box::new(KeychainBackend::new(Arc::clone(&credentials)))
        });

        let credentials = Arc::clone(&platform.credentials);
        let password_manager = Arc::clone(&platform.password_manager);
        registry.register(onepass::BACKEND_NAME, move || {
            Box::new(OnePassBackend::new(
                Arc::clone(&credentials),
                Arc::clone(&password_manager),
            ))
        });

        for kind in remote::RemoteKind::ALL {
            registry.register(kind.name(), move || Box::new(RemoteBackend::new(kind)));
        }

        registry
    }

    /// Add or replace a variant.
    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn() -> Box<dyn SecretBackend> + Send + Sync + 'static,
    {
        self.constructors.insert(name.to_string(), Arc::new(constructor));
    }

    /// A new, uninitialized backend of type `name`.
    pub fn create(&self, name: &str) -> Result<Box<dyn SecretBackend>, BackendError> {
        self.constructors
            .get(name)
            .map(|constructor| constructor())
            .ok_or_else(|| BackendError::UnsupportedBackend(name.to_string()))
    }

    /// Create and initialize a backend, closing it again if initialization fails.
    pub fn open(
        &self,
        name: &str,
        config: &HashMap<String, String>,
    ) -> Result<BackendHandle, BackendError> {
        let mut handle = BackendHandle::new(self.create(name)?);
        handle.initialize(config)?;
        Ok(handle)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

/// Owns a backend and closes it when dropped.
pub struct BackendHandle {
    backend: Box<dyn SecretBackend>,
}

impl BackendHandle {
    pub fn new(backend: Box<dyn SecretBackend>) -> Self {
        Self { backend }
    }
}

impl Deref for BackendHandle {
    type Target = dyn SecretBackend;

    fn deref(&self) -> &Self::Target {
        self.backend.as_ref()
    }
}

impl DerefMut for BackendHandle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.backend.as_mut()
    }
}

impl Drop for BackendHandle {
    fn drop(&mut self) {
        if let Err(e) = self.backend.close() {
            tracing::warn!(backend = self.backend.name(), error = %e, "failed to close secret backend");
        }
    }
}

/// Fetch a required key from a backend config map.
pub(crate) fn required<'a>(
    config: &'a HashMap<String, String>,
    backend: &'static str,
    key: &'static str,
) -> Result<&'a str, BackendError> {
    config
        .get(key)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
        .ok_or(BackendError::MissingConfig { backend, key })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{MemoryCredentialStore, OnePassSession, PasswordManager};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoPasswordManager;

    impl PasswordManager for NoPasswordManager {
        fn verify(&self) -> anyhow::Result<()> {
            anyhow::bail!("not installed")
        }

        fn get_password(&self, _: &OnePassSession, _: &str) -> anyhow::Result<Option<String>> {
            Ok(None)
        }

        fn create_password(&self, _: &OnePassSession, _: &str, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn platform() -> Platform {
        Platform::new(
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(NoPasswordManager),
        )
    }

    struct CountingBackend {
        closes: Arc<AtomicUsize>,
    }

    impl SecretBackend for CountingBackend {
        fn initialize(&mut self, config: &HashMap<String, String>) -> Result<(), BackendError> {
            required(config, "counting", "token").map(|_| ())
        }

        fn get_secret(&self, key: &str) -> Result<String, BackendError> {
            Ok(format!("counted-{}", key))
        }

        fn close(&mut self) -> Result<(), BackendError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    #[test]
    fn test_defaults_register_every_variant() {
        let registry = BackendRegistry::with_defaults(&platform());

        assert_eq!(
            registry.names(),
            vec![
                "aws_secret_manager",
                "env_file",
                "gcp_secret_manager",
                "keychain",
                "onepass",
                "vault"
            ]
        );
    }

    #[test]
    fn test_unknown_backend_type() {
        let registry = BackendRegistry::with_defaults(&platform());
        let err = registry.create("carrier_pigeon").err().unwrap();

        assert_eq!(err.to_string(), "unsupported backend type: carrier_pigeon");
    }

    #[test]
    fn test_register_overrides_existing_variant() {
        let mut registry = BackendRegistry::with_defaults(&platform());
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        registry.register("vault", move || {
            Box::new(CountingBackend {
                closes: Arc::clone(&counter),
            })
        });

        let backend = registry.create("vault").unwrap();
        assert_eq!(backend.name(), "counting");
    }

    #[test]
    fn test_open_closes_on_drop() {
        let mut registry = BackendRegistry::new();
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        registry.register("counting", move || {
            Box::new(CountingBackend {
                closes: Arc::clone(&counter),
            })
        });

        let config = HashMap::from([("token".to_string(), "t".to_string())]);
        {
            let handle = registry.open("counting", &config).unwrap();
            assert_eq!(handle.get_secret("a").unwrap(), "counted-a");
        }
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_open_failure_still_closes() {
        let mut registry = BackendRegistry::new();
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        registry.register("counting", move || {
            Box::new(CountingBackend {
                closes: Arc::clone(&counter),
            })
        });

        let err = registry.open("counting", &HashMap::new()).err().unwrap();
        assert_eq!(err.to_string(), "token is required for counting backend");
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_store_not_supported_by_default() {
        let mut backend = CountingBackend {
            closes: Arc::new(AtomicUsize::new(0)),
        };
        let err = backend.store_secrets(&BTreeMap::new()).unwrap_err();
        assert!(matches!(err, BackendError::NotSupported("counting")));
    }
}
