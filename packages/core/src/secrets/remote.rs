//! Remote secret managers (HashiCorp Vault, AWS Secrets Manager, GCP Secret
//! Manager).
//!
//! These variants validate their configuration but do not talk to the
//! provider: `get_secret` returns `<prefix>-secret-<key>`.

use std::collections::HashMap;

use super::{required, BackendError, SecretBackend};

/// Which remote provider a [`RemoteBackend`] stands in for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    Vault,
    AwsSecretManager,
    GcpSecretManager,
}

impl RemoteKind {
    pub const ALL: [RemoteKind; 3] = [
        RemoteKind::Vault,
        RemoteKind::AwsSecretManager,
        RemoteKind::GcpSecretManager,
    ];

    /// Registry name.
    pub fn name(self) -> &'static str {
        match self {
            RemoteKind::Vault => "vault",
            RemoteKind::AwsSecretManager => "aws_secret_manager",
            RemoteKind::GcpSecretManager => "gcp_secret_manager",
        }
    }

    fn required_keys(self) -> &'static [&'static str] {
        match self {
            RemoteKind::Vault => &["address", "token"],
            RemoteKind::AwsSecretManager => &["region", "access_key", "secret_key"],
            RemoteKind::GcpSecretManager => &["project_id", "credentials"],
        }
    }

    fn placeholder_prefix(self) -> &'static str {
        match self {
            RemoteKind::Vault => "vault",
            RemoteKind::AwsSecretManager => "aws",
            RemoteKind::GcpSecretManager => "gcp",
        }
    }
}

/// Placeholder backend for a remote provider.
#[derive(Debug)]
pub struct RemoteBackend {
    kind: RemoteKind,
    settings: Option<HashMap<String, String>>,
}

impl RemoteBackend {
    pub fn new(kind: RemoteKind) -> Self {
        Self {
            kind,
            settings: None,
        }
    }
}

impl SecretBackend for RemoteBackend {
    fn initialize(&mut self, config: &HashMap<String, String>) -> Result<(), BackendError> {
        let mut settings = HashMap::new();
        for &key in self.kind.required_keys() {
            let value = required(config, self.kind.name(), key)?;
            settings.insert(key.to_string(), value.to_string());
        }
        // Temporary AWS credentials carry an optional session token.
        if self.kind == RemoteKind::AwsSecretManager {
            if let Some(token) = config.get("session_token") {
                settings.insert("session_token".to_string(), token.clone());
            }
        }

        self.settings = Some(settings);
        Ok(())
    }

    fn get_secret(&self, key: &str) -> Result<String, BackendError> {
        if self.settings.is_none() {
            return Err(BackendError::NotInitialized(self.kind.name()));
        }
        Ok(format!("{}-secret-{}", self.kind.placeholder_prefix(), key))
    }

    fn close(&mut self) -> Result<(), BackendError> {
        self.settings = None;
        Ok(())
    }

    fn name(&self) -> &'static str {
        self.kind.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn config(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_vault_placeholder() {
        let mut backend = RemoteBackend::new(RemoteKind::Vault);
        backend
            .initialize(&config(&[("address", "https://vault:8200"), ("token", "t")]))
            .unwrap();

        assert_eq!(backend.get_secret("db").unwrap(), "vault-secret-db");
    }

    #[test]
    fn test_aws_and_gcp_placeholders() {
        let mut aws = RemoteBackend::new(RemoteKind::AwsSecretManager);
        aws.initialize(&config(&[
            ("region", "eu-west-1"),
            ("access_key", "a"),
            ("secret_key", "s"),
        ]))
        .unwrap();
        let mut gcp = RemoteBackend::new(RemoteKind::GcpSecretManager);
        gcp.initialize(&config(&[("project_id", "p"), ("credentials", "c.json")]))
            .unwrap();

        assert_eq!(aws.get_secret("k").unwrap(), "aws-secret-k");
        assert_eq!(gcp.get_secret("k").unwrap(), "gcp-secret-k");
    }

    #[test]
    fn test_missing_key_is_named() {
        let mut backend = RemoteBackend::new(RemoteKind::AwsSecretManager);
        let err = backend
            .initialize(&config(&[("region", "eu-west-1"), ("access_key", "a")]))
            .unwrap_err();

        assert_eq!(err.to_string(), "secret_key is required for aws_secret_manager backend");
    }

    #[test]
    fn test_get_before_initialize_and_after_close() {
        let mut backend = RemoteBackend::new(RemoteKind::Vault);
        assert!(matches!(
            backend.get_secret("k"),
            Err(BackendError::NotInitialized("vault"))
        ));

        backend
            .initialize(&config(&[("address", "a"), ("token", "t")]))
            .unwrap();
        backend.close().unwrap();
        backend.close().unwrap();
        assert!(backend.get_secret("k").is_err());
    }

    #[test]
    fn test_store_not_supported() {
        let mut backend = RemoteBackend::new(RemoteKind::GcpSecretManager);
        let err = backend.store_secrets(&BTreeMap::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "gcp_secret_manager backend does not support storing secrets"
        );
    }
}
