//! 1Password integration using the `op` CLI (NOT the Connect API).
//!
//! # Security
//!
//! - **Service account token via environment**: passed to `op` as
//!   `OP_SERVICE_ACCOUNT_TOKEN`, never on the command line
//! - **NO secret logging**: item values are never logged
//!
//! # 1Password CLI Commands Used
//!
//! - `op --version` - Verify the CLI is installed
//! - `op item get <title> --vault <vault> --format json` - Read an item
//! - `op item create --vault <vault> --category password --title <title>` - Create an item

use anyhow::{Context, Result};
use serde::Deserialize;
use std::process::{Command, Output};

use super::CredentialStore;

/// Credential store service holding the 1Password credentials.
pub const CREDENTIALS_SERVICE: &str = "com.novacove.imbued.onepass";

/// Credential store account for the service account token.
pub const ACCOUNT_TOKEN_KEY: &str = "account_token";

/// Credential store account for the vault id.
pub const VAULT_ID_KEY: &str = "vault_id";

const OP_BIN: &str = "op";

/// Credentials needed for every `op` call.
#[derive(Clone)]
pub struct OnePassSession {
    pub account_token: String,
    pub vault_id: String,
}

impl std::fmt::Debug for OnePassSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnePassSession")
            .field("account_token", &"[REDACTED]")
            .field("vault_id", &self.vault_id)
            .finish()
    }
}

/// Password items in a 1Password vault.
pub trait PasswordManager: Send + Sync {
    /// Check that the tool is installed and working.
    fn verify(&self) -> Result<()>;

    /// The `password` field of the item titled `title`; `Ok(None)` when the
    /// item does not exist.
    fn get_password(&self, session: &OnePassSession, title: &str) -> Result<Option<String>>;

    /// Create a new password item.
    fn create_password(&self, session: &OnePassSession, title: &str, value: &str) -> Result<()>;
}

/// [`PasswordManager`] shelling out to the `op` binary.
#[derive(Debug, Clone)]
pub struct OpCli {
    binary: String,
}

impl OpCli {
    pub fn new() -> Self {
        Self {
            binary: OP_BIN.to_string(),
        }
    }

    fn run(&self, session: &OnePassSession, args: &[&str]) -> Result<Output> {
        Command::new(&self.binary)
            .args(args)
            .env("OP_SERVICE_ACCOUNT_TOKEN", &session.account_token)
            .output()
            .with_context(|| format!("Failed to execute '{} {}'", self.binary, args.join(" ")))
    }
}

impl Default for OpCli {
    fn default() -> Self {
        Self::new()
    }
}

impl PasswordManager for OpCli {
    fn verify(&self) -> Result<()> {
        let output = Command::new(&self.binary).arg("--version").output();

        match output {
            Ok(output) if output.status.success() => Ok(()),
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                anyhow::bail!(
                    "1Password CLI is installed but --version failed: {}",
                    if stderr.is_empty() { "Unknown error" } else { stderr.trim() }
                )
            }
            Err(e) => anyhow::bail!(
                "1Password CLI is not installed or not in PATH: {}. Install it from https://developer.1password.com/docs/cli/",
                e
            ),
        }
    }

    fn get_password(&self, session: &OnePassSession, title: &str) -> Result<Option<String>> {
        let output = self.run(
            session,
            &["item", "get", title, "--vault", &session.vault_id, "--format", "json"],
        )?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not found") || stderr.contains("isn't an item") {
                return Ok(None);
            }
            anyhow::bail!(
                "Failed to get item from 1Password: {}",
                if stderr.is_empty() { "Unknown error" } else { stderr.trim() }
            );
        }

        parse_password_field(&output.stdout)
            .with_context(|| format!("Unexpected 1Password response for item '{}'", title))
            .map(Some)
    }

    fn create_password(&self, session: &OnePassSession, title: &str, value: &str) -> Result<()> {
        let assignment = format!("password={}", value);
        let output = self.run(
            session,
            &[
                "item",
                "create",
                "--vault",
                &session.vault_id,
                "--category",
                "password",
                "--title",
                title,
                &assignment,
            ],
        )?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "Failed to create item in 1Password: {}",
                if stderr.is_empty() { "Unknown error" } else { stderr.trim() }
            );
        }

        Ok(())
    }
}

/// Read the 1Password credentials from `store`.
pub fn load_session(store: &dyn CredentialStore) -> Result<OnePassSession> {
    let account_token = store
        .get(CREDENTIALS_SERVICE, ACCOUNT_TOKEN_KEY)
        .context("Failed to read 1Password account token")?
        .ok_or_else(|| {
            anyhow::anyhow!(
                "1Password account token not found (service={}, account={})",
                CREDENTIALS_SERVICE,
                ACCOUNT_TOKEN_KEY
            )
        })?;

    let vault_id = store
        .get(CREDENTIALS_SERVICE, VAULT_ID_KEY)
        .context("Failed to read 1Password vault ID")?
        .ok_or_else(|| {
            anyhow::anyhow!(
                "1Password vault ID not found (service={}, account={})",
                CREDENTIALS_SERVICE,
                VAULT_ID_KEY
            )
        })?;

    Ok(OnePassSession {
        account_token,
        vault_id,
    })
}

/// Persist the 1Password credentials in `store`.
pub fn save_session(store: &dyn CredentialStore, session: &OnePassSession) -> Result<()> {
    store
        .set(CREDENTIALS_SERVICE, ACCOUNT_TOKEN_KEY, &session.account_token)
        .context("Failed to store 1Password account token")?;
    store
        .set(CREDENTIALS_SERVICE, VAULT_ID_KEY, &session.vault_id)
        .context("Failed to store 1Password vault ID")?;
    Ok(())
}

/// Remove the 1Password credentials from `store`.
pub fn clear_session(store: &dyn CredentialStore) -> Result<()> {
    store
        .delete(CREDENTIALS_SERVICE, ACCOUNT_TOKEN_KEY)
        .context("Failed to delete 1Password account token")?;
    store
        .delete(CREDENTIALS_SERVICE, VAULT_ID_KEY)
        .context("Failed to delete 1Password vault ID")?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ItemResponse {
    #[serde(default)]
    fields: Vec<ItemField>,
}

#[derive(Debug, Deserialize)]
struct ItemField {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    value: Option<String>,
}

/// Extract the `password` field from `op item get --format json` output.
fn parse_password_field(stdout: &[u8]) -> Result<String> {
    let item: ItemResponse =
        serde_json::from_slice(stdout).context("Failed to parse 1Password JSON output")?;

    item.fields
        .into_iter()
        .find(|field| field.label.as_deref() == Some("password"))
        .and_then(|field| field.value)
        .ok_or_else(|| anyhow::anyhow!("password field not found in 1Password item"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MemoryCredentialStore;

    #[test]
    fn test_parse_password_field() {
        let stdout = br#"{
            "id": "abc",
            "title": "db",
            "fields": [
                {"id": "username", "label": "username", "value": "admin"},
                {"id": "password", "label": "password", "value": "hunter2"}
            ]
        }"#;

        assert_eq!(parse_password_field(stdout).unwrap(), "hunter2");
    }

    #[test]
    fn test_parse_password_field_missing() {
        let stdout = br#"{"fields": [{"label": "notes", "value": "x"}]}"#;
        let err = parse_password_field(stdout).unwrap_err();
        assert!(err.to_string().contains("password field not found"));
    }

    #[test]
    fn test_parse_password_field_invalid_json() {
        assert!(parse_password_field(b"not json").is_err());
    }

    #[test]
    fn test_session_debug_redacts_token() {
        let session = OnePassSession {
            account_token: "ops_secret".to_string(),
            vault_id: "Private".to_string(),
        };
        let debug = format!("{:?}", session);
        assert!(!debug.contains("ops_secret"));
        assert!(debug.contains("Private"));
    }

    #[test]
    fn test_session_save_load_clear() {
        let store = MemoryCredentialStore::new();
        assert!(load_session(&store).is_err());

        let session = OnePassSession {
            account_token: "ops_token".to_string(),
            vault_id: "Private".to_string(),
        };
        save_session(&store, &session).unwrap();

        let loaded = load_session(&store).unwrap();
        assert_eq!(loaded.account_token, "ops_token");
        assert_eq!(loaded.vault_id, "Private");

        clear_session(&store).unwrap();
        let err = load_session(&store).unwrap_err();
        assert!(err.to_string().contains("account token not found"));
    }

    #[test]
    fn test_load_session_names_missing_vault() {
        let store = MemoryCredentialStore::new();
        store
            .set(CREDENTIALS_SERVICE, ACCOUNT_TOKEN_KEY, "ops_token")
            .unwrap();

        let err = load_session(&store).unwrap_err();
        assert!(err.to_string().contains("vault ID not found"));
    }

    #[test]
    fn test_verify_missing_binary() {
        let cli = OpCli {
            binary: "nonexistent_op_command_xyz".to_string(),
        };
        let err = cli.verify().unwrap_err();
        assert!(err.to_string().contains("not installed"));
    }
}
