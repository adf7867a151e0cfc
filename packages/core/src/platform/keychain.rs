//! macOS keychain access through the `security` command-line tool.
//!
//! # Security
//!
//! - Secret values are passed as arguments to `security` only when storing;
//!   reads capture stdout directly into memory
//! - Secret values are never logged

use anyhow::{Context, Result};
use std::process::Command;

use super::CredentialStore;
use crate::auth::PresenceCheck;

const SECURITY_BIN: &str = "security";

/// [`CredentialStore`] backed by the login keychain.
#[derive(Debug, Clone)]
pub struct SecurityCli {
    binary: String,
}

impl SecurityCli {
    pub fn new() -> Self {
        Self {
            binary: SECURITY_BIN.to_string(),
        }
    }
}

impl Default for SecurityCli {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for SecurityCli {
    fn get(&self, service: &str, account: &str) -> Result<Option<String>> {
        let output = Command::new(&self.binary)
            .args(["find-generic-password", "-s", service, "-a", account, "-w"])
            .output()
            .with_context(|| format!("Failed to execute '{} find-generic-password'", self.binary))?;

        if output.status.success() {
            let value = String::from_utf8(output.stdout)
                .context("Keychain item is not valid UTF-8")?;
            return Ok(Some(value.trim_end_matches('\n').to_string()));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("could not be found") {
            return Ok(None);
        }

        anyhow::bail!(
            "Failed to read keychain item service={} account={}: {}",
            service,
            account,
            if stderr.is_empty() { "Unknown error" } else { stderr.trim() }
        )
    }

    fn set(&self, service: &str, account: &str, secret: &str) -> Result<()> {
        // -U updates the item in place when it already exists
        let output = Command::new(&self.binary)
            .args(["add-generic-password", "-U", "-s", service, "-a", account, "-w", secret])
            .output()
            .with_context(|| format!("Failed to execute '{} add-generic-password'", self.binary))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "Failed to store keychain item service={} account={}: {}",
                service,
                account,
                if stderr.is_empty() { "Unknown error" } else { stderr.trim() }
            );
        }

        Ok(())
    }

    fn delete(&self, service: &str, account: &str) -> Result<()> {
        let output = Command::new(&self.binary)
            .args(["delete-generic-password", "-s", service, "-a", account])
            .output()
            .with_context(|| format!("Failed to execute '{} delete-generic-password'", self.binary))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() && !stderr.contains("could not be found") {
            anyhow::bail!(
                "Failed to delete keychain item service={} account={}: {}",
                service,
                account,
                if stderr.is_empty() { "Unknown error" } else { stderr.trim() }
            );
        }

        Ok(())
    }
}

/// Touch ID (or account password) confirmation via `security authorize`.
#[derive(Debug, Clone)]
pub struct TouchIdPrompt {
    binary: String,
}

impl TouchIdPrompt {
    pub fn new() -> Self {
        Self {
            binary: SECURITY_BIN.to_string(),
        }
    }
}

impl Default for TouchIdPrompt {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceCheck for TouchIdPrompt {
    fn confirm(&self, reason: &str) -> bool {
        match Command::new(&self.binary)
            .args(["authorize", "-u", "-p", reason])
            .status()
        {
            Ok(status) => status.success(),
            Err(e) => {
                tracing::warn!(error = %e, binary = %self.binary, "failed to run presence prompt");
                false
            }
        }
    }
}
