// imbued Configuration Module
//
// This module locates and parses the `.imbued` file that scopes secrets to a
// directory tree.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};

/// Name of the per-directory configuration file.
pub const CONFIG_FILE_NAME: &str = ".imbued";

/// Parsed contents of a `.imbued` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Secret name -> environment variable name
    pub secrets: BTreeMap<String, String>,

    /// How many directories below the config file its secrets apply to
    pub valid_depth: usize,

    /// Registry name of the secret backend (e.g. "env_file", "keychain")
    pub backend_type: String,

    /// Backend-specific settings
    pub backend_config: HashMap<String, String>,
}

/// On-disk shape, before defaults are applied.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    secrets: BTreeMap<String, String>,

    #[serde(default)]
    valid_depth: i64,

    #[serde(default)]
    backend_type: String,

    #[serde(default)]
    backend_config: HashMap<String, toml::Value>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content)?;

        let mut backend_config = HashMap::with_capacity(file.backend_config.len());
        for (key, value) in file.backend_config {
            let value = scalar_to_string(&value).with_context(|| {
                format!("backend_config.{} must be a string, number or boolean", key)
            })?;
            backend_config.insert(key, value);
        }

        Ok(Self {
            secrets: file.secrets,
            valid_depth: if file.valid_depth <= 0 {
                1
            } else {
                file.valid_depth as usize
            },
            backend_type: file.backend_type,
            backend_config,
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.backend_type.trim().is_empty() {
            anyhow::bail!("backend_type cannot be empty");
        }

        for (secret, env_name) in &self.secrets {
            if secret.is_empty() {
                anyhow::bail!("Secret names cannot be empty");
            }
            if env_name.is_empty() {
                anyhow::bail!("Environment variable name cannot be empty for secret '{}'", secret);
            }
        }

        Ok(())
    }

    /// Secret names in a stable order.
    pub fn secret_names(&self) -> Vec<String> {
        self.secrets.keys().cloned().collect()
    }
}

fn scalar_to_string(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(n) => Some(n.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Look for a `.imbued` file in `start_dir` or up to `max_levels` parents.
///
/// Returns the absolute path of the first file found, nearest first. An
/// existing `start_dir` is canonicalised, so symlinks are resolved before
/// walking up.
pub fn find_config<P: AsRef<Path>>(start_dir: P, max_levels: usize) -> Result<PathBuf> {
    let start_dir = start_dir.as_ref();
    let mut current = match std::fs::canonicalize(start_dir) {
        Ok(path) => path,
        Err(_) => absolute(start_dir)?,
    };

    for _ in 0..=max_levels {
        let candidate = current.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Ok(candidate);
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }

    anyhow::bail!(
        "no {} file found within {} levels up from {}",
        CONFIG_FILE_NAME,
        max_levels,
        start_dir.display()
    )
}

/// Directory that holds the config file.
pub fn config_dir<P: AsRef<Path>>(config_path: P) -> PathBuf {
    config_path
        .as_ref()
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Whether `current_dir` is `config_dir` or a descendant at most
/// `valid_depth` levels below it.
pub fn is_within_valid_depth<P: AsRef<Path>, Q: AsRef<Path>>(
    config_dir: P,
    current_dir: Q,
    valid_depth: usize,
) -> Result<bool> {
    let config_dir = absolute(config_dir.as_ref())?;
    let current_dir = absolute(current_dir.as_ref())?;

    // strip_prefix works per component, so "/a/bc" is not inside "/a/b".
    let relative = match current_dir.strip_prefix(&config_dir) {
        Ok(relative) => relative,
        Err(_) => return Ok(false),
    };

    let depth = relative
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count();
    Ok(depth <= valid_depth)
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    if path == "~" || path.starts_with("~/") {
        let home = dirs::home_dir().context("Failed to determine home directory")?;
        Ok(home.join(path.trim_start_matches('~').trim_start_matches('/')))
    } else {
        Ok(PathBuf::from(path))
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .with_context(|| "Failed to get current directory")?
            .join(path)
    };

    // Resolve "." and ".." lexically; the directory may not exist yet.
    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}
