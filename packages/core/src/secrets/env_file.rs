//! Local key-value file backend.
//!
//! The file format is chosen by extension:
//!
//! - `.json`: flat object of string values (`{"data": {...}}` is accepted too)
//! - `.yaml` / `.yml`: flat mapping of string values (or a `data:` mapping)
//! - anything else: dotenv (`KEY=value`, `#` comments, optional `export `)
//!
//! The whole file is loaded into memory by `initialize`.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{required, BackendError, SecretBackend};
use crate::config::expand_home;

pub const BACKEND_NAME: &str = "env_file";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormat {
    Dotenv,
    Json,
    Yaml,
}

impl FileFormat {
    fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::Json,
            Some("yaml") | Some("yml") => Self::Yaml,
            _ => Self::Dotenv,
        }
    }
}

#[derive(Debug)]
struct LoadedFile {
    path: PathBuf,
    format: FileFormat,
    secrets: HashMap<String, String>,
}

/// Secrets read from a dotenv, JSON or YAML file.
#[derive(Debug, Default)]
pub struct EnvFileBackend {
    loaded: Option<LoadedFile>,
}

impl EnvFileBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Path of the loaded file, once initialized.
    pub fn file_path(&self) -> Option<&Path> {
        self.loaded.as_ref().map(|loaded| loaded.path.as_path())
    }

    fn loaded(&self) -> Result<&LoadedFile, BackendError> {
        self.loaded
            .as_ref()
            .ok_or(BackendError::NotInitialized(BACKEND_NAME))
    }
}

impl SecretBackend for EnvFileBackend {
    fn initialize(&mut self, config: &HashMap<String, String>) -> Result<(), BackendError> {
        let raw_path = required(config, BACKEND_NAME, "file_path")?;
        let path = expand_home(raw_path).map_err(BackendError::Command)?;
        let format = FileFormat::from_path(&path);

        let content = fs::read_to_string(&path).map_err(|e| {
            BackendError::io(format!("failed to open env file {}", path.display()), e)
        })?;
        let secrets = parse(&path, format, &content)?;

        tracing::debug!(path = %path.display(), count = secrets.len(), "loaded env file");
        self.loaded = Some(LoadedFile {
            path,
            format,
            secrets,
        });
        Ok(())
    }

    fn get_secret(&self, key: &str) -> Result<String, BackendError> {
        self.loaded()?
            .secrets
            .get(key)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }

    fn store_secrets(&mut self, secrets: &BTreeMap<String, String>) -> Result<(), BackendError> {
        let loaded = self
            .loaded
            .as_mut()
            .ok_or(BackendError::NotInitialized(BACKEND_NAME))?;

        match loaded.format {
            FileFormat::Dotenv => append_dotenv(&loaded.path, secrets)?,
            FileFormat::Json | FileFormat::Yaml => {
                let mut merged: BTreeMap<String, String> = loaded
                    .secrets
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                merged.extend(secrets.iter().map(|(k, v)| (k.clone(), v.clone())));
                rewrite_structured(&loaded.path, loaded.format, &merged)?;
            }
        }

        loaded
            .secrets
            .extend(secrets.iter().map(|(k, v)| (k.clone(), v.clone())));
        tracing::info!(path = %loaded.path.display(), count = secrets.len(), "stored secrets in env file");
        Ok(())
    }

    fn close(&mut self) -> Result<(), BackendError> {
        self.loaded = None;
        Ok(())
    }

    fn name(&self) -> &'static str {
        BACKEND_NAME
    }
}

fn parse(path: &Path, format: FileFormat, content: &str) -> Result<HashMap<String, String>, BackendError> {
    if content.trim().is_empty() {
        return Ok(HashMap::new());
    }

    let parsed = match format {
        FileFormat::Dotenv => Ok(parse_dotenv(content)),
        FileFormat::Json => parse_json(content),
        FileFormat::Yaml => parse_yaml(content),
    };

    parsed.map_err(|message| BackendError::Parse {
        path: path.to_path_buf(),
        message,
    })
}

/// Parse dotenv text. Lines without `=` are ignored.
pub fn parse_dotenv(content: &str) -> HashMap<String, String> {
    let mut secrets = HashMap::new();

    for line in content.lines() {
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("export ").unwrap_or(line);

        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            secrets.insert(key.to_string(), unquote(value.trim()).to_string());
        }
    }

    secrets
}

/// Strip one pair of matching surrounding quotes.
fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'"' || bytes[0] == b'\'')
        && bytes[0] == bytes[bytes.len() - 1]
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

/// Parse a flat JSON object (or SOPS-style `{"data": {...}}`).
fn parse_json(content: &str) -> Result<HashMap<String, String>, String> {
    let json: serde_json::Value =
        serde_json::from_str(content).map_err(|e| format!("invalid JSON: {}", e))?;

    let data = if let Some(data) = json.get("data").and_then(|v| v.as_object()) {
        data
    } else if let Some(obj) = json.as_object() {
        obj
    } else {
        return Err("JSON must be an object with key-value pairs".to_string());
    };

    let mut secrets = HashMap::with_capacity(data.len());
    for (key, value) in data {
        match value.as_str() {
            Some(str_value) => {
                secrets.insert(key.clone(), str_value.to_string());
            }
            None => {
                return Err(format!(
                    "JSON value for key '{}' must be a string, found: {}",
                    key, value
                ))
            }
        }
    }

    Ok(secrets)
}

/// Parse a flat YAML mapping (or a `data:` mapping).
fn parse_yaml(content: &str) -> Result<HashMap<String, String>, String> {
    let yaml: serde_yaml::Value =
        serde_yaml::from_str(content).map_err(|e| format!("invalid YAML: {}", e))?;

    let data = if let Some(data) = yaml.get("data").and_then(|v| v.as_mapping()) {
        data
    } else if let Some(mapping) = yaml.as_mapping() {
        mapping
    } else {
        return Err("YAML must be a mapping with key-value pairs".to_string());
    };

    let mut secrets = HashMap::with_capacity(data.len());
    for (key, value) in data {
        let key = key
            .as_str()
            .ok_or_else(|| "YAML key must be a string".to_string())?;

        match value.as_str() {
            Some(str_value) => {
                secrets.insert(key.to_string(), str_value.to_string());
            }
            None => {
                return Err(format!(
                    "YAML value for key '{}' must be a string, found: {:?}",
                    key, value
                ))
            }
        }
    }

    Ok(secrets)
}

/// Render one `KEY=value` dotenv line, quoting when the value would not
/// survive [`parse_dotenv`] unquoted.
fn dotenv_line(key: &str, value: &str) -> Result<String, BackendError> {
    if key.is_empty()
        || key.starts_with('#')
        || key.contains('=')
        || key.chars().any(char::is_whitespace)
    {
        return Err(BackendError::InvalidValue {
            key: key.to_string(),
            reason: "keys must be non-empty, must not start with '#' and contain no '=' or whitespace"
                .to_string(),
        });
    }
    if value.contains('\n') || value.contains('\r') {
        return Err(BackendError::InvalidValue {
            key: key.to_string(),
            reason: "values cannot contain newlines".to_string(),
        });
    }

    let needs_quotes = value
        .chars()
        .any(|c| c.is_whitespace() || c == '#' || c == '"' || c == '\'');
    if needs_quotes {
        Ok(format!("{}=\"{}\"\n", key, value))
    } else {
        Ok(format!("{}={}\n", key, value))
    }
}

fn append_dotenv(path: &Path, secrets: &BTreeMap<String, String>) -> Result<(), BackendError> {
    // Validate everything before touching the file.
    let mut payload = String::new();
    for (key, value) in secrets {
        payload.push_str(&dotenv_line(key, value)?);
    }

    let context = || format!("failed to write env file {}", path.display());
    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .open(path)
        .map_err(|e| BackendError::io(context(), e))?;

    let len = file
        .metadata()
        .map_err(|e| BackendError::io(context(), e))?
        .len();
    if len > 0 {
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))
            .and_then(|_| file.read_exact(&mut last))
            .map_err(|e| BackendError::io(context(), e))?;
        if last[0] != b'\n' {
            payload.insert(0, '\n');
        }
    }

    file.write_all(payload.as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| BackendError::io(context(), e))
}

fn rewrite_structured(
    path: &Path,
    format: FileFormat,
    secrets: &BTreeMap<String, String>,
) -> Result<(), BackendError> {
    let serialize_error = |message: String| BackendError::Parse {
        path: path.to_path_buf(),
        message,
    };
    let rendered = match format {
        FileFormat::Json => serde_json::to_string_pretty(secrets)
            .map(|s| s + "\n")
            .map_err(|e| serialize_error(e.to_string()))?,
        FileFormat::Yaml => {
            serde_yaml::to_string(secrets).map_err(|e| serialize_error(e.to_string()))?
        }
        FileFormat::Dotenv => secrets
            .iter()
            .map(|(key, value)| dotenv_line(key, value))
            .collect::<Result<String, _>>()?,
    };

    fs::write(path, rendered)
        .map_err(|e| BackendError::io(format!("failed to write env file {}", path.display()), e))
}
