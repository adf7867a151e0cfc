//! Command handlers.
//!
//! Each action is a short synchronous pipeline over the shared
//! [`Authenticator`], the audit [`Tracker`] and a per-request secret backend.
//! Handlers never fail: every outcome, including bad input, becomes a
//! [`Response`]. Audit writes are best-effort and only ever logged on failure.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::auth::Authenticator;
use crate::config::{self, Config};
use crate::protocol::{Action, Command, Response};
use crate::secrets::{BackendHandle, BackendRegistry};
use crate::tracking::{AccessRecord, Tracker};

/// Message returned by every gated action for a process without a grant.
pub const NOT_AUTHENTICATED: &str = "Process is not authenticated";

/// Shared state every connection handler works against.
pub struct HandlerContext {
    pub authenticator: Arc<Authenticator>,
    pub tracker: Arc<dyn Tracker>,
    pub backends: Arc<BackendRegistry>,
}

impl HandlerContext {
    pub fn new(
        authenticator: Arc<Authenticator>,
        tracker: Arc<dyn Tracker>,
        backends: Arc<BackendRegistry>,
    ) -> Self {
        Self {
            authenticator,
            tracker,
            backends,
        }
    }

    /// Route one decoded command to its handler.
    pub fn dispatch(&self, command: &Command) -> Response {
        let action = match command.action() {
            Ok(action) => action,
            Err(e) => {
                tracing::warn!(action = %command.action, "unknown action");
                return Response::failure(e.to_string());
            }
        };

        tracing::debug!(action = %action, process_id = ?command.process_id, "dispatching command");

        match action {
            Action::CheckAuth => self.check_auth(command),
            Action::Authenticate => self.authenticate(command),
            Action::GetSecret => self.get_secret(command),
            Action::ListSecrets => self.list_secrets(command),
            Action::InjectEnv => self.inject_env(command),
            Action::CleanEnv => self.clean_env(command),
            Action::ShowConfig => self.show_config(command),
            Action::FindConfig => self.find_config(command),
            Action::StoreSecrets => self.store_secrets(command),
        }
    }

    fn check_auth(&self, command: &Command) -> Response {
        let process_id = command.process_id.as_deref().unwrap_or_default();
        let authenticated = !process_id.is_empty() && self.authenticator.is_authenticated(process_id);

        Response::ok().with_data(BTreeMap::from([(
            "authenticated".to_string(),
            authenticated.to_string(),
        )]))
    }

    fn authenticate(&self, command: &Command) -> Response {
        let config = match load_config(command) {
            Ok(config) => config,
            Err(response) => return response,
        };
        let process_id = command.process_id.as_deref().unwrap_or_default();
        let secret_names = config.secret_names();

        self.track(AccessRecord::authentication_request(process_id, &secret_names));

        match self.authenticator.authenticate(process_id, &secret_names) {
            Ok(true) => {
                self.track(AccessRecord::authentication_success(process_id, &secret_names));
                Response::ok().with_output("Authentication successful")
            }
            Ok(false) => {
                self.track(AccessRecord::authentication_failure(
                    process_id,
                    &secret_names,
                    "authentication denied",
                ));
                Response::failure("Authentication denied")
            }
            Err(e) => {
                self.track(AccessRecord::authentication_failure(process_id, &secret_names, &e));
                Response::failure(format!("Authentication failed: {}", e))
            }
        }
    }

    fn get_secret(&self, command: &Command) -> Response {
        let config = match load_config(command) {
            Ok(config) => config,
            Err(response) => return response,
        };
        // Grant check precedes the name lookup.
        let process_id = match self.require_grant(command) {
            Ok(process_id) => process_id,
            Err(response) => return response,
        };

        let secret_name = command.secret_name.as_deref().unwrap_or_default();
        let names = vec![secret_name.to_string()];
        let env_name = match config.secrets.get(secret_name) {
            Some(env_name) => env_name.clone(),
            None => {
                let message = format!("Secret not found: {}", secret_name);
                self.track(AccessRecord::secret_access_failure(process_id, &names, &message));
                return Response::failure(message);
            }
        };

        self.track(AccessRecord::secret_access(process_id, &names));

        let backend = match self.open_backend(&config.backend_type, &config) {
            Ok(backend) => backend,
            Err(response) => {
                self.track(AccessRecord::secret_access_failure(
                    process_id,
                    &names,
                    response.error.as_deref().unwrap_or_default(),
                ));
                return response;
            }
        };

        match backend.get_secret(secret_name) {
            Ok(value) => {
                self.authenticator.record_access(process_id, &names);
                Response::ok().with_data(BTreeMap::from([
                    ("env_name".to_string(), env_name),
                    ("value".to_string(), value),
                ]))
            }
            Err(e) => {
                self.track(AccessRecord::secret_access_failure(process_id, &names, &e));
                Response::failure(format!("Failed to get secret: {}", e))
            }
        }
    }

    fn list_secrets(&self, command: &Command) -> Response {
        match load_config(command) {
            Ok(config) => Response::ok().with_data(config.secrets),
            Err(response) => response,
        }
    }

    fn inject_env(&self, command: &Command) -> Response {
        let config = match load_config(command) {
            Ok(config) => config,
            Err(response) => return response,
        };
        let process_id = match self.require_grant(command) {
            Ok(process_id) => process_id,
            Err(response) => return response,
        };

        let secret_names = config.secret_names();
        self.track(AccessRecord::secret_access(process_id, &secret_names));

        let backend = match self.open_backend(&config.backend_type, &config) {
            Ok(backend) => backend,
            Err(response) => {
                self.track(AccessRecord::secret_access_failure(
                    process_id,
                    &secret_names,
                    response.error.as_deref().unwrap_or_default(),
                ));
                return response;
            }
        };

        let mut environment = BTreeMap::new();
        let mut retrieved = Vec::with_capacity(secret_names.len());
        for (secret_name, env_name) in &config.secrets {
            match backend.get_secret(secret_name) {
                Ok(value) => {
                    environment.insert(env_name.clone(), value);
                    retrieved.push(secret_name.clone());
                }
                Err(e) => {
                    tracing::warn!(process_id, secret = %secret_name, error = %e, "failed to get secret");
                    self.track(AccessRecord::secret_access_failure(
                        process_id,
                        std::slice::from_ref(secret_name),
                        &e,
                    ));
                }
            }
        }

        self.authenticator.record_access(process_id, &retrieved);
        let output = format!(
            "Retrieved {} of {} secret(s)",
            retrieved.len(),
            secret_names.len()
        );
        Response::ok().with_data(environment).with_output(output)
    }

    fn clean_env(&self, command: &Command) -> Response {
        match load_config(command) {
            Ok(config) => Response::ok().with_data(
                config
                    .secrets
                    .into_values()
                    .map(|env_name| (env_name, String::new()))
                    .collect(),
            ),
            Err(response) => response,
        }
    }

    fn show_config(&self, command: &Command) -> Response {
        let config = match load_config(command) {
            Ok(config) => config,
            Err(response) => return response,
        };

        let mut data = BTreeMap::from([
            (
                "config_file".to_string(),
                command.config_path.clone().unwrap_or_default(),
            ),
            ("valid_depth".to_string(), config.valid_depth.to_string()),
            ("backend_type".to_string(), config.backend_type.clone()),
        ]);
        for (key, value) in &config.backend_config {
            data.insert(format!("backend_config.{}", key), value.clone());
        }
        for (secret_name, env_name) in &config.secrets {
            data.insert(format!("secret.{}", secret_name), env_name.clone());
        }

        Response::ok().with_data(data)
    }

    fn find_config(&self, command: &Command) -> Response {
        let current_dir = match command.current_dir.as_deref().filter(|d| !d.is_empty()) {
            Some(dir) => dir,
            None => return Response::failure("current_dir is required"),
        };
        let max_levels = command.max_levels.unwrap_or(0) as usize;

        match config::find_config(current_dir, max_levels) {
            Ok(path) => Response::ok().with_data(BTreeMap::from([(
                "config_path".to_string(),
                path.to_string_lossy().into_owned(),
            )])),
            Err(e) => Response::failure(format!("Failed to find config: {:#}", e)),
        }
    }

    fn store_secrets(&self, command: &Command) -> Response {
        let config = match load_config(command) {
            Ok(config) => config,
            Err(response) => return response,
        };
        let process_id = match self.require_grant(command) {
            Ok(process_id) => process_id,
            Err(response) => return response,
        };

        let secrets = command.environment.clone().unwrap_or_default();
        let names: Vec<String> = secrets.keys().cloned().collect();
        self.track(AccessRecord::secret_access(process_id, &names));

        let backend_type = command
            .backend_type
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or(&config.backend_type);

        let mut backend = match self.open_backend(backend_type, &config) {
            Ok(backend) => backend,
            Err(response) => {
                self.track(AccessRecord::secret_access_failure(
                    process_id,
                    &names,
                    response.error.as_deref().unwrap_or_default(),
                ));
                return response;
            }
        };

        match backend.store_secrets(&secrets) {
            Ok(()) => {
                tracing::info!(process_id, backend = backend_type, count = secrets.len(), "stored secrets");
                Response::ok().with_output(format!("Stored {} secret(s)", secrets.len()))
            }
            Err(e) => {
                self.track(AccessRecord::secret_access_failure(process_id, &names, &e));
                Response::failure(format!("Failed to store secrets: {}", e))
            }
        }
    }

    /// The caller's process id, if it holds a valid grant.
    fn require_grant<'a>(&self, command: &'a Command) -> Result<&'a str, Response> {
        let process_id = command.process_id.as_deref().unwrap_or_default();
        if process_id.is_empty() || !self.authenticator.is_authenticated(process_id) {
            return Err(Response::failure(NOT_AUTHENTICATED));
        }
        Ok(process_id)
    }

    fn open_backend(&self, backend_type: &str, config: &Config) -> Result<BackendHandle, Response> {
        let backend = self
            .backends
            .create(backend_type)
            .map_err(|e| Response::failure(format!("Failed to create secret backend: {}", e)))?;

        let mut handle = BackendHandle::new(backend);
        handle
            .initialize(&config.backend_config)
            .map_err(|e| Response::failure(format!("Failed to initialize secret backend: {}", e)))?;
        Ok(handle)
    }

    fn track(&self, record: AccessRecord) {
        let kind = record.kind;
        if let Err(e) = self.tracker.track_event(record) {
            tracing::warn!(error = %e, kind = ?kind, "failed to record audit event");
        }
    }
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("authenticator", &self.authenticator)
            .field("backends", &self.backends)
            .finish_non_exhaustive()
    }
}

fn load_config(command: &Command) -> Result<Config, Response> {
    let path = command
        .config_path
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| Response::failure("config_path is required"))?;

    Config::from_file(path)
        .and_then(|config| config.validate().map(|()| config))
        .map_err(|e| Response::failure(format!("Failed to load config: {:#}", e)))
}
