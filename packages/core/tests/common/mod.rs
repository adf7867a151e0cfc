//! Common testing utilities for imbued integration tests.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use imbued::auth::Authenticator;
use imbued::handlers::HandlerContext;
use imbued::protocol::{Command, Response};
use imbued::secrets::BackendRegistry;
use imbued::server::Server;
use imbued::tracking::FileTracker;

/// Test context that manages temporary files and directories.
pub struct TestContext {
    /// Path to temporary directory
    pub temp_path: PathBuf,
    /// The temporary directory (kept to prevent early deletion)
    _temp_dir: TempDir,
}

impl TestContext {
    /// Create a new test context with a temporary directory.
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = TempDir::new()?;
        let temp_path = temp_dir.path().to_path_buf();

        Ok(Self {
            temp_path,
            _temp_dir: temp_dir,
        })
    }

    /// Create a test file with content, creating parent directories.
    pub fn create_file(&self, name: &str, content: &str) -> anyhow::Result<PathBuf> {
        let file_path = self.temp_path.join(name);
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&file_path)?;
        file.write_all(content.as_bytes())?;
        Ok(file_path)
    }

    /// Create a `.imbued` file in `dir` mapping secret names to env names.
    #[allow(dead_code)]
    pub fn create_config(
        &self,
        dir: &str,
        backend_type: &str,
        backend_config: &[(&str, &str)],
        secrets: &[(&str, &str)],
    ) -> anyhow::Result<PathBuf> {
        let mut content = format!("backend_type = \"{}\"\n", backend_type);
        content.push_str("\n[secrets]\n");
        for (name, env_name) in secrets {
            content.push_str(&format!("\"{}\" = \"{}\"\n", name, env_name));
        }
        content.push_str("\n[backend_config]\n");
        for (key, value) in backend_config {
            content.push_str(&format!("{} = \"{}\"\n", key, value));
        }

        let name = if dir.is_empty() {
            ".imbued".to_string()
        } else {
            format!("{}/.imbued", dir)
        };
        self.create_file(&name, &content)
    }

    /// Get the path to a file in the temp directory.
    #[allow(dead_code)]
    pub fn path(&self, name: &str) -> PathBuf {
        self.temp_path.join(name)
    }
}

/// A daemon serving on a socket inside a [`TestContext`].
#[allow(dead_code)]
pub struct TestDaemon {
    pub socket: PathBuf,
    pub audit_log: PathBuf,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<anyhow::Result<()>>>,
}

#[allow(dead_code)]
impl TestDaemon {
    /// Start a daemon whose presence check always answers `approve`.
    pub fn start(ctx: &TestContext, backends: BackendRegistry, approve: bool) -> anyhow::Result<Self> {
        let socket = ctx.path("run/imbued.sock");
        let audit_log = ctx.path("logs/imbued.log");

        let context = Arc::new(HandlerContext::new(
            Arc::new(Authenticator::new(
                Duration::from_secs(60),
                Arc::new(move |_: &str| approve),
            )),
            Arc::new(FileTracker::open(&audit_log)?),
            Arc::new(backends),
        ));

        let server = Server::bind(&socket, context)?;
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(async {
            let _ = rx.await;
        }));

        Ok(Self {
            socket,
            audit_log,
            shutdown: Some(tx),
            handle: Some(handle),
        })
    }

    /// Send one command and return the raw response.
    pub async fn send(&self, command: &Command) -> Response {
        imbued::client::send_command(&self.socket, command)
            .await
            .expect("daemon should answer")
    }

    /// Stop accepting connections and wait for the socket to be removed.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.await.unwrap().unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_context_create_file() {
        let ctx = TestContext::new().unwrap();
        let file_path = ctx.create_file("nested/test.txt", "Hello, World!").unwrap();

        assert!(file_path.exists());
        assert_eq!(fs::read_to_string(&file_path).unwrap(), "Hello, World!");
    }

    #[test]
    fn test_create_config_is_loadable() {
        let ctx = TestContext::new().unwrap();
        let path = ctx
            .create_config(
                "project",
                "env_file",
                &[("file_path", "/tmp/secrets.env")],
                &[("api_key", "API_KEY")],
            )
            .unwrap();

        let config = imbued::config::Config::from_file(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.secrets["api_key"], "API_KEY");
        assert_eq!(config.backend_config["file_path"], "/tmp/secrets.env");
    }
}
