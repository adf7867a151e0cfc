//! Unix socket dispatcher.
//!
//! One task per accepted connection; each connection carries exactly one
//! command and one response. Handlers run on the blocking pool because they
//! may wait on a presence prompt or an external CLI.

use anyhow::{Context, Result};
use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::handlers::HandlerContext;
use crate::protocol::{read_message, write_message, Command, ProtocolError, Response, MAX_MESSAGE_BYTES};

/// Listening socket that removes its file when dropped.
#[derive(Debug)]
pub struct SocketListener {
    inner: UnixListener,
    path: PathBuf,
}

impl SocketListener {
    /// Bind at `path`, replacing a stale socket file.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to remove stale socket: {}", path.display()))?;
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create socket directory: {}", parent.display())
                })?;
            }
        }

        let inner = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind socket: {}", path.display()))?;

        // Owner-only: the socket hands out secrets.
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to restrict socket permissions: {}", path.display()))?;

        Ok(Self {
            inner,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn accept(&self) -> std::io::Result<UnixStream> {
        let (stream, _addr) = self.inner.accept().await?;
        Ok(stream)
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// The daemon's accept loop.
#[derive(Debug)]
pub struct Server {
    listener: SocketListener,
    context: Arc<HandlerContext>,
}

impl Server {
    pub fn bind(path: impl AsRef<Path>, context: Arc<HandlerContext>) -> Result<Self> {
        Ok(Self {
            listener: SocketListener::bind(path)?,
            context,
        })
    }

    pub fn socket_path(&self) -> &Path {
        self.listener.path()
    }

    /// Serve until the process is terminated.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` completes. In-flight connections keep running
    /// on their own tasks; the socket file is removed on return.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tracing::info!(socket = %self.listener.path().display(), "daemon listening");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(stream) => {
                        let context = Arc::clone(&self.context);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, context).await {
                                tracing::warn!(error = %e, "connection error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to accept connection");
                    }
                }
            }
        }
    }
}

/// Serve exactly one command on `stream`, then shut it down.
pub async fn handle_connection<S>(stream: S, context: Arc<HandlerContext>) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader.take(MAX_MESSAGE_BYTES as u64));

    let response = match read_message::<Command, _>(&mut reader).await {
        Ok(command) => dispatch(command, context).await,
        Err(ProtocolError::ConnectionClosed) => {
            tracing::debug!("client closed the connection without a command");
            return Ok(());
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to decode command");
            Response::failure(format!("Failed to decode command: {}", e))
        }
    };

    write_message(&mut writer, &response).await?;
    writer.shutdown().await?;
    Ok(())
}

async fn dispatch(command: Command, context: Arc<HandlerContext>) -> Response {
    let action = command.action.clone();
    match tokio::task::spawn_blocking(move || context.dispatch(&command)).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(action = %action, error = %e, "handler task failed");
            Response::failure(format!("Internal error while handling {}", action))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Authenticator;
    use crate::protocol::Action;
    use crate::secrets::BackendRegistry;
    use crate::tracking::FileTracker;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncBufReadExt;

    fn context(dir: &TempDir) -> Arc<HandlerContext> {
        Arc::new(HandlerContext::new(
            Arc::new(Authenticator::new(
                Duration::from_secs(60),
                Arc::new(|_: &str| true),
            )),
            Arc::new(FileTracker::open(dir.path().join("audit.log")).unwrap()),
            Arc::new(BackendRegistry::new()),
        ))
    }

    async fn exchange(request: &[u8], context: Arc<HandlerContext>) -> Response {
        let (client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(handle_connection(server, context));

        let (read_half, mut write_half) = tokio::io::split(client);
        write_half.write_all(request).await.unwrap();

        let mut line = String::new();
        BufReader::new(read_half).read_line(&mut line).await.unwrap();
        task.await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_action_over_the_wire() {
        let dir = TempDir::new().unwrap();
        let response = exchange(b"{\"action\":\"bogus\"}\n", context(&dir)).await;

        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("Unknown action: bogus"));
    }

    #[tokio::test]
    async fn test_command_without_newline_gets_answered() {
        let dir = TempDir::new().unwrap();
        let (client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(handle_connection(server, context(&dir)));

        // Write half stays open: the reply must not wait for EOF or '\n'.
        let (read_half, mut write_half) = tokio::io::split(client);
        write_half.write_all(b"{\"action\":\"bogus\"}").await.unwrap();

        let mut line = String::new();
        tokio::time::timeout(
            Duration::from_secs(2),
            BufReader::new(read_half).read_line(&mut line),
        )
        .await
        .expect("daemon should answer without a trailing newline")
        .unwrap();
        task.await.unwrap().unwrap();

        let response: Response = serde_json::from_str(&line).unwrap();
        assert_eq!(response.error.as_deref(), Some("Unknown action: bogus"));
        drop(write_half);
    }

    #[tokio::test]
    async fn test_malformed_command() {
        let dir = TempDir::new().unwrap();
        let response = exchange(b"{not json}\n", context(&dir)).await;

        assert!(!response.success);
        assert!(response
            .error
            .unwrap()
            .starts_with("Failed to decode command:"));
    }

    #[tokio::test]
    async fn test_check_auth_over_the_wire() {
        let dir = TempDir::new().unwrap();
        let request = serde_json::to_string(&Command::new(Action::CheckAuth).with_process_id("1")).unwrap();
        let response = exchange(format!("{}\n", request).as_bytes(), context(&dir)).await;

        assert!(response.success);
        assert_eq!(response.get("authenticated"), Some("false"));
    }

    #[tokio::test]
    async fn test_listener_replaces_stale_socket_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run").join("imbued.sock");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "stale").unwrap();

        {
            let listener = SocketListener::bind(&path).unwrap();
            assert_eq!(listener.path(), path.as_path());
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_server_stops_on_shutdown_signal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("imbued.sock");
        let server = Server::bind(&path, context(&dir)).unwrap();
        assert_eq!(server.socket_path(), path.as_path());

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(async {
            let _ = rx.await;
        }));

        let stream = UnixStream::connect(&path).await.unwrap();
        drop(stream);

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert!(!path.exists());
    }
}
