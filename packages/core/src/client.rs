//! Client side of the socket protocol.

use anyhow::{Context, Result};
use std::path::Path;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::protocol::{read_message, write_message, Command, Response};

/// Send one command to the daemon and wait for its response.
pub async fn send_command(socket_path: impl AsRef<Path>, command: &Command) -> Result<Response> {
    let socket_path = socket_path.as_ref();

    if !socket_path.exists() {
        anyhow::bail!(
            "daemon socket not found at {}. Is the server running? (imbued server start)",
            socket_path.display()
        );
    }

    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("Failed to connect to daemon at {}", socket_path.display()))?;
    let (reader, mut writer) = stream.into_split();

    write_message(&mut writer, command)
        .await
        .context("Failed to send command")?;
    writer.shutdown().await.context("Failed to send command")?;

    let mut reader = BufReader::new(reader);
    read_message(&mut reader)
        .await
        .context("Failed to read response")
}

/// Like [`send_command`], turning a failed [`Response`] into an error.
pub async fn request(socket_path: impl AsRef<Path>, command: &Command) -> Result<Response> {
    let response = send_command(socket_path, command).await?;
    if !response.success {
        anyhow::bail!(
            "{}",
            response.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(response)
}
