//! Wire protocol spoken over the daemon socket.
//!
//! Every connection carries exactly one exchange: the client writes a single
//! JSON [`Command`], the daemon answers with a single JSON [`Response`]
//! terminated by a newline, and the connection is closed. Writers always end
//! a message with a newline; readers stop at the end of the JSON value.
//!
//! # Example
//!
//! ```
//! use imbued::protocol::{Action, Command};
//!
//! let command = Command::new(Action::CheckAuth).with_process_id("4242");
//! let json = serde_json::to_string(&command).unwrap();
//! assert_eq!(json, r#"{"action":"check_auth","process_id":"4242"}"#);
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single encoded message.
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// The fixed set of actions the daemon understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    CheckAuth,
    Authenticate,
    GetSecret,
    ListSecrets,
    InjectEnv,
    CleanEnv,
    ShowConfig,
    FindConfig,
    StoreSecrets,
}

impl Action {
    pub const ALL: [Action; 9] = [
        Action::CheckAuth,
        Action::Authenticate,
        Action::GetSecret,
        Action::ListSecrets,
        Action::InjectEnv,
        Action::CleanEnv,
        Action::ShowConfig,
        Action::FindConfig,
        Action::StoreSecrets,
    ];

    /// Wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::CheckAuth => "check_auth",
            Action::Authenticate => "authenticate",
            Action::GetSecret => "get_secret",
            Action::ListSecrets => "list_secrets",
            Action::InjectEnv => "inject_env",
            Action::CleanEnv => "clean_env",
            Action::ShowConfig => "show_config",
            Action::FindConfig => "find_config",
            Action::StoreSecrets => "store_secrets",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a command names an action outside [`Action::ALL`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown action: {0}")]
pub struct UnknownAction(pub String);

impl FromStr for Action {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .iter()
            .copied()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| UnknownAction(s.to_string()))
    }
}

/// A single client request.
///
/// `action` is kept as a raw string so that an unknown action still decodes
/// and can be answered with a precise error. The optional fields are only
/// meaningful for the actions that read them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub action: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_levels: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_dir: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_type: Option<String>,
}

impl Command {
    pub fn new(action: Action) -> Self {
        Self {
            action: action.as_str().to_string(),
            ..Self::default()
        }
    }

    /// Parse the raw action tag.
    pub fn action(&self) -> Result<Action, UnknownAction> {
        self.action.parse()
    }

    pub fn with_config_path(mut self, path: impl Into<String>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn with_secret_name(mut self, name: impl Into<String>) -> Self {
        self.secret_name = Some(name.into());
        self
    }

    pub fn with_process_id(mut self, process_id: impl Into<String>) -> Self {
        self.process_id = Some(process_id.into());
        self
    }

    pub fn with_max_levels(mut self, max_levels: u32) -> Self {
        self.max_levels = Some(max_levels);
        self
    }

    pub fn with_current_dir(mut self, dir: impl Into<String>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn with_environment(mut self, environment: BTreeMap<String, String>) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn with_backend_type(mut self, backend_type: impl Into<String>) -> Self {
        self.backend_type = Some(backend_type.into());
        self
    }
}

/// The daemon's single reply.
///
/// A failed response always carries a non-empty `error`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.trim().is_empty() {
            message = "unknown error".to_string();
        }
        Self {
            success: false,
            error: Some(message),
            ..Self::default()
        }
    }

    pub fn with_data(mut self, data: BTreeMap<String, String>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Look up a payload entry.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.as_ref()?.get(key).map(String::as_str)
    }
}

/// Framing failures on the socket.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection closed before a message was received")]
    ConnectionClosed,

    #[error("message exceeds {0} bytes")]
    TooLarge(usize),

    #[error("{0}")]
    Decode(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read one JSON message.
///
/// The message ends where its JSON value ends, so a trailing newline is
/// accepted but not required and the peer may keep its write half open.
/// Anything after the value is left unread. A stream that reaches
/// [`MAX_MESSAGE_BYTES`] without a complete value is rejected as too large.
pub async fn read_message<T, R>(reader: &mut R) -> Result<T, ProtocolError>
where
    T: DeserializeOwned,
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();

    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            return end_of_stream(&buf);
        }

        let room = MAX_MESSAGE_BYTES - buf.len();
        let taken = chunk.len().min(room);
        buf.extend_from_slice(&chunk[..taken]);
        reader.consume(taken);

        if let Some(message) = decode_prefix(&buf)? {
            return Ok(message);
        }
        if buf.len() >= MAX_MESSAGE_BYTES {
            return Err(ProtocolError::TooLarge(MAX_MESSAGE_BYTES));
        }
    }
}

/// The first complete JSON value in `buf`, or `None` while it is still
/// incomplete.
fn decode_prefix<T: DeserializeOwned>(buf: &[u8]) -> Result<Option<T>, ProtocolError> {
    match serde_json::Deserializer::from_slice(buf).into_iter::<T>().next() {
        None => Ok(None),
        Some(Ok(message)) => Ok(Some(message)),
        Some(Err(e)) if e.is_eof() => Ok(None),
        Some(Err(e)) => Err(e.into()),
    }
}

fn end_of_stream<T: DeserializeOwned>(buf: &[u8]) -> Result<T, ProtocolError> {
    if buf.iter().all(u8::is_ascii_whitespace) {
        return Err(ProtocolError::ConnectionClosed);
    }
    if buf.len() >= MAX_MESSAGE_BYTES {
        return Err(ProtocolError::TooLarge(MAX_MESSAGE_BYTES));
    }
    // Incomplete value: surface serde's EOF error.
    Ok(serde_json::from_slice(buf)?)
}

/// Write one message followed by a newline and flush.
pub async fn write_message<T, W>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};

    #[test]
    fn test_every_action_round_trips_through_its_name() {
        for action in Action::ALL {
            assert_eq!(action.as_str().parse::<Action>(), Ok(action));
        }
    }

    #[test]
    fn test_unknown_action_message() {
        let err = "bogus".parse::<Action>().unwrap_err();
        assert_eq!(err.to_string(), "Unknown action: bogus");
    }

    #[test]
    fn test_command_decodes_with_only_action() {
        let command: Command = serde_json::from_str(r#"{"action":"list_secrets"}"#).unwrap();
        assert_eq!(command.action(), Ok(Action::ListSecrets));
        assert_eq!(command.config_path, None);
        assert_eq!(command.environment, None);
    }

    #[test]
    fn test_command_decodes_all_fields() {
        let json = r#"{
            "action": "store_secrets",
            "config_path": "/tmp/.imbued",
            "secret_name": "db",
            "process_id": "77",
            "max_levels": 3,
            "current_dir": "/tmp",
            "environment": {"A": "1"},
            "backend_type": "keychain"
        }"#;
        let command: Command = serde_json::from_str(json).unwrap();

        assert_eq!(command.max_levels, Some(3));
        assert_eq!(command.backend_type.as_deref(), Some("keychain"));
        assert_eq!(
            command.environment.unwrap().get("A").map(String::as_str),
            Some("1")
        );
    }

    #[test]
    fn test_command_without_action_is_rejected() {
        let result: Result<Command, _> = serde_json::from_str(r#"{"process_id":"1"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_response_omits_absent_fields() {
        let json = serde_json::to_string(&Response::ok()).unwrap();
        assert_eq!(json, r#"{"success":true}"#);
    }

    #[test]
    fn test_failure_always_has_message() {
        let response = Response::failure("");
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("unknown error"));
    }

    #[test]
    fn test_response_get() {
        let mut data = BTreeMap::new();
        data.insert("authenticated".to_string(), "true".to_string());
        let response = Response::ok().with_data(data);

        assert_eq!(response.get("authenticated"), Some("true"));
        assert_eq!(response.get("missing"), None);
    }

    #[tokio::test]
    async fn test_read_message_from_mock_stream() {
        let mock = tokio_test::io::Builder::new()
            .read(b"{\"action\":\"check_auth\",")
            .read(b"\"process_id\":\"9\"}\n")
            .build();
        let mut reader = BufReader::new(mock);

        let command: Command = read_message(&mut reader).await.unwrap();
        assert_eq!(command.action(), Ok(Action::CheckAuth));
        assert_eq!(command.process_id.as_deref(), Some("9"));
    }

    #[tokio::test]
    async fn test_read_message_on_closed_stream() {
        let mock = tokio_test::io::Builder::new().build();
        let mut reader = BufReader::new(mock);

        let result: Result<Command, _> = read_message(&mut reader).await;
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_read_message_rejects_oversized_line() {
        let mut payload = b"{\"action\":\"".to_vec();
        payload.resize(MAX_MESSAGE_BYTES + 10, b'a');
        let bounded = AsyncReadExt::take(payload.as_slice(), MAX_MESSAGE_BYTES as u64);
        let mut reader = BufReader::new(bounded);

        let result: Result<Command, _> = read_message(&mut reader).await;
        assert!(matches!(result, Err(ProtocolError::TooLarge(_))));
    }

    #[tokio::test]
    async fn test_read_message_rejects_oversized_unbounded_stream() {
        let mut payload = b"{\"action\":\"".to_vec();
        payload.resize(MAX_MESSAGE_BYTES * 2, b'a');
        let mut reader = BufReader::new(payload.as_slice());

        let result: Result<Command, _> = read_message(&mut reader).await;
        assert!(matches!(result, Err(ProtocolError::TooLarge(_))));
    }

    #[tokio::test]
    async fn test_read_message_without_newline_while_peer_stays_open() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"{\"action\":\"bogus\"}").await.unwrap();
        let mut reader = BufReader::new(server);

        let command: Command = tokio::time::timeout(Duration::from_secs(2), read_message(&mut reader))
            .await
            .expect("message should decode without a newline")
            .unwrap();
        assert_eq!(command.action, "bogus");
        drop(client);
    }

    #[tokio::test]
    async fn test_read_message_truncated_object() {
        let mock = tokio_test::io::Builder::new()
            .read(b"{\"action\":\"check_")
            .build();
        let mut reader = BufReader::new(mock);

        let result: Result<Command, _> = read_message(&mut reader).await;
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[tokio::test]
    async fn test_read_message_rejects_garbage_immediately() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"{not json").await.unwrap();
        let mut reader = BufReader::new(server);

        let result: Result<Command, _> =
            tokio::time::timeout(Duration::from_secs(2), read_message(&mut reader))
                .await
                .unwrap();
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
        drop(client);
    }

    #[tokio::test]
    async fn test_write_message_appends_newline() {
        let mock = tokio_test::io::Builder::new()
            .write(b"{\"success\":false,\"error\":\"nope\"}\n")
            .build();
        let mut writer = mock;

        write_message(&mut writer, &Response::failure("nope"))
            .await
            .unwrap();
    }
}
