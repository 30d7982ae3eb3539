//! Readiness channel between the tunnel process and the supervisor
//!
//! The supervisor binds a Unix domain socket per connect attempt and hands the
//! tunnel program a hook command (`ovpnctl notify-ready ...`). The tunnel
//! program runs the hook once its routes are up; the hook connects to the
//! socket and writes a single newline-delimited JSON message. Messages for a
//! different attempt are ignored.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ReadinessError;

/// How long a connected hook gets to deliver its message
const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Message written by the hook
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReadinessMessage {
    /// The tunnel is usable
    Ready { attempt: String },
}

/// Listening side of the readiness signal for one attempt
pub struct ReadinessChannel {
    listener: UnixListener,
    socket_path: PathBuf,
    attempt: String,
}

impl ReadinessChannel {
    /// Fresh random attempt id
    pub fn new_attempt_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Bind the socket for `attempt`
    pub async fn bind(path: &Path, attempt: impl Into<String>) -> Result<Self, ReadinessError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Remove stale socket if it exists
        if path.exists() {
            match UnixStream::connect(path).await {
                Ok(_) => {
                    return Err(ReadinessError::Bind {
                        path: path.to_path_buf(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::AddrInUse,
                            "readiness socket is in use by another attempt",
                        ),
                    });
                }
                Err(_) => std::fs::remove_file(path)?,
            }
        }

        let listener = UnixListener::bind(path).map_err(|source| ReadinessError::Bind {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self {
            listener,
            socket_path: path.to_path_buf(),
            attempt: attempt.into(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.socket_path
    }

    /// Command line the tunnel program runs to raise the signal
    pub fn hook_command(&self, program: &Path) -> String {
        [
            quote_arg(&program.to_string_lossy()),
            "notify-ready".to_string(),
            "--socket".to_string(),
            quote_arg(&self.socket_path.to_string_lossy()),
            "--attempt".to_string(),
            quote_arg(&self.attempt),
        ]
        .join(" ")
    }

    /// Wait until the hook for this attempt reports readiness
    pub async fn wait(&self) -> Result<(), ReadinessError> {
        loop {
            let (stream, _) = self.listener.accept().await?;

            match tokio::time::timeout(READ_TIMEOUT, read_message(stream)).await {
                Ok(Ok(ReadinessMessage::Ready { attempt })) if attempt == self.attempt => {
                    debug!("Readiness signal received for attempt {}", attempt);
                    return Ok(());
                }
                Ok(Ok(ReadinessMessage::Ready { attempt })) => {
                    warn!("Ignoring readiness signal for unknown attempt {}", attempt);
                }
                Ok(Err(e)) => warn!("Ignoring malformed readiness message: {}", e),
                Err(_) => warn!("Readiness hook connected but sent nothing"),
            }
        }
    }

    /// Raise the signal for `attempt` on the socket at `path`
    pub async fn notify(path: &Path, attempt: &str) -> Result<(), ReadinessError> {
        let mut stream = UnixStream::connect(path).await?;

        let mut json = serde_json::to_string(&ReadinessMessage::Ready {
            attempt: attempt.to_string(),
        })?;
        json.push('\n');

        stream.write_all(json.as_bytes()).await?;
        stream.flush().await?;
        stream.shutdown().await?;

        Ok(())
    }
}

impl Drop for ReadinessChannel {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

async fn read_message(stream: UnixStream) -> Result<ReadinessMessage, ReadinessError> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let bytes_read = reader.read_line(&mut line).await?;

    if bytes_read == 0 {
        return Err(ReadinessError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "Connection closed",
        )));
    }

    Ok(serde_json::from_str(&line)?)
}

/// Quote `arg` for openvpn's command-line parser, which splits on whitespace
/// and honours double quotes with backslash escapes
fn quote_arg(arg: &str) -> String {
    let needs_quotes = arg
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '\'' | '"' | '\\'));
    if !needs_quotes {
        return arg.to_string();
    }

    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if matches!(c, '"' | '\\') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}
