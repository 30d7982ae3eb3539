//! Error types for the connection supervisor
//!
//! Every operation returns one of these typed errors to its direct caller.
//! Nothing is retried automatically.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::cleanup::Artifact;

/// Invalid input detected before any process is launched
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Connection timeout must be greater than zero")]
    InvalidTimeout,

    #[error("File '{0}' not found, or is not a file")]
    ConfigNotFound(PathBuf),

    #[error("'{0}' must be installed and available on the PATH")]
    BinaryNotFound(String),
}

/// Privilege escalation could not be arranged
#[derive(Debug, Error)]
pub enum PrivilegeError {
    #[error("Environment variable {var} must be set")]
    MissingCredential { var: String },

    #[error("Failed to run privilege probe: {0}")]
    Probe(#[source] std::io::Error),
}

/// Failures of the durable process registry
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("No process registered at {0:?}")]
    Missing(PathBuf),

    #[error("PID in {path:?} is not an integer: {content:?}")]
    Corrupt { path: PathBuf, content: String },

    #[error("Registry I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the readiness channel
#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error("Failed to bind readiness socket at {path:?}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Readiness channel I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed readiness message: {0}")]
    Protocol(#[from] serde_json::Error),
}

/// Transient artifacts that were expected but already absent
#[derive(Debug, Error)]
#[error("File(s) non-existent: {}", format_artifacts(.missing))]
pub struct CleanupError {
    pub missing: Vec<Artifact>,
}

fn format_artifacts(missing: &[Artifact]) -> String {
    missing
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_stderr(stderr: &Option<String>) -> String {
    match stderr {
        Some(stderr) => format!("\nSTDERR:\n{}", stderr),
        None => String::new(),
    }
}

/// Errors returned by [`crate::Supervisor::connect`]
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Already connected (pid {pid})")]
    AlreadyConnected { pid: u32 },

    #[error("Another connection attempt is already in progress")]
    AttemptInProgress,

    #[error(transparent)]
    Privilege(#[from] PrivilegeError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Readiness(#[from] ReadinessError),

    #[error("Failed to launch tunnel process: {0}")]
    Launch(#[source] std::io::Error),

    /// `stderr` holds what the tunnel process reported if it had already died
    #[error("Did not connect in {} seconds{}", .after.as_secs_f64(), format_stderr(.stderr))]
    Timeout {
        after: Duration,
        stderr: Option<String>,
    },

    #[error("Connection attempt cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors returned by [`crate::Supervisor::disconnect`]
#[derive(Debug, Error)]
pub enum DisconnectError {
    #[error("No ongoing connection found (pid not registered)")]
    NoActiveConnection,

    #[error("Process {pid} has already exited{}", format_stderr(.stderr))]
    ProcessAlreadyExited { pid: u32, stderr: Option<String> },

    #[error("Process {pid} did not exit after forceful termination")]
    DidNotExit { pid: u32 },

    #[error("Process exited with error output:\nSTDOUT:\n{stdout}\nSTDERR:\n{stderr}")]
    AbnormalTermination { stdout: String, stderr: String },

    #[error(transparent)]
    Privilege(#[from] PrivilegeError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Failed to signal process: {0}")]
    Signal(#[source] std::io::Error),
}
