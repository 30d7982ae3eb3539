//! Supervisor settings
//!
//! Stores launch and shutdown tuning in ~/.ovpnctl/config.json. Every field
//! has a default, so the file is optional.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ValidationError;
use crate::shutdown::ShutdownPolicy;

/// stderr line openvpn emits when tearing down a tun device it did not fully
/// configure; harmless
pub const BENIGN_TEARDOWN_STDERR: &str =
    "ifconfig: ioctl (SIOCDIFADDR): Can't assign requested address";

/// Global supervisor settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Directory for the registry file, capture files and readiness sockets
    /// (defaults to the system temp dir)
    pub runtime_dir: Option<PathBuf>,

    /// Tunnel program, resolved on PATH
    pub openvpn_binary: String,

    /// Program used to obtain elevated rights
    pub escalation_program: String,

    /// tun device name passed to the tunnel program
    pub device: String,

    pub connect_retry_max: u32,

    pub route_delay_secs: u32,

    /// Environment variable holding the escalation password
    pub credential_env: String,

    /// Skip the passwordless probe; the escalation program never prompts
    pub assume_privileged: bool,

    pub graceful_stop_secs: u64,

    pub forceful_stop_secs: u64,

    /// stderr fragments that do not count as abnormal termination
    pub benign_stderr: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            runtime_dir: None,
            openvpn_binary: "openvpn".to_string(),
            escalation_program: "sudo".to_string(),
            device: "tun_ovpn".to_string(),
            connect_retry_max: 3,
            route_delay_secs: 1,
            credential_env: "SUDO_PASSWORD".to_string(),
            assume_privileged: false,
            graceful_stop_secs: 10,
            forceful_stop_secs: 5,
            benign_stderr: vec![BENIGN_TEARDOWN_STDERR.to_string()],
        }
    }
}

impl Settings {
    /// Paths of every persisted artifact
    pub fn runtime_paths(&self) -> RuntimePaths {
        RuntimePaths::new(
            self.runtime_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
        )
    }

    pub fn shutdown_policy(&self) -> ShutdownPolicy {
        ShutdownPolicy {
            graceful_wait: Duration::from_secs(self.graceful_stop_secs),
            forceful_wait: Duration::from_secs(self.forceful_stop_secs),
            ..ShutdownPolicy::default()
        }
    }

    /// Resolve the tunnel program on PATH
    pub fn resolve_openvpn(&self) -> Result<PathBuf, ValidationError> {
        find_in_path(&self.openvpn_binary)
            .ok_or_else(|| ValidationError::BinaryNotFound(self.openvpn_binary.clone()))
    }
}

/// Look a program up the way a shell would: paths containing a separator are
/// taken as-is, bare names are searched on PATH
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|full| is_executable(full))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Locations of the registry file, capture files and readiness sockets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    dir: PathBuf,
}

impl RuntimePaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn pid_file(&self) -> PathBuf {
        self.dir.join("openvpnclient.pid")
    }

    pub fn stdout_file(&self) -> PathBuf {
        self.dir.join("openvpnclient.stdout")
    }

    pub fn stderr_file(&self) -> PathBuf {
        self.dir.join("openvpnclient.stderr")
    }

    /// Per-attempt readiness socket
    pub fn readiness_socket(&self, attempt: &str) -> PathBuf {
        // sun_path is limited to ~100 bytes, keep the name short
        let short: String = attempt.chars().take(8).collect();
        self.dir.join(format!("openvpnclient.{}.sock", short))
    }
}

/// Settings manager
pub struct SettingsManager;

impl SettingsManager {
    /// Get the settings file path
    pub fn settings_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".ovpnctl").join("config.json"))
    }

    /// Load settings from the default location
    pub fn load() -> Result<Settings> {
        Self::load_from(&Self::settings_path()?)
    }

    /// Load settings from a file, falling back to defaults if it is absent
    pub fn load_from(path: &Path) -> Result<Settings> {
        if !path.exists() {
            return Ok(Settings::default());
        }

        let json =
            fs::read_to_string(path).context(format!("Failed to read settings file: {:?}", path))?;

        let settings: Settings = serde_json::from_str(&json)
            .context(format!("Failed to parse settings file: {:?}", path))?;

        Ok(settings)
    }
}
