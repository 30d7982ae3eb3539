//! Per-attempt connection configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ValidationError;

/// Tunnel definition file plus connect timeout, validated at construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    config_file: PathBuf,
    timeout: Duration,
}

impl ConnectionConfig {
    /// Validate and build a configuration.
    ///
    /// The timeout must be non-zero and the file must exist and be a regular
    /// file.
    pub fn new(config_file: impl Into<PathBuf>, timeout: Duration) -> Result<Self, ValidationError> {
        if timeout.is_zero() {
            return Err(ValidationError::InvalidTimeout);
        }

        let config_file = config_file.into();
        if !config_file.is_file() {
            return Err(ValidationError::ConfigNotFound(config_file));
        }
        // The tunnel program runs with --cd, so relative paths would break
        let config_file = std::fs::canonicalize(&config_file)
            .map_err(|_| ValidationError::ConfigNotFound(config_file))?;

        Ok(Self {
            config_file,
            timeout,
        })
    }

    /// Convenience constructor taking whole seconds
    pub fn with_timeout_secs(
        config_file: impl Into<PathBuf>,
        timeout_secs: u64,
    ) -> Result<Self, ValidationError> {
        Self::new(config_file, Duration::from_secs(timeout_secs))
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    /// Directory the tunnel program runs in, so relative key/cert paths in
    /// the definition file resolve against it
    pub fn config_dir(&self) -> &Path {
        self.config_file.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Timeout in whole seconds for the tunnel program's own connect timeout,
    /// rounded up and never below one
    pub fn timeout_secs_ceil(&self) -> u64 {
        let secs = self.timeout.as_secs();
        if self.timeout.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs.max(1)
        }
    }
}
