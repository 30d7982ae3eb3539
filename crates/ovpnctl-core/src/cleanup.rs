//! Removal of per-connection artifacts
//!
//! Each artifact is removed independently. Artifacts that were already gone
//! are reported back rather than silently skipped.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{CleanupError, RegistryError};
use crate::registry::Registry;

/// A transient artifact of one connection lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    Registry,
    Stdout(PathBuf),
    Stderr(PathBuf),
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Artifact::Registry => write!(f, "registry entry"),
            Artifact::Stdout(path) | Artifact::Stderr(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Outcome of a cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Artifacts that were expected but already absent
    pub missing: Vec<Artifact>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty()
    }

    /// Treat missing artifacts as an error
    pub fn into_result(self) -> Result<(), CleanupError> {
        if self.is_clean() {
            Ok(())
        } else {
            Err(CleanupError {
                missing: self.missing,
            })
        }
    }
}

/// Paths of the two captured output streams
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFiles {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl CaptureFiles {
    pub fn new(stdout: impl Into<PathBuf>, stderr: impl Into<PathBuf>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// Read both streams; a missing file reads as empty
    pub fn read(&self) -> CapturedOutput {
        CapturedOutput {
            stdout: read_lossy(&self.stdout),
            stderr: read_lossy(&self.stderr),
        }
    }

    /// Remove both files, ignoring ones that are already gone
    pub fn discard(&self) {
        let _ = fs::remove_file(&self.stdout);
        let _ = fs::remove_file(&self.stderr);
    }
}

fn read_lossy(path: &Path) -> String {
    fs::read(path)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Output the supervised process wrote during its lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    /// stderr with every benign fragment removed, trimmed; `None` if nothing
    /// remains
    pub fn significant_stderr(&self, benign: &[String]) -> Option<String> {
        let mut stderr = self.stderr.clone();
        for fragment in benign.iter().filter(|f| !f.is_empty()) {
            stderr = stderr.replace(fragment.as_str(), "");
        }
        let stderr = stderr.trim();
        (!stderr.is_empty()).then(|| stderr.to_string())
    }
}

/// Remove the registry entry and both capture files
pub fn run(registry: &dyn Registry, capture: &CaptureFiles) -> CleanupReport {
    let mut report = CleanupReport::default();

    match registry.clear() {
        Ok(()) => {}
        Err(RegistryError::Missing(_)) => report.missing.push(Artifact::Registry),
        Err(e) => warn!("Failed to clear registry: {}", e),
    }

    if !remove(&capture.stderr) {
        report.missing.push(Artifact::Stderr(capture.stderr.clone()));
    }
    if !remove(&capture.stdout) {
        report.missing.push(Artifact::Stdout(capture.stdout.clone()));
    }

    if report.is_clean() {
        debug!("Cleanup complete");
    } else {
        warn!(
            "Cleanup found artifacts already absent: {}",
            report
                .missing
                .iter()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    report
}

/// Remove a file; false if it did not exist
fn remove(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            warn!("Failed to remove {:?}: {}", path, e);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;
    use crate::settings::BENIGN_TEARDOWN_STDERR;
    use tempfile::TempDir;

    fn capture_in(dir: &Path) -> CaptureFiles {
        CaptureFiles::new(
            dir.join("openvpnclient.stdout"),
            dir.join("openvpnclient.stderr"),
        )
    }

    #[test]
    fn test_cleanup_removes_everything() {
        let temp = TempDir::new().unwrap();
        let capture = capture_in(temp.path());
        fs::write(&capture.stdout, "out").unwrap();
        fs::write(&capture.stderr, "").unwrap();
        let registry = MemoryRegistry::with_pid(12);

        let report = run(&registry, &capture);

        assert!(report.is_clean());
        assert!(report.into_result().is_ok());
        assert_eq!(registry.current().unwrap(), None);
        assert!(!capture.stdout.exists());
        assert!(!capture.stderr.exists());
    }

    #[test]
    fn test_cleanup_reports_each_missing_artifact() {
        let temp = TempDir::new().unwrap();
        let capture = capture_in(temp.path());
        fs::write(&capture.stdout, "out").unwrap();
        let registry = MemoryRegistry::new();

        let report = run(&registry, &capture);

        assert_eq!(
            report.missing,
            vec![Artifact::Registry, Artifact::Stderr(capture.stderr.clone())]
        );
        assert!(!capture.stdout.exists());

        let err = report.into_result().unwrap_err();
        assert_eq!(err.missing.len(), 2);
    }

    #[test]
    fn test_read_missing_capture_is_empty() {
        let temp = TempDir::new().unwrap();
        let output = capture_in(temp.path()).read();
        assert_eq!(output, CapturedOutput::default());
    }

    #[test]
    fn test_significant_stderr_strips_benign_message() {
        let output = CapturedOutput {
            stdout: String::new(),
            stderr: format!("{}\n", BENIGN_TEARDOWN_STDERR),
        };
        assert_eq!(
            output.significant_stderr(&[BENIGN_TEARDOWN_STDERR.to_string()]),
            None
        );
    }

    #[test]
    fn test_significant_stderr_keeps_real_errors() {
        let output = CapturedOutput {
            stdout: String::new(),
            stderr: format!("{}\nOptions error: bad config\n", BENIGN_TEARDOWN_STDERR),
        };
        assert_eq!(
            output.significant_stderr(&[BENIGN_TEARDOWN_STDERR.to_string()]),
            Some("Options error: bad config".to_string())
        );
    }
}
