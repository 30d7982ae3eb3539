//! OS boundary: launching, probing and signalling the tunnel process
//!
//! All privileged operations go through the escalation program (`sudo` by
//! default). When a password is needed it is written once to the escalation
//! program's stdin, which is then closed.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::cleanup::CaptureFiles;
use crate::config::ConnectionConfig;
use crate::privilege::LaunchCredential;
use crate::settings::Settings;

/// Signal used at each shutdown stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM, lets the tunnel program tear down its routes
    Terminate,
    /// SIGKILL
    Kill,
}

impl StopSignal {
    /// Arguments for `kill(1)`
    pub fn kill_args(self, pid: u32) -> Vec<String> {
        match self {
            StopSignal::Terminate => vec!["kill".to_string(), pid.to_string()],
            StopSignal::Kill => vec!["kill".to_string(), "-KILL".to_string(), pid.to_string()],
        }
    }
}

/// Everything needed to start the tunnel process for one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Tunnel program (run through the escalation program)
    pub program: PathBuf,
    pub args: Vec<String>,
    pub capture: CaptureFiles,
    /// Socket the route-up hook reports readiness on
    pub readiness_socket: PathBuf,
    pub attempt: String,
}

impl LaunchSpec {
    /// Build the openvpn invocation for `config`
    pub fn openvpn(
        program: &Path,
        config: &ConnectionConfig,
        settings: &Settings,
        hook_command: String,
        capture: CaptureFiles,
        readiness_socket: PathBuf,
        attempt: String,
    ) -> Self {
        let args = vec![
            "--cd".to_string(),
            config.config_dir().to_string_lossy().into_owned(),
            "--config".to_string(),
            config.config_file().to_string_lossy().into_owned(),
            "--dev".to_string(),
            settings.device.clone(),
            "--connect-retry-max".to_string(),
            settings.connect_retry_max.to_string(),
            "--connect-timeout".to_string(),
            config.timeout_secs_ceil().to_string(),
            "--script-security".to_string(),
            "2".to_string(),
            "--route-delay".to_string(),
            settings.route_delay_secs.to_string(),
            // the hook must stay a single argument
            "--route-up".to_string(),
            hook_command,
        ];

        Self {
            program: program.to_path_buf(),
            args,
            capture,
            readiness_socket,
            attempt,
        }
    }
}

/// Process operations the supervisor depends on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessHost: Send + Sync {
    /// Start the tunnel process with output redirected to the capture files;
    /// returns its pid
    async fn spawn(
        &self,
        spec: &LaunchSpec,
        credential: &LaunchCredential,
    ) -> std::io::Result<u32>;

    /// Whether `pid` still refers to a running (non-zombie) process
    fn is_alive(&self, pid: u32) -> bool;

    /// Deliver `signal` to `pid` with escalated rights
    async fn signal(
        &self,
        pid: u32,
        signal: StopSignal,
        credential: &LaunchCredential,
    ) -> std::io::Result<()>;
}

/// The real host, escalating through an external program
pub struct SystemHost {
    escalation_program: String,
    /// Children spawned by this instance, kept so they can be reaped
    children: Mutex<HashMap<u32, Child>>,
}

impl SystemHost {
    pub fn new(escalation_program: impl Into<String>) -> Self {
        Self {
            escalation_program: escalation_program.into(),
            children: Mutex::new(HashMap::new()),
        }
    }

    fn escalated(&self, credential: &LaunchCredential) -> Command {
        let mut cmd = Command::new(&self.escalation_program);
        if credential.needs_credential() {
            cmd.arg("-S");
        }
        cmd.stdin(if credential.needs_credential() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd
    }

    /// Reap an owned child if it has exited; `None` if not owned
    fn poll_owned(&self, pid: u32) -> Option<bool> {
        let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
        let child = children.get_mut(&pid)?;
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("Tunnel process {} exited with {}", pid, status);
                children.remove(&pid);
                Some(false)
            }
            Ok(None) => Some(true),
            Err(_) => None,
        }
    }
}

impl Default for SystemHost {
    fn default() -> Self {
        Self::new("sudo")
    }
}

async fn feed_credential(child: &mut Child, credential: &LaunchCredential) -> std::io::Result<()> {
    if let Some(payload) = credential.stdin_payload() {
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
            stdin.flush().await?;
            // dropping stdin closes it; no further input is supported
        }
    }
    Ok(())
}

#[async_trait]
impl ProcessHost for SystemHost {
    async fn spawn(
        &self,
        spec: &LaunchSpec,
        credential: &LaunchCredential,
    ) -> std::io::Result<u32> {
        let stdout = File::create(&spec.capture.stdout)?;
        let stderr = File::create(&spec.capture.stderr)?;

        debug!(
            "Launching {} {:?} {:?}",
            self.escalation_program, spec.program, spec.args
        );

        let mut child = self
            .escalated(credential)
            .arg(&spec.program)
            .args(&spec.args)
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            // own process group: Ctrl-C in the caller's terminal must not reach it
            .process_group(0)
            .spawn()?;

        let pid = child.id().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "process exited before reporting a pid")
        })?;

        feed_credential(&mut child, credential).await?;

        self.children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pid, child);

        Ok(pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        match self.poll_owned(pid) {
            Some(alive) => alive,
            None => process_exists(pid),
        }
    }

    async fn signal(
        &self,
        pid: u32,
        signal: StopSignal,
        credential: &LaunchCredential,
    ) -> std::io::Result<()> {
        let mut child = self
            .escalated(credential)
            .args(signal.kill_args(pid))
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        feed_credential(&mut child, credential).await?;

        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!(
                    "kill exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ))
        }
    }
}

/// Check if a process exists and has not exited
pub fn process_exists(pid: u32) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }

    // Signal 0 only checks; EPERM means it exists but belongs to root
    let exists = unsafe { libc::kill(raw, 0) } == 0
        || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);

    exists && !is_zombie(pid)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    // state is the first field after the parenthesised command name
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| {
            let (_, rest) = stat.rsplit_once(')')?;
            rest.split_whitespace().next().map(|state| state == "Z")
        })
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn shell_spec(dir: &Path, script: &str) -> LaunchSpec {
        LaunchSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            capture: CaptureFiles::new(
                dir.join("openvpnclient.stdout"),
                dir.join("openvpnclient.stderr"),
            ),
            readiness_socket: dir.join("ready.sock"),
            attempt: "test".to_string(),
        }
    }

    async fn wait_dead(host: &SystemHost, pid: u32) -> bool {
        for _ in 0..50 {
            if !host.is_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    #[test]
    fn test_kill_args() {
        assert_eq!(StopSignal::Terminate.kill_args(42), vec!["kill", "42"]);
        assert_eq!(StopSignal::Kill.kill_args(42), vec!["kill", "-KILL", "42"]);
    }

    #[test]
    fn test_openvpn_command_line() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("client.ovpn");
        std::fs::write(&file, "client\n").unwrap();
        let config = ConnectionConfig::with_timeout_secs(&file, 7).unwrap();

        let spec = LaunchSpec::openvpn(
            Path::new("/usr/sbin/openvpn"),
            &config,
            &Settings::default(),
            "/bin/ovpnctl notify-ready --socket /tmp/x.sock --attempt a".to_string(),
            CaptureFiles::new("/tmp/o", "/tmp/e"),
            PathBuf::from("/tmp/x.sock"),
            "a".to_string(),
        );

        let dir = config.config_dir().to_string_lossy().into_owned();
        let cfg = config.config_file().to_string_lossy().into_owned();
        assert_eq!(
            spec.args,
            vec![
                "--cd",
                dir.as_str(),
                "--config",
                cfg.as_str(),
                "--dev",
                "tun_ovpn",
                "--connect-retry-max",
                "3",
                "--connect-timeout",
                "7",
                "--script-security",
                "2",
                "--route-delay",
                "1",
                "--route-up",
                "/bin/ovpnctl notify-ready --socket /tmp/x.sock --attempt a",
            ]
        );
    }

    #[test]
    fn test_current_process_exists() {
        assert!(process_exists(std::process::id()));
        assert!(!process_exists(0));
        assert!(!process_exists(u32::MAX));
    }

    #[tokio::test]
    async fn test_system_host_spawn_capture_and_terminate() {
        let temp = TempDir::new().unwrap();
        // `env` stands in for the escalation program
        let host = SystemHost::new("env");
        let spec = shell_spec(temp.path(), "echo started; echo warning >&2; exec sleep 30");

        let pid = host
            .spawn(&spec, &LaunchCredential::Passwordless)
            .await
            .unwrap();
        assert!(host.is_alive(pid));

        host.signal(pid, StopSignal::Terminate, &LaunchCredential::Passwordless)
            .await
            .unwrap();
        assert!(wait_dead(&host, pid).await, "process should exit on SIGTERM");

        let output = spec.capture.read();
        assert_eq!(output.stdout.trim(), "started");
        assert_eq!(output.stderr.trim(), "warning");
    }

    #[tokio::test]
    async fn test_system_host_signal_unknown_pid_fails() {
        let host = SystemHost::new("env");
        let result = host
            .signal(u32::MAX / 2, StopSignal::Terminate, &LaunchCredential::Passwordless)
            .await;
        assert!(result.is_err());
    }
}
