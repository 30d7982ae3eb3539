//! Shared fakes for supervisor tests

#![allow(dead_code)]

use async_trait::async_trait;
use ovpnctl_core::{
    CancellationToken, LaunchCredential, LaunchSpec, MemoryRegistry, NoEscalation, PrivilegeError,
    PrivilegeProbe, ProcessHost, ReadinessChannel, Settings, ShutdownPolicy, StopSignal,
    Supervisor,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// How the fake tunnel process behaves
#[derive(Debug, Clone, Default)]
pub struct FakeBehavior {
    /// Raise the readiness signal this long after spawn
    pub ready_after: Option<Duration>,
    /// Survive SIGTERM
    pub ignore_terminate: bool,
    /// Written to the stderr capture at spawn
    pub stderr: String,
    /// Fail the spawn itself
    pub fail_spawn: bool,
    /// Raise readiness and then cancel this token, both before spawn returns
    pub cancel_on_ready: Option<CancellationToken>,
}

/// In-process stand-in for the OS: tracks fake pids and raises readiness
/// through the real socket
pub struct FakeHost {
    behavior: FakeBehavior,
    next_pid: AtomicU32,
    alive: Mutex<HashMap<u32, bool>>,
    pub signals: Mutex<Vec<(u32, StopSignal)>>,
    pub spawned: Mutex<Vec<LaunchSpec>>,
}

impl FakeHost {
    pub fn new(behavior: FakeBehavior) -> Self {
        Self::starting_at(behavior, 40_000)
    }

    /// Fake host handing out pids from `first_pid`
    pub fn starting_at(behavior: FakeBehavior, first_pid: u32) -> Self {
        Self {
            behavior,
            next_pid: AtomicU32::new(first_pid),
            alive: Mutex::new(HashMap::new()),
            signals: Mutex::new(Vec::new()),
            spawned: Mutex::new(Vec::new()),
        }
    }

    pub fn signals(&self) -> Vec<(u32, StopSignal)> {
        self.signals.lock().unwrap().clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }

    pub fn kill_externally(&self, pid: u32) {
        self.alive.lock().unwrap().insert(pid, false);
    }
}

#[async_trait]
impl ProcessHost for FakeHost {
    async fn spawn(
        &self,
        spec: &LaunchSpec,
        _credential: &LaunchCredential,
    ) -> std::io::Result<u32> {
        if self.behavior.fail_spawn {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "escalation program not found",
            ));
        }

        std::fs::write(&spec.capture.stdout, "Initialization Sequence Completed\n")?;
        std::fs::write(&spec.capture.stderr, &self.behavior.stderr)?;

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.alive.lock().unwrap().insert(pid, true);
        self.spawned.lock().unwrap().push(spec.clone());

        if let Some(token) = &self.behavior.cancel_on_ready {
            ReadinessChannel::notify(&spec.readiness_socket, &spec.attempt)
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
            token.cancel();
        }

        if let Some(delay) = self.behavior.ready_after {
            let socket = spec.readiness_socket.clone();
            let attempt = spec.attempt.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = ReadinessChannel::notify(&socket, &attempt).await;
            });
        }

        Ok(pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().unwrap().get(&pid).copied().unwrap_or(false)
    }

    async fn signal(
        &self,
        pid: u32,
        signal: StopSignal,
        _credential: &LaunchCredential,
    ) -> std::io::Result<()> {
        self.signals.lock().unwrap().push((pid, signal));

        let mut alive = self.alive.lock().unwrap();
        match alive.get_mut(&pid) {
            Some(state) => {
                if signal == StopSignal::Kill || !self.behavior.ignore_terminate {
                    *state = false;
                }
                Ok(())
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such process",
            )),
        }
    }
}

/// Escalation needs a password that is not set
pub struct MissingPassword;

#[async_trait]
impl PrivilegeProbe for MissingPassword {
    async fn credential(&self) -> Result<LaunchCredential, PrivilegeError> {
        Err(PrivilegeError::MissingCredential {
            var: "SUDO_PASSWORD".to_string(),
        })
    }
}

/// Fast shutdown bounds so escalation tests stay short
pub fn fast_policy() -> ShutdownPolicy {
    ShutdownPolicy {
        graceful_wait: Duration::from_millis(300),
        forceful_wait: Duration::from_millis(200),
        poll_interval: Duration::from_millis(20),
    }
}

pub fn write_config(dir: &Path) -> std::path::PathBuf {
    let file = dir.join("client.ovpn");
    std::fs::write(&file, "client\nremote vpn.example.com 1194\n").unwrap();
    file
}

/// Supervisor wired to fakes, with its runtime dir inside `temp`
pub fn supervisor(
    temp: &TempDir,
    host: Arc<FakeHost>,
    registry: Arc<MemoryRegistry>,
) -> Supervisor {
    supervisor_with_probe(temp, host, registry, Arc::new(NoEscalation))
}

pub fn supervisor_with_probe(
    temp: &TempDir,
    host: Arc<FakeHost>,
    registry: Arc<MemoryRegistry>,
    probe: Arc<dyn PrivilegeProbe>,
) -> Supervisor {
    let settings = Settings {
        runtime_dir: Some(temp.path().to_path_buf()),
        ..Settings::default()
    };

    Supervisor::builder(settings)
        .registry(registry)
        .host(host)
        .probe(probe)
        .openvpn_program("/usr/sbin/openvpn")
        .hook_program("/usr/local/bin/ovpnctl")
        .shutdown_policy(fast_policy())
        .build()
        .unwrap()
}
