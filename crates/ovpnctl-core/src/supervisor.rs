//! Connection supervisor
//!
//! Owns the connect/disconnect state machine. A connect attempt arms three
//! listeners (timer, readiness, optional cancellation) on a single-slot
//! rendezvous; the first one to fire decides the attempt's status and the
//! others become no-ops.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cleanup::{self, CaptureFiles, CleanupReport};
use crate::config::ConnectionConfig;
use crate::error::{ConnectError, DisconnectError, ValidationError};
use crate::privilege::{NoEscalation, PrivilegeProbe, SudoProbe};
use crate::process::{LaunchSpec, ProcessHost, SystemHost};
use crate::readiness::ReadinessChannel;
use crate::registry::{FileRegistry, Registry};
use crate::settings::{RuntimePaths, Settings};
use crate::shutdown::{self, ShutdownPolicy, ShutdownStage};

/// Status of one connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Connected,
    UserCancelled,
    ConnectionTimeout,
}

/// Result of a successful disconnect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectReport {
    pub pid: u32,
    /// Stage that made the process exit
    pub stage: ShutdownStage,
    /// Artifacts that were already absent during cleanup
    pub cleanup: CleanupReport,
}

/// Single-slot completion signal; the first writer wins
#[derive(Clone)]
struct Rendezvous {
    slot: Arc<Mutex<Option<oneshot::Sender<ConnectionStatus>>>>,
}

impl Rendezvous {
    fn new() -> (Self, oneshot::Receiver<ConnectionStatus>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                slot: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Resolve the attempt; false if another listener already did
    fn resolve(&self, status: ConnectionStatus) -> bool {
        let sender = self.slot.lock().unwrap_or_else(|e| e.into_inner()).take();
        match sender {
            Some(tx) => tx.send(status).is_ok(),
            None => false,
        }
    }
}

/// Listener tasks armed for one attempt
struct Listeners {
    tasks: Vec<JoinHandle<()>>,
}

impl Listeners {
    /// Abort every listener and wait until each has been dropped
    async fn disarm(self) {
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Supervises the single tunnel process on this host
pub struct Supervisor {
    registry: Arc<dyn Registry>,
    host: Arc<dyn ProcessHost>,
    probe: Arc<dyn PrivilegeProbe>,
    paths: RuntimePaths,
    settings: Settings,
    openvpn: PathBuf,
    hook_program: PathBuf,
    policy: ShutdownPolicy,
    attempt_lock: tokio::sync::Mutex<()>,
}

impl Supervisor {
    pub fn builder(settings: Settings) -> SupervisorBuilder {
        SupervisorBuilder::new(settings)
    }

    /// Supervisor backed by the real host, `sudo` and the pid file
    pub fn from_settings(settings: Settings) -> Result<Self, ValidationError> {
        Self::builder(settings).build()
    }

    pub fn paths(&self) -> &RuntimePaths {
        &self.paths
    }

    fn capture(&self) -> CaptureFiles {
        CaptureFiles::new(self.paths.stdout_file(), self.paths.stderr_file())
    }

    /// Launch the tunnel and wait until it is usable, the timeout elapses or
    /// `cancel` fires.
    ///
    /// On anything but success the half-started process has been torn down
    /// before this returns.
    pub async fn connect(
        &self,
        config: &ConnectionConfig,
        cancel: Option<CancellationToken>,
    ) -> Result<(), ConnectError> {
        let _attempt = self
            .attempt_lock
            .try_lock()
            .map_err(|_| ConnectError::AttemptInProgress)?;

        self.ensure_not_connected()?;

        let credential = self.probe.credential().await?;

        let attempt = ReadinessChannel::new_attempt_id();
        let channel =
            ReadinessChannel::bind(&self.paths.readiness_socket(&attempt), attempt.clone()).await?;
        let spec = LaunchSpec::openvpn(
            &self.openvpn,
            config,
            &self.settings,
            channel.hook_command(&self.hook_program),
            self.capture(),
            channel.path().to_path_buf(),
            attempt,
        );

        let (rendezvous, outcome) = Rendezvous::new();
        let listeners = Self::arm(config.timeout(), Arc::new(channel), cancel.clone(), rendezvous);

        let pid = match self.host.spawn(&spec, &credential).await {
            Ok(pid) => pid,
            Err(e) => {
                listeners.disarm().await;
                spec.capture.discard();
                return Err(ConnectError::Launch(e));
            }
        };
        info!("Tunnel process started (pid {})", pid);

        if let Err(e) = self.registry.register(pid) {
            error!("Failed to register pid {}: {}", pid, e);
            listeners.disarm().await;
            if let Err(stop) =
                shutdown::terminate(self.host.as_ref(), pid, &credential, &self.policy).await
            {
                warn!("Failed to stop unregistered process {}: {}", pid, stop);
            }
            spec.capture.discard();
            return Err(e.into());
        }

        let status = outcome.await.unwrap_or(ConnectionStatus::Idle);
        listeners.disarm().await;

        let status = match (status, &cancel) {
            (ConnectionStatus::Connected, Some(token)) if token.is_cancelled() => {
                info!("Cancellation requested right after connecting");
                ConnectionStatus::UserCancelled
            }
            (status, _) => status,
        };

        match status {
            ConnectionStatus::Connected => {
                info!("Connection successful");
                Ok(())
            }
            ConnectionStatus::ConnectionTimeout => {
                info!("Connection attempt timed out");
                let stderr = self.teardown(pid).await;
                Err(ConnectError::Timeout {
                    after: config.timeout(),
                    stderr,
                })
            }
            ConnectionStatus::UserCancelled => {
                info!("User cancelled during connection");
                self.teardown(pid).await;
                Err(ConnectError::Cancelled)
            }
            ConnectionStatus::Idle => {
                self.teardown(pid).await;
                Err(ConnectError::Internal(format!("Unknown status {:?}", status)))
            }
        }
    }

    /// Stop the registered tunnel process and remove its artifacts
    pub async fn disconnect(&self) -> Result<DisconnectReport, DisconnectError> {
        let Some(pid) = self.registry.current()? else {
            info!("No ongoing connection found (pid not registered)");
            return Err(DisconnectError::NoActiveConnection);
        };

        self.stop(pid).await
    }

    /// Stop the registered process `pid` and remove its artifacts
    async fn stop(&self, pid: u32) -> Result<DisconnectReport, DisconnectError> {
        let capture = self.capture();

        if !self.host.is_alive(pid) {
            info!("Process {} has already exited", pid);
            let output = capture.read();
            cleanup::run(self.registry.as_ref(), &capture);
            return Err(DisconnectError::ProcessAlreadyExited {
                pid,
                stderr: output.significant_stderr(&self.settings.benign_stderr),
            });
        }

        let credential = self.probe.credential().await?;
        let stage = shutdown::terminate(self.host.as_ref(), pid, &credential, &self.policy).await?;

        let output = capture.read();
        let report = cleanup::run(self.registry.as_ref(), &capture);

        if let Some(stderr) = output.significant_stderr(&self.settings.benign_stderr) {
            info!("Process exited with error output");
            return Err(DisconnectError::AbnormalTermination {
                stdout: output.stdout.trim().to_string(),
                stderr,
            });
        }

        info!("Process exited");
        Ok(DisconnectReport {
            pid,
            stage,
            cleanup: report,
        })
    }

    /// Whether the registry points at a live process
    pub fn is_connected(&self) -> Result<bool, ConnectError> {
        Ok(self
            .registry
            .current()?
            .map(|pid| self.host.is_alive(pid))
            .unwrap_or(false))
    }

    fn ensure_not_connected(&self) -> Result<(), ConnectError> {
        let Some(pid) = self.registry.current()? else {
            return Ok(());
        };

        if self.host.is_alive(pid) {
            return Err(ConnectError::AlreadyConnected { pid });
        }

        warn!(
            "Registered process {} is no longer running, clearing stale registry",
            pid
        );
        cleanup::run(self.registry.as_ref(), &self.capture());
        Ok(())
    }

    fn arm(
        timeout: Duration,
        channel: Arc<ReadinessChannel>,
        cancel: Option<CancellationToken>,
        rendezvous: Rendezvous,
    ) -> Listeners {
        let mut tasks = Vec::with_capacity(3);

        let timer = rendezvous.clone();
        tasks.push(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            timer.resolve(ConnectionStatus::ConnectionTimeout);
        }));

        let ready = rendezvous.clone();
        tasks.push(tokio::spawn(async move {
            match channel.wait().await {
                Ok(()) => {
                    ready.resolve(ConnectionStatus::Connected);
                }
                // the timer still bounds the attempt
                Err(e) => warn!("Readiness listener stopped: {}", e),
            }
        }));

        if let Some(token) = cancel {
            tasks.push(tokio::spawn(async move {
                token.cancelled().await;
                rendezvous.resolve(ConnectionStatus::UserCancelled);
            }));
        }

        Listeners { tasks }
    }

    /// Stop the process this attempt spawned after a failed attempt.
    ///
    /// Registry and capture files are only touched while the registry still
    /// holds `pid`; another invocation may have replaced it. Returns the
    /// process's significant stderr, if it left any. Failures are only logged.
    async fn teardown(&self, pid: u32) -> Option<String> {
        match self.registry.current() {
            Ok(Some(current)) if current == pid => {}
            other => {
                warn!(
                    "Registry no longer holds process {} ({:?}), leaving it untouched",
                    pid, other
                );
                self.stop_unregistered(pid).await;
                return None;
            }
        }

        let stderr = match self.stop(pid).await {
            Ok(report) => {
                debug!("Teardown stopped process {}", report.pid);
                None
            }
            Err(DisconnectError::ProcessAlreadyExited { stderr, .. }) => stderr,
            Err(DisconnectError::AbnormalTermination { stderr, .. }) => Some(stderr),
            Err(e) => {
                warn!("Teardown after failed connect: {}", e);
                None
            }
        };

        if let Some(stderr) = &stderr {
            warn!("Tunnel process {} reported: {}", pid, stderr);
        }
        stderr
    }

    /// Signal `pid` without touching registry or capture files
    async fn stop_unregistered(&self, pid: u32) {
        if !self.host.is_alive(pid) {
            return;
        }

        let result = match self.probe.credential().await {
            Ok(credential) => {
                shutdown::terminate(self.host.as_ref(), pid, &credential, &self.policy)
                    .await
                    .map(|_| ())
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!("Failed to stop unregistered process {}: {}", pid, e);
        }
    }
}

/// Builder for [`Supervisor`], so tests can swap in fakes
pub struct SupervisorBuilder {
    settings: Settings,
    registry: Option<Arc<dyn Registry>>,
    host: Option<Arc<dyn ProcessHost>>,
    probe: Option<Arc<dyn PrivilegeProbe>>,
    openvpn: Option<PathBuf>,
    hook_program: Option<PathBuf>,
    policy: Option<ShutdownPolicy>,
}

impl SupervisorBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            registry: None,
            host: None,
            probe: None,
            openvpn: None,
            hook_program: None,
            policy: None,
        }
    }

    pub fn registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn host(mut self, host: Arc<dyn ProcessHost>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn PrivilegeProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Use this tunnel program instead of resolving it on PATH
    pub fn openvpn_program(mut self, path: impl Into<PathBuf>) -> Self {
        self.openvpn = Some(path.into());
        self
    }

    /// Program the readiness hook invokes (defaults to the current executable)
    pub fn hook_program(mut self, path: impl Into<PathBuf>) -> Self {
        self.hook_program = Some(path.into());
        self
    }

    pub fn shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn build(self) -> Result<Supervisor, ValidationError> {
        let settings = self.settings;
        let paths = settings.runtime_paths();

        let openvpn = match self.openvpn {
            Some(path) => path,
            None => settings.resolve_openvpn()?,
        };

        let hook_program = match self.hook_program {
            Some(path) => path,
            None => std::env::current_exe()
                .map_err(|_| ValidationError::BinaryNotFound("ovpnctl".to_string()))?,
        };

        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(FileRegistry::new(paths.pid_file())));
        let host = self
            .host
            .unwrap_or_else(|| Arc::new(SystemHost::new(settings.escalation_program.clone())));
        let probe = self.probe.unwrap_or_else(|| -> Arc<dyn PrivilegeProbe> {
            if settings.assume_privileged {
                Arc::new(NoEscalation)
            } else {
                Arc::new(SudoProbe::new(
                    settings.escalation_program.clone(),
                    settings.credential_env.clone(),
                ))
            }
        });
        let policy = self.policy.unwrap_or_else(|| settings.shutdown_policy());

        Ok(Supervisor {
            registry,
            host,
            probe,
            paths,
            settings,
            openvpn,
            hook_program,
            policy,
            attempt_lock: tokio::sync::Mutex::new(()),
        })
    }
}
