//! Escalating shutdown of the tunnel process
//!
//! Two stages: `Graceful` sends SIGTERM and waits, `Forceful` sends SIGKILL
//! and waits a shorter time. Exit is detected by polling liveness.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::DisconnectError;
use crate::privilege::LaunchCredential;
use crate::process::{ProcessHost, StopSignal};

/// Stage of the shutdown state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStage {
    Graceful,
    Forceful,
}

impl ShutdownStage {
    pub fn signal(self) -> StopSignal {
        match self {
            ShutdownStage::Graceful => StopSignal::Terminate,
            ShutdownStage::Forceful => StopSignal::Kill,
        }
    }

    /// Stage to escalate to if this one did not stop the process
    pub fn next(self) -> Option<Self> {
        match self {
            ShutdownStage::Graceful => Some(ShutdownStage::Forceful),
            ShutdownStage::Forceful => None,
        }
    }
}

/// Wait bounds for each stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownPolicy {
    pub graceful_wait: Duration,
    pub forceful_wait: Duration,
    pub poll_interval: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            graceful_wait: Duration::from_secs(10),
            forceful_wait: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl ShutdownPolicy {
    pub fn wait_for(&self, stage: ShutdownStage) -> Duration {
        match stage {
            ShutdownStage::Graceful => self.graceful_wait,
            ShutdownStage::Forceful => self.forceful_wait,
        }
    }
}

/// Stop `pid`, escalating from SIGTERM to SIGKILL.
///
/// Returns the stage that made the process exit.
pub async fn terminate(
    host: &dyn ProcessHost,
    pid: u32,
    credential: &LaunchCredential,
    policy: &ShutdownPolicy,
) -> Result<ShutdownStage, DisconnectError> {
    let mut stage = Some(ShutdownStage::Graceful);

    while let Some(current) = stage {
        info!("Sending {:?} to process {}", current.signal(), pid);

        if let Err(e) = host.signal(pid, current.signal(), credential).await {
            if !host.is_alive(pid) {
                // exited between the liveness check and the signal
                return Ok(current);
            }
            if current.next().is_none() {
                return Err(DisconnectError::Signal(e));
            }
            warn!("Failed to send {:?} to {}: {}", current.signal(), pid, e);
        } else if wait_for_exit(host, pid, policy.wait_for(current), policy.poll_interval).await {
            return Ok(current);
        }

        if current.next().is_some() {
            info!("Failed to terminate process {}, killing instead", pid);
        }
        stage = current.next();
    }

    warn!("Process {} survived forceful termination", pid);
    Err(DisconnectError::DidNotExit { pid })
}

/// Poll until `pid` is gone or `bound` elapses; true if it exited
pub async fn wait_for_exit(
    host: &dyn ProcessHost,
    pid: u32,
    bound: Duration,
    poll_interval: Duration,
) -> bool {
    let deadline = Instant::now() + bound;

    loop {
        if !host.is_alive(pid) {
            return true;
        }

        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}
