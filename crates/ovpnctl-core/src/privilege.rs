//! Privilege escalation probe
//!
//! The tunnel program needs root. Before launching or killing it we find out
//! whether the escalation program works without a password, or whether the
//! password has to come from the environment.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::error::PrivilegeError;

/// How the escalation program is invoked for this operation
#[derive(Debug)]
pub enum LaunchCredential {
    /// Escalation works without prompting
    Passwordless,
    /// Password to feed on stdin (`sudo -S`)
    Password(SecretString),
}

impl LaunchCredential {
    pub fn needs_credential(&self) -> bool {
        matches!(self, LaunchCredential::Password(_))
    }

    /// Bytes written to the escalation program's stdin, if any
    pub(crate) fn stdin_payload(&self) -> Option<Vec<u8>> {
        match self {
            LaunchCredential::Passwordless => None,
            LaunchCredential::Password(secret) => {
                let mut line = secret.expose_secret().as_bytes().to_vec();
                line.push(b'\n');
                Some(line)
            }
        }
    }
}

/// Decides the credential strategy for an escalated command
#[async_trait]
pub trait PrivilegeProbe: Send + Sync {
    async fn credential(&self) -> Result<LaunchCredential, PrivilegeError>;
}

/// Probes `<program> -n true`, falling back to a password from the environment
#[derive(Debug, Clone)]
pub struct SudoProbe {
    program: String,
    credential_env: String,
}

impl SudoProbe {
    pub fn new(program: impl Into<String>, credential_env: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            credential_env: credential_env.into(),
        }
    }

    /// Run the no-op privileged command; true if it succeeded without a prompt
    async fn passwordless(&self) -> Result<bool, PrivilegeError> {
        let status = Command::new(&self.program)
            .args(["-n", "true"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(PrivilegeError::Probe)?;

        Ok(status.success())
    }

    fn credential_from_env(&self) -> Option<SecretString> {
        std::env::var(&self.credential_env)
            .ok()
            .filter(|v| !v.is_empty())
            .map(SecretString::from)
    }
}

impl Default for SudoProbe {
    fn default() -> Self {
        Self::new("sudo", "SUDO_PASSWORD")
    }
}

#[async_trait]
impl PrivilegeProbe for SudoProbe {
    async fn credential(&self) -> Result<LaunchCredential, PrivilegeError> {
        if self.passwordless().await? {
            debug!("Passwordless escalation available via {}", self.program);
            return Ok(LaunchCredential::Passwordless);
        }

        match self.credential_from_env() {
            Some(secret) => {
                debug!("Using escalation password from ${}", self.credential_env);
                Ok(LaunchCredential::Password(secret))
            }
            None => Err(PrivilegeError::MissingCredential {
                var: self.credential_env.clone(),
            }),
        }
    }
}

/// Always passwordless; for supervisors that already run privileged
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEscalation;

#[async_trait]
impl PrivilegeProbe for NoEscalation {
    async fn credential(&self) -> Result<LaunchCredential, PrivilegeError> {
        Ok(LaunchCredential::Passwordless)
    }
}
