//! ovpnctl core - supervision of a single privileged OpenVPN client process
//!
//! The supervisor launches the tunnel program through `sudo`, waits for the
//! program's route-up hook to report readiness (bounded by a timeout and an
//! optional cancellation token), records the process in a pid file so later
//! invocations can find it, and stops it with an escalating SIGTERM/SIGKILL
//! sequence.
//!
//! # Quick Start
//!
//! ```ignore
//! use ovpnctl_core::{ConnectionConfig, Settings, Supervisor};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let supervisor = Supervisor::from_settings(Settings::default())?;
//! let config = ConnectionConfig::with_timeout_secs("client.ovpn", 10)?;
//!
//! supervisor.connect(&config, None).await?;
//! // ... tunnel is up ...
//! supervisor.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod cleanup;
pub mod config;
pub mod error;
pub mod privilege;
pub mod process;
pub mod readiness;
pub mod registry;
pub mod settings;
pub mod shutdown;
pub mod supervisor;

pub use cleanup::{Artifact, CaptureFiles, CapturedOutput, CleanupReport};
pub use config::ConnectionConfig;
pub use error::{
    CleanupError, ConnectError, DisconnectError, PrivilegeError, ReadinessError, RegistryError,
    ValidationError,
};
pub use privilege::{LaunchCredential, NoEscalation, PrivilegeProbe, SudoProbe};
pub use process::{LaunchSpec, ProcessHost, StopSignal, SystemHost};
pub use readiness::{ReadinessChannel, ReadinessMessage};
pub use registry::{FileRegistry, MemoryRegistry, Registry};
pub use settings::{RuntimePaths, Settings, SettingsManager};
pub use shutdown::{ShutdownPolicy, ShutdownStage};
pub use supervisor::{ConnectionStatus, DisconnectReport, Supervisor, SupervisorBuilder};

pub use tokio_util::sync::CancellationToken;
