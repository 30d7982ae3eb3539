//! Subcommand handlers

use anyhow::{Context, Result};
use ovpnctl_core::{
    CancellationToken, ConnectionConfig, ReadinessChannel, Settings, SettingsManager, Supervisor,
};
use std::path::{Path, PathBuf};
use tracing::info;

/// Command-line overrides applied on top of the settings file
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub runtime_dir: Option<PathBuf>,
    pub credential_env: Option<String>,
}

/// Load settings from `~/.ovpnctl/config.json` and apply `overrides`
pub fn load_settings(overrides: &Overrides) -> Result<Settings> {
    let mut settings = SettingsManager::load()?;

    if let Some(dir) = &overrides.runtime_dir {
        settings.runtime_dir = Some(dir.clone());
    }
    if let Some(var) = &overrides.credential_env {
        settings.credential_env = var.clone();
    }

    Ok(settings)
}

/// Connect using `config`; Ctrl-C cancels the attempt
pub async fn connect(settings: Settings, config: &Path, timeout_secs: u64) -> Result<()> {
    let config = ConnectionConfig::with_timeout_secs(config, timeout_secs)
        .context("Invalid connection settings")?;
    let supervisor = Supervisor::from_settings(settings)?;

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Cancelling connection attempt...");
            cancel.cancel();
        })
    };

    info!(
        "Connecting with {} (timeout {}s)",
        config.config_file().display(),
        timeout_secs
    );
    let result = supervisor.connect(&config, Some(cancel)).await;
    ctrl_c.abort();
    result?;

    println!("✅ Connected");
    Ok(())
}

/// Stop the registered tunnel process
pub async fn disconnect(settings: Settings) -> Result<()> {
    // disconnect never launches the tunnel program, so skip the PATH lookup
    let openvpn = settings.openvpn_binary.clone();
    let supervisor = Supervisor::builder(settings)
        .openvpn_program(openvpn)
        .build()?;
    let report = supervisor.disconnect().await?;

    println!("✅ Disconnected (pid {})", report.pid);
    Ok(())
}

/// Report readiness for `attempt`; runs as the tunnel program's route-up hook
/// and prints nothing on success
pub async fn notify_ready(socket: &Path, attempt: &str) -> Result<()> {
    ReadinessChannel::notify(socket, attempt)
        .await
        .with_context(|| format!("Failed to signal readiness on {}", socket.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ovpnctl_core::ReadinessError;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_notify_ready_reaches_listener() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("ready.sock");
        let channel = ReadinessChannel::bind(&socket, "abc").await.unwrap();

        notify_ready(&socket, "abc").await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), channel.wait())
            .await
            .expect("readiness should arrive")
            .unwrap();
    }

    #[tokio::test]
    async fn test_notify_ready_without_listener() {
        let temp = TempDir::new().unwrap();
        let err = notify_ready(&temp.path().join("missing.sock"), "abc")
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<ReadinessError>().is_some());
    }

    #[tokio::test]
    async fn test_connect_rejects_zero_timeout() {
        let temp = TempDir::new().unwrap();
        let config = temp.path().join("client.ovpn");
        std::fs::write(&config, "client\n").unwrap();

        let err = connect(Settings::default(), &config, 0).await.unwrap_err();
        assert_eq!(crate::exit_code::for_error(&err), 2);
    }

    #[tokio::test]
    async fn test_connect_rejects_missing_config() {
        let temp = TempDir::new().unwrap();
        let err = connect(Settings::default(), &temp.path().join("nope.ovpn"), 10)
            .await
            .unwrap_err();
        assert_eq!(crate::exit_code::for_error(&err), 2);
    }
}
