//! Headless notification driver binary.
//!
//! Reads `DriverCommand` JSON lines from stdin and writes worker messages,
//! lifecycle events and phase changes to stdout. All tracing output goes to
//! stderr so that stdout remains a clean JSON channel.
//!
//! Usage: `shelfwatch-notify [CONFIG_PATH]`. Without a path the default
//! config location is used; a missing file means defaults. Set
//! `SHELFWATCH_PERMISSION=denied` to make the simulated prompt refuse.

use shelfwatch::NotifyConfig;
use shelfwatch::driver::run_stdio_driver;
use shelfwatch::permissions::PermissionState;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(NotifyConfig::default_config_path);
    let mut config = NotifyConfig::load_or_default(&config_path)
        .map_err(|e| anyhow::anyhow!("cannot load {}: {e}", config_path.display()))?;
    config.apply_env_overrides();

    let answer = match std::env::var("SHELFWATCH_PERMISSION").as_deref() {
        Ok("denied") => PermissionState::Denied,
        Ok("dismissed") => PermissionState::Unrequested,
        _ => PermissionState::Granted,
    };

    tracing::info!(
        config = %config_path.display(),
        deployment = ?config.worker.deployment,
        "shelfwatch-notify starting"
    );

    run_stdio_driver(config, answer).await.map_err(|e| {
        tracing::error!(error = %e, "shelfwatch-notify exited with error");
        anyhow::anyhow!("shelfwatch-notify failed: {e}")
    })?;

    tracing::info!("shelfwatch-notify shut down cleanly");
    Ok(())
}
