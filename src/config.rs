//! Configuration types for the notification lifecycle subsystem.

use crate::error::{NotifyError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides [`WorkerConfig::deployment`].
pub const DEPLOYMENT_ENV_VAR: &str = "SHELFWATCH_DEPLOYMENT";

/// Top-level notification configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Permission prompt timing and strategy.
    pub permission: PermissionConfig,
    /// Foreground check scheduling.
    pub monitoring: MonitoringConfig,
    /// Periodic background sync registration.
    pub sync: SyncConfig,
    /// Long-lived worker installation.
    pub worker: WorkerConfig,
}

/// How the user is asked for notification permission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptStrategyKind {
    /// Go straight to the platform's native prompt.
    #[default]
    Native,
    /// Show an in-app explanation first; the native prompt follows only if
    /// the user accepts it.
    Modal,
}

/// Worker deployment mode, selected once at process start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    /// Register the worker exactly once.
    #[default]
    Production,
    /// Unregister any worker and purge its caches so live reload always
    /// serves fresh code.
    Development,
}

impl DeploymentMode {
    /// Parse a mode from its config/env spelling.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Some(Self::Production),
            "development" | "dev" => Some(Self::Development),
            _ => None,
        }
    }
}

/// Permission prompt configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    /// Delay between login and the permission prompt, in milliseconds.
    pub prompt_delay_ms: u64,
    /// Which prompt flow to use.
    pub strategy: PromptStrategyKind,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            prompt_delay_ms: 3_000,
            strategy: PromptStrategyKind::default(),
        }
    }
}

/// Foreground check configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Interval between periodic foreground checks, in milliseconds.
    pub check_interval_ms: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 15 * 60 * 1_000,
        }
    }
}

/// Periodic background sync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Registration tag shared with the worker.
    pub tag: String,
    /// Minimum interval the platform should wait between wake-ups.
    pub min_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tag: "inventory-check".to_owned(),
            min_interval_ms: 60 * 60 * 1_000,
        }
    }
}

/// Worker installation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Script the platform installs as the long-lived worker.
    pub script_url: String,
    /// Production or development lifecycle behavior.
    pub deployment: DeploymentMode,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            script_url: "/service-worker.js".to_owned(),
            deployment: DeploymentMode::default(),
        }
    }
}

impl PermissionConfig {
    /// Prompt delay as a [`Duration`].
    #[must_use]
    pub fn prompt_delay(&self) -> Duration {
        Duration::from_millis(self.prompt_delay_ms)
    }
}

impl MonitoringConfig {
    /// Check interval as a [`Duration`]; never zero.
    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }
}

impl SyncConfig {
    /// Minimum periodic-sync interval as a [`Duration`].
    #[must_use]
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

impl NotifyConfig {
    /// Parse configuration from a TOML string, falling back to defaults for
    /// missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid TOML for this schema.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| NotifyError::Config(e.to_string()))
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load configuration from `path`, returning defaults when the file does
    /// not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::from_file(path)
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| NotifyError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply environment overrides (currently [`DEPLOYMENT_ENV_VAR`]).
    ///
    /// An unrecognised value is logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var(DEPLOYMENT_ENV_VAR) {
            self.apply_deployment_override(&raw);
        }
    }

    fn apply_deployment_override(&mut self, raw: &str) {
        match DeploymentMode::parse(raw) {
            Some(mode) => self.worker.deployment = mode,
            None => tracing::warn!(value = raw, "ignoring unknown {DEPLOYMENT_ENV_VAR}"),
        }
    }

    /// Returns the default config file path: `<config dir>/shelfwatch/notify.toml`.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| std::env::temp_dir().join("shelfwatch-config"))
            .join("shelfwatch")
            .join("notify.toml")
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn default_config_matches_documented_values() {
        let config = NotifyConfig::default();
        assert_eq!(config.permission.prompt_delay(), Duration::from_secs(3));
        assert_eq!(config.permission.strategy, PromptStrategyKind::Native);
        assert_eq!(
            config.monitoring.check_interval(),
            Duration::from_secs(15 * 60)
        );
        assert_eq!(config.sync.tag, "inventory-check");
        assert_eq!(config.worker.deployment, DeploymentMode::Production);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = NotifyConfig::from_toml_str(
            r#"
            [permission]
            strategy = "modal"

            [worker]
            deployment = "development"
            "#,
        )
        .unwrap();
        assert_eq!(config.permission.strategy, PromptStrategyKind::Modal);
        assert_eq!(config.permission.prompt_delay_ms, 3_000);
        assert_eq!(config.worker.deployment, DeploymentMode::Development);
        assert_eq!(config.worker.script_url, "/service-worker.js");
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let err = NotifyConfig::from_toml_str("permission = 5").unwrap_err();
        assert!(matches!(err, NotifyError::Config(_)));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("notify.toml");

        let mut config = NotifyConfig::default();
        config.monitoring.check_interval_ms = 42_000;
        config.sync.tag = "stock-levels".to_owned();
        config.save_to_file(&path).unwrap();

        let loaded = NotifyConfig::from_file(&path).unwrap();
        assert_eq!(loaded.monitoring.check_interval_ms, 42_000);
        assert_eq!(loaded.sync.tag, "stock-levels");
    }

    #[test]
    fn load_or_default_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = NotifyConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.sync.tag, "inventory-check");
    }

    #[test]
    fn deployment_override_parses_aliases() {
        let mut config = NotifyConfig::default();
        config.apply_deployment_override("dev");
        assert_eq!(config.worker.deployment, DeploymentMode::Development);
        config.apply_deployment_override("bogus");
        assert_eq!(config.worker.deployment, DeploymentMode::Development);
        config.apply_deployment_override("Production");
        assert_eq!(config.worker.deployment, DeploymentMode::Production);
    }

    #[test]
    fn zero_check_interval_is_clamped() {
        let config = MonitoringConfig {
            check_interval_ms: 0,
        };
        assert_eq!(config.check_interval(), Duration::from_millis(1));
    }
}
