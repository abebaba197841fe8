// SPDX-License-Identifier: MIT
//! Coordinator configuration.
//!
//! Priority: CLI / env var > `{data_dir}/config.toml` > built-in default.
//! Every cadence and threshold the coordination core uses is tunable here;
//! the defaults are the documented canonical values.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::error;

use crate::confirm::ConfirmSchedule;
use crate::scheduler::{
    ChannelSpec, CHANNEL_CONNECTIVITY, CHANNEL_HEARTBEAT, CHANNEL_LOCATION_MONITOR,
    CHANNEL_SESSION_CHECK, CHANNEL_WATCHDOG,
};
use crate::session::SessionTuning;
use crate::sync::SyncTuning;

const DEFAULT_API_BASE_URL: &str = "https://api.fieldtrack.example";

// ─── ChannelsConfig ──────────────────────────────────────────────────────────

/// Periodic channel cadences (`[channels]` in config.toml), in seconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelsConfig {
    /// Session verification cadence. Default: 10.
    pub session_check_secs: u64,
    /// Server heartbeat cadence. Default: 60.
    pub heartbeat_secs: u64,
    /// Consistency audit cadence. Default: 60.
    pub watchdog_secs: u64,
    /// Connectivity probe cadence. Default: 10.
    pub connectivity_poll_secs: u64,
    /// Location observation cadence; also drives the stale-instance guard.
    /// Default: 5.
    pub location_monitor_secs: u64,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            session_check_secs: 10,
            heartbeat_secs: 60,
            watchdog_secs: 60,
            connectivity_poll_secs: 10,
            location_monitor_secs: 5,
        }
    }
}

impl ChannelsConfig {
    pub fn to_specs(&self) -> Vec<ChannelSpec> {
        vec![
            ChannelSpec::new(CHANNEL_SESSION_CHECK, Duration::from_secs(self.session_check_secs)),
            ChannelSpec::new(CHANNEL_HEARTBEAT, Duration::from_secs(self.heartbeat_secs)),
            ChannelSpec::new(CHANNEL_WATCHDOG, Duration::from_secs(self.watchdog_secs)),
            ChannelSpec::new(
                CHANNEL_CONNECTIVITY,
                Duration::from_secs(self.connectivity_poll_secs),
            ),
            ChannelSpec::new(
                CHANNEL_LOCATION_MONITOR,
                Duration::from_secs(self.location_monitor_secs),
            ),
        ]
    }
}

// ─── SyncConfig ──────────────────────────────────────────────────────────────

/// Adaptive sync tuning (`[sync]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Speeds below this (m/s) classify as stationary. Default: 0.5.
    pub stationary_below_mps: f64,
    /// Speeds at or above this (m/s) classify as fast. Default: 2.0.
    pub fast_at_or_above_mps: f64,
    /// Send interval while stationary, seconds. Default: 30.
    pub stationary_interval_secs: u64,
    /// Send interval while moving, seconds. Default: 15.
    pub moving_interval_secs: u64,
    /// Send interval while fast, seconds. Default: 5.
    pub fast_interval_secs: u64,
    /// Positional deltas under this (m) may be filtered. Default: 5.0.
    pub skip_distance_m: f64,
    /// Positional deltas at or above this (m) always send. Default: 10.0.
    pub force_distance_m: f64,
    /// Maximum silence before a reading is always sent, seconds. Default: 60.
    pub max_quiet_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let t = SyncTuning::default();
        Self {
            stationary_below_mps: t.stationary_below_mps,
            fast_at_or_above_mps: t.fast_at_or_above_mps,
            stationary_interval_secs: t.stationary_interval.as_secs(),
            moving_interval_secs: t.moving_interval.as_secs(),
            fast_interval_secs: t.fast_interval.as_secs(),
            skip_distance_m: t.skip_distance_m,
            force_distance_m: t.force_distance_m,
            max_quiet_secs: t.max_quiet.as_secs(),
        }
    }
}

impl SyncConfig {
    pub fn to_tuning(&self) -> SyncTuning {
        SyncTuning {
            stationary_below_mps: self.stationary_below_mps,
            fast_at_or_above_mps: self.fast_at_or_above_mps,
            stationary_interval: Duration::from_secs(self.stationary_interval_secs),
            moving_interval: Duration::from_secs(self.moving_interval_secs),
            fast_interval: Duration::from_secs(self.fast_interval_secs),
            skip_distance_m: self.skip_distance_m,
            force_distance_m: self.force_distance_m,
            max_quiet: Duration::from_secs(self.max_quiet_secs),
        }
    }
}

// ─── SessionConfig ───────────────────────────────────────────────────────────

/// Session verification tuning (`[session]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Re-check delays after a not-logged-in response, seconds. Default: [3, 6].
    pub loss_confirm_delays_secs: Vec<u64>,
    /// Re-check delays after an unauthorized response, seconds. Default: [2, 4, 8].
    pub auth_retry_delays_secs: Vec<u64>,
    /// Consecutive soft failures before a user-visible warning. Default: 3.
    pub soft_failure_threshold: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            loss_confirm_delays_secs: vec![3, 6],
            auth_retry_delays_secs: vec![2, 4, 8],
            soft_failure_threshold: 3,
        }
    }
}

impl SessionConfig {
    pub fn to_tuning(&self) -> SessionTuning {
        SessionTuning {
            loss_confirm: ConfirmSchedule::from_secs(&self.loss_confirm_delays_secs),
            auth_confirm: ConfirmSchedule::from_secs(&self.auth_retry_delays_secs),
            soft_failure_threshold: self.soft_failure_threshold,
        }
    }
}

// ─── GuardConfig ─────────────────────────────────────────────────────────────

/// Stale-instance guard tuning (`[guard]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Auto-expiry window for the permanent-disable flag, seconds.
    /// Default: 600.
    pub permanent_disable_expiry_secs: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            permanent_disable_expiry_secs: 600,
        }
    }
}

// ─── LogoutConfig ────────────────────────────────────────────────────────────

/// Logout orchestration tuning (`[logout]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogoutConfig {
    /// Bound on the phase-1 server notification, seconds. Default: 10.
    pub server_notify_timeout_secs: u64,
}

impl Default for LogoutConfig {
    fn default() -> Self {
        Self {
            server_notify_timeout_secs: 10,
        }
    }
}

// ─── TOML config file ────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// Log level filter string, e.g. "debug", "info,trakd=trace".
    log: Option<String>,
    /// Log output format: "pretty" (default) | "json".
    log_format: Option<String>,
    /// Override the remote service base URL.
    api_base_url: Option<String>,
    /// Channel cadences (`[channels]`).
    channels: Option<ChannelsConfig>,
    /// Adaptive sync tuning (`[sync]`).
    sync: Option<SyncConfig>,
    /// Session verification tuning (`[session]`).
    session: Option<SessionConfig>,
    /// Stale-instance guard tuning (`[guard]`).
    guard: Option<GuardConfig>,
    /// Logout tuning (`[logout]`).
    logout: Option<LogoutConfig>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── CoordinatorConfig ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub data_dir: PathBuf,
    pub log: String,
    /// "pretty" (default) | "json".
    pub log_format: String,
    /// Remote service base URL (TRAKD_API_URL env var).
    pub api_base_url: String,
    pub channels: ChannelsConfig,
    pub sync: SyncConfig,
    pub session: SessionConfig,
    pub guard: GuardConfig,
    pub logout: LogoutConfig,
}

impl CoordinatorConfig {
    /// Build config from CLI/env args + optional TOML file.
    pub fn new(
        data_dir: Option<PathBuf>,
        log: Option<String>,
        api_base_url: Option<String>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);

        // Load TOML as the lowest-priority override layer.
        let toml = load_toml(&data_dir).unwrap_or_default();

        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());

        let log_format = std::env::var("TRAKD_LOG_FORMAT")
            .ok()
            .filter(|s| !s.is_empty())
            .or(toml.log_format)
            .unwrap_or_else(|| "pretty".to_string());

        let api_base_url = api_base_url
            .or(std::env::var("TRAKD_API_URL").ok().filter(|s| !s.is_empty()))
            .or(toml.api_base_url)
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());

        Self {
            data_dir,
            log,
            log_format,
            api_base_url,
            channels: toml.channels.unwrap_or_default(),
            sync: toml.sync.unwrap_or_default(),
            session: toml.session.unwrap_or_default(),
            guard: toml.guard.unwrap_or_default(),
            logout: toml.logout.unwrap_or_default(),
        }
    }

    pub fn permanent_disable_expiry(&self) -> Duration {
        Duration::from_secs(self.guard.permanent_disable_expiry_secs)
    }

    pub fn server_notify_timeout(&self) -> Duration {
        Duration::from_secs(self.logout.server_notify_timeout_secs)
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        // ~/Library/Application Support/trakd
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("trakd");
        }
    }
    #[cfg(target_os = "linux")]
    {
        // $XDG_DATA_HOME/trakd or ~/.local/share/trakd
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("trakd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("trakd");
        }
    }
    #[cfg(target_os = "windows")]
    {
        // %APPDATA%\trakd
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("trakd");
        }
    }
    // Fallback
    PathBuf::from(".trakd")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_cadences() {
        let cfg = CoordinatorConfig::new(Some(PathBuf::from("/nonexistent")), None, None);
        assert_eq!(cfg.channels.session_check_secs, 10);
        assert_eq!(cfg.channels.heartbeat_secs, 60);
        assert_eq!(cfg.channels.watchdog_secs, 60);
        assert_eq!(cfg.channels.connectivity_poll_secs, 10);
        assert_eq!(cfg.channels.location_monitor_secs, 5);
        assert_eq!(cfg.sync.stationary_interval_secs, 30);
        assert_eq!(cfg.sync.moving_interval_secs, 15);
        assert_eq!(cfg.sync.fast_interval_secs, 5);
        assert_eq!(cfg.session.soft_failure_threshold, 3);
        assert_eq!(cfg.guard.permanent_disable_expiry_secs, 600);
        assert_eq!(cfg.logout.server_notify_timeout_secs, 10);
    }

    #[test]
    fn toml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            r#"
log = "debug"
api_base_url = "https://staging.fieldtrack.example"

[channels]
session_check_secs = 3

[sync]
fast_interval_secs = 2

[session]
loss_confirm_delays_secs = [1]
"#,
        )
        .unwrap();

        let cfg = CoordinatorConfig::new(Some(dir.path().to_path_buf()), None, None);
        assert_eq!(cfg.log, "debug");
        assert_eq!(cfg.api_base_url, "https://staging.fieldtrack.example");
        assert_eq!(cfg.channels.session_check_secs, 3);
        // Unset fields in an overridden section fall back to defaults.
        assert_eq!(cfg.channels.heartbeat_secs, 60);
        assert_eq!(cfg.sync.fast_interval_secs, 2);
        assert_eq!(cfg.session.to_tuning().loss_confirm.attempts(), 2);
    }

    #[test]
    fn cli_beats_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "log = \"debug\"\n").unwrap();
        let cfg = CoordinatorConfig::new(
            Some(dir.path().to_path_buf()),
            Some("warn".to_string()),
            Some("https://cli.fieldtrack.example".to_string()),
        );
        assert_eq!(cfg.log, "warn");
        assert_eq!(cfg.api_base_url, "https://cli.fieldtrack.example");
    }

    #[test]
    fn channel_specs_cover_all_five_channels() {
        let specs = ChannelsConfig::default().to_specs();
        assert_eq!(specs.len(), 5);
        assert!(specs.iter().any(|s| s.name == "session-check"));
        assert!(specs.iter().any(|s| s.name == "location-monitor"));
    }
}
