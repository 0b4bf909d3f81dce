//! Application configuration, loaded from a single TOML file passed with
//! `--config <path>`.
//!
//! Every section has complete defaults so a partial file (or none at all,
//! for tests) still yields a usable configuration.

use std::path::Path;

use serde::Deserialize;

use crate::support::errors::ModelError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub csms: CsmsConfig,
    pub model: ModelConfig,
    pub history: HistoryConfig,
    pub api: ApiConfig,
    pub balanz: BalanzConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| ModelError::IllegalArgument(format!("config: {e}")))
    }
}

/// WebSocket endpoint and per-connection policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Seconds between liveness checks on a charger session.
    pub watchdog_interval: u64,
    /// Close the socket when a charger has been silent this long (seconds).
    pub watchdog_stale: i64,
    /// Enable HTTP Basic authentication of chargers.
    pub http_auth: bool,
    /// Delay before provisioning an AuthorizationKey on first contact (seconds).
    pub http_auth_delay: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
            watchdog_interval: 60,
            watchdog_stale: 300,
            http_auth: false,
            http_auth_delay: 30,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Central-system behaviour towards chargers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CsmsConfig {
    /// Heartbeat interval handed to chargers in BootNotification replies.
    pub heartbeat_interval: i64,
    /// Seconds between stale-transaction sweeps.
    pub transaction_interval: u64,
    /// A silent charger older than this has its transactions stopped (seconds).
    pub transaction_timeout: i64,
    /// Allow the same tag to be active on more than one charger.
    pub allow_concurrent_tag: bool,
    /// Reply timeout for outbound OCPP calls (seconds).
    pub call_timeout: u64,
}

impl Default for CsmsConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: 300,
            transaction_interval: 60,
            transaction_timeout: 300,
            allow_concurrent_tag: false,
            call_timeout: 30,
        }
    }
}

/// Entity-store CSV locations and registration policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub groups_csv: Option<String>,
    pub chargers_csv: Option<String>,
    pub tags_csv: Option<String>,
    /// Auto-register unknown chargers into `charger_autoregister_group`.
    pub charger_autoregister: bool,
    pub charger_autoregister_group: String,
    /// Per-connector amp ceiling used when a charger row leaves it blank.
    pub default_conn_max: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            groups_csv: None,
            chargers_csv: None,
            tags_csv: None,
            charger_autoregister: false,
            charger_autoregister_group: "default".to_string(),
            default_conn_max: 32.0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Append-only CSV of completed sessions. Disabled when unset.
    pub session_csv: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// CSV of API users (`user_id,role,auth_sha`). API logins always fail
    /// when unset.
    pub users_csv: Option<String>,
}

/// Knobs of the allocation engine and its control loop. All currents are
/// amps, energies watt-hours and times seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BalanzConfig {
    /// Initial delay before a group loop starts ticking.
    pub first_wait: u64,
    /// Tick interval of the group loop. 0 disables smart charging.
    pub run_interval: u64,
    /// A full (non-urgent) pass happens every this many ticks.
    pub intervals_full: u64,
    pub min_allocation: f64,
    pub max_offer_increase: f64,
    pub min_offer_increase_interval: i64,
    pub usage_monitoring_interval: i64,
    pub margin_lower: f64,
    pub margin_increase: f64,
    pub usage_threshold: f64,
    pub suspended_allocation_timeout: i64,
    pub suspended_delayed_time: i64,
    pub suspended_delayed_time_not_first: i64,
    pub suspend_top_of_hour: bool,
    pub energy_threshold: i64,
    pub wait_after_reduce: u64,
}

impl Default for BalanzConfig {
    fn default() -> Self {
        Self {
            first_wait: 60,
            run_interval: 5,
            intervals_full: 12,
            min_allocation: 6.0,
            max_offer_increase: 6.0,
            min_offer_increase_interval: 180,
            usage_monitoring_interval: 300,
            margin_lower: 0.6,
            margin_increase: 0.6,
            usage_threshold: 2.0,
            suspended_allocation_timeout: 300,
            suspended_delayed_time: 3600,
            suspended_delayed_time_not_first: 3600,
            suspend_top_of_hour: true,
            energy_threshold: 500,
            wait_after_reduce: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_documentation() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.balanz.min_allocation, 6.0);
        assert_eq!(cfg.balanz.max_offer_increase, 6.0);
        assert_eq!(cfg.balanz.min_offer_increase_interval, 180);
        assert_eq!(cfg.balanz.usage_monitoring_interval, 300);
        assert_eq!(cfg.balanz.margin_lower, 0.6);
        assert_eq!(cfg.balanz.usage_threshold, 2.0);
        assert_eq!(cfg.balanz.suspended_allocation_timeout, 300);
        assert_eq!(cfg.balanz.energy_threshold, 500);
        assert_eq!(cfg.balanz.wait_after_reduce, 5);
        assert!(cfg.balanz.suspend_top_of_hour);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [server]
            port = 9443

            [balanz]
            min_allocation = 8.0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 9443);
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.balanz.min_allocation, 8.0);
        assert_eq!(cfg.balanz.intervals_full, 12);
    }
}
