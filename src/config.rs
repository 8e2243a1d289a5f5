//! Daemon configuration.
//!
//! The configuration is a single JSON file; every section has sensible
//! defaults so a minimal file only needs the instance credentials.

use std::path::{Path, PathBuf};

use anyhow::{format_err, Error};
use serde::Deserialize;

fn default_true() -> bool {
    true
}

fn default_pool_size() -> usize {
    4
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/proxmox-monitor/monitor.db")
}

fn default_listen_address() -> String {
    "127.0.0.1:8765".to_string()
}

fn default_pve_poll_interval() -> u64 {
    60
}

fn default_disk_poll_interval() -> u64 {
    30 * 60
}

fn default_pbs_poll_interval() -> u64 {
    10 * 60
}

#[derive(Clone, Debug, Deserialize)]
/// One Proxmox VE instance to poll
pub struct PveInstanceConfig {
    /// Unique label for this instance
    pub name: String,
    /// Host (optionally `host:port`, default port 8006)
    pub host: String,
    /// API token id (`user@realm!tokenname`)
    pub token_id: String,
    pub token_secret: String,
    /// Skip TLS certificate verification (logged as a warning on startup)
    #[serde(default)]
    pub insecure_tls: bool,
    /// Main poll interval in seconds
    #[serde(default = "default_pve_poll_interval")]
    pub poll_interval: u64,
    /// Whether this instance is part of a cluster
    #[serde(default)]
    pub cluster: bool,
    /// Interval between SMART polls in seconds (disk probing is expensive)
    #[serde(default = "default_disk_poll_interval")]
    pub disk_poll_interval: u64,
}

#[derive(Clone, Debug, Deserialize)]
/// One Proxmox Backup Server instance to poll
pub struct PbsInstanceConfig {
    pub name: String,
    /// Host (optionally `host:port`, default port 8007)
    pub host: String,
    /// API token id (`user@realm!tokenname`)
    pub token_id: String,
    pub token_secret: String,
    #[serde(default)]
    pub insecure_tls: bool,
    #[serde(default = "default_pbs_poll_interval")]
    pub poll_interval: u64,
    /// Restrict polling to these datastores; unset polls all of them
    #[serde(default)]
    pub datastores: Option<Vec<String>>,
}

#[derive(Clone, Copy, Debug, Deserialize)]
/// Retention periods for the time-series tables, in seconds
pub struct RetentionConfig {
    #[serde(default = "RetentionConfig::default_node_snapshots")]
    pub node_snapshots: i64,
    #[serde(default = "RetentionConfig::default_guest_snapshots")]
    pub guest_snapshots: i64,
    #[serde(default = "RetentionConfig::default_smart_snapshots")]
    pub smart_snapshots: i64,
    #[serde(default = "RetentionConfig::default_backup_snapshots")]
    pub backup_snapshots: i64,
    #[serde(default = "RetentionConfig::default_datastore_snapshots")]
    pub datastore_snapshots: i64,
    #[serde(default = "RetentionConfig::default_alert_log")]
    pub alert_log: i64,
}

impl RetentionConfig {
    fn default_node_snapshots() -> i64 {
        48 * 3600
    }
    fn default_guest_snapshots() -> i64 {
        48 * 3600
    }
    fn default_smart_snapshots() -> i64 {
        30 * 24 * 3600
    }
    fn default_backup_snapshots() -> i64 {
        7 * 24 * 3600
    }
    fn default_datastore_snapshots() -> i64 {
        7 * 24 * 3600
    }
    fn default_alert_log() -> i64 {
        30 * 24 * 3600
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            node_snapshots: Self::default_node_snapshots(),
            guest_snapshots: Self::default_guest_snapshots(),
            smart_snapshots: Self::default_smart_snapshots(),
            backup_snapshots: Self::default_backup_snapshots(),
            datastore_snapshots: Self::default_datastore_snapshots(),
            alert_log: Self::default_alert_log(),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
/// Rule over a numeric value which must hold for `duration` seconds
pub struct ThresholdRule {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Threshold in percent
    pub threshold: f64,
    /// Seconds the condition must hold before firing
    pub duration: i64,
    /// Minimum seconds between notifications per key
    pub cooldown: i64,
}

#[derive(Clone, Copy, Debug, Deserialize)]
/// Boolean rule which must hold for `grace_period` seconds
pub struct GraceRule {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub grace_period: i64,
    pub cooldown: i64,
}

#[derive(Clone, Copy, Debug, Deserialize)]
/// Rule firing once an age exceeds `max_age` seconds
pub struct AgeRule {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub max_age: i64,
    pub cooldown: i64,
}

#[derive(Clone, Copy, Debug, Deserialize)]
/// One-shot rule gated only by its cooldown
pub struct CooldownRule {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub cooldown: i64,
}

#[derive(Clone, Copy, Debug, Deserialize)]
/// One-shot rule over a capacity percentage
pub struct CapacityRule {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Usage threshold in percent
    pub threshold: f64,
    pub cooldown: i64,
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct AlertsConfig {
    /// Seconds between alert evaluation passes
    #[serde(default = "AlertsConfig::default_evaluation_interval")]
    pub evaluation_interval: u64,
    #[serde(default = "AlertsConfig::default_node_cpu_high")]
    pub node_cpu_high: ThresholdRule,
    #[serde(default = "AlertsConfig::default_node_mem_high")]
    pub node_mem_high: ThresholdRule,
    #[serde(default = "AlertsConfig::default_guest_down")]
    pub guest_down: GraceRule,
    #[serde(default = "AlertsConfig::default_backup_stale")]
    pub backup_stale: AgeRule,
    /// Cooldown shared by the smart-failed and scrutiny-warning disk rules
    #[serde(default = "AlertsConfig::default_disk_smart_failed")]
    pub disk_smart_failed: CooldownRule,
    #[serde(default = "AlertsConfig::default_datastore_full")]
    pub datastore_full: CapacityRule,
    #[serde(default = "AlertsConfig::default_datastore_offline")]
    pub datastore_offline: CooldownRule,
}

impl AlertsConfig {
    fn default_evaluation_interval() -> u64 {
        30
    }
    fn default_node_cpu_high() -> ThresholdRule {
        ThresholdRule {
            enabled: true,
            threshold: 90.0,
            duration: 5 * 60,
            cooldown: 3600,
        }
    }
    fn default_node_mem_high() -> ThresholdRule {
        ThresholdRule {
            enabled: true,
            threshold: 90.0,
            duration: 5 * 60,
            cooldown: 3600,
        }
    }
    fn default_guest_down() -> GraceRule {
        GraceRule {
            enabled: true,
            grace_period: 2 * 60,
            cooldown: 3600,
        }
    }
    fn default_backup_stale() -> AgeRule {
        AgeRule {
            enabled: true,
            max_age: 2 * 24 * 3600,
            cooldown: 6 * 3600,
        }
    }
    fn default_disk_smart_failed() -> CooldownRule {
        CooldownRule {
            enabled: true,
            cooldown: 24 * 3600,
        }
    }
    fn default_datastore_full() -> CapacityRule {
        CapacityRule {
            enabled: true,
            threshold: 90.0,
            cooldown: 6 * 3600,
        }
    }
    fn default_datastore_offline() -> CooldownRule {
        CooldownRule {
            enabled: true,
            cooldown: 6 * 3600,
        }
    }
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            evaluation_interval: Self::default_evaluation_interval(),
            node_cpu_high: Self::default_node_cpu_high(),
            node_mem_high: Self::default_node_mem_high(),
            guest_down: Self::default_guest_down(),
            backup_stale: Self::default_backup_stale(),
            disk_smart_failed: Self::default_disk_smart_failed(),
            datastore_full: Self::default_datastore_full(),
            datastore_offline: Self::default_datastore_offline(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
/// One ntfy-compatible notification target
pub struct NtfyTargetConfig {
    /// Server base URL, e.g. `https://ntfy.example.com`
    pub url: String,
    pub topic: String,
    /// Optional access token sent as bearer authorization
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub insecure_tls: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MonitorConfig {
    /// Upper bound on concurrent outbound poll requests
    #[serde(default = "default_pool_size")]
    pub worker_pool_size: usize,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Listen address of the read-only HTTP API
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default)]
    pub pve: Vec<PveInstanceConfig>,
    #[serde(default)]
    pub pbs: Vec<PbsInstanceConfig>,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub notify: Vec<NtfyTargetConfig>,
}

/// Load and deserialize the configuration file.
pub fn load(path: &Path) -> Result<MonitorConfig, Error> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| format_err!("unable to read config file {:?} - {}", path, err))?;
    let config: MonitorConfig = serde_json::from_str(&raw)
        .map_err(|err| format_err!("unable to parse config file {:?} - {}", path, err))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() -> Result<(), Error> {
        let config: MonitorConfig = serde_json::from_str(
            r#"{
                "pve": [
                    {
                        "name": "test-pve",
                        "host": "pve.example.com",
                        "token_id": "monitor@pam!readonly",
                        "token_secret": "secret"
                    }
                ]
            }"#,
        )?;

        assert_eq!(config.worker_pool_size, 4);
        assert_eq!(config.pve.len(), 1);
        assert_eq!(config.pve[0].poll_interval, 60);
        assert_eq!(config.pve[0].disk_poll_interval, 30 * 60);
        assert!(!config.pve[0].cluster);
        assert_eq!(config.alerts.node_cpu_high.threshold, 90.0);
        assert_eq!(config.retention.smart_snapshots, 30 * 24 * 3600);
        Ok(())
    }
}
