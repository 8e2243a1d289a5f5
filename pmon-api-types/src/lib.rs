//! API and domain types shared between the monitor daemon, the store and
//! the HTTP adapters.

use std::collections::HashMap;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use serde_json::Value;

bitflags! {
    /// Health state of a disk, ORed together from per-attribute evaluations.
    ///
    /// An empty set means the disk passed all checks.
    pub struct DiskStatus: u32 {
        /// Manufacturer SMART health reports the drive as failing.
        const FAILED_SMART = 0x0000_0001;

        /// Bucket-derived elevated failure risk.
        const WARN_SCRUTINY = 0x0000_0002;

        /// Bucket-derived high failure probability.
        const FAILED_SCRUTINY = 0x0000_0004;

        /// Drive disappeared or was unreachable.
        const UNKNOWN = 0x0000_0008;

        /// Parse or API error during the last poll.
        const INTERNAL_ERROR = 0x0000_0010;
    }
}

impl DiskStatus {
    /// Passed - no issues detected.
    pub fn passed() -> Self {
        DiskStatus::empty()
    }

    pub fn is_passed(self) -> bool {
        self.is_empty()
    }
}

impl Default for DiskStatus {
    fn default() -> Self {
        DiskStatus::empty()
    }
}

impl Serialize for DiskStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

impl<'de> Deserialize<'de> for DiskStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u32::deserialize(deserializer)?;
        DiskStatus::from_bits(bits)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid disk status bits {}", bits)))
    }
}

/// Upstream in-band sentinels which have to be treated as "not set".
const SENTINELS: &[&str] = &["unknown", "none", "-"];

/// Map upstream sentinel strings (`unknown`, `none`, `-`) and whitespace to
/// the empty string. The domain model never carries these values.
pub fn normalize_sentinel(value: &str) -> &str {
    let value = value.trim();
    for sentinel in SENTINELS {
        if value.eq_ignore_ascii_case(sentinel) {
            return "";
        }
    }
    value
}

/// Choose the stable identity of a disk.
///
/// Fallback chain is WWN, then serial, then device path, each normalized
/// against the upstream sentinels first. Returns the empty string only if
/// all three are sentinels.
pub fn disk_identity(wwn: &str, serial: &str, devpath: &str) -> String {
    for candidate in [wwn, serial, devpath] {
        let candidate = normalize_sentinel(candidate);
        if !candidate.is_empty() {
            return candidate.to_string();
        }
    }
    String::new()
}

/// Decode a JSON value that may arrive as a number or as a numeric string.
///
/// PVE switches between the two for fields like `loadavg` and `wearout`.
pub fn number_or_string_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Extract the leading decimal integer of a string, skipping commas inside
/// the digit run (`"1,234 (Min/Max 25/55)"` yields 1234).
pub fn leading_decimal(text: &str) -> Option<i64> {
    let text = text.trim_start();
    let mut digits = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
        } else if c == ',' && !digits.is_empty() {
            continue;
        } else {
            break;
        }
    }
    if digits.is_empty() {
        return None;
    }
    digits.parse::<i64>().ok()
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
/// CPU model information of a node
pub struct CpuInfo {
    /// CPU model name
    pub model: String,
    /// Cores per socket times sockets
    pub cores: u32,
    /// Threads (logical CPUs)
    pub threads: u32,
    /// Physical sockets
    pub sockets: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
/// Used/total byte counters
pub struct UsageCounters {
    pub used: u64,
    pub total: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
/// State of one PVE node as of the latest poll
pub struct Node {
    /// Configured PVE instance this node belongs to
    pub instance: String,
    /// Node name as reported by the cluster
    pub name: String,
    /// `online` or `offline`
    pub status: String,
    /// CPU usage fraction (0-1)
    pub cpu: f64,
    pub cpu_info: CpuInfo,
    pub memory: UsageCounters,
    pub swap: UsageCounters,
    pub rootfs: UsageCounters,
    /// 1/5/15 minute load averages
    pub loadavg: [f64; 3],
    /// Uptime in seconds
    pub uptime: u64,
    /// IO wait fraction
    pub wait: f64,
    /// Degrees celsius, when a temperature prober supplied one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Guest virtualization type
pub enum GuestKind {
    Lxc,
    Qemu,
}

impl std::fmt::Display for GuestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            GuestKind::Lxc => write!(f, "lxc"),
            GuestKind::Qemu => write!(f, "qemu"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
/// State of one guest (container or VM) as of the latest poll
pub struct Guest {
    pub instance: String,
    /// Node currently hosting the guest
    pub node: String,
    /// Cluster name for clustered PVE, instance name for standalone
    pub cluster_id: String,
    #[serde(rename = "type")]
    pub kind: GuestKind,
    pub vmid: u64,
    pub name: String,
    /// `running`, `stopped` or `paused`
    pub status: String,
    /// CPU usage fraction (0-1)
    pub cpu: f64,
    /// Configured CPU count
    pub cpus: u64,
    pub mem: u64,
    pub maxmem: u64,
    pub disk: u64,
    pub maxdisk: u64,
    pub netin: u64,
    pub netout: u64,
    pub uptime: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Physical disk type
pub enum DiskType {
    Hdd,
    Ssd,
    Nvme,
    Unknown,
}

impl Default for DiskType {
    fn default() -> Self {
        DiskType::Unknown
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// SMART reporting protocol of a disk
pub enum DiskProtocol {
    Ata,
    Nvme,
    Scsi,
}

impl Default for DiskProtocol {
    fn default() -> Self {
        DiskProtocol::Ata
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
/// One SMART attribute with its bucket evaluation
pub struct SmartAttribute {
    /// Attribute ID (1-253 for ATA, 300+ for SCSI/NVMe pseudo attributes)
    pub id: i64,
    pub name: String,
    /// Normalized value
    pub value: i64,
    /// Worst normalized value seen
    pub worst: i64,
    /// Manufacturer failure threshold
    pub threshold: i64,
    /// Leading integer of the raw value
    pub raw_value: i64,
    /// Raw value as reported, annotations preserved
    pub raw_string: String,
    /// Evaluation result for this attribute
    pub status: DiskStatus,
    /// Annual failure rate of the matched bucket
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_rate: Option<f64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
/// State of one physical disk as of the latest SMART poll
pub struct Disk {
    /// Stable identity (WWN, serial or device path)
    pub identity: String,
    pub instance: String,
    pub node: String,
    pub devpath: String,
    pub model: String,
    pub serial: String,
    pub wwn: String,
    #[serde(rename = "type")]
    pub disk_type: DiskType,
    pub protocol: DiskProtocol,
    pub size: u64,
    /// Manufacturer health string (`PASSED`, `FAILED`, ...)
    pub health: String,
    /// ORed evaluation of all attributes
    pub status: DiskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_on_hours: Option<i64>,
    /// Remaining endurance percentage (0-100)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wearout: Option<f64>,
    pub attributes: Vec<SmartAttribute>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// PBS backup type
pub enum BackupType {
    Ct,
    Vm,
    Host,
}

impl std::fmt::Display for BackupType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            BackupType::Ct => write!(f, "ct"),
            BackupType::Vm => write!(f, "vm"),
            BackupType::Host => write!(f, "host"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
/// Latest backup of one group on a PBS instance
pub struct Backup {
    pub pbs_instance: String,
    pub datastore: String,
    pub backup_type: BackupType,
    pub backup_id: String,
    /// Unix epoch of the newest snapshot in the group
    pub backup_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Verification state of the newest snapshot, unset when never verified
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
/// Capacity status of one PBS datastore
pub struct DatastoreStatus {
    pub pbs_instance: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avail: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deduplication_factor: Option<f64>,
    /// Set when the datastore reports an error condition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
/// One PBS worker task
pub struct PbsTask {
    pub upid: String,
    /// Normalized worker type (`backup`, `verify`, `prune`, `gc`, ...)
    pub worker_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub starttime: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endtime: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub user: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Alert severity
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
/// One alert notification as handed to the notification providers
pub struct Notification {
    /// Rule name, e.g. `node_cpu_high`
    pub alert_type: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    /// Source instance the alert refers to
    pub instance: String,
    /// Affected entity (node name, vmid, disk identity, ...)
    pub subject: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved: Option<bool>,
    /// Observed values for downstream rendering
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}
