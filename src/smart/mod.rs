//! S.M.A.R.T. evaluation engine.
//!
//! Protocol-specific parsers produce a flat attribute list; the bucket
//! engine scores every attribute against empirically derived failure-rate
//! ranges and the disk status is the bitwise OR of all per-attribute
//! results, plus the manufacturer health override.

use pmon_api_types::{Disk, DiskStatus, SmartAttribute};

pub mod ata;
pub mod buckets;
pub mod nvme;
pub mod scsi;

pub use ata::parse_ata_attributes;
pub use nvme::parse_nvme_text;
pub use scsi::parse_scsi_text;

/// SCSI pseudo-attribute ids, outside the ATA range (1-253).
pub const SCSI_TEMPERATURE: i64 = 300;
pub const SCSI_POWER_ON_HOURS: i64 = 301;

/// NVMe pseudo-attribute ids, same convention as the SCSI ones.
pub const NVME_CRITICAL_WARNING: i64 = 401;
pub const NVME_TEMPERATURE: i64 = 402;
pub const NVME_AVAILABLE_SPARE: i64 = 403;
pub const NVME_AVAILABLE_SPARE_THRESHOLD: i64 = 404;
pub const NVME_PERCENTAGE_USED: i64 = 405;
pub const NVME_DATA_UNITS_READ: i64 = 406;
pub const NVME_DATA_UNITS_WRITTEN: i64 = 407;
pub const NVME_POWER_ON_HOURS: i64 = 408;
pub const NVME_MEDIA_ERRORS: i64 = 409;
pub const NVME_ERROR_LOG_ENTRIES: i64 = 410;

/// Critical attributes turn into a failure verdict at this rate.
const CRITICAL_FAIL_RATE: f64 = 0.10;
/// Non-critical attributes warn here ...
const WARN_RATE: f64 = 0.10;
/// ... and fail here.
const FAIL_RATE: f64 = 0.20;

/// Score one attribute, recording the matched bucket's failure rate on it.
fn evaluate_attribute(attribute: &mut SmartAttribute) -> DiskStatus {
    // manufacturer verdict takes precedence over bucket scoring
    if attribute.threshold > 0 && attribute.value <= attribute.threshold {
        return DiskStatus::FAILED_SMART;
    }

    let table = match buckets::bucket_table(attribute.id) {
        Some(table) => table,
        None => return DiskStatus::empty(),
    };

    match table.find(attribute.raw_value) {
        Some(bucket) => {
            attribute.failure_rate = Some(bucket.failure_rate);
            if table.critical {
                if bucket.failure_rate >= CRITICAL_FAIL_RATE {
                    DiskStatus::FAILED_SCRUTINY
                } else {
                    DiskStatus::empty()
                }
            } else if bucket.failure_rate >= FAIL_RATE {
                DiskStatus::FAILED_SCRUTINY
            } else if bucket.failure_rate >= WARN_RATE {
                DiskStatus::WARN_SCRUTINY
            } else {
                DiskStatus::empty()
            }
        }
        // only reachable with a negative raw value
        None => {
            if table.critical {
                DiskStatus::WARN_SCRUTINY
            } else {
                DiskStatus::empty()
            }
        }
    }
}

/// Score all attributes in place and return the ORed status.
pub fn evaluate_attributes(attributes: &mut [SmartAttribute]) -> DiskStatus {
    let mut status = DiskStatus::empty();
    for attribute in attributes.iter_mut() {
        let attribute_status = evaluate_attribute(attribute);
        attribute.status = attribute_status;
        status |= attribute_status;
    }
    status
}

/// Populate the disk scalars derived from its attribute list.
///
/// Temperature falls back through ATA 194, ATA 190, the NVMe and SCSI
/// pseudo ids; power-on hours through ATA 9 and the pseudo ids. NVMe
/// wearout is inferred as `100 - percentage_used` when not already set.
pub fn derive_disk_scalars(disk: &mut Disk) {
    let raw_of = |id: i64| {
        disk.attributes
            .iter()
            .find(|attribute| attribute.id == id)
            .map(|attribute| attribute.raw_value)
    };

    if disk.temperature.is_none() {
        for id in [194, 190, NVME_TEMPERATURE, SCSI_TEMPERATURE] {
            if let Some(value) = raw_of(id) {
                disk.temperature = Some(value);
                break;
            }
        }
    }

    if disk.power_on_hours.is_none() {
        for id in [9, NVME_POWER_ON_HOURS, SCSI_POWER_ON_HOURS] {
            if let Some(value) = raw_of(id) {
                disk.power_on_hours = Some(value);
                break;
            }
        }
    }

    if disk.wearout.is_none() {
        if let Some(used) = raw_of(NVME_PERCENTAGE_USED) {
            if (0..=100).contains(&used) {
                disk.wearout = Some(100.0 - used as f64);
            }
        }
    }
}

/// Full evaluation of a freshly parsed disk: attribute scoring, the
/// manufacturer health override and the derived scalars.
pub fn evaluate_disk(disk: &mut Disk) {
    let mut status = evaluate_attributes(&mut disk.attributes);
    if disk.health.eq_ignore_ascii_case("failed") {
        status |= DiskStatus::FAILED_SMART;
    }
    disk.status = status;
    derive_disk_scalars(disk);
}
