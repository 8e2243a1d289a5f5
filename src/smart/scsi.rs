//! SCSI / SAT text parsing.
//!
//! `smartctl -d scsi` reports far less than ATA; only the drive temperature
//! and the power-on hours are extracted. Both are emitted as pseudo
//! attributes with high-range ids to avoid collision with ATA ids (1-253).

use anyhow::Error;

use pmon_api_types::{leading_decimal, SmartAttribute};

use super::{SCSI_POWER_ON_HOURS, SCSI_TEMPERATURE};

const TEMPERATURE_PREFIX: &str = "Current Drive Temperature:";
const HOURS_POWERED_UP: &str = "number of hours powered up";
const ACCUMULATED_POWER_ON: &str = "hours:minutes";

/// Parse `smartctl -d scsi` output. Lines without a known metric are
/// skipped; an empty result is not an error here since many SCSI drives
/// report neither metric.
pub fn parse_scsi_text(text: &str) -> Result<Vec<SmartAttribute>, Error> {
    let mut attributes = Vec::new();

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix(TEMPERATURE_PREFIX) {
            // "Current Drive Temperature:     34 C"
            let tail = rest.rsplit(':').next().unwrap_or(rest);
            if let Some(value) = leading_decimal(tail) {
                attributes.push(pseudo_attribute(
                    SCSI_TEMPERATURE,
                    "scsi_temperature",
                    value,
                    tail,
                ));
            }
            continue;
        }

        let lower = line.to_lowercase();
        if lower.contains(HOURS_POWERED_UP) {
            // "  number of hours powered up = 34212.50"
            if let Some(rest) = line.split('=').nth(1) {
                if let Some(value) = leading_decimal(rest) {
                    attributes.push(pseudo_attribute(
                        SCSI_POWER_ON_HOURS,
                        "scsi_power_on_hours",
                        value,
                        rest,
                    ));
                }
            }
            continue;
        }

        if lower.contains(ACCUMULATED_POWER_ON) {
            // "Accumulated power on time, hours:minutes 34212:43"
            if let Some(position) = lower.find(ACCUMULATED_POWER_ON) {
                let rest = &line[position + ACCUMULATED_POWER_ON.len()..];
                let hours = rest.trim().split(':').next().unwrap_or("");
                if let Some(value) = leading_decimal(hours) {
                    attributes.push(pseudo_attribute(
                        SCSI_POWER_ON_HOURS,
                        "scsi_power_on_hours",
                        value,
                        rest,
                    ));
                }
            }
        }
    }

    Ok(attributes)
}

fn pseudo_attribute(id: i64, name: &str, raw_value: i64, raw_string: &str) -> SmartAttribute {
    SmartAttribute {
        id,
        name: name.to_string(),
        raw_value,
        raw_string: raw_string.trim().to_string(),
        ..Default::default()
    }
}
