//! NVMe health log parsing from free-form smartctl text.

use anyhow::{bail, Error};

use pmon_api_types::SmartAttribute;

use super::{
    NVME_AVAILABLE_SPARE, NVME_AVAILABLE_SPARE_THRESHOLD, NVME_CRITICAL_WARNING,
    NVME_DATA_UNITS_READ, NVME_DATA_UNITS_WRITTEN, NVME_ERROR_LOG_ENTRIES, NVME_MEDIA_ERRORS,
    NVME_PERCENTAGE_USED, NVME_POWER_ON_HOURS, NVME_TEMPERATURE,
};

/// Recognized NVMe health-log fields, matched case-insensitively against
/// the text left of the first colon.
const NVME_FIELDS: &[(&str, &str, i64)] = &[
    ("critical warning", "critical_warning", NVME_CRITICAL_WARNING),
    ("temperature", "temperature", NVME_TEMPERATURE),
    ("available spare", "available_spare", NVME_AVAILABLE_SPARE),
    (
        "available spare threshold",
        "available_spare_threshold",
        NVME_AVAILABLE_SPARE_THRESHOLD,
    ),
    ("percentage used", "percentage_used", NVME_PERCENTAGE_USED),
    ("data units read", "data_units_read", NVME_DATA_UNITS_READ),
    (
        "data units written",
        "data_units_written",
        NVME_DATA_UNITS_WRITTEN,
    ),
    ("power on hours", "power_on_hours", NVME_POWER_ON_HOURS),
    (
        "media and data integrity errors",
        "media_errors",
        NVME_MEDIA_ERRORS,
    ),
    (
        "error information log entries",
        "error_log_entries",
        NVME_ERROR_LOG_ENTRIES,
    ),
];

/// Parse `smartctl` NVMe health output line by line.
///
/// Unrecognized lines are skipped; not finding a single known field is an
/// error (the text was not an NVMe health log).
pub fn parse_nvme_text(text: &str) -> Result<Vec<SmartAttribute>, Error> {
    let mut attributes = Vec::new();

    for line in text.lines() {
        let (left, right) = match line.split_once(':') {
            Some(parts) => parts,
            None => continue,
        };

        let key = left.trim().to_lowercase();
        let field = match NVME_FIELDS.iter().find(|(name, _, _)| *name == key) {
            Some(field) => field,
            None => continue,
        };

        let raw_string = right.trim().to_string();
        let raw_value = match parse_numeric(&raw_string) {
            Some(value) => value,
            None => continue,
        };

        attributes.push(SmartAttribute {
            id: field.2,
            name: field.1.to_string(),
            raw_value,
            raw_string,
            ..Default::default()
        });
    }

    if attributes.is_empty() {
        bail!("no recognizable NVMe health fields in smartctl output");
    }

    Ok(attributes)
}

/// `0x`-prefixed values parse as hex; everything else as the leading
/// decimal digit run with commas stripped.
fn parse_numeric(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        let digits: String = hex.chars().take_while(|c| c.is_ascii_hexdigit()).collect();
        if digits.is_empty() {
            return None;
        }
        return i64::from_str_radix(&digits, 16).ok();
    }
    pmon_api_types::leading_decimal(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
SMART/Health Information (NVMe Log 0x02)
Critical Warning:                   0x00
Temperature:                        36 Celsius
Available Spare:                    100%
Available Spare Threshold:          10%
Percentage Used:                    3%
Data Units Read:                    5,360,633 [2.74 TB]
Data Units Written:                 7,479,956 [3.82 TB]
Power Cycles:                       122
Power On Hours:                     3,737
Unsafe Shutdowns:                   19
Media and Data Integrity Errors:    0
Error Information Log Entries:      0
";

    #[test]
    fn test_parse_health_log() -> Result<(), Error> {
        let attributes = parse_nvme_text(SAMPLE)?;

        let find = |id: i64| attributes.iter().find(|a| a.id == id).unwrap();

        assert_eq!(find(NVME_CRITICAL_WARNING).raw_value, 0);
        assert_eq!(find(NVME_TEMPERATURE).raw_value, 36);
        assert_eq!(find(NVME_PERCENTAGE_USED).raw_value, 3);
        assert_eq!(find(NVME_DATA_UNITS_READ).raw_value, 5_360_633);
        assert_eq!(find(NVME_POWER_ON_HOURS).raw_value, 3737);
        assert_eq!(find(NVME_POWER_ON_HOURS).raw_string, "3,737");

        // "Power Cycles" and "Unsafe Shutdowns" are not in the vocabulary
        assert_eq!(attributes.len(), 10);
        Ok(())
    }

    #[test]
    fn test_hex_values() -> Result<(), Error> {
        let attributes = parse_nvme_text("Critical Warning: 0x04\n")?;
        assert_eq!(attributes[0].raw_value, 4);

        let attributes = parse_nvme_text("Critical Warning: 0x1F\n")?;
        assert_eq!(attributes[0].raw_value, 31);
        Ok(())
    }

    #[test]
    fn test_empty_is_error() {
        assert!(parse_nvme_text("").is_err());
        assert!(parse_nvme_text("SMART overall-health: PASSED\n").is_err());
    }
}
