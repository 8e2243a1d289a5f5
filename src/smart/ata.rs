//! ATA attribute table parsing.

use anyhow::{format_err, Error};
use serde_json::Value;

use pmon_api_types::{leading_decimal, SmartAttribute};

/// Parse the structured attribute table of an ATA (or SAT) smartctl report.
///
/// A single bad entry fails the whole parse; callers may log and continue
/// with the disk marked as having an internal error.
pub fn parse_ata_attributes(entries: &[Value]) -> Result<Vec<SmartAttribute>, Error> {
    let mut attributes = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let attribute = parse_entry(entry)
            .map_err(|err| format_err!("ATA attribute entry {} - {}", index, err))?;
        attributes.push(attribute);
    }
    Ok(attributes)
}

fn parse_entry(entry: &Value) -> Result<SmartAttribute, Error> {
    let id = entry["id"]
        .as_i64()
        .ok_or_else(|| format_err!("missing or non-numeric attribute id"))?;

    let name = entry["name"].as_str().unwrap_or("").to_string();
    let value = entry["value"].as_i64().unwrap_or(0);
    let worst = entry["worst"].as_i64().unwrap_or(0);
    let threshold = entry["threshold"].as_i64().unwrap_or(0);

    let (raw_value, raw_string) = parse_raw(&entry["raw"]);

    Ok(SmartAttribute {
        id,
        name,
        value,
        worst,
        threshold,
        raw_value,
        raw_string,
        ..Default::default()
    })
}

/// The `raw` field arrives as a string (possibly with a trailing annotation
/// like `"40 (Min/Max 25/55)"`), an integer, a float, or null. The leading
/// decimal integer becomes the raw value, the original form is preserved
/// for display.
fn parse_raw(raw: &Value) -> (i64, String) {
    match raw {
        Value::String(text) => (leading_decimal(text).unwrap_or(0), text.clone()),
        Value::Number(number) => {
            if let Some(value) = number.as_i64() {
                (value, number.to_string())
            } else if let Some(value) = number.as_f64() {
                (value.trunc() as i64, number.to_string())
            } else {
                (0, number.to_string())
            }
        }
        Value::Null => (0, String::new()),
        other => (0, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_parse_shapes() -> Result<(), Error> {
        let entries = vec![
            json!({"id": 5, "name": "Reallocated_Sector_Ct", "value": 100, "worst": 100, "threshold": 10, "raw": "0"}),
            json!({"id": 194, "name": "Temperature_Celsius", "value": 64, "worst": 45, "threshold": 0, "raw": "36 (Min/Max 25/55)"}),
            json!({"id": 9, "name": "Power_On_Hours", "value": 80, "worst": 80, "threshold": 0, "raw": 17482}),
            json!({"id": 190, "name": "Airflow_Temperature_Cel", "value": 60, "worst": 50, "threshold": 45, "raw": 40.0}),
            json!({"id": 199, "name": "UDMA_CRC_Error_Count", "value": 200, "worst": 200, "threshold": 0, "raw": null}),
        ];

        let attributes = parse_ata_attributes(&entries)?;
        assert_eq!(attributes.len(), 5);

        assert_eq!(attributes[0].id, 5);
        assert_eq!(attributes[0].raw_value, 0);
        assert_eq!(attributes[0].raw_string, "0");

        assert_eq!(attributes[1].raw_value, 36);
        assert_eq!(attributes[1].raw_string, "36 (Min/Max 25/55)");

        assert_eq!(attributes[2].raw_value, 17482);
        assert_eq!(attributes[3].raw_value, 40);

        assert_eq!(attributes[4].raw_value, 0);
        assert_eq!(attributes[4].raw_string, "");
        Ok(())
    }

    #[test]
    fn test_bad_id_fails_parse() {
        let entries = vec![
            json!({"id": 5, "value": 100, "worst": 100, "threshold": 10, "raw": "0"}),
            json!({"id": "bogus", "value": 100, "worst": 100, "threshold": 0, "raw": "0"}),
        ];
        let err = parse_ata_attributes(&entries).unwrap_err();
        assert!(err.to_string().contains("entry 1"));

        let entries = vec![json!({"value": 100, "worst": 100, "threshold": 0, "raw": "0"})];
        assert!(parse_ata_attributes(&entries).is_err());
    }
}
