//! Failure-rate buckets per SMART attribute id.
//!
//! The tables map raw-value ranges to annual failure rates derived from the
//! Backblaze drive-stats population. Critical attributes correlate directly
//! with drive death; the important non-critical ones only raise suspicion
//! at higher rates.

/// One contiguous raw-value range with its observed annual failure rate.
pub struct Bucket {
    pub low: i64,
    pub high: i64,
    pub failure_rate: f64,
}

pub struct AttributeBuckets {
    pub id: i64,
    /// Critical attributes fail at lower observed rates.
    pub critical: bool,
    pub buckets: &'static [Bucket],
}

impl AttributeBuckets {
    /// Find the bucket containing `raw_value`. Only negative raw values can
    /// miss, the tables cover 0..=i64::MAX.
    pub fn find(&self, raw_value: i64) -> Option<&'static Bucket> {
        self.buckets
            .iter()
            .find(|bucket| raw_value >= bucket.low && raw_value <= bucket.high)
    }
}

const fn bucket(low: i64, high: i64, failure_rate: f64) -> Bucket {
    Bucket {
        low,
        high,
        failure_rate,
    }
}

/// Reallocated Sectors Count
const REALLOCATED_SECTORS: &[Bucket] = &[
    bucket(0, 0, 0.004),
    bucket(1, 4, 0.050),
    bucket(5, 24, 0.075),
    bucket(25, 130, 0.125),
    bucket(131, 1000, 0.200),
    bucket(1001, i64::MAX, 0.320),
];

/// Spin Retry Count
const SPIN_RETRY: &[Bucket] = &[
    bucket(0, 0, 0.005),
    bucket(1, 4, 0.120),
    bucket(5, i64::MAX, 0.260),
];

/// Reported Uncorrectable Errors
const REPORTED_UNCORRECT: &[Bucket] = &[
    bucket(0, 0, 0.005),
    bucket(1, 4, 0.105),
    bucket(5, 24, 0.160),
    bucket(25, i64::MAX, 0.300),
];

/// Command Timeout
const COMMAND_TIMEOUT: &[Bucket] = &[
    bucket(0, 0, 0.006),
    bucket(1, 4, 0.025),
    bucket(5, 24, 0.100),
    bucket(25, i64::MAX, 0.210),
];

/// Reallocation Event Count
const REALLOCATION_EVENTS: &[Bucket] = &[
    bucket(0, 0, 0.005),
    bucket(1, 4, 0.070),
    bucket(5, 24, 0.110),
    bucket(25, i64::MAX, 0.240),
];

/// Current Pending Sector Count
const PENDING_SECTORS: &[Bucket] = &[
    bucket(0, 0, 0.005),
    bucket(1, 4, 0.100),
    bucket(5, 24, 0.170),
    bucket(25, i64::MAX, 0.280),
];

/// Uncorrectable Sector Count (offline)
const OFFLINE_UNCORRECTABLE: &[Bucket] = &[
    bucket(0, 0, 0.005),
    bucket(1, 4, 0.110),
    bucket(5, i64::MAX, 0.250),
];

/// Read Error Rate - raw values are vendor specific and only extreme
/// counts carry signal
const READ_ERROR_RATE: &[Bucket] = &[
    bucket(0, 0, 0.006),
    bucket(1, 1_000_000, 0.015),
    bucket(1_000_001, 100_000_000, 0.090),
    bucket(100_000_001, i64::MAX, 0.120),
];

/// Power-On Hours
const POWER_ON_HOURS: &[Bucket] = &[
    bucket(0, 20_000, 0.008),
    bucket(20_001, 35_000, 0.030),
    bucket(35_001, 50_000, 0.065),
    bucket(50_001, i64::MAX, 0.110),
];

/// Temperature (degrees celsius in the leading raw byte)
const TEMPERATURE: &[Bucket] = &[
    bucket(0, 24, 0.020),
    bucket(25, 40, 0.007),
    bucket(41, 50, 0.030),
    bucket(51, 60, 0.110),
    bucket(61, i64::MAX, 0.220),
];

/// UltraDMA CRC Error Count
const UDMA_CRC_ERRORS: &[Bucket] = &[
    bucket(0, 0, 0.007),
    bucket(1, 4, 0.050),
    bucket(5, 99, 0.120),
    bucket(100, i64::MAX, 0.230),
];

/// Multi-Zone Error Rate
const MULTI_ZONE_ERRORS: &[Bucket] = &[
    bucket(0, 0, 0.007),
    bucket(1, 4, 0.090),
    bucket(5, 99, 0.140),
    bucket(100, i64::MAX, 0.210),
];

static ATTRIBUTE_TABLES: &[AttributeBuckets] = &[
    AttributeBuckets {
        id: 1,
        critical: false,
        buckets: READ_ERROR_RATE,
    },
    AttributeBuckets {
        id: 5,
        critical: true,
        buckets: REALLOCATED_SECTORS,
    },
    AttributeBuckets {
        id: 9,
        critical: false,
        buckets: POWER_ON_HOURS,
    },
    AttributeBuckets {
        id: 10,
        critical: true,
        buckets: SPIN_RETRY,
    },
    AttributeBuckets {
        id: 187,
        critical: true,
        buckets: REPORTED_UNCORRECT,
    },
    AttributeBuckets {
        id: 188,
        critical: true,
        buckets: COMMAND_TIMEOUT,
    },
    AttributeBuckets {
        id: 194,
        critical: false,
        buckets: TEMPERATURE,
    },
    AttributeBuckets {
        id: 196,
        critical: true,
        buckets: REALLOCATION_EVENTS,
    },
    AttributeBuckets {
        id: 197,
        critical: true,
        buckets: PENDING_SECTORS,
    },
    AttributeBuckets {
        id: 198,
        critical: true,
        buckets: OFFLINE_UNCORRECTABLE,
    },
    AttributeBuckets {
        id: 199,
        critical: false,
        buckets: UDMA_CRC_ERRORS,
    },
    AttributeBuckets {
        id: 200,
        critical: false,
        buckets: MULTI_ZONE_ERRORS,
    },
];

/// Look up the bucket table for an attribute id.
pub fn bucket_table(id: i64) -> Option<&'static AttributeBuckets> {
    ATTRIBUTE_TABLES.iter().find(|table| table.id == id)
}

/// All attribute ids with a bucket table.
pub fn tabled_ids() -> impl Iterator<Item = i64> {
    ATTRIBUTE_TABLES.iter().map(|table| table.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_coverage() {
        // every table must cover 0..=i64::MAX without gaps or overlaps
        for table in ATTRIBUTE_TABLES {
            assert!(!table.buckets.is_empty());
            assert_eq!(table.buckets[0].low, 0, "id {}", table.id);

            for window in table.buckets.windows(2) {
                assert_eq!(
                    window[1].low,
                    window[0].high + 1,
                    "gap or overlap in table for id {}",
                    table.id
                );
            }

            let last = table.buckets.last().unwrap();
            assert_eq!(last.high, i64::MAX, "id {}", table.id);
        }
    }

    #[test]
    fn test_expected_ids_present() {
        for id in [5, 10, 187, 188, 196, 197, 198] {
            assert!(bucket_table(id).map(|t| t.critical).unwrap_or(false));
        }
        for id in [1, 9, 194, 199, 200] {
            assert!(!bucket_table(id).map(|t| t.critical).unwrap_or(true));
        }
        assert!(bucket_table(3).is_none());
        assert!(bucket_table(241).is_none());
    }

    #[test]
    fn test_bucket_lookup() {
        let table = bucket_table(5).unwrap();
        assert_eq!(table.find(0).unwrap().failure_rate, 0.004);
        assert_eq!(table.find(3).unwrap().failure_rate, 0.050);
        assert_eq!(table.find(i64::MAX).unwrap().failure_rate, 0.320);
        assert!(table.find(-1).is_none());
    }
}
