/// Fee Aggregation Module
///
/// Computes the (low, medium, high) fee band per operation kind from the
/// most recent fee samples in the operations table. The band feeds fee
/// estimation for outgoing transactions; `low` is clamped at zero so a
/// quiet chain never produces a negative suggestion.
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use super::Database;
use crate::models::{AverageFees, OperationKind};

/// A (fee, timestamp) sample drawn from the operations table. A missing fee
/// counts as zero when averaging.
pub type FeeSample = (Option<i64>, DateTime<Utc>);

impl Database {
    /// Compute the fee band for one operation kind from the most recent
    /// `sample_count` distinct (fee, timestamp) pairs, newest first.
    /// Returns None when no operation of that kind has been stored yet.
    pub async fn calculate_average_fees(
        &self,
        kind: OperationKind,
        sample_count: i64,
    ) -> Result<Option<AverageFees>> {
        let samples = sqlx::query_as::<_, FeeSample>(
            r#"
            SELECT DISTINCT fee, timestamp
            FROM operations
            WHERE kind = $1 AND timestamp IS NOT NULL
            ORDER BY timestamp DESC
            LIMIT $2
            "#,
        )
        .bind(kind.as_str())
        .bind(sample_count)
        .fetch_all(self.pool())
        .await
        .with_context(|| format!("Failed to sample fees for kind {}", kind.as_str()))?;

        Ok(fee_band(kind.as_str(), &samples))
    }
}

/// Derive a fee band from raw samples.
///
/// medium = ceil(mean), high = medium + ceil(stdev),
/// low = max(ceil(mean - stdev), 0), with population standard deviation
/// and missing fees treated as 0. The band is stamped with the newest
/// sample's timestamp. None when there are no samples.
pub fn fee_band(kind: &str, samples: &[FeeSample]) -> Option<AverageFees> {
    let newest = samples.iter().map(|(_, timestamp)| *timestamp).max()?;

    let fees: Vec<f64> = samples.iter().map(|(fee, _)| fee.unwrap_or(0) as f64).collect();
    let count = fees.len() as f64;

    let mean = fees.iter().sum::<f64>() / count;
    let variance = fees.iter().map(|fee| (fee - mean).powi(2)).sum::<f64>() / count;
    let stdev = variance.sqrt();

    let medium = mean.ceil() as i64;
    let high = medium + stdev.ceil() as i64;
    let low = ((mean - stdev).ceil() as i64).max(0);

    Some(AverageFees { low, medium, high, timestamp: newest, kind: kind.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 4, 18, 12, minute, 0).unwrap()
    }

    #[test]
    fn test_fee_band_reference_samples() {
        // mean = 3, population stdev = sqrt(2) ~ 1.414
        let samples: Vec<FeeSample> = (1..=5).map(|fee| (Some(fee), at(fee as u32))).collect();

        let band = fee_band("transaction", &samples).unwrap();
        assert_eq!(band.medium, 3);
        assert_eq!(band.high, 5);
        assert_eq!(band.low, 2);
        assert_eq!(band.kind, "transaction");
        assert_eq!(band.timestamp, at(5));
    }

    #[test]
    fn test_fee_band_high_rounds_stdev_separately() {
        // mean = 3.2, population stdev ~ 1.72: medium = ceil(3.2) = 4,
        // high = 4 + ceil(1.72) = 6, not ceil(3.2 + 1.72) = 5
        let fees = [1, 2, 3, 4, 6];
        let samples: Vec<FeeSample> =
            fees.iter().enumerate().map(|(i, fee)| (Some(*fee), at(i as u32))).collect();

        let band = fee_band("transaction", &samples).unwrap();
        assert_eq!(band.medium, 4);
        assert_eq!(band.high, 6);
        assert_eq!(band.low, 2);
    }

    #[test]
    fn test_fee_band_empty_samples() {
        assert!(fee_band("transaction", &[]).is_none());
    }

    #[test]
    fn test_fee_band_all_zero_fees() {
        let samples: Vec<FeeSample> = (0..4).map(|i| (Some(0), at(i))).collect();

        let band = fee_band("delegation", &samples).unwrap();
        assert_eq!(band.low, 0);
        assert_eq!(band.medium, 0);
        assert_eq!(band.high, 0);
    }

    #[test]
    fn test_fee_band_missing_fees_count_as_zero() {
        let samples: Vec<FeeSample> = vec![(None, at(1)), (Some(10), at(2))];

        let band = fee_band("origination", &samples).unwrap();
        // mean = 5, stdev = 5
        assert_eq!(band.medium, 5);
        assert_eq!(band.high, 10);
        assert_eq!(band.low, 0);
    }

    #[test]
    fn test_fee_band_monotonic_and_non_negative() {
        let cases: &[&[i64]] = &[&[1], &[7, 7, 7], &[0, 1, 1000], &[3, 1, 4, 1, 5, 9, 2, 6]];

        for fees in cases {
            let samples: Vec<FeeSample> =
                fees.iter().enumerate().map(|(i, fee)| (Some(*fee), at(i as u32))).collect();
            let band = fee_band("transaction", &samples).unwrap();

            assert!(band.low >= 0);
            assert!(band.low <= band.medium);
            assert!(band.medium <= band.high);
        }
    }

    #[test]
    fn test_fee_band_single_sample() {
        let band = fee_band("reveal", &[(Some(1300), at(0))]).unwrap();
        assert_eq!(band.low, 1300);
        assert_eq!(band.medium, 1300);
        assert_eq!(band.high, 1300);
    }
}
