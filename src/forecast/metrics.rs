//! Forecast accuracy metrics
//!
//! Summary scores for a set of (actual, predicted) pairs, plus MAE broken
//! down by forecast horizon.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Forecast accuracy metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastMetrics {
    /// Mean Absolute Error
    pub mae: f64,
    /// Root Mean Square Error
    pub rmse: f64,
    /// R² (coefficient of determination)
    pub r2: f64,
    /// Number of samples evaluated
    pub sample_count: usize,
    /// Largest absolute error observed
    pub max_error: f64,
}

impl ForecastMetrics {
    /// Calculate metrics from actual and predicted values
    pub fn calculate(actual: &[f64], predicted: &[f64]) -> Result<Self, ForecastMetricsError> {
        if actual.len() != predicted.len() {
            return Err(ForecastMetricsError::DimensionMismatch {
                actual: actual.len(),
                predicted: predicted.len(),
            });
        }

        if actual.is_empty() {
            return Err(ForecastMetricsError::EmptyData);
        }

        let n = actual.len() as f64;
        let errors: Vec<f64> = actual.iter().zip(predicted).map(|(a, p)| a - p).collect();

        let mae = errors.iter().map(|e| e.abs()).sum::<f64>() / n;

        let squared: f64 = errors.iter().map(|e| e * e).sum();
        let rmse = (squared / n).sqrt();

        let mean_actual = actual.iter().sum::<f64>() / n;
        let total_variance: f64 = actual.iter().map(|a| (a - mean_actual).powi(2)).sum();
        let r2 = if total_variance > 1e-10 {
            1.0 - squared / total_variance
        } else {
            0.0
        };

        let max_error = errors.iter().map(|e| e.abs()).fold(0.0f64, f64::max);

        Ok(ForecastMetrics {
            mae,
            rmse,
            r2,
            sample_count: actual.len(),
            max_error,
        })
    }

    /// MAE as a fraction of installed capacity
    pub fn normalized_mae(&self, capacity_kwp: f64) -> f64 {
        if capacity_kwp > 0.0 {
            self.mae / capacity_kwp
        } else {
            f64::NAN
        }
    }
}

impl fmt::Display for ForecastMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Metrics: MAE={:.3}, RMSE={:.3}, R²={:.3}, n={}",
            self.mae, self.rmse, self.r2, self.sample_count
        )
    }
}

/// Forecast metrics calculation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ForecastMetricsError {
    #[error("Dimension mismatch: actual={actual}, predicted={predicted}")]
    DimensionMismatch { actual: usize, predicted: usize },

    #[error("Empty data provided")]
    EmptyData,
}

/// Mean absolute error per horizon.
///
/// Takes `(horizon, actual, predicted)` triples; pairs where either side is
/// NaN are skipped, and horizons left with no pairs are omitted.
pub fn mae_by_horizon<I>(rows: I) -> BTreeMap<i64, f64>
where
    I: IntoIterator<Item = (i64, f64, f64)>,
{
    let mut sums: BTreeMap<i64, (f64, usize)> = BTreeMap::new();
    for (horizon, actual, predicted) in rows {
        if actual.is_nan() || predicted.is_nan() {
            continue;
        }
        let entry = sums.entry(horizon).or_default();
        entry.0 += (actual - predicted).abs();
        entry.1 += 1;
    }
    sums.into_iter()
        .map(|(horizon, (sum, count))| (horizon, sum / count as f64))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_perfect_forecast() {
        let actual = vec![0.0, 1.5, 3.0, 2.0];
        let metrics = ForecastMetrics::calculate(&actual, &actual).unwrap();

        assert_eq!(metrics.mae, 0.0);
        assert_eq!(metrics.rmse, 0.0);
        assert_eq!(metrics.r2, 1.0);
        assert_eq!(metrics.sample_count, 4);
    }

    #[test]
    fn test_forecast_with_errors() {
        let actual = vec![1.0, 2.0, 3.0, 4.0];
        let predicted = vec![1.5, 2.0, 2.0, 4.0];
        let metrics = ForecastMetrics::calculate(&actual, &predicted).unwrap();

        assert_relative_eq!(metrics.mae, 0.375);
        assert_relative_eq!(metrics.rmse, (1.25f64 / 4.0).sqrt());
        assert_relative_eq!(metrics.r2, 1.0 - 1.25 / 5.0);
        assert_relative_eq!(metrics.max_error, 1.0);
        assert_relative_eq!(metrics.normalized_mae(2.5), 0.15);
    }

    #[test]
    fn test_dimension_mismatch() {
        let result = ForecastMetrics::calculate(&[1.0, 2.0], &[1.0]);
        assert!(matches!(
            result,
            Err(ForecastMetricsError::DimensionMismatch { actual: 2, predicted: 1 })
        ));
        assert!(matches!(ForecastMetrics::calculate(&[], &[]), Err(ForecastMetricsError::EmptyData)));
    }

    #[test]
    fn test_mae_by_horizon_skips_nan() {
        let by_horizon = mae_by_horizon(vec![
            (0, 1.0, 0.5),
            (0, 2.0, 3.0),
            (1, f64::NAN, 1.0),
            (1, 1.0, 1.25),
            (2, f64::NAN, 0.0),
        ]);
        assert_eq!(by_horizon.len(), 2);
        assert_relative_eq!(by_horizon[&0], 0.75);
        assert_relative_eq!(by_horizon[&1], 0.25);
    }
}
