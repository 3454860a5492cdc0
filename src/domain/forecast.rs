use chrono::{DateTime, Duration, DurationRound, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumString};

/// Wire format for timestamps in forecast responses
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Which pretrained model produces the forecast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ModelKind {
    /// Gradient-boosted trees over NWP + PV-history features, one row per horizon
    #[default]
    Gb,
    /// XGBoost over 15-minutely weather rows and panel metadata
    Xgb,
}

/// NWP provider used for the weather features
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NwpSource {
    #[default]
    Icon,
    Gfs,
    Ukmo,
}

/// A single power sample from an inverter (or ground truth)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationPoint {
    pub timestamp: DateTime<Utc>,
    pub power_kw: f64,
}

impl GenerationPoint {
    pub fn new(timestamp: DateTime<Utc>, power_kw: f64) -> Self {
        Self { timestamp, power_kw }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub timestamp: DateTime<Utc>,
    pub power_kw: f64,
}

/// Predicted power for one site, indexed by the start of each step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastSeries {
    pub init_time: DateTime<Utc>,
    pub points: Vec<ForecastPoint>,
}

impl ForecastSeries {
    pub fn new(init_time: DateTime<Utc>, points: Vec<ForecastPoint>) -> Self {
        Self { init_time, points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn total_kw(&self) -> f64 {
        self.points.iter().map(|p| p.power_kw).sum()
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.power_kw).collect()
    }

    /// Timestamp string -> kW, as served by the HTTP API
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        self.points
            .iter()
            .map(|p| (p.timestamp.format(TIMESTAMP_FORMAT).to_string(), p.power_kw))
            .collect()
    }
}

/// Floor a timestamp to the 15 minute grid forecasts are issued on
pub fn floor_to_quarter_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(Duration::minutes(15)).unwrap_or(ts)
}

/// Parse the timestamp formats accepted from clients and CSV files.
///
/// Naive timestamps are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("2024-03-10 12:07:00")]
    #[case("2024-03-10T12:07:00")]
    #[case("2024-03-10T12:07:00Z")]
    #[case("2024-03-10T13:07:00+01:00")]
    #[case("2024-03-10 12:07")]
    fn test_parse_timestamp_variants(#[case] raw: &str) {
        let expected = Utc.with_ymd_and_hms(2024, 3, 10, 12, 7, 0).unwrap();
        assert_eq!(parse_timestamp(raw), Some(expected));
    }

    #[test]
    fn test_parse_timestamp_rejects_garbage() {
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_floor_to_quarter_hour() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 10, 12, 29, 59).unwrap();
        assert_eq!(
            floor_to_quarter_hour(ts),
            Utc.with_ymd_and_hms(2024, 3, 10, 12, 15, 0).unwrap()
        );
    }

    #[test]
    fn test_series_map_uses_wire_format() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        let series = ForecastSeries::new(
            t0,
            vec![
                ForecastPoint { timestamp: t0, power_kw: 0.0 },
                ForecastPoint { timestamp: t0 + Duration::minutes(15), power_kw: 1.5 },
            ],
        );
        let map = series.to_map();
        assert_eq!(map.get("2024-03-10 00:15:00"), Some(&1.5));
        assert_eq!(series.total_kw(), 1.5);
    }
}
