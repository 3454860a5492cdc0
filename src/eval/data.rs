//! CSV inputs of an evaluation run.

use chrono::{DateTime, Utc};
use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer};
use std::path::Path;

use super::EvalError;
use crate::domain::{parse_timestamp, PvSite, DEFAULT_ORIENTATION_DEG, DEFAULT_TILT_DEG};

/// One (site, forecast time) pair to evaluate
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TestCase {
    pub pv_id: String,
    #[serde(deserialize_with = "timestamp")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PvMetadata {
    pub pv_id: String,
    pub latitude: f64,
    pub longitude: f64,
    /// kWp
    pub capacity: f64,
    #[serde(default)]
    pub tilt: Option<f64>,
    #[serde(default)]
    pub orientation: Option<f64>,
}

impl PvMetadata {
    pub fn site(&self) -> PvSite {
        PvSite::new(self.latitude, self.longitude, self.capacity).with_panel(
            self.tilt.unwrap_or(DEFAULT_TILT_DEG),
            self.orientation.unwrap_or(DEFAULT_ORIENTATION_DEG),
        )
    }
}

/// Measured generation. Empty cells read as `None`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TruthRecord {
    pub pv_id: String,
    #[serde(deserialize_with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    pub power_kw: Option<f64>,
}

impl TruthRecord {
    pub fn value(&self) -> Option<f64> {
        self.power_kw.filter(|v| v.is_finite())
    }
}

fn timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).ok_or_else(|| de::Error::custom(format!("unrecognised timestamp `{raw}`")))
}

pub fn read_csv<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, EvalError> {
    let csv_error = |source| EvalError::Csv { path: path.display().to_string(), source };
    let mut reader = csv::Reader::from_path(path).map_err(csv_error)?;
    reader.deserialize().collect::<Result<Vec<T>, _>>().map_err(csv_error)
}
