//! Feature Engineering for PV Forecasting
//!
//! Builds the per-horizon feature table the tree models were trained on,
//! from clear-sky irradiance, recent PV history and NWP.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use super::history::{history_per_horizon, nan_mean, recent_values, safe_div, PvHistory};
use super::nwp::select_nwp;
use super::weather::{NwpFrame, WeatherTable, NWP_VARIABLES, TABULAR_VARIABLES};
use crate::domain::{NwpSource, PvSite};
use crate::solar;

const RECENT_POWER_MINUTES: i64 = 30;

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("timestamp {ts} is before forecast time {now}")]
    TimestampBeforeNow { ts: DateTime<Utc>, now: DateTime<Utc> },

    #[error("feature `{name}` has {got} rows, expected {expected}")]
    LengthMismatch { name: String, got: usize, expected: usize },

    #[error("horizon duration of {0} minutes does not divide a day")]
    InvalidHorizon(i64),
}

/// Forecast horizons: `count` consecutive windows of `duration_minutes`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Horizons {
    pub duration_minutes: i64,
    pub count: usize,
}

impl Default for Horizons {
    /// 48 hours in 15 minute steps
    fn default() -> Self {
        Self { duration_minutes: 15, count: 192 }
    }
}

impl Horizons {
    pub fn new(duration_minutes: i64, count: usize) -> Self {
        Self { duration_minutes, count }
    }

    pub fn validate(&self) -> Result<(), FeatureError> {
        if self.duration_minutes <= 0 || (24 * 60) % self.duration_minutes != 0 {
            return Err(FeatureError::InvalidHorizon(self.duration_minutes));
        }
        Ok(())
    }

    pub fn slots_per_day(&self) -> usize {
        (24 * 60 / self.duration_minutes) as usize
    }

    /// (start, end) offsets in minutes
    pub fn bounds(&self) -> impl Iterator<Item = (i64, i64)> + '_ {
        (0..self.count as i64).map(|i| (i * self.duration_minutes, (i + 1) * self.duration_minutes))
    }

    pub fn starts(&self, ts: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        self.bounds().map(|(s, _)| ts + Duration::minutes(s)).collect()
    }

    /// Middle of each horizon window, used to look up irradiance and NWP
    pub fn midpoints(&self, ts: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        self.bounds()
            .map(|(s, e)| ts + Duration::seconds((s + e) * 30))
            .collect()
    }

    pub fn span(&self) -> Duration {
        Duration::minutes(self.duration_minutes * self.count as i64)
    }
}

/// Named feature columns of equal length.
///
/// Columns whose name starts with `_` are bookkeeping (used to scale the
/// prediction back) and are never sent to a model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureTable {
    rows: usize,
    columns: BTreeMap<String, Vec<f64>>,
}

impl FeatureTable {
    pub fn new(rows: usize) -> Self {
        Self { rows, columns: BTreeMap::new() }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f64>) -> Result<(), FeatureError> {
        let name = name.into();
        if values.len() != self.rows {
            return Err(FeatureError::LengthMismatch { name, got: values.len(), expected: self.rows });
        }
        self.columns.insert(name, values);
        Ok(())
    }

    /// Same value on every row
    pub fn insert_scalar(&mut self, name: impl Into<String>, value: f64) {
        self.columns.insert(name.into(), vec![value; self.rows]);
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(|v| v.as_slice())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(|k| k.as_str())
    }

    /// Names a model is allowed to see
    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.names().filter(|n| !n.starts_with('_'))
    }
}

fn flag(is_set: bool) -> f64 {
    if is_set {
        1.0
    } else {
        0.0
    }
}

/// Settings that shape the per-horizon features; they travel with a model
/// because they must match what it was trained with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    #[serde(default)]
    pub horizons: Horizons,
    #[serde(default = "default_history_days")]
    pub num_days_history: i64,
    #[serde(default = "default_true")]
    pub normalize_features: bool,
    #[serde(default)]
    pub n_recent_power_values: usize,
    /// Oldest NWP run still usable, in hours
    #[serde(default)]
    pub nwp_tolerance_hours: Option<i64>,
}

fn default_history_days() -> i64 {
    7
}

fn default_true() -> bool {
    true
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            horizons: Horizons::default(),
            num_days_history: default_history_days(),
            normalize_features: true,
            n_recent_power_values: 0,
            nwp_tolerance_hours: None,
        }
    }
}

/// Per-horizon feature builder for the gradient-boosted model
#[derive(Debug, Clone)]
pub struct FeatureBuilder {
    config: FeatureConfig,
}

impl FeatureBuilder {
    pub fn new(config: FeatureConfig) -> Result<Self, FeatureError> {
        config.horizons.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    /// Start of the PV history used at `now`: midnight, `num_days_history` days back
    pub fn history_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let day = (now - Duration::days(self.config.num_days_history)).date_naive();
        day.and_hms_opt(0, 0, 0).map_or(now, |d| d.and_utc())
    }

    /// One row per horizon.
    ///
    /// `nwp` holds the runs available per provider; with more than one
    /// provider, variable names get a `_<provider>` suffix.
    pub fn build(
        &self,
        site: &PvSite,
        now: DateTime<Utc>,
        history: &PvHistory,
        nwp: &BTreeMap<NwpSource, Vec<NwpFrame>>,
    ) -> Result<FeatureTable, FeatureError> {
        let horizons = &self.config.horizons;
        let capacity = site.capacity_kwp;
        let history = history.clipped(self.history_start(now), now);

        let series = if self.config.normalize_features {
            history.normalized(site)
        } else {
            history.points().iter().map(|p| (p.timestamp, p.power_kw)).collect()
        };
        let aggregates = history_per_horizon(&series, now, horizons).aggregate();

        let midpoints = horizons.midpoints(now);
        let poa_global: Vec<f64> = midpoints.iter().map(|ts| solar::poa_global(site, *ts)).collect();
        let poa_global_now =
            solar::poa_global(site, now - Duration::minutes(RECENT_POWER_MINUTES / 2));

        let mut table = FeatureTable::new(horizons.count);
        table.insert("_poa_global", poa_global.clone())?;
        table.insert_scalar("_capacity", capacity);
        table.insert("poa_global", poa_global)?;
        table.insert_scalar("capacity", if capacity.is_finite() { capacity } else { -1.0 });

        for (name, values) in [
            ("max", aggregates.max),
            ("mean", aggregates.mean),
            ("median", aggregates.median),
        ] {
            table.insert(format!("h_{name}_nan"), values.iter().map(|v| flag(v.is_nan())).collect())?;
            table.insert(
                format!("h_{name}"),
                values.iter().map(|v| if v.is_finite() { *v } else { 0.0 }).collect(),
            )?;
        }

        let tolerance = self.config.nwp_tolerance_hours.map(Duration::hours);
        let multiple = nwp.len() > 1;
        for (source, runs) in nwp {
            let selected = select_nwp(runs, now, tolerance, &midpoints)?;
            for (_, key) in NWP_VARIABLES {
                let values = selected
                    .as_ref()
                    .and_then(|s| s.get(*key).cloned())
                    .unwrap_or_else(|| vec![f64::NAN; horizons.count]);
                let name = if multiple { format!("{key}_{source}") } else { key.to_string() };
                table.insert(
                    format!("{name}_isnan"),
                    values.iter().map(|v| flag(v.is_nan())).collect(),
                )?;
                table.insert(
                    name,
                    values.iter().map(|v| if v.is_finite() { *v } else { 0.0 }).collect(),
                )?;
            }
        }

        let recent = recent_values(&history, now, RECENT_POWER_MINUTES);
        let recent_power = nan_mean(&recent);
        let recent_power_nan = recent_power.is_nan();
        let recent_power = if self.config.normalize_features {
            safe_div(recent_power, poa_global_now * capacity, 0.0)
        } else {
            recent_power
        };
        table.insert_scalar("recent_power", if recent_power_nan { 0.0 } else { recent_power });
        table.insert_scalar("recent_power_nan", flag(recent_power_nan));

        // Last n samples, right-padded with NaN
        let n = self.config.n_recent_power_values;
        let mut last: Vec<f64> = recent.iter().rev().take(n).rev().copied().collect();
        last.resize(n, f64::NAN);
        for (i, value) in last.into_iter().enumerate() {
            let value = if self.config.normalize_features {
                safe_div(value, poa_global_now * capacity, 0.0)
            } else {
                value
            };
            table.insert_scalar(format!("recent_power_values_{i}"), value);
            table.insert_scalar(format!("recent_power_values_{i}_isnan"), flag(value.is_nan()));
        }

        table.insert_scalar("poa_global_now_is_zero", flag(poa_global_now == 0.0));
        Ok(table)
    }

    /// Model-visible column names `build` produces for these providers
    pub fn feature_names(&self, sources: &[NwpSource]) -> Result<Vec<String>, FeatureError> {
        let site = PvSite::new(0.0, 0.0, 1.0);
        let nwp = sources.iter().map(|s| (*s, Vec::new())).collect();
        let table = self.build(&site, DateTime::<Utc>::UNIX_EPOCH, &PvHistory::empty(), &nwp)?;
        Ok(table.model_names().map(str::to_string).collect())
    }
}

/// Per-row features for the tabular model: panel metadata, the weather
/// columns, then calendar fields.
pub fn tabular_features(site: &PvSite, weather: &WeatherTable) -> Result<FeatureTable, FeatureError> {
    let rows = weather.len();
    let rounded = site.round_latitude_and_longitude();
    let mut table = FeatureTable::new(rows);

    table.insert_scalar("latitude_rounded", rounded.latitude);
    table.insert_scalar("longitude_rounded", rounded.longitude);
    table.insert_scalar("orientation", site.orientation);
    table.insert_scalar("tilt", site.tilt);
    table.insert_scalar("kwp", site.capacity_kwp);

    for name in TABULAR_VARIABLES {
        let values = weather
            .columns
            .get(*name)
            .cloned()
            .unwrap_or_else(|| vec![f64::NAN; rows]);
        table.insert(*name, values)?;
    }

    table.insert("month", weather.times.iter().map(|t| t.month() as f64).collect())?;
    table.insert("hour", weather.times.iter().map(|t| t.hour() as f64).collect())?;
    Ok(table)
}
