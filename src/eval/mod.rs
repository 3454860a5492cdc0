//! Backtesting against measured generation.
//!
//! Each test case is forecast for 48 hours, averaged to hourly values and
//! joined with hourly ground truth for the same site. Scores are reported
//! overall and per forecast hour, in kW and relative to capacity.

pub mod data;
pub mod local_nwp;

pub use data::{read_csv, PvMetadata, TestCase, TruthRecord};
pub use local_nwp::{nwp_file_name, LocalNwpFile};

use chrono::{DateTime, DurationRound, Utc};
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Config;
use crate::domain::{ForecastSeries, ModelKind, NwpSource, TIMESTAMP_FORMAT};
use crate::forecast::metrics::{mae_by_horizon, ForecastMetrics, ForecastMetricsError};
use crate::forecast::weather::WeatherProvider;
use crate::forecast::ForecastEngine;
use crate::ml::ModelRegistry;

/// Forecasts evaluated at once
const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("reading {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },

    #[error("writing results: {0}")]
    Write(#[from] csv::Error),

    #[error("no PV metadata for site {0}")]
    UnknownSite(String),

    #[error("no forecast could be matched with ground truth")]
    NoResults,

    #[error(transparent)]
    Metrics(#[from] ForecastMetricsError),
}

/// Where weather comes from during evaluation
#[derive(Clone)]
pub enum NwpInput {
    /// Saved responses named by [`nwp_file_name`]
    Directory(PathBuf),
    Live(Arc<dyn WeatherProvider>),
}

/// One forecast hour matched with what the site produced
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalRow {
    pub pv_id: String,
    #[serde(serialize_with = "wire_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(serialize_with = "wire_timestamp")]
    pub valid_time: DateTime<Utc>,
    pub horizon_hours: i64,
    pub capacity: f64,
    pub forecast_power: f64,
    pub generation_power: f64,
}

fn wire_timestamp<S: serde::Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&ts.format(TIMESTAMP_FORMAT))
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalReport {
    pub summary: ForecastMetrics,
    pub mae_by_horizon: BTreeMap<i64, f64>,
    /// MAE over capacity, per row then averaged
    pub normalized_mae: f64,
    pub normalized_mae_by_horizon: BTreeMap<i64, f64>,
    pub cases: usize,
    pub failed_cases: usize,
    #[serde(skip)]
    pub rows: Vec<EvalRow>,
}

impl EvalReport {
    fn from_rows(rows: Vec<EvalRow>, cases: usize, failed_cases: usize) -> Result<Self, EvalError> {
        if rows.is_empty() {
            return Err(EvalError::NoResults);
        }
        let actual: Vec<f64> = rows.iter().map(|r| r.generation_power).collect();
        let predicted: Vec<f64> = rows.iter().map(|r| r.forecast_power).collect();
        let summary = ForecastMetrics::calculate(&actual, &predicted)?;

        let by_horizon = mae_by_horizon(rows.iter().map(|r| (r.horizon_hours, r.generation_power, r.forecast_power)));
        let normalized = |r: &EvalRow| (r.generation_power / r.capacity, r.forecast_power / r.capacity);
        let normalized_by_horizon = mae_by_horizon(rows.iter().map(|r| {
            let (truth, forecast) = normalized(r);
            (r.horizon_hours, truth, forecast)
        }));
        let normalized_errors: Vec<f64> = rows
            .iter()
            .map(normalized)
            .map(|(truth, forecast)| (truth - forecast).abs())
            .filter(|e| e.is_finite())
            .collect();
        let normalized_mae = if normalized_errors.is_empty() {
            f64::NAN
        } else {
            normalized_errors.iter().sum::<f64>() / normalized_errors.len() as f64
        };

        Ok(Self {
            summary,
            mae_by_horizon: by_horizon,
            normalized_mae,
            normalized_mae_by_horizon: normalized_by_horizon,
            cases,
            failed_cases,
            rows,
        })
    }

    pub fn write_rows_csv(&self, path: &Path) -> Result<(), EvalError> {
        let mut writer = csv::Writer::from_path(path)?;
        for row in &self.rows {
            writer.serialize(row)?;
        }
        writer.flush().map_err(csv::Error::from)?;
        Ok(())
    }
}

/// Hourly means, tagged with their hour offset from the first hour
pub fn resample_hourly(series: &ForecastSeries) -> Vec<(i64, DateTime<Utc>, f64)> {
    hourly_means(series.points.iter().map(|p| (p.timestamp, p.power_kw)))
        .into_iter()
        .enumerate()
        .map(|(horizon, (hour, kw))| (horizon as i64, hour, kw))
        .collect()
}

fn floor_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(chrono::Duration::hours(1)).unwrap_or(ts)
}

/// NaN samples are ignored; hours with only NaN are dropped
fn hourly_means(samples: impl Iterator<Item = (DateTime<Utc>, f64)>) -> Vec<(DateTime<Utc>, f64)> {
    samples
        .filter(|(_, v)| v.is_finite())
        .map(|(t, v)| (floor_hour(t), v))
        .into_group_map()
        .into_iter()
        .map(|(hour, values)| (hour, values.iter().sum::<f64>() / values.len() as f64))
        .sorted_by_key(|(hour, _)| *hour)
        .collect()
}

pub struct Evaluator {
    models: ModelRegistry,
    config: Config,
    nwp: NwpInput,
    model: Option<ModelKind>,
    nwp_source: Option<NwpSource>,
    concurrency: usize,
}

impl Evaluator {
    pub fn new(models: ModelRegistry, config: Config, nwp: NwpInput) -> Self {
        Self {
            models,
            config,
            nwp,
            model: None,
            nwp_source: None,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_model(mut self, model: Option<ModelKind>, nwp_source: Option<NwpSource>) -> Self {
        self.model = model;
        self.nwp_source = nwp_source;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    fn engine_for(&self, case: &TestCase) -> ForecastEngine {
        let weather: Arc<dyn WeatherProvider> = match &self.nwp {
            NwpInput::Directory(dir) => Arc::new(LocalNwpFile::for_case(dir, &case.pv_id, case.timestamp)),
            NwpInput::Live(provider) => provider.clone(),
        };
        ForecastEngine::new(weather, self.models.clone(), &self.config)
    }

    /// Load the three CSVs and evaluate
    pub async fn run_files(&self, testset: &Path, metadata: &Path, truth: &Path) -> Result<EvalReport, EvalError> {
        let cases: Vec<TestCase> = read_csv(testset)?;
        let sites: Vec<PvMetadata> = read_csv(metadata)?;
        let truth: Vec<TruthRecord> = read_csv(truth)?;
        info!(cases = cases.len(), sites = sites.len(), truth = truth.len(), "evaluation inputs loaded");
        self.run(&cases, &sites, &truth).await
    }

    pub async fn run(
        &self,
        cases: &[TestCase],
        metadata: &[PvMetadata],
        truth: &[TruthRecord],
    ) -> Result<EvalReport, EvalError> {
        let sites: HashMap<&str, &PvMetadata> = metadata.iter().map(|m| (m.pv_id.as_str(), m)).collect();
        for case in cases {
            if !sites.contains_key(case.pv_id.as_str()) {
                return Err(EvalError::UnknownSite(case.pv_id.clone()));
            }
        }

        let truth_by_hour: HashMap<(&str, DateTime<Utc>), f64> = truth
            .iter()
            .into_group_map_by(|r: &&TruthRecord| r.pv_id.as_str())
            .into_iter()
            .flat_map(|(pv_id, records)| {
                hourly_means(records.into_iter().filter_map(|r| r.value().map(|v| (r.timestamp, v))))
                    .into_iter()
                    .map(move |(hour, kw)| ((pv_id, hour), kw))
            })
            .collect();

        let sites = &sites;
        let forecasts: Vec<_> = stream::iter(cases.iter().enumerate())
            .map(|(i, case)| async move {
                info!(case = i + 1, of = cases.len(), pv_id = %case.pv_id, ts = %case.timestamp, "evaluating");
                let site = sites[case.pv_id.as_str()].site();
                let result = self
                    .engine_for(case)
                    .run_forecast(&site, Some(case.timestamp), self.model, self.nwp_source, None)
                    .await;
                (case, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut rows = Vec::new();
        let mut failed = 0;
        for (case, result) in forecasts {
            let forecast = match result {
                Ok(forecast) => forecast,
                Err(err) => {
                    warn!(pv_id = %case.pv_id, ts = %case.timestamp, error = %format!("{err:#}"), "forecast failed");
                    failed += 1;
                    continue;
                }
            };
            let capacity = sites[case.pv_id.as_str()].capacity;
            for (horizon_hours, valid_time, forecast_power) in resample_hourly(&forecast) {
                let Some(&generation_power) = truth_by_hour.get(&(case.pv_id.as_str(), valid_time)) else {
                    continue;
                };
                rows.push(EvalRow {
                    pv_id: case.pv_id.clone(),
                    timestamp: case.timestamp,
                    valid_time,
                    horizon_hours,
                    capacity,
                    forecast_power,
                    generation_power,
                });
            }
        }
        rows.sort_by(|a, b| {
            (a.pv_id.as_str(), a.timestamp, a.horizon_hours).cmp(&(b.pv_id.as_str(), b.timestamp, b.horizon_hours))
        });

        let report = EvalReport::from_rows(rows, cases.len(), failed)?;
        info!(
            mae = report.summary.mae,
            normalized_mae = report.normalized_mae,
            rows = report.rows.len(),
            failed,
            "evaluation finished"
        );
        Ok(report)
    }
}
