//! Repeated forecasts written out as CSV.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use super::engine::ForecastEngine;
use crate::domain::{ForecastSeries, ModelKind, NwpSource, PvSite, TIMESTAMP_FORMAT};

/// A batch of forecasts for one site, `freq_hours` apart from `start` to
/// `end` inclusive
#[derive(Debug, Clone)]
pub struct ForecastCsvJob {
    pub site_name: String,
    pub site: PvSite,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub freq_hours: i64,
    pub model: Option<ModelKind>,
    pub nwp_source: Option<NwpSource>,
}

impl ForecastCsvJob {
    pub fn init_times(&self) -> Result<Vec<DateTime<Utc>>> {
        if self.freq_hours <= 0 {
            bail!("frequency must be a positive number of hours, got {}", self.freq_hours);
        }
        if self.end < self.start {
            bail!("end {} is before start {}", self.end, self.start);
        }
        let step = Duration::hours(self.freq_hours);
        Ok(std::iter::successors(Some(self.start), |t| Some(*t + step))
            .take_while(|t| *t <= self.end)
            .collect())
    }

    pub fn file_name(&self) -> String {
        format!(
            "forecast_{}_{}_{}.csv",
            self.site_name,
            self.start.format("%Y%m%d"),
            self.end.format("%Y%m%d")
        )
    }
}

#[derive(Serialize)]
struct CsvRow {
    forecast_init_time: String,
    timestamp: String,
    power_kw: f64,
}

/// Write forecasts as `forecast_init_time,timestamp,power_kw` rows
pub fn write_forecasts_csv<W: Write>(writer: W, forecasts: &[ForecastSeries]) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);
    for forecast in forecasts {
        let init = forecast.init_time.format(TIMESTAMP_FORMAT).to_string();
        for point in &forecast.points {
            csv.serialize(CsvRow {
                forecast_init_time: init.clone(),
                timestamp: point.timestamp.format(TIMESTAMP_FORMAT).to_string(),
                power_kw: point.power_kw,
            })?;
        }
    }
    csv.flush()?;
    Ok(())
}

/// Run every forecast of the job and save them under `out_dir`.
///
/// Returns the path written.
pub async fn write_out_forecasts(engine: &ForecastEngine, job: &ForecastCsvJob, out_dir: &Path) -> Result<PathBuf> {
    let mut forecasts = Vec::new();
    for init_time in job.init_times()? {
        info!(%init_time, site = %job.site_name, "running forecast");
        let forecast = engine
            .run_forecast(&job.site, Some(init_time), job.model, job.nwp_source, None)
            .await
            .with_context(|| format!("forecast at {init_time}"))?;
        forecasts.push(forecast);
    }

    tokio::fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("creating {}", out_dir.display()))?;
    let path = out_dir.join(job.file_name());
    let mut buffer = Vec::new();
    write_forecasts_csv(&mut buffer, &forecasts)?;
    tokio::fs::write(&path, buffer)
        .await
        .with_context(|| format!("writing {}", path.display()))?;

    info!(path = %path.display(), forecasts = forecasts.len(), "forecasts saved");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ForecastPoint;
    use chrono::TimeZone;

    fn job(freq_hours: i64) -> ForecastCsvJob {
        ForecastCsvJob {
            site_name: "roof".into(),
            site: PvSite::new(51.75, -1.25, 4.0),
            start: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap(),
            freq_hours,
            model: None,
            nwp_source: None,
        }
    }

    #[test]
    fn test_init_times_include_end() {
        let times = job(6).init_times().unwrap();
        assert_eq!(times.len(), 5);
        assert_eq!(times[4], job(6).end);
        assert!(job(0).init_times().is_err());
    }

    #[test]
    fn test_file_name() {
        assert_eq!(job(1).file_name(), "forecast_roof_20240601_20240602.csv");
    }

    #[test]
    fn test_csv_layout() {
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).unwrap();
        let forecast = ForecastSeries::new(
            t0,
            vec![
                ForecastPoint { timestamp: t0, power_kw: 0.25 },
                ForecastPoint { timestamp: t0 + Duration::minutes(15), power_kw: 1.0 },
            ],
        );
        let mut out = Vec::new();
        write_forecasts_csv(&mut out, &[forecast]).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "forecast_init_time,timestamp,power_kw");
        assert_eq!(lines[1], "2024-06-01 06:00:00,2024-06-01 06:00:00,0.25");
        assert_eq!(lines[2], "2024-06-01 06:00:00,2024-06-01 06:15:00,1.0");
    }
}
