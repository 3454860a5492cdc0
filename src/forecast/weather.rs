//! Weather forecast integration (Open-Meteo)
//!
//! Two shapes of data come out of here:
//! - [`NwpFrame`]: hourly NWP variables for one provider, renamed to the
//!   short keys the tree models were trained on.
//! - [`WeatherTable`]: 15-minutely surface weather for the tabular model.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::config::WeatherConfig;
use crate::domain::{parse_timestamp, NwpSource};

/// Open-Meteo hourly variable -> key used in model features
pub const NWP_VARIABLES: &[(&str, &str)] = &[
    ("visibility", "vis"),
    ("windspeed_10m", "si10"),
    ("temperature_2m", "t"),
    ("precipitation", "prate"),
    ("shortwave_radiation", "dswrf"),
    ("direct_radiation", "dlwrf"),
    ("cloudcover_low", "lcc"),
    ("cloudcover_mid", "mcc"),
    ("cloudcover_high", "hcc"),
];

/// 15-minutely variables used by the tabular model, in column order
pub const TABULAR_VARIABLES: &[&str] = &[
    "temperature_2m",
    "relative_humidity_2m",
    "dew_point_2m",
    "precipitation",
    "surface_pressure",
    "cloud_cover",
    "cloud_cover_low",
    "cloud_cover_mid",
    "cloud_cover_high",
    "wind_speed_10m",
    "wind_direction_10m",
    "is_day",
    "shortwave_radiation",
    "direct_radiation",
    "diffuse_radiation",
    "direct_normal_irradiance",
    "terrestrial_radiation",
];

#[derive(Debug, Error)]
pub enum WeatherError {
    #[error("end date {end} is before start date {start}")]
    InvalidWindow { start: NaiveDate, end: NaiveDate },

    #[error("weather request failed: {0}")]
    Http(#[from] reqwest_middleware::Error),

    #[error("weather API returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("weather response could not be parsed: {0}")]
    Parse(String),

    #[error("reading weather file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<reqwest::Error> for WeatherError {
    fn from(err: reqwest::Error) -> Self {
        WeatherError::Http(reqwest_middleware::Error::Reqwest(err))
    }
}

/// Hourly NWP values from one provider at one location.
///
/// `init_time` is the first valid time of the run; every variable has one
/// value per entry in `times`, NaN where the provider had nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct NwpFrame {
    pub source: NwpSource,
    pub init_time: DateTime<Utc>,
    pub times: Vec<DateTime<Utc>>,
    pub variables: BTreeMap<String, Vec<f64>>,
}

impl NwpFrame {
    pub fn variable(&self, key: &str) -> Option<&[f64]> {
        self.variables.get(key).map(|v| v.as_slice())
    }

    /// True when a variable is absent or carries no finite value at all
    pub fn is_missing(&self, key: &str) -> bool {
        self.variable(key)
            .map_or(true, |values| values.iter().all(|v| !v.is_finite()))
    }

    /// Index of the valid time closest to `ts`
    pub fn nearest_index(&self, ts: DateTime<Utc>) -> Option<usize> {
        self.times
            .iter()
            .enumerate()
            .min_by_key(|(_, t)| (**t - ts).num_seconds().abs())
            .map(|(i, _)| i)
    }
}

/// 15-minutely weather rows for the tabular model
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeatherTable {
    pub times: Vec<DateTime<Utc>>,
    pub columns: BTreeMap<String, Vec<f64>>,
}

impl WeatherTable {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

/// Anything that can hand out NWP data for a point
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WeatherProvider: Send + Sync {
    /// Hourly NWP for `[start, end]` (dates inclusive)
    async fn nwp(
        &self,
        source: NwpSource,
        latitude: f64,
        longitude: f64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<NwpFrame, WeatherError>;

    /// 15-minutely surface weather for `[start, end]` (dates inclusive)
    async fn tabular(
        &self,
        latitude: f64,
        longitude: f64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<WeatherTable, WeatherError>;
}

/// Open-Meteo client with retries and a short-lived response cache
#[derive(Clone)]
pub struct OpenMeteoClient {
    client: ClientWithMiddleware,
    forecast_base_url: String,
    historical_base_url: String,
    recent_window_days: i64,
    cache: Arc<RwLock<HashMap<String, (Instant, String)>>>,
    ttl: Duration,
}

impl OpenMeteoClient {
    pub fn new(cfg: &WeatherConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("pv-site-forecast/0.4"));
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .default_headers(headers)
            .build()?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(cfg.max_retries);
        let client = ClientBuilder::new(http)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            client,
            forecast_base_url: cfg.forecast_base_url.trim_end_matches('/').to_string(),
            historical_base_url: cfg.historical_base_url.trim_end_matches('/').to_string(),
            recent_window_days: cfg.recent_window_days,
            cache: Arc::new(RwLock::new(HashMap::new())),
            ttl: Duration::from_secs(cfg.cache_ttl_seconds),
        })
    }

    /// Pick the endpoint for a provider. Runs older than the recent window
    /// are only served by the historical forecast API.
    fn nwp_endpoint(&self, source: NwpSource, start: NaiveDate, today: NaiveDate) -> (String, Option<&'static str>) {
        let recent = today - start <= ChronoDuration::days(self.recent_window_days);
        if recent {
            match source {
                NwpSource::Icon => (format!("{}/v1/dwd-icon", self.forecast_base_url), None),
                NwpSource::Gfs => (format!("{}/v1/gfs", self.forecast_base_url), None),
                NwpSource::Ukmo => (
                    format!("{}/v1/forecast", self.forecast_base_url),
                    Some("ukmo_seamless"),
                ),
            }
        } else {
            let model = match source {
                NwpSource::Icon => "icon_seamless",
                NwpSource::Gfs => "gfs_seamless",
                NwpSource::Ukmo => "ukmo_seamless",
            };
            (format!("{}/v1/forecast", self.historical_base_url), Some(model))
        }
    }

    async fn get_body(&self, url: &str, query: &[(&str, String)]) -> Result<String, WeatherError> {
        let cache_key = format!(
            "{url}?{}",
            query.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("&")
        );
        {
            let cache = self.cache.read().await;
            if let Some((at, body)) = cache.get(&cache_key) {
                if at.elapsed() < self.ttl {
                    debug!(url = %cache_key, "weather cache hit");
                    return Ok(body.clone());
                }
            }
        }

        debug!(url = %cache_key, "fetching weather");
        let resp = self.client.get(url).query(query).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(WeatherError::Status { status: status.as_u16(), body });
        }

        let mut cache = self.cache.write().await;
        cache.retain(|_, (at, _)| at.elapsed() < self.ttl);
        cache.insert(cache_key, (Instant::now(), body.clone()));
        Ok(body)
    }
}

fn check_window(start: NaiveDate, end: NaiveDate) -> Result<(), WeatherError> {
    if end < start {
        return Err(WeatherError::InvalidWindow { start, end });
    }
    Ok(())
}

fn base_query(latitude: f64, longitude: f64, start: NaiveDate, end: NaiveDate) -> Vec<(&'static str, String)> {
    vec![
        ("latitude", latitude.to_string()),
        ("longitude", longitude.to_string()),
        ("start_date", start.format("%Y-%m-%d").to_string()),
        ("end_date", end.format("%Y-%m-%d").to_string()),
        ("timezone", "GMT".to_string()),
    ]
}

#[async_trait]
impl WeatherProvider for OpenMeteoClient {
    #[instrument(skip(self))]
    async fn nwp(
        &self,
        source: NwpSource,
        latitude: f64,
        longitude: f64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<NwpFrame, WeatherError> {
        check_window(start, end)?;
        let (url, models) = self.nwp_endpoint(source, start, Utc::now().date_naive());

        let mut query = base_query(latitude, longitude, start, end);
        let hourly = NWP_VARIABLES.iter().map(|(name, _)| *name).collect::<Vec<_>>().join(",");
        query.push(("hourly", hourly));
        if let Some(models) = models {
            query.push(("models", models.to_string()));
        }

        let body = self.get_body(&url, &query).await?;
        let frame = nwp_frame_from_json(&body, source)?;
        info!(
            %source,
            steps = frame.times.len(),
            "fetched NWP for ({latitude}, {longitude})"
        );
        Ok(frame)
    }

    #[instrument(skip(self))]
    async fn tabular(
        &self,
        latitude: f64,
        longitude: f64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<WeatherTable, WeatherError> {
        check_window(start, end)?;
        let url = format!("{}/v1/forecast", self.forecast_base_url);
        let mut query = base_query(latitude, longitude, start, end);
        query.push(("minutely_15", TABULAR_VARIABLES.join(",")));

        let body = self.get_body(&url, &query).await?;
        weather_table_from_json(&body)
    }
}

/// Parse the `hourly` block of an Open-Meteo response into an [`NwpFrame`]
pub fn nwp_frame_from_json(body: &str, source: NwpSource) -> Result<NwpFrame, WeatherError> {
    parse_block(body, "hourly")?.into_nwp_frame(source)
}

/// Parse the `minutely_15` block of an Open-Meteo response. Variables the
/// response lacks come back as NaN columns.
pub fn weather_table_from_json(body: &str) -> Result<WeatherTable, WeatherError> {
    let (times, mut columns) = parse_block(body, "minutely_15")?.into_columns()?;
    for name in TABULAR_VARIABLES {
        columns.entry(name.to_string()).or_insert_with(|| vec![f64::NAN; times.len()]);
    }
    Ok(WeatherTable { times, columns })
}

#[derive(Debug, Deserialize)]
struct TimeBlock {
    time: Vec<String>,
    #[serde(flatten)]
    values: BTreeMap<String, Vec<Option<f64>>>,
}

fn parse_block(body: &str, block: &str) -> Result<TimeBlock, WeatherError> {
    let mut doc: serde_json::Value =
        serde_json::from_str(body).map_err(|e| WeatherError::Parse(e.to_string()))?;
    let section = doc
        .get_mut(block)
        .map(serde_json::Value::take)
        .ok_or_else(|| WeatherError::Parse(format!("missing `{block}` section")))?;
    serde_json::from_value(section).map_err(|e| WeatherError::Parse(e.to_string()))
}

impl TimeBlock {
    fn into_columns(self) -> Result<(Vec<DateTime<Utc>>, BTreeMap<String, Vec<f64>>), WeatherError> {
        let times = self
            .time
            .iter()
            .map(|t| parse_timestamp(t).ok_or_else(|| WeatherError::Parse(format!("bad time `{t}`"))))
            .collect::<Result<Vec<_>, _>>()?;

        let mut columns = BTreeMap::new();
        for (name, values) in self.values {
            if values.len() != times.len() {
                return Err(WeatherError::Parse(format!(
                    "`{name}` has {} values for {} times",
                    values.len(),
                    times.len()
                )));
            }
            columns.insert(name, values.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect());
        }
        Ok((times, columns))
    }

    fn into_nwp_frame(self, source: NwpSource) -> Result<NwpFrame, WeatherError> {
        let (times, mut columns) = self.into_columns()?;
        let init_time = *times
            .first()
            .ok_or_else(|| WeatherError::Parse("empty NWP time axis".to_string()))?;

        let variables = NWP_VARIABLES
            .iter()
            .map(|(name, key)| {
                let values = columns
                    .remove(*name)
                    .unwrap_or_else(|| vec![f64::NAN; times.len()]);
                (key.to_string(), values)
            })
            .collect();

        Ok(NwpFrame { source, init_time, times, variables })
    }
}
