//! Enphase Enlighten API v4 (microinverter telemetry).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use super::{check_status, history_window, sort_points, trim_base, Inverter, InverterError};
use crate::domain::{GenerationPoint, InverterType};

pub struct EnphaseClient {
    client: Client,
    base_url: String,
    system_id: String,
    api_key: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct Telemetry {
    intervals: Option<Vec<Interval>>,
}

#[derive(Debug, Deserialize)]
struct Interval {
    end_at: i64,
    /// Average power over the interval, W
    powr: f64,
}

impl EnphaseClient {
    pub fn new(
        client: Client,
        base_url: &str,
        system_id: String,
        api_key: String,
        access_token: String,
    ) -> Self {
        Self { client, base_url: trim_base(base_url), system_id, api_key, access_token }
    }
}

fn process_telemetry(telemetry: Telemetry, start_at: i64) -> Vec<GenerationPoint> {
    let Some(intervals) = telemetry.intervals else {
        warn!("no `intervals` in Enphase response");
        return Vec::new();
    };
    let points = intervals
        .into_iter()
        .filter(|i| i.end_at >= start_at)
        .filter_map(|i| {
            DateTime::from_timestamp(i.end_at, 0).map(|ts| GenerationPoint::new(ts, i.powr / 1000.0))
        })
        .collect();
    sort_points(points)
}

#[async_trait]
impl Inverter for EnphaseClient {
    fn vendor(&self) -> InverterType {
        InverterType::Enphase
    }

    #[instrument(skip_all, fields(system_id = %self.system_id))]
    async fn get_data(&self, ts: DateTime<Utc>) -> Result<Vec<GenerationPoint>, InverterError> {
        let start_at = (ts - history_window()).timestamp();
        let url = format!(
            "{}/api/v4/systems/{}/telemetry/production_micro",
            self.base_url, self.system_id
        );
        debug!(%url, start_at, "requesting Enphase telemetry");

        let response = self
            .client
            .get(&url)
            .query(&[("start_at", start_at.to_string()), ("granularity", "week".to_string())])
            .bearer_auth(&self.access_token)
            .header("key", &self.api_key)
            .send()
            .await?;
        let telemetry: Telemetry = check_status(InverterType::Enphase, response)
            .await?
            .json()
            .await
            .map_err(|e| InverterError::parse(InverterType::Enphase, e))?;

        let points = process_telemetry(telemetry, start_at);
        info!(samples = points.len(), "fetched Enphase telemetry");
        Ok(points)
    }
}
