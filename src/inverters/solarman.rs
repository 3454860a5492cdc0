//! Solarman (Solarman Business / IGEN) daily records.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use super::{check_status, history_window, sort_points, trim_base, Inverter, InverterError};
use crate::domain::{GenerationPoint, InverterType};

/// The record endpoint rejects non-browser agents
const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows; U; Windows NT 5.1; en-US; rv:1.9.0.7) Gecko/2009021910 Firefox/3.0.7";

pub struct SolarmanClient {
    client: Client,
    base_url: String,
    station_id: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct DayRecords {
    #[serde(default)]
    records: Vec<Record>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Record {
    date_time: Option<f64>,
    /// W
    generation_power: Option<f64>,
}

impl SolarmanClient {
    pub fn new(client: Client, base_url: &str, station_id: String, token: String) -> Self {
        Self { client, base_url: trim_base(base_url), station_id, token }
    }

    async fn day(&self, day: DateTime<Utc>) -> Result<Vec<GenerationPoint>, InverterError> {
        let response = self
            .client
            .get(format!("{}/{}/record", self.base_url, self.station_id))
            .query(&[("year", day.year() as u32), ("month", day.month()), ("day", day.day())])
            .bearer_auth(&self.token)
            .header(reqwest::header::USER_AGENT, BROWSER_USER_AGENT)
            .send()
            .await?;
        let body: DayRecords = check_status(InverterType::Solarman, response)
            .await?
            .json()
            .await
            .map_err(|e| InverterError::parse(InverterType::Solarman, e))?;

        Ok(body
            .records
            .into_iter()
            .filter_map(|r| {
                let ts = DateTime::from_timestamp(r.date_time? as i64, 0)?;
                Some(GenerationPoint::new(ts, r.generation_power? / 1000.0))
            })
            .collect())
    }
}

#[async_trait]
impl Inverter for SolarmanClient {
    fn vendor(&self) -> InverterType {
        InverterType::Solarman
    }

    #[instrument(skip_all, fields(station_id = %self.station_id))]
    async fn get_data(&self, ts: DateTime<Utc>) -> Result<Vec<GenerationPoint>, InverterError> {
        let mut points = Vec::new();
        let mut day = ts - history_window();
        while day <= ts {
            match self.day(day).await {
                Ok(records) => points.extend(records),
                Err(err) => warn!(day = %day.date_naive(), error = %err, "Solarman request failed"),
            }
            day += Duration::days(1);
        }
        if points.is_empty() {
            warn!("no valid Solarman data found");
        }
        info!(samples = points.len(), "fetched Solarman records");
        Ok(sort_points(points))
    }
}
