//! GivEnergy cloud: the latest system snapshot of the first inverter.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize};
use tracing::{info, instrument};

use super::{check_status, trim_base, Inverter, InverterError};
use crate::domain::{GenerationPoint, InverterType};

pub struct GivEnergyClient {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct Data<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct CommunicationDevice {
    inverter: InverterInfo,
}

#[derive(Debug, Deserialize)]
struct InverterInfo {
    serial: String,
}

#[derive(Debug, Deserialize)]
struct SystemData {
    time: String,
    solar: Solar,
}

#[derive(Debug, Deserialize)]
struct Solar {
    /// W
    power: f64,
}

impl GivEnergyClient {
    pub fn new(client: Client, base_url: &str, api_key: String) -> Self {
        Self { client, base_url: trim_base(base_url), api_key }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, InverterError> {
        let response = self
            .client
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(&self.api_key)
            .header("Accept", "application/json")
            .send()
            .await?;
        let body: Data<T> = check_status(InverterType::GivEnergy, response)
            .await?
            .json()
            .await
            .map_err(|e| InverterError::parse(InverterType::GivEnergy, e))?;
        Ok(body.data)
    }

    pub async fn inverter_serial(&self) -> Result<String, InverterError> {
        let devices: Vec<CommunicationDevice> = self.get("/v1/communication-device").await?;
        devices
            .into_iter()
            .next()
            .map(|d| d.inverter.serial)
            .ok_or_else(|| InverterError::parse(InverterType::GivEnergy, "no communication devices found"))
    }
}

#[async_trait]
impl Inverter for GivEnergyClient {
    fn vendor(&self) -> InverterType {
        InverterType::GivEnergy
    }

    /// A single sample: the most recent system reading
    #[instrument(skip_all)]
    async fn get_data(&self, _ts: DateTime<Utc>) -> Result<Vec<GenerationPoint>, InverterError> {
        let serial = self.inverter_serial().await?;
        let latest: SystemData = self.get(&format!("/v1/inverter/{serial}/system-data/latest")).await?;
        let timestamp = NaiveDateTime::parse_from_str(&latest.time, "%Y-%m-%dT%H:%M:%SZ")
            .map_err(|e| InverterError::parse(InverterType::GivEnergy, format!("time `{}`: {e}", latest.time)))?
            .and_utc();
        info!(%serial, %timestamp, "fetched GivEnergy snapshot");
        Ok(vec![GenerationPoint::new(timestamp, latest.solar.power / 1000.0)])
    }
}
