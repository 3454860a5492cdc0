//! Live generation from inverter vendor clouds.
//!
//! Every client returns kW samples covering up to a week before the
//! forecast time, sorted by timestamp. Vendor credentials come from
//! [`VendorCredentials`](crate::config::VendorCredentials).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{Config, InvertersConfig};
use crate::domain::{GenerationPoint, InverterType};

pub mod enphase;
pub mod givenergy;
pub mod mock;
pub mod solarman;
pub mod solis;
pub mod victron;

pub use enphase::EnphaseClient;
pub use givenergy::GivEnergyClient;
pub use mock::StaticInverter;
pub use solarman::SolarmanClient;
pub use solis::SolisClient;
pub use victron::VictronClient;

/// How far back live data is requested
pub fn history_window() -> chrono::Duration {
    chrono::Duration::weeks(1)
}

#[derive(Debug, Error)]
pub enum InverterError {
    #[error("missing credential `{0}`")]
    MissingCredential(&'static str),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{vendor} returned HTTP {status}: {body}")]
    Status {
        vendor: InverterType,
        status: u16,
        body: String,
    },

    #[error("API returned an error: {message}, error code: {code}")]
    Api { message: String, code: String },

    #[error("request rejected as expired; local clock is {now} and may be out of sync with the server")]
    ClockSkew { now: DateTime<Utc> },

    #[error("unexpected {vendor} response: {reason}")]
    Parse { vendor: InverterType, reason: String },
}

impl InverterError {
    pub(crate) fn parse(vendor: InverterType, reason: impl ToString) -> Self {
        InverterError::Parse { vendor, reason: reason.to_string() }
    }
}

/// Source of recent PV generation for one site
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Inverter: Send + Sync {
    fn vendor(&self) -> InverterType;

    /// kW samples before `ts`, oldest first
    async fn get_data(&self, ts: DateTime<Utc>) -> Result<Vec<GenerationPoint>, InverterError>;
}

/// Build the client for a site's inverter; `None` means no live data
pub fn inverter_for(
    inverter_type: InverterType,
    cfg: &Config,
) -> Result<Option<Arc<dyn Inverter>>, InverterError> {
    let client = || http_client(&cfg.inverters);
    let creds = &cfg.credentials;
    let inverter: Arc<dyn Inverter> = match inverter_type {
        InverterType::None => return Ok(None),
        InverterType::Enphase => Arc::new(EnphaseClient::new(
            client()?,
            &cfg.inverters.enphase_base_url,
            require(&creds.enphase_system_id, "ENPHASE_SYSTEM_ID")?,
            require(&creds.enphase_api_key, "ENPHASE_API_KEY")?,
            require(&creds.enphase_access_token, "ENPHASE_ACCESS_TOKEN")?,
        )),
        InverterType::Solis => Arc::new(
            SolisClient::new(
                client()?,
                &format!("{}:{}", creds.solis_cloud_api_url, creds.solis_cloud_api_port),
                require(&creds.solis_cloud_api_key, "SOLIS_CLOUD_API_KEY")?,
                require(&creds.solis_cloud_api_key_secret, "SOLIS_CLOUD_API_KEY_SECRET")?,
            )
            .with_spacing(Duration::from_millis(cfg.inverters.solis_request_spacing_ms)),
        ),
        InverterType::GivEnergy => Arc::new(GivEnergyClient::new(
            client()?,
            &cfg.inverters.givenergy_base_url,
            require(&creds.givenergy_api_key, "GIVENERGY_API_KEY")?,
        )),
        InverterType::Solarman => Arc::new(SolarmanClient::new(
            client()?,
            &require(&creds.solarman_api_url, "SOLARMAN_API_URL")?,
            require(&creds.solarman_id, "SOLARMAN_ID")?,
            require(&creds.solarman_token, "SOLARMAN_TOKEN")?,
        )),
        InverterType::Victron => Arc::new(VictronClient::new(
            client()?,
            &cfg.inverters.victron_base_url,
            require(&creds.victron_user, "VICTRON_USER")?,
            require(&creds.victron_pass, "VICTRON_PASS")?,
        )),
    };
    Ok(Some(inverter))
}

pub(crate) fn http_client(cfg: &InvertersConfig) -> Result<Client, InverterError> {
    Ok(Client::builder()
        .user_agent(concat!("pv-site-forecast/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(cfg.http_timeout_secs))
        .build()?)
}

fn require(value: &Option<String>, name: &'static str) -> Result<String, InverterError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(InverterError::MissingCredential(name))
}

/// Turn a non-2xx response into [`InverterError::Status`], keeping the body
pub(crate) async fn check_status(
    vendor: InverterType,
    response: Response,
) -> Result<Response, InverterError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(InverterError::Status { vendor, status: status.as_u16(), body })
}

pub(crate) fn trim_base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

pub(crate) fn sort_points(mut points: Vec<GenerationPoint>) -> Vec<GenerationPoint> {
    points.sort_by_key(|p| p.timestamp);
    points
}
