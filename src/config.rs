use anyhow::{Context, Result};
use figment::{providers::{Env, Format, Toml}, Figment};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::domain::{ModelKind, NwpSource};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub weather: WeatherConfig,
    pub models: ModelsConfig,
    pub forecast: ForecastConfig,
    pub inverters: InvertersConfig,
    #[serde(skip)]
    pub credentials: VendorCredentials,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub enable_cors: bool,
    pub request_timeout_secs: u64,
}
impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeatherConfig {
    pub forecast_base_url: String,
    pub historical_base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub cache_ttl_seconds: u64,
    /// Windows starting further back than this use the historical forecast API
    pub recent_window_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    pub gb_path: PathBuf,
    pub xgb_path: PathBuf,
    pub default_model: ModelKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForecastConfig {
    pub default_nwp_source: NwpSource,
    pub history_days: i64,
    pub csv_output_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvertersConfig {
    pub http_timeout_secs: u64,
    pub enphase_base_url: String,
    pub givenergy_base_url: String,
    pub victron_base_url: String,
    pub solis_request_spacing_ms: u64,
}

/// Vendor secrets, read from the plain (unprefixed) environment the way the
/// vendor tooling names them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VendorCredentials {
    pub enphase_system_id: Option<String>,
    pub enphase_api_key: Option<String>,
    pub enphase_access_token: Option<String>,
    pub givenergy_api_key: Option<String>,
    pub solarman_api_url: Option<String>,
    pub solarman_token: Option<String>,
    pub solarman_id: Option<String>,
    #[serde(default = "default_solis_url")]
    pub solis_cloud_api_url: String,
    #[serde(default = "default_solis_port")]
    pub solis_cloud_api_port: u16,
    pub solis_cloud_api_key: Option<String>,
    pub solis_cloud_api_key_secret: Option<String>,
    pub victron_user: Option<String>,
    pub victron_pass: Option<String>,
}

fn default_solis_url() -> String {
    "https://www.soliscloud.com".to_string()
}

fn default_solis_port() -> u16 {
    13333
}

const VENDOR_ENV_KEYS: &[&str] = &[
    "ENPHASE_SYSTEM_ID",
    "ENPHASE_API_KEY",
    "ENPHASE_ACCESS_TOKEN",
    "GIVENERGY_API_KEY",
    "SOLARMAN_API_URL",
    "SOLARMAN_TOKEN",
    "SOLARMAN_ID",
    "SOLIS_CLOUD_API_URL",
    "SOLIS_CLOUD_API_PORT",
    "SOLIS_CLOUD_API_KEY",
    "SOLIS_CLOUD_API_KEY_SECRET",
    "VICTRON_USER",
    "VICTRON_PASS",
];

impl VendorCredentials {
    pub fn from_env() -> Result<Self> {
        Figment::new()
            .merge(Env::raw().only(VENDOR_ENV_KEYS))
            .extract()
            .context("invalid vendor credentials in environment")
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_figment(
            Figment::new()
                .merge(Toml::file("config/default.toml"))
                .merge(Env::prefixed("PVF__").split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let mut cfg: Config = figment.extract().context("invalid configuration")?;
        cfg.credentials = VendorCredentials::from_env()?;
        Ok(cfg)
    }
}
