#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use figment::providers::{Format, Serialized, Toml};
use figment::Figment;
use pv_site_forecast::config::Config;
use pv_site_forecast::domain::NwpSource;
use pv_site_forecast::forecast::features::{FeatureBuilder, FeatureConfig};
use pv_site_forecast::ml::{ModelArtifact, PvModel};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Stock configuration with Open-Meteo pointed at `weather_url`
pub fn config(weather_url: &str) -> Config {
    Config::from_figment(
        Figment::new()
            .merge(Toml::string(include_str!("../../config/default.toml")))
            .merge(Serialized::default("weather.forecast_base_url", weather_url))
            .merge(Serialized::default("weather.historical_base_url", weather_url))
            .merge(Serialized::default("weather.max_retries", 0)),
    )
    .unwrap()
}

/// gb model with a single leaf: 0.8 kW per kWp per kW/m² of clear-sky POA
pub fn constant_gb_model() -> PvModel {
    let builder = FeatureBuilder::new(FeatureConfig::default()).unwrap();
    let mut names = builder.feature_names(&[NwpSource::Icon]).unwrap();
    names.push("horizon_idx".to_string());
    let doc = json!({
        "kind": "gb",
        "version": "it",
        "booster": { "learner": {
            "feature_names": names,
            "learner_model_param": { "base_score": "0E0" },
            "objective": { "name": "reg:squarederror" },
            "gradient_booster": { "model": { "trees": [{
                "left_children": [-1],
                "right_children": [-1],
                "split_indices": [0],
                "split_conditions": [8e-4],
                "default_left": [0]
            }] } }
        } }
    });
    serde_json::from_value::<ModelArtifact>(doc).unwrap().into_model().unwrap()
}

/// Eight days of hourly values for every NWP variable, from midnight of `from`
pub fn hourly_body(from: DateTime<Utc>) -> Value {
    let init = from.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc();
    let times: Vec<String> = (0..24 * 8)
        .map(|h| (init + Duration::hours(h)).format("%Y-%m-%dT%H:%M").to_string())
        .collect();
    let n = times.len();
    json!({
        "latitude": 51.75,
        "longitude": -1.25,
        "hourly": {
            "time": times,
            "visibility": vec![24000.0; n],
            "windspeed_10m": vec![3.0; n],
            "temperature_2m": vec![15.0; n],
            "precipitation": vec![0.0; n],
            "shortwave_radiation": vec![300.0; n],
            "direct_radiation": vec![150.0; n],
            "cloudcover_low": vec![20.0; n],
            "cloudcover_mid": vec![10.0; n],
            "cloudcover_high": vec![5.0; n]
        }
    })
}

/// Open-Meteo double serving the ICON endpoint
pub async fn open_meteo(from: DateTime<Utc>) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/dwd-icon"))
        .respond_with(ResponseTemplate::new(200).set_body_json(hourly_body(from)))
        .mount(&server)
        .await;
    server
}
