use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;
use validator::Validate;

use super::{error::ApiError, AppState};
use crate::domain::{parse_timestamp, ModelKind, NwpSource, PvSite, TIMESTAMP_FORMAT};
use crate::inverters::inverter_for;

#[derive(Debug, Deserialize)]
pub struct ForecastRequest {
    pub site: PvSite,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub model: Option<ModelKind>,
    #[serde(default)]
    pub nwp_source: Option<NwpSource>,
    /// Pull live generation when the site has an inverter (default true)
    #[serde(default)]
    pub live: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct ForecastResponse {
    pub timestamp: String,
    pub predictions: Predictions,
}

#[derive(Debug, Serialize)]
pub struct Predictions {
    pub power_kw: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_kw_no_live_pv: Option<BTreeMap<String, f64>>,
}

/// POST /forecast
pub async fn forecast(
    State(state): State<AppState>,
    payload: Result<Json<ForecastRequest>, JsonRejection>,
) -> Result<Json<ForecastResponse>, ApiError> {
    let Json(request) = payload?;
    request.site.validate()?;

    let ts = match request.timestamp.as_deref() {
        Some(raw) => Some(
            parse_timestamp(raw)
                .ok_or_else(|| ApiError::ValidationError(format!("unrecognised timestamp `{raw}`")))?,
        ),
        None => None,
    };

    let inverter = if request.live.unwrap_or(true) {
        inverter_for(request.site.inverter_type, &state.config)?
    } else {
        None
    };

    let site = request.site.round_latitude_and_longitude();
    info!(
        lat = site.latitude,
        lon = site.longitude,
        capacity_kwp = site.capacity_kwp,
        inverter = %site.inverter_type,
        "forecast requested"
    );

    let forecast = state
        .engine
        .forecast_with_live(&site, ts, request.model, request.nwp_source, inverter.as_deref())
        .await?;

    Ok(Json(ForecastResponse {
        timestamp: forecast.timestamp.format(TIMESTAMP_FORMAT).to_string(),
        predictions: Predictions {
            power_kw: forecast.power_kw.to_map(),
            power_kw_no_live_pv: forecast.power_kw_no_live_pv.map(|s| s.to_map()),
        },
    }))
}
