use axum::{extract::State, Json};
use serde::Serialize;

use super::AppState;
use crate::domain::ModelKind;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    models: Vec<ModelKind>,
}

/// GET /health
///
/// Always ok once the server is up; `models` lists what can be served.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        models: state.engine.models().kinds().await,
    })
}
