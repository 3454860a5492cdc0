pub mod error;
pub mod forecast;
pub mod health;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::{config::Config, forecast::ForecastEngine};

/// Shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: ForecastEngine,
}

impl AppState {
    pub fn new(config: Config, engine: ForecastEngine) -> Self {
        Self { config: Arc::new(config), engine }
    }
}

pub fn router(state: AppState) -> Router {
    let cfg = state.config.clone();
    let mut router = Router::new()
        .route("/health", get(health::health_check))
        .route("/forecast", post(forecast::forecast))
        .with_state(state);

    if cfg.server.enable_cors {
        use tower_http::cors::Any;
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers(Any);
        router = router.layer(cors);
    }

    router
        .layer(
            ServiceBuilder::new()
                .layer(axum::extract::DefaultBodyLimit::max(1024 * 1024))
                .layer(TimeoutLayer::new(Duration::from_secs(cfg.server.request_timeout_secs))),
        )
        .layer(TraceLayer::new_for_http())
}
