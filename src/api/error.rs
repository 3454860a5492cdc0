use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::forecast::weather::WeatherError;
use crate::inverters::InverterError;
use crate::ml::ModelError;

/// API error types that can be returned from handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

/// Error response that gets serialized to JSON
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl ApiError {
    /// Get the HTTP status code for this error
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error type string
    fn error_type(&self) -> &'static str {
        match self {
            ApiError::ValidationError(_) => "ValidationError",
            ApiError::ServiceUnavailable(_) => "ServiceUnavailable",
            ApiError::Upstream(_) => "UpstreamError",
            ApiError::InternalError(_) => "InternalServerError",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_type = self.error_type();

        let message = match &self {
            ApiError::InternalError(_) => {
                tracing::error!(error = %self, "API error occurred");
                "An internal error occurred".to_string()
            }
            ApiError::Upstream(_) => {
                tracing::warn!(error = %self, "Upstream failure");
                "An upstream data source failed".to_string()
            }
            ApiError::ServiceUnavailable(detail) => {
                tracing::warn!(error = %self, "Service unavailable");
                detail.clone()
            }
            ApiError::ValidationError(_) => {
                tracing::debug!(error = %self, "Client error");
                self.to_string()
            }
        };

        let error_response = ErrorResponse {
            error: error_type.to_string(),
            message,
        };

        (status, Json(error_response)).into_response()
    }
}

// Conversion from common error types

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        let detail = format!("{error:#}");
        for cause in error.chain() {
            if let Some(ModelError::NotLoaded(kind)) = cause.downcast_ref::<ModelError>() {
                return ApiError::ServiceUnavailable(format!("no {kind} model is loaded"));
            }
            if cause.is::<WeatherError>() || cause.is::<InverterError>() {
                return ApiError::Upstream(detail);
            }
        }
        ApiError::InternalError(detail)
    }
}

impl From<InverterError> for ApiError {
    fn from(error: InverterError) -> Self {
        match error {
            InverterError::MissingCredential(name) => {
                ApiError::ServiceUnavailable(format!("live data is not configured ({name} is unset)"))
            }
            other => ApiError::Upstream(other.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::ValidationError(rejection.body_text())
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ApiError::ValidationError(errors.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ModelKind;
    use anyhow::Context;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            ApiError::ValidationError("test".to_string()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::Upstream("test".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::InternalError("test".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_unloaded_model_is_unavailable() {
        let err: anyhow::Error = ModelError::NotLoaded(ModelKind::Xgb).into();
        let api: ApiError = err.into();
        assert!(matches!(api, ApiError::ServiceUnavailable(ref m) if m == "no xgb model is loaded"));
    }

    #[test]
    fn test_weather_failure_behind_context_is_upstream() {
        let err = Err::<(), _>(WeatherError::Parse("bad".into()))
            .context("fetching icon NWP")
            .unwrap_err();
        assert_eq!(ApiError::from(err).status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_other_errors_are_internal() {
        let api = ApiError::from(anyhow::anyhow!("boom"));
        assert_eq!(api.error_type(), "InternalServerError");
        assert_eq!(
            ApiError::from(InverterError::MissingCredential("GIVENERGY_API_KEY")).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
