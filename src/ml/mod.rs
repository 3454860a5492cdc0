//! Machine Learning Module
//!
//! Inference only: models are trained elsewhere and exported as XGBoost
//! JSON, wrapped in a small artifact that also records the feature setup
//! they were trained with.
//!
//! # Architecture
//! - [`trees`]: tree ensemble evaluation
//! - [`models`]: the per-horizon (gb) and tabular (xgb) regressors
//! - [`inference`]: registry of loaded models

use thiserror::Error;

use crate::domain::ModelKind;
use crate::forecast::features::FeatureError;

pub mod inference;
pub mod models;
pub mod trees;

pub use inference::ModelRegistry;
pub use models::{HorizonRegressor, ModelArtifact, PvModel, TabularRegressor};
pub use trees::TreeEnsemble;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("cannot read model file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid model: {0}")]
    Format(String),

    #[error("unsupported objective `{0}`, only identity-link regression is supported")]
    UnsupportedObjective(String),

    #[error("features do not match the trained model (missing: {missing:?}, unexpected: {unexpected:?})")]
    FeatureMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    #[error("feature `{0}` is required by the model but was not built")]
    MissingFeature(String),

    #[error("no {0} model is loaded")]
    NotLoaded(ModelKind),

    #[error(transparent)]
    Features(#[from] FeatureError),
}
