//! ML Model Inference Engine
//!
//! Holds the models loaded at startup, keyed by kind.

use super::{models::PvModel, ModelError};
use crate::config::ModelsConfig;
use crate::domain::ModelKind;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Model Registry for managing the loaded models
#[derive(Clone, Default)]
pub struct ModelRegistry {
    models: Arc<RwLock<HashMap<ModelKind, Arc<PvModel>>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every configured model. A missing or broken file is logged and
    /// that kind stays unavailable; the rest of the service still runs.
    pub async fn from_config(cfg: &ModelsConfig) -> Self {
        let registry = Self::new();
        for (kind, path) in [(ModelKind::Gb, &cfg.gb_path), (ModelKind::Xgb, &cfg.xgb_path)] {
            if let Err(err) = registry.load(kind, path).await {
                warn!(%kind, path = %path.display(), error = %err, "model not loaded");
            }
        }
        registry
    }

    /// Load a model file and register it under `kind`
    pub async fn load(&self, kind: ModelKind, path: &Path) -> Result<(), ModelError> {
        let model = PvModel::load(path)?;
        if model.kind() != kind {
            return Err(ModelError::Format(format!(
                "{} holds a {} model, expected {kind}",
                path.display(),
                model.kind()
            )));
        }
        info!(%kind, version = model.version(), path = %path.display(), "model loaded");
        self.register(model).await;
        Ok(())
    }

    pub async fn register(&self, model: PvModel) {
        let mut models = self.models.write().await;
        models.insert(model.kind(), Arc::new(model));
    }

    pub async fn get(&self, kind: ModelKind) -> Result<Arc<PvModel>, ModelError> {
        let models = self.models.read().await;
        models.get(&kind).cloned().ok_or(ModelError::NotLoaded(kind))
    }

    /// Kinds currently available, sorted
    pub async fn kinds(&self) -> Vec<ModelKind> {
        let models = self.models.read().await;
        let mut kinds: Vec<ModelKind> = models.keys().copied().collect();
        kinds.sort_by_key(|k| k.to_string());
        kinds
    }
}
