//! Pretrained PV models and the artifact format they ship in.

use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;

use super::trees::TreeEnsemble;
use super::ModelError;
use crate::domain::ModelKind;
use crate::forecast::features::{FeatureConfig, FeatureTable};

/// Extra input appended after the trained features: the row's horizon index
pub const HORIZON_IDX: &str = "horizon_idx";

/// On-disk model: metadata plus the exported booster.
///
/// ```json
/// { "kind": "gb", "version": "0.4.0", "normalize_targets": true,
///   "horizons": {"duration_minutes": 15, "count": 192}, "num_days_history": 7,
///   "booster": { "learner": { ... } } }
/// ```
#[derive(Debug, Deserialize)]
pub struct ModelArtifact {
    pub kind: ModelKind,
    pub version: String,
    #[serde(flatten)]
    pub features: FeatureConfig,
    #[serde(default = "default_true")]
    pub normalize_targets: bool,
    pub booster: serde_json::Value,
}

fn default_true() -> bool {
    true
}

impl ModelArtifact {
    pub fn from_json_str(raw: &str) -> Result<Self, ModelError> {
        serde_json::from_str(raw).map_err(|e| ModelError::Format(e.to_string()))
    }

    pub fn into_model(self) -> Result<PvModel, ModelError> {
        let ensemble = TreeEnsemble::from_xgboost_json(&self.booster)?;
        match self.kind {
            ModelKind::Gb => Ok(PvModel::Horizon(HorizonRegressor::new(
                ensemble,
                self.features,
                self.normalize_targets,
                self.version,
            )?)),
            ModelKind::Xgb => Ok(PvModel::Tabular(TabularRegressor::new(ensemble, self.version)?)),
        }
    }
}

/// Gradient-boosted model over per-horizon features.
///
/// Predicts power as a fraction of `capacity × poa_global` and scales it
/// back to kW when `normalize_targets` is set.
#[derive(Debug, Clone)]
pub struct HorizonRegressor {
    ensemble: TreeEnsemble,
    features: FeatureConfig,
    normalize_targets: bool,
    version: String,
}

impl HorizonRegressor {
    pub fn new(
        ensemble: TreeEnsemble,
        features: FeatureConfig,
        normalize_targets: bool,
        version: String,
    ) -> Result<Self, ModelError> {
        if ensemble.feature_names().is_empty() {
            return Err(ModelError::Format("gb model has no feature names".to_string()));
        }
        features.horizons.validate()?;
        Ok(Self { ensemble, features, normalize_targets, version })
    }

    pub fn feature_config(&self) -> &FeatureConfig {
        &self.features
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    fn trained_features(&self) -> BTreeSet<&str> {
        self.ensemble
            .feature_names()
            .iter()
            .map(|s| s.as_str())
            .filter(|s| *s != HORIZON_IDX)
            .collect()
    }

    /// One prediction (kW) per horizon row
    pub fn predict(&self, table: &FeatureTable) -> Result<Vec<f64>, ModelError> {
        let trained = self.trained_features();
        let given: BTreeSet<&str> = table.model_names().collect();
        if trained != given {
            return Err(ModelError::FeatureMismatch {
                missing: trained.difference(&given).map(|s| s.to_string()).collect(),
                unexpected: given.difference(&trained).map(|s| s.to_string()).collect(),
            });
        }

        let columns: Vec<Option<&[f64]>> = self
            .ensemble
            .feature_names()
            .iter()
            .map(|name| table.get(name))
            .collect();
        let scale = if self.normalize_targets {
            let poa = table
                .get("_poa_global")
                .ok_or_else(|| ModelError::MissingFeature("_poa_global".to_string()))?;
            let capacity = table
                .get("_capacity")
                .ok_or_else(|| ModelError::MissingFeature("_capacity".to_string()))?;
            Some((poa, capacity))
        } else {
            None
        };

        let mut row = vec![0.0; columns.len()];
        let predictions = (0..table.rows())
            .map(|i| {
                for (slot, column) in row.iter_mut().zip(&columns) {
                    // Only `horizon_idx` has no column, the set check above guarantees it
                    *slot = column.map_or(i as f64, |c| c[i]);
                }
                let pred = self.ensemble.predict(&row);
                match scale {
                    Some((poa, capacity)) => pred * capacity[i] * poa[i],
                    None => pred,
                }
            })
            .collect();
        Ok(predictions)
    }
}

/// XGBoost model over 15-minutely weather rows; predicts kW directly
#[derive(Debug, Clone)]
pub struct TabularRegressor {
    ensemble: TreeEnsemble,
    version: String,
}

impl TabularRegressor {
    pub fn new(ensemble: TreeEnsemble, version: String) -> Result<Self, ModelError> {
        if ensemble.feature_names().is_empty() {
            return Err(ModelError::Format("xgb model has no feature names".to_string()));
        }
        Ok(Self { ensemble, version })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn predict(&self, table: &FeatureTable) -> Result<Vec<f64>, ModelError> {
        let columns = self
            .ensemble
            .feature_names()
            .iter()
            .map(|name| table.get(name).ok_or_else(|| ModelError::MissingFeature(name.clone())))
            .collect::<Result<Vec<_>, _>>()?;

        let mut row = vec![0.0; columns.len()];
        Ok((0..table.rows())
            .map(|i| {
                for (slot, column) in row.iter_mut().zip(&columns) {
                    *slot = column[i];
                }
                self.ensemble.predict(&row)
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
pub enum PvModel {
    Horizon(HorizonRegressor),
    Tabular(TabularRegressor),
}

impl PvModel {
    pub fn kind(&self) -> ModelKind {
        match self {
            PvModel::Horizon(_) => ModelKind::Gb,
            PvModel::Tabular(_) => ModelKind::Xgb,
        }
    }

    pub fn version(&self) -> &str {
        match self {
            PvModel::Horizon(m) => m.version(),
            PvModel::Tabular(m) => m.version(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.display().to_string(),
            source,
        })?;
        ModelArtifact::from_json_str(&raw)?.into_model()
    }
}
