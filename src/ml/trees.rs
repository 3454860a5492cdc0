//! Gradient-boosted tree ensembles in XGBoost's JSON model format.
//!
//! Only what inference needs is read: the tree arrays, the base score, the
//! feature names and the objective (which must have an identity link).

use serde::Deserialize;

use super::ModelError;

const IDENTITY_OBJECTIVES: &[&str] = &[
    "reg:squarederror",
    "reg:linear",
    "reg:absoluteerror",
    "reg:pseudohubererror",
    "reg:quantileerror",
];

#[derive(Debug, Clone, PartialEq)]
struct Tree {
    left: Vec<i32>,
    right: Vec<i32>,
    feature: Vec<usize>,
    /// Split threshold for internal nodes, leaf value for leaves
    value: Vec<f64>,
    default_left: Vec<bool>,
}

impl Tree {
    fn from_raw(raw: RawTree, idx: usize) -> Result<Self, ModelError> {
        let n = raw.left_children.len();
        let same_len = [
            raw.right_children.len(),
            raw.split_indices.len(),
            raw.split_conditions.len(),
            raw.default_left.len(),
        ]
        .iter()
        .all(|len| *len == n);
        if n == 0 || !same_len {
            return Err(ModelError::Format(format!("tree {idx}: node arrays are empty or ragged")));
        }
        let forward = |(parent, child): (usize, &i32)| {
            *child == -1 || (*child as usize > parent && (*child as usize) < n)
        };
        if !raw.left_children.iter().enumerate().all(forward)
            || !raw.right_children.iter().enumerate().all(forward)
        {
            return Err(ModelError::Format(format!("tree {idx}: child index out of range")));
        }

        Ok(Self {
            left: raw.left_children,
            right: raw.right_children,
            feature: raw.split_indices.into_iter().map(|i| i as usize).collect(),
            value: raw.split_conditions,
            default_left: raw.default_left.into_iter().map(|f| f.is_set()).collect(),
        })
    }

    fn predict(&self, row: &[f64]) -> f64 {
        let mut node = 0usize;
        // Children always point forward, so this walk terminates
        loop {
            if self.left[node] == -1 {
                return self.value[node];
            }
            let x = row.get(self.feature[node]).copied().unwrap_or(f64::NAN);
            let go_left = if x.is_nan() { self.default_left[node] } else { x < self.value[node] };
            let next = if go_left { self.left[node] } else { self.right[node] };
            node = next as usize;
        }
    }

    fn max_feature(&self) -> Option<usize> {
        self.left
            .iter()
            .zip(&self.feature)
            .filter(|(l, _)| **l != -1)
            .map(|(_, f)| *f)
            .max()
    }
}

/// A loaded XGBoost regression model
#[derive(Debug, Clone, PartialEq)]
pub struct TreeEnsemble {
    trees: Vec<Tree>,
    base_score: f64,
    feature_names: Vec<String>,
}

impl TreeEnsemble {
    pub fn from_json_str(raw: &str) -> Result<Self, ModelError> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| ModelError::Format(e.to_string()))?;
        Self::from_xgboost_json(&value)
    }

    pub fn from_xgboost_json(value: &serde_json::Value) -> Result<Self, ModelError> {
        let doc: XgbDocument =
            serde_json::from_value(value.clone()).map_err(|e| ModelError::Format(e.to_string()))?;
        let learner = doc.learner;

        if let Some(objective) = &learner.objective {
            if !IDENTITY_OBJECTIVES.contains(&objective.name.as_str()) {
                return Err(ModelError::UnsupportedObjective(objective.name.clone()));
            }
        }

        let base_score = learner
            .learner_model_param
            .base_score
            .trim_matches(|c| c == '[' || c == ']')
            .parse::<f64>()
            .map_err(|e| ModelError::Format(format!("base_score: {e}")))?;

        let trees = learner
            .gradient_booster
            .model
            .trees
            .into_iter()
            .enumerate()
            .map(|(i, raw)| Tree::from_raw(raw, i))
            .collect::<Result<Vec<_>, _>>()?;

        let ensemble = Self { trees, base_score, feature_names: learner.feature_names };
        if !ensemble.feature_names.is_empty() {
            if let Some(max) = ensemble.trees.iter().filter_map(Tree::max_feature).max() {
                if max >= ensemble.feature_names.len() {
                    return Err(ModelError::Format(format!(
                        "split on feature {max} but only {} names",
                        ensemble.feature_names.len()
                    )));
                }
            }
        }
        Ok(ensemble)
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn base_score(&self) -> f64 {
        self.base_score
    }

    /// Raw model output for one row. Missing values (NaN) follow each
    /// split's default direction.
    pub fn predict(&self, row: &[f64]) -> f64 {
        self.base_score + self.trees.iter().map(|t| t.predict(row)).sum::<f64>()
    }
}

#[derive(Debug, Deserialize)]
struct XgbDocument {
    learner: XgbLearner,
}

#[derive(Debug, Deserialize)]
struct XgbLearner {
    #[serde(default)]
    feature_names: Vec<String>,
    learner_model_param: LearnerModelParam,
    gradient_booster: GradientBooster,
    #[serde(default)]
    objective: Option<Objective>,
}

#[derive(Debug, Deserialize)]
struct LearnerModelParam {
    base_score: String,
}

#[derive(Debug, Deserialize)]
struct GradientBooster {
    model: GbTreeModel,
}

#[derive(Debug, Deserialize)]
struct GbTreeModel {
    trees: Vec<RawTree>,
}

#[derive(Debug, Deserialize)]
struct Objective {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawTree {
    left_children: Vec<i32>,
    right_children: Vec<i32>,
    split_indices: Vec<u32>,
    split_conditions: Vec<f64>,
    default_left: Vec<Flag>,
}

/// Older exports write `default_left` as 0/1, newer ones as booleans
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Int(u8),
}

impl Flag {
    fn is_set(&self) -> bool {
        match self {
            Flag::Bool(b) => *b,
            Flag::Int(i) => *i != 0,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use serde_json::json;

    /// Two stumps over features [a, b]:
    /// - a < 1.0 ? 1.0 : 2.0 (missing -> left)
    /// - b < 0.5 ? -0.5 : 0.5 (missing -> right)
    pub(crate) fn two_stump_model() -> serde_json::Value {
        json!({
            "learner": {
                "feature_names": ["a", "b"],
                "learner_model_param": { "base_score": "5E-1", "num_feature": "2" },
                "objective": { "name": "reg:squarederror" },
                "gradient_booster": {
                    "name": "gbtree",
                    "model": {
                        "trees": [
                            {
                                "left_children": [1, -1, -1],
                                "right_children": [2, -1, -1],
                                "split_indices": [0, 0, 0],
                                "split_conditions": [1.0, 1.0, 2.0],
                                "default_left": [1, 0, 0],
                                "base_weights": [0.0, 1.0, 2.0]
                            },
                            {
                                "left_children": [1, -1, -1],
                                "right_children": [2, -1, -1],
                                "split_indices": [1, 0, 0],
                                "split_conditions": [0.5, -0.5, 0.5],
                                "default_left": [false, false, false]
                            }
                        ]
                    }
                }
            }
        })
    }

    #[test]
    fn test_predict_walks_every_tree() {
        let model = TreeEnsemble::from_xgboost_json(&two_stump_model()).unwrap();
        assert_eq!(model.num_trees(), 2);
        assert_eq!(model.feature_names(), &["a".to_string(), "b".to_string()]);
        assert_abs_diff_eq!(model.predict(&[0.0, 0.0]), 0.5 + 1.0 - 0.5);
        assert_abs_diff_eq!(model.predict(&[1.0, 0.5]), 0.5 + 2.0 + 0.5);
    }

    #[test]
    fn test_missing_values_follow_default_direction() {
        let model = TreeEnsemble::from_xgboost_json(&two_stump_model()).unwrap();
        assert_abs_diff_eq!(model.predict(&[f64::NAN, f64::NAN]), 0.5 + 1.0 + 0.5);
        // Short rows are treated as missing too
        assert_abs_diff_eq!(model.predict(&[]), 2.0);
    }

    #[test]
    fn test_bracketed_base_score() {
        let mut doc = two_stump_model();
        doc["learner"]["learner_model_param"]["base_score"] = json!("[2.5E0]");
        let model = TreeEnsemble::from_xgboost_json(&doc).unwrap();
        assert_abs_diff_eq!(model.base_score(), 2.5);
    }

    #[test]
    fn test_rejects_classification_objective() {
        let mut doc = two_stump_model();
        doc["learner"]["objective"]["name"] = json!("binary:logistic");
        assert!(matches!(
            TreeEnsemble::from_xgboost_json(&doc),
            Err(ModelError::UnsupportedObjective(_))
        ));
    }

    #[test]
    fn test_rejects_ragged_tree() {
        let mut doc = two_stump_model();
        doc["learner"]["gradient_booster"]["model"]["trees"][0]["split_conditions"] = json!([1.0]);
        assert!(matches!(TreeEnsemble::from_xgboost_json(&doc), Err(ModelError::Format(_))));
    }

    #[test]
    fn test_rejects_split_beyond_feature_names() {
        let mut doc = two_stump_model();
        doc["learner"]["gradient_booster"]["model"]["trees"][1]["split_indices"] = json!([5, 0, 0]);
        assert!(TreeEnsemble::from_xgboost_json(&doc).is_err());
    }
}
