//! Risk model: boosted shallow decision trees with a frozen Platt
//! calibration on top.
//!
//! ```text
//! x ─→ Σ trees(x) · lr + base ─→ raw ─→ σ(slope · raw + intercept) ─→ p
//! ```
//!
//! The ensemble is trained offline and shipped as a JSON artifact. The runtime
//! performs inference only. A loaded [`RiskModel`] is immutable; replacing it
//! goes through [`ModelHandle::publish`].

use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::config::{PredictionConfig, RiskBands};
use crate::error::{Result, RiskError};
use crate::features::{validate_values, FeatureVector, FEATURE_COUNT, FEATURE_NAMES};
use crate::models::{ContributingFactor, PredictionResult, RiskLevel};

const DEFAULT_MODEL: &str = include_str!("../assets/default_model.json");

/// Tree node; children always sit at a higher index than their parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeNode {
    /// `x[feature] <= threshold` goes left
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    pub nodes: Vec<TreeNode>,
}

impl DecisionTree {
    fn evaluate(&self, x: &[f64]) -> f64 {
        let mut index = 0;
        loop {
            match &self.nodes[index] {
                TreeNode::Leaf(value) => return *value,
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    index = if x[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }

    fn validate(&self, tree: usize) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(corrupt(format!("tree {tree} has no nodes")));
        }
        for (i, node) in self.nodes.iter().enumerate() {
            match node {
                TreeNode::Leaf(value) if !value.is_finite() => {
                    return Err(corrupt(format!("tree {tree} node {i}: non-finite leaf")));
                }
                TreeNode::Leaf(_) => {}
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    if *feature >= FEATURE_COUNT {
                        return Err(corrupt(format!(
                            "tree {tree} node {i}: feature {feature} out of range"
                        )));
                    }
                    if !threshold.is_finite() {
                        return Err(corrupt(format!("tree {tree} node {i}: non-finite threshold")));
                    }
                    for child in [left, right] {
                        if *child <= i || *child >= self.nodes.len() {
                            return Err(corrupt(format!(
                                "tree {tree} node {i}: child {child} must follow its parent"
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Mean leaf value reachable from `index`.
    fn subtree_mean(&self, index: usize) -> f64 {
        let (sum, count) = self.subtree_leaves(index);
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }

    fn subtree_leaves(&self, index: usize) -> (f64, usize) {
        match &self.nodes[index] {
            TreeNode::Leaf(value) => (*value, 1),
            TreeNode::Split { left, right, .. } => {
                let (ls, lc) = self.subtree_leaves(*left);
                let (rs, rc) = self.subtree_leaves(*right);
                (ls + rs, lc + rc)
            }
        }
    }
}

/// Logistic re-fit of raw ensemble scores, frozen at training time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlattCalibration {
    pub slope: f64,
    pub intercept: f64,
}

impl PlattCalibration {
    pub fn apply(&self, raw: f64) -> f64 {
        sigmoid(self.slope * raw + self.intercept)
    }
}

/// Serialized model artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub model_id: String,
    pub model_version: String,
    pub feature_names: Vec<String>,
    pub base_score: f64,
    pub learning_rate: f64,
    pub trees: Vec<DecisionTree>,
    pub calibration: PlattCalibration,
    /// Global importances; derived from the trees when omitted
    #[serde(default)]
    pub feature_importances: Vec<f64>,
    /// Training means used as the per-input deviation baseline
    pub feature_means: Vec<f64>,
}

/// Immutable, validated model ready for inference.
#[derive(Debug, Clone)]
pub struct RiskModel {
    artifact: ModelArtifact,
    importances: [f64; FEATURE_COUNT],
    means: [f64; FEATURE_COUNT],
    bands: RiskBands,
    top_factors: usize,
}

impl RiskModel {
    pub fn from_artifact(
        artifact: ModelArtifact,
        bands: RiskBands,
        prediction: &PredictionConfig,
    ) -> Result<Self> {
        validate_artifact(&artifact)?;
        let importances = if artifact.feature_importances.is_empty() {
            derive_importances(&artifact.trees)
        } else {
            to_array(&artifact.feature_importances, "feature_importances")?
        };
        let means = to_array(&artifact.feature_means, "feature_means")?;
        tracing::debug!(
            model = %artifact.model_id,
            trees = artifact.trees.len(),
            "risk model validated"
        );
        Ok(Self {
            artifact,
            importances,
            means,
            bands,
            top_factors: prediction.top_factors,
        })
    }

    pub fn from_json(json: &str, bands: RiskBands, prediction: &PredictionConfig) -> Result<Self> {
        let artifact: ModelArtifact = serde_json::from_str(json)
            .map_err(|e| RiskError::ModelUnavailable(format!("artifact parse error: {e}")))?;
        Self::from_artifact(artifact, bands, prediction)
    }

    pub fn from_file(path: &Path, bands: RiskBands, prediction: &PredictionConfig) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            RiskError::ModelUnavailable(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&json, bands, prediction)
    }

    /// The artifact bundled with the crate.
    pub fn bundled(bands: RiskBands, prediction: &PredictionConfig) -> Result<Self> {
        Self::from_json(DEFAULT_MODEL, bands, prediction)
    }

    pub fn model_id(&self) -> &str {
        &self.artifact.model_id
    }

    pub fn model_version(&self) -> &str {
        &self.artifact.model_version
    }

    pub fn importances(&self) -> &[f64; FEATURE_COUNT] {
        &self.importances
    }

    pub fn bands(&self) -> &RiskBands {
        &self.bands
    }

    /// Uncalibrated ensemble score.
    pub fn raw_score(&self, vector: &FeatureVector) -> f64 {
        let x = vector.values();
        let sum: f64 = self.artifact.trees.iter().map(|t| t.evaluate(x)).sum();
        self.artifact.base_score + self.artifact.learning_rate * sum
    }

    pub fn predict(&self, vector: &FeatureVector) -> Result<PredictionResult> {
        vector.validate()?;
        let probability = self
            .artifact
            .calibration
            .apply(self.raw_score(vector))
            .clamp(0.0, 1.0);
        Ok(PredictionResult {
            failure_probability: probability,
            confidence: confidence(probability),
            risk_level: risk_level(probability, &self.bands),
            top_factors: self.top_factors(vector),
        })
    }

    /// Score an externally supplied slice; rejects wrong length or non-finite values.
    pub fn predict_values(&self, values: &[f64]) -> Result<PredictionResult> {
        validate_values(values)?;
        let mut array = [0.0; FEATURE_COUNT];
        array.copy_from_slice(values);
        self.predict(&FeatureVector::from_values(array))
    }

    pub fn predict_batch(&self, vectors: &[FeatureVector]) -> Result<Vec<PredictionResult>> {
        vectors.iter().map(|v| self.predict(v)).collect()
    }

    fn top_factors(&self, vector: &FeatureVector) -> Vec<ContributingFactor> {
        let x = vector.values();
        let mut factors: Vec<ContributingFactor> = (0..FEATURE_COUNT)
            .map(|i| ContributingFactor {
                feature_name: FEATURE_NAMES[i].to_string(),
                feature_index: i,
                importance: self.importances[i] * (x[i] - self.means[i]).abs(),
                value: x[i],
            })
            .filter(|f| f.importance > 0.0)
            .collect();
        factors.sort_by(|a, b| {
            b.importance
                .total_cmp(&a.importance)
                .then(a.feature_index.cmp(&b.feature_index))
        });
        factors.truncate(self.top_factors);
        factors
    }
}

/// Model reference shared across workers. Readers clone the `Arc`; a retrain
/// builds a new model elsewhere and swaps the pointer.
#[derive(Debug)]
pub struct ModelHandle {
    current: RwLock<Arc<RiskModel>>,
}

impl ModelHandle {
    pub fn new(model: RiskModel) -> Self {
        Self {
            current: RwLock::new(Arc::new(model)),
        }
    }

    pub fn current(&self) -> Arc<RiskModel> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Publish a replacement; calls already holding the old model finish on it.
    pub fn publish(&self, model: RiskModel) -> Arc<RiskModel> {
        let next = Arc::new(model);
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let previous = std::mem::replace(&mut *guard, Arc::clone(&next));
        tracing::info!(
            from = %previous.model_id(),
            to = %next.model_id(),
            "published risk model"
        );
        previous
    }
}

pub fn confidence(probability: f64) -> f64 {
    (probability - 0.5).abs() * 2.0
}

pub fn risk_level(probability: f64, bands: &RiskBands) -> RiskLevel {
    if probability >= bands.critical {
        RiskLevel::Critical
    } else if probability >= bands.high {
        RiskLevel::High
    } else if probability >= bands.medium {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

fn validate_artifact(artifact: &ModelArtifact) -> Result<()> {
    if artifact.feature_names.len() != FEATURE_COUNT
        || artifact
            .feature_names
            .iter()
            .zip(FEATURE_NAMES.iter())
            .any(|(a, b)| a != b)
    {
        return Err(corrupt(
            "feature names do not match the extractor layout".to_string(),
        ));
    }
    if artifact.trees.is_empty() {
        return Err(corrupt("artifact has no trees".to_string()));
    }
    for (i, tree) in artifact.trees.iter().enumerate() {
        tree.validate(i)?;
    }
    if !artifact.base_score.is_finite() || !artifact.learning_rate.is_finite() {
        return Err(corrupt("non-finite base score or learning rate".to_string()));
    }
    let cal = artifact.calibration;
    if !(cal.slope.is_finite() && cal.slope > 0.0 && cal.intercept.is_finite()) {
        return Err(corrupt(format!(
            "calibration must be increasing and finite, got slope {} intercept {}",
            cal.slope, cal.intercept
        )));
    }
    Ok(())
}

/// Importance of a split = gap between the mean leaf values of its two
/// branches, summed per feature and normalized to 1.
fn derive_importances(trees: &[DecisionTree]) -> [f64; FEATURE_COUNT] {
    let mut importances = [0.0; FEATURE_COUNT];
    for tree in trees {
        for node in &tree.nodes {
            if let TreeNode::Split {
                feature,
                left,
                right,
                ..
            } = node
            {
                importances[*feature] += (tree.subtree_mean(*left) - tree.subtree_mean(*right)).abs();
            }
        }
    }
    let total: f64 = importances.iter().sum();
    if total > 0.0 {
        for value in &mut importances {
            *value /= total;
        }
    }
    importances
}

fn to_array(values: &[f64], field: &str) -> Result<[f64; FEATURE_COUNT]> {
    if values.len() != FEATURE_COUNT || values.iter().any(|v| !v.is_finite()) {
        return Err(corrupt(format!(
            "{field} must hold {FEATURE_COUNT} finite values, got {}",
            values.len()
        )));
    }
    let mut array = [0.0; FEATURE_COUNT];
    array.copy_from_slice(values);
    Ok(array)
}

fn corrupt(reason: String) -> RiskError {
    RiskError::ModelUnavailable(reason)
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let ez = z.exp();
        ez / (1.0 + ez)
    }
}
