//! Engine configuration.
//!
//! Every constant that encodes a value judgment (normalization scales, risk
//! bands, propagation decay) lives here rather than in the algorithms. The
//! whole structure deserializes from TOML with every field defaulted, so a
//! config file only needs the values it overrides.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RiskError};

/// Hard ceiling on the minimal-safe-path combination size.
pub const MAX_COMBINATION_SIZE_CAP: usize = 3;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub features: FeatureConfig,
    pub bands: RiskBands,
    pub prediction: PredictionConfig,
    pub simulation: SimulationConfig,
    pub propagation: PropagationConfig,
    pub explanation: ExplanationConfig,
}

/// Normalization constants used by the feature extractor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Upper bound of an attendance percentage
    pub attendance_max: f64,
    /// Upper bound of a single mark observation
    pub mark_max: f64,
    /// Divisor applied to raw regression slopes
    pub trend_scale: f64,
    pub max_semesters: f64,
    /// Subject count considered a normal load
    pub typical_load: f64,
    /// Difficulty assumed for subjects missing from the table
    pub default_difficulty: f64,
    /// Weight of attendance in the engagement composite (marks get the rest)
    pub engagement_attendance_weight: f64,
    pub subject_difficulty: BTreeMap<String, f64>,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        let subject_difficulty = [
            ("Math", 0.90),
            ("Calculus", 0.95),
            ("Linear Algebra", 0.85),
            ("Physics", 0.85),
            ("Chemistry", 0.80),
            ("Programming", 0.88),
            ("Data Structures", 0.90),
            ("Algorithms", 0.92),
            ("Database", 0.75),
            ("Networks", 0.78),
        ]
        .into_iter()
        .map(|(name, difficulty)| (name.to_string(), difficulty))
        .collect();

        Self {
            attendance_max: 100.0,
            mark_max: 20.0,
            trend_scale: 10.0,
            max_semesters: 8.0,
            typical_load: 6.0,
            default_difficulty: 1.0,
            engagement_attendance_weight: 0.5,
            subject_difficulty,
        }
    }
}

/// Probability thresholds that band a prediction into a risk level.
/// A probability below `medium` is low; at or above `critical` is critical.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskBands {
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for RiskBands {
    fn default() -> Self {
        Self {
            medium: 0.25,
            high: 0.50,
            critical: 0.75,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    /// Number of contributing factors attached to each prediction
    pub top_factors: usize,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self { top_factors: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub top_k: usize,
    pub target_probability: f64,
    /// Largest number of interventions composed by the safe-path search
    pub max_combination_size: usize,
    /// Upper bound on model evaluations spent by one safe-path search
    pub max_evaluations: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            target_probability: 0.25,
            max_combination_size: 2,
            max_evaluations: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationConfig {
    /// Multiplier applied per edge traversal
    pub decay: f64,
    /// Propagated values at or below this are dropped
    pub cutoff: f64,
    /// Current courses are projected only above this source probability
    pub min_source_probability: f64,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            decay: 0.8,
            cutoff: 0.2,
            min_source_probability: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplanationConfig {
    /// Seconds an explanation collaborator may run before it is killed
    pub timeout_seconds: u64,
}

impl Default for ExplanationConfig {
    fn default() -> Self {
        Self { timeout_seconds: 30 }
    }
}

impl ExplanationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl EngineConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| RiskError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RiskError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<()> {
        let f = &self.features;
        for (name, value) in [
            ("features.attendance_max", f.attendance_max),
            ("features.mark_max", f.mark_max),
            ("features.trend_scale", f.trend_scale),
            ("features.max_semesters", f.max_semesters),
            ("features.typical_load", f.typical_load),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(RiskError::InvalidConfig(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        if !f.default_difficulty.is_finite() || f.default_difficulty < 0.0 {
            return Err(RiskError::InvalidConfig(format!(
                "features.default_difficulty must be non-negative, got {}",
                f.default_difficulty
            )));
        }
        if let Some((subject, value)) = f
            .subject_difficulty
            .iter()
            .find(|(_, v)| !v.is_finite() || **v < 0.0)
        {
            return Err(RiskError::InvalidConfig(format!(
                "difficulty for {subject} must be non-negative, got {value}"
            )));
        }
        check_unit("features.engagement_attendance_weight", f.engagement_attendance_weight)?;

        let b = &self.bands;
        check_unit("bands.medium", b.medium)?;
        check_unit("bands.high", b.high)?;
        check_unit("bands.critical", b.critical)?;
        if !(b.medium < b.high && b.high < b.critical) {
            return Err(RiskError::InvalidConfig(format!(
                "risk bands must increase strictly: {} < {} < {}",
                b.medium, b.high, b.critical
            )));
        }

        let s = &self.simulation;
        check_unit("simulation.target_probability", s.target_probability)?;
        if s.max_combination_size == 0 || s.max_combination_size > MAX_COMBINATION_SIZE_CAP {
            return Err(RiskError::InvalidConfig(format!(
                "simulation.max_combination_size must be in 1..={MAX_COMBINATION_SIZE_CAP}, got {}",
                s.max_combination_size
            )));
        }
        if s.max_evaluations == 0 {
            return Err(RiskError::InvalidConfig(
                "simulation.max_evaluations must be positive".into(),
            ));
        }

        let p = &self.propagation;
        if !(p.decay > 0.0 && p.decay <= 1.0) {
            return Err(RiskError::InvalidConfig(format!(
                "propagation.decay must be in (0, 1], got {}",
                p.decay
            )));
        }
        check_unit("propagation.cutoff", p.cutoff)?;
        check_unit("propagation.min_source_probability", p.min_source_probability)?;

        if self.explanation.timeout_seconds == 0 {
            return Err(RiskError::InvalidConfig(
                "explanation.timeout_seconds must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn check_unit(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(RiskError::InvalidConfig(format!(
            "{name} must be within [0, 1], got {value}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = EngineConfig::from_toml(
            r#"
            [propagation]
            decay = 0.7

            [simulation]
            top_k = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.propagation.decay, 0.7);
        assert_eq!(config.propagation.cutoff, 0.2);
        assert_eq!(config.simulation.top_k, 5);
        assert_eq!(config.bands.critical, 0.75);
        assert_eq!(config.features.subject_difficulty.get("Algorithms"), Some(&0.92));
        assert_eq!(config.explanation.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn rejects_zero_explanation_timeout() {
        let err = EngineConfig::from_toml("[explanation]\ntimeout_seconds = 0\n").unwrap_err();
        assert!(matches!(err, RiskError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_unordered_bands() {
        let err = EngineConfig::from_toml(
            r#"
            [bands]
            medium = 0.6
            high = 0.5
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, RiskError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_combination_size_above_cap() {
        let mut config = EngineConfig::default();
        config.simulation.max_combination_size = MAX_COMBINATION_SIZE_CAP + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "[prediction]\ntop_factors = 3\n").unwrap();
        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.prediction.top_factors, 3);
    }
}
