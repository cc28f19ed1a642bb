//! Counterfactual simulation over an intervention catalog.
//!
//! Each catalog entry perturbs the feature vector by declared deltas, scaled by
//! one of its magnitudes, then nudges causally dependent features through
//! declared couplings. The perturbed vector is re-scored and outcomes are
//! ranked by risk reduction per unit of effort. Results describe what the
//! model would predict, not a guaranteed real-world effect.

use std::cmp::Ordering;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{EngineConfig, SimulationConfig};
use crate::error::{Result, RiskError};
use crate::features::{feature_bounds, FeatureExtractor, FeatureVector, FEATURE_COUNT};
use crate::models::{
    AcademicRecord, InterventionResult, MinimalSafePath, PredictionResult, SafePathStatus,
    SafePathStep, WhatIfOutcome,
};
use crate::risk::RiskModel;

const DEFAULT_CATALOG: &str = include_str!("../assets/interventions.json");

/// Anything that scores a feature vector. The simulator only needs this seam.
pub trait RiskScorer {
    fn score(&self, vector: &FeatureVector) -> Result<PredictionResult>;
}

impl RiskScorer for RiskModel {
    fn score(&self, vector: &FeatureVector) -> Result<PredictionResult> {
        self.predict(vector)
    }
}

/// Additive change to one feature per unit of magnitude.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDelta {
    pub feature: usize,
    pub delta: f64,
}

/// Secondary perturbation: `target += fraction * applied change of source`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coupling {
    pub source: usize,
    pub target: usize,
    pub fraction: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MagnitudeUnit {
    Percent,
    Marks,
    Count,
    #[default]
    Plain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionSpec {
    pub name: String,
    /// Template; `{delta}` is replaced by the formatted magnitude
    pub description: String,
    #[serde(default)]
    pub unit: MagnitudeUnit,
    pub effort_cost: i64,
    pub deltas: Vec<FeatureDelta>,
    pub magnitudes: Vec<f64>,
    #[serde(default)]
    pub couplings: Vec<Coupling>,
}

impl InterventionSpec {
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| RiskError::InvalidIntervention {
            name: self.name.clone(),
            reason,
        };
        if self.effort_cost <= 0 {
            return Err(invalid(format!(
                "effort cost {} must be positive",
                self.effort_cost
            )));
        }
        if u32::try_from(self.effort_cost).is_err() {
            return Err(invalid(format!("effort cost {} is too large", self.effort_cost)));
        }
        if self.deltas.is_empty() {
            return Err(invalid("no feature deltas".into()));
        }
        if self.magnitudes.is_empty() {
            return Err(invalid("no magnitudes".into()));
        }
        if let Some(d) = self
            .deltas
            .iter()
            .find(|d| d.feature >= FEATURE_COUNT || !d.delta.is_finite())
        {
            return Err(invalid(format!(
                "delta {} on feature {} is not applicable",
                d.delta, d.feature
            )));
        }
        if let Some(m) = self.magnitudes.iter().find(|m| !m.is_finite()) {
            return Err(invalid(format!("non-finite magnitude {m}")));
        }
        for c in &self.couplings {
            if c.source >= FEATURE_COUNT || c.target >= FEATURE_COUNT || !c.fraction.is_finite() {
                return Err(invalid(format!(
                    "coupling {} -> {} ({}) is not applicable",
                    c.source, c.target, c.fraction
                )));
            }
            if !self.deltas.iter().any(|d| d.feature == c.source) {
                return Err(invalid(format!(
                    "coupling source {} is not perturbed by this intervention",
                    c.source
                )));
            }
        }
        Ok(())
    }

    /// Apply this intervention alone at `magnitude`.
    pub fn perturb(
        &self,
        base: &FeatureVector,
        magnitude: f64,
        bounds: &[(f64, f64); FEATURE_COUNT],
    ) -> FeatureVector {
        apply(base, &[(self, magnitude)], bounds)
    }

    pub fn describe(&self, magnitude: f64, mark_max: f64) -> String {
        let amount = magnitude.abs();
        let formatted = match self.unit {
            MagnitudeUnit::Percent => format!("{:.0}%", amount * 100.0),
            MagnitudeUnit::Marks => format!("{:.0}", amount * mark_max),
            MagnitudeUnit::Count => format!("{amount:.0}"),
            MagnitudeUnit::Plain => format!("{amount:.2}"),
        };
        self.description.replace("{delta}", &formatted)
    }

    /// Effort of a validated spec.
    fn effort(&self) -> u32 {
        u32::try_from(self.effort_cost).unwrap_or(u32::MAX)
    }

    fn raw_delta(&self, feature: usize, magnitude: f64) -> f64 {
        self.deltas
            .iter()
            .filter(|d| d.feature == feature)
            .map(|d| d.delta * magnitude)
            .sum()
    }

    /// Magnitudes ordered from the smallest change to the largest.
    fn magnitudes_ascending(&self) -> Vec<f64> {
        let mut magnitudes = self.magnitudes.clone();
        magnitudes.sort_by(|a, b| a.abs().total_cmp(&b.abs()));
        magnitudes
    }

    fn moderate_magnitude(&self) -> Option<f64> {
        self.magnitudes.get(1).or_else(|| self.magnitudes.first()).copied()
    }
}

/// Static catalog, loaded once and shared read-only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterventionCatalog {
    pub interventions: Vec<InterventionSpec>,
}

/// Catalog file shape; entries are decoded one at a time.
#[derive(Deserialize)]
struct RawCatalog {
    interventions: Vec<serde_json::Value>,
}

impl InterventionCatalog {
    /// Parse a catalog document. Entries that do not decode are logged and
    /// skipped; only an unreadable document is an error.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawCatalog =
            serde_json::from_str(json).map_err(|e| RiskError::InvalidIntervention {
                name: "<catalog>".into(),
                reason: e.to_string(),
            })?;

        let mut interventions = Vec::with_capacity(raw.interventions.len());
        for (position, entry) in raw.interventions.into_iter().enumerate() {
            let name = entry
                .get("name")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("#{position}"));
            match serde_json::from_value::<InterventionSpec>(entry) {
                Ok(spec) => interventions.push(spec),
                Err(err) => {
                    tracing::warn!(intervention = %name, error = %err, "skipping malformed intervention");
                }
            }
        }
        Ok(Self { interventions })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| RiskError::InvalidIntervention {
            name: "<catalog>".into(),
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        Self::from_json(&json)
    }

    pub fn bundled() -> Result<Self> {
        Self::from_json(DEFAULT_CATALOG)
    }

    pub fn get(&self, name: &str) -> Option<&InterventionSpec> {
        self.interventions.iter().find(|s| s.name == name)
    }

    /// Well-formed entries sorted by name; malformed ones are logged and skipped.
    fn valid_specs(&self) -> Vec<&InterventionSpec> {
        let mut specs: Vec<&InterventionSpec> = self
            .interventions
            .iter()
            .filter(|spec| match spec.validate() {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping malformed intervention");
                    false
                }
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }
}

/// Compose interventions additively: primary deltas sum per feature and are
/// clamped once; each coupling then follows the share of its source change
/// that survived clamping.
fn apply(
    base: &FeatureVector,
    parts: &[(&InterventionSpec, f64)],
    bounds: &[(f64, f64); FEATURE_COUNT],
) -> FeatureVector {
    let original = base.values();
    let mut raw = [0.0f64; FEATURE_COUNT];
    for (spec, magnitude) in parts {
        for d in &spec.deltas {
            raw[d.feature] += d.delta * magnitude;
        }
    }

    let mut values = *original;
    let mut surviving = [0.0f64; FEATURE_COUNT];
    for i in 0..FEATURE_COUNT {
        if raw[i] != 0.0 {
            let (lo, hi) = bounds[i];
            values[i] = (original[i] + raw[i]).clamp(lo, hi);
            surviving[i] = (values[i] - original[i]) / raw[i];
        }
    }

    let mut coupled = [0.0f64; FEATURE_COUNT];
    for (spec, magnitude) in parts {
        for c in &spec.couplings {
            let own = spec.raw_delta(c.source, *magnitude);
            coupled[c.target] += c.fraction * own * surviving[c.source];
        }
    }
    for i in 0..FEATURE_COUNT {
        if coupled[i] != 0.0 {
            let (lo, hi) = bounds[i];
            values[i] = (values[i] + coupled[i]).clamp(lo, hi);
        }
    }

    FeatureVector::from_values(values)
}

/// Effectiveness descending, then lower effort, then name.
pub(crate) fn rank_order(a: &InterventionResult, b: &InterventionResult) -> Ordering {
    b.effectiveness
        .total_cmp(&a.effectiveness)
        .then(a.effort_cost.cmp(&b.effort_cost))
        .then_with(|| a.name.cmp(&b.name))
}

struct Candidate<'c> {
    specs: Vec<&'c InterventionSpec>,
    magnitudes: Vec<f64>,
    effort: u32,
    probability: f64,
}

impl Candidate<'_> {
    fn change(&self) -> f64 {
        self.magnitudes.iter().map(|m| m.abs()).sum()
    }

    fn names(&self) -> Vec<&str> {
        self.specs.iter().map(|s| s.name.as_str()).collect()
    }

    fn order(&self, other: &Self) -> Ordering {
        self.effort
            .cmp(&other.effort)
            .then(self.change().total_cmp(&other.change()))
            .then(self.probability.total_cmp(&other.probability))
            .then_with(|| self.names().cmp(&other.names()))
    }
}

/// Pure simulator over an extractor, a scorer and a catalog.
pub struct CounterfactualSimulator<'a, S: RiskScorer + ?Sized> {
    extractor: &'a FeatureExtractor,
    scorer: &'a S,
    catalog: &'a InterventionCatalog,
    config: SimulationConfig,
    bounds: [(f64, f64); FEATURE_COUNT],
}

impl<'a, S: RiskScorer + ?Sized> CounterfactualSimulator<'a, S> {
    pub fn new(
        extractor: &'a FeatureExtractor,
        scorer: &'a S,
        catalog: &'a InterventionCatalog,
        config: &EngineConfig,
    ) -> Self {
        Self {
            extractor,
            scorer,
            catalog,
            config: config.simulation.clone(),
            bounds: feature_bounds(extractor.config()),
        }
    }

    /// Ranked top-K interventions for `record` against its baseline prediction.
    pub fn simulate(
        &self,
        record: &AcademicRecord,
        baseline: &PredictionResult,
    ) -> Result<Vec<InterventionResult>> {
        let vector = self.extractor.extract(record)?;
        let mut results = self.evaluate_all(&vector, baseline);
        results.truncate(self.config.top_k);
        Ok(results)
    }

    /// Every well-formed intervention at its best magnitude, fully ranked.
    pub fn evaluate_all(
        &self,
        vector: &FeatureVector,
        baseline: &PredictionResult,
    ) -> Vec<InterventionResult> {
        let mut results: Vec<InterventionResult> = self
            .catalog
            .valid_specs()
            .into_iter()
            .filter_map(|spec| self.best_magnitude(vector, baseline, spec))
            .collect();
        results.sort_by(rank_order);
        results
    }

    fn best_magnitude(
        &self,
        vector: &FeatureVector,
        baseline: &PredictionResult,
        spec: &InterventionSpec,
    ) -> Option<InterventionResult> {
        let mut best: Option<InterventionResult> = None;
        for magnitude in spec.magnitudes_ascending() {
            let modified = spec.perturb(vector, magnitude, &self.bounds);
            let prediction = match self.scorer.score(&modified) {
                Ok(p) => p,
                Err(err) => {
                    tracing::warn!(intervention = %spec.name, magnitude, error = %err, "scoring failed");
                    continue;
                }
            };
            let risk_reduction = baseline.failure_probability - prediction.failure_probability;
            let effectiveness = risk_reduction / spec.effort_cost as f64;
            if best.as_ref().is_some_and(|b| effectiveness <= b.effectiveness) {
                continue;
            }
            best = Some(InterventionResult {
                name: spec.name.clone(),
                description: spec.describe(magnitude, self.extractor.config().mark_max),
                magnitude,
                resulting_probability: prediction.failure_probability,
                risk_reduction,
                effort_cost: spec.effort(),
                effectiveness,
                confidence: prediction.confidence,
            });
        }
        best
    }

    /// Lowest-effort combination of interventions that brings the probability
    /// to `target` or below, searching single interventions first and then
    /// larger combinations up to the configured bound.
    pub fn minimal_safe_path(
        &self,
        record: &AcademicRecord,
        baseline: &PredictionResult,
        target: f64,
    ) -> Result<MinimalSafePath> {
        let vector = self.extractor.extract(record)?;
        Ok(self.minimal_safe_path_for(&vector, baseline, target))
    }

    pub fn minimal_safe_path_for(
        &self,
        vector: &FeatureVector,
        baseline: &PredictionResult,
        target: f64,
    ) -> MinimalSafePath {
        let current = baseline.failure_probability;
        if current <= target {
            return MinimalSafePath {
                status: SafePathStatus::AlreadySafe,
                target_probability: target,
                baseline_probability: current,
                steps: Vec::new(),
                total_effort: 0,
                final_probability: current,
                evaluations: 0,
            };
        }

        let specs = self.catalog.valid_specs();
        let mut evaluations = 0usize;
        let mut exhausted = false;
        let max_size = self.config.max_combination_size.min(specs.len());

        for size in 1..=max_size {
            let mut found: Vec<Candidate> = Vec::new();
            'combos: for combo in Combinations::new(specs.len(), size) {
                let chosen: Vec<&InterventionSpec> = combo.iter().map(|&i| specs[i]).collect();
                for magnitudes in MagnitudeGrid::new(&chosen) {
                    if evaluations >= self.config.max_evaluations {
                        exhausted = true;
                        break 'combos;
                    }
                    evaluations += 1;
                    let parts: Vec<(&InterventionSpec, f64)> =
                        chosen.iter().copied().zip(magnitudes.iter().copied()).collect();
                    let modified = apply(vector, &parts, &self.bounds);
                    let probability = match self.scorer.score(&modified) {
                        Ok(p) => p.failure_probability,
                        Err(err) => {
                            tracing::warn!(error = %err, "scoring failed during safe-path search");
                            continue;
                        }
                    };
                    if probability <= target {
                        found.push(Candidate {
                            specs: chosen.clone(),
                            magnitudes: magnitudes.clone(),
                            effort: chosen.iter().map(|s| s.effort()).sum(),
                            probability,
                        });
                    }
                }
            }

            if let Some(best) = found.into_iter().min_by(|a, b| a.order(b)) {
                tracing::debug!(size, evaluations, "safe path found");
                let mark_max = self.extractor.config().mark_max;
                return MinimalSafePath {
                    status: SafePathStatus::SolutionFound,
                    target_probability: target,
                    baseline_probability: current,
                    steps: best
                        .specs
                        .iter()
                        .zip(best.magnitudes.iter())
                        .map(|(spec, &magnitude)| SafePathStep {
                            name: spec.name.clone(),
                            description: spec.describe(magnitude, mark_max),
                            magnitude,
                            effort_cost: spec.effort(),
                        })
                        .collect(),
                    total_effort: best.effort,
                    final_probability: best.probability,
                    evaluations,
                };
            }
            if exhausted {
                tracing::warn!(evaluations, "safe-path evaluation budget exhausted");
                break;
            }
        }

        let fallback = self.evaluate_all(vector, baseline).into_iter().next();
        let (steps, total_effort, final_probability) = match fallback {
            Some(best) => (
                vec![SafePathStep {
                    name: best.name,
                    description: best.description,
                    magnitude: best.magnitude,
                    effort_cost: best.effort_cost,
                }],
                best.effort_cost,
                best.resulting_probability,
            ),
            None => (Vec::new(), 0, current),
        };
        MinimalSafePath {
            status: SafePathStatus::TargetUnreachable,
            target_probability: target,
            baseline_probability: current,
            steps,
            total_effort,
            final_probability,
            evaluations,
        }
    }

    /// Apply the named interventions together at their moderate magnitude.
    pub fn what_if(&self, record: &AcademicRecord, names: &[String]) -> Result<WhatIfOutcome> {
        let vector = self.extractor.extract(record)?;
        let original = self.scorer.score(&vector)?;

        let mut parts: Vec<(&InterventionSpec, f64)> = Vec::new();
        let mut applied = Vec::new();
        let mut skipped = Vec::new();
        for name in names {
            let spec = self.catalog.get(name).filter(|s| match s.validate() {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping malformed intervention");
                    false
                }
            });
            match spec.and_then(|s| s.moderate_magnitude().map(|m| (s, m))) {
                Some(part) => {
                    parts.push(part);
                    applied.push(name.clone());
                }
                None => {
                    tracing::warn!(intervention = %name, "unknown intervention in what-if");
                    skipped.push(name.clone());
                }
            }
        }

        let combined = self.scorer.score(&apply(&vector, &parts, &self.bounds))?;
        Ok(WhatIfOutcome {
            original_probability: original.failure_probability,
            combined_probability: combined.failure_probability,
            total_risk_reduction: original.failure_probability - combined.failure_probability,
            total_effort: parts.iter().map(|(s, _)| s.effort()).sum(),
            applied,
            skipped,
        })
    }
}

/// `k`-element index combinations of `0..n` in lexicographic order, produced
/// one at a time so a caller that stops early never materializes the rest.
struct Combinations {
    n: usize,
    indices: Vec<usize>,
    done: bool,
}

impl Combinations {
    fn new(n: usize, k: usize) -> Self {
        Self {
            n,
            indices: (0..k).collect(),
            done: k == 0 || k > n,
        }
    }
}

impl Iterator for Combinations {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        if self.done {
            return None;
        }
        let current = self.indices.clone();
        let k = self.indices.len();
        // rightmost slot that has not reached its final value
        match (0..k).rev().find(|&i| self.indices[i] < self.n - k + i) {
            Some(i) => {
                self.indices[i] += 1;
                for j in i + 1..k {
                    self.indices[j] = self.indices[j - 1] + 1;
                }
            }
            None => self.done = true,
        }
        Some(current)
    }
}

/// Cartesian product of each intervention's magnitudes, smallest changes
/// first, with the last intervention varying fastest.
struct MagnitudeGrid {
    axes: Vec<Vec<f64>>,
    cursor: Vec<usize>,
    done: bool,
}

impl MagnitudeGrid {
    fn new(specs: &[&InterventionSpec]) -> Self {
        let axes: Vec<Vec<f64>> = specs.iter().map(|s| s.magnitudes_ascending()).collect();
        Self {
            cursor: vec![0; axes.len()],
            done: axes.iter().any(Vec::is_empty),
            axes,
        }
    }
}

impl Iterator for MagnitudeGrid {
    type Item = Vec<f64>;

    fn next(&mut self) -> Option<Vec<f64>> {
        if self.done {
            return None;
        }
        let current = self
            .cursor
            .iter()
            .zip(&self.axes)
            .map(|(&i, axis)| axis[i])
            .collect();
        for pos in (0..self.axes.len()).rev() {
            self.cursor[pos] += 1;
            if self.cursor[pos] < self.axes[pos].len() {
                return Some(current);
            }
            self.cursor[pos] = 0;
        }
        self.done = true;
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeatureConfig, PredictionConfig, RiskBands};
    use crate::features::{
        ATTENDANCE_CURRENT, ATTENDANCE_TREND, AVG_PERFORMANCE, ENGAGEMENT_SCORE,
        MARKS_VOLATILITY, PERFORMANCE_RANGE, RECENT_PERFORMANCE, SUBJECT_COUNT,
    };
    use crate::models::SubjectMarks;
    use crate::risk::{confidence, risk_level};

    /// p = baseline - Σ w_i (x_i - base_i), clamped to [0, 1].
    struct LinearScorer {
        base: FeatureVector,
        baseline: f64,
        weights: [f64; FEATURE_COUNT],
    }

    impl RiskScorer for LinearScorer {
        fn score(&self, vector: &FeatureVector) -> Result<PredictionResult> {
            let shift: f64 = (0..FEATURE_COUNT)
                .map(|i| self.weights[i] * (vector.values()[i] - self.base.values()[i]))
                .sum();
            let p = (self.baseline - shift).clamp(0.0, 1.0);
            Ok(PredictionResult {
                failure_probability: p,
                confidence: confidence(p),
                risk_level: risk_level(p, &RiskBands::default()),
                top_factors: Vec::new(),
            })
        }
    }

    fn record() -> AcademicRecord {
        AcademicRecord {
            student_id: "STU0100".to_string(),
            name: None,
            cohort: None,
            attendance_history: vec![85.0, 80.0, 78.0, 74.0, 70.0],
            marks_history: vec![SubjectMarks {
                subject: "Math".to_string(),
                marks: vec![15.0, 14.0, 13.0],
            }],
            current_subjects: vec!["Math".into(), "Physics".into()],
            semester: Some(2),
            previous_failures: Some(0),
        }
    }

    fn spec(name: &str, feature: usize, magnitudes: Vec<f64>, effort: i64) -> InterventionSpec {
        InterventionSpec {
            name: name.to_string(),
            description: format!("{name} by {{delta}}"),
            unit: MagnitudeUnit::Plain,
            effort_cost: effort,
            deltas: vec![FeatureDelta {
                feature,
                delta: 1.0,
            }],
            magnitudes,
            couplings: Vec::new(),
        }
    }

    fn scorer(extractor: &FeatureExtractor, weights: &[(usize, f64)]) -> LinearScorer {
        let mut w = [0.0; FEATURE_COUNT];
        for (i, v) in weights {
            w[*i] = *v;
        }
        LinearScorer {
            base: extractor.extract(&record()).unwrap(),
            baseline: 0.62,
            weights: w,
        }
    }

    fn baseline(scorer: &LinearScorer) -> PredictionResult {
        scorer.score(&scorer.base).unwrap()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn bundled_catalog_is_well_formed() {
        let catalog = InterventionCatalog::bundled().unwrap();
        assert!(catalog.interventions.len() >= 4);
        for spec in &catalog.interventions {
            spec.validate().unwrap();
        }

        let targets = |name: &str| -> Vec<usize> {
            catalog.get(name).unwrap().deltas.iter().map(|d| d.feature).collect()
        };
        assert_eq!(targets("Improve Attendance"), vec![ATTENDANCE_CURRENT]);
        assert_eq!(targets("Boost Internal Marks"), vec![AVG_PERFORMANCE, RECENT_PERFORMANCE]);
        assert_eq!(targets("Stabilize Performance"), vec![MARKS_VOLATILITY, PERFORMANCE_RANGE]);
        assert_eq!(targets("Increase Engagement"), vec![ENGAGEMENT_SCORE]);
        assert_eq!(targets("Reduce Course Load"), vec![SUBJECT_COUNT]);
    }

    #[test]
    fn coupling_follows_clamped_change() {
        let extractor = FeatureExtractor::default();
        let base = extractor.extract(&record()).unwrap();
        let bounds = feature_bounds(&FeatureConfig::default());
        let mut attend = spec("Attend", ATTENDANCE_CURRENT, vec![0.1], 2);
        attend.couplings.push(Coupling {
            source: ATTENDANCE_CURRENT,
            target: ATTENDANCE_TREND,
            fraction: 0.5,
        });

        let moved = attend.perturb(&base, 0.1, &bounds);
        assert!(close(moved.values()[0], base.values()[0] + 0.1));
        assert!(close(moved.values()[1], base.values()[1] + 0.05));

        // 0.70 + 0.5 clamps at 1.0, so only 0.30 of the change survives
        let clamped = attend.perturb(&base, 0.5, &bounds);
        assert!(close(clamped.values()[0], 1.0));
        assert!(close(clamped.values()[1], base.values()[1] + 0.15));
    }

    #[test]
    fn overlapping_deltas_sum() {
        let extractor = FeatureExtractor::default();
        let base = extractor.extract(&record()).unwrap();
        let bounds = feature_bounds(&FeatureConfig::default());
        let a = spec("A", ENGAGEMENT_SCORE, vec![0.1], 1);
        let b = spec("B", ENGAGEMENT_SCORE, vec![0.05], 1);
        let moved = apply(&base, &[(&a, 0.1), (&b, 0.05)], &bounds);
        assert!(close(
            moved.values()[ENGAGEMENT_SCORE],
            base.values()[ENGAGEMENT_SCORE] + 0.15
        ));
    }

    #[test]
    fn equal_effort_ranks_greater_reduction_first() {
        let extractor = FeatureExtractor::default();
        let scorer = scorer(&extractor, &[(ATTENDANCE_CURRENT, 1.0), (AVG_PERFORMANCE, 1.0)]);
        let catalog = InterventionCatalog {
            interventions: vec![
                spec("Small", ATTENDANCE_CURRENT, vec![0.05], 2),
                spec("Large", AVG_PERFORMANCE, vec![0.10], 2),
            ],
        };
        let config = EngineConfig::default();
        let sim = CounterfactualSimulator::new(&extractor, &scorer, &catalog, &config);
        let results = sim.simulate(&record(), &baseline(&scorer)).unwrap();
        assert_eq!(results[0].name, "Large");
        assert_eq!(results[1].name, "Small");
        assert!(results[0].risk_reduction > results[1].risk_reduction);
    }

    #[test]
    fn ties_break_on_effort_then_name() {
        let result = |name: &str, effort: u32| InterventionResult {
            name: name.to_string(),
            description: String::new(),
            magnitude: 0.1,
            resulting_probability: 0.5,
            risk_reduction: 0.1 * effort as f64,
            effort_cost: effort,
            effectiveness: 0.1,
            confidence: 0.0,
        };
        let mut results = vec![result("Zeta", 1), result("Beta", 2), result("Alpha", 2)];
        results.sort_by(rank_order);
        let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Zeta", "Alpha", "Beta"]);
    }

    #[test]
    fn keeps_best_magnitude_and_top_k() {
        let extractor = FeatureExtractor::default();
        let scorer = scorer(&extractor, &[(ENGAGEMENT_SCORE, 1.0)]);
        let catalog = InterventionCatalog {
            interventions: (0..5)
                .map(|i| spec(&format!("E{i}"), ENGAGEMENT_SCORE, vec![0.05, 0.1], 1 + i))
                .collect(),
        };
        let config = EngineConfig::default();
        let sim = CounterfactualSimulator::new(&extractor, &scorer, &catalog, &config);
        let results = sim.simulate(&record(), &baseline(&scorer)).unwrap();
        assert_eq!(results.len(), config.simulation.top_k);
        assert_eq!(results[0].name, "E0");
        assert!(close(results[0].magnitude, 0.1));
        assert!(close(results[0].resulting_probability, 0.52));
        assert!(close(results[0].effectiveness, results[0].risk_reduction));
    }

    #[test]
    fn malformed_specs_are_skipped_not_fatal() {
        let extractor = FeatureExtractor::default();
        let scorer = scorer(&extractor, &[(ENGAGEMENT_SCORE, 1.0)]);
        let catalog = InterventionCatalog {
            interventions: vec![
                spec("Free", ENGAGEMENT_SCORE, vec![0.1], 0),
                spec("Refund", ENGAGEMENT_SCORE, vec![0.1], -1),
                spec("Nowhere", 99, vec![0.1], 1),
                spec("Valid", ENGAGEMENT_SCORE, vec![0.1], 1),
            ],
        };
        let config = EngineConfig::default();
        let sim = CounterfactualSimulator::new(&extractor, &scorer, &catalog, &config);
        let results = sim.simulate(&record(), &baseline(&scorer)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "Valid");
    }

    #[test]
    fn harmful_intervention_reports_negative_reduction() {
        let extractor = FeatureExtractor::default();
        let scorer = scorer(&extractor, &[(ENGAGEMENT_SCORE, -1.0)]);
        let catalog = InterventionCatalog {
            interventions: vec![spec("Backfire", ENGAGEMENT_SCORE, vec![0.1], 1)],
        };
        let config = EngineConfig::default();
        let sim = CounterfactualSimulator::new(&extractor, &scorer, &catalog, &config);
        let results = sim.simulate(&record(), &baseline(&scorer)).unwrap();
        assert!(results[0].risk_reduction < 0.0);
    }

    #[test]
    fn safe_path_single_step_when_one_suffices() {
        let extractor = FeatureExtractor::default();
        let scorer = scorer(&extractor, &[(ATTENDANCE_CURRENT, 2.0), (AVG_PERFORMANCE, 1.0)]);
        let catalog = InterventionCatalog {
            interventions: vec![
                spec("Attend", ATTENDANCE_CURRENT, vec![0.1, 0.2], 2),
                spec("Study", AVG_PERFORMANCE, vec![0.1, 0.2], 3),
            ],
        };
        let config = EngineConfig::default();
        let sim = CounterfactualSimulator::new(&extractor, &scorer, &catalog, &config);
        let base = baseline(&scorer);
        assert!(close(base.failure_probability, 0.62));

        let path = sim.minimal_safe_path(&record(), &base, 0.3).unwrap();
        assert_eq!(path.status, SafePathStatus::SolutionFound);
        assert_eq!(path.steps.len(), 1);
        assert_eq!(path.steps[0].name, "Attend");
        assert!(close(path.steps[0].magnitude, 0.2));
        assert!(path.final_probability <= 0.3);
        assert_eq!(path.total_effort, 2);
    }

    #[test]
    fn safe_path_two_steps_when_pair_needed() {
        let extractor = FeatureExtractor::default();
        let scorer = scorer(&extractor, &[(ATTENDANCE_CURRENT, 1.0), (AVG_PERFORMANCE, 1.0)]);
        let catalog = InterventionCatalog {
            interventions: vec![
                spec("Attend", ATTENDANCE_CURRENT, vec![0.1, 0.2], 2),
                spec("Study", AVG_PERFORMANCE, vec![0.1, 0.2], 3),
            ],
        };
        let config = EngineConfig::default();
        let sim = CounterfactualSimulator::new(&extractor, &scorer, &catalog, &config);
        let path = sim.minimal_safe_path(&record(), &baseline(&scorer), 0.3).unwrap();
        assert_eq!(path.status, SafePathStatus::SolutionFound);
        assert_eq!(path.steps.len(), 2);
        assert_eq!(path.total_effort, 5);
        assert!(path.final_probability <= 0.3);
    }

    #[test]
    fn safe_path_unreachable_returns_best_single() {
        let extractor = FeatureExtractor::default();
        let scorer = scorer(&extractor, &[(ATTENDANCE_CURRENT, 0.1), (AVG_PERFORMANCE, 0.2)]);
        let catalog = InterventionCatalog {
            interventions: vec![
                spec("Attend", ATTENDANCE_CURRENT, vec![0.1, 0.2], 2),
                spec("Study", AVG_PERFORMANCE, vec![0.1, 0.2], 2),
            ],
        };
        let config = EngineConfig::default();
        let sim = CounterfactualSimulator::new(&extractor, &scorer, &catalog, &config);
        let path = sim.minimal_safe_path(&record(), &baseline(&scorer), 0.3).unwrap();
        assert_eq!(path.status, SafePathStatus::TargetUnreachable);
        assert_eq!(path.steps.len(), 1);
        assert_eq!(path.steps[0].name, "Study");
        assert!(path.final_probability > 0.3);
    }

    #[test]
    fn safe_path_respects_combination_bound() {
        let extractor = FeatureExtractor::default();
        let scorer = scorer(&extractor, &[(ATTENDANCE_CURRENT, 1.0), (AVG_PERFORMANCE, 1.0)]);
        let catalog = InterventionCatalog {
            interventions: vec![
                spec("Attend", ATTENDANCE_CURRENT, vec![0.1, 0.2], 2),
                spec("Study", AVG_PERFORMANCE, vec![0.1, 0.2], 3),
            ],
        };
        let mut config = EngineConfig::default();
        config.simulation.max_combination_size = 1;
        let sim = CounterfactualSimulator::new(&extractor, &scorer, &catalog, &config);
        let path = sim.minimal_safe_path(&record(), &baseline(&scorer), 0.3).unwrap();
        assert_eq!(path.status, SafePathStatus::TargetUnreachable);
        assert_eq!(path.evaluations, 4);
    }

    #[test]
    fn safe_path_stops_at_evaluation_budget() {
        let extractor = FeatureExtractor::default();
        let scorer = scorer(&extractor, &[(ATTENDANCE_CURRENT, 0.01)]);
        let catalog = InterventionCatalog {
            interventions: (0..4)
                .map(|i| spec(&format!("A{i}"), ATTENDANCE_CURRENT, vec![0.1, 0.2], 1))
                .collect(),
        };
        let mut config = EngineConfig::default();
        config.simulation.max_evaluations = 10;
        let sim = CounterfactualSimulator::new(&extractor, &scorer, &catalog, &config);
        let path = sim.minimal_safe_path(&record(), &baseline(&scorer), 0.3).unwrap();
        assert_eq!(path.status, SafePathStatus::TargetUnreachable);
        assert_eq!(path.evaluations, 10);
    }

    #[test]
    fn already_safe_has_no_steps() {
        let extractor = FeatureExtractor::default();
        let scorer = scorer(&extractor, &[]);
        let catalog = InterventionCatalog::bundled().unwrap();
        let config = EngineConfig::default();
        let sim = CounterfactualSimulator::new(&extractor, &scorer, &catalog, &config);
        let path = sim.minimal_safe_path(&record(), &baseline(&scorer), 0.7).unwrap();
        assert_eq!(path.status, SafePathStatus::AlreadySafe);
        assert!(path.steps.is_empty());
    }

    #[test]
    fn what_if_combines_and_skips_unknown() {
        let extractor = FeatureExtractor::default();
        let scorer = scorer(&extractor, &[(ATTENDANCE_CURRENT, 1.0), (AVG_PERFORMANCE, 1.0)]);
        let catalog = InterventionCatalog {
            interventions: vec![
                spec("Attend", ATTENDANCE_CURRENT, vec![0.05, 0.1, 0.2], 2),
                spec("Study", AVG_PERFORMANCE, vec![0.1], 3),
            ],
        };
        let config = EngineConfig::default();
        let sim = CounterfactualSimulator::new(&extractor, &scorer, &catalog, &config);
        let outcome = sim
            .what_if(
                &record(),
                &["Attend".to_string(), "Study".to_string(), "Nap".to_string()],
            )
            .unwrap();
        assert_eq!(outcome.applied, vec!["Attend", "Study"]);
        assert_eq!(outcome.skipped, vec!["Nap"]);
        assert_eq!(outcome.total_effort, 5);
        assert!(close(outcome.combined_probability, 0.42));
        assert!(close(outcome.total_risk_reduction, 0.2));
    }

    #[test]
    fn describes_magnitudes_by_unit() {
        let mut s = spec("Attend", ATTENDANCE_CURRENT, vec![0.1], 2);
        s.description = "Attend {delta} more classes".into();
        s.unit = MagnitudeUnit::Percent;
        assert_eq!(s.describe(0.15, 20.0), "Attend 15% more classes");
        s.description = "Improve by {delta} marks".into();
        s.unit = MagnitudeUnit::Marks;
        assert_eq!(s.describe(0.10, 20.0), "Improve by 2 marks");
    }

    #[test]
    fn bundled_model_rewards_attendance_for_declining_student() {
        let extractor = FeatureExtractor::default();
        let model =
            RiskModel::bundled(RiskBands::default(), &PredictionConfig::default()).unwrap();
        let catalog = InterventionCatalog::bundled().unwrap();
        let config = EngineConfig::default();
        let mut declining = record();
        declining.attendance_history = vec![80.0, 76.0, 73.0, 70.0, 66.0, 62.0, 58.0, 55.0];
        declining.previous_failures = Some(1);

        let base = model.predict(&extractor.extract(&declining).unwrap()).unwrap();
        let sim = CounterfactualSimulator::new(&extractor, &model, &catalog, &config);
        let results = sim.simulate(&declining, &base).unwrap();
        assert!(!results.is_empty());
        assert!(results[0].risk_reduction > 0.0);
        for pair in results.windows(2) {
            assert!(rank_order(&pair[0], &pair[1]) != Ordering::Greater);
        }
    }

    #[test]
    fn catalog_skips_entries_that_do_not_decode() {
        let json = r#"{
            "interventions": [
                {
                    "name": "Tutoring",
                    "description": "Improve by {delta}",
                    "effort_cost": 3,
                    "deltas": [{ "feature": 8, "delta": 1.0 }],
                    "magnitudes": [0.1]
                },
                {
                    "name": "Refund",
                    "description": "Pay {delta}",
                    "effort_cost": -1,
                    "deltas": [{ "feature": 20, "delta": 1.0 }],
                    "magnitudes": [0.1]
                },
                {
                    "name": "Shapeless",
                    "description": "Nothing",
                    "effort_cost": 1,
                    "deltas": [{ "feature": 20, "delta": 1.0 }]
                },
                { "effort_cost": "lots" }
            ]
        }"#;
        let catalog = InterventionCatalog::from_json(json).unwrap();
        let names: Vec<&str> = catalog.interventions.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Tutoring", "Refund"]);
        assert!(catalog.get("Refund").unwrap().validate().is_err());

        let extractor = FeatureExtractor::default();
        let scorer = scorer(&extractor, &[(AVG_PERFORMANCE, 1.0), (ENGAGEMENT_SCORE, 1.0)]);
        let config = EngineConfig::default();
        let sim = CounterfactualSimulator::new(&extractor, &scorer, &catalog, &config);
        let results = sim.simulate(&record(), &baseline(&scorer)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "Tutoring");
        assert_eq!(results[0].effort_cost, 3);

        assert!(InterventionCatalog::from_json("{}").is_err());
    }

    #[test]
    fn combinations_are_lexicographic() {
        let pairs: Vec<Vec<usize>> = Combinations::new(3, 2).collect();
        assert_eq!(pairs, vec![vec![0, 1], vec![0, 2], vec![1, 2]]);
        assert_eq!(Combinations::new(2, 3).count(), 0);
        assert_eq!(Combinations::new(3, 0).count(), 0);
        assert_eq!(Combinations::new(5, 3).count(), 10);
        assert_eq!(Combinations::new(5, 3).last(), Some(vec![2, 3, 4]));

        let a = spec("A", 0, vec![0.2, 0.1], 1);
        let b = spec("B", 1, vec![0.3, 0.4], 1);
        let grid: Vec<Vec<f64>> = MagnitudeGrid::new(&[&a, &b]).collect();
        assert_eq!(
            grid,
            vec![vec![0.1, 0.3], vec![0.1, 0.4], vec![0.2, 0.3], vec![0.2, 0.4]]
        );
    }

    #[test]
    fn large_catalogs_enumerate_lazily() {
        let mut triples = Combinations::new(400, 3);
        assert_eq!(triples.next(), Some(vec![0, 1, 2]));
        assert_eq!(triples.next(), Some(vec![0, 1, 3]));
        assert_eq!(triples.nth(396), Some(vec![0, 1, 399]));
        assert_eq!(triples.next(), Some(vec![0, 2, 3]));
    }
}
