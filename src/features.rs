//! Feature extraction.
//!
//! Maps an [`AcademicRecord`] into a fixed 22-dimensional vector. The vector
//! is built around trend and volatility of the temporal series rather than
//! their latest snapshot, which is what the risk model keys on.
//!
//! ```text
//! attendance ─┐
//! marks ──────┼─→ [attendance 0..6 | marks 6..14 | load 14..18 | history 18..20 | engagement 20..22]
//! load/history┘
//! ```

use serde::Serialize;

use crate::config::FeatureConfig;
use crate::error::{Result, RiskError};
use crate::models::AcademicRecord;

/// Number of features in the model's input vector.
pub const FEATURE_COUNT: usize = 22;

/// Feature names, in index order.
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    // Attendance
    "attendance_current",
    "attendance_trend",
    "attendance_volatility",
    "attendance_decline",
    "decline_ratio",
    "min_attendance",
    // Marks
    "marks_trend",
    "marks_volatility",
    "avg_performance",
    "recent_performance",
    "declining_subjects_ratio",
    "performance_range",
    "weak_subjects_ratio",
    "subject_count_marks",
    // Load
    "subject_count",
    "semester_factor",
    "load_intensity",
    "avg_difficulty",
    // History
    "previous_failures",
    "failure_rate",
    // Engagement
    "engagement_score",
    "data_completeness",
];

pub const ATTENDANCE_CURRENT: usize = 0;
pub const ATTENDANCE_TREND: usize = 1;
pub const ATTENDANCE_VOLATILITY: usize = 2;
pub const ATTENDANCE_DECLINE: usize = 3;
pub const MARKS_TREND: usize = 6;
pub const MARKS_VOLATILITY: usize = 7;
pub const AVG_PERFORMANCE: usize = 8;
pub const RECENT_PERFORMANCE: usize = 9;
pub const PERFORMANCE_RANGE: usize = 11;
pub const SUBJECT_COUNT_MARKS: usize = 13;
pub const SUBJECT_COUNT: usize = 14;
pub const ENGAGEMENT_SCORE: usize = 20;
pub const DATA_COMPLETENESS: usize = 21;

/// Number of raw record fields checked by the completeness score.
const COMPLETENESS_FIELDS: f64 = 6.0;

/// Points averaged at each end of the attendance series for the decline feature.
const DECLINE_WINDOW: usize = 3;

/// Fixed-length feature vector. Only the extractor and the counterfactual
/// perturbation build one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FeatureVector {
    values: [f64; FEATURE_COUNT],
}

impl FeatureVector {
    pub(crate) fn from_values(values: [f64; FEATURE_COUNT]) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f64; FEATURE_COUNT] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<f64> {
        self.values.get(index).copied()
    }

    /// Check the model-side contract: every entry finite.
    pub fn validate(&self) -> Result<()> {
        validate_values(&self.values)
    }
}

pub(crate) fn validate_values(values: &[f64]) -> Result<()> {
    if values.len() != FEATURE_COUNT {
        return Err(RiskError::InvalidFeatureVector(format!(
            "expected {FEATURE_COUNT} features, got {}",
            values.len()
        )));
    }
    if let Some((index, value)) = values.iter().enumerate().find(|(_, v)| !v.is_finite()) {
        return Err(RiskError::InvalidFeatureVector(format!(
            "non-finite value {value} at {} ({index})",
            FEATURE_NAMES[index]
        )));
    }
    Ok(())
}

/// Valid range of each feature under `config`, used to clamp perturbed vectors.
pub fn feature_bounds(config: &FeatureConfig) -> [(f64, f64); FEATURE_COUNT] {
    let attendance_slope = config.attendance_max / config.trend_scale;
    let marks_slope = config.mark_max / config.trend_scale;

    // normalized levels and ratios; counts, load and history are open-ended
    let mut bounds = [(0.0, 1.0); FEATURE_COUNT];
    for bound in &mut bounds[SUBJECT_COUNT_MARKS..ENGAGEMENT_SCORE] {
        *bound = (0.0, f64::INFINITY);
    }
    bounds[ATTENDANCE_TREND] = (-attendance_slope, attendance_slope);
    bounds[ATTENDANCE_VOLATILITY] = (0.0, 0.5);
    bounds[ATTENDANCE_DECLINE] = (-1.0, 1.0);
    bounds[MARKS_TREND] = (-marks_slope, marks_slope);
    bounds[MARKS_VOLATILITY] = (0.0, 0.5);
    bounds[RECENT_PERFORMANCE] = (0.0, 1.0);
    bounds[PERFORMANCE_RANGE] = (0.0, 1.0);
    bounds
}

/// Stateless extractor; identical records always yield identical vectors.
#[derive(Debug, Clone, Default)]
pub struct FeatureExtractor {
    config: FeatureConfig,
}

struct MarksSummary {
    values: [f64; 8],
    avg_performance: f64,
}

impl FeatureExtractor {
    pub fn new(config: FeatureConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    pub fn extract(&self, record: &AcademicRecord) -> Result<FeatureVector> {
        self.check_record(record)?;

        let mut values = [0.0f64; FEATURE_COUNT];
        let attendance = self.attendance_features(&record.attendance_history);
        values[ATTENDANCE_CURRENT..MARKS_TREND].copy_from_slice(&attendance);

        let marks = self.marks_features(record)?;
        values[MARKS_TREND..SUBJECT_COUNT].copy_from_slice(&marks.values);

        let cfg = &self.config;
        let semester = record.semester.unwrap_or(1);
        let failures = record.previous_failures.unwrap_or(0);
        let subject_count = record.current_subjects.len() as f64;

        // Load
        values[SUBJECT_COUNT] = subject_count;
        values[15] = semester as f64 / cfg.max_semesters;
        values[16] = subject_count / cfg.typical_load;
        values[17] = self.mean_difficulty(&record.current_subjects);

        // History
        let completed = semester.saturating_sub(1);
        values[18] = failures as f64;
        values[19] = if completed == 0 {
            0.0
        } else {
            failures as f64 / completed as f64
        };

        // Engagement
        let w = cfg.engagement_attendance_weight;
        values[ENGAGEMENT_SCORE] = w * attendance[0] + (1.0 - w) * marks.avg_performance;
        values[DATA_COMPLETENESS] = completeness(record);

        let vector = FeatureVector::from_values(values);
        vector.validate()?;
        tracing::debug!(student = %record.student_id, "extracted feature vector");
        Ok(vector)
    }

    fn check_record(&self, record: &AcademicRecord) -> Result<()> {
        let points = record.attendance_history.len();
        if points < 2 {
            return Err(RiskError::InsufficientHistory {
                series: "attendance".into(),
                points,
            });
        }
        let longest = record
            .marks_history
            .iter()
            .map(|s| s.marks.len())
            .max()
            .unwrap_or(0);
        if longest < 2 {
            return Err(RiskError::InsufficientHistory {
                series: "marks".into(),
                points: longest,
            });
        }

        let max = self.config.attendance_max;
        if let Some(value) = record
            .attendance_history
            .iter()
            .find(|v| !(v.is_finite() && (0.0..=max).contains(*v)))
        {
            return Err(RiskError::InvalidRecord {
                record: record.student_id.clone(),
                reason: format!("attendance {value} outside [0, {max}]"),
            });
        }
        let max = self.config.mark_max;
        for subject in &record.marks_history {
            if let Some(value) = subject
                .marks
                .iter()
                .find(|v| !(v.is_finite() && (0.0..=max).contains(*v)))
            {
                return Err(RiskError::InvalidRecord {
                    record: record.student_id.clone(),
                    reason: format!("{} mark {value} outside [0, {max}]", subject.subject),
                });
            }
        }
        Ok(())
    }

    fn attendance_features(&self, attendance: &[f64]) -> [f64; 6] {
        let scale = self.config.attendance_max;
        let n = attendance.len();

        let current = attendance[n - 1] / scale;
        let trend = slope(attendance) / self.config.trend_scale;
        let volatility = std_dev(attendance) / scale;

        let window = if n >= DECLINE_WINDOW { DECLINE_WINDOW } else { 1 };
        let early = mean(&attendance[..window]);
        let recent = mean(&attendance[n - window..]);
        let decline = (early - recent) / scale;

        let declines = attendance.windows(2).filter(|w| w[1] < w[0]).count();
        let decline_ratio = declines as f64 / (n - 1) as f64;

        let min = attendance.iter().copied().fold(f64::INFINITY, f64::min) / scale;

        [current, trend, volatility, decline, decline_ratio, min]
    }

    fn marks_features(&self, record: &AcademicRecord) -> Result<MarksSummary> {
        let scale = self.config.mark_max;
        let mut trends = Vec::new();
        let mut volatilities = Vec::new();
        let mut means = Vec::new();
        let mut recents = Vec::new();

        for subject in &record.marks_history {
            let marks = &subject.marks;
            if marks.len() < 2 {
                continue;
            }
            trends.push(slope(marks));
            volatilities.push(std_dev(marks));
            means.push(mean(marks));
            recents.push(mean(&marks[marks.len() - 2..]));
        }

        let qualifying = means.len();
        if qualifying == 0 {
            return Err(RiskError::InsufficientHistory {
                series: "marks".into(),
                points: 0,
            });
        }

        let avg_performance = mean(&means) / scale;
        let best = means.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let worst = means.iter().copied().fold(f64::INFINITY, f64::min);
        let median_mean = median(&means);
        let declining = trends.iter().filter(|t| **t < 0.0).count();
        let weak = means.iter().filter(|m| **m < median_mean).count();

        Ok(MarksSummary {
            values: [
                mean(&trends) / self.config.trend_scale,
                mean(&volatilities) / scale,
                avg_performance,
                mean(&recents) / scale,
                declining as f64 / qualifying as f64,
                (best - worst) / scale,
                weak as f64 / qualifying as f64,
                record.marks_history.len() as f64,
            ],
            avg_performance,
        })
    }

    fn mean_difficulty(&self, subjects: &[String]) -> f64 {
        if subjects.is_empty() {
            return self.config.default_difficulty;
        }
        let total: f64 = subjects
            .iter()
            .map(|s| {
                self.config
                    .subject_difficulty
                    .get(s)
                    .copied()
                    .unwrap_or(self.config.default_difficulty)
            })
            .sum();
        total / subjects.len() as f64
    }
}

fn completeness(record: &AcademicRecord) -> f64 {
    let present = [
        !record.student_id.trim().is_empty(),
        !record.attendance_history.is_empty(),
        !record.marks_history.is_empty(),
        !record.current_subjects.is_empty(),
        record.semester.is_some(),
        record.previous_failures.is_some(),
    ]
    .iter()
    .filter(|&&v| v)
    .count();
    present as f64 / COMPLETENESS_FIELDS
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
fn std_dev(values: &[f64]) -> f64 {
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Least-squares slope of `values` against their index.
fn slope(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let x_mean = (n - 1) as f64 / 2.0;
    let y_mean = mean(values);
    let (num, den) = values
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(num, den), (i, y)| {
            let dx = i as f64 - x_mean;
            (num + dx * (y - y_mean), den + dx * dx)
        });
    num / den
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    if n == 0 {
        0.0
    } else if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}
