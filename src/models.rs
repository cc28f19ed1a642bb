use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RiskError};

/// Raw longitudinal history for one student, oldest observation first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcademicRecord {
    pub student_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub cohort: Option<String>,
    /// Weekly attendance percentages
    pub attendance_history: Vec<f64>,
    #[serde(default)]
    pub marks_history: Vec<SubjectMarks>,
    #[serde(default)]
    pub current_subjects: Vec<String>,
    #[serde(default)]
    pub semester: Option<u32>,
    #[serde(default)]
    pub previous_failures: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectMarks {
    pub subject: String,
    pub marks: Vec<f64>,
}

impl AcademicRecord {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.student_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub const ALL: [RiskLevel; 4] = [
        RiskLevel::Low,
        RiskLevel::Medium,
        RiskLevel::High,
        RiskLevel::Critical,
    ];
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// One input-specific contributing factor: global importance scaled by the
/// feature's deviation from its training baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributingFactor {
    pub feature_name: String,
    pub feature_index: usize,
    pub importance: f64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub failure_probability: f64,
    pub confidence: f64,
    pub risk_level: RiskLevel,
    pub top_factors: Vec<ContributingFactor>,
}

/// Outcome of one catalog intervention at its best magnitude.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionResult {
    pub name: String,
    pub description: String,
    pub magnitude: f64,
    pub resulting_probability: f64,
    /// Baseline minus resulting probability; negative when the change hurts
    pub risk_reduction: f64,
    pub effort_cost: u32,
    pub effectiveness: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafePathStatus {
    AlreadySafe,
    SolutionFound,
    TargetUnreachable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafePathStep {
    pub name: String,
    pub description: String,
    pub magnitude: f64,
    pub effort_cost: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinimalSafePath {
    pub status: SafePathStatus,
    pub target_probability: f64,
    pub baseline_probability: f64,
    pub steps: Vec<SafePathStep>,
    pub total_effort: u32,
    pub final_probability: f64,
    /// Model calls spent by the search
    pub evaluations: usize,
}

impl MinimalSafePath {
    /// Turn an unreachable target into an error for callers that need a plan.
    pub fn ensure_reached(&self) -> Result<()> {
        match self.status {
            SafePathStatus::TargetUnreachable => Err(RiskError::UnreachableTarget {
                target: self.target_probability,
                best: self.final_probability,
            }),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhatIfOutcome {
    pub original_probability: f64,
    pub combined_probability: f64,
    pub total_risk_reduction: f64,
    pub total_effort: u32,
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
}
