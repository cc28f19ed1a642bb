//! Academic failure-risk engine: temporal feature extraction, a calibrated
//! boosted-tree risk model, counterfactual intervention search and
//! prerequisite risk propagation.

pub mod config;
pub mod counterfactual;
pub mod db;
pub mod error;
pub mod explain;
pub mod features;
pub mod graph;
pub mod models;
pub mod report;
pub mod risk;

pub use config::EngineConfig;
pub use counterfactual::{CounterfactualSimulator, InterventionCatalog, RiskScorer};
pub use error::{Result, RiskError};
pub use features::{FeatureExtractor, FeatureVector, FEATURE_COUNT, FEATURE_NAMES};
pub use graph::{CourseGraph, PropagatedRisk};
pub use models::{AcademicRecord, PredictionResult, RiskLevel};
pub use risk::{ModelHandle, RiskModel};
