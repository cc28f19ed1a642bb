//! Error types for the failure-risk pipeline.

use thiserror::Error;

/// Error type shared by the extractor, model, simulator and graph.
#[derive(Debug, Error)]
pub enum RiskError {
    /// A temporal series is too short to compute a trend
    #[error("insufficient history: {series} has {points} point(s), need at least 2")]
    InsufficientHistory { series: String, points: usize },

    /// The raw record violates its declared value ranges
    #[error("invalid record {record}: {reason}")]
    InvalidRecord { record: String, reason: String },

    /// The extractor-to-model boundary was violated
    #[error("invalid feature vector: {0}")]
    InvalidFeatureVector(String),

    /// Model artifact missing or corrupt
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// Minimal safe path search exhausted its bound without meeting the target
    #[error("target probability {target:.3} unreachable; best reachable {best:.3}")]
    UnreachableTarget { target: f64, best: f64 },

    /// External explanation collaborator failed
    #[error("explanation unavailable: {0}")]
    ExplanationUnavailable(String),

    /// Engine configuration failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Course graph definition is malformed
    #[error("invalid course graph: {0}")]
    InvalidGraph(String),

    /// Intervention catalog entry is malformed
    #[error("invalid intervention {name}: {reason}")]
    InvalidIntervention { name: String, reason: String },
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, RiskError>;
