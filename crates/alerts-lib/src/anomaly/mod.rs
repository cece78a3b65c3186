//! Anomaly detection for daily marketing metrics
//!
//! This module provides:
//! - Seasonal decomposition + robust MAD thresholds per metric
//! - An isolation ensemble over several metrics jointly
//! - Typed detector outcomes separating "no signal" from internal faults

mod decomposition;
mod isolation_forest;
mod multivariate_detector;
mod seasonal_detector;
pub mod stats;

#[cfg(test)]
mod tests;

pub use decomposition::{decompose_additive, DecompositionResult, WEEKLY_PERIOD};
pub use isolation_forest::{average_path_length, IsolationForest, IsolationForestParams};
pub use multivariate_detector::{
    AlignedMatrix, MultivariateDetector, DEFAULT_CONTAMINATION, MIN_ALIGNED_ROWS,
};
pub use seasonal_detector::{
    ResidualAnalysis, SeasonalMadDetector, DEFAULT_MAD_THRESHOLD, MAD_FLOOR,
};

use chrono::NaiveDate;
use thiserror::Error;

use crate::models::AnomalyRecord;

/// Internal detector failure
///
/// Insufficient or stale data is never an error; see [`SkipReason`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DetectorError {
    #[error("series too short: need {needed} points, got {got}")]
    TooShort { needed: usize, got: usize },

    #[error("non-finite {stage} value at position {index}")]
    NonFinite { stage: &'static str, index: usize },

    #[error("trend extrapolation needs two points, {available} available")]
    Extrapolation { available: usize },

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("feature rows must have {expected} columns, row {row} has {found}")]
    RaggedInput {
        expected: usize,
        row: usize,
        found: usize,
    },

    #[error("cannot fit an ensemble on an empty dataset")]
    EmptyDataset,

    #[error("detector panicked: {message}")]
    Panicked { message: String },
}

/// Why a detector declined to evaluate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Fewer observations than the detector needs
    InsufficientHistory { required: usize, available: usize },
    /// The newest observation is not the target date
    StaleData {
        last: Option<NaiveDate>,
        target: NaiveDate,
    },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::InsufficientHistory {
                required,
                available,
            } => write!(f, "insufficient history ({} of {} points)", available, required),
            SkipReason::StaleData { last: Some(last), target } => {
                write!(f, "stale data (last {}, target {})", last, target)
            }
            SkipReason::StaleData { last: None, target } => {
                write!(f, "no data up to target {}", target)
            }
        }
    }
}

/// Outcome of one detector invocation
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// The target date is anomalous
    Anomaly(AnomalyRecord),
    /// Evaluated, nothing unusual
    Normal,
    /// Not evaluated
    Skipped(SkipReason),
}

impl Detection {
    pub fn is_anomaly(&self) -> bool {
        matches!(self, Detection::Anomaly(_))
    }

    pub fn into_record(self) -> Option<AnomalyRecord> {
        match self {
            Detection::Anomaly(record) => Some(record),
            Detection::Normal | Detection::Skipped(_) => None,
        }
    }
}
