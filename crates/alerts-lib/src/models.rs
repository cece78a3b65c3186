//! Core data models for the alerting engine

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Metric label used on records produced by the multivariate detector
pub const MULTIVARIATE_METRIC: &str = "multivariate";

/// Errors raised while building series and histories
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SeriesError {
    #[error("dates must be strictly increasing, got {next} after {previous}")]
    UnorderedDates { previous: NaiveDate, next: NaiveDate },

    #[error("non-finite value {value} on {date}")]
    NonFiniteValue { date: NaiveDate, value: f64 },

    #[error("series for entity '{found}' cannot join history of '{expected}'")]
    EntityMismatch { expected: String, found: String },
}

/// Daily values of one metric for one entity
///
/// Dates are strictly increasing and unique. Gaps between dates are allowed.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSeries {
    entity: String,
    metric: String,
    dates: Vec<NaiveDate>,
    values: Vec<f64>,
}

impl MetricSeries {
    /// Build a series from `(date, value)` points already sorted by date
    pub fn new(
        entity: impl Into<String>,
        metric: impl Into<String>,
        points: Vec<(NaiveDate, f64)>,
    ) -> Result<Self, SeriesError> {
        let mut dates = Vec::with_capacity(points.len());
        let mut values = Vec::with_capacity(points.len());

        for (date, value) in points {
            if !value.is_finite() {
                return Err(SeriesError::NonFiniteValue { date, value });
            }
            if let Some(&previous) = dates.last() {
                if date <= previous {
                    return Err(SeriesError::UnorderedDates {
                        previous,
                        next: date,
                    });
                }
            }
            dates.push(date);
            values.push(value);
        }

        Ok(Self {
            entity: entity.into(),
            metric: metric.into(),
            dates,
            values,
        })
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Most recent observed date
    pub fn last_date(&self) -> Option<NaiveDate> {
        self.dates.last().copied()
    }

    /// Value observed on `date`, if any
    pub fn value_on(&self, date: NaiveDate) -> Option<f64> {
        self.dates
            .binary_search(&date)
            .ok()
            .map(|idx| self.values[idx])
    }
}

/// All metric series of one entity for one evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct EntityHistory {
    entity: String,
    series: BTreeMap<String, MetricSeries>,
}

impl EntityHistory {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            series: BTreeMap::new(),
        }
    }

    /// Add a series, replacing any previous series for the same metric
    pub fn insert(&mut self, series: MetricSeries) -> Result<(), SeriesError> {
        if series.entity() != self.entity {
            return Err(SeriesError::EntityMismatch {
                expected: self.entity.clone(),
                found: series.entity().to_string(),
            });
        }
        self.series.insert(series.metric().to_string(), series);
        Ok(())
    }

    /// Builder-style variant of [`EntityHistory::insert`]
    pub fn with_series(mut self, series: MetricSeries) -> Result<Self, SeriesError> {
        self.insert(series)?;
        Ok(self)
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn get(&self, metric: &str) -> Option<&MetricSeries> {
        self.series.get(metric)
    }

    pub fn metrics(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    /// True when no series holds a single observation
    pub fn is_empty(&self) -> bool {
        self.series.values().all(MetricSeries::is_empty)
    }
}

/// Direction or shape of a detected anomaly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnomalyKind {
    Spike,
    Drop,
    MultivariatePattern,
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnomalyKind::Spike => write!(f, "spike"),
            AnomalyKind::Drop => write!(f, "drop"),
            AnomalyKind::MultivariatePattern => write!(f, "multivariate-pattern"),
        }
    }
}

/// Detector that produced a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectionMethod {
    #[serde(rename = "seasonal-mad")]
    SeasonalMad,
    #[serde(rename = "isolation-ensemble")]
    IsolationEnsemble,
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionMethod::SeasonalMad => write!(f, "seasonal-mad"),
            DetectionMethod::IsolationEnsemble => write!(f, "isolation-ensemble"),
        }
    }
}

/// A single alert raised for the evaluation target date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub entity: String,
    pub metric: String,
    pub date: NaiveDate,
    pub kind: AnomalyKind,
    /// Observed raw value, `None` for multivariate records ("N/A" on the wire)
    #[serde(with = "value_or_na")]
    pub value: Option<f64>,
    pub method: DetectionMethod,
    pub score: f64,
    pub params: String,
    /// Metric values that contributed to a multivariate record
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, f64>,
}

impl AnomalyRecord {
    /// Value as rendered for humans: the number or "N/A"
    pub fn display_value(&self) -> String {
        match self.value {
            Some(value) => format!("{}", value),
            None => value_or_na::NOT_AVAILABLE.to_string(),
        }
    }
}

/// Serializes `Option<f64>` as a number, or the string "N/A" when absent
mod value_or_na {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub const NOT_AVAILABLE: &str = "N/A";

    pub fn serialize<S: Serializer>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_f64(*v),
            None => serializer.serialize_str(NOT_AVAILABLE),
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Number(v) => Ok(Some(v)),
            Raw::Text(s) if s == NOT_AVAILABLE => Ok(None),
            Raw::Text(s) => s
                .parse::<f64>()
                .map(Some)
                .map_err(|_| D::Error::custom(format!("expected number or \"N/A\", got '{}'", s))),
        }
    }
}

/// Counters for one orchestrator run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Entities whose history was evaluated
    pub entities_evaluated: usize,
    /// Entities skipped because their history was empty
    pub entities_skipped: usize,
    /// Entities whose history could not be loaded
    pub load_failures: usize,
    /// Detector invocations that failed internally
    pub detector_failures: usize,
    pub alerts_total: usize,
    pub seasonal_alerts: usize,
    pub multivariate_alerts: usize,
}

impl RunSummary {
    pub fn alerts_for(&self, method: DetectionMethod) -> usize {
        match method {
            DetectionMethod::SeasonalMad => self.seasonal_alerts,
            DetectionMethod::IsolationEnsemble => self.multivariate_alerts,
        }
    }
}
