//! Warehouse CSV export source
//!
//! Reads a file with the header `entity,date,<metric>...`. Every row gives
//! a value for each required metric on its date; an empty cell counts as 0,
//! as in the warehouse's full join of spend and traffic. Rows repeating an
//! `(entity, date)` pair are summed, the same aggregation the warehouse
//! query applies.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;
use tracing::{debug, info};

use super::{DateWindow, MetricSource};
use crate::models::{EntityHistory, MetricSeries};

const ENTITY_COLUMN: &str = "entity";
const DATE_COLUMN: &str = "date";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Error type for CSV export loading
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("required column '{0}' missing from header")]
    MissingColumn(String),

    #[error("line {line}: entity is empty")]
    MissingEntity { line: u64 },

    #[error("line {line}: invalid date '{value}', expected YYYY-MM-DD")]
    InvalidDate { line: u64, value: String },

    #[error("line {line}: invalid value '{value}' for {column}")]
    InvalidValue { line: u64, column: String, value: String },
}

/// One entity's metric values keyed by date, then metric
type DailyRows = BTreeMap<NaiveDate, BTreeMap<String, f64>>;

/// Metric source loaded eagerly from a CSV export
#[derive(Debug, Clone)]
pub struct CsvMetricSource {
    rows: BTreeMap<String, DailyRows>,
}

impl CsvMetricSource {
    /// Load `path`, requiring every metric in `required` to be a column
    ///
    /// Columns besides `entity`, `date` and the required metrics are ignored.
    pub fn load(path: &Path, required: &[String]) -> Result<Self, SourceError> {
        let file = File::open(path).map_err(|source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(BufReader::new(file));

        let headers = reader.headers()?.clone();
        let column = |name: &str| {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| SourceError::MissingColumn(name.to_string()))
        };

        let entity_idx = column(ENTITY_COLUMN)?;
        let date_idx = column(DATE_COLUMN)?;
        let metric_columns = required
            .iter()
            .map(|metric| Ok((metric.clone(), column(metric.as_str())?)))
            .collect::<Result<Vec<(String, usize)>, SourceError>>()?;

        let mut rows: BTreeMap<String, DailyRows> = BTreeMap::new();
        let mut merged = 0usize;
        let mut line_count = 0usize;

        for result in reader.records() {
            let record = result?;
            let line = record.position().map(|p| p.line()).unwrap_or_default();
            line_count += 1;

            let entity = record.get(entity_idx).unwrap_or_default();
            if entity.is_empty() {
                return Err(SourceError::MissingEntity { line });
            }

            let raw_date = record.get(date_idx).unwrap_or_default();
            let date = NaiveDate::parse_from_str(raw_date, DATE_FORMAT).map_err(|_| {
                SourceError::InvalidDate {
                    line,
                    value: raw_date.to_string(),
                }
            })?;

            let days = rows.entry(entity.to_string()).or_default();
            if days.contains_key(&date) {
                merged += 1;
            }
            let day = days.entry(date).or_default();

            for (metric, idx) in &metric_columns {
                let value = parse_value(record.get(*idx).unwrap_or_default(), line, metric)?;
                *day.entry(metric.clone()).or_insert(0.0) += value;
            }
        }

        info!(
            path = %path.display(),
            rows = line_count,
            entities = rows.len(),
            merged_rows = merged,
            "Loaded metric export"
        );

        Ok(Self { rows })
    }

    /// Number of distinct entities in the export
    pub fn entity_count(&self) -> usize {
        self.rows.len()
    }
}

/// Empty cells are zero
fn parse_value(raw: &str, line: u64, column: &str) -> Result<f64, SourceError> {
    if raw.is_empty() {
        return Ok(0.0);
    }
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(SourceError::InvalidValue {
            line,
            column: column.to_string(),
            value: raw.to_string(),
        }),
    }
}

#[async_trait]
impl MetricSource for CsvMetricSource {
    async fn entities(&self) -> Result<Vec<String>> {
        Ok(self.rows.keys().cloned().collect())
    }

    async fn history(&self, entity: &str, window: DateWindow) -> Result<EntityHistory> {
        let mut history = EntityHistory::new(entity);
        let Some(days) = self.rows.get(entity) else {
            debug!(entity = %entity, "Entity not present in export");
            return Ok(history);
        };

        let mut points: BTreeMap<&str, Vec<(NaiveDate, f64)>> = BTreeMap::new();
        for (date, values) in days.range(window.start..=window.end) {
            for (metric, value) in values {
                points.entry(metric.as_str()).or_default().push((*date, *value));
            }
        }

        for (metric, series) in points {
            history.insert(MetricSeries::new(entity, metric, series)?)?;
        }
        Ok(history)
    }
}
