//! Metric sources
//!
//! A source lists the entities it knows about and hands out one entity's
//! daily history for a date window. Sources must supply at most one row per
//! `(entity, date)`.

mod csv_export;

pub use csv_export::{CsvMetricSource, SourceError};

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate};

use crate::models::{EntityHistory, MetricSeries};

/// Inclusive range of calendar days
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    /// `[target − days, target]`
    pub fn ending_on(target: NaiveDate, days: u32) -> Self {
        let start = target
            .checked_sub_signed(Duration::days(i64::from(days)))
            .unwrap_or(NaiveDate::MIN);
        Self { start, end: target }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// Trait for metric history providers
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Entities with at least one row
    async fn entities(&self) -> Result<Vec<String>>;

    /// History of `entity` restricted to `window`
    ///
    /// Unknown entities yield an empty history.
    async fn history(&self, entity: &str, window: DateWindow) -> Result<EntityHistory>;
}

/// Source backed by histories held in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryMetricSource {
    histories: BTreeMap<String, EntityHistory>,
}

impl InMemoryMetricSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an entity's history
    pub fn insert(&mut self, history: EntityHistory) {
        self.histories.insert(history.entity().to_string(), history);
    }

    pub fn with_history(mut self, history: EntityHistory) -> Self {
        self.insert(history);
        self
    }

    pub fn len(&self) -> usize {
        self.histories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histories.is_empty()
    }
}

#[async_trait]
impl MetricSource for InMemoryMetricSource {
    async fn entities(&self) -> Result<Vec<String>> {
        Ok(self.histories.keys().cloned().collect())
    }

    async fn history(&self, entity: &str, window: DateWindow) -> Result<EntityHistory> {
        let Some(full) = self.histories.get(entity) else {
            return Ok(EntityHistory::new(entity));
        };

        let mut windowed = EntityHistory::new(entity);
        for series in full.metrics().filter_map(|metric| full.get(metric)) {
            let points: Vec<(NaiveDate, f64)> = series
                .dates()
                .iter()
                .copied()
                .zip(series.values().iter().copied())
                .filter(|(date, _)| window.contains(*date))
                .collect();
            if points.is_empty() {
                continue;
            }
            windowed.insert(MetricSeries::new(entity, series.metric(), points)?)?;
        }
        Ok(windowed)
    }
}
