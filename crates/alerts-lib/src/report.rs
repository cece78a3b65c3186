//! JSON run report

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{AnomalyRecord, RunSummary};
use crate::orchestrator::RunOutcome;
use crate::sink::DeliveryReport;

/// Everything a run produced, as persisted next to the job logs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub target_date: NaiveDate,
    pub executed_at: DateTime<Utc>,
    pub summary: RunSummary,
    pub delivery: DeliveryReport,
    pub alerts: Vec<AnomalyRecord>,
}

impl RunReport {
    pub fn new(outcome: RunOutcome, delivery: DeliveryReport, executed_at: DateTime<Utc>) -> Self {
        Self {
            target_date: outcome.target_date,
            executed_at,
            summary: outcome.summary,
            delivery,
            alerts: outcome.alerts,
        }
    }

    /// Write the report as pretty-printed JSON, creating parent directories
    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create report directory {}", parent.display()))?;
        }

        let json = serde_json::to_string_pretty(self).context("Failed to serialize run report")?;
        fs::write(path, json).with_context(|| format!("Failed to write report to {}", path.display()))
    }

    pub fn read_json(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read report {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("Invalid report {}", path.display()))
    }
}
