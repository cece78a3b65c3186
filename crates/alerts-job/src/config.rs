//! Job configuration
//!
//! Values come from an optional TOML file, then `ALERTS_*` environment
//! variables; command-line flags are applied on top by the binary.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use alerts_lib::anomaly::IsolationForestParams;
use alerts_lib::sink::is_placeholder_url;
use alerts_lib::DetectionConfig;
use chrono_tz::Tz;
use serde::Deserialize;
use thiserror::Error;

/// Configuration errors; any of these aborts the job before work starts
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),
}

/// Alert job configuration
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    /// Days of history loaded before the target date
    #[serde(default = "default_historical_window")]
    pub historical_window: u32,

    /// Number of scaled MADs a residual must exceed
    #[serde(default = "default_mad_threshold")]
    pub mad_threshold: f64,

    /// Expected anomaly share for the isolation ensemble
    #[serde(default = "default_contamination")]
    pub contamination: f64,

    /// Metrics to evaluate, in feature order
    #[serde(default = "default_metric_set")]
    pub metric_set: Vec<String>,

    /// IANA zone used to compute "yesterday"
    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default = "default_seed")]
    pub seed: u64,

    #[serde(default = "default_n_trees")]
    pub n_trees: usize,

    #[serde(default = "default_max_samples")]
    pub max_samples: usize,

    /// Warehouse CSV export to evaluate
    #[serde(default)]
    pub input_path: Option<PathBuf>,

    /// Teams incoming webhook; alerts are only logged without one
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Dashboard linked from every card
    #[serde(default = "default_dashboard_url")]
    pub dashboard_url: String,

    #[serde(default = "default_delivery_concurrency")]
    pub delivery_concurrency: usize,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Where to write the JSON run report
    #[serde(default)]
    pub report_path: Option<PathBuf>,

    /// Where to write Prometheus textfile metrics
    #[serde(default)]
    pub metrics_path: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_historical_window() -> u32 {
    alerts_lib::DEFAULT_HISTORICAL_WINDOW
}

fn default_mad_threshold() -> f64 {
    alerts_lib::anomaly::DEFAULT_MAD_THRESHOLD
}

fn default_contamination() -> f64 {
    alerts_lib::anomaly::DEFAULT_CONTAMINATION
}

fn default_metric_set() -> Vec<String> {
    alerts_lib::DEFAULT_METRICS.iter().map(|m| m.to_string()).collect()
}

fn default_timezone() -> String {
    alerts_lib::DEFAULT_TIMEZONE.name().to_string()
}

fn default_seed() -> u64 {
    IsolationForestParams::default().seed
}

fn default_n_trees() -> usize {
    IsolationForestParams::default().n_trees
}

fn default_max_samples() -> usize {
    IsolationForestParams::default().max_samples
}

fn default_dashboard_url() -> String {
    "https://app.powerbi.com/".to_string()
}

fn default_delivery_concurrency() -> usize {
    alerts_lib::DEFAULT_DELIVERY_CONCURRENCY
}

fn default_request_timeout() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            historical_window: default_historical_window(),
            mad_threshold: default_mad_threshold(),
            contamination: default_contamination(),
            metric_set: default_metric_set(),
            timezone: default_timezone(),
            seed: default_seed(),
            n_trees: default_n_trees(),
            max_samples: default_max_samples(),
            input_path: None,
            webhook_url: None,
            dashboard_url: default_dashboard_url(),
            delivery_concurrency: default_delivery_concurrency(),
            request_timeout_secs: default_request_timeout(),
            report_path: None,
            metrics_path: None,
            log_level: default_log_level(),
        }
    }
}

impl JobConfig {
    /// Load from `file` (if given) and the environment, then validate
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("ALERTS")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("metric_set"),
            )
            .build()?;

        let job: JobConfig = config.try_deserialize()?;
        job.validate()?;
        Ok(job)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.historical_window == 0 {
            return Err(invalid("historical_window", "must be at least 1 day"));
        }
        if !self.mad_threshold.is_finite() || self.mad_threshold <= 0.0 {
            return Err(invalid("mad_threshold", format!("must be positive, got {}", self.mad_threshold)));
        }
        if !(self.contamination > 0.0 && self.contamination <= 0.5) {
            return Err(invalid(
                "contamination",
                format!("must be in (0, 0.5], got {}", self.contamination),
            ));
        }
        if self.metric_set.is_empty() {
            return Err(invalid("metric_set", "at least one metric is required"));
        }
        let unique: BTreeSet<&str> = self.metric_set.iter().map(String::as_str).collect();
        if unique.len() != self.metric_set.len() {
            return Err(invalid("metric_set", "metrics must be unique"));
        }
        if self.n_trees == 0 {
            return Err(invalid("n_trees", "must be at least 1"));
        }
        if self.max_samples == 0 {
            return Err(invalid("max_samples", "must be at least 1"));
        }
        if self.delivery_concurrency == 0 {
            return Err(invalid("delivery_concurrency", "must be at least 1"));
        }
        if self.request_timeout_secs == 0 {
            return Err(invalid("request_timeout_secs", "must be at least 1 second"));
        }
        self.timezone()?;
        Ok(())
    }

    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::UnknownTimezone(self.timezone.clone()))
    }

    /// Detector parameters for the orchestrator
    pub fn detection(&self) -> DetectionConfig {
        DetectionConfig {
            mad_threshold: self.mad_threshold,
            contamination: self.contamination,
            metric_set: self.metric_set.clone(),
            forest: IsolationForestParams {
                n_trees: self.n_trees,
                max_samples: self.max_samples,
                seed: self.seed,
            },
        }
    }

    /// The webhook URL if one is set and is not the sample placeholder
    pub fn usable_webhook(&self) -> Option<&str> {
        self.webhook_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty() && !is_placeholder_url(url))
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}
