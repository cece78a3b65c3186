//! Daily marketing alert job
//!
//! Wires configuration, the metric export, the detection run and alert
//! delivery together. The `marketing-alerts` binary is a thin wrapper
//! around [`run_job`].

pub mod config;
pub mod job;

pub use config::{ConfigError, JobConfig};
pub use job::{build_sink, run_job, JobOptions, JOB_NAME};
