use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::runtime::history::HistoryLevel;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub history_level: HistoryLevel,
    /// Upper bound for operations planned by one command; catches endless loops in a model.
    pub max_operations_per_command: usize,
    pub job_executor: JobExecutorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_level: HistoryLevel::Activity,
            max_operations_per_command: 10_000,
            job_executor: JobExecutorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct JobExecutorConfig {
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub lock_time_ms: u64,
    pub job_timeout_ms: u64,
    pub default_retries: u32,
    pub retry_wait_ms: u64,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            batch_size: 16,
            lock_time_ms: 300_000,
            job_timeout_ms: 60_000,
            default_retries: 3,
            retry_wait_ms: 10_000,
        }
    }
}

impl JobExecutorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }
}

impl EngineConfig {
    pub fn from_yaml_file(file_path: &str) -> Result<Self> {
        let content = fs::read_to_string(file_path)
            .with_context(|| format!("Failed to read engine config from {}", file_path))?;

        let config: EngineConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to deserialize engine config from {}", file_path))?;

        Ok(config)
    }
}
