// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;
use txdag_scheduler::{SchedulerError, TxnIndex};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to sanitize the DAG execution config! Field: {0}, Error: {1}")]
    ConfigSanitizerFailed(String, String),
    #[error("Error accessing {0}: {1}")]
    IO(String, #[source] std::io::Error),
    #[error("Error (de)serializing {0}: {1}")]
    Yaml(String, #[source] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum BlockExecutionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("failed to build the executor thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("transaction {0} produced no output")]
    MissingOutput(TxnIndex),
}
