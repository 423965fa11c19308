// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler was run before being initialized")]
    NotInitialized,
    #[error("scheduler is already running")]
    AlreadyRunning,
    #[error("at least one worker thread is required")]
    NoWorkers,
    #[error("failed to build the worker thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
