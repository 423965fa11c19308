// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};
use txdag_conflict_metadata::MAX_CACHE_SHARD_BITS;
use txdag_scheduler::SchedulerKind;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DagExecutionConfig {
    /// Number of worker threads executing the parallel part of a block.
    pub concurrency_level: usize,
    pub scheduler_kind: SchedulerKind,
    /// Parsed function descriptors kept per cache shard.
    pub abi_cache_capacity: usize,
    pub abi_cache_shard_bits: u32,
    /// Match call selectors against the SM signature scheme instead of keccak.
    pub sm_crypto: bool,
}

impl Default for DagExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency_level: num_cpus::get(),
            scheduler_kind: SchedulerKind::Dag,
            abi_cache_capacity: 32,
            abi_cache_shard_bits: 4,
            sm_crypto: false,
        }
    }
}

impl DagExecutionConfig {
    pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|error| ConfigError::IO(path.display().to_string(), error))?;
        Self::parse_serialized_config(&contents)
    }

    pub fn parse_serialized_config(serialized_config: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(serialized_config)
            .map_err(|error| ConfigError::Yaml("DagExecutionConfig".to_string(), error))?;
        config.sanitize()?;
        Ok(config)
    }

    pub fn sanitize(&self) -> Result<(), ConfigError> {
        let failed = |field: &str, reason: String| {
            Err(ConfigError::ConfigSanitizerFailed(field.to_owned(), reason))
        };
        if self.concurrency_level == 0 {
            return failed(
                "concurrency_level",
                "at least one worker thread is required".to_string(),
            );
        }
        if self.abi_cache_capacity == 0 {
            return failed(
                "abi_cache_capacity",
                "the metadata cache must hold at least one entry per shard".to_string(),
            );
        }
        if self.abi_cache_shard_bits > MAX_CACHE_SHARD_BITS {
            return failed(
                "abi_cache_shard_bits",
                format!(
                    "{} exceeds the maximum of {}",
                    self.abi_cache_shard_bits, MAX_CACHE_SHARD_BITS
                ),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_matches, assert_ok};

    #[test]
    fn defaults_are_sane() {
        let config = DagExecutionConfig::default();
        assert_ok!(config.sanitize());
        assert_eq!(config.abi_cache_capacity, 32);
        assert_eq!(config.abi_cache_shard_bits, 4);
        assert_eq!(config.scheduler_kind, SchedulerKind::Dag);
    }

    #[test]
    fn parses_partial_yaml() {
        let config = assert_ok!(DagExecutionConfig::parse_serialized_config(
            "concurrency_level: 8\nscheduler_kind: graph_engine\nsm_crypto: true\n"
        ));
        assert_eq!(config.concurrency_level, 8);
        assert_eq!(config.scheduler_kind, SchedulerKind::GraphEngine);
        assert!(config.sm_crypto);
        assert_eq!(config.abi_cache_capacity, 32);
    }

    #[test]
    fn rejects_bad_configs() {
        assert_matches!(
            DagExecutionConfig::parse_serialized_config("unknown_field: 1"),
            Err(ConfigError::Yaml(..))
        );
        assert_matches!(
            DagExecutionConfig::parse_serialized_config("concurrency_level: 0"),
            Err(ConfigError::ConfigSanitizerFailed(field, _)) if field == "concurrency_level"
        );
        assert_matches!(
            DagExecutionConfig::parse_serialized_config("abi_cache_capacity: 0"),
            Err(ConfigError::ConfigSanitizerFailed(field, _)) if field == "abi_cache_capacity"
        );
        assert_matches!(
            DagExecutionConfig::parse_serialized_config("abi_cache_shard_bits: 17"),
            Err(ConfigError::ConfigSanitizerFailed(field, _)) if field == "abi_cache_shard_bits"
        );
        assert_matches!(
            DagExecutionConfig::load_config("/nonexistent/dag_execution.yaml"),
            Err(ConfigError::IO(..))
        );
    }

    #[test]
    fn round_trips_through_yaml() {
        let config = DagExecutionConfig {
            concurrency_level: 3,
            scheduler_kind: SchedulerKind::GraphEngine,
            abi_cache_capacity: 7,
            abi_cache_shard_bits: 2,
            sm_crypto: false,
        };
        let serialized = serde_yaml::to_string(&config).unwrap();
        assert_eq!(
            assert_ok!(DagExecutionConfig::parse_serialized_config(&serialized)),
            config
        );
    }
}
