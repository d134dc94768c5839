// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing configuration files and working with a provisioner
//! configuration

use camino::Utf8Path;
use camino::Utf8PathBuf;
use dropshot::ConfigLogging;
use provisioner_planning::layout::DEFAULT_SEARCH_BUDGET;
use serde::Deserialize;
use serde::Serialize;
use serde_with::serde_as;
use serde_with::DurationSeconds;
use std::time::Duration;
use thiserror::Error;

/// Configuration for a provisioner
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Config {
    /// Server-wide logging configuration.
    pub log: ConfigLogging,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub solver: SolverConfig,
    pub storage: StorageConfig,
    /// path to the template and service catalog
    pub templates: Utf8PathBuf,
}

impl Config {
    /// Load a `Config` from the given TOML file
    pub fn from_file(path: &Utf8Path) -> Result<Config, LoadError> {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|err| LoadError::Io { path: path.into(), err })?;
        let config_parsed: Config = toml::from_str(&file_contents)
            .map_err(|err| LoadError::Parse { path: path.into(), err })?;
        Ok(config_parsed)
    }
}

/// Task execution and background task tuning
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SchedulerConfig {
    /// executions a task gets before it fails for good
    pub max_attempts: u32,
    /// how long a worker may hold a task before it is handed to another
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "lease_timeout_secs")]
    pub lease_timeout: Duration,
    /// how long an idle worker waits for a task before asking again
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "lease_wait_secs")]
    pub lease_wait: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "reaper_period_secs")]
    pub reaper_period: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "recovery_period_secs")]
    pub recovery_period: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "expiry_period_secs")]
    pub expiry_period: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_attempts: 3,
            lease_timeout: Duration::from_secs(30),
            lease_wait: Duration::from_secs(1),
            reaper_period: Duration::from_secs(5),
            recovery_period: Duration::from_secs(60),
            expiry_period: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct WorkerConfig {
    pub count: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig { count: 4 }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SolverConfig {
    /// backtracking steps the layout search may take before giving up
    pub search_budget: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig { search_budget: DEFAULT_SEARCH_BUDGET }
    }
}

/// Where records are kept
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    Memory,
    File { path: Utf8PathBuf },
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("error reading \"{path}\": {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing \"{path}\": {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
}
