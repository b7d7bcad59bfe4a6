// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_SNAPSHOT_THREADINESS: usize = 6;
const DEFAULT_RESTORE_THREADINESS: usize = 3;
const DEFAULT_RESYNC_PERIOD_SECS: u64 = 5 * 60;
const DEFAULT_RETRY_INTERVAL_SECS: u64 = 5;

/// Configuration for the snapshot controller process.
///
/// Every field has a default, so an empty file is a valid configuration.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct Config {
    /// Minimum level of log messages to emit. Overridden by `--log-level`.
    #[serde(default, rename = "log-level")]
    pub log_level: Option<String>,

    /// Period at which informers re-deliver every cached object to their
    /// handlers.
    #[serde(default = "default_resync_period", rename = "resync-period-secs")]
    pub resync_period_secs: u64,

    #[serde(default)]
    pub snapshot: ControllerConfig,

    #[serde(default = "ControllerConfig::restore_default")]
    pub restore: ControllerConfig,
}

impl Config {
    /// Constructs a configuration with every value at its default.
    ///
    /// Typically, the configuration is parsed from a config file via
    /// [`parse`].
    pub fn new() -> Config {
        Config {
            log_level: None,
            resync_period_secs: DEFAULT_RESYNC_PERIOD_SECS,
            snapshot: ControllerConfig::default(),
            restore: ControllerConfig::restore_default(),
        }
    }

    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}

/// Tunables for one controller.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Number of workers started per work queue.
    #[serde(default = "default_snapshot_threadiness")]
    pub threadiness: usize,

    /// Delay before re-examining an object that is waiting on something no
    /// event will announce, such as a source VM lock or a target VM
    /// shutting down.
    #[serde(default = "default_retry_interval", rename = "retry-interval-secs")]
    pub retry_interval_secs: u64,
}

impl ControllerConfig {
    fn restore_default() -> ControllerConfig {
        ControllerConfig {
            threadiness: DEFAULT_RESTORE_THREADINESS,
            retry_interval_secs: DEFAULT_RETRY_INTERVAL_SECS,
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            threadiness: DEFAULT_SNAPSHOT_THREADINESS,
            retry_interval_secs: DEFAULT_RETRY_INTERVAL_SECS,
        }
    }
}

fn default_snapshot_threadiness() -> usize {
    DEFAULT_SNAPSHOT_THREADINESS
}

fn default_resync_period() -> u64 {
    DEFAULT_RESYNC_PERIOD_SECS
}

fn default_retry_interval() -> u64 {
    DEFAULT_RETRY_INTERVAL_SECS
}

/// Errors which may be returned when parsing the controller configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    from_str(&contents)
}

/// Parses configuration from TOML text.
pub fn from_str(contents: &str) -> Result<Config, ParseError> {
    let cfg = toml::from_str::<Config>(contents)?;
    if cfg.snapshot.threadiness == 0 {
        return Err(ParseError::Zero("snapshot.threadiness"));
    }
    if cfg.restore.threadiness == 0 {
        return Err(ParseError::Zero("restore.threadiness"));
    }
    Ok(cfg)
}
