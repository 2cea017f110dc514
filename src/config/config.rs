/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use log::Level;
use serde::Deserialize;
use thiserror::Error;

use crate::common::{DEFAULT_LOG_FILE, DEFAULT_LOG_RETENTION};
use crate::flow_generator::{FlowTimeout, PoolConfig};

const MAX_FLOW_WORKERS: usize = 64;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("yaml config invalid: {0}")]
    YamlConfigInvalid(String),
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub log_file: String,
    pub log_level: String,
    pub log_retention: u32,

    pub flow_worker_count: usize,
    pub flow_queue_size: usize,
    pub flow_pool: PoolConfig,
    pub flow_timeout: FlowTimeout,
    #[serde(with = "humantime_serde")]
    pub flow_aging_interval: Duration,
    // 0 disables the limit
    pub max_flows: usize,
    pub sync_queue_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_file: DEFAULT_LOG_FILE.into(),
            log_level: "info".into(),
            log_retention: DEFAULT_LOG_RETENTION,
            flow_worker_count: 4,
            flow_queue_size: 65536,
            flow_pool: PoolConfig::default(),
            flow_timeout: FlowTimeout::default(),
            flow_aging_interval: Duration::from_secs(1),
            max_flows: 0,
            sync_queue_size: 65536,
        }
    }
}

impl Config {
    pub fn load_from_file<T: AsRef<Path>>(path: T) -> Result<Self, ConfigError> {
        let contents =
            fs::read_to_string(path).map_err(|e| ConfigError::YamlConfigInvalid(e.to_string()))?;
        Self::load(&contents)
    }

    pub fn load<C: AsRef<str>>(contents: C) -> Result<Self, ConfigError> {
        let contents = contents.as_ref();
        if contents.trim().is_empty() {
            // parsing empty string leads to EOF error
            return Ok(Self::default());
        }
        let mut cfg: Self = serde_yaml::from_str(contents)
            .map_err(|e| ConfigError::YamlConfigInvalid(e.to_string()))?;

        // convert relative path to absolute
        if Path::new(&cfg.log_file).is_relative() {
            let Ok(mut pb) = env::current_dir() else {
                return Err(ConfigError::YamlConfigInvalid("get cwd failed".to_owned()));
            };
            pb.push(&cfg.log_file);
            match pb.to_str() {
                Some(s) => cfg.log_file = s.to_owned(),
                None => {
                    return Err(ConfigError::YamlConfigInvalid(format!(
                        "invalid log path {}",
                        cfg.log_file
                    )))
                }
            }
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flow_worker_count == 0 || self.flow_worker_count > MAX_FLOW_WORKERS {
            return Err(ConfigError::YamlConfigInvalid(format!(
                "flow-worker-count {} not in [1, {}]",
                self.flow_worker_count, MAX_FLOW_WORKERS
            )));
        }
        if self.flow_queue_size == 0 || self.sync_queue_size == 0 {
            return Err(ConfigError::YamlConfigInvalid(
                "queue sizes must be positive".to_owned(),
            ));
        }
        if self.flow_pool.grow_size == 0 {
            return Err(ConfigError::YamlConfigInvalid(
                "flow-pool.grow-size must be positive".to_owned(),
            ));
        }
        let t = &self.flow_timeout;
        if [t.tcp, t.udp, t.icmp, t.short].contains(&Duration::ZERO)
            || self.flow_aging_interval.is_zero()
        {
            return Err(ConfigError::YamlConfigInvalid(
                "flow timeouts must be positive".to_owned(),
            ));
        }
        if Level::from_str(&self.log_level).is_err() {
            return Err(ConfigError::YamlConfigInvalid(format!(
                "log-level {} invalid",
                self.log_level
            )));
        }
        Ok(())
    }
}
