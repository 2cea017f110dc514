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

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::{access::Map, ArcSwap};
use flexi_logger::writers::FileLogWriter;
use flexi_logger::{Age, Cleanup, Criterion, FileSpec, LoggerHandle, Naming};
use log::{info, warn, Level};

use super::{Config, ConfigError};
use crate::flow_generator::{FlowTimeout, PoolConfig};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowConfig {
    pub worker_count: usize,
    pub queue_size: usize,
    pub pool: PoolConfig,
    pub flow_timeout: FlowTimeout,
    pub aging_interval: Duration,
    pub max_flows: usize,
    pub sync_queue_size: usize,
}

impl From<&Config> for FlowConfig {
    fn from(conf: &Config) -> Self {
        FlowConfig {
            worker_count: conf.flow_worker_count,
            queue_size: conf.flow_queue_size,
            pool: conf.flow_pool,
            flow_timeout: conf.flow_timeout,
            aging_interval: conf.flow_aging_interval,
            max_flows: conf.max_flows,
            sync_queue_size: conf.sync_queue_size,
        }
    }
}

impl FlowConfig {
    // Fields only read when the workers are built
    fn restart_fields_differ(&self, other: &FlowConfig) -> bool {
        self.worker_count != other.worker_count
            || self.queue_size != other.queue_size
            || self.pool != other.pool
            || self.sync_queue_size != other.sync_queue_size
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogConfig {
    pub log_file: String,
    pub log_level: Level,
    pub log_retention: u32,
}

impl From<&Config> for LogConfig {
    fn from(conf: &Config) -> Self {
        LogConfig {
            log_file: conf.log_file.clone(),
            log_level: Level::from_str(&conf.log_level).unwrap_or(Level::Info),
            log_retention: conf.log_retention,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleConfig {
    pub flow: FlowConfig,
    pub log: LogConfig,
}

impl From<&Config> for ModuleConfig {
    fn from(conf: &Config) -> Self {
        ModuleConfig {
            flow: conf.into(),
            log: conf.into(),
        }
    }
}

type Access<C> = Map<Arc<ArcSwap<ModuleConfig>>, ModuleConfig, fn(&ModuleConfig) -> &C>;

pub type FlowAccess = Access<FlowConfig>;

pub type LogAccess = Access<LogConfig>;

pub struct ConfigHandler {
    pub static_config: Config,
    current_config: Arc<ArcSwap<ModuleConfig>>,
    logger_handle: Option<LoggerHandle>,
}

impl ConfigHandler {
    pub fn new(config: Config) -> Self {
        let current_config = Arc::new(ArcSwap::from_pointee(ModuleConfig::from(&config)));
        Self {
            static_config: config,
            current_config,
            logger_handle: None,
        }
    }

    pub fn set_logger_handle(&mut self, handle: LoggerHandle) {
        self.logger_handle = Some(handle);
    }

    pub fn flow(&self) -> FlowAccess {
        Map::new(self.current_config.clone(), |config| -> &FlowConfig {
            &config.flow
        })
    }

    pub fn log(&self) -> LogAccess {
        Map::new(self.current_config.clone(), |config| -> &LogConfig {
            &config.log
        })
    }

    pub fn current(&self) -> Arc<ModuleConfig> {
        self.current_config.load_full()
    }

    /*
     * Applies a reloaded configuration. Timeouts, the flow limit and log
     * settings take effect immediately, worker and pool sizing keep their
     * current values until restart.
     */
    pub fn on_config(&mut self, new_config: Config) -> Result<(), ConfigError> {
        new_config.validate()?;
        let candidate = self.current_config.load_full();
        let mut new = ModuleConfig::from(&new_config);

        if candidate.flow.restart_fields_differ(&new.flow) {
            warn!("flow worker, queue and pool sizing changes take effect after restart");
            new.flow.worker_count = candidate.flow.worker_count;
            new.flow.queue_size = candidate.flow.queue_size;
            new.flow.pool = candidate.flow.pool;
            new.flow.sync_queue_size = candidate.flow.sync_queue_size;
        }
        if candidate.flow.max_flows != new.flow.max_flows {
            info!("max flows set to {}", new.flow.max_flows);
        }
        if candidate.flow.flow_timeout != new.flow.flow_timeout {
            info!("flow timeout set to {:?}", new.flow.flow_timeout);
        }

        if candidate.log.log_file != new.log.log_file {
            warn!("log file change takes effect after restart");
            new.log.log_file = candidate.log.log_file.clone();
        }
        if let Some(handle) = self.logger_handle.as_mut() {
            if candidate.log.log_level != new.log.log_level {
                match handle.parse_and_push_temp_spec(new.log.log_level.as_str().to_lowercase()) {
                    Ok(_) => info!("log level set to {}", new.log.log_level),
                    Err(e) => {
                        warn!("failed to set log_level: {}", e);
                        new.log.log_level = candidate.log.log_level;
                    }
                }
            }
            if candidate.log.log_retention != new.log.log_retention {
                let reset = FileSpec::try_from(&new.log.log_file)
                    .map_err(|e| e.to_string())
                    .and_then(|spec| {
                        handle
                            .reset_flw(
                                &FileLogWriter::builder(spec)
                                    .rotate(
                                        Criterion::Age(Age::Day),
                                        Naming::Timestamps,
                                        Cleanup::KeepLogFiles(new.log.log_retention as usize),
                                    )
                                    .create_symlink(&new.log.log_file)
                                    .append(),
                            )
                            .map_err(|e| e.to_string())
                    });
                match reset {
                    Ok(_) => info!("log_retention set to {}", new.log.log_retention),
                    Err(e) => {
                        warn!("failed to set log_retention: {}", e);
                        new.log.log_retention = candidate.log.log_retention;
                    }
                }
            }
        }

        self.static_config = new_config;
        self.current_config.store(Arc::new(new));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use arc_swap::access::Access;

    use super::*;

    #[test]
    fn access_follows_reload() {
        let mut handler = ConfigHandler::new(Config::default());
        let flow = handler.flow();
        assert_eq!(flow.load().max_flows, 0);

        let mut config = Config::default();
        config.max_flows = 100;
        config.flow_timeout.tcp = Duration::from_secs(10);
        handler.on_config(config).unwrap();
        assert_eq!(flow.load().max_flows, 100);
        assert_eq!(flow.load().flow_timeout.tcp, Duration::from_secs(10));
    }

    #[test]
    fn sizing_kept_until_restart() {
        let mut handler = ConfigHandler::new(Config::default());
        let mut config = Config::default();
        config.flow_worker_count = 8;
        config.flow_pool.init_count = 10;
        handler.on_config(config).unwrap();
        let current = handler.current();
        assert_eq!(current.flow.worker_count, Config::default().flow_worker_count);
        assert_eq!(current.flow.pool, PoolConfig::default());
    }

    #[test]
    fn invalid_reload_keeps_current() {
        let mut handler = ConfigHandler::new(Config::default());
        let mut config = Config::default();
        config.flow_worker_count = 0;
        assert!(handler.on_config(config).is_err());
        assert_eq!(*handler.current(), ModuleConfig::from(&Config::default()));
    }
}
