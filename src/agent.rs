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

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use anyhow::{anyhow, Result};
use arc_swap::{access::Access, ArcSwap};
use flexi_logger::{colored_opt_format, Age, Cleanup, Criterion, FileSpec, Logger, Naming};
use log::{info, warn};
use parking_lot::Mutex;

use crate::{
    common::PlatformData,
    config::{Config, ConfigHandler},
    flow_generator::{FlowDeps, FlowEntryPool, FlowMgmt, FlowProto, FlowTable},
    route::{NhRegistry, RouteTables},
    sender::{FlowSyncThread, LogInstaller},
    utils::{
        logger::LogLevelWriter,
        stats::{self, Countable, RefCountable, StatsOption},
    },
};

use public::queue;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/*
 * Wires the flow resolution pipeline together: route tables and next-hop
 * registry, flow table with its workers, the control plane handle and the
 * dataplane sync thread. Counters of every component are registered with
 * the stats collector.
 */
pub struct Agent {
    config_path: PathBuf,
    config_handler: Mutex<ConfigHandler>,
    stats_collector: Arc<stats::Collector>,

    flow_proto: FlowProto,
    flow_mgmt: FlowMgmt,
    flow_sync: FlowSyncThread,
}

fn start_logger(
    config_handler: &mut ConfigHandler,
    stats_collector: &stats::Collector,
) -> Result<()> {
    let config = &config_handler.static_config;
    let (log_level_writer, log_level_counter) = LogLevelWriter::new();
    let logger = Logger::try_with_env_or_str(&config.log_level)?.format(colored_opt_format);
    // check log folder permission
    let write_to_file = match Path::new(&config.log_file).parent() {
        Some(base_path) if base_path.exists() => base_path
            .metadata()
            .ok()
            .map(|meta| !meta.permissions().readonly())
            .unwrap_or(false),
        Some(base_path) => fs::create_dir_all(base_path).is_ok(),
        None => false,
    };
    let logger = if write_to_file {
        logger
            .log_to_file_and_writer(
                FileSpec::try_from(&config.log_file)?,
                Box::new(log_level_writer),
            )
            .rotate(
                Criterion::Age(Age::Day),
                Naming::Timestamps,
                Cleanup::KeepLogFiles(config.log_retention as usize),
            )
            .create_symlink(&config.log_file)
            .append()
    } else {
        eprintln!(
            "Log file path '{}' access denied, logs will not be written to file",
            &config.log_file
        );
        logger.log_to_writer(Box::new(log_level_writer))
    };
    let logger_handle = logger
        .duplicate_to_stderr(flexi_logger::Duplicate::Warn)
        .start()?;
    config_handler.set_logger_handle(logger_handle);

    stats_collector.register_countable(
        "log_counter",
        Countable::Owned(Box::new(log_level_counter)),
        Default::default(),
    );
    Ok(())
}

impl Agent {
    pub fn start<P: AsRef<Path>>(config_path: P) -> Result<Agent> {
        let config_path = config_path.as_ref().to_path_buf();
        let config = Config::load_from_file(&config_path)
            .map_err(|e| anyhow!("load config {} failed: {}", config_path.display(), e))?;
        let mut config_handler = ConfigHandler::new(config);
        let stats_collector = Arc::new(stats::Collector::new());
        start_logger(&mut config_handler, &stats_collector)?;

        info!("vrouter-agent {} starting", VERSION);
        info!("static_config {:#?}", config_handler.static_config);

        let flow_config = config_handler.flow();
        let (pool_config, sync_queue_size) = {
            let conf = flow_config.load();
            (conf.pool, conf.sync_queue_size)
        };

        let registry = Arc::new(NhRegistry::new());
        stats_collector.register_countable(
            "nh_registry",
            Countable::Ref(Arc::downgrade(registry.counter()) as Weak<dyn RefCountable>),
            Default::default(),
        );
        let tables = Arc::new(RouteTables::new(registry));
        stats_collector.register_countable(
            "route_table",
            Countable::Ref(Arc::downgrade(tables.counter()) as Weak<dyn RefCountable>),
            Default::default(),
        );
        let platform = Arc::new(ArcSwap::from_pointee(PlatformData::default()));

        let pool = Arc::new(FlowEntryPool::new(pool_config));
        stats_collector.register_countable(
            "flow_pool",
            Countable::Ref(Arc::downgrade(pool.counter()) as Weak<dyn RefCountable>),
            Default::default(),
        );

        let (sync_sender, sync_receiver, sync_stats) = queue::bounded(sync_queue_size);
        stats_collector.register_countable(
            "queue",
            Countable::Owned(Box::new(sync_stats)),
            vec![StatsOption::Tag("module", "0-flow-to-sync".to_owned())],
        );

        let table = Arc::new(FlowTable::new(
            flow_config.clone(),
            pool,
            tables.clone(),
            platform.clone(),
            Arc::new(FlowDeps::default()),
            Some(sync_sender),
        ));
        stats_collector.register_countable(
            "flow_table",
            Countable::Ref(Arc::downgrade(table.counter()) as Weak<dyn RefCountable>),
            Default::default(),
        );

        let mut flow_proto = FlowProto::new(flow_config, table.clone());
        for (i, counter) in flow_proto.counters().iter().enumerate() {
            stats_collector.register_countable(
                "flow_worker",
                Countable::Ref(Arc::downgrade(counter) as Weak<dyn RefCountable>),
                vec![StatsOption::Tag("index", i.to_string())],
            );
        }
        for (i, queue_stats) in flow_proto.take_queue_stats().into_iter().enumerate() {
            stats_collector.register_countable(
                "queue",
                Countable::Owned(Box::new(queue_stats)),
                vec![
                    StatsOption::Tag("module", "1-packet-to-flow-worker".to_owned()),
                    StatsOption::Tag("index", i.to_string()),
                ],
            );
        }
        stats_collector.register_countable(
            "flow_dispatcher",
            Countable::Ref(
                Arc::downgrade(flow_proto.dispatcher().counter()) as Weak<dyn RefCountable>
            ),
            Default::default(),
        );

        let flow_mgmt = FlowMgmt::new(
            table,
            tables,
            platform,
            flow_proto.dispatcher().clone(),
        );

        let mut flow_sync = FlowSyncThread::new(
            sync_receiver,
            Box::new(LogInstaller),
            flow_proto.install_callback(),
        );
        stats_collector.register_countable(
            "flow_sync",
            Countable::Ref(Arc::downgrade(flow_sync.counter()) as Weak<dyn RefCountable>),
            Default::default(),
        );

        flow_sync.start()?;
        flow_proto.start()?;
        stats_collector.start();
        info!("vrouter-agent started");

        Ok(Agent {
            config_path,
            config_handler: Mutex::new(config_handler),
            stats_collector,
            flow_proto,
            flow_mgmt,
            flow_sync,
        })
    }

    pub fn flow_mgmt(&self) -> &FlowMgmt {
        &self.flow_mgmt
    }

    pub fn flow_proto(&self) -> &FlowProto {
        &self.flow_proto
    }

    pub fn stats_collector(&self) -> &Arc<stats::Collector> {
        &self.stats_collector
    }

    // Re-reads the config file, an invalid file keeps the running config
    pub fn reload(&self) {
        let config = match Config::load_from_file(&self.config_path) {
            Ok(c) => c,
            Err(e) => {
                warn!("reload {} failed: {}", self.config_path.display(), e);
                return;
            }
        };
        match self.config_handler.lock().on_config(config) {
            Ok(_) => info!("config {} reloaded", self.config_path.display()),
            Err(e) => warn!("config {} rejected: {}", self.config_path.display(), e),
        }
    }

    pub fn stop(&mut self) {
        info!("Gracefully stopping");
        self.flow_proto.stop();
        // deletes still drain through the sync thread
        let flushed = self.flow_proto.table().flush();
        info!("{} flows flushed", flushed);
        self.flow_sync.stop();
        self.stats_collector.stop();
        info!("Gracefully stopped");
    }
}
