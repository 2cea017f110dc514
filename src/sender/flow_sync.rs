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

use std::fmt;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};
use public::queue::{Error, Receiver};

use super::{QUEUE_BATCH_SIZE, RCV_TIMEOUT};
use crate::common::FlowKey;
use crate::flow_generator::{FlowEntry, FlowFlags, ShortReason, Translation};
use crate::policy::ActionBits;
use crate::utils::stats::{Counter, CounterType, CounterValue, RefCountable};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOp {
    Add,
    Update,
    Delete,
}

// One leg as handed to the dataplane
#[derive(Clone, Debug, PartialEq)]
pub struct FlowSyncRecord {
    pub op: SyncOp,
    pub key: FlowKey,
    pub nh_id: u32,
    pub ecmp_index: u32,
    pub nat: Option<Translation>,
    pub action: ActionBits,
    pub flags: FlowFlags,
    pub short_reason: ShortReason,
    pub generation: u64,
}

impl FlowSyncRecord {
    pub fn new(op: SyncOp, entry: &FlowEntry, generation: u64) -> Self {
        Self {
            op,
            key: entry.key,
            nh_id: entry.nh_id(),
            ecmp_index: entry.ecmp_index,
            nat: entry.nat.clone(),
            action: entry.sync_action(),
            flags: entry.flags,
            short_reason: entry.short_reason,
            generation,
        }
    }
}

impl fmt::Display for FlowSyncRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:?} {} nh:{} action:{:?} gen:{}",
            self.op, self.key, self.nh_id, self.action, self.generation
        )
    }
}

pub trait FlowInstaller: Send {
    // false when the dataplane refused the record
    fn install(&mut self, record: &FlowSyncRecord) -> bool;
}

// Accepts everything
#[derive(Default)]
pub struct LogInstaller;

impl FlowInstaller for LogInstaller {
    fn install(&mut self, record: &FlowSyncRecord) -> bool {
        debug!("install {}", record);
        true
    }
}

pub type InstallCallback = Box<dyn Fn(FlowKey, u64, bool) + Send>;

#[derive(Debug, Default)]
pub struct SyncCounter {
    pub rx: AtomicU64,
    pub installed: AtomicU64,
    pub failed: AtomicU64,
    pub deleted: AtomicU64,
}

impl RefCountable for SyncCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "rx",
                CounterType::Counted,
                CounterValue::Unsigned(self.rx.swap(0, Ordering::Relaxed)),
            ),
            (
                "installed",
                CounterType::Counted,
                CounterValue::Unsigned(self.installed.swap(0, Ordering::Relaxed)),
            ),
            (
                "failed",
                CounterType::Counted,
                CounterValue::Unsigned(self.failed.swap(0, Ordering::Relaxed)),
            ),
            (
                "deleted",
                CounterType::Counted,
                CounterValue::Unsigned(self.deleted.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}

struct FlowSync {
    input: Arc<Receiver<FlowSyncRecord>>,
    installer: Box<dyn FlowInstaller>,
    on_result: InstallCallback,
    running: Arc<AtomicBool>,
    counter: Arc<SyncCounter>,
}

impl FlowSync {
    fn handle(&mut self, record: FlowSyncRecord) {
        self.counter.rx.fetch_add(1, Ordering::Relaxed);
        let ok = self.installer.install(&record);
        if record.op == SyncOp::Delete {
            self.counter.deleted.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if ok {
            self.counter.installed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counter.failed.fetch_add(1, Ordering::Relaxed);
        }
        (self.on_result)(record.key, record.generation, ok);
    }

    fn process(&mut self) {
        while self.running.load(Ordering::Relaxed) {
            match self.input.recv_n(QUEUE_BATCH_SIZE, Some(RCV_TIMEOUT)) {
                Ok(records) => {
                    for record in records {
                        self.handle(record);
                    }
                }
                Err(Error::Timeout) => continue,
                Err(Error::Terminated(..)) => break,
                Err(Error::BatchTooLarge(_)) => unreachable!(),
            }
        }
        // whatever is left still reaches the installer
        for record in self.input.try_recv_all() {
            self.handle(record);
        }
    }
}

/*
 * Hands flow records to the dataplane installer on its own thread and
 * reports the install result of every non delete record back through
 * `on_result`.
 */
pub struct FlowSyncThread {
    input: Arc<Receiver<FlowSyncRecord>>,
    sync: Option<(Box<dyn FlowInstaller>, InstallCallback)>,
    running: Arc<AtomicBool>,
    counter: Arc<SyncCounter>,
    thread_handle: Option<JoinHandle<()>>,
}

impl FlowSyncThread {
    pub fn new(
        input: Receiver<FlowSyncRecord>,
        installer: Box<dyn FlowInstaller>,
        on_result: InstallCallback,
    ) -> Self {
        Self {
            input: Arc::new(input),
            sync: Some((installer, on_result)),
            running: Arc::new(AtomicBool::new(false)),
            counter: Arc::new(SyncCounter::default()),
            thread_handle: None,
        }
    }

    pub fn counter(&self) -> &Arc<SyncCounter> {
        &self.counter
    }

    pub fn start(&mut self) -> std::io::Result<()> {
        if self.running.swap(true, Ordering::Relaxed) {
            warn!("flow sync already started, do nothing.");
            return Ok(());
        }
        let Some((installer, on_result)) = self.sync.take() else {
            warn!("flow sync cannot be restarted");
            return Ok(());
        };
        let mut sync = FlowSync {
            input: self.input.clone(),
            installer,
            on_result,
            running: self.running.clone(),
            counter: self.counter.clone(),
        };
        self.thread_handle = Some(
            thread::Builder::new()
                .name("flow-sync".to_owned())
                .spawn(move || sync.process())?,
        );
        info!("flow sync started");
        Ok(())
    }

    pub fn notify_stop(&mut self) -> Option<JoinHandle<()>> {
        if !self.running.swap(false, Ordering::Relaxed) {
            warn!("flow sync already stopped, do nothing.");
            return None;
        }
        info!("notified stopping flow sync");
        self.thread_handle.take()
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.notify_stop() {
            let _ = handle.join();
            info!("stopped flow sync");
        }
    }
}
