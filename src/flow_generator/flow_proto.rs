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

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::access::Access;
use log::{debug, info, warn};
use parking_lot::Mutex;
use public::queue::{self, Error, Receiver, Sender, StatsHandle};

use super::error::{Error as FlowError, Result};
use super::flow_mgmt::{EventDispatcher, PendingOp};
use super::flow_table::FlowTable;
use crate::common::{FlowKey, PktInfo};
use crate::config::handler::FlowAccess;
use crate::sender::InstallCallback;
use crate::utils::stats::{Counter, CounterType, CounterValue, RefCountable};
use crate::utils::timestamp_now;

const QUEUE_BATCH_SIZE: usize = 1024;
const RCV_TIMEOUT: Duration = Duration::from_secs(1);

pub enum FlowEvent {
    Packet(PktInfo),
    // scheduled operation on a pair, see `EventDispatcher`
    Pending { pair_id: u64, seq: u64 },
    InstallResult { key: FlowKey, generation: u64, ok: bool },
    Flush,
}

#[derive(Default)]
pub struct WorkerCounter {
    pub packets: AtomicU64,
    pub packet_errors: AtomicU64,
    pub pending: AtomicU64,
    pub install_results: AtomicU64,
    pub aged: AtomicU64,
}

impl RefCountable for WorkerCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "packets",
                CounterType::Counted,
                CounterValue::Unsigned(self.packets.swap(0, Ordering::Relaxed)),
            ),
            (
                "packet-errors",
                CounterType::Counted,
                CounterValue::Unsigned(self.packet_errors.swap(0, Ordering::Relaxed)),
            ),
            (
                "pending",
                CounterType::Counted,
                CounterValue::Unsigned(self.pending.swap(0, Ordering::Relaxed)),
            ),
            (
                "install-results",
                CounterType::Counted,
                CounterValue::Unsigned(self.install_results.swap(0, Ordering::Relaxed)),
            ),
            (
                "aged",
                CounterType::Counted,
                CounterValue::Unsigned(self.aged.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}

pub fn handle_event(
    table: &FlowTable,
    dispatcher: &EventDispatcher,
    event: FlowEvent,
    counter: &WorkerCounter,
) {
    match event {
        FlowEvent::Packet(pkt) => {
            counter.packets.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = table.process_packet(&pkt) {
                counter.packet_errors.fetch_add(1, Ordering::Relaxed);
                debug!("packet {} dropped: {}", pkt.key, e);
            }
        }
        FlowEvent::Pending { pair_id, seq } => {
            counter.pending.fetch_add(1, Ordering::Relaxed);
            let result = match dispatcher.claim(pair_id, seq) {
                Some(PendingOp::Revaluate) => table.revaluate(pair_id),
                Some(PendingOp::Delete(reason)) => table.delete_pair(pair_id, reason),
                None => Ok(()),
            };
            if let Err(e) = result {
                debug!("pending operation skipped: {}", e);
            }
        }
        FlowEvent::InstallResult {
            key,
            generation,
            ok,
        } => {
            counter.install_results.fetch_add(1, Ordering::Relaxed);
            table.on_install_result(&key, generation, ok);
        }
        FlowEvent::Flush => {
            table.flush();
        }
    }
}

// A known key goes to the worker owning its pair, the reverse key of a
// translated flow does not hash to that worker
fn shard_of(table: &FlowTable, key: &FlowKey, count: usize) -> usize {
    match table.lookup(key) {
        Some((handle, _)) => handle.lock().shard,
        None => key.shard(count),
    }
}

struct FlowWorker {
    id: usize,
    table: Arc<FlowTable>,
    dispatcher: Arc<EventDispatcher>,
    input: Receiver<FlowEvent>,
    config: FlowAccess,
    running: Arc<AtomicBool>,
    counter: Arc<WorkerCounter>,
}

impl FlowWorker {
    fn run(&self) {
        let mut last_aging = timestamp_now();
        while self.running.load(Ordering::Relaxed) {
            match self.input.recv_n(QUEUE_BATCH_SIZE, Some(RCV_TIMEOUT)) {
                Ok(events) => {
                    for event in events {
                        handle_event(&self.table, &self.dispatcher, event, &self.counter);
                    }
                }
                Err(Error::Timeout) => (),
                Err(Error::Terminated(..)) => break,
                Err(Error::BatchTooLarge(_)) => unreachable!(),
            }

            let now = timestamp_now();
            if now.saturating_sub(last_aging) >= self.config.load().aging_interval {
                let aged = self.table.age(now, Some(self.id));
                self.counter.aged.fetch_add(aged as u64, Ordering::Relaxed);
                last_aging = now;
            }
        }
        debug!("flow worker {} exit", self.id);
    }
}

/*
 * Flow workers, one per shard. A packet is handled by the worker its key
 * hashes to, both legs of a flow without translation land on the same
 * worker. Each worker also ages the pairs of its shard.
 */
pub struct FlowProto {
    table: Arc<FlowTable>,
    dispatcher: Arc<EventDispatcher>,
    config: FlowAccess,

    senders: Vec<Sender<FlowEvent>>,
    receivers: Vec<Receiver<FlowEvent>>,
    queue_stats: Vec<StatsHandle<FlowEvent>>,
    counters: Vec<Arc<WorkerCounter>>,

    running: Arc<AtomicBool>,
    thread_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl FlowProto {
    pub fn new(config: FlowAccess, table: Arc<FlowTable>) -> Self {
        let (workers, queue_size) = {
            let conf = config.load();
            (conf.worker_count.max(1), conf.queue_size)
        };
        let mut senders = Vec::with_capacity(workers);
        let mut receivers = Vec::with_capacity(workers);
        let mut queue_stats = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (sender, receiver, stats) = queue::bounded(queue_size);
            senders.push(sender);
            receivers.push(receiver);
            queue_stats.push(stats);
        }
        let dispatcher = Arc::new(EventDispatcher::new(senders.clone()));
        Self {
            table,
            dispatcher,
            config,
            senders,
            receivers,
            queue_stats,
            counters: (0..workers).map(|_| Default::default()).collect(),
            running: Arc::new(AtomicBool::new(false)),
            thread_handles: Mutex::new(vec![]),
        }
    }

    pub fn table(&self) -> &Arc<FlowTable> {
        &self.table
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }

    pub fn counters(&self) -> &[Arc<WorkerCounter>] {
        &self.counters
    }

    // Queue statistics for registration, can only be taken once
    pub fn take_queue_stats(&mut self) -> Vec<StatsHandle<FlowEvent>> {
        std::mem::take(&mut self.queue_stats)
    }

    fn shard_of(&self, key: &FlowKey) -> usize {
        shard_of(&self.table, key, self.senders.len())
    }

    fn send(&self, shard: usize, event: FlowEvent) -> Result<()> {
        self.senders[shard % self.senders.len()]
            .send(event)
            .map_err(|_| FlowError::QueueTerminated)
    }

    pub fn enqueue(&self, pkt: PktInfo) -> Result<()> {
        let shard = self.shard_of(&pkt.key);
        self.send(shard, FlowEvent::Packet(pkt))
    }

    pub fn flush(&self) -> Result<()> {
        self.send(0, FlowEvent::Flush)
    }

    pub fn install_result(&self, key: FlowKey, generation: u64, ok: bool) -> Result<()> {
        self.send(
            self.shard_of(&key),
            FlowEvent::InstallResult {
                key,
                generation,
                ok,
            },
        )
    }

    // Routes dataplane verdicts back to the worker of the flow
    pub fn install_callback(&self) -> InstallCallback {
        let senders = self.senders.clone();
        let table = self.table.clone();
        Box::new(move |key, generation, ok| {
            let shard = shard_of(&table, &key, senders.len());
            let event = FlowEvent::InstallResult {
                key,
                generation,
                ok,
            };
            if senders[shard].send(event).is_err() {
                debug!("flow worker {} gone, install result dropped", shard);
            }
        })
    }

    // Allocation blocks once the free entries run out, pool growth waits
    // for `resume`
    pub fn pause(&self) {
        self.table.pool().pause();
    }

    pub fn resume(&self) {
        self.table.pool().resume();
    }

    pub fn start(&mut self) -> std::io::Result<()> {
        if self.running.swap(true, Ordering::Relaxed) {
            warn!("flow workers already started, do nothing.");
            return Ok(());
        }
        if self.receivers.is_empty() {
            warn!("flow workers cannot be restarted");
            return Ok(());
        }
        let mut handles = self.thread_handles.lock();
        for (id, input) in self.receivers.drain(..).enumerate() {
            let worker = FlowWorker {
                id,
                table: self.table.clone(),
                dispatcher: self.dispatcher.clone(),
                input,
                config: self.config.clone(),
                running: self.running.clone(),
                counter: self.counters[id].clone(),
            };
            handles.push(
                thread::Builder::new()
                    .name(format!("flow-worker-{}", id))
                    .spawn(move || worker.run())?,
            );
        }
        info!("{} flow workers started", handles.len());
        Ok(())
    }

    pub fn notify_stop(&self) -> Vec<JoinHandle<()>> {
        if !self.running.swap(false, Ordering::Relaxed) {
            warn!("flow workers already stopped, do nothing.");
            return vec![];
        }
        info!("notified stopping flow workers");
        std::mem::take(&mut *self.thread_handles.lock())
    }

    pub fn stop(&self) {
        let handles = self.notify_stop();
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            let _ = handle.join();
        }
        info!("stopped flow workers");
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;
    use std::time::Instant;

    use arc_swap::ArcSwap;
    use public::enums::{IpProtocol, TunnelType};

    use super::*;
    use crate::common::platform_data::{FloatingIp, Interface, PlatformData};
    use crate::config::{handler::ConfigHandler, Config};
    use crate::flow_generator::flow_mgmt::FlowDeps;
    use crate::flow_generator::pool::EntryPool;
    use crate::route::{NhRegistry, NhSpec, RouteTables, RouteUpdate};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn proto(workers: usize) -> FlowProto {
        let mut config = Config::default();
        config.flow_worker_count = workers;
        let handler = ConfigHandler::new(config);
        let tables = Arc::new(RouteTables::new(Arc::new(NhRegistry::new())));
        let public = NhSpec::Tunnel {
            router: ip("10.0.0.9"),
            label: 20,
            tunnel_type: TunnelType::MplsGre,
        };
        for (vrf, prefix, nh, vn) in [
            (1, "1.1.1.1/32", NhSpec::Interface(1), "vn1"),
            (1, "1.1.1.2/32", NhSpec::Interface(2), "vn1"),
            (2, "2.1.1.100/32", NhSpec::Interface(1), "public"),
            (2, "0.0.0.0/0", public, "public"),
        ] {
            tables
                .add(RouteUpdate::new(vrf, prefix.parse().unwrap(), nh, vn))
                .unwrap();
        }
        let mut web = Interface::new(1, 1, "vn1", ip("1.1.1.1"));
        web.floating_ips
            .push(FloatingIp::new(ip("2.1.1.100"), 2, "public"));
        let data = PlatformData::default()
            .with_interface(web)
            .with_interface(Interface::new(2, 1, "vn1", ip("1.1.1.2")));
        let table = Arc::new(FlowTable::new(
            handler.flow(),
            Arc::new(EntryPool::new(handler.flow().load().pool.clone())),
            tables,
            Arc::new(ArcSwap::from_pointee(data)),
            Arc::new(FlowDeps::default()),
            None,
        ));
        FlowProto::new(handler.flow(), table)
    }

    fn pkt(sport: u16) -> PktInfo {
        PktInfo::new(FlowKey {
            vrf_id: 1,
            protocol: IpProtocol::Tcp,
            src_addr: ip("1.1.1.1"),
            dst_addr: ip("1.1.1.2"),
            src_port: sport,
            dst_port: 80,
            nh_id: 1,
        })
    }

    fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn workers_create_flows() {
        let mut proto = proto(2);
        proto.start().unwrap();
        for port in 0..50 {
            proto.enqueue(pkt(1000 + port)).unwrap();
        }
        let table = proto.table().clone();
        assert!(wait_for(|| table.len() == 50));

        proto.flush().unwrap();
        assert!(wait_for(|| table.is_empty()));
        proto.stop();
    }

    #[test]
    fn stale_pending_event_is_skipped() {
        let proto = proto(1);
        let table = proto.table().clone();
        let handle = table.process_packet(&pkt(1000)).unwrap();
        let id = handle.lock().id;

        let dispatcher = proto.dispatcher();
        dispatcher.post(id, 0, PendingOp::Revaluate).unwrap();
        dispatcher
            .post(id, 0, PendingOp::Delete(crate::flow_generator::ShortReason::None))
            .unwrap();
        assert_eq!(dispatcher.pending_count(), 1);

        let counter = WorkerCounter::default();
        let events = proto.receivers[0].try_recv_all();
        assert_eq!(events.len(), 2);
        for event in events {
            handle_event(&table, dispatcher, event, &counter);
        }
        assert!(handle.lock().deleted);
        assert_eq!(dispatcher.pending_count(), 0);
        assert_eq!(dispatcher.counter().obsolete.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn translated_reply_goes_to_the_pair_worker() {
        let proto = proto(4);
        let table = proto.table().clone();
        let mut found = None;
        for sport in 1000..1064 {
            let key = FlowKey {
                dst_addr: ip("8.8.8.8"),
                ..pkt(sport).key
            };
            let handle = table.process_packet(&PktInfo::new(key)).unwrap();
            let pair = handle.lock();
            assert_eq!(pair.reverse.key.vrf_id, 2);
            if pair.reverse.key.shard(4) != pair.shard {
                found = Some((pair.reverse.key, pair.shard));
                break;
            }
        }
        let (rkey, shard) = found.unwrap();

        proto.enqueue(PktInfo::new(rkey)).unwrap();
        proto.install_callback()(rkey, 1, true);
        for (i, receiver) in proto.receivers.iter().enumerate() {
            let expected = if i == shard { 2 } else { 0 };
            assert_eq!(receiver.try_recv_all().len(), expected);
        }
    }
}
