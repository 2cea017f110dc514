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

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use ahash::{AHashMap, AHashSet, RandomState};
use arc_swap::ArcSwap;
use dashmap::{mapref::entry::Entry, DashMap};
use ipnet::IpNet;
use log::{debug, info};
use parking_lot::Mutex;
use public::queue::Sender;

use super::error::{Error, Result};
use super::flow_entry::ShortReason;
use super::flow_info::FlowInfo;
use super::flow_proto::FlowEvent;
use super::flow_table::FlowTable;
use crate::common::platform_data::{PlatformData, TagTarget, TagUpdate};
use crate::common::FlowKey;
use crate::policy::ApplicationPolicySet;
use crate::route::{GroupId, RouteTables, RouteUpdate};
use crate::utils::stats::{Counter, CounterType, CounterValue, RefCountable};

// Configuration objects a flow was resolved against
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DepKey {
    // interface the initiator entered through
    Ingress(u32),
    Interface(u32),
    Vn(String),
    Route(u32, IpNet),
    Group(GroupId),
    // a route lookup in this vrf found nothing
    Unresolved(u32),
    Acl(u32),
    Sg(u32),
    Aps(u32),
}

impl DepKey {
    pub fn collect(info: &FlowInfo, key: &FlowKey) -> Vec<DepKey> {
        let mut deps = vec![];
        if let Some(id) = info.ingress_intf {
            deps.push(DepKey::Ingress(id));
        }
        if let Some(id) = info.egress_intf {
            deps.push(DepKey::Interface(id));
        }
        if let Some(t) = &info.nat {
            deps.push(DepKey::Interface(t.intf_id));
        }
        deps.extend(info.vrf_assign_acl.map(DepKey::Acl));
        if let Some(assign) = &info.vrf_assign {
            deps.push(DepKey::Vn(assign.vn.clone()));
        }
        for (route, vrf_id) in [(&info.src_route, key.vrf_id), (&info.dst_route, info.dst_vrf)] {
            match route {
                Some(r) => {
                    deps.push(DepKey::Route(r.vrf_id, r.prefix));
                    if let Some(id) = r.nh.group_id() {
                        deps.push(DepKey::Group(id));
                    }
                }
                None => deps.push(DepKey::Unresolved(vrf_id)),
            }
        }
        for vn in info.source_vn.iter().chain(info.dest_vn.iter()) {
            deps.push(DepKey::Vn(vn.clone()));
        }
        deps.extend(info.policy.acl_ids.iter().map(|id| DepKey::Acl(*id)));
        deps.extend(info.policy.sg_ids.iter().map(|id| DepKey::Sg(*id)));
        deps.extend(info.policy.aps_id.map(DepKey::Aps));
        let mut seen = AHashSet::new();
        deps.retain(|d| seen.insert(d.clone()));
        deps
    }
}

#[derive(Default)]
struct DepsInner {
    by_key: AHashMap<DepKey, AHashSet<u64>>,
    by_pair: AHashMap<u64, Vec<DepKey>>,
}

// Two way map between pairs and the objects they depend on
#[derive(Default)]
pub struct FlowDeps {
    inner: Mutex<DepsInner>,
}

impl FlowDeps {
    // Replaces what `pair_id` depends on
    pub fn track(&self, pair_id: u64, keys: Vec<DepKey>) {
        let mut inner = self.inner.lock();
        Self::remove(&mut inner, pair_id);
        for key in keys.iter() {
            inner.by_key.entry(key.clone()).or_default().insert(pair_id);
        }
        inner.by_pair.insert(pair_id, keys);
    }

    pub fn untrack(&self, pair_id: u64) {
        Self::remove(&mut self.inner.lock(), pair_id);
    }

    fn remove(inner: &mut DepsInner, pair_id: u64) {
        let Some(keys) = inner.by_pair.remove(&pair_id) else {
            return;
        };
        for key in keys {
            if let Some(pairs) = inner.by_key.get_mut(&key) {
                pairs.remove(&pair_id);
                if pairs.is_empty() {
                    inner.by_key.remove(&key);
                }
            }
        }
    }

    pub fn pairs_of<'a, I>(&self, keys: I) -> Vec<u64>
    where
        I: IntoIterator<Item = &'a DepKey>,
    {
        let inner = self.inner.lock();
        let mut ids: Vec<u64> = keys
            .into_iter()
            .filter_map(|k| inner.by_key.get(k))
            .flatten()
            .copied()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn deps_of(&self, pair_id: u64) -> Vec<DepKey> {
        self.inner
            .lock()
            .by_pair
            .get(&pair_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_pair.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingOp {
    Revaluate,
    Delete(ShortReason),
}

#[derive(Debug)]
struct Pending {
    seq: u64,
    op: PendingOp,
}

#[derive(Default)]
pub struct DispatchCounter {
    pub posted: AtomicU64,
    pub merged: AtomicU64,
    pub obsolete: AtomicU64,
}

impl RefCountable for DispatchCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "posted",
                CounterType::Counted,
                CounterValue::Unsigned(self.posted.swap(0, Ordering::Relaxed)),
            ),
            (
                "merged",
                CounterType::Counted,
                CounterValue::Unsigned(self.merged.swap(0, Ordering::Relaxed)),
            ),
            (
                "obsolete",
                CounterType::Counted,
                CounterValue::Unsigned(self.obsolete.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}

/*
 * Hands pair operations to the worker owning the pair.
 *
 * One pending operation is kept per pair. Posting again bumps its sequence,
 * events carrying an older sequence are skipped by the worker. A delete is
 * never downgraded to a re-evaluation.
 */
pub struct EventDispatcher {
    senders: Vec<Sender<FlowEvent>>,
    pending: DashMap<u64, Pending, RandomState>,
    seq: AtomicU64,
    counter: Arc<DispatchCounter>,
}

impl EventDispatcher {
    pub fn new(senders: Vec<Sender<FlowEvent>>) -> Self {
        Self {
            senders,
            pending: DashMap::with_hasher(RandomState::new()),
            seq: AtomicU64::new(1),
            counter: Default::default(),
        }
    }

    pub fn counter(&self) -> &Arc<DispatchCounter> {
        &self.counter
    }

    pub fn shard_count(&self) -> usize {
        self.senders.len()
    }

    pub fn post(&self, pair_id: u64, shard: usize, op: PendingOp) -> Result<()> {
        let sender = self.senders.get(shard).ok_or(Error::NoWorker(shard))?;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        match self.pending.entry(pair_id) {
            Entry::Occupied(mut e) => {
                let pending = e.get_mut();
                pending.seq = seq;
                if let PendingOp::Delete(_) = op {
                    pending.op = op;
                }
                self.counter.merged.fetch_add(1, Ordering::Relaxed);
            }
            Entry::Vacant(e) => {
                e.insert(Pending { seq, op });
            }
        }
        if sender.send(FlowEvent::Pending { pair_id, seq }).is_err() {
            self.pending.remove_if(&pair_id, |_, p| p.seq == seq);
            return Err(Error::QueueTerminated);
        }
        self.counter.posted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // The operation to run for an event, None when a newer event follows
    pub fn claim(&self, pair_id: u64, seq: u64) -> Option<PendingOp> {
        match self.pending.remove_if(&pair_id, |_, p| p.seq == seq) {
            Some((_, p)) => Some(p.op),
            None => {
                self.counter.obsolete.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/*
 * Control plane side of the flow table: applies configuration and route
 * changes, then schedules the affected pairs on their workers.
 */
pub struct FlowMgmt {
    table: Arc<FlowTable>,
    tables: Arc<RouteTables>,
    platform: Arc<ArcSwap<PlatformData>>,
    dispatcher: Arc<EventDispatcher>,
}

impl FlowMgmt {
    pub fn new(
        table: Arc<FlowTable>,
        tables: Arc<RouteTables>,
        platform: Arc<ArcSwap<PlatformData>>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            table,
            tables,
            platform,
            dispatcher,
        }
    }

    pub fn platform(&self) -> Arc<PlatformData> {
        self.platform.load_full()
    }

    fn schedule(&self, ids: Vec<u64>, op: PendingOp) -> Result<usize> {
        let mut posted = 0;
        for id in ids {
            let Some(shard) = self.table.pair_shard(id) else {
                continue;
            };
            self.dispatcher.post(id, shard, op)?;
            posted += 1;
        }
        Ok(posted)
    }

    // Returns the number of pairs scheduled for re-evaluation
    pub fn route_update(&self, update: RouteUpdate) -> Result<usize> {
        let vrf_id = update.vrf_id;
        let change = self.tables.add(update)?;
        let mut keys = vec![
            DepKey::Route(vrf_id, change.entry.prefix),
            DepKey::Unresolved(vrf_id),
        ];
        if let Some(covering) = change.covering {
            // flows of the shorter prefix may now resolve to the new one
            keys.push(DepKey::Route(vrf_id, covering));
        }
        for nh in [Some(change.entry.nh), change.previous.as_ref().map(|p| p.nh)]
            .into_iter()
            .flatten()
        {
            if let Some(id) = nh.group_id() {
                keys.push(DepKey::Group(id));
            }
        }
        let ids = self.table.deps().pairs_of(keys.iter());
        debug!(
            "route vrf {} {} touches {} flow pairs",
            vrf_id,
            change.entry.prefix,
            ids.len()
        );
        self.schedule(ids, PendingOp::Revaluate)
    }

    pub fn route_delete(&self, vrf_id: u32, prefix: &IpNet) -> Result<usize> {
        let Some(removed) = self.tables.delete(vrf_id, prefix) else {
            return Ok(0);
        };
        let mut keys = vec![DepKey::Route(vrf_id, removed.prefix)];
        if let Some(id) = removed.nh.group_id() {
            keys.push(DepKey::Group(id));
        }
        let ids = self.table.deps().pairs_of(keys.iter());
        self.schedule(ids, PendingOp::Revaluate)
    }

    /*
     * Swaps in a new configuration snapshot. Pairs that entered through a
     * removed interface are deleted, pairs touching anything else that
     * changed are re-evaluated.
     */
    pub fn platform_update(&self, data: PlatformData) -> Result<usize> {
        let old = self.platform.load_full();
        let diff = old.diff(&data);
        let old_sets: HashSet<u32> = old.policy_sets().iter().map(|s| s.id).collect();
        let new_sets: HashSet<u32> = data.policy_sets().iter().map(|s| s.id).collect();
        self.platform.store(Arc::new(data));
        if diff.is_empty() {
            return Ok(0);
        }
        info!("platform update {:?}", diff);

        let ingress: Vec<DepKey> = diff
            .removed_interfaces
            .iter()
            .map(|id| DepKey::Ingress(*id))
            .collect();
        let deleted = self.table.deps().pairs_of(ingress.iter());
        let mut scheduled = self.schedule(
            deleted.clone(),
            PendingOp::Delete(ShortReason::InterfaceDelete),
        )?;

        let revaluate = if old_sets != new_sets {
            // set selection may change for any flow
            self.table.pair_ids()
        } else {
            let mut keys = vec![];
            for id in diff
                .removed_interfaces
                .iter()
                .chain(diff.changed_interfaces.iter())
            {
                keys.push(DepKey::Interface(*id));
                keys.push(DepKey::Ingress(*id));
            }
            keys.extend(diff.changed_vns.iter().map(|n| DepKey::Vn(n.clone())));
            keys.extend(diff.changed_acls.iter().map(|id| DepKey::Acl(*id)));
            keys.extend(diff.changed_sgs.iter().map(|id| DepKey::Sg(*id)));
            keys.extend(diff.changed_policy_sets.iter().map(|id| DepKey::Aps(*id)));
            self.table.deps().pairs_of(keys.iter())
        };
        let revaluate: Vec<u64> = revaluate
            .into_iter()
            .filter(|id| deleted.binary_search(id).is_err())
            .collect();
        scheduled += self.schedule(revaluate, PendingOp::Revaluate)?;
        Ok(scheduled)
    }

    // Returns false when the tagged object does not exist
    pub fn tag_update(&self, update: TagUpdate) -> Result<bool> {
        let mut data = (*self.platform.load_full()).clone();
        if !data.apply_tags(&update) {
            return Ok(false);
        }
        let key = match &update.target {
            TagTarget::Interface(id) => DepKey::Interface(*id),
            TagTarget::Vn(name) => DepKey::Vn(name.clone()),
        };
        self.platform.store(Arc::new(data));
        let mut keys = vec![key];
        if let TagTarget::Interface(id) = update.target {
            keys.push(DepKey::Ingress(id));
        }
        let ids = self.table.deps().pairs_of(keys.iter());
        self.schedule(ids, PendingOp::Revaluate)?;
        Ok(true)
    }

    pub fn firewall_update(&self, sets: Vec<ApplicationPolicySet>) -> Result<usize> {
        let data = (*self.platform.load_full()).clone().with_policy_sets(sets);
        self.platform_update(data)
    }

    pub fn set_service_addrs(&self, addrs: Vec<IpAddr>) -> Result<usize> {
        let mut data = (*self.platform.load_full()).clone();
        data.set_service_addrs(addrs);
        self.platform.store(Arc::new(data));
        // implicit allowances change for flows towards any of them
        self.schedule(self.table.pair_ids(), PendingOp::Revaluate)
    }

    pub fn delete_flow(&self, pair_id: u64) -> Result<usize> {
        self.schedule(vec![pair_id], PendingOp::Delete(ShortReason::None))
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use public::enums::IpProtocol;
    use public::queue::{self, Receiver};

    use super::*;
    use crate::common::platform_data::Interface;
    use crate::common::PktInfo;
    use crate::config::{handler::ConfigHandler, Config};
    use crate::flow_generator::flow_config::PoolConfig;
    use crate::flow_generator::flow_proto::{handle_event, WorkerCounter};
    use crate::flow_generator::pool::EntryPool;
    use crate::flow_generator::{FlowFlags, FlowHandle};
    use crate::policy::TagSet;
    use crate::route::{NhRegistry, NhSpec};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn tcp(src: &str, sport: u16, dst: &str, dport: u16, nh_id: u32) -> FlowKey {
        FlowKey {
            vrf_id: 1,
            protocol: IpProtocol::Tcp,
            src_addr: ip(src),
            dst_addr: ip(dst),
            src_port: sport,
            dst_port: dport,
            nh_id,
        }
    }

    fn host_route(addr: &str, nh: u32) -> RouteUpdate {
        RouteUpdate::new(
            1,
            format!("{}/32", addr).parse().unwrap(),
            NhSpec::Interface(nh),
            "vn1",
        )
    }

    struct Setup {
        table: Arc<FlowTable>,
        mgmt: FlowMgmt,
        dispatcher: Arc<EventDispatcher>,
        events: Vec<Receiver<FlowEvent>>,
    }

    impl Setup {
        fn new() -> Self {
            let config = Config::default();
            let workers = config.flow_worker_count;
            let handler = ConfigHandler::new(config);
            let tables = Arc::new(RouteTables::new(Arc::new(NhRegistry::new())));
            tables.add(host_route("1.1.1.1", 1)).unwrap();
            tables.add(host_route("1.1.1.2", 2)).unwrap();
            let data = PlatformData::default()
                .with_interface(Interface::new(1, 1, "vn1", ip("1.1.1.1")))
                .with_interface(Interface::new(2, 1, "vn1", ip("1.1.1.2")));
            let platform = Arc::new(ArcSwap::from_pointee(data));
            let pool = Arc::new(EntryPool::new(PoolConfig {
                init_count: 32,
                grow_size: 16,
                min_threshold: 4,
            }));
            let table = Arc::new(FlowTable::new(
                handler.flow(),
                pool,
                tables.clone(),
                platform.clone(),
                Arc::new(FlowDeps::default()),
                None,
            ));
            let (senders, events): (Vec<_>, Vec<_>) = (0..workers)
                .map(|_| {
                    let (sender, receiver, _) = queue::bounded(1024);
                    (sender, receiver)
                })
                .unzip();
            let dispatcher = Arc::new(EventDispatcher::new(senders));
            let mgmt = FlowMgmt::new(table.clone(), tables, platform, dispatcher.clone());
            Self {
                table,
                mgmt,
                dispatcher,
                events,
            }
        }

        fn process(&self, key: FlowKey) -> FlowHandle {
            self.table.process_packet(&PktInfo::new(key)).unwrap()
        }

        // Runs queued events the way a flow worker does
        fn run_events(&self) -> usize {
            let counter = WorkerCounter::default();
            let events: Vec<FlowEvent> =
                self.events.iter().flat_map(|r| r.try_recv_all()).collect();
            let count = events.len();
            for event in events {
                handle_event(&self.table, &self.dispatcher, event, &counter);
            }
            count
        }
    }

    #[test]
    fn pending_operations_merge_per_pair() {
        let (sender, events, _) = queue::bounded(16);
        let dispatcher = EventDispatcher::new(vec![sender]);
        dispatcher.post(7, 0, PendingOp::Revaluate).unwrap();
        dispatcher
            .post(7, 0, PendingOp::Delete(ShortReason::InterfaceDelete))
            .unwrap();
        dispatcher.post(7, 0, PendingOp::Revaluate).unwrap();
        assert_eq!(dispatcher.pending_count(), 1);

        let seqs: Vec<u64> = events
            .try_recv_all()
            .into_iter()
            .filter_map(|e| match e {
                FlowEvent::Pending { pair_id: 7, seq } => Some(seq),
                _ => None,
            })
            .collect();
        assert_eq!(seqs.len(), 3);
        assert_eq!(dispatcher.claim(7, seqs[0]), None);
        assert_eq!(dispatcher.claim(7, seqs[1]), None);
        assert_eq!(
            dispatcher.claim(7, seqs[2]),
            Some(PendingOp::Delete(ShortReason::InterfaceDelete))
        );
        assert_eq!(dispatcher.pending_count(), 0);
        assert_eq!(dispatcher.counter().merged.load(Ordering::Relaxed), 2);
        assert_eq!(dispatcher.counter().obsolete.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn post_without_worker_fails() {
        let (sender, events, _) = queue::bounded(16);
        let dispatcher = EventDispatcher::new(vec![sender]);
        assert_eq!(
            dispatcher.post(7, 3, PendingOp::Revaluate),
            Err(Error::NoWorker(3))
        );
        assert_eq!(dispatcher.pending_count(), 0);
        assert_eq!(dispatcher.counter().posted.load(Ordering::Relaxed), 0);
        assert!(events.try_recv_all().is_empty());
    }

    #[test]
    fn pairs_on_every_shard_are_scheduled() {
        let s = Setup::new();
        let mut shards = HashSet::new();
        for sport in 1000..1064 {
            let handle = s.process(tcp("1.1.1.1", sport, "1.1.1.2", 80, 1));
            shards.insert(handle.lock().shard);
        }
        assert!(shards.len() > 1);
        assert_eq!(s.mgmt.set_service_addrs(vec![]).unwrap(), 64);
        assert_eq!(s.run_events(), 64);
        assert_eq!(s.dispatcher.pending_count(), 0);
    }

    #[test]
    fn tracked_dependencies_follow_the_pair() {
        let s = Setup::new();
        let handle = s.process(tcp("1.1.1.1", 1000, "1.1.1.2", 80, 1));
        let id = handle.lock().id;
        let deps = s.table.deps().deps_of(id);
        assert!(deps.contains(&DepKey::Ingress(1)));
        assert!(deps.contains(&DepKey::Interface(2)));
        assert!(deps.contains(&DepKey::Route(1, "1.1.1.2/32".parse().unwrap())));
        assert_eq!(s.table.deps().pairs_of([DepKey::Ingress(1)].iter()), vec![id]);

        s.table.delete_pair(id, ShortReason::None).unwrap();
        assert!(s.table.deps().is_empty());
    }

    #[test]
    fn route_changes_revaluate_dependent_flows() {
        let s = Setup::new();
        let handle = s.process(tcp("1.1.1.2", 1000, "1.1.1.1", 80, 2));
        let prefix: IpNet = "1.1.1.1/32".parse().unwrap();

        assert_eq!(s.mgmt.route_delete(1, &prefix).unwrap(), 1);
        assert_eq!(s.run_events(), 1);
        {
            let pair = handle.lock();
            assert!(pair.forward.flags.contains(FlowFlags::TRAP));
            assert_eq!(pair.forward.short_reason, ShortReason::NoDstRoute);
        }

        // the unresolved lookup is what ties the flow to the new route
        assert_eq!(s.mgmt.route_update(host_route("1.1.1.1", 1)).unwrap(), 1);
        assert_eq!(s.run_events(), 1);
        let pair = handle.lock();
        assert!(!pair.forward.flags.contains(FlowFlags::TRAP));
        assert_eq!(pair.forward.short_reason, ShortReason::None);
    }

    #[test]
    fn unrelated_route_schedules_nothing() {
        let s = Setup::new();
        s.process(tcp("1.1.1.1", 1000, "1.1.1.2", 80, 1));
        let update = RouteUpdate::new(
            3,
            "3.3.3.0/24".parse().unwrap(),
            NhSpec::Interface(1),
            "vn3",
        );
        assert_eq!(s.mgmt.route_update(update).unwrap(), 0);
        assert_eq!(s.run_events(), 0);
    }

    #[test]
    fn removed_interface_deletes_its_flows() {
        let s = Setup::new();
        let from_web = s.process(tcp("1.1.1.1", 1000, "1.1.1.2", 80, 1));
        assert_eq!(s.table.len(), 1);

        let data = (*s.mgmt.platform()).clone().without_interface(1);
        assert_eq!(s.mgmt.platform_update(data).unwrap(), 1);
        s.run_events();
        assert!(from_web.lock().deleted);
        assert!(s.table.is_empty());
        assert_eq!(s.dispatcher.pending_count(), 0);
    }

    #[test]
    fn tag_update_revaluates_flows_of_the_interface() {
        let s = Setup::new();
        s.process(tcp("1.1.1.1", 1000, "1.1.1.2", 80, 1));
        let update = TagUpdate {
            target: TagTarget::Interface(2),
            tags: TagSet::new([42]),
        };
        assert!(s.mgmt.tag_update(update).unwrap());
        assert_eq!(s.run_events(), 1);
        assert_eq!(
            s.mgmt.platform().interface(2).map(|i| i.tags.clone()),
            Some(TagSet::new([42]))
        );

        let unknown = TagUpdate {
            target: TagTarget::Interface(9),
            tags: TagSet::new([42]),
        };
        assert!(!s.mgmt.tag_update(unknown).unwrap());
    }

    #[test]
    fn delete_flow_removes_the_pair() {
        let s = Setup::new();
        let handle = s.process(tcp("1.1.1.1", 1000, "1.1.1.2", 80, 1));
        let id = handle.lock().id;
        assert_eq!(s.mgmt.delete_flow(id).unwrap(), 1);
        assert_eq!(s.mgmt.delete_flow(id + 100).unwrap(), 0);
        s.run_events();
        assert!(s.table.is_empty());
    }
}
