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

use std::mem;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use ahash::RandomState;
use arc_swap::{access::Access, ArcSwap};
use dashmap::{mapref::entry::Entry, DashMap};
use log::{debug, error, info, trace, warn};
use public::queue::Sender;

use super::error::{Error, Result};
use super::flow_entry::{
    FlowEntryPool, FlowFlags, FlowHandle, FlowPair, Leg, ShortReason,
};
use super::flow_info::{FlowInfo, PreviousState, ResolveContext};
use super::flow_mgmt::{DepKey, FlowDeps};
use super::nat::{NatKind, Translation};
use crate::common::{FlowKey, PktInfo, PlatformData, TrapReason};
use crate::config::handler::FlowAccess;
use crate::policy::ActionBits;
use crate::route::RouteTables;
use crate::sender::{FlowSyncRecord, SyncOp};
use crate::utils::stats::{Counter, CounterType, CounterValue, RefCountable};
use crate::utils::timestamp_now;

const MAX_INSTALL_ATTEMPTS: usize = 8;
const MAX_BIND_ATTEMPTS: usize = 4;

#[derive(Debug, Default)]
pub struct KeyStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
}

#[derive(Clone)]
struct IndexEntry {
    pair_id: u64,
    pair: FlowHandle,
    leg: Leg,
    stats: Arc<KeyStats>,
}

impl IndexEntry {
    fn new(pair: FlowHandle, pair_id: u64, leg: Leg) -> Self {
        Self {
            pair_id,
            pair,
            leg,
            stats: Default::default(),
        }
    }
}

enum Bind {
    Bound,
    // another live flow owns the key
    Collision,
    // the owner is locked elsewhere
    Busy,
    // the owner is an older mirror of this pair
    Yield,
}

#[derive(Default)]
pub struct FlowTableCounter {
    pub created: AtomicU64,
    pub deleted: AtomicU64,
    pub short: AtomicU64,
    pub revaluated: AtomicU64,
    pub install_failed: AtomicU64,
    pub contention: AtomicU64,
    pub sync_dropped: AtomicU64,
    flows: AtomicU64,
}

impl RefCountable for FlowTableCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "created",
                CounterType::Counted,
                CounterValue::Unsigned(self.created.swap(0, Ordering::Relaxed)),
            ),
            (
                "deleted",
                CounterType::Counted,
                CounterValue::Unsigned(self.deleted.swap(0, Ordering::Relaxed)),
            ),
            (
                "short",
                CounterType::Counted,
                CounterValue::Unsigned(self.short.swap(0, Ordering::Relaxed)),
            ),
            (
                "revaluated",
                CounterType::Counted,
                CounterValue::Unsigned(self.revaluated.swap(0, Ordering::Relaxed)),
            ),
            (
                "install-failed",
                CounterType::Counted,
                CounterValue::Unsigned(self.install_failed.swap(0, Ordering::Relaxed)),
            ),
            (
                "contention",
                CounterType::Counted,
                CounterValue::Unsigned(self.contention.swap(0, Ordering::Relaxed)),
            ),
            (
                "sync-dropped",
                CounterType::Counted,
                CounterValue::Unsigned(self.sync_dropped.swap(0, Ordering::Relaxed)),
            ),
            (
                "flows",
                CounterType::Gauged,
                CounterValue::Unsigned(self.flows.load(Ordering::Relaxed)),
            ),
        ]
    }
}

/*
 * Concurrent flow index.
 *
 * Every indexed key points at the pair owning it, a key is owned by at most
 * one pair. A pair is changed only while its lock is held and locks are taken
 * pair first, index shard second. Another pair is only ever try-locked while
 * holding one, so two workers never wait on each other.
 *
 * Dataplane records are collected while a pair is locked and sent after the
 * lock is released.
 */
pub struct FlowTable {
    index: DashMap<FlowKey, IndexEntry, RandomState>,
    pairs: DashMap<u64, FlowHandle, RandomState>,
    next_id: AtomicU64,

    pool: Arc<FlowEntryPool>,
    tables: Arc<RouteTables>,
    platform: Arc<ArcSwap<PlatformData>>,
    deps: Arc<FlowDeps>,
    config: FlowAccess,
    output: Option<Sender<FlowSyncRecord>>,

    counter: Arc<FlowTableCounter>,
}

impl FlowTable {
    pub fn new(
        config: FlowAccess,
        pool: Arc<FlowEntryPool>,
        tables: Arc<RouteTables>,
        platform: Arc<ArcSwap<PlatformData>>,
        deps: Arc<FlowDeps>,
        output: Option<Sender<FlowSyncRecord>>,
    ) -> Self {
        Self {
            index: DashMap::with_hasher(RandomState::new()),
            pairs: DashMap::with_hasher(RandomState::new()),
            next_id: AtomicU64::new(1),
            pool,
            tables,
            platform,
            deps,
            config,
            output,
            counter: Default::default(),
        }
    }

    pub fn counter(&self) -> &Arc<FlowTableCounter> {
        &self.counter
    }

    pub fn pool(&self) -> &Arc<FlowEntryPool> {
        &self.pool
    }

    pub fn deps(&self) -> &Arc<FlowDeps> {
        &self.deps
    }

    // Number of live pairs
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn lookup(&self, key: &FlowKey) -> Option<(FlowHandle, Leg)> {
        self.index.get(key).map(|e| (e.pair.clone(), e.leg))
    }

    pub fn key_stats(&self, key: &FlowKey) -> Option<Arc<KeyStats>> {
        self.index.get(key).map(|e| e.stats.clone())
    }

    pub fn pair(&self, pair_id: u64) -> Option<FlowHandle> {
        self.pairs.get(&pair_id).map(|e| e.value().clone())
    }

    pub fn pair_shard(&self, pair_id: u64) -> Option<usize> {
        self.pair(pair_id).map(|h| h.lock().shard)
    }

    pub fn pair_ids(&self) -> Vec<u64> {
        self.pairs.iter().map(|e| *e.key()).collect()
    }

    /*
     * Returns the pair owning `key`, creating one with only the forward leg
     * indexed when there is none. Concurrent callers for the same key all get
     * the same pair. A fresh pair has generation 0, whoever locks it first
     * resolves it.
     */
    pub fn install(&self, key: &FlowKey) -> Result<(FlowHandle, Leg)> {
        for _ in 0..MAX_INSTALL_ATTEMPTS {
            if let Some(hit) = self.index.get(key).map(|e| {
                e.stats.hits.fetch_add(1, Ordering::Relaxed);
                (e.pair.clone(), e.leg)
            }) {
                return Ok(hit);
            }

            let mut forward = self.pool.allocate();
            forward.key = *key;
            let reverse = self.pool.allocate();
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let shard = key.shard(self.config.load().worker_count);
            let handle: FlowHandle = Arc::new(parking_lot::Mutex::new(FlowPair::new(
                id, shard, forward, reverse,
            )));

            let inserted = match self.index.entry(*key) {
                Entry::Vacant(e) => {
                    let entry = IndexEntry::new(handle.clone(), id, Leg::Forward);
                    entry.stats.misses.fetch_add(1, Ordering::Relaxed);
                    e.insert(entry);
                    true
                }
                Entry::Occupied(_) => false,
            };
            if !inserted {
                // lost the race, hand the entries back and look again
                let mut pair = handle.lock();
                self.pool.free(mem::take(&mut pair.forward));
                self.pool.free(mem::take(&mut pair.reverse));
                continue;
            }
            self.pairs.insert(id, handle.clone());
            self.counter.created.fetch_add(1, Ordering::Relaxed);
            self.counter.flows.fetch_add(1, Ordering::Relaxed);
            return Ok((handle, Leg::Forward));
        }
        self.counter.contention.fetch_add(1, Ordering::Relaxed);
        Err(Error::InstallContention(*key, MAX_INSTALL_ATTEMPTS))
    }

    // Runs `f` on the locked pair owning `key` until it reports done
    fn with_pair<F>(
        &self,
        key: &FlowKey,
        records: &mut Vec<FlowSyncRecord>,
        mut f: F,
    ) -> Result<FlowHandle>
    where
        F: FnMut(&FlowHandle, &mut FlowPair, Leg, &mut Vec<FlowSyncRecord>) -> bool,
    {
        for _ in 0..MAX_INSTALL_ATTEMPTS {
            let (handle, leg) = self.install(key)?;
            let done = {
                let mut pair = handle.lock();
                if pair.deleted {
                    continue;
                }
                if pair.leg(leg).key != *key {
                    self.drop_inconsistent(&mut pair, key, records);
                    continue;
                }
                f(&handle, &mut *pair, leg, records)
            };
            if done {
                return Ok(handle);
            }
        }
        self.counter.contention.fetch_add(1, Ordering::Relaxed);
        Err(Error::InstallContention(*key, MAX_INSTALL_ATTEMPTS))
    }

    /*
     * Called with a pair whose leg no longer carries `key`. Normally the pair
     * was rekeyed between lookup and lock and the index moved on. An index
     * still pointing here is broken, the pair is torn down and the next
     * packet creates it again.
     */
    fn drop_inconsistent(
        &self,
        pair: &mut FlowPair,
        key: &FlowKey,
        records: &mut Vec<FlowSyncRecord>,
    ) {
        let id = pair.id;
        let indexed = self
            .index
            .get(key)
            .map(|e| e.pair_id == id)
            .unwrap_or(false);
        if !indexed {
            return;
        }
        error!("flow pair {} indexed under {} it does not carry", id, key);
        debug_assert!(!indexed, "inconsistent flow pairing");
        self.index.remove_if(key, |_, e| e.pair_id == id);
        self.delete_locked(pair, ShortReason::None, records);
    }

    pub fn process_packet(&self, pkt: &PktInfo) -> Result<FlowHandle> {
        let mut records = vec![];
        let result = self.with_pair(&pkt.key, &mut records, |handle, pair, leg, records| {
            if pair.generation == 0 {
                self.resolve_new(handle, pair, pkt, records)
            } else {
                self.update_existing(handle, pair, leg, pkt, records);
                true
            }
        });
        self.send(records);
        result
    }

    fn context<'a>(&'a self, data: &'a PlatformData) -> ResolveContext<'a> {
        ResolveContext {
            data,
            tables: &self.tables,
        }
    }

    fn resolve_new(
        &self,
        handle: &FlowHandle,
        pair: &mut FlowPair,
        pkt: &PktInfo,
        records: &mut Vec<FlowSyncRecord>,
    ) -> bool {
        let now = timestamp_now();
        let max_flows = self.config.load().max_flows;
        if max_flows > 0 && self.pairs.len() * 2 > max_flows {
            pair.forward.tunnel_src = pkt.tunnel_src;
            pair.make_short(ShortReason::FlowLimit);
        } else {
            let data = ArcSwap::load(&self.platform);
            let info = FlowInfo::resolve(self.context(&data), pkt, &PreviousState::default());
            info.apply(pair, Leg::Forward, pkt);
            if let Some(rkey) = info.rkey {
                if rkey == pkt.key {
                    pair.make_short(ShortReason::SameFlowRflowKey);
                } else {
                    match self.bind_leg(handle, pair, Leg::Reverse, records) {
                        Bind::Bound => (),
                        Bind::Collision => pair.make_short(ShortReason::SameFlowRflowKey),
                        Bind::Busy => return false,
                        Bind::Yield => {
                            self.delete_locked(pair, ShortReason::None, records);
                            return false;
                        }
                    }
                }
            }
            if !pair.is_short() {
                self.deps.track(pair.id, DepKey::collect(&info, &pkt.key));
            }
        }

        if pair.is_short() {
            self.counter.short.fetch_add(1, Ordering::Relaxed);
        }
        pair.forward.created = now;
        pair.reverse.created = now;
        pair.forward.account(pkt.len, pkt.tcp_flags, now);
        self.emit(pair, SyncOp::Add, records);
        debug!("new flow pair {}: {}", pair.id, pair.forward);
        true
    }

    fn update_existing(
        &self,
        handle: &FlowHandle,
        pair: &mut FlowPair,
        leg: Leg,
        pkt: &PktInfo,
        records: &mut Vec<FlowSyncRecord>,
    ) {
        pair.leg_mut(leg).account(pkt.len, pkt.tcp_flags, timestamp_now());
        if pair.is_short() {
            return;
        }
        if leg == pair.initiator {
            if pkt.trap == TrapReason::EcmpResolve {
                self.revaluate_locked(handle, pair, Some(pkt), records);
            }
        } else if pair.leg(leg).action.contains(ActionBits::TRAP) {
            self.retry_trapped(pair, leg, pkt, records);
        }
    }

    /*
     * A trapped leg gets evaluated as if it had started the flow. When its
     * own policy lets it pass, it becomes the initiator and both legs follow
     * its result.
     */
    fn retry_trapped(
        &self,
        pair: &mut FlowPair,
        leg: Leg,
        pkt: &PktInfo,
        records: &mut Vec<FlowSyncRecord>,
    ) {
        let data = ArcSwap::load(&self.platform);
        let info = FlowInfo::resolve(
            self.context(&data),
            pkt,
            &PreviousState::from_pair(pair, leg),
        );
        if info.is_short() || info.rpf_failed || !info.policy.action.passes() {
            trace!("flow pair {} stays trapped", pair.id);
            return;
        }
        if info.rkey != Some(pair.leg(leg.other()).key) || info.nat != pair.leg(leg).nat {
            return;
        }
        info.apply(pair, leg, pkt);
        self.deps.track(pair.id, DepKey::collect(&info, &pkt.key));
        self.emit(pair, SyncOp::Update, records);
        debug!("flow pair {} initiator switched to {:?}", pair.id, leg);
    }

    /*
     * Binds the key of `leg` to the pair.
     *
     * An owner that mirrors this pair (its other leg carries our other key)
     * is the same connection seen from the other side: the older pair keeps
     * the connection and deletes the newer one.
     */
    fn bind_leg(
        &self,
        handle: &FlowHandle,
        pair: &mut FlowPair,
        leg: Leg,
        records: &mut Vec<FlowSyncRecord>,
    ) -> Bind {
        let key = pair.leg(leg).key;
        for _ in 0..MAX_BIND_ATTEMPTS {
            let owner = match self.index.entry(key) {
                Entry::Vacant(e) => {
                    e.insert(IndexEntry::new(handle.clone(), pair.id, leg));
                    pair.reverse_bound = true;
                    return Bind::Bound;
                }
                Entry::Occupied(e) if e.get().pair_id == pair.id => {
                    pair.reverse_bound = true;
                    return Bind::Bound;
                }
                Entry::Occupied(e) => e.get().clone(),
            };

            let Some(mut other) = owner.pair.try_lock() else {
                return Bind::Busy;
            };
            if other.deleted {
                continue;
            }
            let mirror = other.generation == 0
                || other.leg(owner.leg.other()).key == pair.leg(leg.other()).key;
            if !mirror {
                debug!(
                    "reverse key {} of pair {} owned by pair {}",
                    key, pair.id, other.id
                );
                return Bind::Collision;
            }
            if pair.id > other.id {
                return Bind::Yield;
            }
            self.delete_locked(&mut other, ShortReason::ReverseFlowChange, records);
        }
        Bind::Busy
    }

    pub fn revaluate(&self, pair_id: u64) -> Result<()> {
        let handle = self.pair(pair_id).ok_or(Error::FlowNotFound(pair_id))?;
        let mut records = vec![];
        {
            let mut pair = handle.lock();
            if pair.deleted {
                return Err(Error::FlowNotFound(pair_id));
            }
            self.revaluate_locked(&handle, &mut pair, None, &mut records);
        }
        self.send(records);
        Ok(())
    }

    /*
     * Resolves the initiator again against current state.
     *   - ingress interface gone: pair deleted
     *   - translation changed: pair deleted
     *   - route missing: both legs trap until a route shows up
     *   - reverse key changed: old key unindexed, new key bound
     * Short pairs are left to aging.
     */
    fn revaluate_locked(
        &self,
        handle: &FlowHandle,
        pair: &mut FlowPair,
        live: Option<&PktInfo>,
        records: &mut Vec<FlowSyncRecord>,
    ) {
        if pair.is_short() {
            return;
        }
        self.counter.revaluated.fetch_add(1, Ordering::Relaxed);
        let initiator = pair.initiator;
        let mut pkt = PktInfo::new(pair.leg(initiator).key);
        pkt.tunnel_src = pair.leg(initiator).tunnel_src;
        if let Some(live) = live {
            pkt.ecmp_hint = live.ecmp_hint;
            pkt.trap = live.trap;
            pkt.tcp_flags = live.tcp_flags;
        }
        let info = {
            let data = ArcSwap::load(&self.platform);
            FlowInfo::resolve(
                self.context(&data),
                &pkt,
                &PreviousState::from_pair(pair, initiator),
            )
        };

        match info.short_reason {
            ShortReason::UnavailableInterface | ShortReason::VrfChange => {
                self.delete_locked(pair, ShortReason::InterfaceDelete, records);
                return;
            }
            _ if info.nat != pair.leg(initiator).nat => {
                self.delete_locked(pair, ShortReason::NatChange, records);
                return;
            }
            ShortReason::NoDstRoute | ShortReason::NoSrcRoute => {
                self.trap_unresolved(pair, &info, records);
                return;
            }
            // the dataplane keeps the vrf the first resolution assigned
            ShortReason::None if info.assigned_vrf() != pair.leg(initiator).assigned_vrf => {
                self.shorten(pair, ShortReason::VrfChange, records);
                return;
            }
            ShortReason::None => (),
            reason => {
                self.shorten(pair, reason, records);
                return;
            }
        }

        let stale = if pair.reverse_bound {
            Some(FlowSyncRecord::new(
                SyncOp::Delete,
                pair.leg(initiator.other()),
                pair.generation,
            ))
        } else {
            None
        };
        info.apply(pair, initiator, &pkt);

        let rkey = pair.leg(initiator.other()).key;
        if let Some(stale) = stale.filter(|s| s.key != rkey) {
            if initiator == Leg::Reverse {
                // the forward key is the one installed, it is never rebound
                self.delete_locked(pair, ShortReason::ReverseFlowChange, records);
                return;
            }
            debug!(
                "flow pair {} reverse key {} -> {}",
                pair.id,
                stale.key,
                rkey
            );
            let id = pair.id;
            self.index.remove_if(&stale.key, |_, e| e.pair_id == id);
            pair.reverse_bound = false;
            records.push(stale);
            if pair.reverse.key == pair.forward.key {
                pair.make_short(ShortReason::SameFlowRflowKey);
            } else if !matches!(
                self.bind_leg(handle, pair, Leg::Reverse, records),
                Bind::Bound
            ) {
                pair.make_short(ShortReason::ReverseFlowChange);
            }
        }

        if pair.is_short() {
            self.counter.short.fetch_add(1, Ordering::Relaxed);
            self.deps.untrack(pair.id);
        } else {
            self.deps.track(pair.id, DepKey::collect(&info, &pkt.key));
        }
        self.emit(pair, SyncOp::Update, records);
    }

    fn shorten(
        &self,
        pair: &mut FlowPair,
        reason: ShortReason,
        records: &mut Vec<FlowSyncRecord>,
    ) {
        pair.make_short(reason);
        self.counter.short.fetch_add(1, Ordering::Relaxed);
        self.deps.untrack(pair.id);
        self.emit(pair, SyncOp::Update, records);
    }

    // Both legs trap, the pair waits for a route without being short
    fn trap_unresolved(
        &self,
        pair: &mut FlowPair,
        info: &FlowInfo,
        records: &mut Vec<FlowSyncRecord>,
    ) {
        debug!("flow pair {} unresolved: {}", pair.id, info.short_reason);
        for leg in [Leg::Forward, Leg::Reverse] {
            let entry = pair.leg_mut(leg);
            entry.flags.insert(FlowFlags::TRAP);
            entry.action = ActionBits::TRAP;
            entry.short_reason = info.short_reason;
        }
        let key = pair.leg(pair.initiator).key;
        self.deps.track(pair.id, DepKey::collect(info, &key));
        self.emit(pair, SyncOp::Update, records);
    }

    pub fn delete_pair(&self, pair_id: u64, reason: ShortReason) -> Result<()> {
        let handle = self.pair(pair_id).ok_or(Error::FlowNotFound(pair_id))?;
        let mut records = vec![];
        self.delete_locked(&mut handle.lock(), reason, &mut records);
        self.send(records);
        Ok(())
    }

    fn delete_locked(
        &self,
        pair: &mut FlowPair,
        reason: ShortReason,
        records: &mut Vec<FlowSyncRecord>,
    ) {
        if pair.deleted {
            return;
        }
        pair.deleted = true;
        let id = pair.id;
        debug!("delete flow pair {} reason {}", id, reason);

        self.index.remove_if(&pair.forward.key, |_, e| e.pair_id == id);
        if pair.reverse_bound {
            self.index.remove_if(&pair.reverse.key, |_, e| e.pair_id == id);
        }
        self.pairs.remove(&id);
        self.deps.untrack(id);

        if pair.generation > 0 {
            records.push(FlowSyncRecord::new(
                SyncOp::Delete,
                &pair.forward,
                pair.generation,
            ));
            if pair.reverse_bound {
                records.push(FlowSyncRecord::new(
                    SyncOp::Delete,
                    &pair.reverse,
                    pair.generation,
                ));
            }
        }
        pair.reverse_bound = false;
        self.pool.free(mem::take(&mut pair.forward));
        self.pool.free(mem::take(&mut pair.reverse));
        self.counter.deleted.fetch_add(1, Ordering::Relaxed);
        self.counter.flows.fetch_sub(1, Ordering::Relaxed);
    }

    /*
     * Dataplane verdict on a record. Results of an older generation are
     * ignored, a failure makes the pair short.
     */
    pub fn on_install_result(&self, key: &FlowKey, generation: u64, ok: bool) {
        let Some((handle, leg)) = self.lookup(key) else {
            return;
        };
        let mut records = vec![];
        {
            let mut pair = handle.lock();
            if pair.deleted || pair.leg(leg).key != *key {
                return;
            }
            if pair.generation != generation {
                trace!(
                    "stale install result for {} gen {} current {}",
                    key,
                    generation,
                    pair.generation
                );
                return;
            }
            if ok || pair.is_short() {
                return;
            }
            warn!("dataplane rejected flow {}", key);
            self.counter.install_failed.fetch_add(1, Ordering::Relaxed);
            pair.make_short(ShortReason::FailedVrouterInstall);
            self.deps.untrack(pair.id);
            self.emit(&mut pair, SyncOp::Update, &mut records);
        }
        self.send(records);
    }

    /*
     * Installs a pair with both keys known up front, for services answered
     * by the agent itself. The pair passes without policy evaluation.
     */
    pub fn install_seeded(
        &self,
        key: FlowKey,
        rkey: FlowKey,
        nat: Option<Translation>,
    ) -> Result<FlowHandle> {
        let mut records = vec![];
        let result = self.with_pair(&key, &mut records, |handle, pair, _, records| {
            if pair.generation > 0 {
                return true;
            }
            let mut flags = FlowFlags::LINK_LOCAL;
            match &nat {
                Some(t) if t.kind == NatKind::Snat => flags |= FlowFlags::NAT | FlowFlags::SNAT,
                Some(_) => flags |= FlowFlags::NAT | FlowFlags::DNAT,
                None => (),
            }
            let now = timestamp_now();
            let legs = [
                (Leg::Forward, flags),
                (Leg::Reverse, flags | FlowFlags::REVERSE),
            ];
            for (leg, leg_flags) in legs {
                let entry = pair.leg_mut(leg);
                entry.flags = leg_flags;
                entry.action = ActionBits::PASS;
                entry.mirrored_action = ActionBits::PASS;
                entry.nat = nat.clone();
                entry.created = now;
                entry.last_seen = now;
            }
            pair.reverse.key = rkey;
            if rkey == key {
                pair.make_short(ShortReason::SameFlowRflowKey);
            } else {
                match self.bind_leg(handle, pair, Leg::Reverse, records) {
                    Bind::Bound => (),
                    Bind::Collision => pair.make_short(ShortReason::SameFlowRflowKey),
                    Bind::Busy => return false,
                    Bind::Yield => {
                        self.delete_locked(pair, ShortReason::None, records);
                        return false;
                    }
                }
            }
            self.emit(pair, SyncOp::Add, records);
            true
        });
        self.send(records);
        result
    }

    /*
     * Deletes pairs idle longer than their timeout and TCP pairs that saw
     * the connection close. `shard` restricts aging to the pairs of one
     * worker.
     */
    pub fn age(&self, now: Duration, shard: Option<usize>) -> usize {
        let timeout = self.config.load().flow_timeout;
        let handles: Vec<FlowHandle> = self.pairs.iter().map(|e| e.value().clone()).collect();
        let mut records = vec![];
        let mut aged = 0;
        for handle in handles {
            let mut pair = handle.lock();
            if pair.deleted || shard.map(|s| s != pair.shard).unwrap_or(false) {
                continue;
            }
            let idle = now.saturating_sub(pair.last_seen());
            let key = pair.forward.key;
            let expired = idle >= timeout.idle_timeout(key.protocol, pair.is_short())
                || (key.is_tcp() && pair.tcp_closed());
            if expired {
                self.delete_locked(&mut pair, ShortReason::None, &mut records);
                aged += 1;
            }
        }
        self.send(records);
        if aged > 0 {
            debug!("aged {} flow pairs", aged);
        }
        aged
    }

    pub fn flush(&self) -> usize {
        let handles: Vec<FlowHandle> = self.pairs.iter().map(|e| e.value().clone()).collect();
        let mut records = vec![];
        let mut flushed = 0;
        for handle in handles {
            let mut pair = handle.lock();
            if !pair.deleted {
                self.delete_locked(&mut pair, ShortReason::None, &mut records);
                flushed += 1;
            }
        }
        self.send(records);
        info!("flushed {} flow pairs", flushed);
        flushed
    }

    fn emit(&self, pair: &mut FlowPair, op: SyncOp, records: &mut Vec<FlowSyncRecord>) {
        pair.generation += 1;
        records.push(FlowSyncRecord::new(op, &pair.forward, pair.generation));
        if pair.reverse_bound {
            records.push(FlowSyncRecord::new(op, &pair.reverse, pair.generation));
        }
    }

    fn send(&self, records: Vec<FlowSyncRecord>) {
        let Some(output) = self.output.as_ref() else {
            return;
        };
        let total = records.len();
        for (i, record) in records.into_iter().enumerate() {
            if let Err(e) = output.send(record) {
                warn!("flow sync queue: {}", e);
                self.counter
                    .sync_dropped
                    .fetch_add((total - i) as u64, Ordering::Relaxed);
                return;
            }
        }
    }
}
