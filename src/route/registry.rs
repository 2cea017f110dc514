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

use std::net::IpAddr;
use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc, Weak,
};

use ahash::AHashMap;
use arc_swap::ArcSwap;
use dashmap::{mapref::entry::Entry, DashMap};
use log::debug;
use parking_lot::Mutex;
use public::enums::TunnelType;

use super::nexthop::{GroupId, Member, NextHop, NextHopGroup, Tunnel};
use super::table::NhSpec;
use super::{Error, Result};
use crate::common::consts::{GROUP_NH_ID_BASE, TUNNEL_NH_ID_BASE};
use crate::utils::stats::{Counter, CounterType, CounterValue, RefCountable};

#[derive(Default)]
pub struct RegistryCounter {
    published: AtomicU64,
    // publish found an identical member list already in use
    intern_hit: AtomicU64,
    withdrawn: AtomicU64,
    groups: AtomicU64,
}

impl RefCountable for RegistryCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "published",
                CounterType::Counted,
                CounterValue::Unsigned(self.published.swap(0, Ordering::Relaxed)),
            ),
            (
                "intern-hit",
                CounterType::Counted,
                CounterValue::Unsigned(self.intern_hit.swap(0, Ordering::Relaxed)),
            ),
            (
                "withdrawn",
                CounterType::Counted,
                CounterValue::Unsigned(self.withdrawn.swap(0, Ordering::Relaxed)),
            ),
            (
                "groups",
                CounterType::Gauged,
                CounterValue::Unsigned(self.groups.load(Ordering::Relaxed)),
            ),
        ]
    }
}

/*
 * Process wide next-hop registry.
 *
 * Every logical group id points at an immutable NextHopGroup through an
 * ArcSwap slot, a publish swaps in a new object and readers holding the old
 * one keep a consistent view. Member lists are interned by content so that
 * routes sharing the same members share the same object.
 */
pub struct NhRegistry {
    groups: DashMap<GroupId, ArcSwap<NextHopGroup>>,
    interned: Mutex<AHashMap<u64, Vec<Weak<NextHopGroup>>>>,
    tunnels: Mutex<AHashMap<(IpAddr, TunnelType), u32>>,
    next_group_id: AtomicU32,
    next_tunnel_id: AtomicU32,
    counter: Arc<RegistryCounter>,
}

impl Default for NhRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NhRegistry {
    pub fn new() -> Self {
        Self {
            groups: DashMap::new(),
            interned: Mutex::new(AHashMap::new()),
            tunnels: Mutex::new(AHashMap::new()),
            next_group_id: AtomicU32::new(GROUP_NH_ID_BASE),
            next_tunnel_id: AtomicU32::new(TUNNEL_NH_ID_BASE),
            counter: Arc::new(RegistryCounter::default()),
        }
    }

    pub fn counter(&self) -> &Arc<RegistryCounter> {
        &self.counter
    }

    pub fn next_id(&self) -> Result<GroupId> {
        let id = self.next_group_id.fetch_add(1, Ordering::Relaxed);
        if id == u32::MAX {
            return Err(Error::GroupIdExhausted);
        }
        Ok(GroupId(id))
    }

    // Tunnel next-hops get one id per (router, encapsulation)
    pub fn tunnel(&self, router: IpAddr, label: u32, tunnel_type: TunnelType) -> Tunnel {
        let mut tunnels = self.tunnels.lock();
        let id = *tunnels
            .entry((router, tunnel_type))
            .or_insert_with(|| self.next_tunnel_id.fetch_add(1, Ordering::Relaxed));
        Tunnel {
            id,
            router,
            label,
            tunnel_type,
        }
    }

    pub fn member_nh(&self, member: &Member) -> NextHop {
        match member {
            Member::Local { intf_id, .. } => NextHop::Interface(*intf_id),
            Member::Remote {
                label,
                router,
                tunnel_type,
            } => NextHop::Tunnel(self.tunnel(*router, *label, *tunnel_type)),
        }
    }

    /*
     * Next-hop for a route. A group route reuses `current` as its logical id
     * when it already had one, so that stored indexes keep addressing the
     * same group.
     */
    pub fn resolve(&self, spec: NhSpec, current: Option<GroupId>) -> Result<NextHop> {
        let nh = match spec {
            NhSpec::Discard => NextHop::Discard,
            NhSpec::Interface(id) => NextHop::Interface(id),
            NhSpec::Tunnel {
                router,
                label,
                tunnel_type,
            } => NextHop::Tunnel(self.tunnel(router, label, tunnel_type)),
            NhSpec::Group(members) => {
                let id = match current {
                    Some(id) => id,
                    None => self.next_id()?,
                };
                self.publish(id, &members);
                NextHop::Group(id)
            }
        };
        Ok(nh)
    }

    fn intern(&self, slots: Vec<Option<Member>>) -> Arc<NextHopGroup> {
        let hash = NextHopGroup::content_hash(&slots);
        let mut interned = self.interned.lock();
        let bucket = interned.entry(hash).or_default();
        bucket.retain(|w| w.strong_count() > 0);
        for weak in bucket.iter() {
            if let Some(group) = weak.upgrade() {
                if group.slots() == slots.as_slice() {
                    self.counter.intern_hit.fetch_add(1, Ordering::Relaxed);
                    return group;
                }
            }
        }
        let group = Arc::new(NextHopGroup::new(slots));
        bucket.push(Arc::downgrade(&group));
        group
    }

    // Drops dead entries of one intern bucket
    fn prune(&self, hash: u64) {
        let mut interned = self.interned.lock();
        if let Some(bucket) = interned.get_mut(&hash) {
            bucket.retain(|w| w.strong_count() > 0);
            if bucket.is_empty() {
                interned.remove(&hash);
            }
        }
    }

    /*
     * Replaces the member list of a logical group. Surviving members keep
     * their slot, removed members leave a hole and new members fill holes
     * before being appended.
     */
    pub fn publish(&self, id: GroupId, members: &[Member]) -> Arc<NextHopGroup> {
        self.counter.published.fetch_add(1, Ordering::Relaxed);
        match self.groups.entry(id) {
            Entry::Occupied(e) => {
                let current = e.get().load_full();
                let group = self.intern(current.relayout(members));
                debug!("republish {} {} -> {}", id, current, group);
                e.get().store(group.clone());
                let outgoing = NextHopGroup::content_hash(current.slots());
                drop(current);
                self.prune(outgoing);
                group
            }
            Entry::Vacant(e) => {
                let group = self.intern(NextHopGroup::from_members(members).slots().to_vec());
                debug!("publish {} {}", id, group);
                e.insert(ArcSwap::new(group.clone()));
                self.counter.groups.fetch_add(1, Ordering::Relaxed);
                group
            }
        }
    }

    pub fn withdraw(&self, id: GroupId) -> Option<Arc<NextHopGroup>> {
        let (_, slot) = self.groups.remove(&id)?;
        self.counter.withdrawn.fetch_add(1, Ordering::Relaxed);
        self.counter.groups.fetch_sub(1, Ordering::Relaxed);
        self.interned.lock().retain(|_, bucket| {
            bucket.retain(|w| w.strong_count() > 0);
            !bucket.is_empty()
        });
        debug!("withdraw {}", id);
        Some(slot.into_inner())
    }

    pub fn group(&self, id: GroupId) -> Option<Arc<NextHopGroup>> {
        self.groups.get(&id).map(|slot| slot.load_full())
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn remote(i: u8) -> Member {
        Member::Remote {
            label: 100 + i as u32,
            router: IpAddr::from([10, 1, 0, i]),
            tunnel_type: TunnelType::MplsUdp,
        }
    }

    #[test]
    fn republish_prunes_replaced_groups() {
        let registry = NhRegistry::new();
        let id = registry.next_id().unwrap();
        for i in 1..=32 {
            registry.publish(id, &[remote(i)]);
        }
        assert_eq!(registry.interned.lock().len(), 1);
        assert_eq!(registry.group(id).unwrap().member_at(0), Some(&remote(32)));
    }

    #[test]
    fn resolve_keeps_group_id() {
        let registry = NhRegistry::new();
        let nh = registry
            .resolve(NhSpec::Group(vec![remote(1), remote(2)]), None)
            .unwrap();
        let id = nh.group_id().unwrap();
        let again = registry
            .resolve(NhSpec::Group(vec![remote(2)]), Some(id))
            .unwrap();
        assert_eq!(again, NextHop::Group(id));
        let group = registry.group(id).unwrap();
        assert_eq!(group.member_at(0), None);
        assert_eq!(group.member_at(1), Some(&remote(2)));

        let t1 = registry
            .resolve(
                NhSpec::Tunnel {
                    router: IpAddr::from([10, 1, 0, 1]),
                    label: 7,
                    tunnel_type: TunnelType::MplsUdp,
                },
                None,
            )
            .unwrap();
        assert_eq!(t1.id(), registry.member_nh(&remote(1)).id());
        assert_eq!(
            registry.resolve(NhSpec::Discard, None).unwrap(),
            NextHop::Discard
        );
    }

    #[test]
    fn identical_lists_share_object() {
        let registry = NhRegistry::new();
        let a = registry.next_id().unwrap();
        let b = registry.next_id().unwrap();
        assert_ne!(a, b);
        let ga = registry.publish(a, &[remote(1), remote(2)]);
        let gb = registry.publish(b, &[remote(1), remote(2)]);
        assert!(Arc::ptr_eq(&ga, &gb));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn publish_is_copy_on_write() {
        let registry = NhRegistry::new();
        let id = registry.next_id().unwrap();
        registry.publish(id, &[remote(1), remote(2), remote(3)]);
        let before = registry.group(id).unwrap();

        registry.publish(id, &[remote(1), remote(3)]);
        let after = registry.group(id).unwrap();
        // readers of the old object are not affected
        assert_eq!(before.member_at(1), Some(&remote(2)));
        assert_eq!(after.member_at(1), None);
        assert_eq!(after.member_at(2), Some(&remote(3)));

        registry.publish(id, &[remote(1), remote(3), remote(4)]);
        assert_eq!(registry.group(id).unwrap().member_at(1), Some(&remote(4)));
    }

    #[test]
    fn withdrawn_group_is_gone() {
        let registry = NhRegistry::new();
        let id = registry.next_id().unwrap();
        registry.publish(id, &[remote(1)]);
        assert!(registry.withdraw(id).is_some());
        assert!(registry.group(id).is_none());
        assert!(registry.withdraw(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn tunnel_ids_are_stable() {
        let registry = NhRegistry::new();
        let t1 = registry.tunnel(IpAddr::from([10, 1, 0, 1]), 20, TunnelType::MplsGre);
        let t2 = registry.tunnel(IpAddr::from([10, 1, 0, 1]), 30, TunnelType::MplsGre);
        let t3 = registry.tunnel(IpAddr::from([10, 1, 0, 1]), 20, TunnelType::Vxlan);
        assert_eq!(t1.id, t2.id);
        assert_ne!(t1.id, t3.id);
        assert!(t1.id >= TUNNEL_NH_ID_BASE);
        assert_eq!(
            registry.member_nh(&Member::Local {
                label: 5,
                intf_id: 7
            }),
            NextHop::Interface(7)
        );
    }

    #[test]
    fn concurrent_readers_see_whole_groups() {
        let registry = Arc::new(NhRegistry::new());
        let id = registry.next_id().unwrap();
        registry.publish(id, &[remote(1), remote(2)]);
        let reader = {
            let registry = registry.clone();
            thread::spawn(move || {
                for _ in 0..1000 {
                    let g = registry.group(id).unwrap();
                    // slot 0 never moves while remote(1) is a member
                    assert_eq!(g.member_at(0), Some(&remote(1)));
                }
            })
        };
        for i in 0..100u8 {
            registry.publish(id, &[remote(1), remote(2 + i % 3)]);
        }
        reader.join().unwrap();
    }

    #[test]
    fn counters_reset_on_read() {
        let registry = NhRegistry::new();
        let id = registry.next_id().unwrap();
        registry.publish(id, &[remote(1)]);
        let counters = registry.counter().get_counters();
        assert_eq!(counters[0].2, CounterValue::Unsigned(1));
        assert_eq!(counters[3].2, CounterValue::Unsigned(1));
        let counters = registry.counter().get_counters();
        assert_eq!(counters[0].2, CounterValue::Unsigned(0));
    }
}
