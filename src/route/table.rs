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

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use ahash::AHashMap;
use ipnet::IpNet;
use log::{debug, info};
use parking_lot::RwLock;
use public::enums::TunnelType;

use super::nexthop::{Member, NextHop};
use super::registry::NhRegistry;
use super::{Error, Result};
use crate::common::consts::MAX_INTERFACE_NH_ID;
use crate::policy::TagSet;
use crate::utils::stats::{Counter, CounterType, CounterValue, RefCountable};

// Next-hop as announced by the control plane
#[derive(Clone, Debug, PartialEq)]
pub enum NhSpec {
    Discard,
    Interface(u32),
    Tunnel {
        router: IpAddr,
        label: u32,
        tunnel_type: TunnelType,
    },
    Group(Vec<Member>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RouteUpdate {
    pub vrf_id: u32,
    pub prefix: IpNet,
    pub nh: NhSpec,
    pub vn: Vec<String>,
    pub sg_ids: Vec<u32>,
    pub tags: TagSet,
}

impl RouteUpdate {
    pub fn new(vrf_id: u32, prefix: IpNet, nh: NhSpec, vn: &str) -> Self {
        Self {
            vrf_id,
            prefix,
            nh,
            vn: vec![vn.to_owned()],
            sg_ids: vec![],
            tags: TagSet::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RouteEntry {
    pub vrf_id: u32,
    pub prefix: IpNet,
    pub nh: NextHop,
    pub vn: Vec<String>,
    // security groups and tags of the remote endpoint behind this route
    pub sg_ids: Vec<u32>,
    pub tags: TagSet,
}

impl RouteEntry {
    pub fn in_vn(&self, name: &str) -> bool {
        self.vn.iter().any(|v| v == name)
    }
}

#[derive(Clone, Debug)]
pub struct RouteChange {
    pub entry: Arc<RouteEntry>,
    pub previous: Option<Arc<RouteEntry>>,
    // shorter prefix that resolved the new prefix's addresses before the add
    pub covering: Option<IpNet>,
}

#[derive(Default)]
struct VrfTable {
    routes: AHashMap<IpNet, Arc<RouteEntry>>,
    // prefix length -> number of routes of that length
    v4_plens: BTreeMap<u8, usize>,
    v6_plens: BTreeMap<u8, usize>,
}

impl VrfTable {
    fn plens_mut(&mut self, prefix: &IpNet) -> &mut BTreeMap<u8, usize> {
        match prefix {
            IpNet::V4(_) => &mut self.v4_plens,
            IpNet::V6(_) => &mut self.v6_plens,
        }
    }

    fn longest_match(&self, addr: IpAddr, below: u8) -> Option<&Arc<RouteEntry>> {
        let plens = match addr {
            IpAddr::V4(_) => &self.v4_plens,
            IpAddr::V6(_) => &self.v6_plens,
        };
        for plen in plens.range(..below).rev().map(|(plen, _)| *plen) {
            if let Ok(net) = IpNet::new(addr, plen) {
                if let Some(route) = self.routes.get(&net.trunc()) {
                    return Some(route);
                }
            }
        }
        None
    }

    fn lookup(&self, addr: IpAddr) -> Option<&Arc<RouteEntry>> {
        self.longest_match(addr, u8::MAX)
    }

    fn insert(&mut self, entry: Arc<RouteEntry>) -> Option<Arc<RouteEntry>> {
        let prefix = entry.prefix;
        let previous = self.routes.insert(prefix, entry);
        if previous.is_none() {
            *self.plens_mut(&prefix).entry(prefix.prefix_len()).or_default() += 1;
        }
        previous
    }

    fn remove(&mut self, prefix: &IpNet) -> Option<Arc<RouteEntry>> {
        let removed = self.routes.remove(prefix)?;
        let plens = self.plens_mut(prefix);
        if let Some(count) = plens.get_mut(&prefix.prefix_len()) {
            *count -= 1;
            if *count == 0 {
                plens.remove(&prefix.prefix_len());
            }
        }
        Some(removed)
    }
}

#[derive(Default)]
pub struct RouteCounter {
    add: AtomicU64,
    delete: AtomicU64,
    lookup: AtomicU64,
    miss: AtomicU64,
}

impl RefCountable for RouteCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "add",
                CounterType::Counted,
                CounterValue::Unsigned(self.add.swap(0, Ordering::Relaxed)),
            ),
            (
                "delete",
                CounterType::Counted,
                CounterValue::Unsigned(self.delete.swap(0, Ordering::Relaxed)),
            ),
            (
                "lookup",
                CounterType::Counted,
                CounterValue::Unsigned(self.lookup.swap(0, Ordering::Relaxed)),
            ),
            (
                "miss",
                CounterType::Counted,
                CounterValue::Unsigned(self.miss.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}

/*
 * Unicast route tables of all VRFs with longest prefix match lookup.
 *
 * A group route keeps its logical group id for its whole lifetime: updating
 * the member list republishes the same id, so flows holding a member index
 * keep resolving against the same group. Removing the route, or replacing it
 * with a non group next-hop, withdraws the group.
 */
pub struct RouteTables {
    vrfs: RwLock<AHashMap<u32, VrfTable>>,
    registry: Arc<NhRegistry>,
    counter: Arc<RouteCounter>,
}

impl RouteTables {
    pub fn new(registry: Arc<NhRegistry>) -> Self {
        Self {
            vrfs: RwLock::new(AHashMap::new()),
            registry,
            counter: Arc::new(RouteCounter::default()),
        }
    }

    pub fn registry(&self) -> &Arc<NhRegistry> {
        &self.registry
    }

    pub fn counter(&self) -> &Arc<RouteCounter> {
        &self.counter
    }

    pub fn add(&self, update: RouteUpdate) -> Result<RouteChange> {
        let prefix = update.prefix.trunc();
        match &update.nh {
            NhSpec::Interface(id) if *id > MAX_INTERFACE_NH_ID => {
                return Err(Error::InvalidInterfaceNh(*id))
            }
            NhSpec::Group(members) if members.is_empty() => return Err(Error::EmptyGroup(prefix)),
            _ => (),
        }

        let mut vrfs = self.vrfs.write();
        let table = vrfs.entry(update.vrf_id).or_default();
        let previous = table.routes.get(&prefix).cloned();
        let prev_group = previous.as_ref().and_then(|p| p.nh.group_id());

        let nh = self.registry.resolve(update.nh, prev_group)?;
        if let Some(id) = prev_group {
            if nh.group_id() != Some(id) {
                self.registry.withdraw(id);
            }
        }

        let covering = match previous {
            None => table
                .longest_match(prefix.addr(), prefix.prefix_len())
                .map(|r| r.prefix),
            Some(_) => None,
        };
        let entry = Arc::new(RouteEntry {
            vrf_id: update.vrf_id,
            prefix,
            nh,
            vn: update.vn,
            sg_ids: update.sg_ids,
            tags: update.tags,
        });
        table.insert(entry.clone());
        self.counter.add.fetch_add(1, Ordering::Relaxed);
        debug!("route add vrf {} {} -> {}", entry.vrf_id, prefix, entry.nh);
        Ok(RouteChange {
            entry,
            previous,
            covering,
        })
    }

    pub fn delete(&self, vrf_id: u32, prefix: &IpNet) -> Option<Arc<RouteEntry>> {
        let prefix = prefix.trunc();
        let mut vrfs = self.vrfs.write();
        let table = vrfs.get_mut(&vrf_id)?;
        let removed = table.remove(&prefix)?;
        if table.routes.is_empty() {
            vrfs.remove(&vrf_id);
            info!("vrf {} has no route left", vrf_id);
        }
        drop(vrfs);
        if let Some(id) = removed.nh.group_id() {
            self.registry.withdraw(id);
        }
        self.counter.delete.fetch_add(1, Ordering::Relaxed);
        debug!("route delete vrf {} {}", vrf_id, prefix);
        Some(removed)
    }

    pub fn lookup(&self, vrf_id: u32, addr: &IpAddr) -> Option<Arc<RouteEntry>> {
        self.counter.lookup.fetch_add(1, Ordering::Relaxed);
        let route = self
            .vrfs
            .read()
            .get(&vrf_id)
            .and_then(|t| t.lookup(*addr).cloned());
        if route.is_none() {
            self.counter.miss.fetch_add(1, Ordering::Relaxed);
        }
        route
    }

    pub fn get(&self, vrf_id: u32, prefix: &IpNet) -> Option<Arc<RouteEntry>> {
        self.vrfs
            .read()
            .get(&vrf_id)
            .and_then(|t| t.routes.get(&prefix.trunc()).cloned())
    }

    pub fn len(&self) -> usize {
        self.vrfs.read().values().map(|t| t.routes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> RouteTables {
        RouteTables::new(Arc::new(NhRegistry::new()))
    }

    fn remote(i: u8) -> Member {
        Member::Remote {
            label: 16,
            router: IpAddr::from([192, 168, 1, i]),
            tunnel_type: TunnelType::MplsGre,
        }
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn longest_prefix_wins() {
        let t = tables();
        t.add(RouteUpdate::new(1, "0.0.0.0/0".parse().unwrap(), NhSpec::Discard, "vn1"))
            .unwrap();
        t.add(RouteUpdate::new(1, "10.0.0.0/8".parse().unwrap(), NhSpec::Interface(3), "vn1"))
            .unwrap();
        t.add(RouteUpdate::new(1, "10.1.0.0/16".parse().unwrap(), NhSpec::Interface(4), "vn1"))
            .unwrap();

        assert_eq!(t.lookup(1, &addr("10.1.2.3")).unwrap().nh, NextHop::Interface(4));
        assert_eq!(t.lookup(1, &addr("10.2.2.3")).unwrap().nh, NextHop::Interface(3));
        assert_eq!(t.lookup(1, &addr("11.0.0.1")).unwrap().nh, NextHop::Discard);
        assert!(t.lookup(2, &addr("10.1.2.3")).is_none());
        assert!(t.lookup(1, &addr("::1")).is_none());

        t.delete(1, &"10.1.0.0/16".parse().unwrap()).unwrap();
        assert_eq!(t.lookup(1, &addr("10.1.2.3")).unwrap().nh, NextHop::Interface(3));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn host_bits_are_ignored() {
        let t = tables();
        t.add(RouteUpdate::new(1, "10.1.2.3/24".parse().unwrap(), NhSpec::Interface(3), "vn1"))
            .unwrap();
        let route = t.get(1, &"10.1.2.0/24".parse().unwrap()).unwrap();
        assert_eq!(route.prefix, "10.1.2.0/24".parse::<IpNet>().unwrap());
    }

    #[test]
    fn ipv6_lookup() {
        let t = tables();
        t.add(RouteUpdate::new(1, "fd00::/64".parse().unwrap(), NhSpec::Interface(9), "vn1"))
            .unwrap();
        assert_eq!(t.lookup(1, &addr("fd00::5")).unwrap().nh, NextHop::Interface(9));
        assert!(t.lookup(1, &addr("fd01::5")).is_none());
    }

    #[test]
    fn group_route_keeps_its_id() {
        let t = tables();
        let prefix: IpNet = "0.0.0.0/0".parse().unwrap();
        let first = t
            .add(RouteUpdate::new(1, prefix, NhSpec::Group(vec![remote(1), remote(2)]), "vn1"))
            .unwrap();
        let id = first.entry.nh.group_id().unwrap();
        assert!(first.previous.is_none());

        let second = t
            .add(RouteUpdate::new(1, prefix, NhSpec::Group(vec![remote(2), remote(3)]), "vn1"))
            .unwrap();
        assert_eq!(second.entry.nh.group_id(), Some(id));
        assert!(second.previous.is_some());
        let group = t.registry().group(id).unwrap();
        assert_eq!(group.member_at(0), Some(&remote(3)));
        assert_eq!(group.member_at(1), Some(&remote(2)));

        t.add(RouteUpdate::new(1, prefix, NhSpec::Interface(2), "vn1"))
            .unwrap();
        assert!(t.registry().group(id).is_none());
    }

    #[test]
    fn deleting_group_route_withdraws_group() {
        let t = tables();
        let prefix: IpNet = "10.0.0.0/24".parse().unwrap();
        let change = t
            .add(RouteUpdate::new(1, prefix, NhSpec::Group(vec![remote(1)]), "vn1"))
            .unwrap();
        let id = change.entry.nh.group_id().unwrap();
        assert!(t.registry().group(id).is_some());
        t.delete(1, &prefix).unwrap();
        assert!(t.registry().group(id).is_none());
        assert!(t.delete(1, &prefix).is_none());
        assert!(t.is_empty());
    }

    #[test]
    fn covering_prefix_is_reported() {
        let t = tables();
        t.add(RouteUpdate::new(1, "10.0.0.0/8".parse().unwrap(), NhSpec::Interface(3), "vn1"))
            .unwrap();
        let change = t
            .add(RouteUpdate::new(1, "10.1.0.0/16".parse().unwrap(), NhSpec::Interface(4), "vn1"))
            .unwrap();
        assert_eq!(change.covering, Some("10.0.0.0/8".parse::<IpNet>().unwrap()));
        let change = t
            .add(RouteUpdate::new(1, "10.1.0.0/16".parse().unwrap(), NhSpec::Interface(5), "vn1"))
            .unwrap();
        assert_eq!(change.covering, None);
    }

    #[test]
    fn invalid_updates_are_rejected() {
        let t = tables();
        assert_eq!(
            t.add(RouteUpdate::new(
                1,
                "10.0.0.0/8".parse().unwrap(),
                NhSpec::Interface(MAX_INTERFACE_NH_ID + 1),
                "vn1"
            ))
            .unwrap_err(),
            Error::InvalidInterfaceNh(MAX_INTERFACE_NH_ID + 1)
        );
        assert!(matches!(
            t.add(RouteUpdate::new(1, "10.0.0.0/8".parse().unwrap(), NhSpec::Group(vec![]), "vn1")),
            Err(Error::EmptyGroup(_))
        ));
        assert!(t.is_empty());
    }
}
