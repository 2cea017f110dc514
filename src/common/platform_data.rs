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

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use crate::policy::{Acl, ApplicationPolicySet, SecurityGroup, TagSet};

#[derive(Clone, Debug, PartialEq)]
pub struct FloatingIp {
    pub addr: IpAddr,
    // vrf and virtual network the floating address lives in
    pub vrf_id: u32,
    pub vn: String,
}

impl FloatingIp {
    pub fn new(addr: IpAddr, vrf_id: u32, vn: &str) -> Self {
        Self {
            addr,
            vrf_id,
            vn: vn.to_owned(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Interface {
    pub id: u32,
    pub name: String,
    pub vrf_id: u32,
    pub vn: String,
    pub ip: IpAddr,
    pub active: bool,
    pub floating_ips: Vec<FloatingIp>,
    pub sg_ids: Vec<u32>,
    pub tags: TagSet,
    pub vrf_assign_acl: Option<u32>,
}

impl Interface {
    pub fn new(id: u32, vrf_id: u32, vn: &str, ip: IpAddr) -> Self {
        Self {
            id,
            name: format!("tap{}", id),
            vrf_id,
            vn: vn.to_owned(),
            ip,
            active: true,
            floating_ips: vec![],
            sg_ids: vec![],
            tags: TagSet::default(),
            vrf_assign_acl: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct VirtualNetwork {
    pub name: String,
    pub vrf_id: u32,
    pub acl_ids: Vec<u32>,
    pub tags: TagSet,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TagTarget {
    Interface(u32),
    Vn(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct TagUpdate {
    pub target: TagTarget,
    pub tags: TagSet,
}

// What changed between two snapshots, used to find the flows to re-evaluate
#[derive(Debug, Default, PartialEq)]
pub struct PlatformDiff {
    pub removed_interfaces: Vec<u32>,
    pub changed_interfaces: Vec<u32>,
    pub changed_vns: Vec<String>,
    pub changed_acls: Vec<u32>,
    pub changed_sgs: Vec<u32>,
    pub changed_policy_sets: Vec<u32>,
}

impl PlatformDiff {
    pub fn is_empty(&self) -> bool {
        self.removed_interfaces.is_empty()
            && self.changed_interfaces.is_empty()
            && self.changed_vns.is_empty()
            && self.changed_acls.is_empty()
            && self.changed_sgs.is_empty()
            && self.changed_policy_sets.is_empty()
    }
}

fn changed_keys<K, V>(old: &HashMap<K, V>, new: &HashMap<K, V>) -> Vec<K>
where
    K: Clone + Eq + std::hash::Hash + Ord,
    V: PartialEq,
{
    let mut keys: Vec<K> = old
        .iter()
        .filter(|(k, v)| new.get(*k).map(|n| n != *v).unwrap_or(true))
        .map(|(k, _)| k.clone())
        .chain(
            new.keys()
                .filter(|k| !old.contains_key(*k))
                .cloned(),
        )
        .collect();
    keys.sort();
    keys
}

/*
 * Read-only view of the configuration graph: interfaces, virtual networks and
 * the policy objects they link to. Updates replace the whole snapshot.
 */
#[derive(Clone, Debug, Default)]
pub struct PlatformData {
    interfaces: HashMap<u32, Interface>,
    vns: HashMap<String, VirtualNetwork>,
    acls: HashMap<u32, Acl>,
    security_groups: HashMap<u32, SecurityGroup>,
    policy_sets: Vec<ApplicationPolicySet>,
    service_addrs: HashSet<IpAddr>,

    // (fip vrf, fip address) -> interface id
    fip_index: HashMap<(u32, IpAddr), u32>,
}

impl PlatformData {
    fn rebuild_fip_index(&mut self) {
        self.fip_index.clear();
        for intf in self.interfaces.values() {
            for fip in intf.floating_ips.iter() {
                self.fip_index.insert((fip.vrf_id, fip.addr), intf.id);
            }
        }
    }

    pub fn with_interface(mut self, intf: Interface) -> Self {
        self.interfaces.insert(intf.id, intf);
        self.rebuild_fip_index();
        self
    }

    pub fn without_interface(mut self, id: u32) -> Self {
        self.interfaces.remove(&id);
        self.rebuild_fip_index();
        self
    }

    pub fn with_vn(mut self, vn: VirtualNetwork) -> Self {
        self.vns.insert(vn.name.clone(), vn);
        self
    }

    pub fn with_acl(mut self, acl: Acl) -> Self {
        self.acls.insert(acl.id, acl);
        self
    }

    pub fn with_security_group(mut self, sg: SecurityGroup) -> Self {
        self.security_groups.insert(sg.id, sg);
        self
    }

    pub fn with_policy_sets(mut self, sets: Vec<ApplicationPolicySet>) -> Self {
        self.policy_sets = sets;
        self
    }

    pub fn set_service_addrs(&mut self, addrs: Vec<IpAddr>) {
        self.service_addrs = addrs.into_iter().collect();
    }

    pub fn interface(&self, id: u32) -> Option<&Interface> {
        self.interfaces.get(&id)
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &Interface> {
        self.interfaces.values()
    }

    pub fn vn(&self, name: &str) -> Option<&VirtualNetwork> {
        self.vns.get(name)
    }

    pub fn acl(&self, id: u32) -> Option<&Acl> {
        self.acls.get(&id)
    }

    pub fn security_group(&self, id: u32) -> Option<&SecurityGroup> {
        self.security_groups.get(&id)
    }

    pub fn policy_sets(&self) -> &[ApplicationPolicySet] {
        &self.policy_sets
    }

    pub fn is_service_addr(&self, addr: &IpAddr) -> bool {
        self.service_addrs.contains(addr)
    }

    // Local interface owning a floating address
    pub fn fip_owner(&self, vrf_id: u32, addr: &IpAddr) -> Option<(&Interface, &FloatingIp)> {
        let intf = self.interfaces.get(self.fip_index.get(&(vrf_id, *addr))?)?;
        let fip = intf
            .floating_ips
            .iter()
            .find(|f| f.vrf_id == vrf_id && f.addr == *addr)?;
        Some((intf, fip))
    }

    // Returns false when the target does not exist
    pub fn apply_tags(&mut self, update: &TagUpdate) -> bool {
        match &update.target {
            TagTarget::Interface(id) => match self.interfaces.get_mut(id) {
                Some(intf) => {
                    intf.tags = update.tags.clone();
                    true
                }
                None => false,
            },
            TagTarget::Vn(name) => match self.vns.get_mut(name) {
                Some(vn) => {
                    vn.tags = update.tags.clone();
                    true
                }
                None => false,
            },
        }
    }

    // Interface tags merged with the tags of its virtual network
    pub fn effective_tags(&self, intf: &Interface) -> TagSet {
        match self.vns.get(&intf.vn) {
            Some(vn) if !vn.tags.is_empty() => {
                TagSet::new(intf.tags.iter().chain(vn.tags.iter()).copied())
            }
            _ => intf.tags.clone(),
        }
    }

    pub fn diff(&self, new: &PlatformData) -> PlatformDiff {
        let mut diff = PlatformDiff::default();
        for (id, intf) in self.interfaces.iter() {
            match new.interfaces.get(id) {
                None => diff.removed_interfaces.push(*id),
                Some(n) if n != intf => diff.changed_interfaces.push(*id),
                _ => (),
            }
        }
        diff.removed_interfaces.sort_unstable();
        diff.changed_interfaces.sort_unstable();
        diff.changed_vns = changed_keys(&self.vns, &new.vns);
        diff.changed_acls = changed_keys(&self.acls, &new.acls);
        diff.changed_sgs = changed_keys(&self.security_groups, &new.security_groups);

        let old_sets: HashMap<u32, &ApplicationPolicySet> =
            self.policy_sets.iter().map(|s| (s.id, s)).collect();
        let new_sets: HashMap<u32, &ApplicationPolicySet> =
            new.policy_sets.iter().map(|s| (s.id, s)).collect();
        diff.changed_policy_sets = changed_keys(&old_sets, &new_sets);
        // a set showing up or going away changes which set other flows select
        diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::AclEntry;

    fn intf(id: u32, ip: &str) -> Interface {
        Interface::new(id, 1, "vn1", ip.parse().unwrap())
    }

    #[test]
    fn fip_owner_lookup() {
        let mut i = intf(1, "10.0.0.1");
        i.floating_ips
            .push(FloatingIp::new("2.1.1.100".parse().unwrap(), 2, "public"));
        let data = PlatformData::default().with_interface(i);
        let (owner, fip) = data.fip_owner(2, &"2.1.1.100".parse().unwrap()).unwrap();
        assert_eq!(owner.id, 1);
        assert_eq!(fip.vn, "public");
        assert!(data.fip_owner(1, &"2.1.1.100".parse().unwrap()).is_none());

        let data = data.without_interface(1);
        assert!(data.fip_owner(2, &"2.1.1.100".parse().unwrap()).is_none());
    }

    #[test]
    fn diff_reports_removed_and_changed() {
        let old = PlatformData::default()
            .with_interface(intf(1, "10.0.0.1"))
            .with_interface(intf(2, "10.0.0.2"))
            .with_acl(Acl::new(5, vec![]));
        let mut changed = intf(2, "10.0.0.2");
        changed.sg_ids.push(3);
        let new = PlatformData::default()
            .with_interface(changed)
            .with_acl(Acl::new(5, vec![AclEntry::default()]))
            .with_vn(VirtualNetwork {
                name: "vn1".to_owned(),
                ..Default::default()
            });
        let diff = old.diff(&new);
        assert_eq!(diff.removed_interfaces, vec![1]);
        assert_eq!(diff.changed_interfaces, vec![2]);
        assert_eq!(diff.changed_acls, vec![5]);
        assert_eq!(diff.changed_vns, vec!["vn1".to_owned()]);
        assert!(diff.changed_policy_sets.is_empty());
        assert!(old.diff(&old.clone()).is_empty());
    }

    #[test]
    fn tags_merge_with_vn() {
        let mut data = PlatformData::default()
            .with_interface(intf(1, "10.0.0.1"))
            .with_vn(VirtualNetwork {
                name: "vn1".to_owned(),
                ..Default::default()
            });
        assert!(data.apply_tags(&TagUpdate {
            target: TagTarget::Interface(1),
            tags: TagSet::new([3]),
        }));
        assert!(data.apply_tags(&TagUpdate {
            target: TagTarget::Vn("vn1".to_owned()),
            tags: TagSet::new([1]),
        }));
        assert!(!data.apply_tags(&TagUpdate {
            target: TagTarget::Interface(9),
            tags: TagSet::new([1]),
        }));
        let i = data.interface(1).unwrap().clone();
        assert_eq!(data.effective_tags(&i), TagSet::new([1, 3]));
    }
}
