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
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

use ahash::AHasher;
use public::enums::TunnelType;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "group-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Tunnel {
    pub id: u32,
    pub router: IpAddr,
    pub label: u32,
    pub tunnel_type: TunnelType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Member {
    Local {
        label: u32,
        intf_id: u32,
    },
    Remote {
        label: u32,
        router: IpAddr,
        tunnel_type: TunnelType,
    },
}

impl Member {
    pub fn label(&self) -> u32 {
        match self {
            Member::Local { label, .. } | Member::Remote { label, .. } => *label,
        }
    }

    pub fn intf_id(&self) -> Option<u32> {
        match self {
            Member::Local { intf_id, .. } => Some(*intf_id),
            Member::Remote { .. } => None,
        }
    }

    pub fn router(&self) -> Option<IpAddr> {
        match self {
            Member::Local { .. } => None,
            Member::Remote { router, .. } => Some(*router),
        }
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Member::Local { label, intf_id } => {
                write!(f, "local(intf:{} label:{})", intf_id, label)
            }
            Member::Remote {
                label,
                router,
                tunnel_type,
            } => write!(f, "remote({} {} label:{})", router, tunnel_type, label),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NextHop {
    Discard,
    Interface(u32),
    Tunnel(Tunnel),
    Group(GroupId),
}

impl NextHop {
    pub fn id(&self) -> u32 {
        match self {
            NextHop::Discard => 0,
            NextHop::Interface(id) => *id,
            NextHop::Tunnel(t) => t.id,
            NextHop::Group(g) => g.0,
        }
    }

    pub fn group_id(&self) -> Option<GroupId> {
        match self {
            NextHop::Group(g) => Some(*g),
            _ => None,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, NextHop::Group(_))
    }

    pub fn intf_id(&self) -> Option<u32> {
        match self {
            NextHop::Interface(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for NextHop {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NextHop::Discard => write!(f, "discard"),
            NextHop::Interface(id) => write!(f, "interface-{}", id),
            NextHop::Tunnel(t) => write!(f, "tunnel-{}({} {})", t.id, t.router, t.tunnel_type),
            NextHop::Group(g) => write!(f, "{}", g),
        }
    }
}

/*
 * Immutable member list of an ECMP next-hop. A removed member leaves an empty
 * slot behind so that indexes held by flows keep pointing at the same member;
 * new members take the first empty slot.
 */
#[derive(Debug, PartialEq, Eq)]
pub struct NextHopGroup {
    members: Vec<Option<Member>>,
    hash: u64,
}

impl NextHopGroup {
    pub fn content_hash(members: &[Option<Member>]) -> u64 {
        let mut hasher = AHasher::default();
        members.hash(&mut hasher);
        hasher.finish()
    }

    pub fn new(members: Vec<Option<Member>>) -> Self {
        let hash = Self::content_hash(&members);
        Self { members, hash }
    }

    pub fn from_members(members: &[Member]) -> Self {
        let mut slots: Vec<Option<Member>> = Vec::with_capacity(members.len());
        for m in members {
            if !slots.contains(&Some(*m)) {
                slots.push(Some(*m));
            }
        }
        Self::new(slots)
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn slots(&self) -> &[Option<Member>] {
        &self.members
    }

    pub fn member_at(&self, index: u32) -> Option<&Member> {
        self.members.get(index as usize).and_then(|m| m.as_ref())
    }

    // Number of slots, including the empty ones
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.valid_count() == 0
    }

    pub fn valid_count(&self) -> usize {
        self.members.iter().filter(|m| m.is_some()).count()
    }

    pub fn position(&self, member: &Member) -> Option<u32> {
        self.members
            .iter()
            .position(|m| m.as_ref() == Some(member))
            .map(|i| i as u32)
    }

    pub fn members(&self) -> impl Iterator<Item = (u32, &Member)> {
        self.members
            .iter()
            .enumerate()
            .filter_map(|(i, m)| m.as_ref().map(|m| (i as u32, m)))
    }

    // Slot layout for a republished member list that keeps every surviving
    // member at its current index
    pub fn relayout(&self, members: &[Member]) -> Vec<Option<Member>> {
        let mut slots: Vec<Option<Member>> = self
            .members
            .iter()
            .map(|slot| slot.filter(|m| members.contains(m)))
            .collect();
        for m in members {
            if slots.contains(&Some(*m)) {
                continue;
            }
            match slots.iter_mut().find(|s| s.is_none()) {
                Some(free) => *free = Some(*m),
                None => slots.push(Some(*m)),
            }
        }
        while let Some(None) = slots.last() {
            slots.pop();
        }
        slots
    }
}

impl fmt::Display for NextHopGroup {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[")?;
        for (i, slot) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match slot {
                Some(m) => write!(f, "{}", m)?,
                None => write!(f, "-")?,
            }
        }
        write!(f, "]")
    }
}
