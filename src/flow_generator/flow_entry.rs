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
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::Mutex;
use public::enums::TcpFlags;

use super::nat::Translation;
use super::pool::{EntryPool, Recyclable};
use crate::common::FlowKey;
use crate::policy::ActionBits;
use crate::route::{Member, NextHop};

pub const INVALID_ECMP_INDEX: u32 = u32::MAX;

bitflags! {
    #[derive(Default)]
    pub struct FlowFlags: u32 {
        const NAT = 1 << 0;
        const SNAT = 1 << 1;
        const DNAT = 1 << 2;
        // both ends are local interfaces
        const LOCAL = 1 << 3;
        const SHORT = 1 << 4;
        const LINK_LOCAL = 1 << 5;
        const REVERSE = 1 << 6;
        const ECMP = 1 << 7;
        // source is a local interface
        const INGRESS = 1 << 8;
        const TRAP = 1 << 9;
        const TCP_ACK = 1 << 10;
        const RPF_ENABLED = 1 << 11;
        const FIREWALL_TRAP = 1 << 12;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ShortReason {
    None = 0,
    UnavailableInterface = 1,
    NoSrcRoute = 2,
    NoDstRoute = 3,
    VrfChange = 4,
    NoReverseFlow = 5,
    ReverseFlowChange = 6,
    NatChange = 7,
    FlowLimit = 8,
    FailedVrouterInstall = 9,
    SameFlowRflowKey = 10,
    InterfaceDelete = 11,
    RouteDelete = 12,
    UnavailableVrf = 13,
}

impl Default for ShortReason {
    fn default() -> Self {
        ShortReason::None
    }
}

impl fmt::Display for ShortReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ShortReason::None => "NONE",
            ShortReason::UnavailableInterface => "UNAVAILABLE_INTERFACE",
            ShortReason::NoSrcRoute => "NO_SRC_ROUTE",
            ShortReason::NoDstRoute => "NO_DST_ROUTE",
            ShortReason::VrfChange => "VRF_CHANGE",
            ShortReason::NoReverseFlow => "NO_REVERSE_FLOW",
            ShortReason::ReverseFlowChange => "REVERSE_FLOW_CHANGE",
            ShortReason::NatChange => "NAT_CHANGE",
            ShortReason::FlowLimit => "FLOW_LIMIT",
            ShortReason::FailedVrouterInstall => "FAILED_VROUTER_INSTALL",
            ShortReason::SameFlowRflowKey => "SAME_FLOW_RFLOW_KEY",
            ShortReason::InterfaceDelete => "INTERFACE_DELETE",
            ShortReason::RouteDelete => "ROUTE_DELETE",
            ShortReason::UnavailableVrf => "UNAVAILABLE_VRF",
        };
        write!(f, "{}", s)
    }
}

// One direction of a flow
#[derive(Clone, Debug, PartialEq)]
pub struct FlowEntry {
    pub key: FlowKey,
    pub flags: FlowFlags,
    pub short_reason: ShortReason,

    pub source_vn: Vec<String>,
    pub dest_vn: Vec<String>,
    pub src_vrf: u32,
    pub dst_vrf: u32,
    // vrf a vrf assign acl moved the destination lookup to
    pub assigned_vrf: Option<u32>,
    // local interface the leg enters from
    pub intf_id: Option<u32>,

    pub nh: Option<NextHop>,
    pub ecmp_index: u32,
    // member behind ecmp_index when the index was chosen
    pub ecmp_member: Option<Member>,
    pub rpf_nh: Option<NextHop>,

    pub action: ActionBits,
    pub mirrored_action: ActionBits,
    pub nat: Option<Translation>,

    pub tcp_flags: TcpFlags,
    pub tunnel_src: Option<IpAddr>,
    pub packets: u64,
    pub bytes: u64,
    pub created: Duration,
    pub last_seen: Duration,
}

impl Default for FlowEntry {
    fn default() -> Self {
        Self {
            key: FlowKey::default(),
            flags: FlowFlags::empty(),
            short_reason: ShortReason::None,
            source_vn: vec![],
            dest_vn: vec![],
            src_vrf: 0,
            dst_vrf: 0,
            assigned_vrf: None,
            intf_id: None,
            nh: None,
            ecmp_index: INVALID_ECMP_INDEX,
            ecmp_member: None,
            rpf_nh: None,
            action: ActionBits::empty(),
            mirrored_action: ActionBits::empty(),
            nat: None,
            tcp_flags: TcpFlags::empty(),
            tunnel_src: None,
            packets: 0,
            bytes: 0,
            created: Duration::ZERO,
            last_seen: Duration::ZERO,
        }
    }
}

impl Recyclable for FlowEntry {
    fn reset(&mut self) {
        *self = Default::default();
    }
}

impl FlowEntry {
    pub fn is_short(&self) -> bool {
        self.flags.contains(FlowFlags::SHORT)
    }

    pub fn is_ecmp(&self) -> bool {
        self.ecmp_index != INVALID_ECMP_INDEX
    }

    // First reason wins
    pub fn make_short(&mut self, reason: ShortReason) {
        self.flags.insert(FlowFlags::SHORT);
        if self.short_reason == ShortReason::None {
            self.short_reason = reason;
        }
        self.action = ActionBits::DENY;
    }

    // Action handed to the dataplane
    pub fn sync_action(&self) -> ActionBits {
        if self.is_short() {
            ActionBits::DENY
        } else {
            self.action.finalize()
        }
    }

    pub fn nh_id(&self) -> u32 {
        self.nh.map(|nh| nh.id()).unwrap_or_default()
    }

    pub fn account(&mut self, len: u32, tcp_flags: TcpFlags, now: Duration) {
        self.packets += 1;
        self.bytes += len as u64;
        self.tcp_flags |= tcp_flags;
        if tcp_flags.contains(TcpFlags::ACK) && !tcp_flags.contains(TcpFlags::SYN) {
            self.flags.insert(FlowFlags::TCP_ACK);
        }
        self.last_seen = now;
    }
}

impl fmt::Display for FlowEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} flags:{:?} action:{:?} nh:{}",
            self.key,
            self.flags,
            self.action,
            self.nh_id()
        )?;
        if self.is_ecmp() {
            write!(f, " ecmp:{}", self.ecmp_index)?;
        }
        if self.short_reason != ShortReason::None {
            write!(f, " short:{}", self.short_reason)?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Leg {
    Forward,
    Reverse,
}

impl Leg {
    pub fn other(&self) -> Leg {
        match self {
            Leg::Forward => Leg::Reverse,
            Leg::Reverse => Leg::Forward,
        }
    }
}

impl Default for Leg {
    fn default() -> Self {
        Leg::Forward
    }
}

/*
 * Both legs of a flow. The forward key is always indexed, the reverse key
 * once `reverse_bound` is set. Deleting the pair unindexes both keys while
 * holding the pair lock and hands both entries back to the pool.
 */
#[derive(Debug)]
pub struct FlowPair {
    pub id: u64,
    pub shard: usize,
    pub forward: FlowEntry,
    pub reverse: FlowEntry,
    pub generation: u64,
    // leg whose policy decides, the other one follows
    pub initiator: Leg,
    pub reverse_bound: bool,
    pub deleted: bool,
}

pub type FlowHandle = Arc<Mutex<FlowPair>>;

pub type FlowEntryPool = EntryPool<FlowEntry>;

impl FlowPair {
    pub fn new(id: u64, shard: usize, forward: FlowEntry, reverse: FlowEntry) -> Self {
        Self {
            id,
            shard,
            forward,
            reverse,
            generation: 0,
            initiator: Leg::Forward,
            reverse_bound: false,
            deleted: false,
        }
    }

    pub fn leg(&self, leg: Leg) -> &FlowEntry {
        match leg {
            Leg::Forward => &self.forward,
            Leg::Reverse => &self.reverse,
        }
    }

    pub fn leg_mut(&mut self, leg: Leg) -> &mut FlowEntry {
        match leg {
            Leg::Forward => &mut self.forward,
            Leg::Reverse => &mut self.reverse,
        }
    }

    // (first, other)
    pub fn legs_mut(&mut self, first: Leg) -> (&mut FlowEntry, &mut FlowEntry) {
        match first {
            Leg::Forward => (&mut self.forward, &mut self.reverse),
            Leg::Reverse => (&mut self.reverse, &mut self.forward),
        }
    }

    pub fn is_short(&self) -> bool {
        self.forward.is_short() || self.reverse.is_short()
    }

    pub fn make_short(&mut self, reason: ShortReason) {
        self.forward.make_short(reason);
        self.reverse.make_short(reason);
    }

    pub fn last_seen(&self) -> Duration {
        self.forward.last_seen.max(self.reverse.last_seen)
    }

    // RST on either leg or FIN on both legs
    pub fn tcp_closed(&self) -> bool {
        let (f, r) = (self.forward.tcp_flags, self.reverse.tcp_flags);
        f.contains(TcpFlags::RST)
            || r.contains(TcpFlags::RST)
            || (f.contains(TcpFlags::FIN) && r.contains(TcpFlags::FIN))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_flow_denies() {
        let mut entry = FlowEntry {
            action: ActionBits::PASS,
            ..Default::default()
        };
        assert_eq!(entry.sync_action(), ActionBits::PASS);
        entry.make_short(ShortReason::NoDstRoute);
        entry.make_short(ShortReason::FlowLimit);
        assert_eq!(entry.short_reason, ShortReason::NoDstRoute);
        assert_eq!(entry.sync_action(), ActionBits::DENY);
        assert!(entry.to_string().ends_with("short:NO_DST_ROUTE"));
    }

    #[test]
    fn reset_restores_sentinels() {
        let mut entry = FlowEntry {
            ecmp_index: 2,
            packets: 9,
            ..Default::default()
        };
        assert!(entry.is_ecmp());
        entry.reset();
        assert!(!entry.is_ecmp());
        assert_eq!(entry, FlowEntry::default());
    }

    #[test]
    fn ack_without_syn_marks_tcp_ack() {
        let mut entry = FlowEntry::default();
        entry.account(60, TcpFlags::SYN | TcpFlags::ACK, Duration::from_secs(1));
        assert!(!entry.flags.contains(FlowFlags::TCP_ACK));
        entry.account(60, TcpFlags::ACK, Duration::from_secs(2));
        assert!(entry.flags.contains(FlowFlags::TCP_ACK));
        assert_eq!(entry.packets, 2);
        assert_eq!(entry.bytes, 120);
        assert_eq!(entry.last_seen, Duration::from_secs(2));
    }

    #[test]
    fn closed_tcp_pairs() {
        let mut pair = FlowPair::new(1, 0, FlowEntry::default(), FlowEntry::default());
        pair.forward.tcp_flags = TcpFlags::FIN;
        assert!(!pair.tcp_closed());
        pair.reverse.tcp_flags = TcpFlags::FIN | TcpFlags::ACK;
        assert!(pair.tcp_closed());
        assert_eq!(ShortReason::try_from(10u8).unwrap(), ShortReason::SameFlowRflowKey);
    }
}
