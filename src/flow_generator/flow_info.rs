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
use std::sync::Arc;

use log::trace;
use public::enums::TcpFlags;

use super::ecmp::{self, EcmpChoice, EcmpInput};
use super::flow_entry::{FlowEntry, FlowFlags, FlowPair, Leg, ShortReason, INVALID_ECMP_INDEX};
use super::nat::{self, NatKind, Translation};
use super::rpf;
use crate::common::platform_data::{Interface, PlatformData};
use crate::common::{FlowKey, PktInfo, TrapReason, MAX_INTERFACE_NH_ID};
use crate::policy::{self, ActionBits, Endpoint, LegPolicy, PolicyResult};
use crate::route::{Member, NextHop, RouteEntry, RouteTables};

pub fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_link_local(),
        IpAddr::V6(addr) => addr.segments()[0] & 0xffc0 == 0xfe80,
    }
}

// Read only state a resolution runs against
#[derive(Clone, Copy)]
pub struct ResolveContext<'a> {
    pub data: &'a PlatformData,
    pub tables: &'a RouteTables,
}

// What an earlier resolution left in the pair, seen from the initiator
#[derive(Clone, Copy, Debug, Default)]
pub struct PreviousState {
    pub existing: bool,
    pub ecmp: Option<(u32, Member)>,
    pub src_ecmp: Option<(u32, Member)>,
    pub rpf_nh: Option<NextHop>,
    pub tcp_ack: bool,
}

impl PreviousState {
    pub fn from_pair(pair: &FlowPair, initiator: Leg) -> Self {
        let (flow, rflow) = (pair.leg(initiator), pair.leg(initiator.other()));
        let stored = |e: &FlowEntry| match (e.is_ecmp(), e.ecmp_member) {
            (true, Some(member)) => Some((e.ecmp_index, member)),
            _ => None,
        };
        Self {
            existing: true,
            ecmp: stored(flow),
            src_ecmp: stored(rflow),
            rpf_nh: flow.rpf_nh,
            tcp_ack: flow.flags.contains(FlowFlags::TCP_ACK),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct VrfAssign {
    pub acl_id: u32,
    pub vn: String,
    pub vrf_id: u32,
}

/*
 * Outcome of resolving one packet: routes, ECMP members, translation, policy
 * and the key of the reverse leg. A resolution that ends early carries a
 * short reason and no reverse key.
 */
#[derive(Clone, Debug, Default)]
pub struct FlowInfo {
    pub short_reason: ShortReason,
    pub link_local: bool,
    pub ingress_intf: Option<u32>,
    pub egress_intf: Option<u32>,
    pub src_vrf: u32,
    pub dst_vrf: u32,
    pub source_vn: Vec<String>,
    pub dest_vn: Vec<String>,
    pub src_route: Option<Arc<RouteEntry>>,
    pub dst_route: Option<Arc<RouteEntry>>,
    pub ecmp: Option<EcmpChoice>,
    pub src_ecmp: Option<EcmpChoice>,
    // concrete next-hop of the forward ECMP member
    pub member_nh: Option<NextHop>,
    pub rpf_nh: Option<NextHop>,
    pub rpf_failed: bool,
    pub nat: Option<Translation>,
    // vrf assign acl of the ingress interface, whether it matched or not
    pub vrf_assign_acl: Option<u32>,
    pub vrf_assign: Option<VrfAssign>,
    pub rkey: Option<FlowKey>,
    pub policy: PolicyResult,
}

fn ingress_interface<'a>(
    data: &'a PlatformData,
    pkt: &PktInfo,
) -> Result<Option<&'a Interface>, ShortReason> {
    let key = &pkt.key;
    if pkt.tunnel_src.is_some() || key.nh_id > MAX_INTERFACE_NH_ID {
        return Ok(None);
    }
    match data.interface(key.nh_id) {
        Some(intf) if intf.active && intf.vrf_id == key.vrf_id => Ok(Some(intf)),
        Some(intf) if intf.active => Err(ShortReason::VrfChange),
        _ => Err(ShortReason::UnavailableInterface),
    }
}

fn endpoint(
    data: &PlatformData,
    addr: IpAddr,
    port: u16,
    vn: &[String],
    intf: Option<&Interface>,
    route: &RouteEntry,
) -> Endpoint {
    match intf {
        Some(intf) => Endpoint {
            addr: Some(addr),
            port,
            vn: vn.to_vec(),
            sg_ids: intf.sg_ids.clone(),
            tags: data.effective_tags(intf),
            intf_id: Some(intf.id),
        },
        None => Endpoint {
            addr: Some(addr),
            port,
            vn: vn.to_vec(),
            sg_ids: route.sg_ids.clone(),
            tags: route.tags.clone(),
            intf_id: None,
        },
    }
}

/*
 * Policy based vrf translation of a packet entering a local interface. The
 * acl matches against the routes of the interface vrf, the first matching
 * entry decides. A target vn that does not exist ends the resolution.
 */
fn vrf_assign(
    ctx: ResolveContext,
    intf: &Interface,
    key: &FlowKey,
) -> Result<Option<VrfAssign>, ShortReason> {
    let Some(acl) = intf.vrf_assign_acl.and_then(|id| ctx.data.acl(id)) else {
        return Ok(None);
    };
    let dst_route = ctx.tables.lookup(key.vrf_id, &key.dst_addr);
    let src = Endpoint {
        addr: Some(key.src_addr),
        port: key.src_port,
        vn: vec![intf.vn.clone()],
        sg_ids: intf.sg_ids.clone(),
        tags: ctx.data.effective_tags(intf),
        intf_id: Some(intf.id),
    };
    let dst = match dst_route.as_ref() {
        Some(route) => Endpoint {
            addr: Some(key.dst_addr),
            port: key.dst_port,
            vn: route.vn.clone(),
            sg_ids: route.sg_ids.clone(),
            tags: route.tags.clone(),
            intf_id: None,
        },
        None => Endpoint {
            addr: Some(key.dst_addr),
            port: key.dst_port,
            ..Default::default()
        },
    };
    let Some(name) = acl.assigned_vn(key.protocol, &src, &dst) else {
        return Ok(None);
    };
    match ctx.data.vn(name) {
        Some(vn) => Ok(Some(VrfAssign {
            acl_id: acl.id,
            vn: vn.name.clone(),
            vrf_id: vn.vrf_id,
        })),
        None => Err(ShortReason::UnavailableVrf),
    }
}

impl FlowInfo {
    fn short(mut self, reason: ShortReason) -> Self {
        trace!("resolution ends with {}", reason);
        self.short_reason = reason;
        self
    }

    pub fn is_short(&self) -> bool {
        self.short_reason != ShortReason::None
    }

    pub fn assigned_vrf(&self) -> Option<u32> {
        self.vrf_assign.as_ref().map(|a| a.vrf_id)
    }

    pub fn resolve(ctx: ResolveContext, pkt: &PktInfo, prev: &PreviousState) -> Self {
        let key = &pkt.key;
        let registry = ctx.tables.registry();
        let mut info = FlowInfo {
            src_vrf: key.vrf_id,
            dst_vrf: key.vrf_id,
            link_local: is_link_local(&key.dst_addr) || is_link_local(&key.src_addr),
            ..Default::default()
        };

        let ingress = match ingress_interface(ctx.data, pkt) {
            Ok(intf) => intf,
            Err(reason) => return info.short(reason),
        };
        info.ingress_intf = ingress.map(|i| i.id);

        // floating ip translation, a destination owned by a local interface
        // takes precedence over the source side
        let mut dst_addr = key.dst_addr;
        let mut snat_route = None;
        if let Some(t) = nat::resolve_dnat(ctx.data, key.vrf_id, &key.dst_addr) {
            match ctx.data.interface(t.intf_id) {
                Some(owner) => info.dst_vrf = owner.vrf_id,
                None => return info.short(ShortReason::UnavailableInterface),
            }
            dst_addr = t.translated;
            info.nat = Some(t);
        } else if let Some(intf) = ingress {
            if let Some(m) = nat::resolve_snat(intf, &key.src_addr, &key.dst_addr, ctx.tables) {
                info.dst_vrf = m.translation.fip_vrf;
                info.nat = Some(m.translation);
                snat_route = Some(m.route);
            }
        }

        // translated flows keep the vrf the floating ip picked
        if let Some(intf) = ingress.filter(|_| info.nat.is_none()) {
            info.vrf_assign_acl = intf.vrf_assign_acl;
            match vrf_assign(ctx, intf, key) {
                Ok(Some(assign)) => {
                    info.dst_vrf = assign.vrf_id;
                    info.vrf_assign = Some(assign);
                }
                Ok(None) => (),
                Err(reason) => return info.short(reason),
            }
        }

        let dst_route = match snat_route.or_else(|| ctx.tables.lookup(info.dst_vrf, &dst_addr)) {
            Some(r) if r.nh != NextHop::Discard => r,
            _ => return info.short(ShortReason::NoDstRoute),
        };
        let src_route = match ctx.tables.lookup(key.vrf_id, &key.src_addr) {
            Some(r) if r.nh != NextHop::Discard => r,
            _ => return info.short(ShortReason::NoSrcRoute),
        };

        // destination side member
        match dst_route.nh {
            NextHop::Interface(id) => info.egress_intf = Some(id),
            NextHop::Group(id) => {
                let Some(group) = registry.group(id) else {
                    return info.short(ShortReason::NoDstRoute);
                };
                let input = EcmpInput {
                    previous: prev.ecmp,
                    hint: pkt.ecmp_hint,
                    resolve_requested: pkt.trap == TrapReason::EcmpResolve,
                    became_ecmp: prev.existing && prev.ecmp.is_none(),
                };
                let Some(choice) = ecmp::resolve(&group, key, &input) else {
                    return info.short(ShortReason::NoDstRoute);
                };
                info.egress_intf = choice.member.intf_id();
                info.member_nh = Some(registry.member_nh(&choice.member));
                info.ecmp = Some(choice);
            }
            _ => (),
        }
        let egress = info
            .egress_intf
            .and_then(|id| ctx.data.interface(id))
            .filter(|i| i.active);
        info.egress_intf = egress.map(|i| i.id);

        let rkey_nh = match (dst_route.nh, info.ecmp) {
            (NextHop::Group(id), Some(choice)) => choice.member.intf_id().unwrap_or(id.0),
            (nh, _) => nh.id(),
        };
        let rkey = FlowKey {
            vrf_id: info.dst_vrf,
            protocol: key.protocol,
            src_addr: dst_addr,
            dst_addr: match &info.nat {
                Some(t) if t.kind == NatKind::Snat => t.fip,
                _ => key.src_addr,
            },
            src_port: key.dst_port,
            dst_port: key.src_port,
            nh_id: rkey_nh,
        };

        // source side member, never against the group the forward leg uses
        if let NextHop::Group(id) = src_route.nh {
            let same_group = dst_route.nh.group_id() == Some(id) && info.ecmp.is_some();
            if !same_group {
                if let Some(group) = registry.group(id) {
                    info.src_ecmp = ecmp::resolve_source(
                        &group,
                        &rkey,
                        pkt.tunnel_src,
                        info.ingress_intf,
                        prev.src_ecmp,
                    );
                }
            }
        }
        let expected = rpf::expected_ingress(
            &src_route.nh,
            info.src_ecmp.map(|c| registry.member_nh(&c.member)),
        );
        info.rpf_failed = !rpf::check(&expected, key.nh_id, pkt.tunnel_src, registry)
            || rpf::became_group(prev.rpf_nh.as_ref(), &expected);
        info.rpf_nh = Some(expected);

        info.source_vn = match (&info.nat, ingress) {
            (Some(t), _) if t.kind == NatKind::Snat => vec![t.fip_vn.clone()],
            (_, Some(intf)) => vec![intf.vn.clone()],
            _ => src_route.vn.clone(),
        };
        info.dest_vn = match &info.nat {
            Some(t) if t.kind == NatKind::Dnat => vec![t.fip_vn.clone()],
            _ => match egress {
                Some(intf) if dst_route.nh.intf_id().is_some() => vec![intf.vn.clone()],
                _ => dst_route.vn.clone(),
            },
        };

        let flow = LegPolicy {
            protocol: key.protocol,
            src: endpoint(
                ctx.data,
                key.src_addr,
                key.src_port,
                &info.source_vn,
                ingress,
                &src_route,
            ),
            dst: endpoint(
                ctx.data,
                dst_addr,
                key.dst_port,
                &info.dest_vn,
                egress,
                &dst_route,
            ),
            tcp_ack: prev.tcp_ack
                || (pkt.tcp_flags.contains(TcpFlags::ACK)
                    && !pkt.tcp_flags.contains(TcpFlags::SYN)),
            link_local: info.link_local,
        };
        let rflow = LegPolicy {
            protocol: flow.protocol,
            src: flow.dst.clone(),
            dst: flow.src.clone(),
            tcp_ack: false,
            link_local: flow.link_local,
        };
        info.policy = policy::evaluate(ctx.data, &flow, &rflow);

        info.rkey = Some(rkey);
        info.src_route = Some(src_route);
        info.dst_route = Some(dst_route);
        info
    }

    /*
     * Writes the resolution into the pair, `initiator` receives the forward
     * view. Counters, timestamps and TCP state of both legs are kept.
     */
    pub fn apply(&self, pair: &mut FlowPair, initiator: Leg, pkt: &PktInfo) {
        pair.initiator = initiator;
        let (flow, rflow) = pair.legs_mut(initiator);
        let kept = FlowFlags::TCP_ACK;

        flow.key = pkt.key;
        flow.flags &= kept;
        flow.short_reason = ShortReason::None;
        flow.tunnel_src = pkt.tunnel_src;
        rflow.flags &= kept;
        rflow.short_reason = ShortReason::None;
        rflow.flags.insert(FlowFlags::REVERSE);

        if self.link_local {
            flow.flags.insert(FlowFlags::LINK_LOCAL);
            rflow.flags.insert(FlowFlags::LINK_LOCAL);
        }
        if self.is_short() {
            let reason = self.short_reason;
            flow.nh = None;
            flow.ecmp_index = INVALID_ECMP_INDEX;
            flow.ecmp_member = None;
            flow.intf_id = self.ingress_intf;
            flow.make_short(reason);
            rflow.make_short(reason);
            return;
        }

        let nat_flags = match &self.nat {
            Some(t) if t.kind == NatKind::Snat => FlowFlags::NAT | FlowFlags::SNAT,
            Some(_) => FlowFlags::NAT | FlowFlags::DNAT,
            None => FlowFlags::empty(),
        };
        let local = self.ingress_intf.is_some() && self.egress_intf.is_some();
        for entry in [&mut *flow, &mut *rflow] {
            entry.flags.insert(nat_flags | FlowFlags::RPF_ENABLED);
            if local {
                entry.flags.insert(FlowFlags::LOCAL);
            }
            entry.nat = self.nat.clone();
        }

        flow.source_vn = self.source_vn.clone();
        flow.dest_vn = self.dest_vn.clone();
        flow.src_vrf = self.src_vrf;
        flow.dst_vrf = self.dst_vrf;
        flow.intf_id = self.ingress_intf;
        flow.nh = self.dst_route.as_ref().map(|r| r.nh);
        match self.ecmp {
            Some(choice) => {
                flow.ecmp_index = choice.index;
                flow.ecmp_member = Some(choice.member);
                flow.flags.insert(FlowFlags::ECMP);
            }
            None => {
                flow.ecmp_index = INVALID_ECMP_INDEX;
                flow.ecmp_member = None;
            }
        }
        flow.rpf_nh = self.rpf_nh;
        flow.assigned_vrf = self.assigned_vrf();
        flow.action = self.policy.action;
        if self.vrf_assign.is_some() {
            flow.action.insert(ActionBits::VRF_TRANSLATE);
        }
        flow.mirrored_action = self.policy.rev_action;
        if self.ingress_intf.is_some() {
            flow.flags.insert(FlowFlags::INGRESS);
        }
        if self.rpf_failed {
            flow.flags.insert(FlowFlags::TRAP);
            flow.action.insert(ActionBits::TRAP);
        }

        if let Some(rkey) = self.rkey {
            rflow.key = rkey;
        }
        rflow.source_vn = self.dest_vn.clone();
        rflow.dest_vn = self.source_vn.clone();
        rflow.src_vrf = self.dst_vrf;
        rflow.dst_vrf = self.src_vrf;
        rflow.intf_id = self.egress_intf;
        rflow.nh = self.src_route.as_ref().map(|r| r.nh);
        match self.src_ecmp {
            Some(choice) => {
                rflow.ecmp_index = choice.index;
                rflow.ecmp_member = Some(choice.member);
                rflow.flags.insert(FlowFlags::ECMP);
            }
            None => {
                rflow.ecmp_index = INVALID_ECMP_INDEX;
                rflow.ecmp_member = None;
            }
        }
        // a reverse packet must come back from the member the forward leg uses
        rflow.rpf_nh = self
            .member_nh
            .or_else(|| self.dst_route.as_ref().map(|r| r.nh));
        rflow.action = self.policy.rev_action;
        rflow.mirrored_action = self.policy.action;
        if self.egress_intf.is_some() {
            rflow.flags.insert(FlowFlags::INGRESS);
        }
        if self.policy.deferred {
            rflow.flags.insert(FlowFlags::FIREWALL_TRAP);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::platform_data::{FloatingIp, VirtualNetwork};
    use crate::policy::{Acl, AclEntry, AddrMatch};
    use crate::route::{NhRegistry, NhSpec, RouteUpdate};
    use public::enums::{IpProtocol, TunnelType};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn key(src: &str, dst: &str, nh_id: u32) -> FlowKey {
        FlowKey {
            vrf_id: 1,
            protocol: IpProtocol::Tcp,
            src_addr: ip(src),
            dst_addr: ip(dst),
            src_port: 1000,
            dst_port: 80,
            nh_id,
        }
    }

    struct Setup {
        data: PlatformData,
        tables: RouteTables,
    }

    impl Setup {
        fn new() -> Self {
            let tables = RouteTables::new(Arc::new(NhRegistry::new()));
            let mut vm = Interface::new(1, 1, "vn1", ip("1.1.1.1"));
            vm.floating_ips
                .push(FloatingIp::new(ip("2.1.1.100"), 2, "public"));
            let data = PlatformData::default()
                .with_interface(vm)
                .with_interface(Interface::new(2, 1, "vn1", ip("1.1.1.2")));
            for (vrf, prefix, nh, vn) in [
                (1, "1.1.1.1/32", NhSpec::Interface(1), "vn1"),
                (1, "1.1.1.2/32", NhSpec::Interface(2), "vn1"),
                (2, "2.1.1.100/32", NhSpec::Interface(1), "public"),
                (
                    2,
                    "0.0.0.0/0",
                    NhSpec::Tunnel {
                        router: ip("10.0.0.1"),
                        label: 20,
                        tunnel_type: TunnelType::MplsGre,
                    },
                    "public",
                ),
            ] {
                tables
                    .add(RouteUpdate::new(vrf, prefix.parse().unwrap(), nh, vn))
                    .unwrap();
            }
            Self { data, tables }
        }

        fn ctx(&self) -> ResolveContext {
            ResolveContext {
                data: &self.data,
                tables: &self.tables,
            }
        }
    }

    #[test]
    fn local_flow_reverse_key() {
        let s = Setup::new();
        let info = FlowInfo::resolve(
            s.ctx(),
            &PktInfo::new(key("1.1.1.1", "1.1.1.2", 1)),
            &PreviousState::default(),
        );
        assert!(!info.is_short());
        assert!(!info.rpf_failed);
        assert_eq!(info.egress_intf, Some(2));
        assert_eq!(info.rkey, Some(key("1.1.1.2", "1.1.1.1", 2)).map(|mut k| {
            k.src_port = 80;
            k.dst_port = 1000;
            k
        }));
        assert_eq!(info.policy.action, ActionBits::PASS);
    }

    #[test]
    fn snat_rekeys_reverse_into_fip_vrf() {
        let s = Setup::new();
        let info = FlowInfo::resolve(
            s.ctx(),
            &PktInfo::new(key("1.1.1.1", "8.8.8.8", 1)),
            &PreviousState::default(),
        );
        let t = info.nat.as_ref().unwrap();
        assert_eq!(t.kind, NatKind::Snat);
        let rkey = info.rkey.unwrap();
        assert_eq!(rkey.vrf_id, 2);
        assert_eq!(rkey.dst_addr, ip("2.1.1.100"));
        assert_eq!(rkey.src_addr, ip("8.8.8.8"));
        assert!(rkey.nh_id >= crate::common::TUNNEL_NH_ID_BASE);
        assert_eq!(info.source_vn, vec!["public".to_owned()]);
    }

    #[test]
    fn dnat_from_fabric() {
        let s = Setup::new();
        let mut pkt = PktInfo::new(FlowKey {
            vrf_id: 2,
            ..key("8.8.8.8", "2.1.1.100", 0)
        });
        pkt.tunnel_src = Some(ip("10.0.0.1"));
        let info = FlowInfo::resolve(s.ctx(), &pkt, &PreviousState::default());
        assert_eq!(info.nat.as_ref().unwrap().kind, NatKind::Dnat);
        assert_eq!(info.dst_vrf, 1);
        assert!(!info.rpf_failed);
        let rkey = info.rkey.unwrap();
        assert_eq!(rkey.src_addr, ip("1.1.1.1"));
        assert_eq!(rkey.dst_addr, ip("8.8.8.8"));
        assert_eq!(rkey.nh_id, 1);
    }

    #[test]
    fn missing_routes_make_short() {
        let s = Setup::new();
        let info = FlowInfo::resolve(
            s.ctx(),
            &PktInfo::new(key("1.1.1.2", "9.9.9.9", 2)),
            &PreviousState::default(),
        );
        assert_eq!(info.short_reason, ShortReason::NoDstRoute);
        assert!(info.rkey.is_none());

        let info = FlowInfo::resolve(
            s.ctx(),
            &PktInfo::new(key("1.1.1.2", "1.1.1.1", 7)),
            &PreviousState::default(),
        );
        assert_eq!(info.short_reason, ShortReason::UnavailableInterface);
    }

    #[test]
    fn wrong_ingress_traps() {
        let s = Setup::new();
        let mut pkt = PktInfo::new(key("1.1.1.1", "1.1.1.2", 0));
        pkt.tunnel_src = Some(ip("10.9.9.9"));
        let info = FlowInfo::resolve(s.ctx(), &pkt, &PreviousState::default());
        assert!(info.rpf_failed);

        let mut pair = FlowPair::new(1, 0, FlowEntry::default(), FlowEntry::default());
        info.apply(&mut pair, Leg::Forward, &pkt);
        assert!(pair.forward.flags.contains(FlowFlags::TRAP));
        assert!(pair.forward.action.contains(ActionBits::TRAP));
        assert!(pair.reverse.flags.contains(FlowFlags::REVERSE));
    }

    const SVC_VRF: u32 = 3;

    // Steers traffic of an interface towards 8.8.8.0/24 into the svc vrf
    fn with_vrf_assign(mut s: Setup, intf_id: u32, target: &str) -> Setup {
        s.tables
            .add(RouteUpdate::new(
                SVC_VRF,
                "0.0.0.0/0".parse().unwrap(),
                NhSpec::Tunnel {
                    router: ip("10.0.0.3"),
                    label: 30,
                    tunnel_type: TunnelType::MplsGre,
                },
                "svc",
            ))
            .unwrap();
        let mut intf = s.data.interface(intf_id).unwrap().clone();
        intf.vrf_assign_acl = Some(50);
        s.data = s
            .data
            .with_interface(intf)
            .with_vn(VirtualNetwork {
                name: "svc".to_owned(),
                vrf_id: SVC_VRF,
                ..Default::default()
            })
            .with_acl(Acl::new(
                50,
                vec![AclEntry {
                    id: 1,
                    dst: AddrMatch::Subnet("8.8.8.0/24".parse().unwrap()),
                    vrf_assign: Some(target.to_owned()),
                    ..Default::default()
                }],
            ));
        s
    }

    #[test]
    fn vrf_assign_moves_destination_lookup() {
        let s = with_vrf_assign(Setup::new(), 2, "svc");
        let pkt = PktInfo::new(key("1.1.1.2", "8.8.8.8", 2));
        let info = FlowInfo::resolve(s.ctx(), &pkt, &PreviousState::default());
        assert!(!info.is_short());
        assert_eq!(info.dst_vrf, SVC_VRF);
        assert_eq!(info.src_vrf, 1);
        assert_eq!(info.assigned_vrf(), Some(SVC_VRF));
        assert_eq!(info.dst_route.as_ref().unwrap().vrf_id, SVC_VRF);
        assert_eq!(info.rkey.unwrap().vrf_id, SVC_VRF);
        assert!(!info.rpf_failed);

        let mut pair = FlowPair::new(1, 0, FlowEntry::default(), FlowEntry::default());
        info.apply(&mut pair, Leg::Forward, &pkt);
        assert!(pair.forward.action.contains(ActionBits::VRF_TRANSLATE));
        assert_eq!(pair.forward.assigned_vrf, Some(SVC_VRF));
        assert_eq!(pair.reverse.src_vrf, SVC_VRF);
        assert_eq!(pair.reverse.dst_vrf, 1);

        // only matching traffic is steered
        let info = FlowInfo::resolve(
            s.ctx(),
            &PktInfo::new(key("1.1.1.2", "1.1.1.1", 2)),
            &PreviousState::default(),
        );
        assert_eq!(info.dst_vrf, 1);
        assert_eq!(info.vrf_assign_acl, Some(50));
        assert!(info.vrf_assign.is_none());
    }

    #[test]
    fn vrf_assign_to_missing_vn_is_short() {
        let s = with_vrf_assign(Setup::new(), 2, "gone");
        let info = FlowInfo::resolve(
            s.ctx(),
            &PktInfo::new(key("1.1.1.2", "8.8.8.8", 2)),
            &PreviousState::default(),
        );
        assert_eq!(info.short_reason, ShortReason::UnavailableVrf);
        assert!(info.rkey.is_none());
    }

    #[test]
    fn floating_ip_wins_over_vrf_assign() {
        let s = with_vrf_assign(Setup::new(), 1, "svc");
        let info = FlowInfo::resolve(
            s.ctx(),
            &PktInfo::new(key("1.1.1.1", "8.8.8.8", 1)),
            &PreviousState::default(),
        );
        assert_eq!(info.nat.as_ref().unwrap().kind, NatKind::Snat);
        assert_eq!(info.dst_vrf, 2);
        assert!(info.vrf_assign.is_none());
    }
}
