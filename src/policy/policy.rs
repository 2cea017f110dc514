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

use log::debug;
use public::enums::IpProtocol;

use super::{
    acl::{match_acls, Acl},
    firewall::{evaluate_firewall, FirewallVerdict},
    ActionBits, Endpoint,
};
use crate::common::platform_data::PlatformData;

const DNS_PORT: u16 = 53;
const DHCP_SERVER_PORT: u16 = 67;

// Inputs for evaluating one leg of a flow
#[derive(Clone, Debug, Default)]
pub struct LegPolicy {
    pub protocol: IpProtocol,
    pub src: Endpoint,
    pub dst: Endpoint,
    // segment carries ACK without SYN
    pub tcp_ack: bool,
    pub link_local: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PolicyResult {
    pub action: ActionBits,
    // action of the mirrored leg
    pub rev_action: ActionBits,
    pub deferred: bool,
    pub acl_ids: Vec<u32>,
    pub sg_ids: Vec<u32>,
    pub aps_id: Option<u32>,
}

fn implicit_allow(data: &PlatformData, flow: &LegPolicy) -> bool {
    if flow.link_local {
        return true;
    }
    let Some(dst) = flow.dst.addr else {
        return false;
    };
    if !data.is_service_addr(&dst) {
        return false;
    }
    flow.protocol.is_icmp()
        || (flow.protocol == IpProtocol::Udp
            && (flow.dst.port == DNS_PORT || flow.dst.port == DHCP_SERVER_PORT))
}

fn network_acls<'a>(data: &'a PlatformData, flow: &LegPolicy) -> Vec<&'a Acl> {
    let mut ids: Vec<u32> = vec![];
    for vn in [flow.src.primary_vn(), flow.dst.primary_vn()]
        .into_iter()
        .flatten()
    {
        if let Some(vn) = data.vn(vn) {
            for id in vn.acl_ids.iter() {
                if !ids.contains(id) {
                    ids.push(*id);
                }
            }
        }
    }
    ids.iter().filter_map(|id| data.acl(*id)).collect()
}

// Egress rules of the source interface and ingress rules of the destination
// interface, remote endpoints are not checked
fn sg_action(data: &PlatformData, flow: &LegPolicy, used: &mut Vec<u32>) -> ActionBits {
    let mut action = ActionBits::empty();
    if flow.src.intf_id.is_some() {
        let sgs: Vec<&Acl> = flow
            .src
            .sg_ids
            .iter()
            .filter_map(|id| data.security_group(*id))
            .map(|sg| &sg.egress)
            .collect();
        used.extend(flow.src.sg_ids.iter().copied());
        action |= match_acls(sgs, flow.protocol, &flow.src, &flow.dst).action;
    }
    if flow.dst.intf_id.is_some() {
        let sgs: Vec<&Acl> = flow
            .dst
            .sg_ids
            .iter()
            .filter_map(|id| data.security_group(*id))
            .map(|sg| &sg.ingress)
            .collect();
        used.extend(flow.dst.sg_ids.iter().copied());
        action |= match_acls(sgs, flow.protocol, &flow.src, &flow.dst).action;
    }
    if action.is_empty() {
        ActionBits::PASS
    } else {
        action
    }
}

/*
 * Merges network acls, security groups and the firewall policy set into the
 * action of `flow`. The mirrored leg follows the result:
 *   - a passing flow lets the mirrored leg pass
 *   - a dropping or deferred flow traps the mirrored leg, its traffic gets a
 *     chance to be evaluated from the other side
 */
pub fn evaluate(data: &PlatformData, flow: &LegPolicy, rflow: &LegPolicy) -> PolicyResult {
    let mut result = PolicyResult::default();
    if implicit_allow(data, flow) {
        result.action = ActionBits::PASS;
        result.rev_action = ActionBits::PASS;
        return result;
    }

    let acls = network_acls(data, flow);
    result.acl_ids = acls.iter().map(|a| a.id).collect();
    let nacl = match_acls(acls, flow.protocol, &flow.src, &flow.dst);

    let mut sg = sg_action(data, flow, &mut result.sg_ids);
    if flow.tcp_ack && flow.protocol == IpProtocol::Tcp && sg.drops() {
        // established connection seen mid stream, allowed if the opposite
        // direction is allowed
        let rev = sg_action(data, rflow, &mut result.sg_ids);
        if rev.passes() {
            sg = ActionBits::PASS;
        }
    }
    result.sg_ids.sort_unstable();
    result.sg_ids.dedup();

    let fw = evaluate_firewall(data.policy_sets(), flow.protocol, &flow.src, &flow.dst);
    result.aps_id = fw.aps_id();
    result.deferred = matches!(fw, FirewallVerdict::Deferred { .. });

    result.action = nacl.action | sg | fw.action();
    result.rev_action = if result.deferred || result.action.drops() {
        ActionBits::TRAP
    } else {
        ActionBits::PASS
    };
    debug!(
        "policy nacl {:?} sg {:?} fw {:?} -> {:?}/{:?}",
        nacl.action, sg, fw, result.action, result.rev_action
    );
    result
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;
    use crate::common::platform_data::{Interface, VirtualNetwork};
    use crate::common::port_range::PortRange;
    use crate::policy::{
        AclEntry, AddrMatch, ApplicationPolicySet, EndpointMatch, FirewallPolicy, FirewallRule,
        RuleDirection, SecurityGroup, TagSet,
    };

    const WEB: u32 = 10;
    const DB: u32 = 11;

    fn local(id: u32, addr: &str, port: u16, vn: &str, sgs: &[u32], tags: &[u32]) -> Endpoint {
        Endpoint {
            addr: Some(addr.parse::<IpAddr>().unwrap()),
            port,
            vn: vec![vn.to_owned()],
            sg_ids: sgs.to_vec(),
            tags: TagSet::new(tags.iter().copied()),
            intf_id: Some(id),
        }
    }

    fn leg(src: Endpoint, dst: Endpoint) -> LegPolicy {
        LegPolicy {
            protocol: IpProtocol::Tcp,
            src,
            dst,
            ..Default::default()
        }
    }

    fn mirror(flow: &LegPolicy) -> LegPolicy {
        LegPolicy {
            protocol: flow.protocol,
            src: flow.dst.clone(),
            dst: flow.src.clone(),
            ..Default::default()
        }
    }

    fn platform() -> PlatformData {
        PlatformData::default()
            .with_vn(VirtualNetwork {
                name: "vn1".to_owned(),
                vrf_id: 1,
                ..Default::default()
            })
            .with_interface(Interface::new(1, 1, "vn1", "10.0.0.1".parse().unwrap()))
            .with_interface(Interface::new(2, 1, "vn1", "10.0.0.2".parse().unwrap()))
    }

    #[test]
    fn nothing_configured_passes() {
        let data = platform();
        let flow = leg(
            local(1, "10.0.0.1", 1000, "vn1", &[], &[]),
            local(2, "10.0.0.2", 80, "vn1", &[], &[]),
        );
        let r = evaluate(&data, &flow, &mirror(&flow));
        assert_eq!(r.action, ActionBits::PASS);
        assert_eq!(r.rev_action, ActionBits::PASS);
    }

    #[test]
    fn network_acl_deny_traps_mirror() {
        let data = platform()
            .with_acl(Acl::new(
                5,
                vec![AclEntry {
                    id: 1,
                    dst_ports: PortRange::single(22),
                    action: ActionBits::PASS,
                    ..Default::default()
                }],
            ))
            .with_vn(VirtualNetwork {
                name: "vn1".to_owned(),
                vrf_id: 1,
                acl_ids: vec![5],
                ..Default::default()
            });
        let flow = leg(
            local(1, "10.0.0.1", 1000, "vn1", &[], &[]),
            local(2, "10.0.0.2", 80, "vn1", &[], &[]),
        );
        let r = evaluate(&data, &flow, &mirror(&flow));
        assert!(r.action.contains(ActionBits::IMPLICIT_DENY));
        assert_eq!(r.rev_action, ActionBits::TRAP);
        assert_eq!(r.acl_ids, vec![5]);

        let flow = leg(
            local(1, "10.0.0.1", 1000, "vn1", &[], &[]),
            local(2, "10.0.0.2", 22, "vn1", &[], &[]),
        );
        let r = evaluate(&data, &flow, &mirror(&flow));
        assert_eq!(r.action, ActionBits::PASS);
    }

    #[test]
    fn service_address_is_implicitly_allowed() {
        let mut data = platform().with_acl(Acl::new(5, vec![])).with_vn(VirtualNetwork {
            name: "vn1".to_owned(),
            vrf_id: 1,
            acl_ids: vec![5],
            ..Default::default()
        });
        data.set_service_addrs(vec!["10.0.0.254".parse().unwrap()]);
        let mut flow = leg(
            local(1, "10.0.0.1", 1000, "vn1", &[], &[]),
            Endpoint {
                addr: Some("10.0.0.254".parse().unwrap()),
                port: 53,
                ..Default::default()
            },
        );
        flow.protocol = IpProtocol::Udp;
        assert_eq!(evaluate(&data, &flow, &mirror(&flow)).action, ActionBits::PASS);
        flow.protocol = IpProtocol::Tcp;
        assert!(evaluate(&data, &flow, &mirror(&flow)).action.drops());
    }

    #[test]
    fn tcp_ack_allowed_by_reverse_direction() {
        // 10.0.0.2 accepts nothing, but may open connections towards sg 7
        let data = platform().with_security_group(SecurityGroup::new(
            7,
            vec![],
            vec![AclEntry {
                id: 1,
                dst: AddrMatch::SecurityGroup(8),
                ..Default::default()
            }],
        ));
        let client = local(1, "10.0.0.1", 1000, "vn1", &[8], &[]);
        let server = local(2, "10.0.0.2", 80, "vn1", &[7], &[]);
        let mut flow = leg(client, server);
        let rflow = mirror(&flow);
        // opening packet is evaluated on its own
        assert!(evaluate(&data, &flow, &rflow).action.drops());

        flow.tcp_ack = true;
        let r = evaluate(&data, &flow, &rflow);
        assert_eq!(r.action, ActionBits::PASS);
        assert_eq!(r.sg_ids, vec![7, 8]);
    }

    #[test]
    fn firewall_forward_only_rule() {
        let data = platform().with_policy_sets(vec![ApplicationPolicySet {
            id: 3,
            tags: TagSet::default(),
            policies: vec![FirewallPolicy {
                id: 1,
                rules: vec![FirewallRule {
                    id: 9,
                    endpoint1: EndpointMatch::Tags(TagSet::new([WEB])),
                    endpoint2: EndpointMatch::Tags(TagSet::new([DB])),
                    direction: RuleDirection::Forward,
                    services: vec![],
                    action: ActionBits::PASS,
                }],
            }],
        }]);
        let web = local(1, "10.0.0.1", 1000, "vn1", &[], &[WEB]);
        let db = local(2, "10.0.0.2", 3306, "vn1", &[], &[DB]);

        let reverse_packet = leg(db.clone(), web.clone());
        let r = evaluate(&data, &reverse_packet, &mirror(&reverse_packet));
        assert!(r.deferred);
        assert_eq!(r.action.enforced(), ActionBits::DENY);
        assert_eq!(r.action.finalize(), ActionBits::DENY);
        assert_eq!(r.rev_action, ActionBits::TRAP);
        assert_eq!(r.aps_id, Some(3));

        let forward_packet = leg(web, db);
        let r = evaluate(&data, &forward_packet, &mirror(&forward_packet));
        assert_eq!(r.action, ActionBits::PASS);
        assert_eq!(r.rev_action, ActionBits::PASS);
    }
}
