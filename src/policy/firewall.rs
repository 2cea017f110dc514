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

use ipnet::IpNet;
use public::enums::IpProtocol;

use super::{ActionBits, Endpoint};
use crate::common::port_range::PortRange;

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct TagSet(Vec<u32>);

impl TagSet {
    pub fn new<I: IntoIterator<Item = u32>>(tags: I) -> Self {
        let mut v: Vec<u32> = tags.into_iter().collect();
        v.sort_unstable();
        v.dedup();
        Self(v)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, tag: u32) -> bool {
        self.0.binary_search(&tag).is_ok()
    }

    pub fn contains_all(&self, other: &TagSet) -> bool {
        other.0.iter().all(|t| self.contains(*t))
    }

    pub fn intersects(&self, other: &TagSet) -> bool {
        other.0.iter().any(|t| self.contains(*t))
    }

    pub fn iter(&self) -> impl Iterator<Item = &u32> {
        self.0.iter()
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleDirection {
    // <>
    Both,
    // >, endpoint1 to endpoint2 only
    Forward,
    // <, endpoint2 to endpoint1 only
    Reverse,
}

#[derive(Clone, Debug, PartialEq)]
pub enum EndpointMatch {
    Any,
    Tags(TagSet),
    Subnet(IpNet),
}

impl EndpointMatch {
    pub fn matches(&self, ep: &Endpoint) -> bool {
        match self {
            EndpointMatch::Any => true,
            EndpointMatch::Tags(tags) => ep.tags.contains_all(tags),
            EndpointMatch::Subnet(net) => ep.addr.map(|a| net.contains(&a)).unwrap_or(false),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServiceMatch {
    pub protocol: Option<IpProtocol>,
    pub ports: PortRange,
}

impl ServiceMatch {
    fn matches(&self, protocol: IpProtocol, dst_port: u16) -> bool {
        self.protocol.map(|p| p == protocol).unwrap_or(true)
            && (protocol.is_icmp() || self.ports.contains(dst_port))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FirewallRule {
    pub id: u32,
    pub endpoint1: EndpointMatch,
    pub endpoint2: EndpointMatch,
    pub direction: RuleDirection,
    // empty allows every service
    pub services: Vec<ServiceMatch>,
    pub action: ActionBits,
}

enum RuleMatch {
    Allowed,
    // matched only in the orientation excluded by the rule direction
    Excluded,
    Missed,
}

impl FirewallRule {
    fn service_allowed(&self, protocol: IpProtocol, dst_port: u16) -> bool {
        self.services.is_empty()
            || self
                .services
                .iter()
                .any(|s| s.matches(protocol, dst_port))
    }

    fn packet_match(&self, protocol: IpProtocol, src: &Endpoint, dst: &Endpoint) -> RuleMatch {
        if !self.service_allowed(protocol, dst.port) {
            return RuleMatch::Missed;
        }
        let forward = self.endpoint1.matches(src) && self.endpoint2.matches(dst);
        let reverse = self.endpoint1.matches(dst) && self.endpoint2.matches(src);
        match self.direction {
            RuleDirection::Both if forward || reverse => RuleMatch::Allowed,
            RuleDirection::Forward if forward => RuleMatch::Allowed,
            RuleDirection::Reverse if reverse => RuleMatch::Allowed,
            RuleDirection::Forward if reverse => RuleMatch::Excluded,
            RuleDirection::Reverse if forward => RuleMatch::Excluded,
            _ => RuleMatch::Missed,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FirewallPolicy {
    pub id: u32,
    pub rules: Vec<FirewallRule>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ApplicationPolicySet {
    pub id: u32,
    // empty tags make a global set matching any endpoint
    pub tags: TagSet,
    pub policies: Vec<FirewallPolicy>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FirewallVerdict {
    // no policy set applies to the endpoint
    NotApplicable,
    NoMatch { aps_id: u32 },
    Matched { aps_id: u32, rule_id: u32, action: ActionBits },
    // the first matching rule excludes this direction, the result depends on
    // traffic from the other side
    Deferred { aps_id: u32, rule_id: u32 },
}

impl FirewallVerdict {
    pub fn aps_id(&self) -> Option<u32> {
        match self {
            FirewallVerdict::NotApplicable => None,
            FirewallVerdict::NoMatch { aps_id }
            | FirewallVerdict::Matched { aps_id, .. }
            | FirewallVerdict::Deferred { aps_id, .. } => Some(*aps_id),
        }
    }

    pub fn action(&self) -> ActionBits {
        match self {
            FirewallVerdict::NotApplicable => ActionBits::PASS,
            FirewallVerdict::NoMatch { .. } => ActionBits::DENY | ActionBits::IMPLICIT_DENY,
            FirewallVerdict::Matched { action, .. } => *action,
            FirewallVerdict::Deferred { .. } => ActionBits::DENY,
        }
    }
}

impl ApplicationPolicySet {
    // 2 for a full tag match, 1 for partial, 0 for a global set
    fn match_score(&self, tags: &TagSet) -> Option<u8> {
        if self.tags.is_empty() {
            Some(0)
        } else if tags.contains_all(&self.tags) {
            Some(2)
        } else if tags.intersects(&self.tags) {
            Some(1)
        } else {
            None
        }
    }

    // Policies and their rules are walked in order, the first match decides
    pub fn evaluate(
        &self,
        protocol: IpProtocol,
        src: &Endpoint,
        dst: &Endpoint,
    ) -> FirewallVerdict {
        for policy in self.policies.iter() {
            for rule in policy.rules.iter() {
                match rule.packet_match(protocol, src, dst) {
                    RuleMatch::Allowed => {
                        return FirewallVerdict::Matched {
                            aps_id: self.id,
                            rule_id: rule.id,
                            action: rule.action,
                        }
                    }
                    RuleMatch::Excluded => {
                        return FirewallVerdict::Deferred {
                            aps_id: self.id,
                            rule_id: rule.id,
                        }
                    }
                    RuleMatch::Missed => (),
                }
            }
        }
        FirewallVerdict::NoMatch { aps_id: self.id }
    }
}

// Most specific set wins, ties go to the first configured
pub fn select_policy_set<'a>(
    sets: &'a [ApplicationPolicySet],
    tags: &TagSet,
) -> Option<&'a ApplicationPolicySet> {
    let mut best: Option<(u8, &ApplicationPolicySet)> = None;
    for set in sets.iter() {
        if let Some(score) = set.match_score(tags) {
            if best.map(|(s, _)| score > s).unwrap_or(true) {
                best = Some((score, set));
            }
        }
    }
    best.map(|(_, set)| set)
}

pub fn evaluate_firewall(
    sets: &[ApplicationPolicySet],
    protocol: IpProtocol,
    src: &Endpoint,
    dst: &Endpoint,
) -> FirewallVerdict {
    // the policy set follows the local side, the source when both are local
    let tags = if src.intf_id.is_some() || dst.intf_id.is_none() {
        &src.tags
    } else {
        &dst.tags
    };
    match select_policy_set(sets, tags) {
        Some(set) => set.evaluate(protocol, src, dst),
        None => FirewallVerdict::NotApplicable,
    }
}
