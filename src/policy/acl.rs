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

#[derive(Clone, Debug, PartialEq)]
pub enum AddrMatch {
    Any,
    Subnet(IpNet),
    Vn(String),
    SecurityGroup(u32),
}

impl Default for AddrMatch {
    fn default() -> Self {
        AddrMatch::Any
    }
}

impl AddrMatch {
    pub fn matches(&self, ep: &Endpoint) -> bool {
        match self {
            AddrMatch::Any => true,
            AddrMatch::Subnet(net) => ep.addr.map(|a| net.contains(&a)).unwrap_or(false),
            AddrMatch::Vn(name) => ep.in_vn(name),
            AddrMatch::SecurityGroup(id) => ep.sg_ids.contains(id),
        }
    }
}

impl fmt::Display for AddrMatch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AddrMatch::Any => write!(f, "any"),
            AddrMatch::Subnet(net) => write!(f, "{}", net),
            AddrMatch::Vn(name) => write!(f, "vn:{}", name),
            AddrMatch::SecurityGroup(id) => write!(f, "sg:{}", id),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AclEntry {
    pub id: u32,
    // None matches every protocol
    pub protocol: Option<IpProtocol>,
    pub src: AddrMatch,
    pub dst: AddrMatch,
    pub src_ports: PortRange,
    pub dst_ports: PortRange,
    pub action: ActionBits,
    // stops the scan of all remaining acls once matched
    pub terminal: bool,
    // vn whose vrf the destination is resolved in, vrf assign acls only
    pub vrf_assign: Option<String>,
}

impl Default for AclEntry {
    fn default() -> Self {
        Self {
            id: 0,
            protocol: None,
            src: AddrMatch::Any,
            dst: AddrMatch::Any,
            src_ports: PortRange::ANY,
            dst_ports: PortRange::ANY,
            action: ActionBits::PASS,
            terminal: false,
            vrf_assign: None,
        }
    }
}

impl AclEntry {
    pub fn matches(&self, protocol: IpProtocol, src: &Endpoint, dst: &Endpoint) -> bool {
        if let Some(p) = self.protocol {
            if p != protocol {
                return false;
            }
        }
        // ports only make sense for tcp/udp like protocols
        let check_ports = !protocol.is_icmp();
        self.src.matches(src)
            && self.dst.matches(dst)
            && (!check_ports
                || (self.src_ports.contains(src.port) && self.dst_ports.contains(dst.port)))
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Acl {
    pub id: u32,
    pub entries: Vec<AclEntry>,
}

#[derive(Debug, Default, PartialEq)]
pub struct AclMatch {
    pub action: ActionBits,
    pub matched: bool,
    pub terminal: bool,
    pub rule_ids: Vec<u32>,
}

impl Acl {
    pub fn new(id: u32, entries: Vec<AclEntry>) -> Self {
        Self { id, entries }
    }

    // Accumulates the actions of every matching entry until a terminal one
    pub fn packet_match(&self, protocol: IpProtocol, src: &Endpoint, dst: &Endpoint) -> AclMatch {
        let mut result = AclMatch::default();
        for entry in self.entries.iter() {
            if !entry.matches(protocol, src, dst) {
                continue;
            }
            result.matched = true;
            result.action |= entry.action;
            result.rule_ids.push(entry.id);
            if entry.terminal {
                result.terminal = true;
                break;
            }
        }
        result
    }

    // Target vn of the first matching entry, a vrf assign acl is first match
    pub fn assigned_vn(
        &self,
        protocol: IpProtocol,
        src: &Endpoint,
        dst: &Endpoint,
    ) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.matches(protocol, src, dst))
            .and_then(|e| e.vrf_assign.as_deref())
    }
}

/*
 * Merge of a list of acls:
 *   - no acl at all is an implicit allow
 *   - actions of matching entries from all acls are OR'ed, a terminal entry
 *     ends the scan
 *   - nothing matched is an implicit deny
 */
pub fn match_acls<'a, I>(acls: I, protocol: IpProtocol, src: &Endpoint, dst: &Endpoint) -> AclMatch
where
    I: IntoIterator<Item = &'a Acl>,
{
    let mut result = AclMatch::default();
    let mut evaluated = false;
    for acl in acls {
        evaluated = true;
        let m = acl.packet_match(protocol, src, dst);
        if m.matched {
            result.matched = true;
            result.action |= m.action;
            result.rule_ids.extend(m.rule_ids);
        }
        if m.terminal {
            result.terminal = true;
            break;
        }
    }
    if !evaluated {
        result.action = ActionBits::PASS;
    } else if !result.matched {
        result.action = ActionBits::DENY | ActionBits::IMPLICIT_DENY;
    }
    result
}

// Entries of a security group are allow rules, ingress rules match the peer
// as source and egress rules match the peer as destination
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SecurityGroup {
    pub id: u32,
    pub ingress: Acl,
    pub egress: Acl,
}

impl SecurityGroup {
    pub fn new(id: u32, ingress: Vec<AclEntry>, egress: Vec<AclEntry>) -> Self {
        Self {
            id,
            ingress: Acl::new(id, ingress),
            egress: Acl::new(id, egress),
        }
    }
}
