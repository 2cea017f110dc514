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

use crate::route::{NextHop, NhRegistry};

// Next-hop the flow's packets are expected to arrive from
pub fn expected_ingress(src_nh: &NextHop, chosen: Option<NextHop>) -> NextHop {
    match (src_nh, chosen) {
        (NextHop::Group(_), Some(member)) => member,
        _ => *src_nh,
    }
}

/*
 * Checks the observed ingress against the expected next-hop. Packets from the
 * fabric are matched by tunnel source, local ones by next-hop id.
 */
pub fn check(
    expected: &NextHop,
    nh_id: u32,
    tunnel_src: Option<IpAddr>,
    registry: &NhRegistry,
) -> bool {
    match expected {
        NextHop::Discard => false,
        NextHop::Interface(id) => *id == nh_id && tunnel_src.is_none(),
        NextHop::Tunnel(t) => match tunnel_src {
            Some(src) => src == t.router,
            None => t.id == nh_id,
        },
        NextHop::Group(id) => {
            if id.0 == nh_id {
                return true;
            }
            let Some(group) = registry.group(*id) else {
                return false;
            };
            let matched = group.members().any(|(_, m)| match tunnel_src {
                Some(src) => m.router() == Some(src),
                None => m.intf_id() == Some(nh_id),
            });
            matched
        }
    }
}

// A source moving from a single next-hop to a group needs a new check
pub fn became_group(previous: Option<&NextHop>, current: &NextHop) -> bool {
    matches!(previous, Some(p) if !p.is_group()) && current.is_group()
}
