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

use log::debug;

use crate::common::FlowKey;
use crate::route::{Member, NextHopGroup};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EcmpChoice {
    pub index: u32,
    pub member: Member,
}

impl EcmpChoice {
    fn at(group: &NextHopGroup, index: u32) -> Option<Self> {
        group
            .member_at(index)
            .map(|member| EcmpChoice { index, member: *member })
    }
}

// What the resolver knows about the flow besides the group
#[derive(Clone, Copy, Debug, Default)]
pub struct EcmpInput {
    // index and member stored by the previous resolution
    pub previous: Option<(u32, Member)>,
    // member suggested by the dataplane
    pub hint: Option<u32>,
    // the dataplane asked explicitly for a new member
    pub resolve_requested: bool,
    // the flow was not ECMP before this re-evaluation
    pub became_ecmp: bool,
}

/*
 * Hash based pick. Lands on `hash % len` and walks forward to the next
 * valid slot, `exclude` is only taken when it is the last valid member.
 */
pub fn pick_by_hash(group: &NextHopGroup, key: &FlowKey, exclude: Option<u32>) -> Option<u32> {
    let len = group.len() as u32;
    if len == 0 {
        return None;
    }
    let start = (key.five_tuple_hash() % len as u64) as u32;
    let mut fallback = None;
    for step in 0..len {
        let index = (start + step) % len;
        if group.member_at(index).is_none() {
            continue;
        }
        if Some(index) == exclude {
            fallback = Some(index);
            continue;
        }
        return Some(index);
    }
    fallback
}

/*
 * Member selection for a flow whose destination resolves to `group`.
 *
 * A stored index stays as long as it still holds the same member, so that a
 * flow does not move when unrelated members come and go. A member moved to
 * another slot is followed. The dataplane hint wins over the stored index
 * only when it asked for resolution explicitly.
 */
pub fn resolve(group: &NextHopGroup, key: &FlowKey, input: &EcmpInput) -> Option<EcmpChoice> {
    let hinted = input.hint.and_then(|h| EcmpChoice::at(group, h));
    if input.resolve_requested {
        if let Some(choice) = hinted {
            return Some(choice);
        }
    }

    let mut stale = None;
    if let Some((index, member)) = input.previous {
        if group.member_at(index) == Some(&member) {
            return Some(EcmpChoice { index, member });
        }
        if let Some(moved) = group.position(&member) {
            return Some(EcmpChoice { index: moved, member });
        }
        debug!("ecmp member {} at {} is gone for {}", member, index, key);
        stale = Some(index);
    }

    if let Some(choice) = hinted {
        return Some(choice);
    }
    if input.became_ecmp && stale.is_none() {
        if let Some(choice) = EcmpChoice::at(group, 0) {
            return Some(choice);
        }
    }
    pick_by_hash(group, key, stale).and_then(|index| EcmpChoice::at(group, index))
}

/*
 * Member selection for the reverse leg when the flow source sits behind a
 * group: the member the traffic came from is used, by tunnel source for
 * remote members and by ingress interface for local ones.
 */
pub fn resolve_source(
    group: &NextHopGroup,
    rkey: &FlowKey,
    tunnel_src: Option<IpAddr>,
    ingress_intf: Option<u32>,
    previous: Option<(u32, Member)>,
) -> Option<EcmpChoice> {
    let matched = group.members().find(|(_, m)| match m {
        Member::Remote { router, .. } => tunnel_src == Some(*router),
        Member::Local { intf_id, .. } => ingress_intf == Some(*intf_id),
    });
    if let Some((index, member)) = matched {
        return Some(EcmpChoice {
            index,
            member: *member,
        });
    }
    resolve(
        group,
        rkey,
        &EcmpInput {
            previous,
            ..Default::default()
        },
    )
}
