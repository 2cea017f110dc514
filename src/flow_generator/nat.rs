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

use crate::common::platform_data::{FloatingIp, Interface, PlatformData};
use crate::route::{RouteEntry, RouteTables};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NatKind {
    Snat,
    Dnat,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Translation {
    pub kind: NatKind,
    pub fip: IpAddr,
    pub fip_vrf: u32,
    pub fip_vn: String,
    // address before and after the rewrite
    pub original: IpAddr,
    pub translated: IpAddr,
    // local interface owning the floating address
    pub intf_id: u32,
}

#[derive(Clone, Debug)]
pub struct SnatMatch {
    pub translation: Translation,
    // route to the destination inside the floating ip vrf
    pub route: Arc<RouteEntry>,
}

fn same_family(a: &IpAddr, b: &IpAddr) -> bool {
    a.is_ipv4() == b.is_ipv4()
}

/*
 * Picks the floating address used for traffic sourced by `intf` towards
 * `dst`. Each floating address is a candidate when its vrf routes `dst`:
 *   - the longest matching prefix wins, ties go to the lowest address
 *   - a route in the interface's own vrf beats the candidates only with a
 *     strictly longer prefix, no translation is done then
 */
pub fn resolve_snat(
    intf: &Interface,
    src: &IpAddr,
    dst: &IpAddr,
    tables: &RouteTables,
) -> Option<SnatMatch> {
    if intf.floating_ips.is_empty() || intf.ip != *src {
        return None;
    }
    let local_plen = tables
        .lookup(intf.vrf_id, dst)
        .map(|r| r.prefix.prefix_len());

    let mut best: Option<(&FloatingIp, Arc<RouteEntry>)> = None;
    for fip in intf.floating_ips.iter() {
        if !same_family(&fip.addr, dst) {
            continue;
        }
        let Some(route) = tables.lookup(fip.vrf_id, dst) else {
            continue;
        };
        let plen = route.prefix.prefix_len();
        if matches!(local_plen, Some(local) if local > plen) {
            trace!("fip {} loses to vrf {} route", fip.addr, intf.vrf_id);
            continue;
        }
        let better = match &best {
            None => true,
            Some((current, current_route)) => {
                let current_plen = current_route.prefix.prefix_len();
                plen > current_plen || (plen == current_plen && fip.addr < current.addr)
            }
        };
        if better {
            best = Some((fip, route));
        }
    }

    best.map(|(fip, route)| SnatMatch {
        translation: Translation {
            kind: NatKind::Snat,
            fip: fip.addr,
            fip_vrf: fip.vrf_id,
            fip_vn: fip.vn.clone(),
            original: *src,
            translated: fip.addr,
            intf_id: intf.id,
        },
        route,
    })
}

// Traffic towards a floating address of a local interface reaches the
// interface's fixed address
pub fn resolve_dnat(data: &PlatformData, vrf_id: u32, dst: &IpAddr) -> Option<Translation> {
    let (intf, fip) = data.fip_owner(vrf_id, dst)?;
    if !intf.active {
        return None;
    }
    Some(Translation {
        kind: NatKind::Dnat,
        fip: *dst,
        fip_vrf: vrf_id,
        fip_vn: fip.vn.clone(),
        original: *dst,
        translated: intf.ip,
        intf_id: intf.id,
    })
}
