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

use std::net::Ipv4Addr;
use std::time::Instant;

use criterion::*;

use public::enums::{IpProtocol, TunnelType};
use vrouter_agent::{
    common::FlowKey,
    flow_generator::{ecmp, EcmpInput},
    route::{Member, NhRegistry},
};

pub(super) fn bench(c: &mut Criterion) {
    let registry = NhRegistry::new();
    let members = (1..=16u8)
        .map(|i| Member::Remote {
            label: 100 + i as u32,
            router: Ipv4Addr::new(10, 0, 0, i).into(),
            tunnel_type: TunnelType::MplsGre,
        })
        .collect::<Vec<_>>();
    let group = registry.publish(registry.next_id().unwrap(), &members);

    c.bench_function("ecmp_resolve_new_flow", |b| {
        b.iter_custom(|iters| {
            let input = EcmpInput::default();
            let start = Instant::now();
            for i in 0..iters {
                let key = FlowKey {
                    vrf_id: 1,
                    protocol: IpProtocol::Udp,
                    src_addr: Ipv4Addr::new(10, 1, 0, 1).into(),
                    dst_addr: Ipv4Addr::new(10, 2, 0, 1).into(),
                    src_port: i as u16,
                    dst_port: 53,
                    nh_id: 1,
                };
                black_box(ecmp::resolve(&group, &key, &input));
            }
            start.elapsed()
        })
    });
}
