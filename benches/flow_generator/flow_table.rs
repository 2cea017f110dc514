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

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use criterion::*;

use public::enums::IpProtocol;
use vrouter_agent::{
    common::{platform_data::Interface, FlowKey, PktInfo, PlatformData},
    config::{Config, ConfigHandler},
    flow_generator::{FlowDeps, FlowEntryPool, FlowTable, PoolConfig},
    route::{NhRegistry, NhSpec, RouteTables, RouteUpdate},
};

fn new_table(handler: &ConfigHandler) -> FlowTable {
    let tables = Arc::new(RouteTables::new(Arc::new(NhRegistry::new())));
    let src: IpAddr = Ipv4Addr::new(10, 1, 0, 1).into();
    tables
        .add(RouteUpdate::new(
            1,
            "10.1.0.1/32".parse().unwrap(),
            NhSpec::Interface(1),
            "vn1",
        ))
        .unwrap();
    tables
        .add(RouteUpdate::new(
            1,
            "10.2.0.0/16".parse().unwrap(),
            NhSpec::Interface(2),
            "vn1",
        ))
        .unwrap();
    let data = PlatformData::default()
        .with_interface(Interface::new(1, 1, "vn1", src))
        .with_interface(Interface::new(
            2,
            1,
            "vn1",
            Ipv4Addr::new(10, 2, 0, 1).into(),
        ));
    FlowTable::new(
        handler.flow(),
        Arc::new(FlowEntryPool::new(PoolConfig {
            init_count: 1 << 16,
            grow_size: 1 << 14,
            min_threshold: 1 << 10,
        })),
        tables,
        Arc::new(ArcSwap::from_pointee(data)),
        Arc::new(FlowDeps::default()),
        None,
    )
}

fn key(i: u64) -> FlowKey {
    FlowKey {
        vrf_id: 1,
        protocol: IpProtocol::Tcp,
        src_addr: Ipv4Addr::new(10, 1, 0, 1).into(),
        dst_addr: Ipv4Addr::new(10, 2, (i >> 8) as u8, i as u8).into(),
        src_port: (i >> 16) as u16,
        dst_port: 80,
        nh_id: 1,
    }
}

pub(super) fn bench(c: &mut Criterion) {
    let handler = ConfigHandler::new(Config::default());

    c.bench_function("flow_table_syn_flood", |b| {
        b.iter_custom(|iters| {
            let table = new_table(&handler);
            let packets = (0..iters)
                .map(|i| PktInfo::new(key(i)))
                .collect::<Vec<_>>();
            let start = Instant::now();
            for pkt in packets.iter() {
                let _ = table.process_packet(pkt);
            }
            let elapsed = start.elapsed();
            table.flush();
            elapsed
        })
    });

    c.bench_function("flow_table_established_hit", |b| {
        let table = new_table(&handler);
        let packets = (0..1024).map(|i| PktInfo::new(key(i))).collect::<Vec<_>>();
        for pkt in packets.iter() {
            let _ = table.process_packet(pkt);
        }
        b.iter_custom(|iters| {
            let start = Instant::now();
            for i in 0..iters {
                let _ = table.process_packet(&packets[i as usize & 1023]);
            }
            start.elapsed()
        })
    });
}
