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
use std::net::{IpAddr, Ipv4Addr};

use public::enums::{IpProtocol, TcpFlags};

use crate::utils::hasher::{ip_to_u64, jenkins64, jenkins64_words};

/*
    FlowKey uniquely identifies one direction of a flow. nh_id is the ingress
    next-hop: the interface id for packets from a local port, the next-hop id
    of the source route for packets received from the fabric.
*/
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct FlowKey {
    pub vrf_id: u32,
    pub protocol: IpProtocol,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub nh_id: u32,
}

impl Default for FlowKey {
    fn default() -> Self {
        Self {
            vrf_id: 0,
            protocol: IpProtocol::default(),
            src_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_port: 0,
            dst_port: 0,
            nh_id: 0,
        }
    }
}

impl FlowKey {
    fn l3_hash(&self) -> u64 {
        let (src, dst) = (ip_to_u64(&self.src_addr), ip_to_u64(&self.dst_addr));
        if src >= dst {
            src.rotate_left(32) ^ dst
        } else {
            dst.rotate_left(32) ^ src
        }
    }

    fn l4_hash(&self) -> u64 {
        if self.src_port >= self.dst_port {
            (self.src_port as u64) << 16 | self.dst_port as u64
        } else {
            (self.dst_port as u64) << 16 | self.src_port as u64
        }
    }

    // Direction symmetric, both legs of a non NAT flow hash to the same value
    pub fn shard_hash(&self) -> u64 {
        jenkins64(self.l3_hash() ^ (u8::from(self.protocol) as u64) << 48 ^ self.l4_hash())
    }

    pub fn shard(&self, count: usize) -> usize {
        if count <= 1 {
            return 0;
        }
        (self.shard_hash() % count as u64) as usize
    }

    // Direction sensitive 5-tuple hash used for ECMP member selection
    pub fn five_tuple_hash(&self) -> u64 {
        jenkins64_words(&[
            ip_to_u64(&self.src_addr),
            ip_to_u64(&self.dst_addr),
            u8::from(self.protocol) as u64,
            (self.src_port as u64) << 16 | self.dst_port as u64,
        ])
    }

    pub fn is_tcp(&self) -> bool {
        self.protocol == IpProtocol::Tcp
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "vrf:{} {} {}:{} > {}:{} nh:{}",
            self.vrf_id,
            self.protocol,
            self.src_addr,
            self.src_port,
            self.dst_addr,
            self.dst_port,
            self.nh_id
        )
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TrapReason {
    FlowMiss,
    // dataplane asks for a new ECMP member, the suggested one is in ecmp_hint
    EcmpResolve,
    PolicyTrapRetry,
}

impl Default for TrapReason {
    fn default() -> Self {
        TrapReason::FlowMiss
    }
}

// Normalized packet handed over by the parser
#[derive(Debug, Clone, Default)]
pub struct PktInfo {
    pub key: FlowKey,
    pub tunnel_label: Option<u32>,
    // outer source address for packets received over a tunnel
    pub tunnel_src: Option<IpAddr>,
    pub tcp_flags: TcpFlags,
    pub ecmp_hint: Option<u32>,
    pub trap: TrapReason,
    pub len: u32,
}

impl PktInfo {
    pub fn new(key: FlowKey) -> Self {
        Self {
            key,
            ..Default::default()
        }
    }
}
