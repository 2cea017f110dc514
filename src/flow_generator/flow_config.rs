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

use std::time::Duration;

use public::enums::IpProtocol;
use serde::Deserialize;

pub const DEFAULT_POOL_INIT_COUNT: usize = 50000;
pub const DEFAULT_POOL_GROW_SIZE: usize = 1000;
pub const DEFAULT_POOL_MIN_THRESHOLD: usize = 2000;

pub const TIMEOUT_TCP: Duration = Duration::from_secs(180);
pub const TIMEOUT_UDP: Duration = Duration::from_secs(60);
pub const TIMEOUT_ICMP: Duration = Duration::from_secs(30);
pub const TIMEOUT_SHORT: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct PoolConfig {
    pub init_count: usize,
    pub grow_size: usize,
    // growth starts once the free list drops below this
    pub min_threshold: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            init_count: DEFAULT_POOL_INIT_COUNT,
            grow_size: DEFAULT_POOL_GROW_SIZE,
            min_threshold: DEFAULT_POOL_MIN_THRESHOLD,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FlowTimeout {
    #[serde(with = "humantime_serde")]
    pub tcp: Duration,
    #[serde(with = "humantime_serde")]
    pub udp: Duration,
    #[serde(with = "humantime_serde")]
    pub icmp: Duration,
    #[serde(with = "humantime_serde")]
    pub short: Duration,
}

impl Default for FlowTimeout {
    fn default() -> Self {
        Self {
            tcp: TIMEOUT_TCP,
            udp: TIMEOUT_UDP,
            icmp: TIMEOUT_ICMP,
            short: TIMEOUT_SHORT,
        }
    }
}

impl FlowTimeout {
    pub fn idle_timeout(&self, protocol: IpProtocol, short: bool) -> Duration {
        if short {
            return self.short;
        }
        match protocol {
            IpProtocol::Tcp => self.tcp,
            IpProtocol::Icmpv4 | IpProtocol::Icmpv6 => self.icmp,
            _ => self.udp,
        }
    }
}
