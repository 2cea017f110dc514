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

pub mod nexthop;
pub mod registry;
pub mod table;

pub use nexthop::{GroupId, Member, NextHop, NextHopGroup, Tunnel};
pub use registry::NhRegistry;
pub use table::{NhSpec, RouteChange, RouteEntry, RouteTables, RouteUpdate};

use ipnet::IpNet;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("route {0} has an empty next-hop group")]
    EmptyGroup(IpNet),
    #[error("interface next-hop id {0} out of range")]
    InvalidInterfaceNh(u32),
    #[error("next-hop group id space exhausted")]
    GroupIdExhausted,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
