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

pub mod ecmp;
pub mod error;
pub mod flow_config;
mod flow_entry;
mod flow_info;
pub mod flow_mgmt;
pub mod flow_proto;
pub mod flow_table;
pub mod nat;
pub mod pool;
pub mod rpf;

pub use ecmp::{EcmpChoice, EcmpInput};
pub use error::{Error, Result};
pub use flow_config::{FlowTimeout, PoolConfig};
pub use flow_entry::{
    FlowEntry, FlowEntryPool, FlowFlags, FlowHandle, FlowPair, Leg, ShortReason,
    INVALID_ECMP_INDEX,
};
pub use flow_info::{is_link_local, FlowInfo, PreviousState, ResolveContext};
pub use flow_mgmt::{DepKey, EventDispatcher, FlowDeps, FlowMgmt, PendingOp};
pub use flow_proto::{FlowEvent, FlowProto};
pub use flow_table::{FlowTable, KeyStats};
pub use nat::{resolve_dnat, resolve_snat, NatKind, SnatMatch, Translation};
pub use pool::{Admission, EntryPool, Recyclable};
