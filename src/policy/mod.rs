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

pub mod acl;
pub mod action;
pub mod firewall;
pub mod policy;

pub use acl::{Acl, AclEntry, AddrMatch, SecurityGroup};
pub use action::ActionBits;
pub use firewall::{
    ApplicationPolicySet, EndpointMatch, FirewallPolicy, FirewallRule, FirewallVerdict,
    RuleDirection, ServiceMatch, TagSet,
};
pub use policy::{evaluate, LegPolicy, PolicyResult};

use std::net::IpAddr;

// One side of a flow as seen by the policy layers
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Endpoint {
    pub addr: Option<IpAddr>,
    pub port: u16,
    pub vn: Vec<String>,
    pub sg_ids: Vec<u32>,
    pub tags: TagSet,
    // set when the endpoint is a local interface
    pub intf_id: Option<u32>,
}

impl Endpoint {
    pub fn in_vn(&self, name: &str) -> bool {
        self.vn.iter().any(|v| v == name)
    }

    pub fn primary_vn(&self) -> Option<&str> {
        self.vn.first().map(|s| s.as_str())
    }
}
