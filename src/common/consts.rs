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

pub const DEFAULT_LOG_FILE: &str = "/var/log/vrouter-agent/vrouter-agent.log";
pub const DEFAULT_CONF_FILE: &str = "/etc/vrouter-agent.yaml";
pub const DEFAULT_LOG_RETENTION: u32 = 30;

// Next-hop id space, interface next-hops reuse the interface id
pub const MAX_INTERFACE_NH_ID: u32 = (1 << 20) - 1;
pub const TUNNEL_NH_ID_BASE: u32 = 1 << 20;
pub const GROUP_NH_ID_BASE: u32 = 1 << 24;
