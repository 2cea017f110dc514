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

use thiserror::Error;

use crate::common::FlowKey;

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("flow pool is draining and has no free entry")]
    PoolDrained,
    #[error("flow limit {0} reached")]
    FlowLimit(usize),
    #[error("flow pair {0} not found")]
    FlowNotFound(u64),
    #[error("flow key {0} is contended, giving up after {1} attempts")]
    InstallContention(FlowKey, usize),
    #[error("no flow worker for shard {0}")]
    NoWorker(usize),
    #[error("flow worker queue terminated")]
    QueueTerminated,
    #[error("route update failed: {0}")]
    Route(#[from] crate::route::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
