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

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PortRange(u32);

impl PortRange {
    pub const ANY: PortRange = PortRange(0xffff);

    pub fn new(min: u16, max: u16) -> PortRange {
        PortRange((min as u32) << 16 | max as u32)
    }

    pub fn single(port: u16) -> PortRange {
        Self::new(port, port)
    }

    pub fn min(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn max(&self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    pub fn contains(&self, port: u16) -> bool {
        self.min() <= port && port <= self.max()
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self::ANY
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min(), self.max())
    }
}

impl TryFrom<&str> for PortRange {
    type Error = String;

    fn try_from(f: &str) -> Result<Self, Self::Error> {
        let parse = |s: &str| {
            s.trim()
                .parse::<u16>()
                .map_err(|e| format!("Invalid port {}: {}", f, e))
        };
        match f.split_once('-') {
            None => parse(f).map(PortRange::single),
            Some((min, max)) => {
                let (min, max) = (parse(min)?, parse(max)?);
                if min > max {
                    return Err(format!("Invalid port range {}", f));
                }
                Ok(PortRange::new(min, max))
            }
        }
    }
}
