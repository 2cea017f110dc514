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

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

// IpProtocol is an enumeration of IP protocol values, and acts as a decoder
// for any type it supports.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
#[serde(from = "u8", into = "u8")]
pub enum IpProtocol {
    Icmpv4,
    Ipv4,
    Tcp,
    Udp,
    Ipv6,
    Gre,
    Icmpv6,
    Sctp,
    Unknown(u8),
}

impl IpProtocol {
    const ICMPV4: u8 = 1;
    const IPV4: u8 = 4;
    const TCP: u8 = 6;
    const UDP: u8 = 17;
    const IPV6: u8 = 41;
    const GRE: u8 = 47;
    const ICMPV6: u8 = 58;
    const SCTP: u8 = 132;

    pub fn is_icmp(&self) -> bool {
        matches!(self, IpProtocol::Icmpv4 | IpProtocol::Icmpv6)
    }
}

impl Default for IpProtocol {
    fn default() -> Self {
        IpProtocol::Unknown(0)
    }
}

impl From<u8> for IpProtocol {
    fn from(protocol: u8) -> Self {
        match protocol {
            Self::ICMPV4 => Self::Icmpv4,
            Self::IPV4 => Self::Ipv4,
            Self::TCP => Self::Tcp,
            Self::UDP => Self::Udp,
            Self::IPV6 => Self::Ipv6,
            Self::GRE => Self::Gre,
            Self::ICMPV6 => Self::Icmpv6,
            Self::SCTP => Self::Sctp,
            p => Self::Unknown(p),
        }
    }
}

impl From<IpProtocol> for u8 {
    fn from(protocol: IpProtocol) -> Self {
        match protocol {
            IpProtocol::Icmpv4 => IpProtocol::ICMPV4,
            IpProtocol::Ipv4 => IpProtocol::IPV4,
            IpProtocol::Tcp => IpProtocol::TCP,
            IpProtocol::Udp => IpProtocol::UDP,
            IpProtocol::Ipv6 => IpProtocol::IPV6,
            IpProtocol::Gre => IpProtocol::GRE,
            IpProtocol::Icmpv6 => IpProtocol::ICMPV6,
            IpProtocol::Sctp => IpProtocol::SCTP,
            IpProtocol::Unknown(p) => p,
        }
    }
}

impl PartialEq<u8> for IpProtocol {
    fn eq(&self, other: &u8) -> bool {
        u8::from(*self).eq(other)
    }
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IpProtocol::Unknown(p) => write!(f, "{}", p),
            p => write!(f, "{:?}", p),
        }
    }
}

bitflags! {
    #[derive(Default)]
    pub struct TcpFlags: u8 {
        const FIN = 0b000001;
        const SYN = 0b000010;
        const RST = 0b000100;
        const PSH = 0b001000;
        const ACK = 0b010000;
        const URG = 0b100000;
        const MASK = 0x3F;

        const SYN_ACK = Self::SYN.bits | Self::ACK.bits;
        const FIN_ACK = Self::FIN.bits | Self::ACK.bits;
        const RST_ACK = Self::RST.bits | Self::ACK.bits;
    }
}

impl TcpFlags {
    // ACK without SYN, the segment belongs to an already opened connection
    pub fn is_established_ack(&self) -> bool {
        self.contains(TcpFlags::ACK) && !self.contains(TcpFlags::SYN)
    }

    pub fn is_closing(&self) -> bool {
        self.intersects(TcpFlags::FIN | TcpFlags::RST)
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bit_strs = vec![];
        if self.contains(Self::FIN) {
            bit_strs.push("FIN");
        }
        if self.contains(Self::SYN) {
            bit_strs.push("SYN");
        }
        if self.contains(Self::RST) {
            bit_strs.push("RST");
        }
        if self.contains(Self::PSH) {
            bit_strs.push("PSH");
        }
        if self.contains(Self::ACK) {
            bit_strs.push("ACK");
        }
        if self.contains(Self::URG) {
            bit_strs.push("URG");
        }
        write!(f, "{}", bit_strs.join("-"))
    }
}

#[derive(
    Serialize,
    Deserialize,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Clone,
    Copy,
    TryFromPrimitive,
    IntoPrimitive,
)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum TunnelType {
    MplsGre = 1,
    MplsUdp = 2,
    Vxlan = 3,
}

impl Default for TunnelType {
    fn default() -> Self {
        TunnelType::MplsGre
    }
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TunnelType::MplsGre => write!(f, "MPLSoGRE"),
            TunnelType::MplsUdp => write!(f, "MPLSoUDP"),
            TunnelType::Vxlan => write!(f, "VXLAN"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_protocol_round_trip() {
        assert_eq!(IpProtocol::from(6), IpProtocol::Tcp);
        assert_eq!(u8::from(IpProtocol::Icmpv4), 1);
        assert_eq!(IpProtocol::from(200), IpProtocol::Unknown(200));
        assert!(IpProtocol::Icmpv6.is_icmp());
    }

    #[test]
    fn established_ack() {
        assert!(TcpFlags::ACK.is_established_ack());
        assert!((TcpFlags::PSH | TcpFlags::ACK).is_established_ack());
        assert!(!TcpFlags::SYN_ACK.is_established_ack());
        assert!(!TcpFlags::SYN.is_established_ack());
        assert_eq!(TcpFlags::SYN_ACK.to_string(), "SYN-ACK");
    }

    #[test]
    fn tunnel_type_primitive() {
        assert_eq!(TunnelType::try_from(3u8).unwrap(), TunnelType::Vxlan);
        assert!(TunnelType::try_from(9u8).is_err());
    }
}
