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

use std::net::IpAddr;

// Jenkins Wiki: https://en.wikipedia.org/wiki/Jenkins_hash_function
// 64-bit integer mix: http://burtleburtle.net/bob/hash/integer.html
//
// Flipping any input bit flips about half of the output bits, so folding the
// result modulo a small member count spreads flows evenly.
pub fn jenkins64(mut hash: u64) -> u64 {
    hash = hash
        .overflowing_shl(21)
        .0
        .overflowing_sub(hash)
        .0
        .overflowing_sub(1)
        .0;
    hash = hash ^ hash.overflowing_shr(24).0;
    hash = hash
        .overflowing_add(hash.overflowing_shl(3).0)
        .0
        .overflowing_add(hash.overflowing_shl(8).0)
        .0;
    hash = hash ^ hash.overflowing_shr(14).0;
    hash = hash
        .overflowing_add(hash.overflowing_shl(2).0)
        .0
        .overflowing_add(hash.overflowing_shl(4).0)
        .0;
    hash = hash ^ hash.overflowing_shr(28).0;
    hash = hash.overflowing_add(hash.overflowing_shl(31).0).0;

    hash
}

pub fn ip_to_u64(ip: &IpAddr) -> u64 {
    match ip {
        IpAddr::V4(v4) => u32::from(*v4) as u64,
        IpAddr::V6(v6) => {
            let v = u128::from(*v6);
            (v >> 64) as u64 ^ v as u64
        }
    }
}

// Chains jenkins64 over every word, the order of words matters
pub fn jenkins64_words(words: &[u64]) -> u64 {
    words
        .iter()
        .fold(0x9e3779b97f4a7c15u64, |acc, w| jenkins64(acc ^ *w))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assert_jenkins64() {
        assert_eq!(
            jenkins64(1281291242888) ^ jenkins64(122345676892),
            17281198411619148719
        );
    }

    #[test]
    fn words_are_order_sensitive() {
        let a = jenkins64_words(&[1, 2, 3]);
        assert_eq!(a, jenkins64_words(&[1, 2, 3]));
        assert_ne!(a, jenkins64_words(&[3, 2, 1]));
    }

    #[test]
    fn ipv6_folds_both_halves() {
        let a: IpAddr = "2001:db8::1".parse().unwrap();
        let b: IpAddr = "2001:db9::1".parse().unwrap();
        assert_ne!(ip_to_u64(&a), ip_to_u64(&b));
        let c: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(ip_to_u64(&c), 0x0a000001);
    }
}
