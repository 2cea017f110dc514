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

use bitflags::bitflags;

bitflags! {
    #[derive(Default)]
    pub struct ActionBits: u16 {
        const PASS = 1 << 0;
        const DENY = 1 << 1;
        const DROP = 1 << 2;
        const TRAP = 1 << 3;
        // no rule matched, the deny is implicit
        const IMPLICIT_DENY = 1 << 4;
        // destination resolved in the vrf picked by a vrf assign acl
        const VRF_TRANSLATE = 1 << 5;

        const DROP_MASK = Self::DENY.bits | Self::DROP.bits | Self::IMPLICIT_DENY.bits;
    }
}

impl ActionBits {
    pub fn drops(&self) -> bool {
        self.intersects(Self::DROP_MASK)
    }

    pub fn passes(&self) -> bool {
        !self.is_empty() && !self.drops()
    }

    // Deny when any evaluated layer denies, pass otherwise
    pub fn enforced(&self) -> ActionBits {
        if self.drops() {
            ActionBits::DENY
        } else {
            ActionBits::PASS
        }
    }

    // Final action of a leg: drop wins over pass, a pending trap wins over both
    pub fn finalize(self) -> ActionBits {
        let mut action = self;
        if action.drops() {
            action.remove(ActionBits::PASS | ActionBits::DROP | ActionBits::VRF_TRANSLATE);
            action.insert(ActionBits::DENY);
        }
        if action.contains(ActionBits::TRAP) {
            action = ActionBits::TRAP | (action & ActionBits::DENY);
        }
        action
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enforced_action() {
        assert_eq!(ActionBits::PASS.enforced(), ActionBits::PASS);
        assert_eq!((ActionBits::PASS | ActionBits::DENY).enforced(), ActionBits::DENY);
        assert_eq!(ActionBits::IMPLICIT_DENY.enforced(), ActionBits::DENY);
        assert!(!ActionBits::empty().passes());
        assert!((ActionBits::PASS | ActionBits::TRAP).passes());
    }

    #[test]
    fn finalize_keeps_deny_with_trap() {
        assert_eq!(
            (ActionBits::PASS | ActionBits::DROP).finalize(),
            ActionBits::DENY
        );
        assert_eq!(
            (ActionBits::DENY | ActionBits::TRAP).finalize(),
            ActionBits::DENY | ActionBits::TRAP
        );
        assert_eq!(
            (ActionBits::PASS | ActionBits::TRAP).finalize(),
            ActionBits::TRAP
        );
        assert_eq!(ActionBits::PASS.finalize(), ActionBits::PASS);
        assert_eq!(
            (ActionBits::PASS | ActionBits::VRF_TRANSLATE).finalize(),
            ActionBits::PASS | ActionBits::VRF_TRANSLATE
        );
        assert_eq!(
            (ActionBits::DENY | ActionBits::VRF_TRANSLATE).finalize(),
            ActionBits::DENY
        );
    }
}
