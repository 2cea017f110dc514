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

use std::sync::Weak;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CounterType {
    Counted,
    Gauged,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CounterValue {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
}

impl CounterValue {
    pub fn as_u64(&self) -> u64 {
        match *self {
            CounterValue::Signed(v) => v as u64,
            CounterValue::Unsigned(v) => v,
            CounterValue::Float(v) => v as u64,
        }
    }
}

pub type Counter = (&'static str, CounterType, CounterValue);

pub trait RefCountable: Send + Sync {
    fn get_counters(&self) -> Vec<Counter>;
}

pub trait OwnedCountable: Send + Sync {
    fn get_counters(&self) -> Vec<Counter>;
    fn closed(&self) -> bool;
}

pub enum Countable {
    Owned(Box<dyn OwnedCountable>),
    Ref(Weak<dyn RefCountable>),
}

impl Countable {
    pub fn get_counters(&self) -> Vec<Counter> {
        match self {
            Countable::Owned(c) => c.get_counters(),
            Countable::Ref(c) => c.upgrade().map(|c| c.get_counters()).unwrap_or_default(),
        }
    }

    pub fn closed(&self) -> bool {
        match self {
            Countable::Owned(c) => c.closed(),
            Countable::Ref(c) => c.strong_count() == 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    struct Fixed(u64);

    impl RefCountable for Fixed {
        fn get_counters(&self) -> Vec<Counter> {
            vec![("fixed", CounterType::Gauged, CounterValue::Unsigned(self.0))]
        }
    }

    #[test]
    fn ref_countable_closes_with_owner() {
        let owner: Arc<dyn RefCountable> = Arc::new(Fixed(7));
        let countable = Countable::Ref(Arc::downgrade(&owner));
        assert!(!countable.closed());
        assert_eq!(countable.get_counters()[0].2.as_u64(), 7);

        drop(owner);
        assert!(countable.closed());
        assert!(countable.get_counters().is_empty());
    }
}
