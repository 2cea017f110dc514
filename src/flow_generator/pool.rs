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

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use log::{debug, info};
use parking_lot::{Condvar, Mutex};

use super::error::{Error, Result};
use super::flow_config::PoolConfig;
use crate::utils::stats::{Counter, CounterType, CounterValue, RefCountable};

pub trait Recyclable {
    fn reset(&mut self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    // growth happens inline on allocation
    Accepting,
    // growth is recorded and applied on resume
    Draining,
}

#[derive(Default)]
pub struct PoolCounter {
    max_count: AtomicU64,
    total_alloc: AtomicU64,
    total_free: AtomicU64,
    grow_count: AtomicU64,
    free_count: AtomicU64,
}

impl PoolCounter {
    pub fn max_count(&self) -> u64 {
        self.max_count.load(Ordering::Relaxed)
    }

    pub fn total_alloc(&self) -> u64 {
        self.total_alloc.load(Ordering::Relaxed)
    }

    pub fn total_free(&self) -> u64 {
        self.total_free.load(Ordering::Relaxed)
    }

    pub fn grow_count(&self) -> u64 {
        self.grow_count.load(Ordering::Relaxed)
    }
}

impl RefCountable for PoolCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "max-count",
                CounterType::Gauged,
                CounterValue::Unsigned(self.max_count.load(Ordering::Relaxed)),
            ),
            (
                "total-alloc",
                CounterType::Gauged,
                CounterValue::Unsigned(self.total_alloc.load(Ordering::Relaxed)),
            ),
            (
                "total-free",
                CounterType::Gauged,
                CounterValue::Unsigned(self.total_free.load(Ordering::Relaxed)),
            ),
            (
                "grow-count",
                CounterType::Gauged,
                CounterValue::Unsigned(self.grow_count.load(Ordering::Relaxed)),
            ),
            (
                "free-count",
                CounterType::Gauged,
                CounterValue::Unsigned(self.free_count.load(Ordering::Relaxed)),
            ),
        ]
    }
}

struct PoolState<T> {
    free: Vec<T>,
    admission: Admission,
    grow_pending: bool,
}

/*
 * Free list of recycled entries that only ever grows.
 *
 * Allocation that leaves fewer than `min_threshold` free entries grows the
 * pool by `grow_size`. While the pool is paused the growth is postponed to
 * `resume`, allocations are served from what is left and block once nothing
 * is left.
 */
pub struct EntryPool<T> {
    config: PoolConfig,
    state: Mutex<PoolState<T>>,
    resumed: Condvar,
    counter: Arc<PoolCounter>,
}

impl<T: Recyclable + Default> EntryPool<T> {
    pub fn new(config: PoolConfig) -> Self {
        let counter = PoolCounter::default();
        counter
            .max_count
            .store(config.init_count as u64, Ordering::Relaxed);
        counter
            .free_count
            .store(config.init_count as u64, Ordering::Relaxed);
        Self {
            config,
            state: Mutex::new(PoolState {
                free: (0..config.init_count).map(|_| T::default()).collect(),
                admission: Admission::Accepting,
                grow_pending: false,
            }),
            resumed: Condvar::new(),
            counter: Arc::new(counter),
        }
    }

    pub fn counter(&self) -> &Arc<PoolCounter> {
        &self.counter
    }

    fn grow(&self, state: &mut PoolState<T>) {
        let grow_size = self.config.grow_size;
        state.free.reserve(grow_size);
        state.free.extend((0..grow_size).map(|_| T::default()));
        let max = self
            .counter
            .max_count
            .fetch_add(grow_size as u64, Ordering::Relaxed)
            + grow_size as u64;
        self.counter.grow_count.fetch_add(1, Ordering::Relaxed);
        info!("flow pool grows by {} to {}", grow_size, max);
    }

    fn take(&self, state: &mut PoolState<T>) -> Option<T> {
        if state.free.len() <= self.config.min_threshold {
            match state.admission {
                Admission::Accepting => self.grow(state),
                Admission::Draining if !state.grow_pending => {
                    debug!("flow pool growth deferred");
                    state.grow_pending = true;
                }
                _ => (),
            }
        }
        let entry = state.free.pop()?;
        self.counter.total_alloc.fetch_add(1, Ordering::Relaxed);
        self.counter
            .free_count
            .store(state.free.len() as u64, Ordering::Relaxed);
        Some(entry)
    }

    // Blocks while the pool is draining and empty
    pub fn allocate(&self) -> T {
        let mut state = self.state.lock();
        loop {
            if let Some(entry) = self.take(&mut state) {
                return entry;
            }
            self.resumed.wait(&mut state);
        }
    }

    pub fn try_allocate(&self) -> Result<T> {
        self.take(&mut self.state.lock()).ok_or(Error::PoolDrained)
    }

    pub fn free(&self, mut entry: T) {
        entry.reset();
        let mut state = self.state.lock();
        state.free.push(entry);
        self.counter.total_free.fetch_add(1, Ordering::Relaxed);
        self.counter
            .free_count
            .store(state.free.len() as u64, Ordering::Relaxed);
    }

    pub fn pause(&self) {
        let mut state = self.state.lock();
        if state.admission == Admission::Accepting {
            info!("flow pool draining");
            state.admission = Admission::Draining;
        }
    }

    pub fn resume(&self) {
        let mut state = self.state.lock();
        state.admission = Admission::Accepting;
        if state.grow_pending {
            state.grow_pending = false;
            self.grow(&mut state);
            self.counter
                .free_count
                .store(state.free.len() as u64, Ordering::Relaxed);
        }
        drop(state);
        self.resumed.notify_all();
    }

    pub fn admission(&self) -> Admission {
        self.state.lock().admission
    }

    pub fn grow_pending(&self) -> bool {
        self.state.lock().grow_pending
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    pub fn max_count(&self) -> usize {
        self.counter.max_count() as usize
    }
}
