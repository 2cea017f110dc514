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

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::Error;
use crate::counter as stats;

pub fn bounded<T>(size: usize) -> (Sender<T>, Receiver<T>, StatsHandle<T>) {
    let queue = Arc::new(BoundedQueue::with_capacity(size));
    (
        Sender {
            queue: queue.clone(),
        },
        Receiver {
            queue: queue.clone(),
        },
        StatsHandle { queue },
    )
}

#[derive(Debug, Default)]
pub struct Counter {
    pub input: AtomicU64,
    pub output: AtomicU64,
    // times a sender waited for free space
    pub blocked: AtomicU64,
}

// fixed size MPMC queue, senders block while the queue is full
struct BoundedQueue<T> {
    size: usize,
    buffer: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    not_full: Condvar,

    senders: AtomicUsize,
    terminated: AtomicBool,

    counter: Counter,
}

impl<T> BoundedQueue<T> {
    fn with_capacity(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            buffer: Mutex::new(VecDeque::with_capacity(size)),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            senders: AtomicUsize::new(1),
            terminated: AtomicBool::new(false),
            counter: Counter::default(),
        }
    }

    fn terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    fn send_batch(&self, msgs: &mut Vec<T>, timeout: Option<Duration>) -> Result<(), Error<T>> {
        if msgs.len() > self.size {
            return Err(Error::BatchTooLarge(None));
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut buffer = self.buffer.lock();
        loop {
            if self.terminated() {
                return Err(Error::Terminated(None, None));
            }
            if buffer.len() + msgs.len() <= self.size {
                break;
            }
            self.counter.blocked.fetch_add(1, Ordering::Relaxed);
            match deadline {
                Some(d) => {
                    if self.not_full.wait_until(&mut buffer, d).timed_out() {
                        return Err(Error::Timeout);
                    }
                }
                None => self.not_full.wait(&mut buffer),
            }
        }
        self.counter
            .input
            .fetch_add(msgs.len() as u64, Ordering::Relaxed);
        buffer.extend(msgs.drain(..));
        self.not_empty.notify_all();
        Ok(())
    }

    fn recv_batch(&self, n: usize, timeout: Option<Duration>) -> Result<Vec<T>, Error<T>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut buffer = self.buffer.lock();
        while buffer.is_empty() {
            if self.terminated() {
                return Err(Error::Terminated(None, None));
            }
            match deadline {
                Some(d) => {
                    if self.not_empty.wait_until(&mut buffer, d).timed_out() && buffer.is_empty() {
                        return Err(Error::Timeout);
                    }
                }
                None => self.not_empty.wait(&mut buffer),
            }
        }
        let count = n.min(buffer.len());
        let msgs: Vec<T> = buffer.drain(..count).collect();
        self.counter
            .output
            .fetch_add(count as u64, Ordering::Relaxed);
        self.not_full.notify_all();
        Ok(msgs)
    }

    fn close(&self) {
        let _lock = self.buffer.lock();
        self.terminated.store(true, Ordering::Release);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    fn pending(&self) -> usize {
        self.buffer.lock().len()
    }
}

pub struct Sender<T> {
    queue: Arc<BoundedQueue<T>>,
}

impl<T> Sender<T> {
    pub fn terminated(&self) -> bool {
        self.queue.terminated()
    }

    pub fn send(&self, msg: T) -> Result<(), Error<T>> {
        let mut msgs = vec![msg];
        match self.queue.send_batch(&mut msgs, None) {
            Ok(_) => Ok(()),
            Err(Error::Terminated(..)) => Err(Error::Terminated(msgs.pop(), None)),
            Err(e) => Err(e),
        }
    }

    pub fn send_timeout(&self, msg: T, timeout: Duration) -> Result<(), Error<T>> {
        let mut msgs = vec![msg];
        match self.queue.send_batch(&mut msgs, Some(timeout)) {
            Ok(_) => Ok(()),
            Err(Error::Terminated(..)) => Err(Error::Terminated(msgs.pop(), None)),
            Err(e) => Err(e),
        }
    }

    // This method clears the Vec on success, and leave it as it is on failure
    pub fn send_all(&self, msgs: &mut Vec<T>) -> Result<(), Error<T>> {
        self.queue.send_batch(msgs, None)
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.queue.senders.fetch_add(1, Ordering::Relaxed);
        Sender {
            queue: self.queue.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        // last sender to drop
        if self.queue.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.queue.close();
        }
    }
}

pub struct Receiver<T> {
    queue: Arc<BoundedQueue<T>>,
}

impl<T> Receiver<T> {
    pub fn terminated(&self) -> bool {
        self.queue.terminated()
    }

    pub fn recv(&self, timeout: Option<Duration>) -> Result<T, Error<T>> {
        let mut msgs = self.queue.recv_batch(1, timeout)?;
        msgs.pop().ok_or(Error::Timeout)
    }

    pub fn recv_n(&self, n: usize, timeout: Option<Duration>) -> Result<Vec<T>, Error<T>> {
        assert!(n > 0);
        self.queue.recv_batch(n, timeout)
    }

    // drains whatever is pending without waiting
    pub fn try_recv_all(&self) -> Vec<T> {
        let mut buffer = self.queue.buffer.lock();
        let msgs: Vec<T> = buffer.drain(..).collect();
        self.queue
            .counter
            .output
            .fetch_add(msgs.len() as u64, Ordering::Relaxed);
        self.queue.not_full.notify_all();
        msgs
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.queue.close();
    }
}

pub struct StatsHandle<T> {
    queue: Arc<BoundedQueue<T>>,
}

impl<T: Send> stats::OwnedCountable for StatsHandle<T> {
    fn get_counters(&self) -> Vec<stats::Counter> {
        let queue = &self.queue;
        vec![
            (
                "in",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(queue.counter.input.swap(0, Ordering::Relaxed)),
            ),
            (
                "out",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(queue.counter.output.swap(0, Ordering::Relaxed)),
            ),
            (
                "blocked",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(queue.counter.blocked.swap(0, Ordering::Relaxed)),
            ),
            (
                "pending",
                stats::CounterType::Gauged,
                stats::CounterValue::Unsigned(queue.pending() as u64),
            ),
        ]
    }

    fn closed(&self) -> bool {
        self.queue.terminated()
    }
}
