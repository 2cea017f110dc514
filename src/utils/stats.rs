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
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

pub use public::counter::*;

const TICK_CYCLE: Duration = Duration::from_secs(10);

pub enum StatsOption {
    Tag(&'static str, String),
    Interval(Duration),
}

struct Source {
    module: &'static str,
    interval: Duration,
    countable: Countable,
    tags: Vec<(&'static str, String)>,
    // countdown to next metrics collection
    skip: i64,
}

impl PartialEq for Source {
    fn eq(&self, other: &Source) -> bool {
        self.module == other.module && self.tags == other.tags
    }
}

impl Eq for Source {}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{:?}", self.module, self.tags)
    }
}

#[derive(Debug)]
pub struct Batch {
    pub module: &'static str,
    pub tags: Vec<(&'static str, String)>,
    pub points: Vec<Counter>,
    pub timestamp: u32,
}

impl Batch {
    pub fn get(&self, name: &str) -> Option<CounterValue> {
        self.points
            .iter()
            .find(|(n, _, _)| *n == name)
            .map(|(_, _, v)| *v)
    }
}

impl fmt::Display for Batch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.module)?;
        for (k, v) in self.tags.iter() {
            write!(f, ",{}={}", k, v)?;
        }
        for (i, (name, _, value)) in self.points.iter().enumerate() {
            let sep = if i == 0 { ' ' } else { ',' };
            match value {
                CounterValue::Signed(v) => write!(f, "{}{}={}", sep, name, v)?,
                CounterValue::Unsigned(v) => write!(f, "{}{}={}", sep, name, v)?,
                CounterValue::Float(v) => write!(f, "{}{}={}", sep, name, v)?,
            }
        }
        Ok(())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

// Collects counters from registered sources. Batches are kept in memory and
// written to the log at debug level; transport is left to the embedder.
pub struct Collector {
    sources: Arc<Mutex<Vec<Source>>>,
    min_interval: Arc<AtomicU64>,

    running: Arc<(Mutex<bool>, Condvar)>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Collector {
    pub fn new() -> Self {
        Self::with_min_interval(TICK_CYCLE)
    }

    pub fn with_min_interval(interval: Duration) -> Self {
        let min_interval = if interval <= TICK_CYCLE {
            TICK_CYCLE
        } else {
            Duration::from_secs(
                (interval.as_secs() + TICK_CYCLE.as_secs() - 1) / TICK_CYCLE.as_secs()
                    * TICK_CYCLE.as_secs(),
            )
        };
        Self {
            sources: Arc::new(Mutex::new(vec![])),
            min_interval: Arc::new(AtomicU64::new(min_interval.as_secs())),
            running: Arc::new((Mutex::new(false), Condvar::new())),
            thread: Mutex::new(None),
        }
    }

    pub fn register_countable(
        &self,
        module: &'static str,
        countable: Countable,
        options: Vec<StatsOption>,
    ) {
        let mut source = Source {
            module,
            interval: Duration::from_secs(self.min_interval.load(Ordering::Relaxed)),
            countable,
            tags: vec![],
            skip: 0,
        };
        for option in options {
            match option {
                StatsOption::Tag(k, v) if !source.tags.iter().any(|(key, _)| key == &k) => {
                    source.tags.push((k, v))
                }
                StatsOption::Interval(interval)
                    if interval.as_secs() >= self.min_interval.load(Ordering::Relaxed) =>
                {
                    source.interval = Duration::from_secs(
                        interval.as_secs() / TICK_CYCLE.as_secs() * TICK_CYCLE.as_secs(),
                    )
                }
                _ => warn!(
                    "ignored duplicated tag or invalid interval for module {}",
                    source.module
                ),
            }
        }
        if source.interval > TICK_CYCLE {
            source.skip = ((60 - now_secs() % 60) / TICK_CYCLE.as_secs()) as i64;
        }
        let mut sources = self.sources.lock();
        sources.retain(|s| {
            let closed = s.countable.closed();
            let equals = s == &source;
            if !closed && equals {
                warn!(
                    "Found duplicated counter source {}, check that the old one is closed.",
                    source
                );
            }
            !closed && !equals
        });
        sources.push(source);
    }

    pub fn deregister_countables<I>(&self, countables: I)
    where
        I: Iterator<Item = (&'static str, Vec<StatsOption>)>,
    {
        let mut tags = vec![];
        let mut sources = self.sources.lock();
        for (module, options) in countables {
            tags.clear();
            for option in options {
                match option {
                    StatsOption::Tag(k, v) if !tags.iter().any(|(key, _)| key == &k) => {
                        tags.push((k, v))
                    }
                    _ => (),
                }
            }
            sources.retain(|s| !(s.module == module && s.tags == tags));
        }
    }

    // Reads every live source once, ignoring intervals
    pub fn snapshot(&self) -> Vec<Batch> {
        let timestamp = now_secs() as u32;
        let mut sources = self.sources.lock();
        sources.retain(|s| !s.countable.closed());
        sources
            .iter()
            .map(|s| Batch {
                module: s.module,
                tags: s.tags.clone(),
                points: s.countable.get_counters(),
                timestamp,
            })
            .collect()
    }

    fn collect_due(sources: &Mutex<Vec<Source>>) -> Vec<Batch> {
        let timestamp = now_secs() as u32;
        let mut batches = vec![];
        let mut sources = sources.lock();
        sources.retain(|s| !s.countable.closed());
        for source in sources.iter_mut() {
            source.skip -= 1;
            if source.skip > 0 {
                continue;
            }
            source.skip = (source.interval.as_secs() / TICK_CYCLE.as_secs()) as i64;
            let points = source.countable.get_counters();
            if points.is_empty() {
                continue;
            }
            batches.push(Batch {
                module: source.module,
                tags: source.tags.clone(),
                points,
                timestamp,
            });
        }
        batches
    }

    pub fn start(&self) {
        {
            let (started, _) = &*self.running;
            let mut started = started.lock();
            if *started {
                return;
            }
            *started = true;
        }

        let sources = self.sources.clone();
        let running = self.running.clone();
        let handle = thread::Builder::new()
            .name("stats-collector".to_owned())
            .spawn(move || loop {
                {
                    let (running, timer) = &*running;
                    let mut running = running.lock();
                    if !*running {
                        break;
                    }
                    timer.wait_for(&mut running, TICK_CYCLE);
                    if !*running {
                        break;
                    }
                }
                for batch in Self::collect_due(&sources) {
                    debug!("{}", batch);
                }
            });
        match handle {
            Ok(handle) => {
                self.thread.lock().replace(handle);
                info!("stats collector started");
            }
            Err(e) => warn!("stats collector thread spawn failed: {}", e),
        }
    }

    pub fn notify_stop(&self) -> Option<JoinHandle<()>> {
        let (started, timer) = &*self.running;
        {
            let mut started = started.lock();
            if !*started {
                return None;
            }
            *started = false;
        }
        timer.notify_one();
        self.thread.lock().take()
    }

    pub fn stop(&self) {
        if let Some(t) = self.notify_stop() {
            let _ = t.join();
        }
        info!("stats collector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(u64);

    impl RefCountable for Fixed {
        fn get_counters(&self) -> Vec<Counter> {
            vec![("value", CounterType::Gauged, CounterValue::Unsigned(self.0))]
        }
    }

    #[test]
    fn snapshot_skips_closed_sources() {
        let collector = Collector::new();
        let a: Arc<dyn RefCountable> = Arc::new(Fixed(1));
        let b: Arc<dyn RefCountable> = Arc::new(Fixed(2));
        collector.register_countable(
            "fixed",
            Countable::Ref(Arc::downgrade(&a)),
            vec![StatsOption::Tag("id", "a".to_owned())],
        );
        collector.register_countable(
            "fixed",
            Countable::Ref(Arc::downgrade(&b)),
            vec![StatsOption::Tag("id", "b".to_owned())],
        );
        assert_eq!(collector.snapshot().len(), 2);

        drop(a);
        let batches = collector.snapshot();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].get("value"), Some(CounterValue::Unsigned(2)));
        assert_eq!(batches[0].to_string(), "fixed,id=b value=2");
    }

    #[test]
    fn duplicated_source_replaces_old_one() {
        let collector = Collector::new();
        let a: Arc<dyn RefCountable> = Arc::new(Fixed(1));
        let b: Arc<dyn RefCountable> = Arc::new(Fixed(2));
        collector.register_countable("fixed", Countable::Ref(Arc::downgrade(&a)), vec![]);
        collector.register_countable("fixed", Countable::Ref(Arc::downgrade(&b)), vec![]);
        let batches = collector.snapshot();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].get("value"), Some(CounterValue::Unsigned(2)));

        collector.deregister_countables(vec![("fixed", vec![])].into_iter());
        assert!(collector.snapshot().is_empty());
    }
}
