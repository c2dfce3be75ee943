use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

pub const RECORDS_IN: &str = "recordsIn";
pub const RECORDS_OUT: &str = "recordsOut";
pub const TIME_ELAPSED: &str = "timeElapsed";

/// The statistics of a plugin, as a set of named counters and timers.
///
/// Cloning a `PluginMetrics` is cheap and the clones share the same metrics.
#[derive(Clone)]
pub struct PluginMetrics {
    plugin_name: Arc<str>,
    counters: Arc<Mutex<BTreeMap<String, Arc<Counter>>>>,
    timers: Arc<Mutex<BTreeMap<String, Arc<Timer>>>>,
}

#[derive(Default)]
pub struct Counter {
    count: AtomicU64,
}

#[derive(Default)]
pub struct Timer {
    stats: Mutex<Option<DurationStats>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DurationStats {
    pub count: u64,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl PluginMetrics {
    pub fn new(plugin_name: impl AsRef<str>) -> Self {
        PluginMetrics {
            plugin_name: Arc::from(plugin_name.as_ref()),
            counters: Arc::default(),
            timers: Arc::default(),
        }
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// Return the counter registered under that name, creating it if needed
    pub fn counter(&self, name: &str) -> Arc<Counter> {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Return the timer registered under that name, creating it if needed
    pub fn timer(&self, name: &str) -> Arc<Timer> {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Current value of all the counters
    pub fn counts(&self) -> BTreeMap<String, u64> {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, counter)| (name.clone(), counter.count()))
            .collect()
    }

    pub fn dump_processing_stats(&self) {
        tracing::info!(target: "metrics", "Processing statistics of {}:", self.plugin_name);
        for (name, count) in self.counts() {
            tracing::info!(target: "metrics", "    - {name}: {count}");
        }
        let timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        for (name, timer) in timers.iter() {
            if let Some(stats) = timer.stats() {
                tracing::info!(target: "metrics", "    - {name}: {stats}");
            }
        }
    }
}

impl Counter {
    pub fn increment(&self) {
        self.increment_by(1)
    }

    pub fn increment_by(&self, count: u64) {
        self.count.fetch_add(count, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Timer {
    pub fn record(&self, duration: Duration) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        match stats.as_mut() {
            None => *stats = Some(DurationStats::new(duration)),
            Some(stats) => stats.add(duration),
        }
    }

    /// Run `f`, recording how long it took
    pub fn time<R>(&self, f: impl FnOnce() -> R) -> R {
        let started_at = Instant::now();
        let result = f();
        self.record(started_at.elapsed());
        result
    }

    pub fn stats(&self) -> Option<DurationStats> {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DurationStats {
    pub fn new(duration: Duration) -> Self {
        DurationStats {
            count: 1,
            total: duration,
            min: duration,
            max: duration,
        }
    }

    pub fn add(&mut self, duration: Duration) {
        self.count += 1;
        self.total += duration;
        if duration < self.min {
            self.min = duration;
        }
        if self.max < duration {
            self.max = duration;
        }
    }
}

impl Display for DurationStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "count={} total={:?} min={:?} max={:?}",
            self.count, self.total, self.min, self.max
        )
    }
}
