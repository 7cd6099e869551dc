use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Counters updated by the pipeline workers
#[derive(Default)]
pub struct PipelineStats {
    pub processed: AtomicU64,
    pub written: AtomicU64,
    pub skipped: AtomicU64,
    pub failed: AtomicU64,
    pub retries: AtomicU64,
    pub contents_written: AtomicU64,
    pub references_written: AtomicU64,
    pub references_unresolved: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub written: u64,
    pub skipped: u64,
    pub failed: u64,
    pub retries: u64,
    pub contents_written: u64,
    pub references_written: u64,
    pub references_unresolved: u64,
}

impl std::ops::Add for StatsSnapshot {
    type Output = StatsSnapshot;

    fn add(self, other: StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed + other.processed,
            written: self.written + other.written,
            skipped: self.skipped + other.skipped,
            failed: self.failed + other.failed,
            retries: self.retries + other.retries,
            contents_written: self.contents_written + other.contents_written,
            references_written: self.references_written + other.references_written,
            references_unresolved: self.references_unresolved + other.references_unresolved,
        }
    }
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_written(&self) {
        self.written.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_contents(&self) {
        self.contents_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_references(&self, count: u64) {
        self.references_written.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_unresolved(&self, count: u64) {
        self.references_unresolved
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            contents_written: self.contents_written.load(Ordering::Relaxed),
            references_written: self.references_written.load(Ordering::Relaxed),
            references_unresolved: self.references_unresolved.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    completions: u64,
    elapsed: Duration,
}

impl Bucket {
    fn velocity(&self) -> Option<f64> {
        let secs = self.elapsed.as_secs_f64();
        (self.completions > 0 && secs > 0.0).then(|| self.completions as f64 / secs)
    }
}

struct VelocityState {
    last: Instant,
    current: Option<u8>,
    buckets: [Bucket; 101],
}

/// Throughput (completions per second) bucketed by the share of workers that
/// were busy when each item completed, 1% to 100%.
///
/// The wall time between two completions is credited to the bucket of the
/// later one.
pub struct VelocityTracker {
    state: Mutex<VelocityState>,
}

impl Default for VelocityTracker {
    fn default() -> Self {
        Self::starting_at(Instant::now())
    }
}

impl VelocityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn starting_at(start: Instant) -> Self {
        Self {
            state: Mutex::new(VelocityState {
                last: start,
                current: None,
                buckets: [Bucket::default(); 101],
            }),
        }
    }

    /// Percentage of `capacity` that `busy` represents, clamped to 1..=100.
    pub fn percentile(busy: usize, capacity: usize) -> u8 {
        if capacity == 0 {
            return 100;
        }
        let pct = (busy * 100).div_ceil(capacity);
        pct.clamp(1, 100) as u8
    }

    pub fn record(&self, busy: usize, capacity: usize) {
        self.record_at(Self::percentile(busy, capacity), Instant::now());
    }

    fn record_at(&self, percentile: u8, now: Instant) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = now.saturating_duration_since(state.last);
        state.last = now;
        state.current = Some(percentile);
        let bucket = &mut state.buckets[percentile as usize];
        bucket.completions += 1;
        bucket.elapsed += elapsed;
    }

    /// Percentile of the latest completion and the velocity measured there.
    pub fn current(&self) -> Option<(u8, f64)> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let pct = state.current?;
        state.buckets[pct as usize].velocity().map(|v| (pct, v))
    }

    /// Velocity per percentile, ascending, skipping buckets without a measurement.
    pub fn histogram(&self) -> Vec<(u8, f64)> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        (1..=100u8)
            .filter_map(|pct| state.buckets[pct as usize].velocity().map(|v| (pct, v)))
            .collect()
    }
}
