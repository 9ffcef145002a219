//! Build progress tracking
//!
//! A tree of allocations summing to the whole build. Leaves advance
//! lock-free (atomic adds in fixed-point units) and a throttled emitter
//! turns the running total into log lines; nothing here blocks a step.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::logging::Logger;

/// Fixed-point denominator for the whole build (1.0 == TOTAL_UNITS).
const TOTAL_UNITS: u64 = 1_000_000;
/// Minimum milliseconds between emitted progress lines.
const EMIT_INTERVAL_MS: u64 = 200;

struct ProgressInner {
    completed: AtomicU64,
    last_emit_ms: AtomicU64,
    started: Instant,
    output: Logger,
}

impl ProgressInner {
    fn add(&self, units: u64) {
        if units == 0 {
            return;
        }
        let total = self.completed.fetch_add(units, Ordering::Relaxed) + units;
        self.maybe_emit(total);
    }

    fn maybe_emit(&self, completed: u64) {
        let now_ms = self.started.elapsed().as_millis() as u64;
        let last = self.last_emit_ms.load(Ordering::Relaxed);
        let done = completed >= TOTAL_UNITS;
        if !done && now_ms.saturating_sub(last) < EMIT_INTERVAL_MS {
            return;
        }
        // One emitter wins per interval; losers just skip the line.
        if self
            .last_emit_ms
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            let percent = (completed.min(TOTAL_UNITS) * 100) / TOTAL_UNITS;
            self.output.verbose(&format!("build progress: {}%", percent));
        }
    }
}

/// Root of the allocation tree.
#[derive(Clone)]
pub struct ProgressTracker {
    inner: Arc<ProgressInner>,
}

impl ProgressTracker {
    pub fn new(output: Logger) -> Self {
        Self {
            inner: Arc::new(ProgressInner {
                completed: AtomicU64::new(0),
                last_emit_ms: AtomicU64::new(0),
                started: Instant::now(),
                output,
            }),
        }
    }

    /// The whole build as one allocation.
    pub fn root(&self) -> Allocation {
        Allocation {
            inner: self.inner.clone(),
            units: TOTAL_UNITS,
            spent: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Completed fraction of the whole build in [0, 1].
    pub fn completed_fraction(&self) -> f64 {
        self.inner.completed.load(Ordering::Relaxed) as f64 / TOTAL_UNITS as f64
    }
}

/// A share of the build. Splitting hands parts of this share to
/// sub-operations; advancing spends it. Unspent units are flushed on drop so
/// the tree always sums to the whole.
pub struct Allocation {
    inner: Arc<ProgressInner>,
    units: u64,
    spent: Arc<AtomicU64>,
}

impl Allocation {
    /// Carve `fraction` of this allocation out for a sub-operation.
    pub fn split(&self, fraction: f64) -> Allocation {
        let units = (self.units as f64 * fraction.clamp(0.0, 1.0)) as u64;
        let units = self.reserve(units);
        Allocation {
            inner: self.inner.clone(),
            units,
            spent: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Split the remainder evenly across `parts` sub-operations.
    pub fn split_even(&self, parts: usize) -> Vec<Allocation> {
        if parts == 0 {
            return Vec::new();
        }
        let remaining = self.units - self.spent.load(Ordering::Relaxed).min(self.units);
        let share = remaining / parts as u64;
        (0..parts)
            .map(|_| {
                let units = self.reserve(share);
                Allocation {
                    inner: self.inner.clone(),
                    units,
                    spent: Arc::new(AtomicU64::new(0)),
                }
            })
            .collect()
    }

    fn reserve(&self, units: u64) -> u64 {
        let previous = self.spent.fetch_add(units, Ordering::Relaxed);
        let available = self.units.saturating_sub(previous);
        units.min(available)
    }

    /// Report `fraction` of this allocation as done.
    pub fn advance(&self, fraction: f64) {
        let units = (self.units as f64 * fraction.clamp(0.0, 1.0)) as u64;
        let granted = self.reserve(units);
        self.inner.add(granted);
    }

    /// Mark the whole allocation done.
    pub fn complete(self) {
        // Drop flushes the remainder.
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        let spent = self.spent.swap(self.units, Ordering::Relaxed);
        let remaining = self.units.saturating_sub(spent);
        self.inner.add(remaining);
    }
}
