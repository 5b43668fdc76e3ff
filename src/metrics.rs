//! `MetricsCollector` (§9, AMBIENT STACK): a small interface plus an
//! in-memory implementation — counters and a rolling p95-style duration
//! reservoir per phase. The real Prometheus exporter is out of scope per
//! §1; this defines the seam and a process-local implementation good enough
//! for `state inspect` to print a summary. No direct teacher precedent
//! beyond the phase-timing `Instant`/`elapsed()` idiom in the orchestrator
//! runner, so the reservoir itself is a plain capped `VecDeque<Duration>`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use vigil_common::Phase;

const RESERVOIR_CAP: usize = 200;

#[derive(Default)]
struct PhaseStats {
    durations: VecDeque<Duration>,
    count: u64,
    errors: u64,
}

#[derive(Default)]
struct Inner {
    phases: HashMap<Phase, PhaseStats>,
    counters: HashMap<&'static str, u64>,
}

/// Process-local metrics store. A Prometheus exporter (out of scope) would
/// wrap an instance of this and translate `snapshot()` into a `/metrics`
/// text response.
pub struct MetricsCollector {
    inner: Mutex<Inner>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }

    pub fn record_phase(&self, phase: Phase, duration: Duration, is_error: bool) {
        let mut guard = self.inner.lock().unwrap();
        let stats = guard.phases.entry(phase).or_default();
        stats.durations.push_back(duration);
        while stats.durations.len() > RESERVOIR_CAP {
            stats.durations.pop_front();
        }
        stats.count += 1;
        if is_error {
            stats.errors += 1;
        }
    }

    pub fn incr(&self, counter: &'static str) {
        let mut guard = self.inner.lock().unwrap();
        *guard.counters.entry(counter).or_insert(0) += 1;
    }

    pub fn p95(&self, phase: Phase) -> Option<Duration> {
        let guard = self.inner.lock().unwrap();
        let stats = guard.phases.get(&phase)?;
        if stats.durations.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = stats.durations.iter().copied().collect();
        sorted.sort();
        let idx = ((sorted.len() as f64) * 0.95).ceil() as usize;
        let idx = idx.saturating_sub(1).min(sorted.len() - 1);
        Some(sorted[idx])
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let guard = self.inner.lock().unwrap();
        let phases = guard
            .phases
            .iter()
            .map(|(phase, stats)| {
                let mut sorted: Vec<Duration> = stats.durations.iter().copied().collect();
                sorted.sort();
                let p95 = if sorted.is_empty() {
                    None
                } else {
                    let idx = ((sorted.len() as f64) * 0.95).ceil() as usize;
                    Some(sorted[idx.saturating_sub(1).min(sorted.len() - 1)])
                };
                (*phase, PhaseSnapshot { count: stats.count, errors: stats.errors, p95 })
            })
            .collect();
        MetricsSnapshot { phases, counters: guard.counters.clone() }
    }
}

#[derive(Debug, Clone)]
pub struct PhaseSnapshot {
    pub count: u64,
    pub errors: u64,
    pub p95: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub phases: HashMap<Phase, PhaseSnapshot>,
    pub counters: HashMap<&'static str, u64>,
}
