//! Fetch counters and latency tracking.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::events::CompletedEvent;
use crate::ladder::LadderStep;

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub synthetic_fallbacks: u64,
    pub failures: u64,
    pub retries: u64,
    pub errors: u64,
    /// Successful ladder steps keyed by step name.
    pub step_successes: BTreeMap<String, u64>,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
}

#[derive(Debug)]
struct MetricsState {
    snapshot: MetricsSnapshot,
    max_window: usize,
    latencies: VecDeque<Duration>,
}

impl MetricsState {
    fn new(max_window: usize) -> Self {
        Self {
            snapshot: MetricsSnapshot::default(),
            max_window,
            latencies: VecDeque::with_capacity(max_window),
        }
    }

    fn record_latency(&mut self, latency: Duration) {
        if self.latencies.len() == self.max_window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);

        let mut samples: Vec<_> = self.latencies.iter().copied().collect();
        samples.sort_unstable();
        let avg = samples.iter().map(Duration::as_secs_f64).sum::<f64>() / samples.len() as f64;
        let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        self.snapshot.average_latency = Some(Duration::from_secs_f64(avg));
        self.snapshot.p95_latency = Some(samples[p95_index]);
    }
}

/// Thread-safe metrics collector shared with the event handlers.
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_window(128)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(window.max(16)))),
        }
    }

    pub fn record_completion(&self, event: &CompletedEvent) {
        let mut guard = self.lock();
        guard.snapshot.total_requests += 1;
        if event.cached {
            guard.snapshot.cache_hits += 1;
        }
        if event.synthetic {
            guard.snapshot.synthetic_fallbacks += 1;
        }
        if !event.success {
            guard.snapshot.failures += 1;
        }
        guard.record_latency(event.elapsed);
    }

    pub fn record_step_success(&self, step: LadderStep) {
        let mut guard = self.lock();
        *guard
            .snapshot
            .step_successes
            .entry(step.to_string())
            .or_default() += 1;
    }

    pub fn record_retry(&self) {
        self.lock().snapshot.retries += 1;
    }

    pub fn record_error(&self) {
        self.lock().snapshot.errors += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.lock().snapshot.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MetricsState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn completed(cached: bool, synthetic: bool, millis: u64) -> CompletedEvent {
        CompletedEvent {
            source: None,
            cached,
            synthetic,
            success: true,
            elapsed: Duration::from_millis(millis),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn records_completions_and_latency() {
        let metrics = MetricsCollector::new();
        metrics.record_completion(&completed(false, false, 900));
        metrics.record_completion(&completed(true, false, 2));
        metrics.record_completion(&completed(false, true, 300));
        metrics.record_retry();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 3);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.synthetic_fallbacks, 1);
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.p95_latency, Some(Duration::from_millis(900)));
    }
}
