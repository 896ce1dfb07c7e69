//! Event system for the fetch ladder.
//!
//! Every ladder transition, sub-query attempt, retry, cache lookup and warning
//! is broadcast to registered handlers. [`LoggingHandler`] maps events onto
//! the `log` facade; [`MetricsHandler`] feeds the metrics collector.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::metrics::MetricsCollector;
use crate::ladder::LadderStep;
use crate::types::{ConnectionKind, Source, SubQuery};

#[derive(Debug, Clone)]
pub struct CacheEvent {
    pub key: String,
    pub hit: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Entered,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone)]
pub struct StepEvent {
    pub step: LadderStep,
    pub outcome: StepOutcome,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AttemptEvent {
    pub step: LadderStep,
    pub subquery: SubQuery,
    pub attempt: u32,
    pub connection: ConnectionKind,
    pub timeframe: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub step: LadderStep,
    pub subquery: SubQuery,
    pub attempt: u32,
    pub reason: String,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct WarningEvent {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub context: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BudgetEvent {
    pub elapsed: Duration,
    pub budget: Duration,
    pub step: LadderStep,
}

#[derive(Debug, Clone)]
pub struct CompletedEvent {
    pub source: Option<Source>,
    pub cached: bool,
    pub synthetic: bool,
    pub success: bool,
    pub elapsed: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum TrendsEvent {
    Cache(CacheEvent),
    Step(StepEvent),
    Attempt(AttemptEvent),
    Retry(RetryEvent),
    Warning(WarningEvent),
    Error(ErrorEvent),
    BudgetExceeded(BudgetEvent),
    Completed(CompletedEvent),
}

impl TrendsEvent {
    pub fn warning(message: impl Into<String>) -> Self {
        TrendsEvent::Warning(WarningEvent {
            message: message.into(),
            timestamp: Utc::now(),
        })
    }

    pub fn error(context: impl Into<String>, error: impl Into<String>) -> Self {
        TrendsEvent::Error(ErrorEvent {
            context: context.into(),
            error: error.into(),
            timestamp: Utc::now(),
        })
    }

    pub fn step(step: LadderStep, outcome: StepOutcome) -> Self {
        TrendsEvent::Step(StepEvent {
            step,
            outcome,
            timestamp: Utc::now(),
        })
    }
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &TrendsEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default, Clone)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: TrendsEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &TrendsEvent) {
        match event {
            TrendsEvent::Cache(cache) => {
                log::debug!("cache {} {}", if cache.hit { "hit" } else { "miss" }, cache.key);
            }
            TrendsEvent::Step(step) => match step.outcome {
                StepOutcome::Failed => log::info!("{} failed", step.step),
                outcome => log::debug!("{} {:?}", step.step, outcome),
            },
            TrendsEvent::Attempt(attempt) => {
                log::debug!(
                    "{}/{} attempt {} via {:?} ({})",
                    attempt.step,
                    attempt.subquery,
                    attempt.attempt,
                    attempt.connection,
                    attempt.timeframe
                );
            }
            TrendsEvent::Retry(retry) => {
                log::info!(
                    "{}/{} retry {} after {:.2}s: {}",
                    retry.step,
                    retry.subquery,
                    retry.attempt,
                    retry.scheduled_after.as_secs_f64(),
                    retry.reason
                );
            }
            TrendsEvent::Warning(warning) => log::warn!("{}", warning.message),
            TrendsEvent::Error(error) => log::warn!("{}: {}", error.context, error.error),
            TrendsEvent::BudgetExceeded(budget) => {
                log::warn!(
                    "fetch exceeded soft budget of {:.0}s ({:.1}s elapsed, now at {})",
                    budget.budget.as_secs_f64(),
                    budget.elapsed.as_secs_f64(),
                    budget.step
                );
            }
            TrendsEvent::Completed(done) => {
                log::info!(
                    "fetch completed in {:.2}s source={:?} cached={} synthetic={}",
                    done.elapsed.as_secs_f64(),
                    done.source,
                    done.cached,
                    done.synthetic
                );
            }
        }
    }
}

/// Metrics handler that feeds the metrics collector.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &TrendsEvent) {
        match event {
            TrendsEvent::Step(step) if step.outcome == StepOutcome::Succeeded => {
                self.metrics.record_step_success(step.step);
            }
            TrendsEvent::Retry(_) => self.metrics.record_retry(),
            TrendsEvent::Error(_) => self.metrics.record_error(),
            TrendsEvent::Completed(done) => self.metrics.record_completion(done),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler(std::sync::Mutex<usize>);

    impl EventHandler for CountingHandler {
        fn handle(&self, _event: &TrendsEvent) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn dispatches_to_handlers() {
        let mut dispatcher = EventDispatcher::new();
        let counter = Arc::new(CountingHandler(std::sync::Mutex::new(0)));
        dispatcher.register_handler(counter.clone());
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher.dispatch(TrendsEvent::warning("keyword list truncated"));
        dispatcher.dispatch(TrendsEvent::step(LadderStep::Primary, StepOutcome::Failed));
        assert_eq!(*counter.0.lock().unwrap(), 2);
    }

    #[test]
    fn metrics_handler_counts_step_successes() {
        let metrics = MetricsCollector::new();
        let handler = MetricsHandler::new(metrics.clone());
        handler.handle(&TrendsEvent::step(LadderStep::Direct, StepOutcome::Succeeded));
        handler.handle(&TrendsEvent::step(LadderStep::Direct, StepOutcome::Failed));
        assert_eq!(metrics.snapshot().step_successes.get("direct"), Some(&1));
    }
}
