//! Metrics for the dispatcher and the schedulers.
//!
//! Lock-free counters and gauges, grouped per component:
//! - `DispatcherMetrics` for command traffic (calls, outcomes, pending calls)
//! - `SchedulerMetrics` for timers (armed, fired, cancelled, handoffs)
//!
//! # Example
//!
//! ```rust,ignore
//! let metrics = dispatcher_factory.metrics();
//! let snapshot = metrics.snapshot();
//! println!("cancelled: {}", snapshot.calls_cancelled);
//! ```

mod counters;
mod gauges;

pub use counters::Counter;
pub use gauges::Gauge;

use crate::error::CommandError;
use std::fmt;

/// Metrics for command dispatch on one node.
#[derive(Debug)]
pub struct DispatcherMetrics {
    /// Total calls issued.
    pub calls_total: Counter,
    /// Calls that targeted the local member.
    pub calls_local: Counter,
    /// Calls that completed with a value.
    pub calls_succeeded: Counter,
    /// Calls whose command failed.
    pub calls_failed: Counter,
    /// Calls settled as cancelled.
    pub calls_cancelled: Counter,
    /// Calls that failed in transport or timed out.
    pub calls_unreachable: Counter,
    /// Incoming requests executed by this node.
    pub requests_handled: Counter,
    /// Incoming requests for services not deployed here.
    pub requests_no_service: Counter,
    /// Calls currently awaiting a response.
    pub pending_calls: Gauge,
}

impl DispatcherMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self {
            calls_total: Counter::new("dispatch_calls_total", "Total command calls"),
            calls_local: Counter::new("dispatch_calls_local", "Calls targeting the local member"),
            calls_succeeded: Counter::new("dispatch_calls_succeeded", "Calls completed with a value"),
            calls_failed: Counter::new("dispatch_calls_failed", "Calls whose command failed"),
            calls_cancelled: Counter::new("dispatch_calls_cancelled", "Calls settled as cancelled"),
            calls_unreachable: Counter::new(
                "dispatch_calls_unreachable",
                "Calls that failed in transport or timed out",
            ),
            requests_handled: Counter::new("dispatch_requests_handled", "Requests executed here"),
            requests_no_service: Counter::new(
                "dispatch_requests_no_service",
                "Requests for services not deployed here",
            ),
            pending_calls: Gauge::new("dispatch_pending_calls", "Calls awaiting a response"),
        }
    }

    /// Record the outcome of a call.
    pub fn record_outcome<R>(&self, outcome: &Result<R, CommandError>) {
        match outcome {
            Ok(_) => self.calls_succeeded.inc(),
            Err(CommandError::Execution(_)) => self.calls_failed.inc(),
            Err(CommandError::Cancelled) => self.calls_cancelled.inc(),
            Err(CommandError::Unreachable { .. }) | Err(CommandError::Timeout) => {
                self.calls_unreachable.inc()
            }
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> DispatcherMetricsSnapshot {
        DispatcherMetricsSnapshot {
            calls_total: self.calls_total.get(),
            calls_local: self.calls_local.get(),
            calls_succeeded: self.calls_succeeded.get(),
            calls_failed: self.calls_failed.get(),
            calls_cancelled: self.calls_cancelled.get(),
            calls_unreachable: self.calls_unreachable.get(),
            requests_handled: self.requests_handled.get(),
            requests_no_service: self.requests_no_service.get(),
            pending_calls: self.pending_calls.get(),
            pending_calls_peak: self.pending_calls.peak(),
        }
    }

    /// Render every metric in text exposition form, one block per metric.
    pub fn render(&self) -> String {
        render(&[
            &self.calls_total,
            &self.calls_local,
            &self.calls_succeeded,
            &self.calls_failed,
            &self.calls_cancelled,
            &self.calls_unreachable,
            &self.requests_handled,
            &self.requests_no_service,
            &self.pending_calls,
        ])
    }
}

impl Default for DispatcherMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of `DispatcherMetrics`.
#[derive(Debug, Clone, Default)]
pub struct DispatcherMetricsSnapshot {
    pub calls_total: u64,
    pub calls_local: u64,
    pub calls_succeeded: u64,
    pub calls_failed: u64,
    pub calls_cancelled: u64,
    pub calls_unreachable: u64,
    pub requests_handled: u64,
    pub requests_no_service: u64,
    pub pending_calls: i64,
    pub pending_calls_peak: i64,
}

/// Metrics for a keyed scheduler.
#[derive(Debug)]
pub struct SchedulerMetrics {
    /// Timers armed (including replacements).
    pub scheduled: Counter,
    /// Timers cancelled before firing.
    pub cancelled: Counter,
    /// Timers that fired.
    pub fired: Counter,
    /// Fired tasks that returned an error.
    pub task_failures: Counter,
    /// Schedules handed to a new owner after a view change.
    pub handoffs: Counter,
    /// Schedules re-armed from the metadata store after a view change.
    pub rearmed: Counter,
    /// Schedules and executions dropped because a newer cancel was known.
    pub suppressed: Counter,
    /// Timers currently armed.
    pub active: Gauge,
}

impl SchedulerMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self {
            scheduled: Counter::new("scheduler_scheduled_total", "Timers armed"),
            cancelled: Counter::new("scheduler_cancelled_total", "Timers cancelled"),
            fired: Counter::new("scheduler_fired_total", "Timers fired"),
            task_failures: Counter::new("scheduler_task_failures", "Fired tasks that failed"),
            handoffs: Counter::new("scheduler_handoffs_total", "Schedules handed to a new owner"),
            rearmed: Counter::new("scheduler_rearmed_total", "Schedules re-armed after view change"),
            suppressed: Counter::new("scheduler_suppressed_total", "Work dropped by a newer cancel"),
            active: Gauge::new("scheduler_active_timers", "Timers currently armed"),
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> SchedulerMetricsSnapshot {
        SchedulerMetricsSnapshot {
            scheduled: self.scheduled.get(),
            cancelled: self.cancelled.get(),
            fired: self.fired.get(),
            task_failures: self.task_failures.get(),
            handoffs: self.handoffs.get(),
            rearmed: self.rearmed.get(),
            suppressed: self.suppressed.get(),
            active: self.active.get(),
            active_peak: self.active.peak(),
        }
    }

    pub fn render(&self) -> String {
        render(&[
            &self.scheduled,
            &self.cancelled,
            &self.fired,
            &self.task_failures,
            &self.handoffs,
            &self.rearmed,
            &self.suppressed,
            &self.active,
        ])
    }
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of `SchedulerMetrics`.
#[derive(Debug, Clone, Default)]
pub struct SchedulerMetricsSnapshot {
    pub scheduled: u64,
    pub cancelled: u64,
    pub fired: u64,
    pub task_failures: u64,
    pub handoffs: u64,
    pub rearmed: u64,
    pub suppressed: u64,
    pub active: i64,
    pub active_peak: i64,
}

fn render(metrics: &[&dyn fmt::Display]) -> String {
    metrics
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutionError;

    #[test]
    fn test_record_outcome() {
        let metrics = DispatcherMetrics::new();
        metrics.record_outcome::<u32>(&Ok(1));
        metrics.record_outcome::<u32>(&Err(CommandError::Cancelled));
        metrics.record_outcome::<u32>(&Err(CommandError::Timeout));
        metrics.record_outcome::<u32>(&Err(CommandError::Execution(ExecutionError::new("x"))));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.calls_succeeded, 1);
        assert_eq!(snapshot.calls_cancelled, 1);
        assert_eq!(snapshot.calls_unreachable, 1);
        assert_eq!(snapshot.calls_failed, 1);
    }

    #[test]
    fn test_scheduler_snapshot() {
        let metrics = SchedulerMetrics::new();
        metrics.scheduled.inc();
        metrics.active.inc();
        metrics.fired.inc();
        metrics.active.dec();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.scheduled, 1);
        assert_eq!(snapshot.fired, 1);
        assert_eq!(snapshot.active, 0);
        assert_eq!(snapshot.active_peak, 1);
    }

    #[test]
    fn test_render_lists_every_metric() {
        let metrics = DispatcherMetrics::new();
        metrics.calls_total.inc_by(2);
        metrics.pending_calls.inc();

        let text = metrics.render();
        assert!(text.contains("\ndispatch_calls_total 2\n"));
        assert!(text.contains("\ndispatch_pending_calls_peak 1"));
        assert_eq!(text.matches("# HELP").count(), 9);
    }
}
