//! Per-session budget counters and limit evaluation.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{instrument, warn};

/// A limit crossing, carrying enough detail to be surfaced as an error.
#[derive(Debug, Clone)]
pub struct Violation {
    pub metric: String,
    pub current: f64,
    pub limit: f64,
    pub percent: f64,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Hard,
}

/// Hard caps and the warning fraction.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_input_tokens: u64,
    pub max_output_tokens: u64,
    pub max_cost_usd: f64,
    pub max_recursion_depth: u32,
    pub max_sub_calls: u64,
    pub max_session_time: Duration,
    /// Fraction of a limit at which a Warning violation fires, in [0, 1].
    pub warn_at: f64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_input_tokens: 2_000_000,
            max_output_tokens: 500_000,
            max_cost_usd: 50.0,
            max_recursion_depth: 8,
            max_sub_calls: 500,
            max_session_time: Duration::from_secs(6 * 3600),
            warn_at: 0.9,
        }
    }
}

/// Mutable per-session counters.
#[derive(Debug, Clone)]
pub struct BudgetState {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub cost_usd: f64,
    /// Max recursion depth seen during the current task.
    pub recursion_depth: u32,
    pub sub_call_count: u64,
    pub repl_executions: u64,
    pub session_start: DateTime<Utc>,
    pub task_start: DateTime<Utc>,
}

impl BudgetState {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            input_tokens: 0,
            output_tokens: 0,
            cached_tokens: 0,
            cost_usd: 0.0,
            recursion_depth: 0,
            sub_call_count: 0,
            repl_executions: 0,
            session_start: now,
            task_start: now,
        }
    }
}

type LimitCallback = Arc<dyn Fn(&Violation) + Send + Sync>;

/// Tracks one session's mutable `BudgetState` behind a lock, evaluating
/// `Limits` on every mutation.
pub struct BudgetTracker {
    state: Mutex<BudgetState>,
    limits: Mutex<Limits>,
    callback: Mutex<Option<LimitCallback>>,
}

impl BudgetTracker {
    pub fn new(limits: Limits) -> Self {
        Self {
            state: Mutex::new(BudgetState::new()),
            limits: Mutex::new(limits),
            callback: Mutex::new(None),
        }
    }

    /// Callback invoked for every Violation found while this lock is held.
    /// Must not re-enter the tracker.
    pub fn set_limit_callback(&self, callback: LimitCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    /// Atomically add token/cost usage. Cost formula:
    /// `(input - cached) * costPerInput + output * costPerOutput`.
    /// Returns the first Hard violation found, if any.
    #[instrument(skip(self))]
    pub fn add_tokens(
        &self,
        input: u64,
        output: u64,
        cached: u64,
        cost_per_input: f64,
        cost_per_output: f64,
    ) -> Option<Violation> {
        let billable_input = input.saturating_sub(cached);
        let cost = billable_input as f64 * cost_per_input + output as f64 * cost_per_output;

        {
            let mut state = self.state.lock().unwrap();
            state.input_tokens += input;
            state.output_tokens += output;
            state.cached_tokens += cached;
            state.cost_usd += cost;
        }

        self.check_and_notify()
    }

    pub fn increment_sub_call(&self, depth: u32) {
        let mut state = self.state.lock().unwrap();
        state.sub_call_count += 1;
        state.recursion_depth = state.recursion_depth.max(depth);
    }

    pub fn start_task(&self) {
        let mut state = self.state.lock().unwrap();
        state.task_start = Utc::now();
    }

    /// Reset per-task counters. `repl_executions` persists across tasks.
    pub fn end_task(&self) {
        let mut state = self.state.lock().unwrap();
        state.sub_call_count = 0;
        state.recursion_depth = 0;
    }

    pub fn record_repl_execution(&self) {
        self.state.lock().unwrap().repl_executions += 1;
    }

    /// Pure evaluation of current state against limits, in deterministic
    /// metric order. For each metric, the Hard check precedes the Warning
    /// check so a crossed hard limit never also emits its warning.
    pub fn check_limits(&self) -> Vec<Violation> {
        let state = self.state.lock().unwrap().clone();
        let limits = *self.limits.lock().unwrap();
        let mut violations = Vec::new();

        push_metric(
            &mut violations,
            "input_tokens",
            state.input_tokens as f64,
            limits.max_input_tokens as f64,
            limits.warn_at,
        );
        push_metric(
            &mut violations,
            "output_tokens",
            state.output_tokens as f64,
            limits.max_output_tokens as f64,
            limits.warn_at,
        );
        push_metric(
            &mut violations,
            "total_cost",
            state.cost_usd,
            limits.max_cost_usd,
            limits.warn_at,
        );
        push_metric(
            &mut violations,
            "recursion_depth",
            state.recursion_depth as f64,
            limits.max_recursion_depth as f64,
            limits.warn_at,
        );
        push_metric(
            &mut violations,
            "sub_calls",
            state.sub_call_count as f64,
            limits.max_sub_calls as f64,
            limits.warn_at,
        );
        let session_secs = (Utc::now() - state.session_start)
            .num_seconds()
            .max(0) as f64;
        push_metric(
            &mut violations,
            "session_time",
            session_secs,
            limits.max_session_time.as_secs_f64(),
            limits.warn_at,
        );

        violations
    }

    /// Zero state and set a fresh session start, keeping `Limits`.
    pub fn reset(&self) {
        *self.state.lock().unwrap() = BudgetState::new();
    }

    pub fn snapshot(&self) -> BudgetState {
        self.state.lock().unwrap().clone()
    }

    pub fn limits(&self) -> Limits {
        *self.limits.lock().unwrap()
    }

    pub fn set_limits(&self, limits: Limits) {
        *self.limits.lock().unwrap() = limits;
    }

    fn check_and_notify(&self) -> Option<Violation> {
        let violations = self.check_limits();
        let callback = self.callback.lock().unwrap().clone();

        let mut first_hard = None;
        for violation in violations {
            if violation.severity == Severity::Hard {
                warn!(metric = %violation.metric, "hard budget limit exceeded");
                if first_hard.is_none() {
                    first_hard = Some(violation.clone());
                }
            }
            if let Some(cb) = &callback {
                cb(&violation);
            }
        }
        first_hard
    }
}

fn push_metric(violations: &mut Vec<Violation>, metric: &str, current: f64, limit: f64, warn_at: f64) {
    if limit <= 0.0 {
        return;
    }
    let percent = current / limit;
    if percent >= 1.0 {
        violations.push(Violation {
            metric: metric.to_string(),
            current,
            limit,
            percent: percent * 100.0,
            severity: Severity::Hard,
            message: format!("{metric} at {current} exceeds limit {limit}"),
        });
    } else if percent >= warn_at {
        violations.push(Violation {
            metric: metric.to_string(),
            current,
            limit,
            percent: percent * 100.0,
            severity: Severity::Warning,
            message: format!("{metric} at {current} is within {warn_at:.0}% of limit {limit}"),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tight_limits() -> Limits {
        Limits {
            max_input_tokens: 1000,
            max_output_tokens: 1000,
            max_cost_usd: 1.0,
            max_recursion_depth: 4,
            max_sub_calls: 10,
            max_session_time: Duration::from_secs(3600),
            warn_at: 0.9,
        }
    }

    #[test]
    fn add_tokens_uses_cache_discounted_cost_formula() {
        let tracker = BudgetTracker::new(Limits::default());
        tracker.add_tokens(900, 400, 0, 0.9e-3, 0.0);
        let state = tracker.snapshot();
        // (900 - 0) * 0.9e-3 + 400 * 0 = 0.81
        assert!((state.cost_usd - 0.81).abs() < 1e-9);
    }

    #[test]
    fn hard_violation_suppresses_matching_warning() {
        let tracker = BudgetTracker::new(tight_limits());
        let violation = tracker.add_tokens(1000, 0, 0, 0.0, 0.0);
        assert!(violation.is_none()); // cost stays near zero; only tokens crossed

        let violations = tracker.check_limits();
        let input_violations: Vec<_> = violations.iter().filter(|v| v.metric == "input_tokens").collect();
        assert_eq!(input_violations.len(), 1);
        assert_eq!(input_violations[0].severity, Severity::Hard);
    }

    #[test]
    fn reset_zeroes_state_but_keeps_limits() {
        let tracker = BudgetTracker::new(tight_limits());
        tracker.add_tokens(500, 0, 0, 3.0, 15.0);
        tracker.reset();
        assert_eq!(tracker.snapshot().input_tokens, 0);
        assert_eq!(tracker.limits().max_input_tokens, 1000);
    }

    #[test]
    fn end_task_resets_sub_calls_but_not_repl_executions() {
        let tracker = BudgetTracker::new(Limits::default());
        tracker.increment_sub_call(2);
        tracker.record_repl_execution();
        tracker.end_task();
        let state = tracker.snapshot();
        assert_eq!(state.sub_call_count, 0);
        assert_eq!(state.recursion_depth, 0);
        assert_eq!(state.repl_executions, 1);
    }
}
