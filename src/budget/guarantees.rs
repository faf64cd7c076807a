//! Per-request-tree execution guarantees: an orthogonal hard-limit layer
//! sitting above the session-wide `BudgetTracker`, plus cooperative
//! cancellation and checkpoint-driven degradation.

use crate::budget::tracker::{BudgetTracker, Limits, Violation};
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{instrument, warn};

/// A lightweight, clonable cancellation flag. Polled cooperatively; does not
/// abort an in-flight future on its own.
#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called. Safe to call repeatedly.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of partial progress recorded at some point in a request tree's
/// execution, used to choose a degradation strategy if a hard limit fires.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub label: String,
    pub partial_result: Option<String>,
}

impl Checkpoint {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            partial_result: None,
        }
    }

    pub fn with_partial_result(mut self, result: impl Into<String>) -> Self {
        self.partial_result = Some(result.into());
        self
    }
}

/// What an `ExecutionGuard` recommends doing once a hard limit is hit.
/// `Synthesize` and `Fallback` are reserved for layers above this one that
/// have enough context to act on them; this layer only ever selects
/// `Partial` or `Fail`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DegradationPlan {
    /// Return the last checkpoint's partial result as the final answer.
    Partial(String),
    /// No usable partial result exists; the caller should fail the request.
    Fail,
    /// Reserved: hand off to a cheaper/faster path. Not selected here.
    Fallback,
    /// Reserved: ask a model to synthesize from partial traces. Not
    /// selected here.
    Synthesize,
}

/// Tunables for one `ExecutionGuard`.
#[derive(Debug, Clone, Copy)]
pub struct GuaranteeConfig {
    pub limits: Limits,
}

impl Default for GuaranteeConfig {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
        }
    }
}

/// Immutable-looking context threaded through a request tree: depth, the
/// per-tree token tracker, a cancellation token shared by every node in the
/// tree, and (once derived from a guard) a deadline for the session's
/// remaining time. Copy-on-write via `with_*` so callers down the tree can
/// adjust without affecting siblings.
#[derive(Clone)]
pub struct GuardContext {
    pub depth: u32,
    pub cancellation: CancellationToken,
    pub deadline: Option<Instant>,
}

impl GuardContext {
    pub fn new(cancellation: CancellationToken) -> Self {
        Self {
            depth: 0,
            cancellation,
            deadline: None,
        }
    }

    pub fn with_depth(&self, depth: u32) -> Self {
        Self {
            depth,
            cancellation: self.cancellation.clone(),
            deadline: self.deadline,
        }
    }

    /// Seconds left before `deadline`, or `None` if this context carries no
    /// deadline. Zero once the deadline has passed.
    pub fn remaining(&self) -> Option<std::time::Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }
}

/// Guards a single request tree (one top-level task and all of its
/// sub-calls) with its own `BudgetTracker`, independent of the session-wide
/// one. Violations here fire callbacks from a detached task so a callback
/// can never re-enter the guard's own lock.
pub struct ExecutionGuard {
    tracker: BudgetTracker,
    checkpoints: Mutex<Vec<Checkpoint>>,
    cancellation: CancellationToken,
    on_violation: Mutex<Option<Arc<dyn Fn(Violation) + Send + Sync>>>,
    /// Live recursion depth, incremented by `enter_sub_call` and decremented
    /// by `exit_sub_call`. Distinct from the tracker's `recursion_depth`,
    /// which records the historical max for limit checks and never shrinks.
    current_depth: Mutex<u32>,
    created_at: Instant,
}

impl ExecutionGuard {
    pub fn new(config: GuaranteeConfig) -> Self {
        Self {
            tracker: BudgetTracker::new(config.limits),
            checkpoints: Mutex::new(Vec::new()),
            cancellation: CancellationToken::new(),
            on_violation: Mutex::new(None),
            current_depth: Mutex::new(0),
            created_at: Instant::now(),
        }
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn on_violation(&self, callback: Arc<dyn Fn(Violation) + Send + Sync>) {
        *self.on_violation.lock().unwrap() = Some(callback);
    }

    pub fn record_checkpoint(&self, checkpoint: Checkpoint) {
        self.checkpoints.lock().unwrap().push(checkpoint);
    }

    /// The most recently recorded checkpoint, if any.
    pub fn last_checkpoint(&self) -> Option<Checkpoint> {
        self.checkpoints.lock().unwrap().last().cloned()
    }

    /// Non-mutating pre-flight check: would `estimated_cost` push this
    /// tree's cost past its hard limit? Unlike `add_tokens`, this performs
    /// no mutation and trips no violation or cancellation.
    pub fn can_proceed(&self, estimated_cost: f64) -> bool {
        if self.cancellation.is_cancelled() {
            return false;
        }
        let limits = self.tracker.limits();
        if limits.max_cost_usd <= 0.0 {
            return true;
        }
        let projected = self.tracker.snapshot().cost_usd + estimated_cost;
        projected < limits.max_cost_usd
    }

    /// Non-mutating pre-flight check: would `estimated_input`/
    /// `estimated_output` tokens push this tree's counters past their hard
    /// limits?
    pub fn can_proceed_with_tokens(&self, estimated_input: u64, estimated_output: u64) -> bool {
        if self.cancellation.is_cancelled() {
            return false;
        }
        let limits = self.tracker.limits();
        let state = self.tracker.snapshot();
        state.input_tokens + estimated_input < limits.max_input_tokens
            && state.output_tokens + estimated_output < limits.max_output_tokens
    }

    #[instrument(skip(self))]
    pub fn add_tokens(
        &self,
        input: u64,
        output: u64,
        cached: u64,
        cost_per_input: f64,
        cost_per_output: f64,
    ) -> Result<()> {
        if self.cancellation.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let violation = self
            .tracker
            .add_tokens(input, output, cached, cost_per_input, cost_per_output);

        if let Some(violation) = violation {
            self.dispatch_violation(violation.clone());
            self.cancellation.cancel();
            return Err(Error::budget_exhausted(violation.message));
        }

        Ok(())
    }

    pub fn enter_sub_call(&self, depth: u32) -> Result<()> {
        if depth as u64 >= self.tracker.limits().max_recursion_depth as u64 {
            return Err(Error::max_depth_exceeded(self.tracker.limits().max_recursion_depth));
        }
        self.tracker.increment_sub_call(depth);
        *self.current_depth.lock().unwrap() += 1;
        Ok(())
    }

    /// Call when a sub-call returns. Decrements the live depth incremented
    /// by `enter_sub_call`, so `current_depth` reflects actual tree nesting
    /// rather than the historical max tracked for limit checks.
    pub fn exit_sub_call(&self) {
        let mut depth = self.current_depth.lock().unwrap();
        *depth = depth.saturating_sub(1);
    }

    /// Live recursion depth: how many sub-calls on the current path have
    /// entered without yet returning.
    pub fn current_depth(&self) -> u32 {
        *self.current_depth.lock().unwrap()
    }

    /// This tree's deadline: when it was created plus its session time
    /// limit.
    pub fn deadline(&self) -> Instant {
        self.created_at + self.tracker.limits().max_session_time
    }

    /// Derive a child context from `parent`, carrying its depth and
    /// cancellation token but stamped with this guard's remaining-time
    /// deadline.
    pub fn context(&self, parent: &GuardContext) -> GuardContext {
        GuardContext {
            depth: parent.depth,
            cancellation: parent.cancellation.clone(),
            deadline: Some(self.deadline()),
        }
    }

    /// Dispatched in a detached task so the callback cannot deadlock by
    /// re-entering this guard.
    fn dispatch_violation(&self, violation: Violation) {
        warn!(metric = %violation.metric, "execution guard hard limit tripped");
        if let Some(cb) = self.on_violation.lock().unwrap().clone() {
            tokio::spawn(async move {
                cb(violation);
            });
        }
    }

    /// Choose a degradation plan: `Partial` if the last checkpoint carries a
    /// non-empty partial result, otherwise `Fail`.
    pub fn degradation_plan(&self) -> DegradationPlan {
        let checkpoints = self.checkpoints.lock().unwrap();
        match checkpoints.last() {
            Some(checkpoint) => match &checkpoint.partial_result {
                Some(result) if !result.is_empty() => DegradationPlan::Partial(result.clone()),
                _ => DegradationPlan::Fail,
            },
            None => DegradationPlan::Fail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn degradation_plan_prefers_last_checkpoints_partial_result() {
        let guard = ExecutionGuard::new(GuaranteeConfig::default());
        guard.record_checkpoint(Checkpoint::new("step-1"));
        guard.record_checkpoint(
            Checkpoint::new("step-2").with_partial_result("partial answer"),
        );

        assert_eq!(
            guard.degradation_plan(),
            DegradationPlan::Partial("partial answer".to_string())
        );
    }

    #[test]
    fn degradation_plan_fails_with_no_checkpoints() {
        let guard = ExecutionGuard::new(GuaranteeConfig::default());
        assert_eq!(guard.degradation_plan(), DegradationPlan::Fail);
    }

    #[test]
    fn enter_sub_call_rejects_at_max_depth() {
        let config = GuaranteeConfig {
            limits: Limits {
                max_recursion_depth: 2,
                ..Limits::default()
            },
        };
        let guard = ExecutionGuard::new(config);
        assert!(guard.enter_sub_call(0).is_ok());
        assert!(guard.enter_sub_call(2).is_err());
    }

    #[test]
    fn last_checkpoint_returns_the_most_recent() {
        let guard = ExecutionGuard::new(GuaranteeConfig::default());
        assert!(guard.last_checkpoint().is_none());

        guard.record_checkpoint(Checkpoint::new("step-1").with_partial_result("first"));
        guard.record_checkpoint(Checkpoint::new("step-2"));

        assert_eq!(guard.last_checkpoint().unwrap().label, "step-2");
    }

    #[test]
    fn can_proceed_rejects_cost_that_would_exceed_the_limit() {
        let config = GuaranteeConfig {
            limits: Limits {
                max_cost_usd: 1.0,
                ..Limits::default()
            },
        };
        let guard = ExecutionGuard::new(config);
        assert!(guard.can_proceed(0.5));
        assert!(!guard.can_proceed(1.5));
    }

    #[test]
    fn can_proceed_with_tokens_rejects_tokens_that_would_exceed_the_limit() {
        let config = GuaranteeConfig {
            limits: Limits {
                max_input_tokens: 100,
                max_output_tokens: 100,
                ..Limits::default()
            },
        };
        let guard = ExecutionGuard::new(config);
        assert!(guard.can_proceed_with_tokens(50, 50));
        assert!(!guard.can_proceed_with_tokens(200, 0));
    }

    #[test]
    fn can_proceed_is_non_mutating_and_does_not_count_against_limits() {
        let config = GuaranteeConfig {
            limits: Limits {
                max_cost_usd: 1.0,
                ..Limits::default()
            },
        };
        let guard = ExecutionGuard::new(config);
        for _ in 0..5 {
            assert!(guard.can_proceed(0.9));
        }
    }

    #[test]
    fn exit_sub_call_decrements_live_depth() {
        let guard = ExecutionGuard::new(GuaranteeConfig::default());
        assert_eq!(guard.current_depth(), 0);

        guard.enter_sub_call(0).unwrap();
        guard.enter_sub_call(1).unwrap();
        assert_eq!(guard.current_depth(), 2);

        guard.exit_sub_call();
        assert_eq!(guard.current_depth(), 1);

        guard.exit_sub_call();
        assert_eq!(guard.current_depth(), 0);

        // Returning more times than entered saturates at zero.
        guard.exit_sub_call();
        assert_eq!(guard.current_depth(), 0);
    }

    #[test]
    fn context_carries_parent_depth_with_this_guards_deadline() {
        let guard = ExecutionGuard::new(GuaranteeConfig::default());
        let root = GuardContext::new(guard.cancellation());
        let child = root.with_depth(1);

        let derived = guard.context(&child);
        assert_eq!(derived.depth, 1);
        assert!(derived.deadline.is_some());
        assert!(derived.remaining().unwrap() <= guard.tracker.limits().max_session_time);
    }

    #[tokio::test]
    async fn hard_violation_cancels_and_dispatches_callback() {
        let config = GuaranteeConfig {
            limits: Limits {
                max_input_tokens: 10,
                ..Limits::default()
            },
        };
        let guard = ExecutionGuard::new(config);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        guard.on_violation(Arc::new(move |_v| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let result = guard.add_tokens(100, 0, 0, 1.0, 1.0);
        assert!(result.is_err());
        assert!(guard.cancellation().is_cancelled());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
