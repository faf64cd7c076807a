//! Project-level budget persistence and session lifecycle, built on top of
//! a session-scoped `BudgetTracker`.

use crate::budget::tracker::{BudgetState, BudgetTracker, Limits};
use crate::error::Result;
use crate::memory::store::SqliteMemoryStore;
use crate::memory::types::{Node, NodeQuery, NodeType, Tier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::instrument;
use uuid::Uuid;

const PROJECT_BUDGET_SUBTYPE: &str = "budget_project";
const SESSION_RECORD_SUBTYPE: &str = "budget_session";

/// Per-project running totals, persisted as a reserved `Entity` node so they
/// survive across sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectBudget {
    pub project_id: String,
    pub total_cost_usd: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub session_count: u64,
    pub limits: PersistedLimits,
}

impl ProjectBudget {
    fn new(project_id: impl Into<String>, limits: Limits) -> Self {
        Self {
            project_id: project_id.into(),
            total_cost_usd: 0.0,
            total_input_tokens: 0,
            total_output_tokens: 0,
            session_count: 0,
            limits: PersistedLimits::from(limits),
        }
    }
}

/// `Limits` reshaped for serde: `Duration` isn't directly `Serialize`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PersistedLimits {
    pub max_input_tokens: u64,
    pub max_output_tokens: u64,
    pub max_cost_usd: f64,
    pub max_recursion_depth: u32,
    pub max_sub_calls: u64,
    pub max_session_time_secs: u64,
    pub warn_at: f64,
}

impl From<Limits> for PersistedLimits {
    fn from(limits: Limits) -> Self {
        Self {
            max_input_tokens: limits.max_input_tokens,
            max_output_tokens: limits.max_output_tokens,
            max_cost_usd: limits.max_cost_usd,
            max_recursion_depth: limits.max_recursion_depth,
            max_sub_calls: limits.max_sub_calls,
            max_session_time_secs: limits.max_session_time.as_secs(),
            warn_at: limits.warn_at,
        }
    }
}

impl From<PersistedLimits> for Limits {
    fn from(persisted: PersistedLimits) -> Self {
        Self {
            max_input_tokens: persisted.max_input_tokens,
            max_output_tokens: persisted.max_output_tokens,
            max_cost_usd: persisted.max_cost_usd,
            max_recursion_depth: persisted.max_recursion_depth,
            max_sub_calls: persisted.max_sub_calls,
            max_session_time: std::time::Duration::from_secs(persisted.max_session_time_secs),
            warn_at: persisted.warn_at,
        }
    }
}

/// One completed session's final tally, persisted as a `Session` tier node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub project_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub cost_usd: f64,
    pub repl_executions: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// Result of a pre-flight budget check before issuing a call.
#[derive(Debug, Clone, Copy)]
pub struct BudgetCheck {
    pub can_proceed: bool,
    pub should_degrade: bool,
}

/// Lifecycle and threshold events a `BudgetManager` emits.
#[derive(Debug, Clone)]
pub enum BudgetEvent {
    SessionStart { session_id: String },
    SessionEnd { session_id: String },
    TaskStart { session_id: String },
    TaskEnd { session_id: String },
    WarningThreshold { metric: String, percent: f64 },
    LimitExceeded { metric: String, percent: f64 },
    Degraded { session_id: String },
    TokensAdded { input: u64, output: u64 },
}

type EventCallback = Arc<dyn Fn(&BudgetEvent) + Send + Sync>;

/// Owns the active session's `BudgetTracker`, persisting `ProjectBudget`
/// and `SessionRecord` data through a `SqliteMemoryStore` collaborator.
pub struct BudgetManager {
    store: SqliteMemoryStore,
    project_id: String,
    tracker: BudgetTracker,
    session_id: Mutex<Option<String>>,
    session_started_at: Mutex<Option<DateTime<Utc>>>,
    callback: Mutex<Option<EventCallback>>,
}

impl BudgetManager {
    pub fn new(store: SqliteMemoryStore, project_id: impl Into<String>) -> Self {
        Self::with_limits(store, project_id, Limits::default())
    }

    pub fn with_limits(store: SqliteMemoryStore, project_id: impl Into<String>, limits: Limits) -> Self {
        Self {
            store,
            project_id: project_id.into(),
            tracker: BudgetTracker::new(limits),
            session_id: Mutex::new(None),
            session_started_at: Mutex::new(None),
            callback: Mutex::new(None),
        }
    }

    pub fn set_event_callback(&self, callback: EventCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    fn emit(&self, event: BudgetEvent) {
        if let Some(cb) = self.callback.lock().unwrap().as_ref() {
            cb(&event);
        }
    }

    /// Load (or create) the project's budget row.
    fn load_project_budget(&self) -> Result<ProjectBudget> {
        let query = NodeQuery::new()
            .tiers(vec![Tier::LongTerm])
            .subtypes(vec![PROJECT_BUDGET_SUBTYPE.to_string()]);
        let nodes = self.store.list_nodes(&query)?;

        for node in nodes {
            if let Ok(budget) = serde_json::from_str::<ProjectBudget>(&node.content) {
                if budget.project_id == self.project_id {
                    return Ok(budget);
                }
            }
        }

        Ok(ProjectBudget::new(self.project_id.clone(), Limits::default()))
    }

    fn persist_project_budget(&self, budget: &ProjectBudget) -> Result<()> {
        let query = NodeQuery::new()
            .tiers(vec![Tier::LongTerm])
            .subtypes(vec![PROJECT_BUDGET_SUBTYPE.to_string()]);
        let existing = self
            .store
            .list_nodes(&query)?
            .into_iter()
            .find(|n| serde_json::from_str::<ProjectBudget>(&n.content)
                .map(|b| b.project_id == budget.project_id)
                .unwrap_or(false));

        let content = serde_json::to_string(budget)
            .map_err(crate::error::Error::Serialization)?;

        match existing {
            Some(mut node) => {
                node.content = content;
                self.store.update_node(&node)?;
            }
            None => {
                let node = Node::new(NodeType::Entity, content)
                    .with_subtype(PROJECT_BUDGET_SUBTYPE)
                    .with_tier(Tier::LongTerm);
                self.store.create_node(&node)?;
            }
        }
        Ok(())
    }

    fn persist_session_record(&self, record: &SessionRecord) -> Result<()> {
        let content = serde_json::to_string(record).map_err(crate::error::Error::Serialization)?;
        let node = Node::new(NodeType::Entity, content)
            .with_subtype(SESSION_RECORD_SUBTYPE)
            .with_tier(Tier::Session);
        self.store.create_node(&node)
    }

    /// Start a new session: generates a fresh UUID v4 session id, loads the
    /// project budget, overrides this manager's limits with the project's,
    /// and emits `SessionStart`.
    #[instrument(skip(self))]
    pub fn start_session(&self) -> Result<String> {
        let project_budget = self.load_project_budget()?;
        self.tracker.reset();
        self.tracker.set_limits(project_budget.limits.into());

        let session_id = Uuid::new_v4().to_string();
        *self.session_id.lock().unwrap() = Some(session_id.clone());
        *self.session_started_at.lock().unwrap() = Some(Utc::now());

        self.emit(BudgetEvent::SessionStart {
            session_id: session_id.clone(),
        });
        Ok(session_id)
    }

    /// Write the final `SessionRecord` and fold its totals into the project
    /// budget, then emit `SessionEnd`.
    #[instrument(skip(self))]
    pub fn end_session(&self) -> Result<SessionRecord> {
        let session_id = self
            .session_id
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        let started_at = self
            .session_started_at
            .lock()
            .unwrap()
            .unwrap_or_else(Utc::now);

        let state: BudgetState = self.tracker.snapshot();
        let record = SessionRecord {
            session_id: session_id.clone(),
            project_id: self.project_id.clone(),
            input_tokens: state.input_tokens,
            output_tokens: state.output_tokens,
            cached_tokens: state.cached_tokens,
            cost_usd: state.cost_usd,
            repl_executions: state.repl_executions,
            started_at,
            ended_at: Utc::now(),
        };
        self.persist_session_record(&record)?;

        let mut project_budget = self.load_project_budget()?;
        project_budget.total_cost_usd += record.cost_usd;
        project_budget.total_input_tokens += record.input_tokens;
        project_budget.total_output_tokens += record.output_tokens;
        project_budget.session_count += 1;
        self.persist_project_budget(&project_budget)?;

        self.emit(BudgetEvent::SessionEnd { session_id });
        Ok(record)
    }

    /// Pre-flight check: would `estimated_in`/`estimated_out` tokens at the
    /// given per-token prices push the tracker past a hard or warning limit?
    pub fn check_budget(
        &self,
        estimated_in: u64,
        estimated_out: u64,
        cost_per_input: f64,
        cost_per_output: f64,
    ) -> BudgetCheck {
        let state = self.tracker.snapshot();
        let limits = self.tracker.limits();
        let projected_cost =
            state.cost_usd + estimated_in as f64 * cost_per_input + estimated_out as f64 * cost_per_output;

        let projected_input = state.input_tokens + estimated_in;
        let projected_output = state.output_tokens + estimated_out;

        let exceeds_hard = projected_input >= limits.max_input_tokens
            || projected_output >= limits.max_output_tokens
            || projected_cost >= limits.max_cost_usd;

        let exceeds_warning = !exceeds_hard
            && (projected_input as f64 >= limits.max_input_tokens as f64 * limits.warn_at
                || projected_output as f64 >= limits.max_output_tokens as f64 * limits.warn_at
                || projected_cost >= limits.max_cost_usd * limits.warn_at);

        BudgetCheck {
            can_proceed: !exceeds_hard,
            should_degrade: exceeds_hard || exceeds_warning,
        }
    }

    pub fn tracker(&self) -> &BudgetTracker {
        &self.tracker
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_session_generates_uuid_v4() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let manager = BudgetManager::new(store, "proj-1");
        let session_id = manager.start_session().unwrap();
        assert!(Uuid::parse_str(&session_id).is_ok());
    }

    #[test]
    fn end_session_persists_record_and_updates_project_totals() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let manager = BudgetManager::new(store, "proj-1");
        manager.start_session().unwrap();
        manager.tracker().add_tokens(1000, 200, 0, 3.0, 15.0);

        let record = manager.end_session().unwrap();
        assert!(record.cost_usd > 0.0);

        let budget = manager.load_project_budget().unwrap();
        assert_eq!(budget.session_count, 1);
        assert!((budget.total_cost_usd - record.cost_usd).abs() < 1e-9);
    }

    #[test]
    fn check_budget_flags_degradation_near_limit() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let manager = BudgetManager::new(store, "proj-1");
        manager.start_session().unwrap();

        let check = manager.check_budget(10_000_000, 0, 3.0, 15.0);
        assert!(!check.can_proceed);
        assert!(check.should_degrade);
    }

    #[test]
    fn check_budget_rejects_call_that_would_exceed_cost_limit() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let mut limits = Limits::default();
        limits.max_cost_usd = 1.0;
        let manager = BudgetManager::with_limits(store, "proj-1", limits);
        manager.start_session().unwrap();

        manager.tracker().add_tokens(900, 400, 0, 0.9e-3, 0.0);
        assert!((manager.tracker().snapshot().cost_usd - 0.81).abs() < 1e-9);

        let check = manager.check_budget(200, 100, 1e-3, 0.0);
        assert!(!check.can_proceed);
    }
}
