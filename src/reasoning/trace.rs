//! Reasoning trace: a Goal -> Decision -> Option -> Action -> Outcome graph
//! built directly over the hypergraph store rather than a standalone tree.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::memory::{
    DecisionRecord, EdgeMember, EdgeType, HyperEdge, MemberRole, Node, NodeId, NodeType,
    Provenance, SqliteMemoryStore,
};
use crate::reasoning::git::GitCollaborator;

/// Status of an option considered under a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionStatus {
    Active,
    Completed,
    Rejected,
}

impl OptionStatus {
    fn parse(status: &str) -> Self {
        match status {
            "completed" => Self::Completed,
            "rejected" => Self::Rejected,
            _ => Self::Active,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecisionView {
    pub node_id: NodeId,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct OptionView {
    pub node_id: NodeId,
    pub status: OptionStatus,
}

#[derive(Debug, Clone)]
pub struct ActionView {
    pub node_id: NodeId,
    pub status: String,
    pub diff_node_ids: Vec<NodeId>,
}

/// Best-effort partial view of a goal's reasoning graph, assembled by
/// [`ReasoningTraceBuilder::get_reasoning_trace`].
#[derive(Debug, Clone, Default)]
pub struct ReasoningTrace {
    pub goal_id: Option<NodeId>,
    pub decision: Option<DecisionView>,
    pub options: Vec<OptionView>,
    pub actions: Vec<ActionView>,
}

pub struct ReasoningTraceBuilder {
    store: SqliteMemoryStore,
    git: Arc<dyn GitCollaborator>,
}

impl ReasoningTraceBuilder {
    pub fn new(store: SqliteMemoryStore, git: Arc<dyn GitCollaborator>) -> Self {
        Self { store, git }
    }

    pub fn create_goal(&self, desc: &str) -> Result<NodeId> {
        let node = Node::new(NodeType::Decision, desc).with_subtype("goal");
        self.store.create_node(&node)?;
        let record = DecisionRecord::new(node.id.clone(), "goal");
        self.store.create_decision(&record)?;
        Ok(node.id)
    }

    pub fn create_decision(&self, goal_id: &NodeId, desc: &str) -> Result<NodeId> {
        let node = Node::new(NodeType::Decision, desc).with_subtype("decision");
        self.store.create_node(&node)?;
        let mut record = DecisionRecord::new(node.id.clone(), "decision");
        record.parent_id = Some(goal_id.clone());
        self.store.create_decision(&record)?;
        self.store.create_hyperedge(&HyperEdge::binary(
            EdgeType::Spawns,
            goal_id.clone(),
            node.id.clone(),
            "spawns",
        ))?;
        Ok(node.id)
    }

    pub fn create_option(&self, decision_id: &NodeId, desc: &str) -> Result<NodeId> {
        let node = Node::new(NodeType::Decision, desc).with_subtype("option");
        self.store.create_node(&node)?;
        let mut record = DecisionRecord::new(node.id.clone(), "option");
        record.parent_id = Some(decision_id.clone());
        self.store.create_decision(&record)?;
        self.store.create_hyperedge(&HyperEdge::binary(
            EdgeType::Considers,
            decision_id.clone(),
            node.id.clone(),
            "considers",
        ))?;
        Ok(node.id)
    }

    pub fn choose_option(&self, decision_id: &NodeId, option_id: &NodeId) -> Result<()> {
        self.store.update_decision_status(option_id, "completed")?;
        self.store.create_hyperedge(&HyperEdge::binary(
            EdgeType::Chooses,
            decision_id.clone(),
            option_id.clone(),
            "chooses",
        ))?;
        Ok(())
    }

    pub fn reject_option(&self, decision_id: &NodeId, option_id: &NodeId, reason: &str) -> Result<()> {
        self.store.update_decision_status(option_id, "rejected")?;
        let mut metadata = HashMap::new();
        metadata.insert("reason".to_string(), Value::String(reason.to_string()));
        self.store.create_hyperedge(
            &HyperEdge::binary(EdgeType::Rejects, decision_id.clone(), option_id.clone(), "rejects")
                .with_metadata(metadata),
        )?;
        Ok(())
    }

    /// Create an action node, stamped with the current branch/commit from
    /// the git collaborator (best-effort: an unreadable git state leaves
    /// the provenance fields blank rather than failing the action).
    pub async fn create_action(&self, decision_id: &NodeId, desc: &str, files: Vec<String>) -> Result<NodeId> {
        let state = self.git.current_state().await.unwrap_or_default();
        let provenance = Provenance::new("reasoning::create_action")
            .with_branch(state.branch)
            .with_commit_hash(state.commit_hash);

        let node = Node::new(NodeType::Decision, desc)
            .with_subtype("action")
            .with_provenance(provenance);
        self.store.create_node(&node)?;

        let mut record = DecisionRecord::new(node.id.clone(), "action");
        record.parent_id = Some(decision_id.clone());
        record.files = Some(files);
        self.store.create_decision(&record)?;

        self.store.create_hyperedge(&HyperEdge::binary(
            EdgeType::Implements,
            decision_id.clone(),
            node.id.clone(),
            "implements",
        ))?;
        Ok(node.id)
    }

    /// Mark an action completed. If `capture_diffs` is set, best-effort
    /// captures working-tree diffs as snippet nodes linked to the action;
    /// one failed snippet does not abort the others.
    pub async fn complete_action(&self, action_id: &NodeId, capture_diffs: bool) -> Result<Vec<NodeId>> {
        self.store.update_decision_status(action_id, "completed")?;
        if !capture_diffs {
            return Ok(Vec::new());
        }

        let diffs = match self.git.capture_working_diffs().await {
            Ok(diffs) => diffs,
            Err(_) => return Ok(Vec::new()),
        };

        let mut snippet_ids = Vec::new();
        for diff in diffs {
            let provenance = Provenance::new("git")
                .with_file(diff.file_path.clone())
                .with_commit_hash(diff.commit_hash.clone());
            let mut metadata = HashMap::new();
            metadata.insert("additions".to_string(), Value::from(diff.additions));
            metadata.insert("removals".to_string(), Value::from(diff.removals));
            metadata.insert(
                "captured_at".to_string(),
                Value::String(diff.captured_at.to_rfc3339()),
            );

            let node = Node::new(NodeType::Snippet, diff.unified_diff)
                .with_subtype("diff")
                .with_provenance(provenance)
                .with_metadata(metadata);

            if self.store.create_node(&node).is_err() {
                continue;
            }
            if self
                .store
                .create_hyperedge(&HyperEdge::binary(
                    EdgeType::Context,
                    action_id.clone(),
                    node.id.clone(),
                    "context",
                ))
                .is_err()
            {
                continue;
            }
            snippet_ids.push(node.id);
        }

        Ok(snippet_ids)
    }

    /// Create an outcome node, a `produces` edge from the action, and
    /// attach the given diff snippets as context members of that edge.
    pub fn create_outcome(&self, action_id: &NodeId, desc: &str, diff_ids: &[NodeId]) -> Result<NodeId> {
        let node = Node::new(NodeType::Decision, desc).with_subtype("outcome");
        self.store.create_node(&node)?;

        let mut record = DecisionRecord::new(node.id.clone(), "outcome");
        record.parent_id = Some(action_id.clone());
        self.store.create_decision(&record)?;

        let mut members = vec![
            EdgeMember::new(action_id.clone(), MemberRole::Subject, 0),
            EdgeMember::new(node.id.clone(), MemberRole::Object, 1),
        ];
        for (i, diff_id) in diff_ids.iter().enumerate() {
            members.push(EdgeMember::new(diff_id.clone(), MemberRole::Context, (i + 2) as i64));
        }
        let mut edge = HyperEdge::new(EdgeType::Produces, members);
        edge.label = Some("produces".to_string());
        self.store.create_hyperedge(&edge)?;

        Ok(node.id)
    }

    /// Assemble a best-effort partial view: the first decision spawned by
    /// the goal, its options by status, actions implementing the decision,
    /// and each action's diff snippets via its `context` edges.
    pub fn get_reasoning_trace(&self, goal_id: &NodeId) -> ReasoningTrace {
        let mut trace = ReasoningTrace {
            goal_id: Some(goal_id.clone()),
            ..Default::default()
        };

        let Ok(children) = self.store.decisions_by_parent(goal_id) else {
            return trace;
        };
        let Some(decision_record) = children.iter().find(|d| d.decision_type == "decision") else {
            return trace;
        };
        trace.decision = Some(DecisionView {
            node_id: decision_record.node_id.clone(),
            status: decision_record.status.clone(),
        });

        let Ok(grandchildren) = self.store.decisions_by_parent(&decision_record.node_id) else {
            return trace;
        };

        trace.options = grandchildren
            .iter()
            .filter(|d| d.decision_type == "option")
            .map(|d| OptionView {
                node_id: d.node_id.clone(),
                status: OptionStatus::parse(&d.status),
            })
            .collect();

        trace.actions = grandchildren
            .iter()
            .filter(|d| d.decision_type == "action")
            .map(|d| {
                let diff_node_ids = self
                    .store
                    .get_node_hyperedges(&d.node_id)
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|e| e.edge_type == EdgeType::Context)
                    .flat_map(|e| e.members)
                    .filter(|m| m.role == MemberRole::Object && m.node_id != d.node_id)
                    .map(|m| m.node_id)
                    .collect();
                ActionView {
                    node_id: d.node_id.clone(),
                    status: d.status.clone(),
                    diff_node_ids,
                }
            })
            .collect();

        trace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reasoning::git::{GitState, WorkingDiff};
    use async_trait::async_trait;
    use chrono::Utc;

    struct StubGit;

    #[async_trait]
    impl GitCollaborator for StubGit {
        async fn current_state(&self) -> Result<GitState> {
            Ok(GitState {
                branch: "main".to_string(),
                commit_hash: "deadbeef".to_string(),
            })
        }

        async fn capture_working_diffs(&self) -> Result<Vec<WorkingDiff>> {
            Ok(vec![WorkingDiff {
                file_path: "src/lib.rs".to_string(),
                unified_diff: "--- a\n+++ b".to_string(),
                additions: 3,
                removals: 1,
                commit_hash: "deadbeef".to_string(),
                captured_at: Utc::now(),
            }])
        }
    }

    fn builder() -> ReasoningTraceBuilder {
        let store = SqliteMemoryStore::in_memory().unwrap();
        ReasoningTraceBuilder::new(store, Arc::new(StubGit))
    }

    #[tokio::test]
    async fn full_lifecycle_assembles_a_trace() {
        let builder = builder();

        let goal = builder.create_goal("ship the feature").unwrap();
        let decision = builder.create_decision(&goal, "how to implement it").unwrap();
        let option_a = builder.create_option(&decision, "do it the fast way").unwrap();
        let option_b = builder.create_option(&decision, "do it the safe way").unwrap();
        builder.choose_option(&decision, &option_b).unwrap();
        builder.reject_option(&decision, &option_a, "too risky").unwrap();

        let action = builder
            .create_action(&decision, "write the patch", vec!["src/lib.rs".to_string()])
            .await
            .unwrap();
        let diff_ids = builder.complete_action(&action, true).await.unwrap();
        assert_eq!(diff_ids.len(), 1);

        builder.create_outcome(&action, "feature shipped", &diff_ids).unwrap();

        let trace = builder.get_reasoning_trace(&goal);
        assert_eq!(trace.decision.unwrap().node_id, decision);
        assert_eq!(trace.options.len(), 2);
        assert!(trace
            .options
            .iter()
            .any(|o| o.node_id == option_b && o.status == OptionStatus::Completed));
        assert!(trace
            .options
            .iter()
            .any(|o| o.node_id == option_a && o.status == OptionStatus::Rejected));
        assert_eq!(trace.actions.len(), 1);
        assert_eq!(trace.actions[0].diff_node_ids.len(), 1);
    }

    #[tokio::test]
    async fn get_reasoning_trace_is_partial_when_no_decision_exists() {
        let builder = builder();
        let goal = builder.create_goal("an idle goal").unwrap();
        let trace = builder.get_reasoning_trace(&goal);
        assert!(trace.decision.is_none());
        assert!(trace.options.is_empty());
    }
}
