//! Thin façade over the hypergraph store for the common
//! fact/decision/experience write+query path, plus an end-of-session
//! synthesizer that folds a session's nodes into an `Experience`.

use crate::error::Result;
use crate::llm::{ChatMessage, CompletionRequest, LLMClient};
use crate::memory::store::SqliteMemoryStore;
use crate::memory::types::{Node, NodeQuery, NodeType, Provenance, Tier};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::instrument;

const SESSION_KEY: &str = "session_id";

/// High-level write/query surface for a single task or session's working
/// memory. Every node this façade creates is tagged with `session_id` in
/// its metadata so [`TaskMemory::session_nodes`] can find it again.
pub struct TaskMemory {
    store: SqliteMemoryStore,
    session_id: String,
}

impl TaskMemory {
    pub fn new(store: SqliteMemoryStore, session_id: impl Into<String>) -> Self {
        Self {
            store,
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn tag(&self, node: Node) -> Node {
        let mut metadata = node.metadata.clone().unwrap_or_default();
        metadata.insert(SESSION_KEY.to_string(), Value::String(self.session_id.clone()));
        node.with_metadata(metadata)
    }

    /// Record a `Fact` node in the current session.
    #[instrument(skip(self, content))]
    pub fn record_fact(&self, content: impl Into<String>, provenance: Option<Provenance>) -> Result<Node> {
        let mut node = Node::new(NodeType::Fact, content);
        if let Some(p) = provenance {
            node = node.with_provenance(p);
        }
        let node = self.tag(node);
        self.store.create_node(&node)?;
        Ok(node)
    }

    /// Record an `Experience` node in the current session.
    #[instrument(skip(self, content))]
    pub fn record_experience(
        &self,
        content: impl Into<String>,
        provenance: Option<Provenance>,
    ) -> Result<Node> {
        let mut node = Node::new(NodeType::Experience, content);
        if let Some(p) = provenance {
            node = node.with_provenance(p);
        }
        let node = self.tag(node);
        self.store.create_node(&node)?;
        Ok(node)
    }

    /// Record a `Decision` node plus its side-table row (see the reasoning
    /// module for the fuller goal/decision/option/action graph).
    #[instrument(skip(self, content, prompt))]
    pub fn record_decision(
        &self,
        content: impl Into<String>,
        decision_type: impl Into<String>,
        prompt: Option<String>,
    ) -> Result<Node> {
        let node = Node::new(NodeType::Decision, content);
        let node = self.tag(node);
        self.store.create_node(&node)?;

        let mut record = super::store::DecisionRecord::new(node.id.clone(), decision_type);
        record.prompt = prompt;
        self.store.create_decision(&record)?;

        Ok(node)
    }

    /// Find a node whose content matches `content` exactly, among this
    /// session's nodes. Embedding-based similarity is a reserved future
    /// extension, not implemented here.
    pub fn find_similar(&self, content: &str) -> Result<Option<Node>> {
        Ok(self
            .session_nodes()?
            .into_iter()
            .find(|n| n.content == content))
    }

    /// All nodes tagged with this session, task tier first.
    pub fn session_nodes(&self) -> Result<Vec<Node>> {
        let query = NodeQuery::new().tiers(vec![Tier::Task, Tier::Session]);
        let nodes = self.store.list_nodes(&query)?;
        Ok(nodes
            .into_iter()
            .filter(|n| self.has_session_tag(n))
            .collect())
    }

    fn has_session_tag(&self, node: &Node) -> bool {
        node.metadata
            .as_ref()
            .and_then(|m| m.get(SESSION_KEY))
            .and_then(|v| v.as_str())
            .map(|s| s == self.session_id)
            .unwrap_or(false)
    }

    pub fn store(&self) -> &SqliteMemoryStore {
        &self.store
    }
}

/// Outcome of summarizing a session's recorded nodes.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: String,
    pub node_count: usize,
    pub summary: String,
    pub experience_node_id: crate::memory::types::NodeId,
}

/// Produces an end-of-session natural-language summary via an `LLMClient`
/// and stores it back as an `Experience` node.
pub struct Synthesizer {
    llm: Arc<dyn LLMClient>,
}

impl Synthesizer {
    pub fn new(llm: Arc<dyn LLMClient>) -> Self {
        Self { llm }
    }

    #[instrument(skip(self, task_memory))]
    pub async fn synthesize(&self, task_memory: &TaskMemory) -> Result<SessionSummary> {
        let nodes = task_memory.session_nodes()?;

        let mut by_type: HashMap<String, Vec<&Node>> = HashMap::new();
        for node in &nodes {
            by_type.entry(node.node_type.to_string()).or_default().push(node);
        }

        let mut body = String::new();
        for (kind, items) in &by_type {
            body.push_str(&format!("## {}\n", kind));
            for item in items {
                body.push_str(&format!("- {}\n", item.content));
            }
        }

        let request = CompletionRequest::new()
            .with_system(
                "Summarize this session's recorded facts, decisions, and experiences \
                 into a concise paragraph a future session can use as working context.",
            )
            .with_message(ChatMessage::user(body));

        let response = self.llm.complete(request).await?;
        let summary_node = task_memory.record_experience(response.content.clone(), None)?;

        Ok(SessionSummary {
            session_id: task_memory.session_id().to_string(),
            node_count: nodes.len(),
            summary: response.content,
            experience_node_id: summary_node.id,
        })
    }
}
