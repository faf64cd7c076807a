//! Core types for the hypergraph memory: nodes, hyperedges, and queries.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Identifier for a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::validation(format!("invalid node id: {e}")))
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a hyperedge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeId(Uuid);

impl EdgeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::validation(format!("invalid edge id: {e}")))
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for EdgeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed set of node types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Entity,
    Fact,
    Experience,
    Decision,
    Snippet,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Entity => "entity",
            Self::Fact => "fact",
            Self::Experience => "experience",
            Self::Decision => "decision",
            Self::Snippet => "snippet",
        };
        write!(f, "{s}")
    }
}

impl NodeType {
    pub fn parse(s: &str) -> Self {
        match s {
            "entity" => Self::Entity,
            "fact" => Self::Fact,
            "experience" => Self::Experience,
            "decision" => Self::Decision,
            "snippet" => Self::Snippet,
            _ => Self::Fact,
        }
    }
}

/// Retention tier. Governs default search scope; only moves forward via
/// explicit consolidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Task = 0,
    Session = 1,
    LongTerm = 2,
    Archive = 3,
}

impl Tier {
    /// Next tier forward, or `None` if already at `Archive`.
    pub fn next(&self) -> Option<Tier> {
        match self {
            Tier::Task => Some(Tier::Session),
            Tier::Session => Some(Tier::LongTerm),
            Tier::LongTerm => Some(Tier::Archive),
            Tier::Archive => None,
        }
    }

    pub fn from_i32(i: i32) -> Tier {
        match i {
            0 => Tier::Task,
            1 => Tier::Session,
            2 => Tier::LongTerm,
            _ => Tier::Archive,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Tier::Task => "task",
            Tier::Session => "session",
            Tier::LongTerm => "long_term",
            Tier::Archive => "archive",
        };
        write!(f, "{s}")
    }
}

/// Structured provenance sidecar: where a node's content came from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Provenance {
    pub source: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub branch: Option<String>,
    pub commit_hash: Option<String>,
}

impl Provenance {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_commit_hash(mut self, commit_hash: impl Into<String>) -> Self {
        self.commit_hash = Some(commit_hash.into());
        self
    }
}

/// A vertex in the hypergraph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub node_type: NodeType,
    pub subtype: Option<String>,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    pub tier: Tier,
    pub confidence: f64,
    pub provenance: Option<Provenance>,
    pub metadata: Option<HashMap<String, Value>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
}

impl Node {
    pub fn new(node_type: NodeType, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: NodeId::new(),
            node_type,
            subtype: None,
            content: content.into(),
            embedding: None,
            tier: Tier::Task,
            confidence: 1.0,
            provenance: None,
            metadata: None,
            created_at: now,
            updated_at: now,
            last_accessed: now,
            access_count: 0,
        }
    }

    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    /// Confidence is always clamped to `[0, 1]`.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = Some(provenance);
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Record access: bump count and stamp `last_accessed`. Never decreases
    /// `access_count`.
    pub fn touch(&mut self) {
        self.access_count += 1;
        self.last_accessed = Utc::now();
    }
}

/// Role a node plays within a hyperedge's membership list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Subject,
    Object,
    Context,
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Subject => "subject",
            Self::Object => "object",
            Self::Context => "context",
        };
        write!(f, "{s}")
    }
}

impl MemberRole {
    pub fn parse(s: &str) -> Self {
        match s {
            "subject" => Self::Subject,
            "object" => Self::Object,
            _ => Self::Context,
        }
    }
}

/// Closed set of hyperedge types modeling the reasoning/action graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    Spawns,
    Considers,
    Chooses,
    Rejects,
    Implements,
    Produces,
    Informs,
    Context,
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Spawns => "spawns",
            Self::Considers => "considers",
            Self::Chooses => "chooses",
            Self::Rejects => "rejects",
            Self::Implements => "implements",
            Self::Produces => "produces",
            Self::Informs => "informs",
            Self::Context => "context",
        };
        write!(f, "{s}")
    }
}

impl EdgeType {
    pub fn parse(s: &str) -> Self {
        match s {
            "spawns" => Self::Spawns,
            "considers" => Self::Considers,
            "chooses" => Self::Chooses,
            "rejects" => Self::Rejects,
            "implements" => Self::Implements,
            "produces" => Self::Produces,
            "informs" => Self::Informs,
            _ => Self::Context,
        }
    }
}

/// A single node's membership in a hyperedge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeMember {
    pub node_id: NodeId,
    pub role: MemberRole,
    pub position: i64,
}

impl EdgeMember {
    pub fn new(node_id: NodeId, role: MemberRole, position: i64) -> Self {
        Self {
            node_id,
            role,
            position,
        }
    }
}

/// A labeled n-ary relation over nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HyperEdge {
    pub id: EdgeId,
    pub edge_type: EdgeType,
    pub label: Option<String>,
    pub weight: f64,
    pub members: Vec<EdgeMember>,
    pub created_at: DateTime<Utc>,
    pub metadata: Option<HashMap<String, Value>>,
}

impl HyperEdge {
    pub fn new(edge_type: EdgeType, members: Vec<EdgeMember>) -> Self {
        Self {
            id: EdgeId::new(),
            edge_type,
            label: None,
            weight: 1.0,
            members,
            created_at: Utc::now(),
            metadata: None,
        }
    }

    /// Convenience constructor for the common case: one subject, one object.
    pub fn binary(
        edge_type: EdgeType,
        subject: NodeId,
        object: NodeId,
        label: impl Into<String>,
    ) -> Self {
        let members = vec![
            EdgeMember::new(subject, MemberRole::Subject, 0),
            EdgeMember::new(object, MemberRole::Object, 1),
        ];
        let mut edge = Self::new(edge_type, members);
        edge.label = Some(label.into());
        edge
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Validates the `>=1 Subject, >=1 Object` invariant.
    pub fn validate(&self) -> Result<()> {
        let has_subject = self
            .members
            .iter()
            .any(|m| matches!(m.role, MemberRole::Subject));
        let has_object = self
            .members
            .iter()
            .any(|m| matches!(m.role, MemberRole::Object));
        if !has_subject || !has_object {
            return Err(Error::validation(
                "hyperedge requires at least one Subject and one Object member",
            ));
        }
        Ok(())
    }
}

/// Traversal direction for `GetConnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
    Both,
}

/// Filter/options for `GetConnected`.
#[derive(Debug, Clone)]
pub struct ConnectedOptions {
    pub direction: Direction,
    pub max_depth: u32,
    pub tiers: Option<Vec<Tier>>,
}

impl Default for ConnectedOptions {
    fn default() -> Self {
        Self {
            direction: Direction::Both,
            max_depth: 1,
            tiers: None,
        }
    }
}

/// Filter for `ListNodes`/`query_nodes`.
#[derive(Debug, Clone, Default)]
pub struct NodeQuery {
    pub node_types: Option<Vec<NodeType>>,
    pub subtypes: Option<Vec<String>>,
    /// When true, a node matches if it has ANY of `subtypes` (union);
    /// when false and `subtypes` is set, subtype must equal the single entry.
    pub subtype_union: bool,
    pub tiers: Option<Vec<Tier>>,
    pub min_confidence: Option<f64>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl NodeQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_types(mut self, types: Vec<NodeType>) -> Self {
        self.node_types = Some(types);
        self
    }

    pub fn subtypes(mut self, subtypes: Vec<String>) -> Self {
        self.subtypes = Some(subtypes);
        self.subtype_union = true;
        self
    }

    pub fn tiers(mut self, tiers: Vec<Tier>) -> Self {
        self.tiers = Some(tiers);
        self
    }

    pub fn min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = Some(min_confidence);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Result of consolidating nodes from one tier to another.
#[derive(Debug, Clone, Default)]
pub struct ConsolidationResult {
    pub source_nodes: Vec<NodeId>,
    pub consolidated_node: Option<NodeId>,
    pub promoted_nodes: Vec<NodeId>,
    pub archived_nodes: Vec<NodeId>,
    pub summary: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_clamps_to_unit_interval() {
        let node = Node::new(NodeType::Fact, "x").with_confidence(1.5);
        assert_eq!(node.confidence, 1.0);
        let node = Node::new(NodeType::Fact, "x").with_confidence(-1.0);
        assert_eq!(node.confidence, 0.0);
    }

    #[test]
    fn tier_only_moves_forward() {
        assert_eq!(Tier::Task.next(), Some(Tier::Session));
        assert_eq!(Tier::Archive.next(), None);
    }

    #[test]
    fn touch_never_decreases_access_count() {
        let mut node = Node::new(NodeType::Fact, "x");
        assert_eq!(node.access_count, 0);
        node.touch();
        node.touch();
        assert_eq!(node.access_count, 2);
    }

    #[test]
    fn hyperedge_requires_subject_and_object() {
        let subject = NodeId::new();
        let object = NodeId::new();
        let edge = HyperEdge::binary(EdgeType::Implements, subject, object, "implements");
        assert!(edge.validate().is_ok());

        let lone = HyperEdge::new(
            EdgeType::Context,
            vec![EdgeMember::new(NodeId::new(), MemberRole::Context, 0)],
        );
        assert!(lone.validate().is_err());
    }

    #[test]
    fn node_id_roundtrips_through_string() {
        let id = NodeId::new();
        let parsed = NodeId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }
}
