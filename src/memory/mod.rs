//! Hypergraph memory system with tiered evolution.
//!
//! The memory module provides persistent storage for knowledge in a hypergraph
//! structure with automatic tier evolution:
//!
//! - **Task tier**: Working memory for the current task
//! - **Session tier**: Accumulated knowledge during a session
//! - **LongTerm tier**: Persistent knowledge across sessions
//! - **Archive tier**: Decayed but preserved knowledge
//!
//! ## Example
//!
//! ```rust,ignore
//! use rlm_engine::memory::{SqliteMemoryStore, Node, NodeType, Tier};
//!
//! let store = SqliteMemoryStore::in_memory()?;
//!
//! // Add a fact
//! let fact = Node::new(NodeType::Fact, "The API uses JWT for auth")
//!     .with_confidence(0.95);
//! store.create_node(&fact)?;
//!
//! // Search for related knowledge
//! let results = store.search_content("authentication", 10)?;
//!
//! // Promote important facts
//! store.promote(&[fact.id], "Frequently accessed")?;
//! ```

mod embedding;
mod schema;
mod search;
mod store;
mod task;
mod types;

pub use embedding::{CachedEmbeddingProvider, EmbeddingIndex, EmbeddingIndexConfig, EmbeddingProvider};
pub use schema::{get_schema_version, initialize_schema, is_initialized, SCHEMA_VERSION};
pub use search::{HybridSearchOptions, HybridSearcher, OutcomeRecorder, ScoredNode};
pub use store::{
    DecisionRecord, EvolutionEntry, MemoryStats, RetrievalOutcome, SqliteMemoryStore,
};
pub use task::{SessionSummary, Synthesizer, TaskMemory};
pub use types::{
    ConnectedOptions, ConsolidationResult, Direction, EdgeId, EdgeMember, EdgeType, HyperEdge,
    MemberRole, Node, NodeId, NodeQuery, NodeType, Provenance, Tier,
};
