//! # rlm-engine
//!
//! Execution substrate for recursive language model agents: session
//! budgets and execution guarantees, a sub-call router with circuit
//! breakers, context compression, and a hypergraph memory store backing
//! task memory and a reasoning trace.
//!
//! ## Example
//!
//! ```rust,ignore
//! use rlm_engine::budget::{BudgetTracker, Limits};
//! use rlm_engine::memory::{Node, NodeType, SqliteMemoryStore};
//!
//! let tracker = BudgetTracker::new(Limits::default());
//! tracker.add_tokens(1000, 200, 0, 3.0, 15.0);
//!
//! let store = SqliteMemoryStore::in_memory()?;
//! store.create_node(&Node::new(NodeType::Fact, "the API uses JWT for auth"))?;
//! ```

pub mod budget;
pub mod context;
pub mod error;
pub mod llm;
pub mod memory;
pub mod reasoning;
pub mod resilience;

pub use budget::{
    BudgetCheck, BudgetEvent, BudgetManager, BudgetState, BudgetTracker, CancellationToken,
    Checkpoint, DegradationPlan, ExecutionGuard, GuardContext, GuaranteeConfig, Limits,
    PersistedLimits, ProjectBudget, Severity, SessionRecord, Violation,
};
pub use context::{Message, Role, SessionContext, ToolOutput};
pub use context::compression::{
    AbstractiveCompressor, Chunk, CompressionManager, CompressionMethod, CompressionResult,
    ExtractiveCompressor, HierarchicalCompressor, HierarchicalLevel, IncrementalCompressor,
    IncrementalOutcome, IncrementalStats,
};
pub use error::{Error, Result};
pub use llm::{
    AnthropicClient, BatchConfig, BatchExecutor, BatchQueryResult, BatchedLLMQuery,
    BatchedQueryResults, CallRequest, CallResponse, CallbackBridge, ChatMessage, ChatRole,
    ClientConfig, CompletionRequest, CompletionResponse, CostTracker, EmbeddingRequest,
    EmbeddingResponse, LLMClient, ModelSpec, ModelTier, Provider, SubCallRouter, TierDefaults,
    TierHint, TokenUsage,
};
pub use memory::{
    CachedEmbeddingProvider, ConnectedOptions, ConsolidationResult, DecisionRecord, Direction,
    EdgeId, EdgeMember, EdgeType, EmbeddingIndex, EmbeddingIndexConfig, EmbeddingProvider,
    EvolutionEntry, HybridSearchOptions, HybridSearcher, HyperEdge, MemberRole, MemoryStats, Node,
    NodeId, NodeQuery, NodeType, OutcomeRecorder, Provenance, RetrievalOutcome, ScoredNode,
    SessionSummary, SqliteMemoryStore, Synthesizer, TaskMemory, Tier,
};
pub use reasoning::{
    ActionView, DecisionView, GitCollaborator, GitState, OptionStatus, OptionView,
    ProcessGitCollaborator, ReasoningTrace, ReasoningTraceBuilder, WorkingDiff,
};
pub use resilience::{BreakerConfig, BreakerMetrics, BreakerRegistry, BreakerState, CircuitBreaker};
