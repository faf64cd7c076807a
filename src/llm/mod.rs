//! LLM client abstraction with a sub-call router.
//!
//! This module provides the `LLMClient` capability, a reference
//! Anthropic-backed implementation, and the `SubCallRouter` that mediates
//! recursive LM calls requested by an embedded code interpreter: selecting
//! a model tier per request, wrapping the call through a circuit breaker,
//! and pricing the result.
//!
//! ## Example
//!
//! ```rust,ignore
//! use rlm_engine::llm::{AnthropicClient, ClientConfig, CompletionRequest, ChatMessage};
//!
//! let client = AnthropicClient::new(
//!     ClientConfig::new("your-api-key")
//!         .with_default_model("claude-3-5-sonnet-20241022")
//! );
//!
//! let request = CompletionRequest::new()
//!     .with_message(ChatMessage::user("Hello"));
//!
//! let response = client.complete(request).await?;
//! ```

mod batch;
mod bridge;
mod cache;
mod client;
mod router;
mod types;

pub use batch::{
    BatchConfig, BatchExecutor, BatchQueryResult, BatchedLLMQuery, BatchedQueryResults,
    DEFAULT_MAX_PARALLEL,
};
pub use bridge::CallbackBridge;
pub use cache::{
    apply_cache_markers, find_cache_breakpoints, CacheEntry, CacheKey, CacheStats, PromptCache,
};
pub use client::{AnthropicClient, ClientConfig, LLMClient, LocalEmbeddingProvider, TrackedClient};
pub use router::{CallRequest, CallResponse, SubCallRouter, TierDefaults, TierHint};
pub use types::{
    CacheControl, ChatMessage, ChatRole, CompletionRequest, CompletionResponse, CostTracker,
    EmbeddingRequest, EmbeddingResponse, ModelCosts, ModelSpec, ModelTier, Provider, StopReason,
    TokenUsage,
};
