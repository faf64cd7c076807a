//! Sub-call router: mediates recursive LM calls requested by an embedded
//! code interpreter or the agent loop, selecting a model tier per request
//! and wrapping each call through the circuit breaker for that tier.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::instrument;

use crate::error::{Error, Result};
use crate::llm::{ChatMessage, CompletionRequest, LLMClient, ModelSpec, ModelTier};
use crate::resilience::BreakerRegistry;

/// A tier hint carried on a sub-call request, distinct from `ModelTier`
/// because `reasoning` has no dedicated model tier of its own: it simply
/// prefers the flagship model and shares the powerful tier's breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierHint {
    Fast,
    Balanced,
    Powerful,
    Reasoning,
}

impl TierHint {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "fast" => Some(Self::Fast),
            "balanced" => Some(Self::Balanced),
            "powerful" => Some(Self::Powerful),
            "reasoning" => Some(Self::Reasoning),
            _ => None,
        }
    }

    pub fn model_tier(&self) -> ModelTier {
        match self {
            Self::Fast => ModelTier::Fast,
            Self::Balanced => ModelTier::Balanced,
            Self::Powerful | Self::Reasoning => ModelTier::Flagship,
        }
    }

    /// The `BreakerRegistry` key this hint routes through.
    pub fn breaker_key(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Balanced => "balanced",
            Self::Powerful | Self::Reasoning => "powerful",
        }
    }
}

/// Keywords whose presence in a prompt nudges the default heuristic toward
/// the reasoning tier.
const REASONING_KEYWORDS: &[&str] = &["reasoning", "reason about", "plan", "explain"];

/// Prompt length, in characters, below which the default heuristic treats
/// a prompt as "short".
const SHORT_PROMPT_CHARS: usize = 120;

/// Remaining token budget below which the default heuristic treats the
/// budget as "small".
const SMALL_BUDGET_TOKENS: u64 = 2_000;

/// Default models used to price each tier when a request has no `model`
/// override and the client doesn't expose per-model pricing some other way.
#[derive(Debug, Clone)]
pub struct TierDefaults {
    pub flagship: ModelSpec,
    pub balanced: ModelSpec,
    pub fast: ModelSpec,
}

impl Default for TierDefaults {
    fn default() -> Self {
        Self {
            flagship: ModelSpec::claude_opus(),
            balanced: ModelSpec::claude_sonnet(),
            fast: ModelSpec::claude_haiku(),
        }
    }
}

impl TierDefaults {
    fn model_for(&self, tier: ModelTier) -> &ModelSpec {
        match tier {
            ModelTier::Flagship => &self.flagship,
            ModelTier::Balanced => &self.balanced,
            ModelTier::Fast => &self.fast,
        }
    }
}

/// A recursive LM call request from a caller (typically an embedded code
/// interpreter).
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub prompt: String,
    pub context: String,
    /// Tier hint: `fast`, `balanced`, `powerful`, `reasoning`, or `None` to
    /// use the heuristic default.
    pub model: Option<TierHint>,
    pub depth: u32,
    /// Remaining token budget available to this call and its descendants.
    pub budget: u64,
    pub max_tokens: u32,
}

impl CallRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            context: String::new(),
            model: None,
            depth: 0,
            budget: SMALL_BUDGET_TOKENS * 10,
            max_tokens: 1024,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_model(mut self, hint: TierHint) -> Self {
        self.model = Some(hint);
        self
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_budget(mut self, budget: u64) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Outcome of a sub-call.
#[derive(Debug, Clone)]
pub struct CallResponse {
    pub response: String,
    pub model_used: String,
    pub tokens_used: u64,
    pub cost: f64,
}

#[derive(Debug, Default, Clone, Copy)]
struct RouterStats {
    calls: u64,
    total_tokens: u64,
    total_cost: f64,
}

/// Mediates recursive LM calls on behalf of an embedded interpreter.
pub struct SubCallRouter {
    llm: Arc<dyn LLMClient>,
    breakers: Arc<BreakerRegistry>,
    tier_defaults: TierDefaults,
    max_depth: u32,
    stats: AsyncMutex<RouterStats>,
}

impl SubCallRouter {
    pub fn new(llm: Arc<dyn LLMClient>, breakers: Arc<BreakerRegistry>, max_depth: u32) -> Self {
        Self {
            llm,
            breakers,
            tier_defaults: TierDefaults::default(),
            max_depth,
            stats: AsyncMutex::new(RouterStats::default()),
        }
    }

    pub fn with_tier_defaults(mut self, defaults: TierDefaults) -> Self {
        self.tier_defaults = defaults;
        self
    }

    /// Select a tier: the request's hint if present, else the deterministic
    /// default heuristic.
    fn select_tier(&self, req: &CallRequest) -> TierHint {
        if let Some(hint) = req.model {
            return hint;
        }

        let prompt_lower = req.prompt.to_lowercase();
        if req.budget < SMALL_BUDGET_TOKENS || req.prompt.len() < SHORT_PROMPT_CHARS {
            TierHint::Fast
        } else if REASONING_KEYWORDS.iter().any(|kw| prompt_lower.contains(kw)) {
            TierHint::Reasoning
        } else {
            TierHint::Balanced
        }
    }

    fn build_scaffold(depth: u32, budget: u64, prompt: &str, context: &str) -> String {
        let mut scaffold = format!("depth: {depth}\nbudget_remaining: {budget}\n\n## Task\n{prompt}\n");
        if !context.is_empty() {
            scaffold.push_str(&format!("\n## Context\n{context}\n"));
        }
        scaffold
    }

    /// Run a single sub-call: validate depth, select tier, wrap through the
    /// tier's circuit breaker, invoke the client, and price the result.
    #[instrument(skip(self, req), fields(depth = req.depth))]
    pub async fn call(&self, req: CallRequest) -> Result<CallResponse> {
        if req.depth >= self.max_depth {
            return Err(Error::max_depth_exceeded(self.max_depth));
        }

        let hint = self.select_tier(&req);
        let model_spec = self.tier_defaults.model_for(hint.model_tier()).clone();
        let breaker = self.breakers.get_or_create(hint.breaker_key()).await;

        let prompt = Self::build_scaffold(req.depth, req.budget, &req.prompt, &req.context);
        let request = CompletionRequest::new()
            .with_model(model_spec.id.clone())
            .with_message(ChatMessage::user(prompt))
            .with_max_tokens(req.max_tokens);

        let llm = self.llm.clone();
        let response = breaker
            .call(|| async move { llm.complete(request).await })
            .await?;

        let cost = model_spec.calculate_cost_with_cache(
            response.usage.input_tokens,
            response.usage.output_tokens,
            response.usage.cache_read_tokens.unwrap_or(0),
        );
        let tokens_used = response.usage.input_tokens + response.usage.output_tokens;

        {
            let mut stats = self.stats.lock().await;
            stats.calls += 1;
            stats.total_tokens += tokens_used;
            stats.total_cost += cost;
        }

        Ok(CallResponse {
            response: response.content,
            model_used: model_spec.id,
            tokens_used,
            cost,
        })
    }

    /// Run each request through `call`, preserving input order. The caller
    /// is responsible for dividing budget across `reqs` proportionally
    /// before invoking this.
    pub async fn batch_call(&self, reqs: Vec<CallRequest>) -> Vec<Result<CallResponse>> {
        let mut results = Vec::with_capacity(reqs.len());
        for req in reqs {
            results.push(self.call(req).await);
        }
        results
    }

    pub async fn stats(&self) -> (u64, u64, f64) {
        let stats = self.stats.lock().await;
        (stats.calls, stats.total_tokens, stats.total_cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CompletionResponse, EmbeddingRequest, EmbeddingResponse, Provider, TokenUsage};
    use async_trait::async_trait;
    use chrono::Utc;

    struct StubClient;

    #[async_trait]
    impl LLMClient for StubClient {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse> {
            Ok(CompletionResponse {
                id: "stub".to_string(),
                model: "stub-model".to_string(),
                content: "stub response".to_string(),
                stop_reason: None,
                usage: TokenUsage {
                    input_tokens: 100,
                    output_tokens: 50,
                    cache_read_tokens: None,
                    cache_creation_tokens: None,
                },
                timestamp: Utc::now(),
                cost: None,
            })
        }

        async fn embed(&self, _request: EmbeddingRequest) -> Result<EmbeddingResponse> {
            unimplemented!()
        }

        fn provider(&self) -> Provider {
            Provider::Anthropic
        }

        fn available_models(&self) -> Vec<ModelSpec> {
            vec![]
        }
    }

    #[test]
    fn tier_hint_parses_case_insensitively() {
        assert_eq!(TierHint::parse("FAST"), Some(TierHint::Fast));
        assert_eq!(TierHint::parse("reasoning"), Some(TierHint::Reasoning));
        assert_eq!(TierHint::parse("nonsense"), None);
    }

    #[tokio::test]
    async fn heuristic_prefers_fast_for_short_prompt() {
        let router = SubCallRouter::new(Arc::new(StubClient), Arc::new(BreakerRegistry::new()), 5);
        let hint = router.select_tier(&CallRequest::new("hi"));
        assert_eq!(hint, TierHint::Fast);
    }

    #[tokio::test]
    async fn heuristic_prefers_reasoning_for_planning_prompt() {
        let router = SubCallRouter::new(Arc::new(StubClient), Arc::new(BreakerRegistry::new()), 5);
        let long_prompt = "please make a plan and reason carefully about the tradeoffs here before answering in detail";
        let req = CallRequest::new(long_prompt).with_budget(50_000);
        assert_eq!(router.select_tier(&req), TierHint::Reasoning);
    }

    #[tokio::test]
    async fn call_rejects_at_max_depth() {
        let router = SubCallRouter::new(Arc::new(StubClient), Arc::new(BreakerRegistry::new()), 2);
        let req = CallRequest::new("hello").with_depth(2);
        let result = router.call(req).await;
        assert!(matches!(result, Err(Error::MaxDepthExceeded { .. })));
    }

    #[tokio::test]
    async fn call_returns_priced_response() {
        let router = SubCallRouter::new(Arc::new(StubClient), Arc::new(BreakerRegistry::new()), 5);
        let response = router.call(CallRequest::new("hello there")).await.unwrap();
        assert_eq!(response.response, "stub response");
        assert!(response.cost > 0.0);
        assert_eq!(response.tokens_used, 150);
    }

    #[tokio::test]
    async fn batch_call_preserves_order() {
        let router = SubCallRouter::new(Arc::new(StubClient), Arc::new(BreakerRegistry::new()), 5);
        let reqs = vec![
            CallRequest::new("first request here"),
            CallRequest::new("second request here"),
        ];
        let results = router.batch_call(reqs).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_ok()));
    }
}
