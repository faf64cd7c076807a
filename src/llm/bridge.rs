//! Callback bridges: the two higher-order capabilities an embedded code
//! interpreter uses to reach back out to the LM through the sub-call
//! router, without the interpreter ever holding a mutable reference to it.

use std::sync::Arc;

use crate::error::Result;
use crate::llm::router::{CallRequest, SubCallRouter, TierHint};

/// An immutable snapshot of (router, depth, budget, parent context) handed
/// to an embedded interpreter. `with_*` methods return modified copies;
/// none of them mutate `self` or the router.
#[derive(Clone)]
pub struct CallbackBridge {
    router: Arc<SubCallRouter>,
    depth: u32,
    budget: u64,
    parent_context: String,
}

impl CallbackBridge {
    pub fn new(router: Arc<SubCallRouter>) -> Self {
        Self {
            router,
            depth: 0,
            budget: 0,
            parent_context: String::new(),
        }
    }

    pub fn with_depth(&self, depth: u32) -> Self {
        Self {
            depth,
            ..self.clone()
        }
    }

    pub fn with_budget(&self, budget: u64) -> Self {
        Self {
            budget,
            ..self.clone()
        }
    }

    pub fn with_context(&self, context: impl Into<String>) -> Self {
        Self {
            parent_context: context.into(),
            ..self.clone()
        }
    }

    fn request(&self, prompt: impl Into<String>, context: impl Into<String>, model: Option<&str>) -> CallRequest {
        let context = context.into();
        let merged_context = if self.parent_context.is_empty() {
            context
        } else if context.is_empty() {
            self.parent_context.clone()
        } else {
            format!("{}\n\n{}", self.parent_context, context)
        };

        let mut req = CallRequest::new(prompt)
            .with_context(merged_context)
            .with_depth(self.depth)
            .with_budget(self.budget);
        if let Some(hint) = model.and_then(TierHint::parse) {
            req = req.with_model(hint);
        }
        req
    }

    /// `HandleLLMCall(prompt, context, model) -> text`.
    pub async fn handle_llm_call(
        &self,
        prompt: impl Into<String>,
        context: impl Into<String>,
        model: Option<&str>,
    ) -> Result<String> {
        let req = self.request(prompt, context, model);
        let response = self.router.call(req).await?;
        Ok(response.response)
    }

    /// `HandleLLMBatch(prompts, contexts, model) -> [text]`. Preserves
    /// input order; the first error short-circuits the batch.
    pub async fn handle_llm_batch(
        &self,
        prompts: Vec<String>,
        contexts: Vec<String>,
        model: Option<&str>,
    ) -> Result<Vec<String>> {
        let reqs: Vec<CallRequest> = prompts
            .into_iter()
            .enumerate()
            .map(|(i, prompt)| {
                let context = contexts.get(i).cloned().unwrap_or_default();
                self.request(prompt, context, model)
            })
            .collect();

        let results = self.router.batch_call(reqs).await;
        results
            .into_iter()
            .map(|r| r.map(|resp| resp.response))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::router::SubCallRouter;
    use crate::llm::{
        ChatMessage, CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse, LLMClient,
        ModelSpec, Provider, TokenUsage,
    };
    use crate::resilience::BreakerRegistry;
    use async_trait::async_trait;
    use chrono::Utc;

    struct StubClient;

    #[async_trait]
    impl LLMClient for StubClient {
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
            let content = request.messages.last().map(|m: &ChatMessage| m.content.clone()).unwrap_or_default();
            Ok(CompletionResponse {
                id: "stub".to_string(),
                model: "stub-model".to_string(),
                content,
                stop_reason: None,
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
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

    #[tokio::test]
    async fn with_context_merges_parent_and_call_context() {
        let router = Arc::new(SubCallRouter::new(
            Arc::new(StubClient),
            Arc::new(BreakerRegistry::new()),
            5,
        ));
        let bridge = CallbackBridge::new(router).with_context("parent notes");
        let req = bridge.request("do something interesting here", "local notes", None);
        assert!(req.context.contains("parent notes"));
        assert!(req.context.contains("local notes"));
    }

    #[tokio::test]
    async fn handle_llm_batch_preserves_order() {
        let router = Arc::new(SubCallRouter::new(
            Arc::new(StubClient),
            Arc::new(BreakerRegistry::new()),
            5,
        ));
        let bridge = CallbackBridge::new(router);
        let results = bridge
            .handle_llm_batch(
                vec!["first one here".to_string(), "second one here".to_string()],
                vec![],
                None,
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
    }
}
