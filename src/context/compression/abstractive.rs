//! Abstractive compression: ask an LLM to summarize content down to a
//! target token count. Falls back to extractive compression when no LLM
//! client is configured or the call fails.

use std::sync::Arc;

use crate::context::compression::extractive::ExtractiveCompressor;
use crate::error::Result;
use crate::llm::{ChatMessage, CompletionRequest, LLMClient};

pub struct AbstractiveCompressor {
    llm: Option<Arc<dyn LLMClient>>,
    fallback: ExtractiveCompressor,
}

impl AbstractiveCompressor {
    pub fn new(llm: Option<Arc<dyn LLMClient>>) -> Self {
        Self {
            llm,
            fallback: ExtractiveCompressor::new(),
        }
    }

    fn build_prompt(content: &str, target_tokens: usize, preserve_code: bool, preserve_quotes: bool, query: &str) -> String {
        let mut prompt = format!(
            "Summarize the following content in roughly {target_tokens} tokens or fewer, \
             preserving its key meaning."
        );
        if preserve_code {
            prompt.push_str(" Preserve code blocks verbatim.");
        }
        if preserve_quotes {
            prompt.push_str(" Preserve direct quotes verbatim.");
        }
        if !query.trim().is_empty() {
            prompt.push_str(&format!(" Focus especially on content relevant to: {query}."));
        }
        prompt.push_str("\n\n");
        prompt.push_str(content);
        prompt
    }

    /// Summarize `content` to roughly `target_tokens`. Falls back to
    /// extractive compression if no client is configured or the call
    /// errors.
    pub async fn compress(
        &self,
        content: &str,
        target_tokens: usize,
        preserve_code: bool,
        preserve_quotes: bool,
        query: &str,
    ) -> Result<String> {
        let Some(llm) = &self.llm else {
            return self.fallback.compress(content, target_tokens, query).await;
        };

        let prompt = Self::build_prompt(content, target_tokens, preserve_code, preserve_quotes, query);
        let request = CompletionRequest::new()
            .with_message(ChatMessage::user(prompt))
            .with_max_tokens((target_tokens as u32).max(32));

        match llm.complete(request).await {
            Ok(response) => Ok(response.content),
            Err(_) => self.fallback.compress(content, target_tokens, query).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CompletionResponse, EmbeddingRequest, EmbeddingResponse, ModelSpec, Provider, TokenUsage};
    use async_trait::async_trait;
    use chrono::Utc;

    struct FailingClient;

    #[async_trait]
    impl LLMClient for FailingClient {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse> {
            Err(crate::error::Error::provider("test", "unavailable"))
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

    struct EchoClient;

    #[async_trait]
    impl LLMClient for EchoClient {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse> {
            Ok(CompletionResponse {
                id: "echo".to_string(),
                model: "echo".to_string(),
                content: "summarized content".to_string(),
                stop_reason: None,
                usage: TokenUsage::default(),
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
    async fn falls_back_to_extractive_without_a_client() {
        let compressor = AbstractiveCompressor::new(None);
        let result = compressor
            .compress("This sentence has an important key result in it.", 10, false, false, "")
            .await
            .unwrap();
        assert!(!result.is_empty());
    }

    #[tokio::test]
    async fn falls_back_to_extractive_on_llm_error() {
        let compressor = AbstractiveCompressor::new(Some(Arc::new(FailingClient)));
        let result = compressor
            .compress("This sentence has an important key result in it.", 10, false, false, "")
            .await
            .unwrap();
        assert!(!result.is_empty());
    }

    #[tokio::test]
    async fn returns_llm_output_verbatim_on_success() {
        let compressor = AbstractiveCompressor::new(Some(Arc::new(EchoClient)));
        let result = compressor.compress("long content here", 10, true, true, "").await.unwrap();
        assert_eq!(result, "summarized content");
    }
}
