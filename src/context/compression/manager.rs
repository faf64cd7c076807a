//! Compression manager: choose a method per input by size, allocate a
//! token budget across chunks weighted by relevance, and delegate to the
//! extractive/abstractive/incremental compressors.

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::compression::abstractive::AbstractiveCompressor;
use crate::context::compression::estimate_tokens;
use crate::context::compression::extractive::ExtractiveCompressor;
use crate::context::compression::incremental::IncrementalCompressor;
use crate::error::Result;
use crate::llm::LLMClient;
use crate::memory::EmbeddingProvider;

const PASSTHROUGH_THRESHOLD: usize = 2000;
const HYBRID_THRESHOLD: usize = 8000;
const QUERY_PREFIX_CHARS: usize = 200;
const MIN_CHUNK_ALLOCATION: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompressionMethod {
    Passthrough,
    Extractive,
    Abstractive,
    Hybrid,
}

/// A unit of context to compress: a stable `id` for incremental caching,
/// the text itself, and a relevance weight used when splitting a shared
/// budget across several chunks.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub content: String,
    pub weight: f64,
}

impl Chunk {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            weight: 1.0,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CompressionResult {
    pub content: String,
    pub method: CompressionMethod,
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    pub allocated_budget: usize,
    pub cached: bool,
    pub stages: Vec<String>,
}

impl CompressionResult {
    pub fn compression_ratio(&self) -> f64 {
        if self.original_tokens == 0 {
            1.0
        } else {
            self.compressed_tokens as f64 / self.original_tokens as f64
        }
    }
}

pub struct CompressionManager {
    extractive: ExtractiveCompressor,
    abstractive: AbstractiveCompressor,
    incremental: IncrementalCompressor,
}

impl CompressionManager {
    pub fn new(llm: Option<Arc<dyn LLMClient>>) -> Self {
        Self {
            extractive: ExtractiveCompressor::new(),
            abstractive: AbstractiveCompressor::new(llm),
            incremental: IncrementalCompressor::new(),
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.extractive = ExtractiveCompressor::with_embedder(embedder);
        self
    }

    fn select_method(token_count: usize, target_tokens: usize) -> CompressionMethod {
        if token_count <= target_tokens || token_count <= PASSTHROUGH_THRESHOLD {
            CompressionMethod::Passthrough
        } else if token_count <= HYBRID_THRESHOLD {
            CompressionMethod::Extractive
        } else {
            CompressionMethod::Hybrid
        }
    }

    /// Compress a single chunk to `target_tokens`, picking a method by
    /// input size and routing extractive work through the incremental
    /// cache keyed on the chunk's id.
    pub async fn compress_chunk(
        &self,
        chunk: &Chunk,
        target_tokens: usize,
        query: &str,
    ) -> Result<CompressionResult> {
        let original_tokens = estimate_tokens(&chunk.content);
        let method = Self::select_method(original_tokens, target_tokens);

        if method == CompressionMethod::Passthrough {
            return Ok(CompressionResult {
                content: chunk.content.clone(),
                method,
                original_tokens,
                compressed_tokens: original_tokens,
                allocated_budget: target_tokens,
                cached: false,
                stages: vec!["passthrough".to_string()],
            });
        }

        let (compressed, cached, stages) = match method {
            CompressionMethod::Hybrid => {
                let extractive_target = (target_tokens * 2).min(original_tokens.max(1));
                let narrowed = self
                    .incremental
                    .compress(
                        &format!("{}:extractive", chunk.id),
                        &chunk.content,
                        extractive_target,
                        query,
                    )
                    .await?;
                let abstracted = self
                    .abstractive
                    .compress(&narrowed.content, target_tokens, false, false, query)
                    .await?;
                let mut stages = narrowed.stages;
                stages.push("abstractive".to_string());
                (abstracted, narrowed.cached, stages)
            }
            CompressionMethod::Extractive => {
                let outcome = self.incremental.compress(&chunk.id, &chunk.content, target_tokens, query).await?;
                (outcome.content, outcome.cached, outcome.stages)
            }
            CompressionMethod::Abstractive => {
                let abstracted = self
                    .abstractive
                    .compress(&chunk.content, target_tokens, false, false, query)
                    .await?;
                (abstracted, false, vec!["abstractive".to_string()])
            }
            CompressionMethod::Passthrough => unreachable!(),
        };

        let compressed_tokens = estimate_tokens(&compressed);
        Ok(CompressionResult {
            content: compressed,
            method,
            original_tokens,
            compressed_tokens,
            allocated_budget: target_tokens,
            cached,
            stages,
        })
    }

    /// Allocate `total_budget` tokens across `chunks` weighted by
    /// relevance to `query`, compress each to its share, and concatenate
    /// the results in order with a blank line between chunks.
    pub async fn compress_chunks(
        &self,
        chunks: &[Chunk],
        total_budget: usize,
        query: &str,
    ) -> Result<CompressionResult> {
        if chunks.is_empty() {
            return Ok(CompressionResult {
                content: String::new(),
                method: CompressionMethod::Passthrough,
                original_tokens: 0,
                compressed_tokens: 0,
                allocated_budget: total_budget,
                cached: false,
                stages: Vec::new(),
            });
        }

        let weights = Self::relevance_weights(chunks, query);
        let allocations = Self::allocate_budget(chunks, &weights, total_budget);

        let mut pieces = Vec::with_capacity(chunks.len());
        let mut original_tokens = 0usize;
        let mut allocated_budget = 0usize;
        let mut any_compressed = false;
        let mut any_cached = false;
        let mut stages: Vec<String> = Vec::new();

        for (chunk, budget) in chunks.iter().zip(allocations.iter()) {
            let result = self.compress_chunk(chunk, *budget, query).await?;
            original_tokens += result.original_tokens;
            allocated_budget += result.allocated_budget;
            if result.method != CompressionMethod::Passthrough {
                any_compressed = true;
            }
            if result.cached {
                any_cached = true;
            }
            for stage in result.stages {
                if !stages.contains(&stage) {
                    stages.push(stage);
                }
            }
            pieces.push(result.content);
        }

        let content = pieces.join("\n\n");
        let separator_tokens = chunks.len().saturating_sub(1) * 2;
        let compressed_tokens = estimate_tokens(&content).max(separator_tokens);

        Ok(CompressionResult {
            content,
            method: if any_compressed {
                CompressionMethod::Hybrid
            } else {
                CompressionMethod::Passthrough
            },
            original_tokens,
            compressed_tokens,
            allocated_budget,
            cached: any_cached,
            stages,
        })
    }

    /// Cosine similarity between a bag-of-words query vector and each
    /// chunk's first 200 characters, blended with the chunk's own weight.
    /// Falls back to plain weights when `query` is empty.
    fn relevance_weights(chunks: &[Chunk], query: &str) -> Vec<f64> {
        if query.trim().is_empty() {
            return chunks.iter().map(|c| c.weight.max(0.0)).collect();
        }

        let query_vec = bag_of_words(query);
        chunks
            .iter()
            .map(|c| {
                let prefix: String = c.content.chars().take(QUERY_PREFIX_CHARS).collect();
                let similarity = cosine_similarity(&query_vec, &bag_of_words(&prefix));
                c.weight.max(0.0) * (0.5 + similarity)
            })
            .collect()
    }

    /// `alloc_i = min(original_i, floor(budget * weight_i))`, then bump any
    /// chunk under the minimum allocation up to it (capped at its own
    /// content), then hand any leftover headroom -- budget freed up because
    /// some chunks were capped below their weighted share by how much
    /// content they actually have -- to chunks in descending relevance
    /// order, up to each chunk's own content cap.
    fn allocate_budget(chunks: &[Chunk], weights: &[f64], total_budget: usize) -> Vec<usize> {
        let n = chunks.len();
        if n == 0 {
            return Vec::new();
        }

        let originals: Vec<usize> = chunks.iter().map(|c| estimate_tokens(&c.content)).collect();

        let weight_sum: f64 = weights.iter().sum();
        let normalized: Vec<f64> = if weight_sum > 0.0 {
            weights.iter().map(|w| w.max(0.0) / weight_sum).collect()
        } else {
            vec![1.0 / n as f64; n]
        };

        let mut allocations: Vec<usize> = normalized
            .iter()
            .zip(&originals)
            .map(|(w, &original)| {
                let raw = (w * total_budget as f64).floor() as usize;
                raw.min(original)
            })
            .collect();

        for i in 0..n {
            if allocations[i] < MIN_CHUNK_ALLOCATION && originals[i] >= MIN_CHUNK_ALLOCATION {
                allocations[i] = MIN_CHUNK_ALLOCATION.min(originals[i]);
            }
        }

        let allocated: usize = allocations.iter().sum();
        let mut headroom = total_budget.saturating_sub(allocated);

        if headroom > 0 {
            let mut order: Vec<usize> = (0..n).collect();
            order.sort_by(|&a, &b| {
                normalized[b].partial_cmp(&normalized[a]).unwrap_or(std::cmp::Ordering::Equal)
            });

            for i in order {
                if headroom == 0 {
                    break;
                }
                let room = originals[i].saturating_sub(allocations[i]);
                let take = room.min(headroom);
                allocations[i] += take;
                headroom -= take;
            }
        }

        allocations
    }
}

fn bag_of_words(text: &str) -> HashMap<String, f64> {
    let mut map = HashMap::new();
    for word in text.to_lowercase().split_whitespace() {
        *map.entry(word.to_string()).or_insert(0.0) += 1.0;
    }
    map
}

fn cosine_similarity(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
    let dot: f64 = a.iter().map(|(k, v)| v * b.get(k).copied().unwrap_or(0.0)).sum();
    let norm_a: f64 = a.values().map(|v| v * v).sum::<f64>().sqrt();
    let norm_b: f64 = b.values().map(|v| v * v).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_method_passes_through_small_input() {
        assert_eq!(CompressionManager::select_method(500, 1000), CompressionMethod::Passthrough);
    }

    #[test]
    fn select_method_uses_extractive_below_hybrid_threshold() {
        assert_eq!(CompressionManager::select_method(5000, 200), CompressionMethod::Extractive);
    }

    #[test]
    fn select_method_uses_hybrid_above_threshold() {
        assert_eq!(CompressionManager::select_method(20000, 200), CompressionMethod::Hybrid);
    }

    #[test]
    fn allocate_budget_never_exceeds_a_chunk_original_tokens() {
        // "word " x 200 is ~260 estimated tokens; a weighted share of 1000
        // tokens would otherwise hand chunk "a" far more than it has content
        // for.
        let chunks = vec![
            Chunk::new("a", "word ".repeat(200)),
            Chunk::new("b", "word ".repeat(200)).with_weight(2.0),
            Chunk::new("c", "word ".repeat(200)).with_weight(0.5),
        ];
        let weights = CompressionManager::relevance_weights(&chunks, "");
        let allocations = CompressionManager::allocate_budget(&chunks, &weights, 1000);
        for (chunk, alloc) in chunks.iter().zip(&allocations) {
            assert!(*alloc <= estimate_tokens(&chunk.content));
        }
        assert!(allocations.iter().sum::<usize>() <= 1000);
    }

    #[test]
    fn allocate_budget_redistributes_capped_headroom_by_relevance() {
        // "b" is the highest-weight chunk but only has ~13 tokens of
        // content; the budget it can't use should flow to the next most
        // relevant chunk ("a") instead of going unused.
        let chunks = vec![
            Chunk::new("a", "word ".repeat(200)).with_weight(1.0),
            Chunk::new("b", "short").with_weight(5.0),
        ];
        let weights = CompressionManager::relevance_weights(&chunks, "");
        let allocations = CompressionManager::allocate_budget(&chunks, &weights, 1000);

        let b_original = estimate_tokens("short");
        assert_eq!(allocations[1], b_original);
        assert_eq!(allocations[0], estimate_tokens(&chunks[0].content));
    }

    #[test]
    fn allocate_budget_bumps_small_chunks_to_the_minimum() {
        let chunks = vec![
            Chunk::new("a", "word ".repeat(200)).with_weight(100.0),
            Chunk::new("b", "word ".repeat(60)).with_weight(0.01),
        ];
        let weights = CompressionManager::relevance_weights(&chunks, "");
        let allocations = CompressionManager::allocate_budget(&chunks, &weights, 1000);
        assert!(allocations[1] >= MIN_CHUNK_ALLOCATION.min(estimate_tokens(&chunks[1].content)));
    }

    #[tokio::test]
    async fn compress_chunks_concatenates_in_order() {
        let manager = CompressionManager::new(None);
        let chunks = vec![Chunk::new("a", "short chunk one"), Chunk::new("b", "short chunk two")];
        let result = manager.compress_chunks(&chunks, 1000, "").await.unwrap();
        assert!(result.content.contains("short chunk one"));
        assert!(result.content.contains("short chunk two"));
        assert_eq!(result.method, CompressionMethod::Passthrough);
    }

    #[tokio::test]
    async fn compress_chunk_reports_a_cache_miss_then_a_hit() {
        let manager = CompressionManager::new(None);
        let chunk = Chunk::new("doc-1", "word ".repeat(2000));

        let first = manager.compress_chunk(&chunk, 100, "").await.unwrap();
        assert!(!first.cached);
        assert_eq!(first.stages, vec!["extractive".to_string()]);

        let second = manager.compress_chunk(&chunk, 100, "").await.unwrap();
        assert!(second.cached);
        assert_eq!(second.stages, vec!["incremental".to_string()]);
        assert_eq!(second.allocated_budget, 100);
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn allocate_budget_never_overshoots_chunk_or_total(
            word_counts in prop::collection::vec(1usize..300, 1..8),
            weights in prop::collection::vec(0.01f64..10.0, 1..8),
            total_budget in 0usize..2000,
        ) {
            let n = word_counts.len().min(weights.len());
            let chunks: Vec<Chunk> = word_counts[..n]
                .iter()
                .enumerate()
                .map(|(i, words)| Chunk::new(i.to_string(), "word ".repeat(*words)))
                .collect();
            let weights = &weights[..n];
            let allocations = CompressionManager::allocate_budget(&chunks, weights, total_budget);

            let originals: Vec<usize> = chunks.iter().map(|c| estimate_tokens(&c.content)).collect();
            for (alloc, original) in allocations.iter().zip(&originals) {
                prop_assert!(alloc <= original);
            }
            let allocated: usize = allocations.iter().sum();
            prop_assert!(allocated <= total_budget);

            // No headroom should be left unused while some chunk still has
            // spare original-token room to receive it.
            let any_room_left = allocations.iter().zip(&originals).any(|(a, o)| a < o);
            if allocated < total_budget {
                prop_assert!(!any_room_left);
            }
        }
    }
}
