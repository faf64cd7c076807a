//! Hybrid keyword + semantic search via Reciprocal Rank Fusion (RRF).

use crate::error::Result;
use crate::memory::embedding::EmbeddingIndex;
use crate::memory::store::{RetrievalOutcome, SqliteMemoryStore};
use crate::memory::types::{Node, NodeId, NodeType, Tier};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};

/// Residual filters applied after fusion, plus the result cap `L`.
#[derive(Debug, Clone, Default)]
pub struct HybridSearchOptions {
    pub node_types: Option<Vec<NodeType>>,
    pub tiers: Option<Vec<Tier>>,
    pub subtypes: Option<Vec<String>>,
    pub min_confidence: Option<f64>,
    pub limit: usize,
}

impl HybridSearchOptions {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    fn matches(&self, node: &Node) -> bool {
        if let Some(types) = &self.node_types {
            if !types.contains(&node.node_type) {
                return false;
            }
        }
        if let Some(tiers) = &self.tiers {
            if !tiers.contains(&node.tier) {
                return false;
            }
        }
        if let Some(subtypes) = &self.subtypes {
            let matches_subtype = node
                .subtype
                .as_ref()
                .map(|s| subtypes.contains(s))
                .unwrap_or(false);
            if !matches_subtype {
                return false;
            }
        }
        if let Some(min_conf) = self.min_confidence {
            if node.confidence < min_conf {
                return false;
            }
        }
        true
    }
}

/// A node with its fused relevance score.
#[derive(Debug, Clone)]
pub struct ScoredNode {
    pub node: Node,
    pub score: f64,
}

/// Records retrieval telemetry back onto the store.
pub struct OutcomeRecorder {
    store: SqliteMemoryStore,
}

impl OutcomeRecorder {
    pub fn new(store: SqliteMemoryStore) -> Self {
        Self { store }
    }

    pub fn record(&self, outcome: &RetrievalOutcome) {
        if let Err(e) = self.store.record_outcome(outcome) {
            warn!(error = %e, "failed to record retrieval outcome");
        }
    }

    pub fn mark_used(&self, query_hash: &str, node_id: &NodeId) {
        if let Err(e) = self.store.mark_outcome_used(query_hash, node_id) {
            warn!(error = %e, "failed to mark retrieval outcome used");
        }
    }
}

/// Fuses keyword (FTS5) and semantic (embedding) rankings via RRF.
pub struct HybridSearcher {
    store: SqliteMemoryStore,
    embedding_index: Option<Arc<EmbeddingIndex>>,
    outcomes: Option<OutcomeRecorder>,
    /// Weight given to the semantic ranking. Always clamped to `[0, 1]`.
    alpha: f64,
    /// RRF rank-damping constant.
    k: f64,
}

impl HybridSearcher {
    pub fn new(store: SqliteMemoryStore) -> Self {
        Self {
            store,
            embedding_index: None,
            outcomes: None,
            alpha: 0.7,
            k: 60.0,
        }
    }

    pub fn with_embedding_index(mut self, index: Arc<EmbeddingIndex>) -> Self {
        self.embedding_index = Some(index);
        self
    }

    pub fn with_outcome_recorder(mut self, recorder: OutcomeRecorder) -> Self {
        self.outcomes = Some(recorder);
        self
    }

    /// Update the semantic/keyword weighting at runtime. Always clamped.
    pub fn set_alpha(&mut self, alpha: f64) {
        self.alpha = alpha.clamp(0.0, 1.0);
    }

    #[instrument(skip(self, opts), fields(query = query))]
    pub async fn search(&self, query: &str, opts: &HybridSearchOptions) -> Result<Vec<ScoredNode>> {
        let started = Instant::now();
        let fetch_n = opts.limit.saturating_mul(3).max(1);

        let keyword_candidates = self.store.search_content(query, fetch_n)?;

        let semantic_candidates = match &self.embedding_index {
            Some(index) => match index.search(query, fetch_n).await {
                Ok(hits) => hits
                    .into_iter()
                    .filter_map(|(id, _score)| self.store.get_node(&id).ok().flatten())
                    .collect::<Vec<_>>(),
                Err(e) => {
                    debug!(error = %e, "semantic search unavailable, degrading to keyword-only");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let degraded = semantic_candidates.is_empty() && self.embedding_index.is_some();

        let (fused, mut nodes_by_id) =
            fuse_rankings(&keyword_candidates, &semantic_candidates, degraded, self.alpha, self.k);

        let query_hash = query_hash(query);
        let mut results = Vec::with_capacity(opts.limit);
        for (id, score) in fused {
            if results.len() >= opts.limit {
                break;
            }
            let node = match nodes_by_id.remove(&id) {
                Some(n) => n,
                None => continue,
            };
            if !opts.matches(&node) {
                continue;
            }

            if let Some(recorder) = &self.outcomes {
                recorder.record(&RetrievalOutcome {
                    query_hash: query_hash.clone(),
                    query_type: "hybrid".to_string(),
                    node_id: node.id.clone(),
                    node_type: node.node_type,
                    node_subtype: node.subtype.clone(),
                    relevance_score: score,
                    was_used: false,
                    context_tokens: None,
                    latency_ms: Some(started.elapsed().as_millis() as u64),
                });
            }

            results.push(ScoredNode { node, score });
        }

        Ok(results)
    }
}

/// First 8 bytes of SHA-256 over the query string, hex-encoded.
fn query_hash(query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// Fuses keyword and semantic candidate rankings via RRF, returning ids sorted
/// by descending fused score. Ties break by rank order of first occurrence
/// (keyword list scanned before semantic list) rather than by the score map's
/// unspecified iteration order, so fusion is deterministic given stable input
/// rankings.
fn fuse_rankings(
    keyword_candidates: &[Node],
    semantic_candidates: &[Node],
    degraded: bool,
    alpha: f64,
    k: f64,
) -> (Vec<(String, f64)>, HashMap<String, Node>) {
    let mut scores: HashMap<String, f64> = HashMap::new();
    let mut nodes_by_id: HashMap<String, Node> = HashMap::new();
    let mut first_seen: Vec<String> = Vec::new();

    for (i, node) in keyword_candidates.iter().enumerate() {
        let id = node.id.to_string();
        *scores.entry(id.clone()).or_insert(0.0) += (1.0 - alpha) / (k + i as f64 + 1.0);
        if !nodes_by_id.contains_key(&id) {
            first_seen.push(id.clone());
        }
        nodes_by_id.entry(id).or_insert_with(|| node.clone());
    }

    if !degraded {
        for (i, node) in semantic_candidates.iter().enumerate() {
            let id = node.id.to_string();
            *scores.entry(id.clone()).or_insert(0.0) += alpha / (k + i as f64 + 1.0);
            if !nodes_by_id.contains_key(&id) {
                first_seen.push(id.clone());
            }
            nodes_by_id.entry(id).or_insert_with(|| node.clone());
        }
    }

    let order_index: HashMap<&str, usize> =
        first_seen.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();

    let mut fused: Vec<(String, f64)> = scores.into_iter().collect();
    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| order_index[a.0.as_str()].cmp(&order_index[b.0.as_str()]))
    });

    (fused, nodes_by_id)
}
