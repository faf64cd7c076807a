//! Asynchronous, batched embedding index with an LRU-caching provider decorator.

use crate::error::{Error, Result};
use crate::memory::store::SqliteMemoryStore;
use crate::memory::types::NodeId;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

/// Capability contract for an embedding backend. Implementations are
/// expected to preserve input order in the returned vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Model name used to key stored vectors.
    fn model(&self) -> &str;
}

/// Tunables for [`EmbeddingIndex`].
#[derive(Debug, Clone)]
pub struct EmbeddingIndexConfig {
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub batch_delay: StdDuration,
    pub request_timeout: StdDuration,
}

impl Default for EmbeddingIndexConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            batch_size: 16,
            batch_delay: StdDuration::from_millis(100),
            request_timeout: StdDuration::from_secs(60),
        }
    }
}

struct IndexRequest {
    id: NodeId,
    content: String,
    completion: Option<oneshot::Sender<Result<()>>>,
}

/// Background batched embedding worker backed by the hypergraph store.
pub struct EmbeddingIndex {
    sender: mpsc::Sender<IndexRequest>,
    store: SqliteMemoryStore,
    provider: Arc<dyn EmbeddingProvider>,
}

impl EmbeddingIndex {
    pub fn new(
        store: SqliteMemoryStore,
        provider: Arc<dyn EmbeddingProvider>,
        config: EmbeddingIndexConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let worker_store = store.clone();
        let worker_provider = provider.clone();
        tokio::spawn(Self::run_worker(receiver, worker_store, worker_provider, config));
        Self {
            sender,
            store,
            provider,
        }
    }

    /// Offer a node onto the bounded queue without waiting for completion.
    /// If the queue is full the request is dropped and logged.
    #[instrument(skip(self, content), fields(node_id = %id))]
    pub fn index_async(&self, id: NodeId, content: impl Into<String>) {
        let request = IndexRequest {
            id,
            content: content.into(),
            completion: None,
        };
        if self.sender.try_send(request).is_err() {
            warn!("embedding index queue full, dropping request");
        }
    }

    /// Offer a node and await completion (or cancellation).
    pub async fn index_sync(&self, id: NodeId, content: impl Into<String>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let request = IndexRequest {
            id,
            content: content.into(),
            completion: Some(tx),
        };
        self.sender
            .send(request)
            .await
            .map_err(|_| Error::Internal("embedding index worker stopped".into()))?;
        rx.await
            .map_err(|_| Error::Cancelled)?
    }

    async fn run_worker(
        mut receiver: mpsc::Receiver<IndexRequest>,
        store: SqliteMemoryStore,
        provider: Arc<dyn EmbeddingProvider>,
        config: EmbeddingIndexConfig,
    ) {
        loop {
            let mut batch = Vec::with_capacity(config.batch_size);
            match receiver.recv().await {
                Some(req) => batch.push(req),
                None => return,
            }

            let deadline = tokio::time::Instant::now() + config.batch_delay;
            while batch.len() < config.batch_size {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match timeout(remaining, receiver.recv()).await {
                    Ok(Some(req)) => batch.push(req),
                    Ok(None) => break,
                    Err(_) => break,
                }
            }

            let texts: Vec<String> = batch.iter().map(|r| r.content.clone()).collect();
            let result = timeout(config.request_timeout, provider.embed(&texts)).await;

            match result {
                Ok(Ok(vectors)) => {
                    for (req, vector) in batch.into_iter().zip(vectors.into_iter()) {
                        let stored = store.upsert_embedding(&req.id, provider.model(), &vector);
                        if let Some(tx) = req.completion {
                            let _ = tx.send(stored);
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "embedding batch failed");
                    for req in batch {
                        if let Some(tx) = req.completion {
                            let _ = tx.send(Err(Error::provider("embedding", e.to_string())));
                        }
                    }
                }
                Err(_) => {
                    warn!("embedding batch timed out");
                    for req in batch {
                        if let Some(tx) = req.completion {
                            let _ = tx.send(Err(Error::provider("embedding", "request timed out")));
                        }
                    }
                }
            }
        }
    }

    /// Embed `query` and run [`Self::search_by_vector`].
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<(NodeId, f32)>> {
        let vectors = self.provider.embed(&[query.to_string()]).await?;
        let query_vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| Error::provider("embedding", "empty embed response"))?;
        self.search_by_vector(&query_vector, limit)
    }

    /// Brute-force cosine similarity search over all stored vectors for
    /// this provider's model.
    pub fn search_by_vector(&self, vector: &[f32], limit: usize) -> Result<Vec<(NodeId, f32)>> {
        let all = self.store.all_embeddings(self.provider.model())?;
        let mut scored: Vec<(NodeId, f32)> = all
            .into_iter()
            .map(|(id, vec)| (id, cosine_similarity(vector, &vec)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Wraps an [`EmbeddingProvider`] with an LRU cache over `text -> vector`,
/// preserving the order of the input batch on partial cache hits.
pub struct CachedEmbeddingProvider {
    inner: Arc<dyn EmbeddingProvider>,
    cache: Mutex<LruCache>,
}

struct LruCache {
    map: HashMap<String, Vec<f32>>,
    order: VecDeque<String>,
    capacity: usize,
}

impl LruCache {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&mut self, key: &str) -> Option<Vec<f32>> {
        if let Some(v) = self.map.get(key).cloned() {
            self.order.retain(|k| k != key);
            self.order.push_back(key.to_string());
            Some(v)
        } else {
            None
        }
    }

    fn insert(&mut self, key: String, value: Vec<f32>) {
        if self.map.contains_key(&key) {
            self.order.retain(|k| k != &key);
        } else if self.map.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.map.insert(key, value);
    }
}

impl CachedEmbeddingProvider {
    pub fn new(inner: Arc<dyn EmbeddingProvider>, capacity: usize) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for CachedEmbeddingProvider {
    #[instrument(skip(self, texts))]
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut miss_indices = Vec::new();
        let mut miss_texts = Vec::new();

        {
            let mut cache = self.cache.lock().await;
            for (i, text) in texts.iter().enumerate() {
                if let Some(vector) = cache.get(text) {
                    debug!(index = i, "embedding cache hit");
                    results[i] = Some(vector);
                } else {
                    miss_indices.push(i);
                    miss_texts.push(text.clone());
                }
            }
        }

        if !miss_texts.is_empty() {
            let fetched = self.inner.embed(&miss_texts).await?;
            let mut cache = self.cache.lock().await;
            for (idx, vector) in miss_indices.into_iter().zip(fetched.into_iter()) {
                cache.insert(texts[idx].clone(), vector.clone());
                results[idx] = Some(vector);
            }
        }

        Ok(results.into_iter().map(|v| v.unwrap_or_default()).collect())
    }

    fn model(&self) -> &str {
        self.inner.model()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.len() as f32]).collect())
        }

        fn model(&self) -> &str {
            "counting"
        }
    }

    #[tokio::test]
    async fn cached_provider_preserves_order_and_dedupes_calls() {
        let inner = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let cached = CachedEmbeddingProvider::new(inner.clone(), 10);

        let first = cached
            .embed(&["a".into(), "bb".into()])
            .await
            .unwrap();
        assert_eq!(first, vec![vec![1.0], vec![2.0]]);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        // Second call is fully cached; no new provider call.
        let second = cached
            .embed(&["a".into(), "bb".into()])
            .await
            .unwrap();
        assert_eq!(second, first);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cosine_similarity_identical_vectors_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_orthogonal_vectors_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[tokio::test]
    async fn index_sync_round_trips_through_store() {
        let store = SqliteMemoryStore::in_memory().unwrap();
        let node = crate::memory::types::Node::new(crate::memory::types::NodeType::Fact, "hi");
        store.create_node(&node).unwrap();

        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let index = EmbeddingIndex::new(store.clone(), provider, EmbeddingIndexConfig::default());

        index.index_sync(node.id.clone(), "hi").await.unwrap();
        let embedding = store.get_embedding(&node.id, "counting").unwrap();
        assert!(embedding.is_some());
    }
}
