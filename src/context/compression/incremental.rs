//! Incremental compression: cache compressed results by content hash and
//! reuse them across near-identical inputs instead of recompressing from
//! scratch every time.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::context::compression::extractive::ExtractiveCompressor;
use crate::error::Result;

const DEFAULT_CAPACITY: usize = 256;
const DEFAULT_CHANGE_RATIO_THRESHOLD: f64 = 0.1;

fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// How much `new` differs from `old`, in `[0, 1]`. Blends relative length
/// change with how much of the shared prefix/suffix survives.
pub fn estimate_change_ratio(old: &str, new: &str) -> f64 {
    if old == new {
        return 0.0;
    }
    let max_len = old.len().max(new.len()).max(1) as f64;
    let len_delta = (new.len() as i64 - old.len() as i64).unsigned_abs() as f64;
    let length_term = len_delta / max_len;

    let old_bytes = old.as_bytes();
    let new_bytes = new.as_bytes();
    let common_prefix = old_bytes.iter().zip(new_bytes).take_while(|(a, b)| a == b).count();
    let common_suffix = old_bytes
        .iter()
        .rev()
        .zip(new_bytes.iter().rev())
        .take_while(|(a, b)| a == b)
        .count()
        .min(old_bytes.len().saturating_sub(common_prefix))
        .min(new_bytes.len().saturating_sub(common_prefix));
    let overlap_term = 1.0 - ((common_prefix + common_suffix) as f64 / max_len);

    ((length_term + overlap_term) / 2.0).clamp(0.0, 1.0)
}

#[derive(Debug, Clone)]
struct CacheEntry {
    content_hash: String,
    original: String,
    result: String,
    created_at: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
    access_count: u64,
}

/// Hit/miss counters for the incremental cache, in the same spirit as
/// `llm::cache::PromptCache`'s `CacheStats`.
#[derive(Debug, Clone, Default)]
pub struct IncrementalStats {
    pub hits: u64,
    pub misses: u64,
}

impl IncrementalStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Result of one `IncrementalCompressor::compress` call: the compressed
/// text, whether it came from the cache (exact hit or near-miss reuse), and
/// the pipeline stages that produced it.
#[derive(Debug, Clone)]
pub struct IncrementalOutcome {
    pub content: String,
    pub cached: bool,
    pub stages: Vec<String>,
}

/// Content-addressed LRU+TTL cache of compression results, keyed by a
/// caller-assigned stable `id` (e.g. a chunk path or conversation slot).
pub struct IncrementalCompressor {
    extractive: ExtractiveCompressor,
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    order: Arc<RwLock<Vec<String>>>,
    stats: Arc<RwLock<IncrementalStats>>,
    capacity: usize,
    ttl: Duration,
    change_ratio_threshold: f64,
}

impl IncrementalCompressor {
    pub fn new() -> Self {
        Self {
            extractive: ExtractiveCompressor::new(),
            entries: Arc::new(RwLock::new(HashMap::new())),
            order: Arc::new(RwLock::new(Vec::new())),
            stats: Arc::new(RwLock::new(IncrementalStats::default())),
            capacity: DEFAULT_CAPACITY,
            ttl: Duration::hours(1),
            change_ratio_threshold: DEFAULT_CHANGE_RATIO_THRESHOLD,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_change_ratio_threshold(mut self, threshold: f64) -> Self {
        self.change_ratio_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Compress `content` under `id`. Exact-hash hits return the cached
    /// result directly; near misses (change ratio at or below the
    /// configured threshold) reuse the cached result without recompressing;
    /// anything else recompresses and replaces the entry. Either cache path
    /// is reported back as `cached: true` with a leading `incremental`
    /// pipeline stage; a miss reports the stage that actually ran.
    pub async fn compress(
        &self,
        id: &str,
        content: &str,
        target_tokens: usize,
        query: &str,
    ) -> Result<IncrementalOutcome> {
        let hash = content_hash(content);

        let reusable = {
            let entries = self.entries.read().await;
            entries.get(id).and_then(|entry| {
                if entry.content_hash == hash {
                    Some(entry.result.clone())
                } else if estimate_change_ratio(&entry.original, content) <= self.change_ratio_threshold {
                    Some(entry.result.clone())
                } else {
                    None
                }
            })
        };

        if let Some(reused) = reusable {
            self.touch(id).await;
            self.record_hit().await;
            return Ok(IncrementalOutcome {
                content: reused,
                cached: true,
                stages: vec!["incremental".to_string()],
            });
        }

        self.record_miss().await;
        let compressed = self.extractive.compress(content, target_tokens, query).await?;
        self.insert(id, &hash, content, &compressed).await;
        Ok(IncrementalOutcome {
            content: compressed,
            cached: false,
            stages: vec!["extractive".to_string()],
        })
    }

    async fn record_hit(&self) {
        self.stats.write().await.hits += 1;
    }

    async fn record_miss(&self) {
        self.stats.write().await.misses += 1;
    }

    pub async fn stats(&self) -> IncrementalStats {
        self.stats.read().await.clone()
    }

    async fn touch(&self, id: &str) {
        let now = Utc::now();
        {
            let mut entries = self.entries.write().await;
            if let Some(entry) = entries.get_mut(id) {
                entry.last_accessed = now;
                entry.access_count += 1;
            }
        }
        let mut order = self.order.write().await;
        order.retain(|k| k != id);
        order.push(id.to_string());
    }

    async fn insert(&self, id: &str, hash: &str, content: &str, result: &str) {
        let now = Utc::now();
        {
            let mut entries = self.entries.write().await;
            entries.insert(
                id.to_string(),
                CacheEntry {
                    content_hash: hash.to_string(),
                    original: content.to_string(),
                    result: result.to_string(),
                    created_at: now,
                    last_accessed: now,
                    access_count: 1,
                },
            );
        }
        {
            let mut order = self.order.write().await;
            order.retain(|k| k != id);
            order.push(id.to_string());
        }
        self.evict().await;
    }

    async fn evict(&self) {
        let now = Utc::now();
        let ttl = self.ttl;
        let mut entries = self.entries.write().await;
        let mut order = self.order.write().await;

        order.retain(|id| entries.get(id).map(|e| now - e.created_at <= ttl).unwrap_or(false));
        entries.retain(|id, _| order.contains(id));

        while order.len() > self.capacity {
            let evicted = order.remove(0);
            entries.remove(&evicted);
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for IncrementalCompressor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_change_ratio_is_zero_for_identical_content() {
        assert_eq!(estimate_change_ratio("same text", "same text"), 0.0);
    }

    #[test]
    fn estimate_change_ratio_is_high_for_unrelated_content() {
        assert!(estimate_change_ratio("hello world", "completely different stuff") > 0.5);
    }

    #[tokio::test]
    async fn compress_caches_exact_hash_hits() {
        let compressor = IncrementalCompressor::new();
        let content = "This is a reasonably long sentence about nothing important.";
        let first = compressor.compress("doc-1", content, 5, "").await.unwrap();
        let second = compressor.compress("doc-1", content, 5, "").await.unwrap();
        assert_eq!(first.content, second.content);
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(second.stages, vec!["incremental".to_string()]);
        assert_eq!(compressor.len().await, 1);
    }

    #[tokio::test]
    async fn compress_reuses_near_miss_result() {
        let compressor = IncrementalCompressor::new().with_change_ratio_threshold(0.9);
        let original = "This is a reasonably long sentence about nothing important at all.";
        let tweaked = "This is a reasonably long sentence about nothing important at all!";
        let first = compressor.compress("doc-1", original, 5, "").await.unwrap();
        let second = compressor.compress("doc-1", tweaked, 5, "").await.unwrap();
        assert_eq!(first.content, second.content);
        assert!(second.cached);
        assert_eq!(second.stages, vec!["incremental".to_string()]);
    }

    #[tokio::test]
    async fn compress_records_hit_and_miss_counts() {
        let compressor = IncrementalCompressor::new();
        let content = "This is a reasonably long sentence about nothing important.";

        compressor.compress("doc-1", content, 5, "").await.unwrap();
        let after_miss = compressor.stats().await;
        assert_eq!((after_miss.hits, after_miss.misses), (0, 1));

        compressor.compress("doc-1", content, 5, "").await.unwrap();
        let after_hit = compressor.stats().await;
        assert_eq!((after_hit.hits, after_hit.misses), (1, 1));
    }

    #[tokio::test]
    async fn evict_respects_capacity() {
        let compressor = IncrementalCompressor::new().with_capacity(2);
        for i in 0..5 {
            let content = format!("unique content body number {i} with enough words in it");
            compressor.compress(&format!("doc-{i}"), &content, 5, "").await.unwrap();
        }
        assert_eq!(compressor.len().await, 2);
    }
}
