//! Extractive compression: score sentences, keep the highest scorers that
//! fit the target budget, emit them back in original document order.

use std::sync::Arc;

use crate::context::compression::estimate_tokens;
use crate::error::Result;
use crate::memory::EmbeddingProvider;

const KEYWORDS: &[&str] = &[
    "important", "key", "main", "critical", "essential", "result", "conclusion", "summary",
    "therefore", "finally", "error", "warning", "note", "must", "should",
];

/// Split `content` into sentences following the spec's two-strategy rule:
/// prefer newline boundaries when they produce at least two non-empty
/// lines, otherwise fall back to `.`/`!`/`?` boundaries followed by
/// end-of-text or an uppercase letter. Sentences of two characters or
/// fewer are dropped.
pub fn split_sentences(content: &str) -> Vec<String> {
    let newline_lines: Vec<&str> = content.lines().map(str::trim).filter(|l| !l.is_empty()).collect();

    let raw: Vec<String> = if newline_lines.len() >= 2 {
        newline_lines.into_iter().map(str::to_string).collect()
    } else {
        split_on_punctuation(content)
    };

    let sentences: Vec<String> = raw.into_iter().filter(|s| s.trim().chars().count() > 2).collect();

    if sentences.is_empty() && !content.trim().is_empty() {
        vec![content.trim().to_string()]
    } else {
        sentences
    }
}

fn split_on_punctuation(content: &str) -> Vec<String> {
    let chars: Vec<char> = content.chars().collect();
    let mut sentences = Vec::new();
    let mut start = 0usize;

    let mut i = 0usize;
    while i < chars.len() {
        if matches!(chars[i], '.' | '!' | '?') {
            let next_non_space = chars[(i + 1)..].iter().position(|c| !c.is_whitespace()).map(|p| i + 1 + p);
            let boundary = match next_non_space {
                None => true,
                Some(j) => chars[j].is_uppercase(),
            };
            if boundary {
                let sentence: String = chars[start..=i].iter().collect();
                let trimmed = sentence.trim();
                if !trimmed.is_empty() {
                    sentences.push(trimmed.to_string());
                }
                start = i + 1;
            }
        }
        i += 1;
    }

    if start < chars.len() {
        let tail: String = chars[start..].iter().collect();
        let trimmed = tail.trim();
        if !trimmed.is_empty() {
            sentences.push(trimmed.to_string());
        }
    }

    sentences
}

fn length_multiplier(word_count: usize) -> f64 {
    if word_count < 3 {
        0.5
    } else if word_count <= 30 && word_count >= 5 {
        1.2
    } else if word_count > 50 {
        0.8
    } else {
        1.0
    }
}

fn position_score(index: usize) -> f64 {
    (1.0 - 0.005 * index as f64).max(0.5)
}

fn keyword_boost(sentence: &str) -> f64 {
    let lower = sentence.to_lowercase();
    if KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        0.3
    } else {
        0.0
    }
}

pub struct ExtractiveCompressor {
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl ExtractiveCompressor {
    pub fn new() -> Self {
        Self { embedder: None }
    }

    pub fn with_embedder(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            embedder: Some(embedder),
        }
    }

    /// Score every sentence, including the optional query-relevance term.
    async fn score_sentences(&self, sentences: &[String], query: &str) -> Result<Vec<f64>> {
        let mut scores: Vec<f64> = sentences
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let word_count = s.split_whitespace().count();
                (position_score(i) * length_multiplier(word_count) + keyword_boost(s)).max(0.0)
            })
            .collect();

        if let (Some(embedder), false) = (&self.embedder, query.trim().is_empty()) {
            let query_embedding = embedder.embed(std::slice::from_ref(&query.to_string())).await?;
            let query_vec = query_embedding.into_iter().next().unwrap_or_default();

            let owned: Vec<String> = sentences.to_vec();
            for (chunk_start, chunk) in owned.chunks(50).enumerate().map(|(n, c)| (n * 50, c)) {
                let embeddings = embedder.embed(chunk).await?;
                for (offset, embedding) in embeddings.iter().enumerate() {
                    let global_index = chunk_start + offset;
                    let similarity = cosine_similarity(&query_vec, embedding);
                    if let Some(score) = scores.get_mut(global_index) {
                        *score = (*score + 2.0 * similarity).max(0.0);
                    }
                }
            }
        }

        Ok(scores)
    }

    /// Compress `content` to fit within `target_tokens`, optionally scored
    /// against `query` for relevance.
    pub async fn compress(&self, content: &str, target_tokens: usize, query: &str) -> Result<String> {
        let sentences = split_sentences(content);
        if sentences.is_empty() {
            return Ok(String::new());
        }

        let scores = self.score_sentences(&sentences, query).await?;

        let mut ranked: Vec<usize> = (0..sentences.len()).collect();
        ranked.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap_or(std::cmp::Ordering::Equal));

        let mut selected = std::collections::HashSet::new();
        let mut total_tokens = 0usize;
        for &idx in &ranked {
            let tokens = estimate_tokens(&sentences[idx]);
            if total_tokens + tokens > target_tokens && !selected.is_empty() {
                continue;
            }
            selected.insert(idx);
            total_tokens += tokens;
            if total_tokens >= target_tokens {
                break;
            }
        }

        let ordered: Vec<&str> = (0..sentences.len())
            .filter(|i| selected.contains(i))
            .map(|i| sentences[i].as_str())
            .collect();

        Ok(ordered.join(" "))
    }
}

impl Default for ExtractiveCompressor {
    fn default() -> Self {
        Self::new()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        (dot / (norm_a * norm_b)) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_newlines_when_multiple_lines_present() {
        let content = "first line here\nsecond line here\nthird line here";
        let sentences = split_sentences(content);
        assert_eq!(sentences.len(), 3);
    }

    #[test]
    fn splits_on_punctuation_when_single_line() {
        let content = "This is one sentence. This is another! Is this a third?";
        let sentences = split_sentences(content);
        assert_eq!(sentences.len(), 3);
    }

    #[test]
    fn drops_sentences_of_two_characters_or_fewer() {
        let content = "ok\nA\nthis one stays long enough";
        let sentences = split_sentences(content);
        assert!(!sentences.iter().any(|s| s == "A"));
    }

    #[tokio::test]
    async fn compress_keeps_highest_scoring_sentences_in_order() {
        let compressor = ExtractiveCompressor::new();
        let content = "This is a filler sentence with nothing special in it at all today. \
            This sentence contains the critical key result that matters most here. \
            Another filler sentence follows with little of note in it whatsoever.";
        let compressed = compressor.compress(content, 15, "").await.unwrap();
        assert!(compressed.contains("critical key result"));
    }
}
