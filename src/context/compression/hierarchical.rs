//! Hierarchical compression: a ladder of progressively more compressed
//! levels, each built from the previous level's output.

use crate::context::compression::extractive::ExtractiveCompressor;
use crate::context::compression::manager::CompressionMethod;
use crate::context::compression::estimate_tokens;
use crate::error::Result;

const DEFAULT_RATIOS: &[f64] = &[0.5, 0.25, 0.125];

/// One rung of the compression ladder.
#[derive(Debug, Clone)]
pub struct HierarchicalLevel {
    pub content: String,
    pub token_count: usize,
    pub ratio: f64,
    pub method: CompressionMethod,
}

pub struct HierarchicalCompressor {
    extractive: ExtractiveCompressor,
    ratios: Vec<f64>,
}

impl HierarchicalCompressor {
    pub fn new() -> Self {
        Self {
            extractive: ExtractiveCompressor::new(),
            ratios: DEFAULT_RATIOS.to_vec(),
        }
    }

    pub fn with_ratios(mut self, ratios: Vec<f64>) -> Self {
        self.ratios = ratios;
        self
    }

    /// Build the ladder of levels, stopping early if a level passes
    /// through unchanged (original already at or below that level's
    /// target).
    pub async fn build_levels(&self, content: &str, query: &str) -> Result<Vec<HierarchicalLevel>> {
        let original_tokens = estimate_tokens(content);
        let mut levels = Vec::new();
        let mut current = content.to_string();
        let mut current_tokens = original_tokens;

        for &ratio in &self.ratios {
            let target = ((original_tokens as f64) * ratio).round().max(1.0) as usize;

            if current_tokens <= target {
                levels.push(HierarchicalLevel {
                    content: current.clone(),
                    token_count: current_tokens,
                    ratio: current_tokens as f64 / original_tokens.max(1) as f64,
                    method: CompressionMethod::Passthrough,
                });
                break;
            }

            let compressed = self.extractive.compress(&current, target, query).await?;
            let compressed_tokens = estimate_tokens(&compressed);
            levels.push(HierarchicalLevel {
                content: compressed.clone(),
                token_count: compressed_tokens,
                ratio: compressed_tokens as f64 / original_tokens.max(1) as f64,
                method: CompressionMethod::Extractive,
            });
            current = compressed;
            current_tokens = compressed_tokens;
        }

        Ok(levels)
    }

    /// The least-compressed level whose token count fits `budget`; if none
    /// fits, the most compressed level.
    pub fn select_level<'a>(levels: &'a [HierarchicalLevel], budget: usize) -> Option<&'a HierarchicalLevel> {
        levels
            .iter()
            .filter(|l| l.token_count <= budget)
            .max_by_key(|l| l.token_count)
            .or_else(|| levels.iter().min_by_key(|l| l.token_count))
    }

    /// The level whose ratio is closest to `target_ratio`.
    pub fn select_level_by_ratio<'a>(levels: &'a [HierarchicalLevel], target_ratio: f64) -> Option<&'a HierarchicalLevel> {
        levels
            .iter()
            .min_by(|a, b| {
                (a.ratio - target_ratio)
                    .abs()
                    .partial_cmp(&(b.ratio - target_ratio).abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }

    /// The level with the largest token count that still fits `budget`;
    /// falls back to the most compressed level.
    pub fn best_level<'a>(levels: &'a [HierarchicalLevel], budget: usize) -> Option<&'a HierarchicalLevel> {
        Self::select_level(levels, budget)
    }
}

impl Default for HierarchicalCompressor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn build_levels_stops_early_on_passthrough() {
        let compressor = HierarchicalCompressor::new();
        let levels = compressor.build_levels("short text", "").await.unwrap();
        assert_eq!(levels.last().unwrap().method, CompressionMethod::Passthrough);
    }

    #[tokio::test]
    async fn select_level_picks_least_compressed_fitting_budget() {
        let levels = vec![
            HierarchicalLevel { content: "a".into(), token_count: 100, ratio: 0.5, method: CompressionMethod::Extractive },
            HierarchicalLevel { content: "b".into(), token_count: 50, ratio: 0.25, method: CompressionMethod::Extractive },
            HierarchicalLevel { content: "c".into(), token_count: 25, ratio: 0.125, method: CompressionMethod::Extractive },
        ];
        let selected = HierarchicalCompressor::select_level(&levels, 60).unwrap();
        assert_eq!(selected.token_count, 50);
    }

    #[tokio::test]
    async fn select_level_falls_back_to_most_compressed_when_nothing_fits() {
        let levels = vec![
            HierarchicalLevel { content: "a".into(), token_count: 100, ratio: 0.5, method: CompressionMethod::Extractive },
            HierarchicalLevel { content: "b".into(), token_count: 50, ratio: 0.25, method: CompressionMethod::Extractive },
        ];
        let selected = HierarchicalCompressor::select_level(&levels, 10).unwrap();
        assert_eq!(selected.token_count, 50);
    }
}
