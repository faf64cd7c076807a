//! Context compression pipeline: shrink oversized text to fit a token
//! budget while preserving the most relevant content.
//!
//! [`manager::CompressionManager`] is the entry point most callers want: it
//! picks a method per input, allocates budget across chunks, and delegates
//! to the extractive/abstractive/hierarchical/incremental compressors
//! below.

pub mod abstractive;
pub mod extractive;
pub mod hierarchical;
pub mod incremental;
pub mod manager;

pub use abstractive::AbstractiveCompressor;
pub use extractive::ExtractiveCompressor;
pub use hierarchical::{HierarchicalCompressor, HierarchicalLevel};
pub use incremental::{IncrementalCompressor, IncrementalOutcome, IncrementalStats};
pub use manager::{Chunk, CompressionManager, CompressionMethod, CompressionResult};

/// `tokens ≈ words × 1.3`. Distinct from `Message::approx_tokens`'s
/// `len / 4` heuristic: this one is tuned for compression-ratio decisions,
/// not quick context-budget bookkeeping.
pub fn estimate_tokens(text: &str) -> usize {
    if text.trim().is_empty() {
        return 0;
    }
    let words = text.split_whitespace().count();
    ((words as f64) * 1.3).round() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_tokens_is_zero_for_empty_text() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("   "), 0);
    }

    #[test]
    fn estimate_tokens_scales_with_word_count() {
        assert_eq!(estimate_tokens("one two three four five"), 7); // 5*1.3 = 6.5 -> 7
    }
}
