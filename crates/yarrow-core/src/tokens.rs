//! Token counting seam.
//!
//! The real tokenizer is supplied by the deployment; the core only needs
//! counts that are stable and roughly proportional to reality for its
//! pressure checks. The default estimator is ~4 chars per token, which is
//! conservative and works reasonably well for English.

/// Counts tokens for a given model. Falls back to a GPT-4-style estimate
/// when no model-specific encoding is known.
#[derive(Debug, Clone, Copy)]
pub struct TokenCounter {
    chars_per_token: usize,
}

impl TokenCounter {
    /// Select a counter for a model name. All currently known models share
    /// the default estimate.
    pub fn for_model(_model: &str) -> Self {
        Self { chars_per_token: 4 }
    }

    pub fn count(&self, text: &str) -> usize {
        text.len() / self.chars_per_token
    }

    pub fn count_many<'a>(&self, texts: impl IntoIterator<Item = &'a str>) -> usize {
        texts.into_iter().map(|t| self.count(t)).sum()
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::for_model("gpt-4")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_scales_with_length() {
        let counter = TokenCounter::default();
        assert_eq!(counter.count(""), 0);
        assert_eq!(counter.count("abcdefgh"), 2);
        assert!(counter.count(&"x".repeat(4000)) >= 1000);
    }

    #[test]
    fn count_many_sums() {
        let counter = TokenCounter::default();
        assert_eq!(counter.count_many(["abcd", "efgh"]), 2);
    }
}
