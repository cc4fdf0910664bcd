/// Pure token estimate used for display and summarization thresholds.
pub trait TokenCounter: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;
}

/// Character-weighted estimate: ASCII weighs a quarter token, anything else one and a half.
#[derive(Debug, Clone, Copy, Default)]
pub struct EstimatingTokenCounter;

impl TokenCounter for EstimatingTokenCounter {
    fn count_tokens(&self, text: &str) -> usize {
        // Quarter-token units keep the sum exact until the final rounding.
        let quarters = text
            .chars()
            .map(|ch| if ch.is_ascii() { 1 } else { 6 })
            .sum::<usize>();
        quarters.div_ceil(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_counts_a_quarter_per_char() {
        assert_eq!(EstimatingTokenCounter.count_tokens(""), 0);
        assert_eq!(EstimatingTokenCounter.count_tokens("abcd"), 1);
        assert_eq!(EstimatingTokenCounter.count_tokens("abcde"), 2);
    }

    #[test]
    fn non_ascii_weighs_more() {
        assert_eq!(EstimatingTokenCounter.count_tokens("你好"), 3);
        assert_eq!(EstimatingTokenCounter.count_tokens("a你"), 2);
    }
}
