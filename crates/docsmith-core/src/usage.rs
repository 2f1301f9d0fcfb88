use serde::{Deserialize, Serialize};
use std::ops::Add;

/// Token accounting for one completion.
///
/// `total_tokens` is always `prompt_tokens + completion_tokens`; use
/// [`TokenUsage::new`] rather than building the struct by hand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens consumed by the request.
    pub prompt_tokens: u32,
    /// Tokens generated by the provider.
    pub completion_tokens: u32,
    /// Sum of prompt and completion tokens.
    pub total_tokens: u32,
}

impl TokenUsage {
    /// Builds a usage record, computing the total.
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

impl Add for TokenUsage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(
            self.prompt_tokens.saturating_add(rhs.prompt_tokens),
            self.completion_tokens.saturating_add(rhs.completion_tokens),
        )
    }
}
