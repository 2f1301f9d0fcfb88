//! Token estimation and output budgeting.
//!
//! These are length heuristics, not a tokenizer: roughly four characters per
//! token for English prose, which errs on the generous side for code and
//! repeated text.

use docsmith_core::TokenUsage;

/// Smallest output budget ever handed to a provider.
pub const MIN_OUTPUT_TOKENS: usize = 100;

/// Tokens held back from the context window on top of the input estimate.
pub const SAFETY_MARGIN_TOKENS: usize = 256;

const CHARS_PER_TOKEN: usize = 4;

/// Estimates the token count of `text` as `chars / 4`, rounded to nearest.
pub fn estimate_token_count(text: &str) -> usize {
    let chars = text.chars().count();
    (chars + CHARS_PER_TOKEN / 2) / CHARS_PER_TOKEN
}

/// Output-token ceiling that keeps `input_text` plus the answer inside the
/// model's context window.
///
/// Never returns less than [`MIN_OUTPUT_TOKENS`].
pub fn adaptive_max_tokens(input_text: &str, model_context_limit: usize) -> usize {
    model_context_limit
        .saturating_sub(estimate_token_count(input_text))
        .saturating_sub(SAFETY_MARGIN_TOKENS)
        .max(MIN_OUTPUT_TOKENS)
}

/// Usage estimate for providers (or streams) that report none.
pub fn estimate_usage(prompt: &str, completion: &str) -> TokenUsage {
    TokenUsage::new(to_u32(estimate_token_count(prompt)), to_u32(estimate_token_count(completion)))
}

pub(crate) fn to_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}
