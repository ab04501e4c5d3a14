use crate::mappers::gemini::UsageMetadata;

use super::models::Usage;

/// Convert upstream usage metadata to Anthropic usage. Cached prompt tokens
/// are reported separately, not as fresh input.
pub fn to_claude_usage(usage_metadata: &UsageMetadata) -> Usage {
    let prompt_tokens = usage_metadata.prompt_token_count.unwrap_or(0);
    let cached_tokens = usage_metadata.cached_content_token_count.unwrap_or(0);

    Usage {
        input_tokens: prompt_tokens.saturating_sub(cached_tokens),
        output_tokens: usage_metadata.candidates_token_count.unwrap_or(0),
        cache_read_input_tokens: if cached_tokens > 0 {
            Some(cached_tokens)
        } else {
            None
        },
        cache_creation_input_tokens: Some(0),
    }
}
