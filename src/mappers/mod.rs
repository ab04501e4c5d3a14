// Protocol mappers: translation between the public dialects and the
// upstream generateContent format.

pub mod claude;
pub mod common_utils;
pub mod gemini;
pub mod openai;

use serde_json::Value;

/// Inner upstream request plus the metadata the dispatcher and response
/// converters need. Produced by the inbound converters; the dispatcher
/// wraps it into the per-account envelope.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub inner: Value,
    pub upstream_model: String,
    pub thinking_enabled: bool,
}
