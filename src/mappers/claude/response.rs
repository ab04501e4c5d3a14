// Claude non-streaming response transformation (upstream -> Anthropic).

use super::models::*;
use super::preprocess::content_without_thinking;
use super::utils::to_claude_usage;
use crate::error::{RelayError, RelayResult};
use crate::mappers::common_utils::strip_placeholder_args;
use crate::mappers::gemini::{GeminiPart, GeminiResponse};
use crate::signature_cache::SignatureCache;

pub struct ResponseContext<'a> {
    pub cache: &'a SignatureCache,
    pub thinking_enabled: bool,
    pub user_id: Option<&'a str>,
}

pub fn transform_response(
    gemini: &GeminiResponse,
    ctx: &ResponseContext<'_>,
) -> RelayResult<ClaudeResponse> {
    if let Some(reason) = gemini.block_reason() {
        return Err(RelayError::Blocked(reason.to_string()));
    }

    let parts = gemini.first_candidate_parts();

    // Thinking parts collapse into one leading block: text concatenated,
    // last signature wins. Signatures may ride on any part.
    let mut thinking_text = String::new();
    let mut turn_signature: Option<String> = None;
    for part in parts {
        if part.thought.unwrap_or(false) {
            if let Some(text) = &part.text {
                thinking_text.push_str(text);
            }
        }
        if let Some(sig) = &part.thought_signature {
            turn_signature = Some(sig.clone());
        }
    }

    let mut content: Vec<ContentBlock> = Vec::new();
    let mut tool_use_ids: Vec<String> = Vec::new();
    let mut text_builder = String::new();

    if ctx.thinking_enabled && (!thinking_text.is_empty() || turn_signature.is_some()) {
        let signature = turn_signature.clone().or_else(|| {
            ctx.user_id
                .and_then(|user| ctx.cache.get_last_thinking_signature(user))
        });
        content.push(ContentBlock::Thinking {
            thinking: thinking_text.trim_end().to_string(),
            signature,
        });
    }

    for part in parts {
        if part.thought.unwrap_or(false) {
            continue;
        }
        convert_part(part, &mut content, &mut text_builder, &mut tool_use_ids);
    }
    flush_text(&mut content, &mut text_builder);

    // Remember this turn's signature under every recovery key.
    if let Some(sig) = &turn_signature {
        let thought_text = if thinking_text.is_empty() {
            None
        } else {
            Some(thinking_text.as_str())
        };
        for id in &tool_use_ids {
            ctx.cache.cache_thinking_signature(id, sig, thought_text);
        }
        if let Some(user) = ctx.user_id {
            ctx.cache.cache_last_thinking_signature(user, sig);
            ctx.cache
                .cache_assistant_signature(user, &content_without_thinking(&content), sig);
        }
    }

    let stop_reason = if !tool_use_ids.is_empty() {
        "tool_use"
    } else if gemini.finish_reason() == Some("MAX_TOKENS") {
        "max_tokens"
    } else {
        "end_turn"
    };

    let usage = gemini
        .usage_metadata
        .as_ref()
        .map(to_claude_usage)
        .unwrap_or(Usage {
            input_tokens: 0,
            output_tokens: 0,
            cache_read_input_tokens: None,
            cache_creation_input_tokens: None,
        });

    Ok(ClaudeResponse {
        id: gemini
            .response_id
            .clone()
            .unwrap_or_else(|| format!("msg_{}", crate::common::utils::generate_random_id())),
        type_: "message".to_string(),
        role: "assistant".to_string(),
        model: gemini.model_version.clone().unwrap_or_default(),
        content,
        stop_reason: stop_reason.to_string(),
        stop_sequence: None,
        usage,
    })
}

fn convert_part(
    part: &GeminiPart,
    content: &mut Vec<ContentBlock>,
    text_builder: &mut String,
    tool_use_ids: &mut Vec<String>,
) {
    if let Some(fc) = &part.function_call {
        flush_text(content, text_builder);

        let id = fc.id.clone().unwrap_or_else(|| {
            format!("{}-{}", fc.name, crate::common::utils::generate_random_id())
        });
        tool_use_ids.push(id.clone());

        let mut input = fc.args.clone().unwrap_or(serde_json::json!({}));
        strip_placeholder_args(&mut input);

        content.push(ContentBlock::ToolUse {
            id,
            name: fc.name.clone(),
            input,
            signature: part.thought_signature.clone(),
        });
        return;
    }

    if let Some(text) = &part.text {
        if !text.is_empty() {
            text_builder.push_str(text);
        }
        return;
    }

    if let Some(img) = &part.inline_data {
        if !img.data.is_empty() {
            flush_text(content, text_builder);
            content.push(ContentBlock::Image {
                source: ImageSource {
                    source_type: "base64".to_string(),
                    media_type: img.mime_type.clone(),
                    data: img.data.clone(),
                },
            });
        }
    }
}

fn flush_text(content: &mut Vec<ContentBlock>, text_builder: &mut String) {
    if !text_builder.is_empty() {
        content.push(ContentBlock::Text {
            text: std::mem::take(text_builder),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature_cache::SignatureTtls;
    use serde_json::json;

    fn cache() -> SignatureCache {
        SignatureCache::new(
            SignatureTtls {
                tool_thought_ttl_ms: 600_000,
                tool_thought_max: 100,
                thinking_ttl_ms: 86_400_000,
                thinking_max: 100,
                last_ttl_ms: 86_400_000,
                last_max: 100,
                assistant_ttl_ms: 86_400_000,
                assistant_max: 100,
            },
            None,
        )
    }

    fn response(value: serde_json::Value) -> GeminiResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn thinking_then_tool_use_ordering() {
        let cache = cache();
        let ctx = ResponseContext {
            cache: &cache,
            thinking_enabled: true,
            user_id: Some("user-1"),
        };
        let gemini = response(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "planning", "thought": true, "thoughtSignature": "sig-a"},
                    {"functionCall": {"id": "toolu_9", "name": "calc", "args": {"x": 1, "__ag_required": true}}}
                ]},
                "finishReason": "STOP"
            }],
            "responseId": "resp_1",
            "modelVersion": "claude-sonnet-4-5-thinking"
        }));

        let resp = transform_response(&gemini, &ctx).unwrap();
        assert_eq!(resp.stop_reason, "tool_use");
        assert!(matches!(
            &resp.content[0],
            ContentBlock::Thinking { thinking, signature: Some(s) }
                if thinking == "planning" && s == "sig-a"
        ));
        match &resp.content[1] {
            ContentBlock::ToolUse { id, input, .. } => {
                assert_eq!(id, "toolu_9");
                // Placeholder stripped from args.
                assert_eq!(input, &json!({"x": 1}));
            }
            other => panic!("expected tool_use, got {:?}", other),
        }

        // Signature landed in every recovery namespace.
        assert_eq!(
            cache.get_thinking_signature("toolu_9"),
            Some("sig-a".to_string())
        );
        assert_eq!(
            cache.get_last_thinking_signature("user-1"),
            Some("sig-a".to_string())
        );
    }

    #[test]
    fn last_user_signature_reused_when_turn_has_none() {
        let cache = cache();
        cache.cache_last_thinking_signature("user-1", "sig-prev");
        let ctx = ResponseContext {
            cache: &cache,
            thinking_enabled: true,
            user_id: Some("user-1"),
        };
        let gemini = response(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "short thought", "thought": true},
                    {"text": "answer"}
                ]},
                "finishReason": "STOP"
            }]
        }));

        let resp = transform_response(&gemini, &ctx).unwrap();
        assert!(matches!(
            &resp.content[0],
            ContentBlock::Thinking { signature: Some(s), .. } if s == "sig-prev"
        ));
        assert!(matches!(&resp.content[1], ContentBlock::Text { text } if text == "answer"));
    }

    #[test]
    fn max_tokens_maps_when_no_tool_use() {
        let cache = cache();
        let ctx = ResponseContext {
            cache: &cache,
            thinking_enabled: false,
            user_id: None,
        };
        let gemini = response(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "cut off"}]},
                "finishReason": "MAX_TOKENS"
            }],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 7}
        }));

        let resp = transform_response(&gemini, &ctx).unwrap();
        assert_eq!(resp.stop_reason, "max_tokens");
        assert_eq!(resp.usage.input_tokens, 5);
        assert_eq!(resp.usage.output_tokens, 7);
    }

    #[test]
    fn blocked_prompt_surfaces_as_error() {
        let cache = cache();
        let ctx = ResponseContext {
            cache: &cache,
            thinking_enabled: false,
            user_id: None,
        };
        let gemini = response(json!({
            "promptFeedback": {"blockReason": "SAFETY"}
        }));
        let err = transform_response(&gemini, &ctx).unwrap_err();
        assert!(matches!(err, RelayError::Blocked(r) if r == "SAFETY"));
    }

    #[test]
    fn inline_data_becomes_image_block() {
        let cache = cache();
        let ctx = ResponseContext {
            cache: &cache,
            thinking_enabled: false,
            user_id: None,
        };
        let gemini = response(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"inlineData": {"mimeType": "image/png", "data": "aWdub3JlZA=="}}
                ]},
                "finishReason": "STOP"
            }]
        }));
        let resp = transform_response(&gemini, &ctx).unwrap();
        assert!(matches!(
            &resp.content[0],
            ContentBlock::Image { source } if source.media_type == "image/png"
        ));
    }
}
