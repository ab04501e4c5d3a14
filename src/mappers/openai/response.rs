// OpenAI non-streaming response transformation (upstream -> chat-completions).

use super::models::*;
use crate::config::ThinkingOutput;
use crate::error::{RelayError, RelayResult};
use crate::mappers::common_utils::strip_placeholder_args;
use crate::mappers::gemini::GeminiResponse;

pub fn map_finish_reason(finish_reason: Option<&str>) -> &'static str {
    match finish_reason {
        Some("MAX_TOKENS") => "length",
        // STOP and everything else map conservatively to stop.
        _ => "stop",
    }
}

pub fn transform_openai_response(
    gemini: &GeminiResponse,
    mode: ThinkingOutput,
) -> RelayResult<OpenAIResponse> {
    if let Some(reason) = gemini.block_reason() {
        return Err(RelayError::Blocked(reason.to_string()));
    }

    let mut content = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for part in gemini.first_candidate_parts() {
        if part.thought.unwrap_or(false) {
            if let Some(text) = &part.text {
                reasoning.push_str(text);
            }
            continue;
        }

        if let Some(fc) = &part.function_call {
            let id = fc.id.clone().unwrap_or_else(|| {
                format!("{}-{}", fc.name, crate::common::utils::generate_random_id())
            });
            let mut args = fc.args.clone().unwrap_or(serde_json::json!({}));
            strip_placeholder_args(&mut args);
            tool_calls.push(ToolCall {
                id,
                call_type: "function".to_string(),
                function: ToolFunction {
                    name: fc.name.clone(),
                    arguments: serde_json::to_string(&args).unwrap_or_else(|_| "{}".to_string()),
                },
            });
            continue;
        }

        if let Some(text) = &part.text {
            content.push_str(text);
            continue;
        }

        if let Some(img) = &part.inline_data {
            if !img.data.is_empty() {
                content.push_str(&format!(
                    "![image](data:{};base64,{})",
                    img.mime_type, img.data
                ));
            }
        }
    }

    let (content, reasoning_content) = shape_thinking_output(content, reasoning, mode);

    let usage = gemini.usage_metadata.as_ref().map(|u| OpenAIUsage {
        prompt_tokens: u.prompt_token_count.unwrap_or(0),
        completion_tokens: u.candidates_token_count.unwrap_or(0),
        total_tokens: u.total_token_count.unwrap_or(0),
    });

    Ok(OpenAIResponse {
        id: gemini
            .response_id
            .clone()
            .unwrap_or_else(|| format!("chatcmpl-{}", crate::common::utils::generate_random_id())),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp() as u64,
        model: gemini.model_version.clone().unwrap_or_default(),
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: "assistant".to_string(),
                content: if content.is_empty() {
                    None
                } else {
                    Some(content)
                },
                reasoning_content,
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
            },
            finish_reason: Some(map_finish_reason(gemini.finish_reason()).to_string()),
        }],
        usage,
    })
}

/// Distribute reasoning text across the configured output channels.
fn shape_thinking_output(
    content: String,
    reasoning: String,
    mode: ThinkingOutput,
) -> (String, Option<String>) {
    if reasoning.is_empty() {
        return (content, None);
    }

    let tagged = if mode.wants_tags() {
        format!("<think>\n{}\n</think>\n\n{}", reasoning, content)
    } else {
        content
    };
    let field = if mode.wants_reasoning_field() {
        Some(reasoning)
    } else {
        None
    };
    (tagged, field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(value: serde_json::Value) -> GeminiResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn plain_text_response() {
        let gemini = response(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "hello"}]},
                "finishReason": "STOP"
            }],
            "responseId": "r1",
            "modelVersion": "gemini-2.5-pro",
            "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 2, "totalTokenCount": 5}
        }));
        let resp = transform_openai_response(&gemini, ThinkingOutput::ReasoningContent).unwrap();

        assert_eq!(resp.choices[0].message.content.as_deref(), Some("hello"));
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("stop"));
        let usage = resp.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 3);
        assert_eq!(usage.completion_tokens, 2);
        assert_eq!(usage.total_tokens, 5);
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(map_finish_reason(Some("STOP")), "stop");
        assert_eq!(map_finish_reason(Some("MAX_TOKENS")), "length");
        assert_eq!(map_finish_reason(Some("SAFETY")), "stop");
        assert_eq!(map_finish_reason(None), "stop");
    }

    #[test]
    fn reasoning_modes() {
        let gemini = response(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "pondering", "thought": true},
                    {"text": "answer"}
                ]},
                "finishReason": "STOP"
            }]
        }));

        let r = transform_openai_response(&gemini, ThinkingOutput::ReasoningContent).unwrap();
        assert_eq!(r.choices[0].message.content.as_deref(), Some("answer"));
        assert_eq!(
            r.choices[0].message.reasoning_content.as_deref(),
            Some("pondering")
        );

        let r = transform_openai_response(&gemini, ThinkingOutput::Tags).unwrap();
        assert_eq!(
            r.choices[0].message.content.as_deref(),
            Some("<think>\npondering\n</think>\n\nanswer")
        );
        assert!(r.choices[0].message.reasoning_content.is_none());

        let r = transform_openai_response(&gemini, ThinkingOutput::Both).unwrap();
        assert!(r.choices[0].message.content.as_deref().unwrap().contains("<think>"));
        assert_eq!(
            r.choices[0].message.reasoning_content.as_deref(),
            Some("pondering")
        );
    }

    #[test]
    fn tool_calls_strip_placeholder() {
        let gemini = response(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"functionCall": {"id": "call_1", "name": "f",
                     "args": {"x": 1, "__ag_required": true}}}
                ]},
                "finishReason": "STOP"
            }]
        }));
        let resp = transform_openai_response(&gemini, ThinkingOutput::ReasoningContent).unwrap();
        let calls = resp.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].function.arguments, "{\"x\":1}");
    }

    #[test]
    fn inline_data_becomes_markdown_image() {
        let gemini = response(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"inlineData": {"mimeType": "image/png", "data": "QUJD"}}
                ]},
                "finishReason": "STOP"
            }]
        }));
        let resp = transform_openai_response(&gemini, ThinkingOutput::ReasoningContent).unwrap();
        assert_eq!(
            resp.choices[0].message.content.as_deref(),
            Some("![image](data:image/png;base64,QUJD)")
        );
    }

    #[test]
    fn blocked_response_is_an_error() {
        let gemini = response(json!({"promptFeedback": {"blockReason": "BLOCKLIST"}}));
        let err = transform_openai_response(&gemini, ThinkingOutput::ReasoningContent).unwrap_err();
        assert!(matches!(err, RelayError::Blocked(r) if r == "BLOCKLIST"));
    }
}
