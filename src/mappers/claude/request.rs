// Claude request transformation (Anthropic Messages -> upstream generateContent).

use super::models::*;
use super::tools::resolve_tool_declaration;
use crate::common::json_schema::normalize_schema;
use crate::common::model_mapping::{is_claude_family, map_to_upstream};
use crate::common::tool_output::{
    limit_tool_output, normalize_tool_output, OutputBudget,
};
use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::mappers::common_utils::{
    inject_required_placeholder, promote_max_output_tokens, safety_settings_off,
    DEFAULT_MAX_OUTPUT_TOKENS,
};
use crate::mappers::PreparedRequest;
use serde_json::{json, Value};
use std::collections::HashMap;

pub fn transform_claude_request_in(
    req: &ClaudeRequest,
    cfg: &RelayConfig,
) -> RelayResult<PreparedRequest> {
    let upstream_model = map_to_upstream(&req.model);
    let claude_family = is_claude_family(&upstream_model);
    let uppercase_types = !claude_family;
    let thinking_enabled = req.thinking_enabled();

    // Pre-scan assistant tool_use ids so tool results can resolve names.
    let mut tool_id_to_name: HashMap<String, String> = HashMap::new();
    for msg in &req.messages {
        if let MessageContent::Array(blocks) = &msg.content {
            for block in blocks {
                if let ContentBlock::ToolUse { id, name, .. } = block {
                    tool_id_to_name.insert(id.clone(), name.clone());
                }
            }
        }
    }

    let mut budget = OutputBudget::new(
        cfg.effective_tool_result_max_chars(),
        cfg.effective_tool_result_total_max_chars(),
        cfg.tool_result_tail_chars,
        cfg.tool_result_truncate_log,
    );

    let mut contents: Vec<Value> = Vec::new();
    let mut has_tool_results = false;

    for msg in &req.messages {
        let role = if msg.role == "assistant" { "model" } else { "user" };

        // Non-functionCall parts lead; functionCall parts trail.
        let mut parts: Vec<Value> = Vec::new();
        let mut call_parts: Vec<Value> = Vec::new();

        match &msg.content {
            MessageContent::String(text) => {
                if !text.trim().is_empty() && text != "(no content)" {
                    parts.push(json!({"text": text}));
                }
            }
            MessageContent::Array(blocks) => {
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => {
                            if !text.is_empty() && text != "(no content)" {
                                parts.push(json!({"text": text}));
                            }
                        }
                        ContentBlock::Thinking {
                            thinking,
                            signature,
                        } => {
                            let text = if signature.is_some() && thinking.is_empty() {
                                " "
                            } else {
                                thinking.as_str()
                            };
                            let mut part = json!({"text": text, "thought": true});
                            if let Some(sig) = signature {
                                part["thoughtSignature"] = json!(sig);
                            }
                            parts.push(part);
                        }
                        ContentBlock::RedactedThinking { signature, .. } => {
                            // Meaningless upstream without its signature.
                            if let Some(sig) = signature {
                                parts.push(json!({
                                    "text": " ",
                                    "thought": true,
                                    "thoughtSignature": sig
                                }));
                            }
                        }
                        ContentBlock::ToolUse {
                            id,
                            name,
                            input,
                            signature,
                        } => {
                            let mut part = json!({
                                "functionCall": {
                                    "id": id,
                                    "name": name,
                                    "args": input,
                                }
                            });
                            if let Some(sig) = signature {
                                part["thoughtSignature"] = json!(sig);
                            }
                            call_parts.push(part);
                        }
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } => {
                            has_tool_results = true;
                            let name = tool_id_to_name
                                .get(tool_use_id)
                                .cloned()
                                .unwrap_or_else(|| tool_use_id.clone());

                            let mut output =
                                normalize_tool_output(content, is_error.unwrap_or(false));
                            if output.trim().is_empty() {
                                output = if is_error.unwrap_or(false) {
                                    "Tool execution failed with no output.".to_string()
                                } else {
                                    "Command executed successfully.".to_string()
                                };
                            }
                            let output = limit_tool_output(output, &mut budget, &name);

                            parts.push(json!({
                                "functionResponse": {
                                    "id": tool_use_id,
                                    "name": name,
                                    "response": {"output": output},
                                }
                            }));
                        }
                        ContentBlock::Image { source } => {
                            if source.source_type == "base64" {
                                parts.push(json!({
                                    "inlineData": {
                                        "mimeType": source.media_type,
                                        "data": source.data,
                                    }
                                }));
                            }
                        }
                    }
                }
            }
        }

        parts.extend(call_parts);
        if parts.is_empty() {
            continue;
        }
        contents.push(json!({"role": role, "parts": parts}));
    }

    // Tool-chain stabiliser: a final user turn of bare functionResponses
    // makes the upstream omit thought parts on the next turn.
    if let Some(last) = contents.last_mut() {
        if last["role"] == "user" {
            let parts = last["parts"].as_array_mut().expect("parts just built");
            let only_responses = parts.iter().all(|p| p.get("functionResponse").is_some())
                && !parts.is_empty();
            if only_responses {
                parts.push(json!({"text": " "}));
            }
        }
    }

    // Generation config.
    let budget_tokens = req.thinking_budget();
    let mut max_output = req.max_tokens.unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS);
    if thinking_enabled && claude_family {
        max_output = promote_max_output_tokens(max_output, budget_tokens);
    }
    let has_tools = req.tools.as_ref().map(|t| !t.is_empty()).unwrap_or(false);
    if (has_tools || has_tool_results) && cfg.max_output_tokens_with_tools > 0 {
        max_output = max_output.min(cfg.max_output_tokens_with_tools);
    }

    let mut gen_config = json!({
        "maxOutputTokens": max_output,
        "candidateCount": 1,
    });
    if let Some(temp) = req.temperature {
        gen_config["temperature"] = json!(temp);
    }
    if let Some(top_p) = req.top_p {
        gen_config["topP"] = json!(top_p);
    }
    if let Some(top_k) = req.top_k {
        gen_config["topK"] = json!(top_k);
    }
    if let Some(stops) = &req.stop_sequences {
        if !stops.is_empty() {
            gen_config["stopSequences"] = json!(stops);
        }
    }
    if thinking_enabled {
        gen_config["thinkingConfig"] = json!({
            "includeThoughts": true,
            "thinkingBudget": budget_tokens,
        });
    } else if req
        .thinking
        .as_ref()
        .map(|t| t.type_ == "disabled")
        .unwrap_or(false)
    {
        // Explicit disable (client-sent or downgrade) is forwarded as such.
        gen_config["thinkingConfig"] = json!({ "includeThoughts": false });
    }

    if contents.is_empty() {
        return Err(RelayError::Transform(
            "request has no convertible messages".to_string(),
        ));
    }

    let mut inner = json!({
        "contents": contents,
        "generationConfig": gen_config,
        "safetySettings": safety_settings_off(),
    });

    if let Some(system) = &req.system {
        let joined = system.joined();
        if !joined.is_empty() {
            inner["systemInstruction"] = json!({
                "role": "user",
                "parts": [{"text": joined}],
            });
        }
    }

    if let Some(tools) = &req.tools {
        let mut declarations = Vec::new();
        for tool in tools {
            let (name, description, mut schema) = resolve_tool_declaration(tool);
            normalize_schema(&mut schema, uppercase_types);
            inject_required_placeholder(&mut schema, uppercase_types);
            declarations.push(json!({
                "name": name,
                "description": description,
                "parameters": schema,
            }));
        }
        if !declarations.is_empty() {
            inner["tools"] = json!([{ "functionDeclarations": declarations }]);
            inner["toolConfig"] = json!({
                "functionCallingConfig": { "mode": "VALIDATED" }
            });
        }
    }

    Ok(PreparedRequest {
        inner,
        upstream_model,
        thinking_enabled,
    })
}
