// OpenAI request transformation (chat-completions -> upstream generateContent).

use super::models::*;
use crate::common::json_schema::normalize_schema;
use crate::common::model_mapping::{is_claude_family, is_thinking_model, map_to_upstream};
use crate::common::tool_output::{limit_tool_output, normalize_tool_output_str, OutputBudget};
use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::mappers::common_utils::{
    inject_required_placeholder, promote_max_output_tokens, safety_settings_off,
    tool_choice_to_mode, wrap_system_prompt, DEFAULT_MAX_OUTPUT_TOKENS,
};
use crate::mappers::PreparedRequest;
use crate::signature_cache::SignatureCache;
use serde_json::{json, Value};
use std::collections::HashMap;

const CLAUDE_TOOL_ID_PREFIX: &str = "toolu_";
const MAX_LOGGED_MISSING_IDS: usize = 50;

pub struct OpenAiRequestContext<'a> {
    pub cache: &'a SignatureCache,
    pub cfg: &'a RelayConfig,
}

/// Cached signature replay attached to one historical assistant message.
struct ReplayInfo {
    signature: String,
    thought_text: Option<String>,
}

pub fn transform_openai_request(
    req: &OpenAIRequest,
    ctx: &OpenAiRequestContext<'_>,
) -> RelayResult<PreparedRequest> {
    let upstream_model = map_to_upstream(&req.model);
    let claude_family = is_claude_family(&upstream_model);
    let uppercase_types = !claude_family;
    let mut thinking_enabled = is_thinking_model(&req.model);

    // Cross-provider history: Claude-family models cannot replay foreign
    // tool-call ids (no signatures exist for them).
    let cross_provider = claude_family
        && req.messages.iter().any(|m| {
            m.tool_calls
                .as_ref()
                .map(|calls| calls.iter().any(|c| !c.id.starts_with(CLAUDE_TOOL_ID_PREFIX)))
                .unwrap_or(false)
                || m.tool_call_id
                    .as_deref()
                    .map(|id| !id.starts_with(CLAUDE_TOOL_ID_PREFIX))
                    .unwrap_or(false)
        });

    // Map tool_call_id -> function name for tool replies.
    let mut tool_id_to_name: HashMap<String, String> = HashMap::new();
    for msg in &req.messages {
        if let Some(calls) = &msg.tool_calls {
            for call in calls {
                tool_id_to_name.insert(call.id.clone(), call.function.name.clone());
            }
        }
    }

    // Signature replay pre-pass: every Claude-style tool-using assistant
    // turn must carry a signature, or thinking is downgraded wholesale.
    let mut replay_by_message: HashMap<usize, ReplayInfo> = HashMap::new();
    if claude_family && thinking_enabled && !cross_provider {
        let mut missing_ids: Vec<String> = Vec::new();
        for (i, msg) in req.messages.iter().enumerate() {
            if msg.role != "assistant" {
                continue;
            }
            let Some(calls) = msg.tool_calls.as_ref().filter(|c| !c.is_empty()) else {
                continue;
            };
            let ids: Vec<&str> = calls.iter().map(|c| c.id.as_str()).collect();

            let mut resolved: Option<ReplayInfo> = None;
            for id in &ids {
                if let Some((signature, thought_text)) = ctx.cache.get_thinking_record(id) {
                    resolved = Some(ReplayInfo {
                        signature,
                        thought_text,
                    });
                    break;
                }
            }
            if resolved.is_none() {
                if let Some(user) = req.user.as_deref() {
                    if let Some(signature) = ctx.cache.get_last_thinking_signature(user) {
                        resolved = Some(ReplayInfo {
                            signature,
                            thought_text: None,
                        });
                    }
                }
            }

            match resolved {
                Some(info) => {
                    replay_by_message.insert(i, info);
                }
                None => missing_ids.extend(ids.iter().map(|s| s.to_string())),
            }
        }

        if !missing_ids.is_empty() {
            thinking_enabled = false;
            replay_by_message.clear();
            let logged: Vec<&str> = missing_ids
                .iter()
                .take(MAX_LOGGED_MISSING_IDS)
                .map(|s| s.as_str())
                .collect();
            tracing::warn!(
                kind = "thinking_downgrade",
                reason = "missing_thinking_signature_for_tool_use_history",
                missing_count = missing_ids.len(),
                missing_tool_use_ids = ?logged,
                "disabling thinking: tool-call history has no recoverable signatures"
            );
        }
    }

    // System messages concatenate and ride inside the compatibility wrap.
    let system_text: Vec<String> = req
        .messages
        .iter()
        .filter(|m| m.role == "system")
        .map(|m| m.content_text())
        .filter(|s| !s.is_empty())
        .collect();

    let mut budget = OutputBudget::new(
        ctx.cfg.effective_tool_result_max_chars(),
        ctx.cfg.effective_tool_result_total_max_chars(),
        ctx.cfg.tool_result_tail_chars,
        ctx.cfg.tool_result_truncate_log,
    );

    let mut contents: Vec<Value> = Vec::new();
    // Consecutive tool replies coalesce into one user entry.
    let mut pending_tool_parts: Vec<Value> = Vec::new();
    let mut has_tool_results = false;

    for (i, msg) in req.messages.iter().enumerate() {
        if msg.role == "system" {
            continue;
        }

        if msg.role == "tool" || msg.role == "function" {
            has_tool_results = true;
            let id = msg.tool_call_id.as_deref().unwrap_or("unknown");
            let name = tool_id_to_name
                .get(id)
                .cloned()
                .or_else(|| msg.name.clone())
                .unwrap_or_else(|| "unknown".to_string());
            let raw = normalize_tool_output_str(&msg.content_text(), false);
            let output = limit_tool_output(raw, &mut budget, &name);

            if cross_provider {
                // Foreign history degrades to plain text.
                pending_tool_parts.push(json!({"text": format!("[tool:{}] {}", name, output)}));
            } else {
                pending_tool_parts.push(json!({
                    "functionResponse": {
                        "id": id,
                        "name": name,
                        "response": {"output": output},
                    }
                }));
            }
            continue;
        }

        if !pending_tool_parts.is_empty() {
            contents.push(json!({"role": "user", "parts": std::mem::take(&mut pending_tool_parts)}));
        }

        let role = if msg.role == "assistant" { "model" } else { "user" };
        let mut parts: Vec<Value> = Vec::new();

        match &msg.content {
            Some(OpenAIContent::String(s)) => {
                if !s.is_empty() {
                    parts.push(json!({"text": s}));
                }
            }
            Some(OpenAIContent::Array(blocks)) => {
                for block in blocks {
                    match block {
                        OpenAIContentBlock::Text { text } => {
                            if !text.is_empty() {
                                parts.push(json!({"text": text}));
                            }
                        }
                        OpenAIContentBlock::ImageUrl { image_url } => {
                            if let Some(part) = image_part(&image_url.url) {
                                parts.push(part);
                            }
                        }
                    }
                }
            }
            None => {}
        }

        if let Some(calls) = msg.tool_calls.as_ref().filter(|c| !c.is_empty()) {
            if cross_provider {
                // Drop foreign tool calls, keep any text.
            } else {
                let replay = replay_by_message.get(&i);
                if let Some(info) = replay {
                    let text = info
                        .thought_text
                        .as_deref()
                        .filter(|_| ctx.cfg.claude_openai_replay_thought_text)
                        .unwrap_or(" ");
                    parts.push(json!({
                        "text": text,
                        "thought": true,
                        "thoughtSignature": info.signature,
                    }));
                }
                for call in calls {
                    let args = serde_json::from_str::<Value>(&call.function.arguments)
                        .unwrap_or_else(|_| json!({}));
                    let mut part = json!({
                        "functionCall": {
                            "id": call.id,
                            "name": call.function.name,
                            "args": args,
                        }
                    });
                    if let Some(info) = replay {
                        part["thoughtSignature"] = json!(info.signature);
                    }
                    parts.push(part);
                }
            }
        }

        if parts.is_empty() {
            continue;
        }
        contents.push(json!({"role": role, "parts": parts}));
    }

    if !pending_tool_parts.is_empty() {
        contents.push(json!({"role": "user", "parts": pending_tool_parts}));
    }

    if contents.is_empty() {
        return Err(RelayError::Transform(
            "request has no convertible messages".to_string(),
        ));
    }

    // Generation config.
    let budget_tokens = req.thinking_budget();
    let mut max_output = req
        .effective_max_tokens()
        .unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS);
    if thinking_enabled && claude_family {
        max_output = promote_max_output_tokens(max_output, budget_tokens);
    }
    let has_tools = req.tools.as_ref().map(|t| !t.is_empty()).unwrap_or(false);
    if (has_tools || has_tool_results) && ctx.cfg.max_output_tokens_with_tools > 0 {
        max_output = max_output.min(ctx.cfg.max_output_tokens_with_tools);
    }

    let mut gen_config = json!({
        "temperature": req.temperature.unwrap_or(1.0),
        "maxOutputTokens": max_output,
        "candidateCount": 1,
    });
    if let Some(top_p) = req.top_p {
        gen_config["topP"] = json!(top_p);
    }
    if let Some(stop) = &req.stop {
        match stop {
            Value::String(s) => gen_config["stopSequences"] = json!([s]),
            Value::Array(_) => gen_config["stopSequences"] = stop.clone(),
            _ => {}
        }
    }
    if thinking_enabled {
        gen_config["thinkingConfig"] = json!({
            "includeThoughts": true,
            "thinkingBudget": budget_tokens,
        });
    }

    let mut inner = json!({
        "contents": contents,
        "generationConfig": gen_config,
        "safetySettings": safety_settings_off(),
    });

    if !system_text.is_empty() {
        inner["systemInstruction"] = json!({
            "role": "user",
            "parts": [{"text": wrap_system_prompt(&system_text.join("\n"))}],
        });
    }

    if let Some(tools) = &req.tools {
        let mut declarations: Vec<Value> = Vec::new();
        for tool in tools {
            let mut func = tool
                .get("function")
                .cloned()
                .unwrap_or_else(|| tool.clone());
            if let Some(obj) = func.as_object_mut() {
                obj.remove("type");
                obj.remove("strict");
                // Declarations without parameters still need a schema for
                // the placeholder to hang off.
                obj.entry("parameters".to_string())
                    .or_insert_with(|| json!({"type": "object", "properties": {}}));
            }
            if let Some(params) = func.get_mut("parameters") {
                normalize_schema(params, uppercase_types);
                if let Some(obj) = params.as_object_mut() {
                    if !obj.contains_key("type") {
                        obj.insert(
                            "type".to_string(),
                            json!(if uppercase_types { "OBJECT" } else { "object" }),
                        );
                    }
                }
                inject_required_placeholder(params, uppercase_types);
            }
            declarations.push(func);
        }
        if !declarations.is_empty() {
            inner["tools"] = json!([{ "functionDeclarations": declarations }]);
            inner["toolConfig"] = json!({
                "functionCallingConfig": {
                    "mode": tool_choice_to_mode(req.tool_choice.as_ref())
                }
            });
        }
    }

    Ok(PreparedRequest {
        inner,
        upstream_model,
        thinking_enabled,
    })
}

/// Map an `image_url` to an inlineData part. Accepts data-URLs and raw
/// base64 payloads.
fn image_part(url: &str) -> Option<Value> {
    if let Some(rest) = url.strip_prefix("data:") {
        let comma = rest.find(',')?;
        let mime_type = rest[..comma].split(';').next().unwrap_or("image/jpeg");
        let data = &rest[comma + 1..];
        return Some(json!({
            "inlineData": {"mimeType": mime_type, "data": data}
        }));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        tracing::debug!("skipping remote image url; only inline data is forwarded");
        return None;
    }
    // Raw base64 without a wrapper; anything that does not decode is noise.
    use base64::Engine as _;
    if base64::engine::general_purpose::STANDARD.decode(url).is_err() {
        tracing::debug!("dropping image_url that is neither a data-url nor base64");
        return None;
    }
    Some(json!({
        "inlineData": {"mimeType": "image/jpeg", "data": url}
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mappers::common_utils::PLACEHOLDER_REQUIRED_PROP;
    use crate::signature_cache::{SignatureCache, SignatureTtls};

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

    fn parse(value: Value) -> OpenAIRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn simple_text_message() {
        let cache = cache();
        let cfg = RelayConfig::default();
        let ctx = OpenAiRequestContext {
            cache: &cache,
            cfg: &cfg,
        };
        let req = parse(json!({
            "model": "gemini-2.5-pro",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let prepared = transform_openai_request(&req, &ctx).unwrap();
        assert_eq!(
            prepared.inner["contents"],
            json!([{"role": "user", "parts": [{"text": "hi"}]}])
        );
        assert!(!prepared.thinking_enabled);
    }

    #[test]
    fn tool_round_trip_contents() {
        let cache = cache();
        let cfg = RelayConfig::default();
        let ctx = OpenAiRequestContext {
            cache: &cache,
            cfg: &cfg,
        };
        let req = parse(json!({
            "model": "gemini-2.5-pro",
            "messages": [
                {"role": "user", "content": "calc"},
                {"role": "assistant", "tool_calls": [
                    {"id": "call_a", "type": "function",
                     "function": {"name": "f", "arguments": "{\"x\":1}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_a", "content": "42"}
            ]
        }));
        let prepared = transform_openai_request(&req, &ctx).unwrap();
        let contents = prepared.inner["contents"].as_array().unwrap();

        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["functionCall"]["name"], "f");
        assert_eq!(contents[1]["parts"][0]["functionCall"]["args"], json!({"x": 1}));

        assert_eq!(contents[2]["role"], "user");
        let fr = &contents[2]["parts"][0]["functionResponse"];
        assert_eq!(fr["id"], "call_a");
        assert_eq!(fr["name"], "f");
        assert_eq!(fr["response"]["output"], "42");
    }

    #[test]
    fn consecutive_tool_replies_coalesce() {
        let cache = cache();
        let cfg = RelayConfig::default();
        let ctx = OpenAiRequestContext {
            cache: &cache,
            cfg: &cfg,
        };
        let req = parse(json!({
            "model": "gemini-2.5-pro",
            "messages": [
                {"role": "assistant", "tool_calls": [
                    {"id": "call_a", "type": "function", "function": {"name": "f", "arguments": "{}"}},
                    {"id": "call_b", "type": "function", "function": {"name": "g", "arguments": "{}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_a", "content": "1"},
                {"role": "tool", "tool_call_id": "call_b", "content": "2"}
            ]
        }));
        let prepared = transform_openai_request(&req, &ctx).unwrap();
        let contents = prepared.inner["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 2);
        let parts = contents[1]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["functionResponse"]["name"], "f");
        assert_eq!(parts[1]["functionResponse"]["name"], "g");
    }

    #[test]
    fn system_messages_wrapped_into_instruction() {
        let cache = cache();
        let cfg = RelayConfig::default();
        let ctx = OpenAiRequestContext {
            cache: &cache,
            cfg: &cfg,
        };
        let req = parse(json!({
            "model": "gemini-2.5-pro",
            "messages": [
                {"role": "system", "content": "Be terse."},
                {"role": "system", "content": "Answer in French."},
                {"role": "user", "content": "hi"}
            ]
        }));
        let prepared = transform_openai_request(&req, &ctx).unwrap();
        let text = prepared.inner["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap();
        assert!(text.contains("<user_system_prompt>"));
        assert!(text.contains("Be terse.\nAnswer in French."));
    }

    #[test]
    fn signature_replay_stamps_thought_and_calls() {
        let cache = cache();
        cache.cache_thinking_signature("toolu_1", "sig-r", Some("prior plan"));
        let mut cfg = RelayConfig::default();
        cfg.claude_openai_replay_thought_text = true;
        let ctx = OpenAiRequestContext {
            cache: &cache,
            cfg: &cfg,
        };
        let req = parse(json!({
            "model": "claude-sonnet-4-5-thinking",
            "messages": [
                {"role": "user", "content": "go"},
                {"role": "assistant", "tool_calls": [
                    {"id": "toolu_1", "type": "function", "function": {"name": "f", "arguments": "{}"}}
                ]},
                {"role": "tool", "tool_call_id": "toolu_1", "content": "ok"}
            ]
        }));
        let prepared = transform_openai_request(&req, &ctx).unwrap();
        assert!(prepared.thinking_enabled);

        let parts = prepared.inner["contents"][1]["parts"].as_array().unwrap();
        assert_eq!(parts[0]["thought"], true);
        assert_eq!(parts[0]["text"], "prior plan");
        assert_eq!(parts[0]["thoughtSignature"], "sig-r");
        assert_eq!(parts[1]["thoughtSignature"], "sig-r");
    }

    #[test]
    fn missing_signature_downgrades_thinking() {
        let cache = cache();
        let cfg = RelayConfig::default();
        let ctx = OpenAiRequestContext {
            cache: &cache,
            cfg: &cfg,
        };
        let req = parse(json!({
            "model": "claude-sonnet-4-5-thinking",
            "messages": [
                {"role": "user", "content": "go"},
                {"role": "assistant", "tool_calls": [
                    {"id": "toolu_missing", "type": "function", "function": {"name": "f", "arguments": "{}"}}
                ]},
                {"role": "tool", "tool_call_id": "toolu_missing", "content": "ok"}
            ]
        }));
        let prepared = transform_openai_request(&req, &ctx).unwrap();

        assert!(!prepared.thinking_enabled);
        assert!(prepared.inner["generationConfig"]
            .get("thinkingConfig")
            .is_none());
        // No thought parts anywhere.
        for content in prepared.inner["contents"].as_array().unwrap() {
            for part in content["parts"].as_array().unwrap() {
                assert!(part.get("thought").is_none());
            }
        }
    }

    #[test]
    fn cross_provider_history_degrades_to_text() {
        let cache = cache();
        let cfg = RelayConfig::default();
        let ctx = OpenAiRequestContext {
            cache: &cache,
            cfg: &cfg,
        };
        let req = parse(json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "user", "content": "go"},
                {"role": "assistant", "content": "calling", "tool_calls": [
                    {"id": "call_openai", "type": "function", "function": {"name": "f", "arguments": "{}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_openai", "content": "output here"}
            ]
        }));
        let prepared = transform_openai_request(&req, &ctx).unwrap();
        let contents = prepared.inner["contents"].as_array().unwrap();

        // Assistant keeps text only.
        let assistant_parts = contents[1]["parts"].as_array().unwrap();
        assert_eq!(assistant_parts.len(), 1);
        assert_eq!(assistant_parts[0]["text"], "calling");

        // Tool reply became plain text.
        let tool_parts = contents[2]["parts"].as_array().unwrap();
        assert_eq!(tool_parts[0]["text"], "[tool:f] output here");
    }

    #[test]
    fn image_data_url_becomes_inline_data() {
        let cache = cache();
        let cfg = RelayConfig::default();
        let ctx = OpenAiRequestContext {
            cache: &cache,
            cfg: &cfg,
        };
        let req = parse(json!({
            "model": "gemini-2.5-pro",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "what is this"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}}
            ]}]
        }));
        let prepared = transform_openai_request(&req, &ctx).unwrap();
        let parts = prepared.inner["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts[1]["inlineData"]["mimeType"], "image/png");
        assert_eq!(parts[1]["inlineData"]["data"], "AAAA");
    }

    #[test]
    fn tools_get_placeholder_and_mode() {
        let cache = cache();
        let cfg = RelayConfig::default();
        let ctx = OpenAiRequestContext {
            cache: &cache,
            cfg: &cfg,
        };
        let req = parse(json!({
            "model": "gemini-2.5-pro",
            "messages": [{"role": "user", "content": "hi"}],
            "tool_choice": "auto",
            "tools": [{
                "type": "function",
                "function": {
                    "name": "f",
                    "parameters": {"type": "object", "properties": {"x": {"type": "string"}}}
                }
            }]
        }));
        let prepared = transform_openai_request(&req, &ctx).unwrap();
        let decl = &prepared.inner["tools"][0]["functionDeclarations"][0];
        assert_eq!(decl["parameters"]["type"], "OBJECT");
        assert_eq!(
            decl["parameters"]["required"],
            json!([PLACEHOLDER_REQUIRED_PROP])
        );
        assert_eq!(
            prepared.inner["toolConfig"]["functionCallingConfig"]["mode"],
            "AUTO"
        );
    }

    #[test]
    fn thinking_budget_flows_into_config() {
        let cache = cache();
        let cfg = RelayConfig::default();
        let ctx = OpenAiRequestContext {
            cache: &cache,
            cfg: &cfg,
        };
        let req = parse(json!({
            "model": "claude-sonnet-4-5-thinking",
            "max_tokens": 1000,
            "budget_tokens": 2048,
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let prepared = transform_openai_request(&req, &ctx).unwrap();
        let gen = &prepared.inner["generationConfig"];
        assert_eq!(gen["thinkingConfig"]["thinkingBudget"], 2048);
        assert_eq!(gen["maxOutputTokens"], 4096);
    }
}
