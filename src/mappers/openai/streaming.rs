// OpenAI streaming response transformation (upstream SSE -> chat-completion
// chunks).
//
// One state machine per connection. Claude-family turns carry thought
// signatures that may arrive after the tool calls they belong to; the
// Claude buffer defers those ids and reconciles them before the terminal
// finish_reason chunk.

use super::response::map_finish_reason;
use crate::config::ThinkingOutput;
use crate::mappers::common_utils::strip_placeholder_args;
use crate::mappers::gemini::GeminiPart;
use crate::signature_cache::SignatureCache;
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::Arc;

pub struct OpenAiStreamState {
    model: String,
    mode: ThinkingOutput,
    claude_family: bool,
    user_id: Option<String>,
    cache: Arc<SignatureCache>,

    response_id: Option<String>,
    created: u64,
    thinking_tag_open: bool,
    tool_call_index: u32,

    // Claude signature buffer.
    pending_signature: Option<String>,
    accum_thought_text: String,
    pending_tool_call_ids: Vec<String>,

    finished: bool,
}

impl OpenAiStreamState {
    pub fn new(
        model: String,
        mode: ThinkingOutput,
        claude_family: bool,
        user_id: Option<String>,
        cache: Arc<SignatureCache>,
    ) -> Self {
        Self {
            model,
            mode,
            claude_family,
            user_id,
            cache,
            response_id: None,
            created: chrono::Utc::now().timestamp() as u64,
            thinking_tag_open: false,
            tool_call_index: 0,
            pending_signature: None,
            accum_thought_text: String::new(),
            pending_tool_call_ids: Vec::new(),
            finished: false,
        }
    }

    fn frame(&self, delta: Value, finish_reason: Option<&str>, usage: Option<Value>) -> Bytes {
        let mut chunk = json!({
            "id": self.response_id.as_deref().unwrap_or("chatcmpl-stream"),
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        });
        if let Some(usage) = usage {
            chunk["usage"] = usage;
        }
        Bytes::from(format!(
            "data: {}\n\n",
            serde_json::to_string(&chunk).unwrap_or_default()
        ))
    }

    /// Cache a discovered signature against every deferred tool-call id.
    fn flush_pending_signatures(&mut self) {
        let Some(sig) = self.pending_signature.clone() else {
            return;
        };
        let thought = if self.accum_thought_text.is_empty() {
            None
        } else {
            Some(self.accum_thought_text.clone())
        };
        for id in self.pending_tool_call_ids.drain(..) {
            if self.claude_family {
                self.cache
                    .cache_thinking_signature(&id, &sig, thought.as_deref());
            } else {
                self.cache.cache_tool_thought_signature(&id, &sig);
            }
        }
    }

    fn store_signature(&mut self, signature: &str) {
        self.pending_signature = Some(signature.to_string());
        self.flush_pending_signatures();
    }

    fn cache_for_call(&mut self, id: &str, signature: &str) {
        if self.claude_family {
            let thought = if self.accum_thought_text.is_empty() {
                None
            } else {
                Some(self.accum_thought_text.as_str())
            };
            self.cache.cache_thinking_signature(id, signature, thought);
        } else {
            self.cache.cache_tool_thought_signature(id, signature);
        }
    }

    fn close_think_tag(&mut self, out: &mut Vec<Bytes>) {
        if self.thinking_tag_open {
            out.push(self.frame(json!({"content": "\n</think>\n\n"}), None, None));
            self.thinking_tag_open = false;
        }
    }

    /// Process one decoded upstream chunk (bare payload, wrapper removed).
    pub fn process_chunk(&mut self, raw: &Value) -> Vec<Bytes> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }

        if self.response_id.is_none() {
            self.response_id = raw
                .get("responseId")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
        }

        // Signature scan at response and candidate level.
        for holder in [
            raw.get("thoughtSignature"),
            raw.get("candidates")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("thoughtSignature")),
        ]
        .into_iter()
        .flatten()
        {
            if let Some(sig) = holder.as_str().map(|s| s.to_string()) {
                self.store_signature(&sig);
            }
        }

        let parts: Vec<GeminiPart> = raw
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|p| serde_json::from_value(p.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        for part in &parts {
            self.process_part(part, &mut out);
        }

        if let Some(finish_reason) = raw
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("finishReason"))
            .and_then(|f| f.as_str())
        {
            // Signatures must be cached before finish_reason goes out.
            self.flush_pending_signatures();
            if let (Some(sig), Some(user)) =
                (self.pending_signature.as_deref(), self.user_id.as_deref())
            {
                if self.claude_family {
                    self.cache.cache_last_thinking_signature(user, sig);
                }
            }
            self.close_think_tag(&mut out);

            let usage = raw.get("usageMetadata").map(|u| {
                json!({
                    "prompt_tokens": u.get("promptTokenCount").and_then(|v| v.as_u64()).unwrap_or(0),
                    "completion_tokens": u.get("candidatesTokenCount").and_then(|v| v.as_u64()).unwrap_or(0),
                    "total_tokens": u.get("totalTokenCount").and_then(|v| v.as_u64()).unwrap_or(0),
                })
            });
            out.push(self.frame(
                json!({}),
                Some(map_finish_reason(Some(finish_reason))),
                usage,
            ));
            self.finished = true;
        }

        out
    }

    fn process_part(&mut self, part: &GeminiPart, out: &mut Vec<Bytes>) {
        if let Some(sig) = part.thought_signature.clone() {
            self.store_signature(&sig);
        }

        if let Some(fc) = &part.function_call {
            self.close_think_tag(out);

            let id = fc.id.clone().unwrap_or_else(|| {
                format!("{}-{}", fc.name, crate::common::utils::generate_random_id())
            });

            match part
                .thought_signature
                .clone()
                .or_else(|| self.pending_signature.clone())
            {
                Some(sig) => self.cache_for_call(&id, &sig),
                None => self.pending_tool_call_ids.push(id.clone()),
            }

            let mut args = fc.args.clone().unwrap_or(json!({}));
            strip_placeholder_args(&mut args);

            let index = self.tool_call_index;
            self.tool_call_index += 1;
            out.push(self.frame(
                json!({
                    "tool_calls": [{
                        "index": index,
                        "id": id,
                        "type": "function",
                        "function": {
                            "name": fc.name,
                            "arguments": serde_json::to_string(&args)
                                .unwrap_or_else(|_| "{}".to_string()),
                        },
                    }]
                }),
                None,
                None,
            ));
            return;
        }

        if let Some(text) = &part.text {
            if text.is_empty() {
                return;
            }
            if part.thought.unwrap_or(false) {
                self.accum_thought_text.push_str(text);
                if self.mode.wants_reasoning_field() {
                    out.push(self.frame(json!({"reasoning_content": text}), None, None));
                }
                if self.mode.wants_tags() {
                    if !self.thinking_tag_open {
                        out.push(self.frame(json!({"content": "<think>\n"}), None, None));
                        self.thinking_tag_open = true;
                    }
                    out.push(self.frame(json!({"content": text}), None, None));
                }
                return;
            }
            self.close_think_tag(out);
            out.push(self.frame(json!({"content": text}), None, None));
            return;
        }

        if let Some(img) = &part.inline_data {
            if img.data.is_empty() {
                return;
            }
            self.close_think_tag(out);
            let markdown = format!("![image](data:{};base64,{})", img.mime_type, img.data);
            out.push(self.frame(json!({"content": markdown}), None, None));
        }
    }

    /// Terminal frames for streams that ended without a finishReason, plus
    /// the `[DONE]` marker.
    pub fn finalize(&mut self) -> Vec<Bytes> {
        let mut out = Vec::new();
        if !self.finished {
            self.flush_pending_signatures();
            self.close_think_tag(&mut out);
            out.push(self.frame(json!({}), Some("stop"), None));
            self.finished = true;
        }
        out.push(Bytes::from("data: [DONE]\n\n"));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature_cache::SignatureTtls;

    fn cache() -> Arc<SignatureCache> {
        Arc::new(SignatureCache::new(
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
        ))
    }

    fn state(mode: ThinkingOutput, claude: bool) -> OpenAiStreamState {
        OpenAiStreamState::new(
            "test-model".to_string(),
            mode,
            claude,
            Some("user-1".to_string()),
            cache(),
        )
    }

    fn frames_to_chunks(frames: &[Bytes]) -> Vec<Value> {
        frames
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .flat_map(|s| {
                s.split("\n\n")
                    .filter(|l| !l.trim().is_empty())
                    .map(|l| l.trim_start_matches("data: ").to_string())
                    .collect::<Vec<_>>()
            })
            .filter(|s| s != "[DONE]")
            .map(|s| serde_json::from_str(&s).unwrap())
            .collect()
    }

    #[test]
    fn text_deltas_flow_through() {
        let mut st = state(ThinkingOutput::ReasoningContent, false);
        let frames = st.process_chunk(&json!({
            "candidates": [{"content": {"parts": [{"text": "hel"}, {"text": "lo"}]}}],
            "responseId": "r1"
        }));
        let chunks = frames_to_chunks(&frames);
        assert_eq!(chunks[0]["choices"][0]["delta"]["content"], "hel");
        assert_eq!(chunks[1]["choices"][0]["delta"]["content"], "lo");
        assert_eq!(chunks[0]["id"], "r1");
    }

    #[test]
    fn think_tags_open_and_close() {
        let mut st = state(ThinkingOutput::Tags, false);
        let mut frames = st.process_chunk(&json!({
            "candidates": [{"content": {"parts": [{"text": "mull", "thought": true}]}}]
        }));
        frames.extend(st.process_chunk(&json!({
            "candidates": [{"content": {"parts": [{"text": "answer"}]}}]
        })));
        let chunks = frames_to_chunks(&frames);
        let contents: Vec<String> = chunks
            .iter()
            .filter_map(|c| c["choices"][0]["delta"]["content"].as_str().map(String::from))
            .collect();
        assert_eq!(contents, vec!["<think>\n", "mull", "\n</think>\n\n", "answer"]);
    }

    #[test]
    fn reasoning_content_mode_uses_field() {
        let mut st = state(ThinkingOutput::ReasoningContent, false);
        let frames = st.process_chunk(&json!({
            "candidates": [{"content": {"parts": [{"text": "mull", "thought": true}]}}]
        }));
        let chunks = frames_to_chunks(&frames);
        assert_eq!(chunks[0]["choices"][0]["delta"]["reasoning_content"], "mull");
        assert!(chunks[0]["choices"][0]["delta"].get("content").is_none());
    }

    #[test]
    fn tool_call_deltas_increment_index() {
        let mut st = state(ThinkingOutput::ReasoningContent, false);
        let frames = st.process_chunk(&json!({
            "candidates": [{"content": {"parts": [
                {"functionCall": {"id": "call_1", "name": "f", "args": {"a": 1}}},
                {"functionCall": {"id": "call_2", "name": "g", "args": {}}}
            ]}}]
        }));
        let chunks = frames_to_chunks(&frames);
        assert_eq!(chunks[0]["choices"][0]["delta"]["tool_calls"][0]["index"], 0);
        assert_eq!(chunks[1]["choices"][0]["delta"]["tool_calls"][0]["index"], 1);
        assert_eq!(
            chunks[0]["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"],
            "{\"a\":1}"
        );
    }

    #[test]
    fn late_signature_cached_before_finish() {
        let cache = cache();
        let mut st = OpenAiStreamState::new(
            "claude-sonnet-4-5-thinking".to_string(),
            ThinkingOutput::ReasoningContent,
            true,
            None,
            cache.clone(),
        );

        // Tool call first, signature later, then finish.
        let _ = st.process_chunk(&json!({
            "candidates": [{"content": {"parts": [
                {"functionCall": {"id": "toolu_s", "name": "f", "args": {}}}
            ]}}]
        }));
        assert!(cache.get_thinking_signature("toolu_s").is_none());

        let _ = st.process_chunk(&json!({
            "candidates": [{"content": {"parts": [
                {"text": "", "thoughtSignature": "sig-9"}
            ]}}]
        }));
        let frames = st.process_chunk(&json!({
            "candidates": [{"content": {"parts": []}, "finishReason": "STOP"}]
        }));

        assert_eq!(
            cache.get_thinking_signature("toolu_s"),
            Some("sig-9".to_string())
        );
        let chunks = frames_to_chunks(&frames);
        assert_eq!(chunks.last().unwrap()["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn finish_maps_max_tokens_to_length() {
        let mut st = state(ThinkingOutput::ReasoningContent, false);
        let frames = st.process_chunk(&json!({
            "candidates": [{"content": {"parts": [{"text": "x"}]}, "finishReason": "MAX_TOKENS"}],
            "usageMetadata": {"promptTokenCount": 1, "candidatesTokenCount": 2, "totalTokenCount": 3}
        }));
        let chunks = frames_to_chunks(&frames);
        let last = chunks.last().unwrap();
        assert_eq!(last["choices"][0]["finish_reason"], "length");
        assert_eq!(last["usage"]["total_tokens"], 3);
    }

    #[test]
    fn finalize_emits_done_marker() {
        let mut st = state(ThinkingOutput::ReasoningContent, false);
        let frames = st.finalize();
        let text: String = frames
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect();
        assert!(text.contains("\"finish_reason\":\"stop\""));
        assert!(text.ends_with("data: [DONE]\n\n"));
    }
}
