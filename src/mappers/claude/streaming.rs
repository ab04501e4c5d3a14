// Claude streaming response transformation (upstream SSE -> Anthropic SSE).
//
// One state machine per connection. Event grammar: message_start, then
// content_block_start / content_block_delta / content_block_stop pairs by
// index, then message_delta, then message_stop. The thinking block, when
// present, is always index 0.

use super::utils::to_claude_usage;
use crate::mappers::common_utils::strip_placeholder_args;
use crate::mappers::gemini::{GeminiPart, UsageMetadata};
use crate::signature_cache::SignatureCache;
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::Arc;

pub struct ClaudeStreamState {
    thinking_enabled: bool,
    user_id: Option<String>,
    cache: Arc<SignatureCache>,

    message_start_sent: bool,
    message_stop_sent: bool,

    has_thinking: bool,
    in_thinking: bool,
    thinking_stopped: bool,
    next_index: usize,
    in_text: bool,
    text_index: usize,
    has_tool_use: bool,

    last_thinking_signature: Option<String>,
    last_user_thinking_signature: Option<String>,
    pending_tool_use_ids: Vec<String>,
    accum_thought_text: String,
    completed: bool,
}

impl ClaudeStreamState {
    pub fn new(
        thinking_enabled: bool,
        user_id: Option<String>,
        cache: Arc<SignatureCache>,
    ) -> Self {
        let last_user_thinking_signature = user_id
            .as_deref()
            .and_then(|u| cache.get_last_thinking_signature(u));
        Self {
            thinking_enabled,
            user_id,
            cache,
            message_start_sent: false,
            message_stop_sent: false,
            has_thinking: false,
            in_thinking: false,
            thinking_stopped: false,
            next_index: 0,
            in_text: false,
            text_index: 0,
            has_tool_use: false,
            last_thinking_signature: None,
            last_user_thinking_signature,
            pending_tool_use_ids: Vec::new(),
            accum_thought_text: String::new(),
            completed: false,
        }
    }

    fn emit(&self, event_type: &str, data: Value) -> Bytes {
        let sse = format!(
            "event: {}\ndata: {}\n\n",
            event_type,
            serde_json::to_string(&data).unwrap_or_default()
        );
        Bytes::from(sse)
    }

    fn emit_delta(&self, index: usize, delta: Value) -> Bytes {
        self.emit(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": index,
                "delta": delta,
            }),
        )
    }

    fn emit_block_start(&self, index: usize, content_block: Value) -> Bytes {
        self.emit(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": index,
                "content_block": content_block,
            }),
        )
    }

    fn emit_block_stop(&self, index: usize) -> Bytes {
        self.emit(
            "content_block_stop",
            json!({
                "type": "content_block_stop",
                "index": index,
            }),
        )
    }

    fn emit_message_start(&mut self, raw: &Value) -> Bytes {
        self.message_start_sent = true;

        let usage = raw
            .get("usageMetadata")
            .and_then(|u| serde_json::from_value::<UsageMetadata>(u.clone()).ok())
            .map(|u| to_claude_usage(&u));

        let mut message = json!({
            "id": raw.get("responseId").and_then(|v| v.as_str()).unwrap_or("msg_unknown"),
            "type": "message",
            "role": "assistant",
            "content": [],
            "model": raw.get("modelVersion").and_then(|v| v.as_str()).unwrap_or(""),
            "stop_reason": null,
            "stop_sequence": null,
        });
        if let Some(u) = usage {
            message["usage"] = json!(u);
        }

        self.emit(
            "message_start",
            json!({"type": "message_start", "message": message}),
        )
    }

    /// Best known signature for the current stream.
    fn known_signature(&self) -> Option<String> {
        self.last_thinking_signature
            .clone()
            .or_else(|| self.last_user_thinking_signature.clone())
    }

    /// A signature surfaced (at any chunk level): remember it and flush
    /// every deferred tool-use id into the cache.
    fn store_signature(&mut self, signature: &str) {
        self.last_thinking_signature = Some(signature.to_string());
        self.flush_pending_ids();
    }

    fn flush_pending_ids(&mut self) {
        let Some(sig) = self.last_thinking_signature.clone() else {
            return;
        };
        let thought = if self.accum_thought_text.is_empty() {
            None
        } else {
            Some(self.accum_thought_text.clone())
        };
        for id in self.pending_tool_use_ids.drain(..) {
            self.cache
                .cache_thinking_signature(&id, &sig, thought.as_deref());
        }
    }

    fn open_thinking(&mut self, out: &mut Vec<Bytes>) {
        if self.has_thinking || self.thinking_stopped {
            return;
        }
        let mut block = json!({"type": "thinking", "thinking": ""});
        if let Some(sig) = self.known_signature() {
            block["signature"] = json!(sig);
        }
        out.push(self.emit_block_start(0, block));
        self.has_thinking = true;
        self.in_thinking = true;
        if self.next_index == 0 {
            self.next_index = 1;
        }
    }

    fn close_thinking(&mut self, out: &mut Vec<Bytes>) {
        if !self.in_thinking {
            return;
        }
        if let Some(sig) = &self.last_thinking_signature {
            out.push(self.emit_delta(0, json!({"type": "signature_delta", "signature": sig})));
        }
        out.push(self.emit_block_stop(0));
        self.in_thinking = false;
        self.thinking_stopped = true;
    }

    /// Clients that require a leading thinking block get a synthetic one
    /// the moment the first non-thinking content arrives.
    fn synthesize_leading_thinking(&mut self, out: &mut Vec<Bytes>) {
        if !self.thinking_enabled || self.has_thinking || self.thinking_stopped {
            return;
        }
        out.push(self.emit_block_start(0, json!({"type": "thinking", "thinking": ""})));
        out.push(self.emit_delta(0, json!({"type": "thinking_delta", "thinking": ""})));
        if let Some(sig) = self.known_signature() {
            out.push(self.emit_delta(0, json!({"type": "signature_delta", "signature": sig})));
        }
        out.push(self.emit_block_stop(0));
        self.has_thinking = true;
        self.thinking_stopped = true;
        if self.next_index == 0 {
            self.next_index = 1;
        }
    }

    fn open_text(&mut self, out: &mut Vec<Bytes>) {
        if self.in_text {
            return;
        }
        self.text_index = self.next_index;
        self.next_index += 1;
        out.push(self.emit_block_start(self.text_index, json!({"type": "text", "text": ""})));
        self.in_text = true;
    }

    fn close_text(&mut self, out: &mut Vec<Bytes>) {
        if !self.in_text {
            return;
        }
        out.push(self.emit_block_stop(self.text_index));
        self.in_text = false;
    }

    /// Process one decoded upstream chunk (the bare response payload, with
    /// any `{response:…}` wrapper already removed).
    pub fn process_chunk(&mut self, raw: &Value) -> Vec<Bytes> {
        let mut out = Vec::new();
        if self.completed {
            return out;
        }

        if !self.message_start_sent {
            let frame = self.emit_message_start(raw);
            out.push(frame);
        }

        // Signatures can surface at response or candidate level too.
        for holder in [
            raw.get("thoughtSignature"),
            raw.get("candidates")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("thoughtSignature")),
        ]
        .into_iter()
        .flatten()
        {
            if let Some(sig) = holder.as_str() {
                self.store_signature(sig);
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
            let usage = raw
                .get("usageMetadata")
                .and_then(|u| serde_json::from_value::<UsageMetadata>(u.clone()).ok());
            out.extend(self.finish(Some(finish_reason), usage.as_ref()));
        }

        out
    }

    fn process_part(&mut self, part: &GeminiPart, out: &mut Vec<Bytes>) {
        if let Some(sig) = &part.thought_signature {
            self.store_signature(&sig.clone());
        }

        if let Some(fc) = &part.function_call {
            self.synthesize_leading_thinking(out);
            self.close_thinking(out);
            self.close_text(out);
            self.has_tool_use = true;

            let tool_id = fc.id.clone().unwrap_or_else(|| {
                format!("{}-{}", fc.name, crate::common::utils::generate_random_id())
            });

            let signature = part
                .thought_signature
                .clone()
                .or_else(|| self.known_signature());
            match &signature {
                Some(sig) => {
                    self.cache.cache_thinking_signature(
                        &tool_id,
                        sig,
                        if self.accum_thought_text.is_empty() {
                            None
                        } else {
                            Some(self.accum_thought_text.as_str())
                        },
                    );
                }
                None => self.pending_tool_use_ids.push(tool_id.clone()),
            }

            let index = self.next_index;
            self.next_index += 1;

            let mut block = json!({
                "type": "tool_use",
                "id": tool_id,
                "name": fc.name,
                "input": {},
            });
            if let Some(sig) = signature {
                block["signature"] = json!(sig);
            }
            out.push(self.emit_block_start(index, block));

            let mut args = fc.args.clone().unwrap_or(json!({}));
            strip_placeholder_args(&mut args);
            let args_str = serde_json::to_string(&args).unwrap_or_else(|_| "{}".to_string());
            out.push(self.emit_delta(
                index,
                json!({"type": "input_json_delta", "partial_json": args_str}),
            ));
            out.push(self.emit_block_stop(index));
            return;
        }

        if let Some(text) = &part.text {
            if part.thought.unwrap_or(false) {
                self.open_thinking(out);
                if !text.is_empty() {
                    self.accum_thought_text.push_str(text);
                    out.push(self.emit_delta(0, json!({"type": "thinking_delta", "thinking": text})));
                }
                return;
            }
            // Empty text never opens a block and never triggers the
            // synthetic leading thinking.
            if text.is_empty() {
                return;
            }
            self.synthesize_leading_thinking(out);
            self.close_thinking(out);
            self.open_text(out);
            let index = self.text_index;
            out.push(self.emit_delta(index, json!({"type": "text_delta", "text": text})));
            return;
        }

        if let Some(img) = &part.inline_data {
            if img.data.is_empty() {
                return;
            }
            self.synthesize_leading_thinking(out);
            self.close_thinking(out);
            self.open_text(out);
            let markdown = format!("![image](data:{};base64,{})", img.mime_type, img.data);
            let index = self.text_index;
            out.push(self.emit_delta(index, json!({"type": "text_delta", "text": markdown})));
        }
    }

    fn finish(
        &mut self,
        finish_reason: Option<&str>,
        usage_metadata: Option<&UsageMetadata>,
    ) -> Vec<Bytes> {
        let mut out = Vec::new();
        if self.completed {
            return out;
        }

        self.close_thinking(&mut out);
        self.close_text(&mut out);

        // Late signatures are reconciled before the stream terminates.
        if self.last_thinking_signature.is_none() {
            if let Some(sig) = self.last_user_thinking_signature.clone() {
                self.last_thinking_signature = Some(sig);
            }
        }
        self.flush_pending_ids();
        if let (Some(sig), Some(user)) =
            (self.last_thinking_signature.as_deref(), self.user_id.as_deref())
        {
            self.cache.cache_last_thinking_signature(user, sig);
        }

        let stop_reason = if self.has_tool_use {
            "tool_use"
        } else {
            match finish_reason {
                Some("MAX_TOKENS") => "max_tokens",
                Some("STOP_SEQUENCE") => "stop_sequence",
                _ => "end_turn",
            }
        };

        let usage = usage_metadata.map(to_claude_usage).unwrap_or(
            super::models::Usage {
                input_tokens: 0,
                output_tokens: 0,
                cache_read_input_tokens: None,
                cache_creation_input_tokens: None,
            },
        );

        out.push(self.emit(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                "usage": usage,
            }),
        ));
        out.push(Bytes::from(
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        ));
        self.message_stop_sent = true;
        self.completed = true;
        out
    }

    /// Terminate the stream regardless of whether the upstream sent a
    /// finishReason (connection loss, client abort).
    pub fn finalize(&mut self) -> Vec<Bytes> {
        if self.message_stop_sent {
            return Vec::new();
        }
        self.finish(None, None)
    }
}
