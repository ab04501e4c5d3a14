// Historical replay hygiene (runs before conversion).
//
// Upstream rejects tool-using assistant turns whose thinking signature is
// missing, and clients routinely drop thinking blocks when replaying
// history. This pass repairs what it can from the signature cache and
// downgrades the whole request when repair is impossible.

use super::models::*;
use crate::signature_cache::SignatureCache;
use serde_json::Value;

const JSON_PREFILL_HINT: &str =
    "Return only a single JSON object and start your response with '{'.";

const MAX_LOGGED_MISSING_IDS: usize = 50;

#[derive(Debug, Default)]
pub struct PreprocessReport {
    pub downgraded: bool,
    pub missing_tool_use_ids: Vec<String>,
}

pub fn preprocess_request(req: &mut ClaudeRequest, cache: &SignatureCache) -> PreprocessReport {
    let mut report = PreprocessReport::default();

    if !req.thinking_enabled() {
        // Signatures only matter with thinking on; still scrub unsigned
        // thinking blocks so the upstream never sees them.
        strip_unsigned_thinking(req);
        return report;
    }

    handle_json_prefill(req);

    let user_id = req.user_id().map(|s| s.to_string());

    for msg in req.messages.iter_mut() {
        if msg.role != "assistant" {
            continue;
        }
        let MessageContent::Array(blocks) = &mut msg.content else {
            continue;
        };

        blocks.retain(|b| !matches!(b, ContentBlock::Text { text } if text.is_empty()));

        let has_thinking = blocks.iter().any(|b| b.is_thinking_kind());

        // Content-hash recovery: the client dropped the thinking block but
        // we have seen this exact assistant message before.
        if !has_thinking {
            if let Some(user) = user_id.as_deref() {
                let content = content_without_thinking(blocks);
                if let Some(sig) = cache.get_assistant_signature(user, &content) {
                    blocks.insert(
                        0,
                        ContentBlock::RedactedThinking {
                            signature: Some(sig),
                            data: None,
                        },
                    );
                }
            }
        }

        let tool_use_ids: Vec<String> = blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, .. } => Some(id.clone()),
                _ => None,
            })
            .collect();

        if tool_use_ids.is_empty() {
            blocks.retain(|b| !b.is_thinking_kind() || b.thinking_signature().is_some());
            if blocks.is_empty() {
                blocks.push(ContentBlock::Text {
                    text: " ".to_string(),
                });
            }
            continue;
        }

        // Resolution order: existing signature, per-id cache, per-user
        // fallback.
        let mut signature: Option<String> = blocks
            .iter()
            .find_map(|b| b.thinking_signature().map(|s| s.to_string()));
        if signature.is_none() {
            signature = tool_use_ids
                .iter()
                .find_map(|id| cache.get_thinking_signature(id));
        }
        if signature.is_none() {
            if let Some(user) = user_id.as_deref() {
                signature = cache.get_last_thinking_signature(user);
            }
        }

        let Some(signature) = signature else {
            report.missing_tool_use_ids.extend(tool_use_ids);
            report.downgraded = true;
            continue;
        };

        enum LeadFix {
            ReplaceWithRedacted,
            SetSignature,
            Keep,
            PrependRedacted,
        }

        let fix = match blocks.first() {
            Some(ContentBlock::Thinking {
                thinking,
                signature: block_sig,
            }) => {
                if thinking.is_empty() {
                    // Never fabricate thought text; an empty thinking block
                    // becomes redacted_thinking carrying the signature.
                    LeadFix::ReplaceWithRedacted
                } else if block_sig.is_none() {
                    LeadFix::SetSignature
                } else {
                    LeadFix::Keep
                }
            }
            Some(ContentBlock::RedactedThinking {
                signature: block_sig,
                ..
            }) => {
                if block_sig.is_none() {
                    LeadFix::SetSignature
                } else {
                    LeadFix::Keep
                }
            }
            _ => LeadFix::PrependRedacted,
        };

        match fix {
            LeadFix::ReplaceWithRedacted => {
                blocks[0] = ContentBlock::RedactedThinking {
                    signature: Some(signature),
                    data: None,
                };
            }
            LeadFix::SetSignature => match blocks.first_mut() {
                Some(ContentBlock::Thinking {
                    signature: block_sig,
                    ..
                })
                | Some(ContentBlock::RedactedThinking {
                    signature: block_sig,
                    ..
                }) => *block_sig = Some(signature),
                _ => {}
            },
            LeadFix::Keep => {}
            LeadFix::PrependRedacted => {
                blocks.insert(
                    0,
                    ContentBlock::RedactedThinking {
                        signature: Some(signature),
                        data: None,
                    },
                );
            }
        }
    }

    if report.downgraded {
        apply_downgrade(req, &report);
    }

    report
}

/// Claude-Code compatibility: a lone trailing assistant `{"` prefill forces
/// JSON output, but prefill is incompatible with thinking. Replace it with
/// a system hint.
fn handle_json_prefill(req: &mut ClaudeRequest) {
    let is_prefill = req.messages.last().map_or(false, |m| {
        m.role == "assistant"
            && match &m.content {
                MessageContent::String(s) => s == "{",
                MessageContent::Array(blocks) => {
                    blocks.len() == 1
                        && matches!(&blocks[0], ContentBlock::Text { text } if text == "{")
                }
            }
    });
    if !is_prefill {
        return;
    }

    req.messages.pop();
    match req.system.as_mut() {
        Some(system) => system.append_hint(JSON_PREFILL_HINT),
        None => req.system = Some(SystemPrompt::String(JSON_PREFILL_HINT.to_string())),
    }
}

/// Downgrade: disable thinking for the whole request and remove every
/// thinking block from history.
fn apply_downgrade(req: &mut ClaudeRequest, report: &PreprocessReport) {
    req.thinking = Some(ThinkingConfig::disabled());
    for msg in req.messages.iter_mut() {
        if let MessageContent::Array(blocks) = &mut msg.content {
            blocks.retain(|b| !b.is_thinking_kind());
            if blocks.is_empty() {
                blocks.push(ContentBlock::Text {
                    text: " ".to_string(),
                });
            }
        }
    }

    let logged: Vec<&str> = report
        .missing_tool_use_ids
        .iter()
        .take(MAX_LOGGED_MISSING_IDS)
        .map(|s| s.as_str())
        .collect();
    tracing::warn!(
        kind = "thinking_downgrade",
        reason = "missing_thinking_signature_for_tool_use_history",
        missing_count = report.missing_tool_use_ids.len(),
        missing_tool_use_ids = ?logged,
        "disabling thinking: tool-use history has no recoverable signatures"
    );
}

fn strip_unsigned_thinking(req: &mut ClaudeRequest) {
    for msg in req.messages.iter_mut() {
        if msg.role != "assistant" {
            continue;
        }
        if let MessageContent::Array(blocks) = &mut msg.content {
            blocks.retain(|b| !b.is_thinking_kind());
            if blocks.is_empty() {
                blocks.push(ContentBlock::Text {
                    text: " ".to_string(),
                });
            }
        }
    }
}

/// Assistant content with thinking blocks removed, as hashed by the
/// signature cache.
pub fn content_without_thinking(blocks: &[ContentBlock]) -> Value {
    let filtered: Vec<&ContentBlock> = blocks.iter().filter(|b| !b.is_thinking_kind()).collect();
    serde_json::to_value(filtered).unwrap_or(Value::Null)
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

    fn request(messages: Vec<Message>) -> ClaudeRequest {
        serde_json::from_value(json!({
            "model": "claude-sonnet-4-5",
            "messages": [],
            "thinking": {"type": "enabled", "budget_tokens": 1024},
            "metadata": {"user_id": "user-1"}
        }))
        .map(|mut r: ClaudeRequest| {
            r.messages = messages;
            r
        })
        .unwrap()
    }

    fn assistant(blocks: Vec<ContentBlock>) -> Message {
        Message {
            role: "assistant".to_string(),
            content: MessageContent::Array(blocks),
        }
    }

    fn tool_use(id: &str) -> ContentBlock {
        ContentBlock::ToolUse {
            id: id.to_string(),
            name: "calc".to_string(),
            input: json!({"x": 1}),
            signature: None,
        }
    }

    #[test]
    fn cached_signature_prepends_redacted_thinking() {
        let cache = cache();
        cache.cache_thinking_signature("toolu_1", "sig-1", None);

        let mut req = request(vec![assistant(vec![tool_use("toolu_1")])]);
        let report = preprocess_request(&mut req, &cache);

        assert!(!report.downgraded);
        let MessageContent::Array(blocks) = &req.messages[0].content else {
            panic!()
        };
        assert!(matches!(
            &blocks[0],
            ContentBlock::RedactedThinking { signature: Some(s), .. } if s == "sig-1"
        ));
    }

    #[test]
    fn empty_thinking_text_becomes_redacted_never_fabricated() {
        let cache = cache();
        let mut req = request(vec![assistant(vec![
            ContentBlock::Thinking {
                thinking: String::new(),
                signature: Some("sig-x".to_string()),
            },
            tool_use("toolu_2"),
        ])]);
        let report = preprocess_request(&mut req, &cache);

        assert!(!report.downgraded);
        let MessageContent::Array(blocks) = &req.messages[0].content else {
            panic!()
        };
        assert!(matches!(
            &blocks[0],
            ContentBlock::RedactedThinking { signature: Some(s), .. } if s == "sig-x"
        ));
    }

    #[test]
    fn cache_miss_everywhere_downgrades_whole_request() {
        let cache = cache();
        let mut req = request(vec![
            assistant(vec![
                ContentBlock::Thinking {
                    thinking: "old reasoning".to_string(),
                    signature: Some("sig-ok".to_string()),
                },
                ContentBlock::Text {
                    text: "fine".to_string(),
                },
            ]),
            assistant(vec![tool_use("toolu_missing")]),
        ]);
        let report = preprocess_request(&mut req, &cache);

        assert!(report.downgraded);
        assert_eq!(report.missing_tool_use_ids, vec!["toolu_missing"]);
        assert_eq!(
            req.thinking.as_ref().map(|t| t.type_.as_str()),
            Some("disabled")
        );
        // Every thinking block is gone, including valid ones.
        for msg in &req.messages {
            if let MessageContent::Array(blocks) = &msg.content {
                assert!(blocks.iter().all(|b| !b.is_thinking_kind()));
            }
        }
    }

    #[test]
    fn invariant_signature_or_downgrade() {
        // After preprocess, every assistant message with tool_use either
        // starts with a signature-bearing thinking block or the request is
        // downgraded with no thinking blocks left.
        for seeded in [true, false] {
            let cache = cache();
            if seeded {
                cache.cache_last_thinking_signature("user-1", "sig-last");
            }
            let mut req = request(vec![assistant(vec![tool_use("toolu_z")])]);
            let report = preprocess_request(&mut req, &cache);

            let MessageContent::Array(blocks) = &req.messages[0].content else {
                panic!()
            };
            if report.downgraded {
                assert!(blocks.iter().all(|b| !b.is_thinking_kind()));
            } else {
                assert!(blocks[0].is_thinking_kind());
                assert!(blocks[0].thinking_signature().is_some());
            }
            assert_eq!(report.downgraded, !seeded);
        }
    }

    #[test]
    fn unsigned_thinking_removed_without_tool_use() {
        let cache = cache();
        let mut req = request(vec![assistant(vec![ContentBlock::Thinking {
            thinking: "loose thought".to_string(),
            signature: None,
        }])]);
        preprocess_request(&mut req, &cache);

        let MessageContent::Array(blocks) = &req.messages[0].content else {
            panic!()
        };
        assert_eq!(blocks.len(), 1);
        assert!(matches!(&blocks[0], ContentBlock::Text { text } if text == " "));
    }

    #[test]
    fn content_hash_recovery_inserts_redacted_thinking() {
        let cache = cache();
        let blocks = vec![
            ContentBlock::Text {
                text: "the answer".to_string(),
            },
            tool_use("toolu_h"),
        ];
        let content = content_without_thinking(&blocks);
        cache.cache_assistant_signature("user-1", &content, "sig-hash");

        let mut req = request(vec![assistant(blocks)]);
        let report = preprocess_request(&mut req, &cache);

        assert!(!report.downgraded);
        let MessageContent::Array(blocks) = &req.messages[0].content else {
            panic!()
        };
        assert!(matches!(
            &blocks[0],
            ContentBlock::RedactedThinking { signature: Some(s), .. } if s == "sig-hash"
        ));
    }

    #[test]
    fn json_prefill_swapped_for_system_hint() {
        let cache = cache();
        let mut req = request(vec![
            Message {
                role: "user".to_string(),
                content: MessageContent::String("give me json".to_string()),
            },
            Message {
                role: "assistant".to_string(),
                content: MessageContent::String("{".to_string()),
            },
        ]);
        preprocess_request(&mut req, &cache);

        assert_eq!(req.messages.len(), 1);
        let system = req.system.as_ref().unwrap().joined();
        assert!(system.contains("start your response with '{'"));
    }

    #[test]
    fn thinking_disabled_strips_all_thinking_blocks() {
        let cache = cache();
        let mut req = request(vec![assistant(vec![ContentBlock::Thinking {
            thinking: "t".to_string(),
            signature: Some("sig".to_string()),
        }])]);
        req.thinking = Some(ThinkingConfig::disabled());
        preprocess_request(&mut req, &cache);

        let MessageContent::Array(blocks) = &req.messages[0].content else {
            panic!()
        };
        assert!(blocks.iter().all(|b| !b.is_thinking_kind()));
    }
}
