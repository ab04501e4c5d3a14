// Tool-result normalisation and head/tail truncation under a budget.

use serde_json::Value;

pub const OMITTED_SENTINEL: &str =
    "[antigravity-relay] tool output omitted (prompt budget exceeded).";

const ERROR_PREFIX: &str = "[tool_error]\n";

/// Per-request truncation budget. One instance per inbound request; the
/// global remaining counter decays as tool results are admitted.
#[derive(Debug, Clone)]
pub struct OutputBudget {
    /// Per-tool-result cap; 0 = unlimited.
    per_tool_cap: usize,
    /// Remaining request-wide budget; None = unlimited.
    global_remaining: Option<usize>,
    tail_chars: usize,
    log_truncations: bool,
}

impl OutputBudget {
    pub fn new(per_tool_cap: usize, total_cap: usize, tail_chars: usize, log: bool) -> Self {
        Self {
            per_tool_cap,
            global_remaining: if total_cap == 0 { None } else { Some(total_cap) },
            tail_chars,
            log_truncations: log,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, 0, 0, false)
    }

    fn max_allowed(&self) -> Option<usize> {
        match (self.per_tool_cap, self.global_remaining) {
            (0, None) => None,
            (0, Some(g)) => Some(g),
            (cap, None) => Some(cap),
            (cap, Some(g)) => Some(cap.min(g)),
        }
    }

    fn consume(&mut self, chars: usize) {
        if let Some(g) = self.global_remaining.as_mut() {
            *g = g.saturating_sub(chars);
        }
    }
}

/// Project a tool result value down to plain text.
///
/// Recognised wrapper shapes: `{content:[{text}…]}`, `{text|output|message}`,
/// and arrays of `{text|content}`. Anything else is stringified.
pub fn normalize_tool_output(value: &Value, is_error: bool) -> String {
    let text = project_text(value);
    if is_error {
        format!("{}{}", ERROR_PREFIX, text)
    } else {
        text
    }
}

/// String variant: parses JSON-looking input first so wrapped payloads
/// collapse to their text projection.
pub fn normalize_tool_output_str(raw: &str, is_error: bool) -> String {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(parsed) = serde_json::from_str::<Value>(raw) {
            return normalize_tool_output(&parsed, is_error);
        }
    }
    if is_error {
        format!("{}{}", ERROR_PREFIX, raw)
    } else {
        raw.to_string()
    }
}

fn project_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            let texts: Vec<String> = items
                .iter()
                .filter_map(|item| {
                    item.get("text")
                        .or_else(|| item.get("content"))
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string())
                })
                .collect();
            if texts.is_empty() {
                value.to_string()
            } else {
                texts.join("\n")
            }
        }
        Value::Object(map) => {
            if let Some(Value::Array(blocks)) = map.get("content") {
                let texts: Vec<String> = blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(|v| v.as_str()).map(|s| s.to_string()))
                    .collect();
                if !texts.is_empty() {
                    return texts.join("\n");
                }
            }
            for key in ["text", "output", "message"] {
                if let Some(s) = map.get(key).and_then(|v| v.as_str()) {
                    return s.to_string();
                }
            }
            value.to_string()
        }
        _ => value.to_string(),
    }
}

/// Truncate `raw` under the budget. Idempotent at the same budget:
/// a second pass over already-truncated output is a no-op.
pub fn limit_tool_output(raw: String, budget: &mut OutputBudget, tool_name: &str) -> String {
    let Some(max_allowed) = budget.max_allowed() else {
        return raw;
    };

    if max_allowed == 0 {
        if budget.log_truncations {
            tracing::warn!(tool = tool_name, "tool output omitted: prompt budget exceeded");
        }
        return OMITTED_SENTINEL.to_string();
    }

    let total_chars = raw.chars().count();
    if total_chars <= max_allowed {
        budget.consume(total_chars);
        return raw;
    }

    let separator = format!(
        "\n[...output truncated: {} chars -> {} chars...]\n",
        total_chars, max_allowed
    );
    let sep_chars = separator.chars().count();

    // Degenerate budgets smaller than the separator: plain head cut.
    if max_allowed <= sep_chars {
        budget.consume(max_allowed);
        return raw.chars().take(max_allowed).collect();
    }

    let tail = budget.tail_chars.min(max_allowed - sep_chars);
    let head = max_allowed - sep_chars - tail;

    let head_str: String = raw.chars().take(head).collect();
    let tail_str: String = if tail > 0 {
        raw.chars().skip(total_chars - tail).collect()
    } else {
        String::new()
    };

    if budget.log_truncations {
        tracing::warn!(
            tool = tool_name,
            original_chars = total_chars,
            kept_chars = max_allowed,
            "tool output truncated"
        );
    }

    budget.consume(max_allowed);
    format!("{}{}{}", head_str, separator, tail_str)
}
