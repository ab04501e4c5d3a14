// Anthropic Messages wire shapes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl ClaudeRequest {
    /// Thinking is on when the client explicitly enables it or the model is
    /// in the thinking set; an explicit disable always wins.
    pub fn thinking_enabled(&self) -> bool {
        match self.thinking.as_ref().map(|t| t.type_.as_str()) {
            Some("enabled") => true,
            Some("disabled") => false,
            _ => crate::common::model_mapping::is_thinking_model(&self.model),
        }
    }

    pub fn thinking_budget(&self) -> u32 {
        self.thinking
            .as_ref()
            .and_then(|t| t.budget_tokens)
            .unwrap_or(crate::mappers::common_utils::DEFAULT_THINKING_BUDGET)
    }

    pub fn user_id(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.user_id.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingConfig {
    #[serde(rename = "type")]
    pub type_: String, // "enabled" | "disabled"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u32>,
}

impl ThinkingConfig {
    pub fn disabled() -> Self {
        Self {
            type_: "disabled".to_string(),
            budget_tokens: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    String(String),
    Array(Vec<SystemBlock>),
}

impl SystemPrompt {
    pub fn joined(&self) -> String {
        match self {
            SystemPrompt::String(s) => s.clone(),
            SystemPrompt::Array(blocks) => blocks
                .iter()
                .filter(|b| b.block_type == "text")
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Append a hint as a trailing line (used by the preprocess pass).
    pub fn append_hint(&mut self, hint: &str) {
        match self {
            SystemPrompt::String(s) => {
                if !s.is_empty() {
                    s.push('\n');
                }
                s.push_str(hint);
            }
            SystemPrompt::Array(blocks) => blocks.push(SystemBlock {
                block_type: "text".to_string(),
                text: hint.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    String(String),
    Array(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "thinking")]
    Thinking {
        thinking: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },

    #[serde(rename = "redacted_thinking")]
    RedactedThinking {
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },

    #[serde(rename = "image")]
    Image { source: ImageSource },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

impl ContentBlock {
    pub fn is_thinking_kind(&self) -> bool {
        matches!(
            self,
            ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. }
        )
    }

    pub fn thinking_signature(&self) -> Option<&str> {
        match self {
            ContentBlock::Thinking { signature, .. } => signature.as_deref(),
            ContentBlock::RedactedThinking { signature, .. } => signature.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub media_type: String,
    pub data: String,
}

/// Client tool declaration. Built-in Anthropic tool types (`bash_…`,
/// `text_editor_…`, `web_search_…`, `computer_…`) omit `input_schema`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub role: String,
    pub model: String,
    pub content: Vec<ContentBlock>,
    pub stop_reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn thinking_enabled_resolution() {
        let mut req: ClaudeRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-5",
            "messages": []
        }))
        .unwrap();
        assert!(!req.thinking_enabled());

        req.thinking = Some(ThinkingConfig {
            type_: "enabled".to_string(),
            budget_tokens: Some(1024),
        });
        assert!(req.thinking_enabled());
        assert_eq!(req.thinking_budget(), 1024);

        // Disable wins over the thinking set.
        let req: ClaudeRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-5-thinking",
            "messages": [],
            "thinking": {"type": "disabled"}
        }))
        .unwrap();
        assert!(!req.thinking_enabled());

        let req: ClaudeRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-5-thinking",
            "messages": []
        }))
        .unwrap();
        assert!(req.thinking_enabled());
    }

    #[test]
    fn content_block_tagging() {
        let block: ContentBlock = serde_json::from_value(json!({
            "type": "redacted_thinking",
            "signature": "sig-1"
        }))
        .unwrap();
        assert!(block.is_thinking_kind());
        assert_eq!(block.thinking_signature(), Some("sig-1"));

        let block: ContentBlock = serde_json::from_value(json!({
            "type": "tool_use",
            "id": "toolu_1",
            "name": "calc",
            "input": {"x": 1}
        }))
        .unwrap();
        assert!(!block.is_thinking_kind());
    }

    #[test]
    fn builtin_tool_without_schema_parses() {
        let tool: Tool = serde_json::from_value(json!({
            "type": "bash_20250124"
        }))
        .unwrap();
        assert_eq!(tool.tool_type.as_deref(), Some("bash_20250124"));
        assert!(tool.input_schema.is_none());
    }
}
