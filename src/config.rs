use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How reasoning text is surfaced on the OpenAI dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingOutput {
    /// `delta.reasoning_content` / `message.reasoning_content`
    ReasoningContent,
    /// `<think>…</think>` mixed into `content`
    Tags,
    /// Both channels at once (explicit opt-in, may duplicate reasoning)
    Both,
}

impl ThinkingOutput {
    fn parse(s: &str) -> Self {
        match s {
            "tags" => ThinkingOutput::Tags,
            "both" => ThinkingOutput::Both,
            _ => ThinkingOutput::ReasoningContent,
        }
    }

    pub fn wants_reasoning_field(self) -> bool {
        matches!(self, ThinkingOutput::ReasoningContent | ThinkingOutput::Both)
    }

    pub fn wants_tags(self) -> bool {
        matches!(self, ThinkingOutput::Tags | ThinkingOutput::Both)
    }
}

/// Relay configuration, assembled from the environment at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Listening host; `allow_lan_access` style toggle is expressed by
    /// setting this to 0.0.0.0 (default is localhost, privacy first).
    pub host: String,
    pub port: u16,
    /// Static bearer key guarding the public surface.
    pub api_key: String,
    /// Data directory: SQLite store + rolling logs.
    pub data_dir: PathBuf,

    /// Antigravity v1internal base URL.
    pub upstream_base: String,
    /// Optional egress proxy (http://, https://, socks5://).
    pub upstream_proxy: Option<String>,
    pub request_timeout_secs: u64,

    pub oauth_client_id: String,
    pub oauth_client_secret: String,
    pub oauth_token_url: String,

    // Retry policy
    pub retries: usize,
    pub same_account_retries: usize,
    pub same_account_retry_delay_ms: u64,
    pub account_switch_delay_ms: u64,

    // Output shaping
    pub max_output_tokens_with_tools: u32,
    pub openai_thinking_output: ThinkingOutput,
    pub claude_openai_replay_thought_text: bool,

    // Tool-output limiter
    pub tool_result_max_chars: usize,
    pub tool_result_total_max_chars: usize,
    pub tool_result_tail_chars: usize,
    pub tool_result_truncate_log: bool,

    // Signature cache TTLs / caps
    pub tool_thought_signature_ttl_ms: i64,
    pub tool_thought_signature_max: usize,
    pub claude_thinking_signature_ttl_ms: i64,
    pub claude_thinking_signature_max: usize,
    pub claude_last_signature_ttl_ms: i64,
    pub claude_last_signature_max: usize,
    pub claude_assistant_signature_ttl_ms: i64,
    pub claude_assistant_signature_max: usize,

    /// Per-model concurrency cap; 0 disables the gate.
    pub max_concurrent_per_model: usize,
    /// Kill switch for the limiter + gate (diagnostics).
    pub disable_local_limits: bool,
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// A misconfigured base URL would fail on every request; fall back to the
/// known-good default instead.
fn valid_base_url(candidate: String, fallback: &str) -> String {
    match url::Url::parse(&candidate) {
        Ok(_) => candidate,
        Err(e) => {
            eprintln!(
                "invalid RELAY_UPSTREAM_BASE {:?} ({}), using {}",
                candidate, e, fallback
            );
            fallback.to_string()
        }
    }
}

const MINUTE_MS: i64 = 60 * 1000;
const HOUR_MS: i64 = 60 * MINUTE_MS;

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8045,
            api_key: format!("sk-{}", uuid::Uuid::new_v4().simple()),
            data_dir: default_data_dir(),
            upstream_base: "https://cloudcode-pa.googleapis.com/v1internal".to_string(),
            upstream_proxy: None,
            request_timeout_secs: 600,
            oauth_client_id: String::new(),
            oauth_client_secret: String::new(),
            oauth_token_url: "https://oauth2.googleapis.com/token".to_string(),
            retries: 3,
            same_account_retries: 1,
            same_account_retry_delay_ms: 500,
            account_switch_delay_ms: 200,
            max_output_tokens_with_tools: 0,
            openai_thinking_output: ThinkingOutput::ReasoningContent,
            claude_openai_replay_thought_text: false,
            tool_result_max_chars: 0,
            tool_result_total_max_chars: 0,
            tool_result_tail_chars: 1000,
            tool_result_truncate_log: false,
            tool_thought_signature_ttl_ms: 10 * MINUTE_MS,
            tool_thought_signature_max: 2000,
            claude_thinking_signature_ttl_ms: 24 * HOUR_MS,
            claude_thinking_signature_max: 5000,
            claude_last_signature_ttl_ms: 24 * HOUR_MS,
            claude_last_signature_max: 1000,
            claude_assistant_signature_ttl_ms: 24 * HOUR_MS,
            claude_assistant_signature_max: 5000,
            max_concurrent_per_model: 0,
            disable_local_limits: false,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("antigravity-relay")
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env_str("RELAY_HOST", &defaults.host),
            port: env_parse("RELAY_PORT", defaults.port),
            api_key: env_str("RELAY_API_KEY", &defaults.api_key),
            data_dir: std::env::var("RELAY_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            upstream_base: valid_base_url(
                env_str("RELAY_UPSTREAM_BASE", &defaults.upstream_base),
                &defaults.upstream_base,
            ),
            upstream_proxy: std::env::var("RELAY_UPSTREAM_PROXY").ok().filter(|s| !s.is_empty()),
            request_timeout_secs: env_parse("RELAY_REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs),
            oauth_client_id: env_str("RELAY_OAUTH_CLIENT_ID", ""),
            oauth_client_secret: env_str("RELAY_OAUTH_CLIENT_SECRET", ""),
            oauth_token_url: env_str("RELAY_OAUTH_TOKEN_URL", &defaults.oauth_token_url),
            retries: env_parse("RELAY_RETRIES", defaults.retries),
            same_account_retries: env_parse("RELAY_SAME_ACCOUNT_RETRIES", defaults.same_account_retries),
            same_account_retry_delay_ms: env_parse(
                "RELAY_SAME_ACCOUNT_RETRY_DELAY_MS",
                defaults.same_account_retry_delay_ms,
            ),
            account_switch_delay_ms: env_parse(
                "RELAY_ACCOUNT_SWITCH_DELAY_MS",
                defaults.account_switch_delay_ms,
            ),
            max_output_tokens_with_tools: env_parse(
                "MAX_OUTPUT_TOKENS_WITH_TOOLS",
                defaults.max_output_tokens_with_tools,
            ),
            openai_thinking_output: ThinkingOutput::parse(&env_str(
                "OPENAI_THINKING_OUTPUT",
                "reasoning_content",
            )),
            claude_openai_replay_thought_text: env_flag(
                "CLAUDE_OPENAI_REPLAY_THOUGHT_TEXT",
                defaults.claude_openai_replay_thought_text,
            ),
            tool_result_max_chars: env_parse("TOOL_RESULT_MAX_CHARS", defaults.tool_result_max_chars),
            tool_result_total_max_chars: env_parse(
                "TOOL_RESULT_TOTAL_MAX_CHARS",
                defaults.tool_result_total_max_chars,
            ),
            tool_result_tail_chars: env_parse("TOOL_RESULT_TAIL_CHARS", defaults.tool_result_tail_chars),
            tool_result_truncate_log: env_flag(
                "TOOL_RESULT_TRUNCATE_LOG",
                defaults.tool_result_truncate_log,
            ),
            tool_thought_signature_ttl_ms: env_parse(
                "TOOL_THOUGHT_SIGNATURE_TTL_MS",
                defaults.tool_thought_signature_ttl_ms,
            ),
            tool_thought_signature_max: env_parse(
                "TOOL_THOUGHT_SIGNATURE_MAX",
                defaults.tool_thought_signature_max,
            ),
            claude_thinking_signature_ttl_ms: env_parse(
                "CLAUDE_THINKING_SIGNATURE_TTL_MS",
                defaults.claude_thinking_signature_ttl_ms,
            ),
            claude_thinking_signature_max: env_parse(
                "CLAUDE_THINKING_SIGNATURE_MAX",
                defaults.claude_thinking_signature_max,
            ),
            claude_last_signature_ttl_ms: env_parse(
                "CLAUDE_LAST_SIGNATURE_TTL_MS",
                defaults.claude_last_signature_ttl_ms,
            ),
            claude_last_signature_max: env_parse(
                "CLAUDE_LAST_SIGNATURE_MAX",
                defaults.claude_last_signature_max,
            ),
            claude_assistant_signature_ttl_ms: env_parse(
                "CLAUDE_ASSISTANT_SIGNATURE_TTL_MS",
                defaults.claude_assistant_signature_ttl_ms,
            ),
            claude_assistant_signature_max: env_parse(
                "CLAUDE_ASSISTANT_SIGNATURE_MAX",
                defaults.claude_assistant_signature_max,
            ),
            max_concurrent_per_model: env_parse(
                "MAX_CONCURRENT_PER_MODEL",
                defaults.max_concurrent_per_model,
            ),
            disable_local_limits: env_flag("DISABLE_LOCAL_LIMITS", defaults.disable_local_limits),
        }
    }

    /// Per-tool cap with the kill switch applied. 0 means unlimited.
    pub fn effective_tool_result_max_chars(&self) -> usize {
        if self.disable_local_limits {
            0
        } else {
            self.tool_result_max_chars
        }
    }

    pub fn effective_tool_result_total_max_chars(&self) -> usize {
        if self.disable_local_limits {
            0
        } else {
            self.tool_result_total_max_chars
        }
    }

    pub fn effective_max_concurrent_per_model(&self) -> usize {
        if self.disable_local_limits {
            0
        } else {
            self.max_concurrent_per_model
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thinking_output_parse() {
        assert_eq!(ThinkingOutput::parse("tags"), ThinkingOutput::Tags);
        assert_eq!(ThinkingOutput::parse("both"), ThinkingOutput::Both);
        assert_eq!(
            ThinkingOutput::parse("reasoning_content"),
            ThinkingOutput::ReasoningContent
        );
        assert_eq!(
            ThinkingOutput::parse("garbage"),
            ThinkingOutput::ReasoningContent
        );
        assert!(ThinkingOutput::Both.wants_tags());
        assert!(ThinkingOutput::Both.wants_reasoning_field());
        assert!(!ThinkingOutput::Tags.wants_reasoning_field());
    }

    #[test]
    fn disable_local_limits_zeroes_caps() {
        let mut cfg = RelayConfig::default();
        cfg.tool_result_max_chars = 100;
        cfg.max_concurrent_per_model = 4;
        cfg.disable_local_limits = true;
        assert_eq!(cfg.effective_tool_result_max_chars(), 0);
        assert_eq!(cfg.effective_max_concurrent_per_model(), 0);
    }
}
