// Helpers shared by the OpenAI and Claude mappers.

use serde_json::{json, Value};

/// Synthetic required property forcing the model to emit tool calls when a
/// tool declares no required parameters. Stripped from arguments on the way
/// back out.
pub const PLACEHOLDER_REQUIRED_PROP: &str = "__ag_required";

/// Fixed preamble + wrapper tag for client system prompts on the OpenAI
/// surface. The upstream expects its own agent prompt first; the client's
/// text rides inside the probe tag.
pub const UPSTREAM_SYSTEM_PREAMBLE: &str =
    "You are an agentic assistant served through the Antigravity API. \
     Follow the instructions inside the user_system_prompt block as the \
     operative system prompt for this conversation.";
pub const SYSTEM_PROMPT_TAG: &str = "user_system_prompt";

pub const DEFAULT_THINKING_BUDGET: u32 = 4096;
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 64000;

/// Safety settings disabled across all harm categories; moderation stays on
/// the client side of the relay.
pub fn safety_settings_off() -> Value {
    json!([
        { "category": "HARM_CATEGORY_HARASSMENT", "threshold": "OFF" },
        { "category": "HARM_CATEGORY_HATE_SPEECH", "threshold": "OFF" },
        { "category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": "OFF" },
        { "category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "OFF" },
        { "category": "HARM_CATEGORY_CIVIC_INTEGRITY", "threshold": "OFF" },
    ])
}

pub fn wrap_system_prompt(client_system: &str) -> String {
    format!(
        "{}\n\n<{tag}>\n{}\n</{tag}>",
        UPSTREAM_SYSTEM_PREAMBLE,
        client_system,
        tag = SYSTEM_PROMPT_TAG
    )
}

/// Inject the placeholder property when the schema declares no non-empty
/// `required` list. Mutates the (already upstream-dialect) parameters.
pub fn inject_required_placeholder(parameters: &mut Value, uppercase_types: bool) {
    let Some(map) = parameters.as_object_mut() else {
        return;
    };
    let has_required = map
        .get("required")
        .and_then(|r| r.as_array())
        .map(|arr| !arr.is_empty())
        .unwrap_or(false);
    if has_required {
        return;
    }

    let bool_type = if uppercase_types { "BOOLEAN" } else { "boolean" };
    let props = map
        .entry("properties".to_string())
        .or_insert_with(|| json!({}));
    if let Some(props_map) = props.as_object_mut() {
        props_map.insert(
            PLACEHOLDER_REQUIRED_PROP.to_string(),
            json!({
                "type": bool_type,
                "description": "Set to true. Internal marker, not part of the tool interface."
            }),
        );
    }
    map.insert(
        "required".to_string(),
        json!([PLACEHOLDER_REQUIRED_PROP]),
    );
}

/// Remove the placeholder from model-produced arguments.
pub fn strip_placeholder_args(args: &mut Value) {
    if let Some(map) = args.as_object_mut() {
        map.remove(PLACEHOLDER_REQUIRED_PROP);
    }
}

/// Map an OpenAI `tool_choice` to the upstream function-calling mode.
pub fn tool_choice_to_mode(tool_choice: Option<&Value>) -> &'static str {
    match tool_choice.and_then(|v| v.as_str()) {
        Some("none") => "NONE",
        Some("auto") => "AUTO",
        _ => "VALIDATED",
    }
}

/// Output budget for Claude thinking: the output window must hold at least
/// twice the thinking budget.
pub fn promote_max_output_tokens(max_output_tokens: u32, thinking_budget: u32) -> u32 {
    max_output_tokens.max(thinking_budget.saturating_mul(2))
}
