// Built-in Anthropic tool types and their synthetic schemas.
//
// Matching is by prefix, mirroring the upstream client's behavior.

use super::models::Tool;
use serde_json::{json, Value};

/// Resolve a tool declaration to (name, description, input schema).
/// Built-in types get a deterministic synthetic schema; plain function
/// tools use their own `input_schema` (empty object when absent).
pub fn resolve_tool_declaration(tool: &Tool) -> (String, String, Value) {
    let tool_type = tool.tool_type.as_deref().unwrap_or("");

    if let Some((default_name, schema)) = builtin_schema(tool_type) {
        let name = tool
            .name
            .clone()
            .unwrap_or_else(|| default_name.to_string());
        let description = tool
            .description
            .clone()
            .unwrap_or_else(|| format!("Built-in {} tool", default_name));
        return (name, description, schema);
    }

    let name = tool
        .name
        .clone()
        .unwrap_or_else(|| "unnamed_tool".to_string());
    let description = tool.description.clone().unwrap_or_default();
    let schema = tool
        .input_schema
        .clone()
        .unwrap_or_else(|| json!({"type": "object", "properties": {}}));
    (name, description, schema)
}

fn builtin_schema(tool_type: &str) -> Option<(&'static str, Value)> {
    if tool_type.starts_with("bash") {
        return Some((
            "bash",
            json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string" },
                    "timeout_ms": { "type": "integer" }
                },
                "required": ["command"]
            }),
        ));
    }
    if tool_type.starts_with("text_editor") {
        return Some((
            "str_replace_editor",
            json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string" },
                    "path": { "type": "string" },
                    "file_text": { "type": "string" },
                    "old_str": { "type": "string" },
                    "new_str": { "type": "string" },
                    "insert_line": { "type": "integer" },
                    "text": { "type": "string" },
                    "view_range": { "type": "array", "items": { "type": "integer" } }
                },
                "required": ["command"]
            }),
        ));
    }
    if tool_type.starts_with("web_search") {
        return Some((
            "web_search",
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "max_results": { "type": "integer" },
                    "locale": { "type": "string" },
                    "time_range": { "type": "string" }
                },
                "required": ["query"]
            }),
        ));
    }
    if tool_type.starts_with("computer") {
        return Some((
            "computer",
            json!({
                "type": "object",
                "properties": {
                    "action": { "type": "string" },
                    "x": { "type": "integer" },
                    "y": { "type": "integer" },
                    "coordinates": { "type": "array", "items": { "type": "integer" } },
                    "text": { "type": "string" },
                    "key": { "type": "string" },
                    "button": { "type": "string" },
                    "clicks": { "type": "integer" },
                    "scroll_amount": { "type": "integer" },
                    "direction": { "type": "string" }
                },
                "required": ["action"]
            }),
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(tool_type: Option<&str>, name: Option<&str>, schema: Option<Value>) -> Tool {
        Tool {
            tool_type: tool_type.map(String::from),
            name: name.map(String::from),
            description: None,
            input_schema: schema,
        }
    }

    #[test]
    fn bash_prefix_gets_synthetic_schema() {
        let (name, _, schema) = resolve_tool_declaration(&tool(Some("bash_20250124"), None, None));
        assert_eq!(name, "bash");
        assert_eq!(schema["required"], json!(["command"]));
        assert_eq!(schema["properties"]["timeout_ms"]["type"], "integer");
    }

    #[test]
    fn prefix_match_covers_undated_types() {
        // Prefix matching is intentional: "bashful" would match too.
        let (name, _, _) = resolve_tool_declaration(&tool(Some("bash"), None, None));
        assert_eq!(name, "bash");

        let (name, _, schema) =
            resolve_tool_declaration(&tool(Some("computer_use_20250124"), None, None));
        assert_eq!(name, "computer");
        assert_eq!(schema["required"], json!(["action"]));
    }

    #[test]
    fn client_name_overrides_builtin_default() {
        let (name, _, schema) =
            resolve_tool_declaration(&tool(Some("web_search_20250305"), Some("search"), None));
        assert_eq!(name, "search");
        assert_eq!(schema["required"], json!(["query"]));
    }

    #[test]
    fn function_tools_keep_their_schema() {
        let (name, _, schema) = resolve_tool_declaration(&tool(
            None,
            Some("calc"),
            Some(json!({"type": "object", "properties": {"x": {"type": "integer"}}})),
        ));
        assert_eq!(name, "calc");
        assert_eq!(schema["properties"]["x"]["type"], "integer");
    }

    #[test]
    fn text_editor_schema_fields() {
        let (_, _, schema) =
            resolve_tool_declaration(&tool(Some("text_editor_20250429"), None, None));
        for field in [
            "command",
            "path",
            "file_text",
            "old_str",
            "new_str",
            "insert_line",
            "text",
            "view_range",
        ] {
            assert!(schema["properties"].get(field).is_some(), "missing {}", field);
        }
    }
}
