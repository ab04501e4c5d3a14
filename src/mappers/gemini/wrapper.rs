// Upstream envelope wrapping / unwrapping.
//
// The v1internal surface nests the Gemini request inside
// `{project, requestId, request, model, userAgent, requestType}` and nests
// responses inside `{response: …}`.

use crate::common::utils::generate_session_id;
use serde_json::{json, Value};

pub const UPSTREAM_USER_AGENT: &str = "antigravity";
pub const UPSTREAM_REQUEST_TYPE: &str = "agent";

/// Wrap an inner generateContent request into the upstream envelope.
pub fn wrap_envelope(mut inner: Value, project: &str, model: &str) -> Value {
    if let Some(obj) = inner.as_object_mut() {
        obj.entry("sessionId".to_string())
            .or_insert_with(|| Value::String(generate_session_id()));
    }

    json!({
        "project": project,
        "requestId": format!("agent-{}", uuid::Uuid::new_v4()),
        "request": inner,
        "model": model,
        "userAgent": UPSTREAM_USER_AGENT,
        "requestType": UPSTREAM_REQUEST_TYPE,
    })
}

/// Strip the `{response: …}` wrapper; pass through already-bare payloads.
pub fn unwrap_response(value: &Value) -> Value {
    value.get("response").cloned().unwrap_or_else(|| value.clone())
}

/// Borrowing variant for hot paths.
pub fn unwrap_response_ref(value: &Value) -> &Value {
    value.get("response").unwrap_or(value)
}
