// Claude protocol handler.

use axum::{
    body::Body,
    extract::{Json, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::RelayError;
use crate::mappers::claude::{
    preprocess_request, transform_claude_request_in, transform_response, ClaudeRequest,
    ClaudeStreamState, ResponseContext,
};
use crate::mappers::gemini::GeminiResponse;
use crate::server::AppState;

fn claude_error(err: RelayError) -> Response {
    (err.status_code(), Json(err.to_anthropic_body())).into_response()
}

fn sse_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

pub async fn handle_messages(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Response {
    let mut request: ClaudeRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            return claude_error(RelayError::Client {
                status: 400,
                message: format!("invalid request: {}", e),
            })
        }
    };

    debug!("received Claude request for model {}", request.model);

    let dispatcher = &state.dispatcher;

    // Replay hygiene first: repairs or downgrades tool-use history whose
    // thinking signatures went missing.
    let report = preprocess_request(&mut request, &dispatcher.cache);
    if report.downgraded {
        debug!(
            "request downgraded, {} tool_use ids without signatures",
            report.missing_tool_use_ids.len()
        );
    }

    let user_id = request.user_id().map(|s| s.to_string());
    let prepared = match transform_claude_request_in(&request, &dispatcher.cfg) {
        Ok(p) => p,
        Err(e) => return claude_error(e),
    };

    if request.stream {
        let converter = ClaudeStreamState::new(
            prepared.thinking_enabled,
            user_id,
            dispatcher.cache.clone(),
        );
        return match dispatcher.execute_stream(prepared, converter) {
            Ok(stream) => sse_response(Body::from_stream(stream)),
            Err(e) => claude_error(e),
        };
    }

    let value = match dispatcher.execute(&prepared).await {
        Ok(v) => v,
        Err(e) => return claude_error(e),
    };
    let gemini: GeminiResponse = match serde_json::from_value(value) {
        Ok(g) => g,
        Err(e) => {
            return claude_error(RelayError::Upstream {
                status: None,
                message: format!("malformed upstream response: {}", e),
            })
        }
    };
    let ctx = ResponseContext {
        cache: &dispatcher.cache,
        thinking_enabled: prepared.thinking_enabled,
        user_id: user_id.as_deref(),
    };
    match transform_response(&gemini, &ctx) {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => claude_error(e),
    }
}

/// Cheap local token estimate; good enough for client-side budgeting.
pub async fn handle_count_tokens(Json(body): Json<Value>) -> impl IntoResponse {
    let chars = body
        .get("messages")
        .map(|m| m.to_string().chars().count())
        .unwrap_or(0)
        + body
            .get("system")
            .map(|s| s.to_string().chars().count())
            .unwrap_or(0);
    Json(json!({ "input_tokens": (chars / 4) as u64 }))
}
