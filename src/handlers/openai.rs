// OpenAI protocol handler.

use axum::{
    body::Body,
    extract::{Json, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::{json, Value};
use tracing::debug;

use crate::common::model_mapping::{is_claude_family, MODEL_CATALOG};
use crate::error::RelayError;
use crate::mappers::gemini::GeminiResponse;
use crate::mappers::openai::{
    transform_openai_request, transform_openai_response, OpenAIContent, OpenAIMessage,
    OpenAIRequest, OpenAiRequestContext, OpenAiStreamState,
};
use crate::server::AppState;

fn openai_error(err: RelayError) -> Response {
    (err.status_code(), Json(err.to_openai_body())).into_response()
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

pub async fn handle_chat_completions(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Response {
    let mut request: OpenAIRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            return openai_error(RelayError::Client {
                status: 400,
                message: format!("invalid request: {}", e),
            })
        }
    };

    // Some clients send empty message lists for warmup probes.
    if request.messages.is_empty() {
        request.messages.push(OpenAIMessage {
            role: "user".to_string(),
            content: Some(OpenAIContent::String(" ".to_string())),
            tool_calls: None,
            tool_call_id: None,
            name: None,
            reasoning_content: None,
        });
    }

    debug!("received OpenAI request for model {}", request.model);

    let dispatcher = &state.dispatcher;
    let ctx = OpenAiRequestContext {
        cache: &dispatcher.cache,
        cfg: &dispatcher.cfg,
    };
    let prepared = match transform_openai_request(&request, &ctx) {
        Ok(p) => p,
        Err(e) => return openai_error(e),
    };

    if request.stream {
        let converter = OpenAiStreamState::new(
            request.model.clone(),
            dispatcher.cfg.openai_thinking_output,
            is_claude_family(&prepared.upstream_model),
            request.user.clone(),
            dispatcher.cache.clone(),
        );
        return match dispatcher.execute_stream(prepared, converter) {
            Ok(stream) => sse_response(Body::from_stream(stream)),
            Err(e) => openai_error(e),
        };
    }

    let value = match dispatcher.execute(&prepared).await {
        Ok(v) => v,
        Err(e) => return openai_error(e),
    };
    let gemini: GeminiResponse = match serde_json::from_value(value) {
        Ok(g) => g,
        Err(e) => {
            return openai_error(RelayError::Upstream {
                status: None,
                message: format!("malformed upstream response: {}", e),
            })
        }
    };
    match transform_openai_response(&gemini, dispatcher.cfg.openai_thinking_output) {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => openai_error(e),
    }
}

/// Advertised model catalogue, OpenAI list shape.
pub async fn handle_list_models() -> impl IntoResponse {
    let data: Vec<Value> = MODEL_CATALOG
        .iter()
        .map(|m| {
            json!({
                "id": m.public_name,
                "object": "model",
                "created": 1706745600,
                "owned_by": match m.family {
                    crate::common::model_mapping::ModelFamily::Claude => "anthropic",
                    crate::common::model_mapping::ModelFamily::Gemini => "google",
                },
            })
        })
        .collect();
    Json(json!({"object": "list", "data": data}))
}
