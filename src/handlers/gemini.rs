// Gemini protocol handler (native pass-through).

use axum::{
    body::Body,
    extract::{Json, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::{json, Value};

use crate::common::model_mapping::{map_to_upstream, MODEL_CATALOG};
use crate::dispatcher::PassthroughConverter;
use crate::error::RelayError;
use crate::mappers::PreparedRequest;
use crate::server::AppState;

fn gemini_error(err: RelayError) -> Response {
    (
        err.status_code(),
        Json(json!({"error": {"message": err.to_string()}})),
    )
        .into_response()
}

/// Handle `models/{model}:generateContent` and `:streamGenerateContent`.
pub async fn handle_generate(
    State(state): State<AppState>,
    Path(model_action): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let (model_name, method) = match model_action.rsplit_once(':') {
        Some((m, action)) => (m.to_string(), action.to_string()),
        None => (model_action, "generateContent".to_string()),
    };

    if method != "generateContent" && method != "streamGenerateContent" {
        return gemini_error(RelayError::Client {
            status: 400,
            message: format!("unsupported method: {}", method),
        });
    }
    let is_stream = method == "streamGenerateContent";

    tracing::debug!("received Gemini request: {}/{}", model_name, method);

    let prepared = PreparedRequest {
        inner: body,
        upstream_model: map_to_upstream(&model_name),
        thinking_enabled: false,
    };

    let dispatcher = &state.dispatcher;
    if is_stream {
        return match dispatcher.execute_stream(prepared, PassthroughConverter) {
            Ok(stream) => Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .header(header::CONNECTION, "keep-alive")
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
            Err(e) => gemini_error(e),
        };
    }

    match dispatcher.execute_passthrough(&prepared).await {
        Ok(value) => Json(value).into_response(),
        Err(e) => gemini_error(e),
    }
}

/// Native model list for Gemini SDK clients.
pub async fn handle_list_models() -> impl IntoResponse {
    let models: Vec<Value> = MODEL_CATALOG
        .iter()
        .map(|m| {
            json!({
                "name": format!("models/{}", m.public_name),
                "version": "001",
                "displayName": m.display_name,
                "supportedGenerationMethods": ["generateContent", "streamGenerateContent"],
            })
        })
        .collect();
    Json(json!({ "models": models }))
}

pub async fn handle_get_model(Path(model_name): Path<String>) -> impl IntoResponse {
    Json(json!({
        "name": format!("models/{}", model_name),
        "displayName": model_name,
    }))
}
