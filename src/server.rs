// Axum server: router, shared state, accept loop, graceful shutdown.

use crate::config::RelayConfig;
use crate::dispatcher::Dispatcher;
use axum::{
    extract::DefaultBodyLimit,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub cfg: Arc<RelayConfig>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        // OpenAI protocol
        .route("/v1/models", get(crate::handlers::openai::handle_list_models))
        .route(
            "/v1/chat/completions",
            post(crate::handlers::openai::handle_chat_completions),
        )
        // Claude protocol
        .route("/v1/messages", post(crate::handlers::claude::handle_messages))
        .route(
            "/v1/messages/count_tokens",
            post(crate::handlers::claude::handle_count_tokens),
        )
        // Gemini protocol (native pass-through)
        .route("/v1beta/models", get(crate::handlers::gemini::handle_list_models))
        .route(
            "/v1beta/models/:model",
            get(crate::handlers::gemini::handle_get_model)
                .post(crate::handlers::gemini::handle_generate),
        )
        .route("/healthz", get(health_check_handler))
        .layer(DefaultBodyLimit::max(100 * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::middleware::auth_middleware,
        ))
        .layer(crate::middleware::cors_layer())
        .with_state(state)
}

pub struct RelayServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl RelayServer {
    /// Bind and serve. Returns the server handle plus the accept-loop task.
    pub async fn start(
        state: AppState,
    ) -> Result<(Self, tokio::task::JoinHandle<()>), String> {
        let addr = format!("{}:{}", state.cfg.host, state.cfg.port);
        let app = build_router(state);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| format!("failed to bind {}: {}", addr, e))?;

        tracing::info!("relay listening at http://{}", addr);

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let server = Self {
            shutdown_tx: Some(shutdown_tx),
        };

        let handle = tokio::spawn(async move {
            use hyper::server::conn::http1;
            use hyper_util::rt::TokioIo;
            use hyper_util::service::TowerToHyperService;

            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _)) => {
                                let io = TokioIo::new(stream);
                                let service = TowerToHyperService::new(app.clone());
                                tokio::task::spawn(async move {
                                    if let Err(err) = http1::Builder::new()
                                        .serve_connection(io, service)
                                        .with_upgrades()
                                        .await
                                    {
                                        debug!("connection finished: {:?}", err);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("failed to accept connection: {:?}", e);
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        tracing::info!("relay stopped listening");
                        break;
                    }
                }
            }
        });

        Ok((server, handle))
    }

    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn health_check_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}
