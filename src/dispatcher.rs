// Request dispatcher: wraps prepared requests into per-account envelopes,
// drives them through the retry engine, and re-frames streaming responses
// for the client dialect. Client disconnects propagate into the upstream
// fetch and stop further retries.

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::mappers::claude::ClaudeStreamState;
use crate::mappers::gemini::{unwrap_response, unwrap_response_ref, wrap_envelope};
use crate::mappers::openai::OpenAiStreamState;
use crate::mappers::PreparedRequest;
use crate::pool::{AccountPool, ModelSlotGuard};
use crate::signature_cache::SignatureCache;
use crate::token_service::TokenService;
use crate::upstream::retry::classify_upstream_error;
use crate::upstream::{AbortSignal, RetryEngine, RetryOutcome, UpstreamClient};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;

/// Per-dialect streaming converter driven by the dispatcher.
pub trait SseConverter: Send + 'static {
    fn process_chunk(&mut self, raw: &Value) -> Vec<Bytes>;
    fn finalize(&mut self) -> Vec<Bytes>;
    /// Terminal frames for requests that failed before any byte went out.
    fn error_frames(&mut self, error: &RelayError) -> Vec<Bytes>;
}

impl SseConverter for ClaudeStreamState {
    fn process_chunk(&mut self, raw: &Value) -> Vec<Bytes> {
        ClaudeStreamState::process_chunk(self, raw)
    }

    fn finalize(&mut self) -> Vec<Bytes> {
        ClaudeStreamState::finalize(self)
    }

    fn error_frames(&mut self, error: &RelayError) -> Vec<Bytes> {
        vec![Bytes::from(format!(
            "event: error\ndata: {}\n\n",
            error.to_anthropic_body()
        ))]
    }
}

impl SseConverter for OpenAiStreamState {
    fn process_chunk(&mut self, raw: &Value) -> Vec<Bytes> {
        OpenAiStreamState::process_chunk(self, raw)
    }

    fn finalize(&mut self) -> Vec<Bytes> {
        OpenAiStreamState::finalize(self)
    }

    fn error_frames(&mut self, error: &RelayError) -> Vec<Bytes> {
        vec![
            Bytes::from(format!("data: {}\n\n", error.to_openai_body())),
            Bytes::from("data: [DONE]\n\n"),
        ]
    }
}

/// Pass-through converter for the native Gemini surface: unwrap the
/// envelope, forward frames verbatim.
pub struct PassthroughConverter;

impl SseConverter for PassthroughConverter {
    fn process_chunk(&mut self, raw: &Value) -> Vec<Bytes> {
        vec![Bytes::from(format!(
            "data: {}\n\n",
            serde_json::to_string(raw).unwrap_or_default()
        ))]
    }

    fn finalize(&mut self) -> Vec<Bytes> {
        Vec::new()
    }

    fn error_frames(&mut self, error: &RelayError) -> Vec<Bytes> {
        vec![Bytes::from(format!(
            "data: {}\n\n",
            serde_json::json!({"error": {"message": error.to_string()}})
        ))]
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    pub pool: Arc<AccountPool>,
    pub tokens: Arc<TokenService>,
    pub upstream: Arc<UpstreamClient>,
    pub engine: Arc<RetryEngine>,
    pub cache: Arc<SignatureCache>,
    pub cfg: Arc<RelayConfig>,
}

impl Dispatcher {
    fn acquire_slot(&self, model: &str) -> RelayResult<ModelSlotGuard> {
        self.pool
            .gate_handle()
            .acquire_model_slot(model)
            .ok_or_else(|| RelayError::Capacity {
                message: format!("No capacity available for model {} (local limit)", model),
                reset_after_ms: None,
            })
    }

    /// Non-streaming path. Returns the unwrapped upstream response payload.
    pub async fn execute(&self, prepared: &PreparedRequest) -> RelayResult<Value> {
        let _slot = self.acquire_slot(&prepared.upstream_model)?;

        let upstream = self.upstream.clone();
        let inner = prepared.inner.clone();
        let model = prepared.upstream_model.clone();

        let outcome = self
            .engine
            .execute(&prepared.upstream_model, None, move |ctx| {
                let upstream = upstream.clone();
                let inner = inner.clone();
                let model = model.clone();
                async move {
                    let body = wrap_envelope(inner, &ctx.project_id, &model);
                    let response = upstream
                        .call_v1_internal("generateContent", &ctx.access_token, body, None)
                        .await?;
                    let status = response.status();
                    if !status.is_success() {
                        let text = response.text().await.unwrap_or_default();
                        return Err(classify_upstream_error(status.as_u16(), &text));
                    }
                    let value: Value = response.json().await?;
                    Ok(unwrap_response(&value))
                }
            })
            .await?;

        match outcome {
            RetryOutcome::Completed(value) => Ok(value),
            RetryOutcome::Aborted => Err(RelayError::Aborted),
        }
    }

    /// Pass-through path: capacity errors rotate accounts, anything else
    /// surfaces to the caller verbatim.
    pub async fn execute_passthrough(&self, prepared: &PreparedRequest) -> RelayResult<Value> {
        let _slot = self.acquire_slot(&prepared.upstream_model)?;

        let upstream = self.upstream.clone();
        let inner = prepared.inner.clone();
        let model = prepared.upstream_model.clone();

        self.engine
            .execute_capacity(&prepared.upstream_model, move |ctx| {
                let upstream = upstream.clone();
                let inner = inner.clone();
                let model = model.clone();
                async move {
                    let body = wrap_envelope(inner, &ctx.project_id, &model);
                    let response = upstream
                        .call_v1_internal("generateContent", &ctx.access_token, body, None)
                        .await?;
                    let status = response.status();
                    if !status.is_success() {
                        let text = response.text().await.unwrap_or_default();
                        return Err(classify_upstream_error(status.as_u16(), &text));
                    }
                    let value: Value = response.json().await?;
                    Ok(unwrap_response(&value))
                }
            })
            .await
    }

    /// Streaming path. The returned stream feeds the client body; dropping
    /// it aborts the upstream fetch and stops further retries.
    pub fn execute_stream<C>(
        &self,
        prepared: PreparedRequest,
        converter: C,
    ) -> RelayResult<impl futures::Stream<Item = Result<Bytes, std::io::Error>>>
    where
        C: SseConverter,
    {
        let slot = self.acquire_slot(&prepared.upstream_model)?;

        let (tx, rx) = mpsc::channel::<Bytes>(64);

        // Client gone -> receiver dropped -> abort probe fires before the
        // next attempt. The probe's sender clone dies with the engine call,
        // so it never keeps the channel open.
        let abort = {
            let tx = tx.clone();
            AbortSignal::new(move || tx.is_closed())
        };

        let dispatcher = self.clone();
        tokio::spawn(async move {
            let _slot = slot;
            let state = Arc::new(StdMutex::new(converter));
            let wrote = Arc::new(AtomicBool::new(false));

            let upstream = dispatcher.upstream.clone();
            let inner = prepared.inner.clone();
            let model = prepared.upstream_model.clone();
            let op_state = state.clone();
            let op_wrote = wrote.clone();
            let op_tx = tx.clone();

            let result = dispatcher
                .engine
                .execute(&prepared.upstream_model, Some(abort), move |ctx| {
                    let upstream = upstream.clone();
                    let inner = inner.clone();
                    let model = model.clone();
                    let state = op_state.clone();
                    let wrote = op_wrote.clone();
                    let tx = op_tx.clone();
                    async move {
                        let body = wrap_envelope(inner, &ctx.project_id, &model);
                        let response = upstream
                            .call_v1_internal(
                                "streamGenerateContent",
                                &ctx.access_token,
                                body,
                                Some("alt=sse"),
                            )
                            .await?;
                        let status = response.status();
                        if !status.is_success() {
                            let text = response.text().await.unwrap_or_default();
                            return Err(classify_upstream_error(status.as_u16(), &text));
                        }

                        let mut byte_stream = response.bytes_stream();
                        let mut buffer = BytesMut::new();
                        while let Some(chunk) = byte_stream.next().await {
                            let bytes = match chunk {
                                Ok(bytes) => bytes,
                                Err(e) => {
                                    if wrote.load(Ordering::Acquire) {
                                        // Bytes already went out: terminate
                                        // the dialect stream instead of
                                        // retrying into a corrupt state.
                                        tracing::warn!("upstream stream broke mid-flight: {}", e);
                                        let frames =
                                            state.lock().expect("stream state poisoned").finalize();
                                        for frame in frames {
                                            let _ = tx.send(frame).await;
                                        }
                                        return Ok(());
                                    }
                                    return Err(RelayError::Network(e));
                                }
                            };

                            buffer.extend_from_slice(&bytes);
                            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                                let line_raw = buffer.split_to(pos + 1);
                                let Ok(line) = std::str::from_utf8(&line_raw) else {
                                    continue;
                                };
                                let line = line.trim();
                                let Some(data) = line.strip_prefix("data: ") else {
                                    continue;
                                };
                                let data = data.trim();
                                if data.is_empty() || data == "[DONE]" {
                                    continue;
                                }
                                let Ok(json) = serde_json::from_str::<Value>(data) else {
                                    continue;
                                };
                                let frames = {
                                    let mut state =
                                        state.lock().expect("stream state poisoned");
                                    state.process_chunk(unwrap_response_ref(&json))
                                };
                                for frame in frames {
                                    wrote.store(true, Ordering::Release);
                                    if tx.send(frame).await.is_err() {
                                        return Err(RelayError::Aborted);
                                    }
                                }
                            }
                        }

                        let frames = state.lock().expect("stream state poisoned").finalize();
                        for frame in frames {
                            if tx.send(frame).await.is_err() {
                                return Err(RelayError::Aborted);
                            }
                        }
                        Ok(())
                    }
                })
                .await;

            match result {
                Ok(RetryOutcome::Completed(())) => {}
                Ok(RetryOutcome::Aborted) => {
                    tracing::debug!("stream aborted by client disconnect");
                }
                Err(e) => {
                    tracing::error!("stream request failed: {}", e);
                    let frames = state
                        .lock()
                        .expect("stream state poisoned")
                        .error_frames(&e);
                    for frame in frames {
                        let _ = tx.send(frame).await;
                    }
                }
            }
        });

        let out = async_stream::stream! {
            let mut rx = rx;
            while let Some(frame) = rx.recv().await {
                yield Ok::<Bytes, std::io::Error>(frame);
            }
        };
        Ok(out)
    }
}
