//! Chat-completion endpoints, buffered and streaming.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::post;
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::backend::{self, ResponseMetadata};
use crate::error::{Error, Result};
use crate::state::AppState;

const MAX_PROMPT_CHARS: usize = 4096;

/// End-of-stream marker, OpenAI-style.
const SSE_DONE: &str = "[DONE]";

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub model_id: String,
    pub prompt: String,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub text: String,
    pub metadata: ResponseMetadata,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/llm", post(generate))
        .route("/llm/stream", post(generate_stream))
}

fn validate(req: &GenerateRequest) -> Result<()> {
    if req.model_id.is_empty() {
        return Err(Error::InvalidRequest("model_id is required".to_string()));
    }
    if req.prompt.is_empty() {
        return Err(Error::InvalidRequest("prompt is required".to_string()));
    }
    if req.prompt.chars().count() > MAX_PROMPT_CHARS {
        return Err(Error::InvalidRequest(format!(
            "prompt exceeds {MAX_PROMPT_CHARS} characters"
        )));
    }
    Ok(())
}

/// POST /v1/llm - buffered text generation.
async fn generate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>> {
    validate(&req)?;

    let cancel = CancellationToken::new();
    let resp = state
        .llm
        .generate(
            &cancel,
            backend::PROVIDER_LLAMA_CPP,
            &req.model_id,
            backend::Request {
                model_path: String::new(),
                input: req.prompt.into_bytes(),
                parameters: req.parameters,
            },
        )
        .await?;

    Ok(Json(GenerateResponse {
        text: String::from_utf8_lossy(&resp.output).into_owned(),
        metadata: resp.metadata,
    }))
}

/// POST /v1/llm/stream - SSE text generation.
///
/// Data chunks arrive as `message` events carrying `{"text": ...}`;
/// failures are reported inside the stream as `{"error": ...}` and a final
/// `{"done": "[DONE]"}` marks a completed stream.
async fn generate_stream(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerateRequest>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    validate(&req)?;

    let cancel = CancellationToken::new();
    // Dropping the SSE stream (client disconnect) cancels the producer.
    let guard = cancel.clone().drop_guard();

    let stream = async_stream::stream! {
        let _guard = guard;

        let breq = backend::Request {
            model_path: String::new(),
            input: req.prompt.into_bytes(),
            parameters: req.parameters,
        };

        let mut rx = match state
            .llm
            .generate_stream(&cancel, backend::PROVIDER_LLAMA_CPP, &req.model_id, breq)
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                yield Ok(event(json!({"error": e.to_string()})));
                return;
            }
        };

        while let Some(chunk) = rx.recv().await {
            if let Some(e) = chunk.error {
                yield Ok(event(json!({"error": e.to_string()})));
                return;
            }
            if chunk.done {
                break;
            }
            yield Ok(event(json!({
                "text": String::from_utf8_lossy(&chunk.data)
            })));
        }

        yield Ok(event(json!({"done": SSE_DONE})));
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn event(payload: serde_json::Value) -> Event {
    Event::default().event("message").data(payload.to_string())
}
