//! Speech-synthesis endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::backend;
use crate::error::{Error, Result};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SynthesizeRequest {
    pub model_id: String,
    pub text: String,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/tts", post(synthesize))
}

/// POST /v1/tts - synthesize speech, returning raw audio bytes.
async fn synthesize(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SynthesizeRequest>,
) -> Result<impl IntoResponse> {
    if req.model_id.is_empty() {
        return Err(Error::InvalidRequest("model_id is required".to_string()));
    }
    if req.text.is_empty() {
        return Err(Error::InvalidRequest("text is required".to_string()));
    }

    let cancel = CancellationToken::new();
    let resp = state
        .tts
        .synthesize(
            &cancel,
            backend::PROVIDER_PIPER,
            &req.model_id,
            backend::Request {
                model_path: String::new(),
                input: req.text.into_bytes(),
                parameters: req.parameters,
            },
        )
        .await?;

    Ok(([(header::CONTENT_TYPE, "audio/wav")], resp.output))
}
