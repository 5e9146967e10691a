//! Transcription endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Multipart, State};
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::backend::{self, ResponseMetadata};
use crate::error::{Error, Result};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct TranscribeResponse {
    pub text: String,
    pub metadata: ResponseMetadata,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/stt", post(transcribe))
}

/// POST /v1/stt - transcribe an uploaded audio file.
///
/// Multipart fields: `file` (audio bytes), `model_id`, and an optional
/// `parameters` field holding a JSON object.
async fn transcribe(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<TranscribeResponse>> {
    let mut audio: Option<Vec<u8>> = None;
    let mut model_id: Option<String> = None;
    let mut parameters: HashMap<String, serde_json::Value> = HashMap::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::InvalidRequest(format!("invalid multipart payload: {e}")))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| Error::InvalidRequest(format!("failed to read audio file: {e}")))?;
                audio = Some(bytes.to_vec());
            }
            Some("model_id") => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| Error::InvalidRequest(format!("failed to read model_id: {e}")))?;
                model_id = Some(value);
            }
            Some("parameters") => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| Error::InvalidRequest(format!("failed to read parameters: {e}")))?;
                if !raw.is_empty() {
                    parameters = serde_json::from_str(&raw)
                        .map_err(|e| Error::InvalidRequest(format!("invalid parameters JSON: {e}")))?;
                }
            }
            _ => {}
        }
    }

    let audio = audio
        .filter(|bytes| !bytes.is_empty())
        .ok_or_else(|| Error::InvalidRequest("audio file is required".to_string()))?;
    let model_id = model_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::InvalidRequest("model_id is required".to_string()))?;

    let cancel = CancellationToken::new();
    let resp = state
        .stt
        .transcribe(
            &cancel,
            backend::PROVIDER_WHISPER_CPP,
            &model_id,
            backend::Request {
                model_path: String::new(),
                input: audio,
                parameters,
            },
        )
        .await?;

    Ok(Json(TranscribeResponse {
        text: String::from_utf8_lossy(&resp.output).into_owned(),
        metadata: resp.metadata,
    }))
}
