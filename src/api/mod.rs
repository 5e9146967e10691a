//! HTTP API mounted under `/v1`.

pub mod health;
pub mod llm;
pub mod stt;
pub mod tts;

use std::sync::Arc;

use axum::Router;

use crate::state::AppState;

/// Build the API router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(llm::router())
        .merge(stt::router())
        .merge(tts::router())
}
