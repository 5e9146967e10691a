//! Shared application state.

use std::sync::Arc;

use crate::backend;
use crate::model;
use crate::service::{Llm, Stt, Tts};

/// Shared state passed to all handlers.
pub struct AppState {
    pub llm: Llm,
    pub stt: Stt,
    pub tts: Tts,
}

impl AppState {
    pub fn new(backends: Arc<backend::Registry>, models: Arc<model::Manager>) -> Self {
        Self {
            llm: Llm::new(backends.clone(), models.clone()),
            stt: Stt::new(backends.clone(), models.clone()),
            tts: Tts::new(backends, models),
        }
    }
}
