//! Speech-to-text service.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::resolve_model;
use crate::backend::{Registry, Request, Response};
use crate::error::{Error, Result};
use crate::model;

pub struct Stt {
    backends: Arc<Registry>,
    models: Arc<model::Manager>,
}

impl Stt {
    pub fn new(backends: Arc<Registry>, models: Arc<model::Manager>) -> Self {
        Self { backends, models }
    }

    /// Transcribe audio with a speech-to-text model.
    pub async fn transcribe(
        &self,
        cancel: &CancellationToken,
        provider: &str,
        model_id: &str,
        req: Request,
    ) -> Result<Response> {
        let backend = self
            .backends
            .get(provider)
            .await
            .ok_or_else(|| Error::BackendNotFound(provider.to_string()))?;

        let req = resolve_model(&self.models, model_id, req)?;

        let resp = backend.infer(cancel, req).await.map_err(|e| {
            tracing::error!(error = %e, provider, model_id, "failed to transcribe audio");
            e
        })?;

        self.models.mark_loaded(model_id);
        Ok(resp)
    }
}
