//! Large-language-model service.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::resolve_model;
use crate::backend::{Registry, Request, Response, StreamChunk};
use crate::error::{Error, Result};
use crate::model;

pub struct Llm {
    backends: Arc<Registry>,
    models: Arc<model::Manager>,
}

impl Llm {
    pub fn new(backends: Arc<Registry>, models: Arc<model::Manager>) -> Self {
        Self { backends, models }
    }

    /// Generate text with a buffered result.
    pub async fn generate(
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
            tracing::error!(error = %e, provider, model_id, "failed to generate text");
            e
        })?;

        self.models.mark_loaded(model_id);
        Ok(resp)
    }

    /// Generate text as a chunk stream.
    pub async fn generate_stream(
        &self,
        cancel: &CancellationToken,
        provider: &str,
        model_id: &str,
        req: Request,
    ) -> Result<mpsc::Receiver<StreamChunk>> {
        let backend = self
            .backends
            .get(provider)
            .await
            .ok_or_else(|| Error::BackendNotFound(provider.to_string()))?;

        let streaming = backend
            .as_streaming()
            .ok_or_else(|| Error::NotStreamable(provider.to_string()))?;

        let req = resolve_model(&self.models, model_id, req)?;

        let rx = streaming.infer_stream(cancel, req).await.map_err(|e| {
            tracing::error!(error = %e, provider, model_id, "failed to generate streamed text");
            e
        })?;

        self.models.mark_loaded(model_id);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, ResponseMetadata, StreamingBackend};
    use crate::config::{ModelConfig, ModelType, SourceConfig};
    use crate::model::{ModelInstance, ModelStatus};
    use async_trait::async_trait;
    use std::path::PathBuf;

    struct EchoBackend {
        streaming: bool,
    }

    #[async_trait]
    impl Backend for EchoBackend {
        fn provider(&self) -> &'static str {
            "echo"
        }

        async fn infer(&self, _cancel: &CancellationToken, req: Request) -> Result<Response> {
            assert_eq!(req.model_path, "/models/m1.gguf");
            Ok(Response {
                output: req.input,
                metadata: ResponseMetadata::new("echo", &req.model_path, 0.01, 0),
            })
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }

        fn as_streaming(self: Arc<Self>) -> Option<Arc<dyn StreamingBackend>> {
            if self.streaming {
                Some(self)
            } else {
                None
            }
        }
    }

    #[async_trait]
    impl StreamingBackend for EchoBackend {
        async fn infer_stream(
            &self,
            _cancel: &CancellationToken,
            req: Request,
        ) -> Result<mpsc::Receiver<StreamChunk>> {
            let (tx, rx) = mpsc::channel(32);
            tokio::spawn(async move {
                let _ = tx.send(StreamChunk::data(req.input)).await;
                let _ = tx.send(StreamChunk::done()).await;
            });
            Ok(rx)
        }
    }

    fn model_config() -> ModelConfig {
        ModelConfig {
            model_type: ModelType::Llm,
            backend: "echo".to_string(),
            source: SourceConfig::default(),
            order: 0,
            tags: Vec::new(),
        }
    }

    async fn service_with(streaming: bool) -> (Llm, Arc<model::Manager>) {
        let backends = Arc::new(Registry::new());
        let models = Arc::new(model::Manager::new());

        backends
            .register(Arc::new(EchoBackend { streaming }))
            .await
            .unwrap();

        models.registry().set(ModelInstance::new(
            "m1".to_string(),
            PathBuf::from("/models/m1.gguf"),
            model_config(),
        ));

        (Llm::new(backends, models.clone()), models)
    }

    #[tokio::test]
    async fn generate_fills_model_path_and_delegates() {
        let (svc, models) = service_with(false).await;
        let resp = svc
            .generate(
                &CancellationToken::new(),
                "echo",
                "m1",
                Request {
                    input: b"hi".to_vec(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(resp.output, b"hi");

        // A successful use marks the model loaded.
        let m1 = models.registry().get("m1").unwrap();
        assert_eq!(m1.status, ModelStatus::Loaded);
        assert!(m1.loaded_at.is_some());
    }

    #[tokio::test]
    async fn failed_models_are_rejected_before_dispatch() {
        let (svc, models) = service_with(false).await;

        let mut broken = ModelInstance::new(
            "broken".to_string(),
            PathBuf::new(),
            model_config(),
        );
        broken.set_error(&Error::Download("no route to hub".to_string()));
        broken.set_status(ModelStatus::Failed);
        models.registry().set(broken);

        let err = svc
            .generate(
                &CancellationToken::new(),
                "echo",
                "broken",
                Request::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Execution(_)));
        assert!(err.to_string().contains("no route to hub"), "{err}");
    }

    #[tokio::test]
    async fn generate_unknown_backend_is_not_found() {
        let (svc, _models) = service_with(false).await;
        let err = svc
            .generate(
                &CancellationToken::new(),
                "nope",
                "m1",
                Request::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BackendNotFound(_)));
    }

    #[tokio::test]
    async fn generate_unknown_model_is_not_found() {
        let (svc, _models) = service_with(false).await;
        let err = svc
            .generate(
                &CancellationToken::new(),
                "echo",
                "missing",
                Request::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModelNotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn stream_requires_the_streaming_capability() {
        let (svc, _models) = service_with(false).await;
        let err = svc
            .generate_stream(
                &CancellationToken::new(),
                "echo",
                "m1",
                Request::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotStreamable(_)));
    }

    #[tokio::test]
    async fn stream_delegates_when_capable() {
        let (svc, _models) = service_with(true).await;
        let mut rx = svc
            .generate_stream(
                &CancellationToken::new(),
                "echo",
                "m1",
                Request {
                    input: b"chunked".to_vec(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.data, b"chunked");
        let last = rx.recv().await.unwrap();
        assert!(last.done);
        assert!(rx.recv().await.is_none());
    }
}
