//! Inference backend abstraction layer.
//!
//! This module defines the `Backend` trait that abstracts the external
//! inference engines (llama.cpp, whisper.cpp, piper) behind a common
//! interface, plus the request/response/stream types they exchange.

mod executor;
pub mod llama;
pub mod piper;
mod registry;
mod server;
pub mod whisper;

pub use executor::{ChildHandle, CommandRunner, ExecOutput, Executor, SpawnedChild};
pub use registry::Registry;
pub use server::{ServerConfig, ServerManager};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Provider identifier for the llama.cpp chat-completion backends.
pub const PROVIDER_LLAMA_CPP: &str = "llama.cpp";
/// Provider identifier for the whisper.cpp transcription backends.
pub const PROVIDER_WHISPER_CPP: &str = "whisper.cpp";
/// Provider identifier for the piper speech-synthesis backend.
pub const PROVIDER_PIPER: &str = "piper";

/// A single inference call.
///
/// `model_path` is filled in by the service layer from the model registry;
/// callers leave it empty.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub model_path: String,
    pub input: Vec<u8>,
    pub parameters: HashMap<String, serde_json::Value>,
}

/// A buffered inference result.
#[derive(Debug, Clone)]
pub struct Response {
    pub output: Vec<u8>,
    pub metadata: ResponseMetadata,
}

/// Metadata attached to every successful response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub provider: String,
    pub model: String,
    pub timestamp: DateTime<Utc>,
    pub duration_seconds: f64,
    pub output_bytes: u64,
    #[serde(default)]
    pub backend_specific: HashMap<String, serde_json::Value>,
}

impl ResponseMetadata {
    pub fn new(provider: &str, model: &str, duration_seconds: f64, output_bytes: u64) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            timestamp: Utc::now(),
            duration_seconds,
            output_bytes,
            backend_specific: HashMap::new(),
        }
    }
}

/// One element of a streaming response.
///
/// Exactly one terminal chunk (`done` set or `error` present) is emitted per
/// stream, always last before the channel closes.
#[derive(Debug)]
pub struct StreamChunk {
    pub data: Vec<u8>,
    pub done: bool,
    pub error: Option<Error>,
}

impl StreamChunk {
    pub fn data(data: Vec<u8>) -> Self {
        Self {
            data,
            done: false,
            error: None,
        }
    }

    pub fn done() -> Self {
        Self {
            data: Vec::new(),
            done: true,
            error: None,
        }
    }

    pub fn failed(error: Error) -> Self {
        Self {
            data: Vec::new(),
            done: true,
            error: Some(error),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.done || self.error.is_some()
    }
}

/// Core interface implemented by every inference backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Stable provider identifier, unique within the process.
    fn provider(&self) -> &'static str;

    /// Execute inference and return the complete result.
    async fn infer(&self, cancel: &CancellationToken, req: Request) -> Result<Response>;

    /// Release backend resources (stops any owned sidecar).
    async fn close(&self) -> Result<()>;

    /// Probe for the streaming capability. Backends that stream override
    /// this to return themselves.
    fn as_streaming(self: Arc<Self>) -> Option<Arc<dyn StreamingBackend>> {
        None
    }
}

/// Optional extension for backends that can stream results.
#[async_trait]
pub trait StreamingBackend: Backend {
    /// Execute inference and stream chunks as they are produced.
    ///
    /// The returned channel is bounded (capacity 32), always eventually
    /// closed, and carries exactly one terminal chunk.
    async fn infer_stream(
        &self,
        cancel: &CancellationToken,
        req: Request,
    ) -> Result<mpsc::Receiver<StreamChunk>>;
}

/// A uniquely named temporary file removed on drop.
///
/// Used by adapters whose CLI reads from or writes to a file. The
/// time-nanosecond suffix keeps concurrent requests from colliding.
pub(crate) struct TempPath(PathBuf);

impl TempPath {
    pub(crate) fn new(dir: &Path, prefix: &str, extension: &str) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        Self(dir.join(format!("{prefix}_{nanos}.{extension}")))
    }

    pub(crate) fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempPath {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}
