//! whisper.cpp transcription backends.
//!
//! `ServerBackend` keeps a `whisper-server` sidecar alive and uploads audio
//! as multipart form data. `CliBackend` drives the one-shot `whisper-cli`
//! binary over a temp file and parses its timestamped transcript lines.
//! One of the two is registered per process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{
    Backend, Executor, Request, Response, ResponseMetadata, ServerConfig, ServerManager, TempPath,
    PROVIDER_WHISPER_CPP,
};
use crate::error::{Error, Result};
use crate::params;

/// Default port for the whisper-server sidecar.
pub const SERVER_PORT: u16 = 8082;

const CLI_TIMEOUT: Duration = Duration::from_secs(60);
const SERVER_CLIENT_TIMEOUT: Duration = Duration::from_secs(300);
// Transcription models can take a while to map into memory.
const SERVER_READY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    task: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    segments: Vec<TranscriptSegment>,
    #[serde(default)]
    detected_language: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TranscriptSegment {
    #[serde(default)]
    id: i64,
    #[serde(default)]
    text: String,
    #[serde(default)]
    start: f64,
    #[serde(default)]
    end: f64,
}

// ============================================================================
// Sidecar-shaped backend
// ============================================================================

/// `whisper-server` sidecar backend.
pub struct ServerBackend {
    manager: Arc<ServerManager>,
    client: reqwest::Client,
    bin_path: PathBuf,
    port: u16,
}

impl ServerBackend {
    pub fn new(bin_path: impl Into<PathBuf>, manager: Arc<ServerManager>) -> Self {
        Self::with_port(bin_path, manager, SERVER_PORT)
    }

    pub(crate) fn with_port(
        bin_path: impl Into<PathBuf>,
        manager: Arc<ServerManager>,
        port: u16,
    ) -> Self {
        Self {
            manager,
            client: reqwest::Client::builder()
                .timeout(SERVER_CLIENT_TIMEOUT)
                .build()
                .expect("transcription client construction cannot fail"),
            bin_path: bin_path.into(),
            port,
        }
    }

    fn build_form_fields(req: &Request) -> Vec<(String, String)> {
        let p = &req.parameters;
        let mut fields = vec![
            ("language".to_string(), params::get(p, "language", String::new())),
            ("response_format".to_string(), "verbose_json".to_string()),
            (
                "temperature".to_string(),
                format!("{:.2}", params::get(p, "temperature", 0.0f64)),
            ),
            (
                "translate".to_string(),
                params::get(p, "translate", false).to_string(),
            ),
            (
                "no_timestamps".to_string(),
                params::get(p, "no_timestamps", false).to_string(),
            ),
        ];

        let beam_size = params::get(p, "beam_size", -1i64);
        if beam_size >= 0 {
            fields.push(("beam_size".to_string(), beam_size.to_string()));
        }

        let best_of = params::get(p, "best_of", 2i64);
        if best_of > 0 {
            fields.push(("best_of".to_string(), best_of.to_string()));
        }

        let prompt = params::get(p, "prompt", String::new());
        if !prompt.is_empty() {
            fields.push(("prompt".to_string(), prompt));
        }

        fields
    }
}

#[async_trait]
impl Backend for ServerBackend {
    fn provider(&self) -> &'static str {
        PROVIDER_WHISPER_CPP
    }

    async fn infer(&self, _cancel: &CancellationToken, req: Request) -> Result<Response> {
        let args = vec![
            "--model".to_string(),
            req.model_path.clone(),
            "--port".to_string(),
            self.port.to_string(),
            "--host".to_string(),
            "127.0.0.1".to_string(),
        ];

        let mut cfg = ServerConfig::new(self.provider(), &self.bin_path, args, self.port);
        // Whisper server has no dedicated health endpoint.
        cfg.health_path = Some("/".to_string());
        cfg.ready_timeout = Some(SERVER_READY_TIMEOUT);
        self.manager.start_server(cfg).await?;

        let mut form = Form::new().part(
            "file",
            Part::bytes(req.input.clone()).file_name("audio.wav"),
        );
        for (key, value) in Self::build_form_fields(&req) {
            form = form.text(key, value);
        }

        let started = Instant::now();
        let resp = self
            .client
            .post(format!("http://localhost:{}/inference", self.port))
            .multipart(form)
            .send()
            .await?;
        let elapsed = started.elapsed().as_secs_f64();

        if resp.status() != reqwest::StatusCode::OK {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Execution(format!(
                "request failed with status code {status}: {body}"
            )));
        }

        let transcription: TranscriptionResponse = resp.json().await?;
        let text = transcription.text.clone();

        let mut metadata = ResponseMetadata::new(
            self.provider(),
            &req.model_path,
            elapsed,
            text.len() as u64,
        );
        if let Ok(value) = serde_json::to_value(&transcription) {
            metadata.backend_specific.insert("response".into(), value);
        }

        Ok(Response {
            output: text.into_bytes(),
            metadata,
        })
    }

    async fn close(&self) -> Result<()> {
        match self.manager.stop_server(self.provider(), self.port).await {
            Err(Error::ServerNotFound(_)) => Ok(()),
            other => other,
        }
    }
}

// ============================================================================
// CLI-shaped backend
// ============================================================================

/// One-shot `whisper-cli` backend.
pub struct CliBackend {
    executor: Executor,
    temp_dir: PathBuf,
}

impl CliBackend {
    pub fn new(bin_path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            executor: Executor::new(bin_path, CLI_TIMEOUT)?,
            temp_dir: std::env::temp_dir(),
        })
    }

    fn build_args(req: &Request, audio_path: &str) -> Vec<String> {
        let p = &req.parameters;
        let mut args = vec![
            "--model".to_string(),
            req.model_path.clone(),
            "-f".to_string(),
            audio_path.to_string(),
            "-l".to_string(),
            params::get(p, "language", "auto".to_string()),
        ];

        if let Some(threads) = params::get_opt::<i64>(p, "threads") {
            args.push("-t".to_string());
            args.push(threads.to_string());
        }
        if let Some(processors) = params::get_opt::<i64>(p, "processors") {
            args.push("-p".to_string());
            args.push(processors.to_string());
        }
        if params::get(p, "translate", false) {
            args.push("--translate".to_string());
        }

        args
    }

    /// Join `[HH:MM:SS.mmm --> HH:MM:SS.mmm] text` lines with single spaces
    /// after dropping the timestamp bracket.
    fn parse_transcript(output: &str) -> String {
        output
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                if !line.starts_with('[') || !line.contains("-->") {
                    return None;
                }
                let text = line.split_once(']')?.1.trim();
                if text.is_empty() {
                    return None;
                }
                Some(text)
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl Backend for CliBackend {
    fn provider(&self) -> &'static str {
        PROVIDER_WHISPER_CPP
    }

    async fn infer(&self, cancel: &CancellationToken, req: Request) -> Result<Response> {
        // The CLI only reads audio from a file.
        let audio_file = TempPath::new(&self.temp_dir, "whisper", "wav");
        tokio::fs::write(audio_file.path(), &req.input)
            .await
            .map_err(|e| Error::Execution(format!("failed to write audio file: {e}")))?;

        let args = Self::build_args(&req, &audio_file.path().display().to_string());

        let started = Instant::now();
        let out = self.executor.execute(cancel, &args, None).await?;
        let elapsed = started.elapsed().as_secs_f64();

        let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
        let text = Self::parse_transcript(&stdout);

        let mut metadata =
            ResponseMetadata::new(self.provider(), &req.model_path, elapsed, text.len() as u64);
        metadata
            .backend_specific
            .insert("stdout".into(), serde_json::json!(stdout));
        metadata
            .backend_specific
            .insert("stderr".into(), serde_json::json!(stderr));
        metadata
            .backend_specific
            .insert("args".into(), serde_json::json!(args.join(" ")));

        Ok(Response {
            output: text.into_bytes(),
            metadata,
        })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
