//! Piper text-to-speech backend.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{Backend, Executor, Request, Response, ResponseMetadata, TempPath, PROVIDER_PIPER};
use crate::error::{Error, Result};
use crate::params;

const CLI_TIMEOUT: Duration = Duration::from_secs(30);

/// One-shot `piper` backend.
///
/// Input is text on stdin, output is WAV audio read back from a temp file
/// because piper's CLI only writes to a file.
pub struct PiperBackend {
    executor: Executor,
    temp_dir: PathBuf,
}

impl PiperBackend {
    pub fn new(bin_path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            executor: Executor::new(bin_path, CLI_TIMEOUT)?,
            temp_dir: std::env::temp_dir(),
        })
    }

    fn build_args(req: &Request, output_file: &str) -> Vec<String> {
        let p = &req.parameters;
        let mut args = vec![
            "--model".to_string(),
            req.model_path.clone(),
            "--output_file".to_string(),
            output_file.to_string(),
        ];

        if let Some(speaker) = params::get_opt::<i64>(p, "speaker_id") {
            args.push("--speaker".to_string());
            args.push(speaker.to_string());
        }
        if let Some(v) = params::get_opt::<f64>(p, "length_scale") {
            args.push("--length_scale".to_string());
            args.push(format!("{v:.2}"));
        }
        if let Some(v) = params::get_opt::<f64>(p, "noise_scale") {
            args.push("--noise_scale".to_string());
            args.push(format!("{v:.2}"));
        }
        if let Some(v) = params::get_opt::<f64>(p, "noise_w") {
            args.push("--noise_w".to_string());
            args.push(format!("{v:.2}"));
        }
        if let Some(v) = params::get_opt::<f64>(p, "sentence_silence") {
            args.push("--sentence_silence".to_string());
            args.push(format!("{v:.2}"));
        }

        args
    }
}

#[async_trait]
impl Backend for PiperBackend {
    fn provider(&self) -> &'static str {
        PROVIDER_PIPER
    }

    async fn infer(&self, cancel: &CancellationToken, req: Request) -> Result<Response> {
        let output_file = TempPath::new(&self.temp_dir, "piper", "wav");
        let args = Self::build_args(&req, &output_file.path().display().to_string());

        let started = Instant::now();
        let out = self
            .executor
            .execute(cancel, &args, Some(req.input.clone()))
            .await?;
        let elapsed = started.elapsed().as_secs_f64();

        let audio = tokio::fs::read(output_file.path())
            .await
            .map_err(|e| Error::Execution(format!("failed to read audio file: {e}")))?;

        let mut metadata = ResponseMetadata::new(
            self.provider(),
            &req.model_path,
            elapsed,
            audio.len() as u64,
        );
        metadata
            .backend_specific
            .insert("stdout".into(), json!(String::from_utf8_lossy(&out.stdout)));
        metadata
            .backend_specific
            .insert("stderr".into(), json!(String::from_utf8_lossy(&out.stderr)));
        metadata
            .backend_specific
            .insert("args".into(), json!(args.join(" ")));

        Ok(Response {
            output: audio,
            metadata,
        })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
