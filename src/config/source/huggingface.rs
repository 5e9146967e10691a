//! Hugging Face repository downloads via the `hf` CLI.
//!
//! A two-line marker file alongside the artifacts pins what was fetched;
//! any mismatch with the configured repo and revision triggers a
//! redownload. Hashing the artifact tree was rejected as needlessly
//! expensive for multi-gigabyte models.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::Downloader;
use crate::config::{HuggingFaceSource, ModelConfig, ModelSource};
use crate::error::{Error, Result};

/// Marker file recording the fetched repo and revision.
pub const MARKER_FILENAME: &str = ".syn4pse-downloaded";

const RETRY_DELAY: Duration = Duration::from_secs(2);
const MAX_RETRIES: u32 = 3;
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(300);

pub struct HuggingFaceDownloader;

#[async_trait]
impl Downloader for HuggingFaceDownloader {
    async fn download(
        &self,
        cancel: &CancellationToken,
        model: &ModelConfig,
        target_dir: &Path,
    ) -> Result<(PathBuf, bool)> {
        let ModelSource::HuggingFace(source) = model.source()?;

        let repo = source.repo.trim();
        if repo.is_empty() {
            return Err(Error::Download(format!("invalid repo name: {repo:?}")));
        }

        let full_path = target_dir.join(repo);
        let marker_path = full_path.join(MARKER_FILENAME);
        let marker = marker_content(repo, source.revision.as_deref());

        if marker_path.exists() && !should_redownload(&marker_path, &marker) {
            tracing::info!(repo, path = %full_path.display(), "model already downloaded and up-to-date, skipping");
            return Ok((full_path, true));
        }

        std::fs::create_dir_all(&full_path)
            .map_err(|e| Error::Download(format!("failed to create directory: {e}")))?;

        let args = build_args(&source, repo, &full_path);

        let mut last_err = None;
        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                tracing::info!(repo, attempt = attempt + 1, "retrying download");
                tokio::time::sleep(RETRY_DELAY).await;
            } else {
                tracing::info!(repo, path = %full_path.display(), "downloading model");
            }

            if cancel.is_cancelled() {
                return Err(Error::Canceled);
            }

            match tokio::time::timeout(ATTEMPT_TIMEOUT, run_hf(&args)).await {
                Ok(Ok(())) => {
                    if let Err(e) = std::fs::write(&marker_path, &marker) {
                        tracing::warn!(path = %marker_path.display(), error = %e, "failed to write download marker");
                    }
                    tracing::info!(repo, path = %full_path.display(), attempt = attempt + 1, "model downloaded");
                    return Ok((full_path, false));
                }
                Ok(Err(e)) => {
                    tracing::error!(repo, attempt = attempt + 1, error = %e, "failed to download model");
                    last_err = Some(e);
                }
                Err(_) => {
                    tracing::warn!(repo, attempt = attempt + 1, "download timed out");
                    last_err = Some(Error::Download(format!(
                        "download of {repo} timed out after {ATTEMPT_TIMEOUT:?}"
                    )));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Download(format!("failed to download {repo}"))))
    }
}

async fn run_hf(args: &[String]) -> Result<()> {
    let output = Command::new("hf")
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| Error::Download(format!("failed to run hf: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Download(format!(
            "hf download {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    Ok(())
}

fn build_args(source: &HuggingFaceSource, repo: &str, local_dir: &Path) -> Vec<String> {
    let mut args = vec![
        "download".to_string(),
        repo.to_string(),
        "--local-dir".to_string(),
        local_dir.display().to_string(),
    ];

    if let Some(revision) = &source.revision {
        args.push("--revision".to_string());
        args.push(revision.clone());
    }
    if let Some(repo_type) = &source.repo_type {
        args.push("--repo-type".to_string());
        args.push(repo_type.clone());
    }
    for include in &source.include {
        args.push("--include".to_string());
        args.push(include.clone());
    }
    for exclude in &source.exclude {
        args.push("--exclude".to_string());
        args.push(exclude.clone());
    }
    if source.force_download {
        args.push("--force-download".to_string());
    }
    if let Some(token) = &source.token {
        args.push("--token".to_string());
        args.push(token.clone());
    }
    if let Some(max_workers) = source.max_workers {
        args.push("--max-workers".to_string());
        args.push(max_workers.to_string());
    }

    args
}

fn marker_content(repo: &str, revision: Option<&str>) -> String {
    format!("repo: {repo}\nrevision: {}\n", revision.unwrap_or_default())
}

fn should_redownload(marker_path: &Path, expected: &str) -> bool {
    match std::fs::read_to_string(marker_path) {
        Ok(content) => {
            if content != expected {
                tracing::info!(
                    marker_path = %marker_path.display(),
                    "model config changed (marker mismatch), will redownload"
                );
                true
            } else {
                false
            }
        }
        Err(e) => {
            tracing::debug!(path = %marker_path.display(), error = %e, "marker file missing or unreadable");
            true
        }
    }
}
