//! Model artifact downloaders, one per source variant.

mod huggingface;

pub use huggingface::{HuggingFaceDownloader, MARKER_FILENAME};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{ModelConfig, SourceType};
use crate::error::{Error, Result};

/// Fetches a model's artifacts into the models directory.
///
/// Implementations are idempotent: repeated calls with identical inputs
/// either return the cached path cheaply (`cached = true`) or re-verify.
/// Cancellation is respected at attempt boundaries.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(
        &self,
        cancel: &CancellationToken,
        model: &ModelConfig,
        target_dir: &Path,
    ) -> Result<(PathBuf, bool)>;
}

/// The capability table mapping source variants to downloaders.
pub fn default_downloaders() -> HashMap<SourceType, Arc<dyn Downloader>> {
    let mut table: HashMap<SourceType, Arc<dyn Downloader>> = HashMap::new();
    table.insert(SourceType::HuggingFace, Arc::new(HuggingFaceDownloader));
    table
}

/// Create the models directory if it does not exist yet.
pub fn ensure_models_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| {
        Error::Config(format!(
            "failed to prepare models directory {}: {e}",
            path.display()
        ))
    })
}
