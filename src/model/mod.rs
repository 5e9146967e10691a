//! Materialized models and their lifecycle.

mod manager;
mod registry;

pub use manager::Manager;
pub use registry::Registry;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;

/// Loading status of a model instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Unloaded,
    Loading,
    Loaded,
    Failed,
    Unloading,
}

/// A model materialized on disk, tracked in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInstance {
    pub id: String,
    /// Primary artifact path: a single file when resolution found one,
    /// otherwise the downloaded directory.
    #[serde(skip)]
    pub path: PathBuf,
    pub config: ModelConfig,
    pub status: ModelStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ModelInstance {
    pub fn new(id: String, path: PathBuf, config: ModelConfig) -> Self {
        Self {
            id,
            path,
            config,
            status: ModelStatus::Unloaded,
            loaded_at: None,
            error: None,
        }
    }

    pub fn set_status(&mut self, status: ModelStatus) {
        self.status = status;
        if status == ModelStatus::Loaded {
            self.loaded_at = Some(Utc::now());
        }
    }

    pub fn set_error(&mut self, error: &crate::error::Error) {
        self.error = Some(error.to_string());
    }
}
