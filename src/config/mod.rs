//! Typed configuration for the gateway.
//!
//! The config document is YAML, validated against a JSON schema before the
//! typed parse (see `loader`). A watcher republishes snapshots on change
//! (see `watcher`).

pub mod defaults;
pub mod loader;
pub mod source;
pub mod watcher;

pub use loader::load_and_validate;
pub use watcher::{ReloadCallback, Watcher};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Root configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default, skip_serializing_if = "StorageConfig::is_empty")]
    pub storage: StorageConfig,
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
    pub services: ServicesConfig,
}

/// Storage overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models_dir: Option<String>,
}

impl StorageConfig {
    fn is_empty(&self) -> bool {
        self.models_dir.is_none()
    }
}

/// The service a model is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Llm,
    Nlu,
    Stt,
    Tts,
}

/// Declarative record for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(rename = "type")]
    pub model_type: ModelType,
    pub backend: String,
    pub source: SourceConfig,
    #[serde(default)]
    pub order: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl ModelConfig {
    /// The active source variant; exactly one must be configured.
    pub fn source(&self) -> Result<ModelSource> {
        if let Some(hf) = &self.source.huggingface {
            return Ok(ModelSource::HuggingFace(hf.clone()));
        }

        Err(Error::Config("no source configured for model".to_string()))
    }
}

/// Wrapper holding the optional source variants (only one should be set).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub huggingface: Option<HuggingFaceSource>,
}

/// Resolved source variant.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelSource {
    HuggingFace(HuggingFaceSource),
}

impl ModelSource {
    pub fn source_type(&self) -> SourceType {
        match self {
            ModelSource::HuggingFace(_) => SourceType::HuggingFace,
        }
    }
}

/// Discriminant for source variants, used as the downloader table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceType {
    HuggingFace,
}

/// A Hugging Face model repository source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HuggingFaceSource {
    pub repo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<u32>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force_download: bool,
}

/// Per-service model assignments, in priority order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServicesConfig {
    #[serde(default)]
    pub llm: ServiceAssignment,
    #[serde(default)]
    pub nlu: ServiceAssignment,
    #[serde(default)]
    pub stt: ServiceAssignment,
    #[serde(default)]
    pub tts: ServiceAssignment,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceAssignment {
    #[serde(default)]
    pub models: Vec<String>,
}
