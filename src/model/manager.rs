//! Model lifecycle management.
//!
//! `load_models_from_config` reconciles the registry with the set of models
//! the config's service assignments reference: missing artifacts are
//! downloaded, a fresh registry is built, and it replaces the old one
//! wholesale so instances that lost their last reference disappear.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;

use super::{ModelInstance, ModelStatus, Registry};
use crate::config::source::{self, Downloader, MARKER_FILENAME};
use crate::config::{defaults, Config, ModelConfig, SourceType};
use crate::envvar;
use crate::error::{Error, Result};

/// Extensions that identify a primary model artifact.
const MODEL_EXTENSIONS: &[&str] = &[
    "onnx",
    "bin",
    "gguf",
    "safetensors",
    "pt",
    "pth",
    "pkl",
    "h5",
];

/// Orchestrates model downloads and registry reconciliation.
pub struct Manager {
    registry: RwLock<Arc<Registry>>,
    downloaders: HashMap<SourceType, Arc<dyn Downloader>>,
    load_lock: tokio::sync::Mutex<()>,
}

impl Manager {
    pub fn new() -> Self {
        Self::with_downloaders(source::default_downloaders())
    }

    /// Construct with a custom downloader table. Tests inject doubles here.
    pub fn with_downloaders(downloaders: HashMap<SourceType, Arc<dyn Downloader>>) -> Self {
        Self {
            registry: RwLock::new(Arc::new(Registry::new())),
            downloaders,
            load_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The current model registry snapshot.
    pub fn registry(&self) -> Arc<Registry> {
        self.registry
            .read()
            .expect("manager registry lock poisoned")
            .clone()
    }

    /// Reconcile the registry with the models the config references.
    pub async fn load_models_from_config(
        &self,
        cancel: &CancellationToken,
        config: &Config,
    ) -> Result<()> {
        let _serialize = self.load_lock.lock().await;

        let mut referenced = BTreeSet::new();
        for assignment in [
            &config.services.llm,
            &config.services.stt,
            &config.services.tts,
            &config.services.nlu,
        ] {
            referenced.extend(assignment.models.iter().cloned());
        }

        let models_dir = resolve_models_dir(config);
        source::ensure_models_dir(&models_dir)?;

        let next = Arc::new(Registry::new());
        let mut first_err: Option<Error> = None;
        for model_id in &referenced {
            let Some(model_config) = config.models.get(model_id) else {
                tracing::warn!(model_id = %model_id, "model not found in config");
                continue;
            };

            let mut instance =
                ModelInstance::new(model_id.clone(), PathBuf::new(), model_config.clone());
            instance.set_status(ModelStatus::Loading);
            next.set(instance.clone());

            match self.fetch(cancel, model_id, model_config, &models_dir).await {
                Ok(path) => {
                    instance.path = path;
                    instance.set_status(ModelStatus::Unloaded);
                    next.set(instance);
                    tracing::info!(model_id = %model_id, "model loaded into registry");
                }
                Err(e) => {
                    tracing::error!(model_id = %model_id, error = %e, "failed to load model");
                    instance.set_error(&e);
                    instance.set_status(ModelStatus::Failed);
                    next.set(instance);
                    first_err.get_or_insert(e);
                }
            }
        }

        // Retire instances the new config no longer references while the
        // old registry is still published.
        let previous = self.registry();
        for instance in previous.list() {
            if next.get(&instance.id).is_none() {
                previous.set_status(&instance.id, ModelStatus::Unloading);
                previous.delete(&instance.id);
                tracing::info!(model_id = %instance.id, "model evicted from registry");
            }
        }

        // Wholesale swap: failed models stay visible as `failed`, evicted
        // ones are gone.
        *self
            .registry
            .write()
            .expect("manager registry lock poisoned") = next;

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Record that a backend has the model resident after a successful use.
    pub fn mark_loaded(&self, id: &str) {
        self.registry().mark_loaded(id);
    }

    /// Download one model and resolve its primary artifact path.
    async fn fetch(
        &self,
        cancel: &CancellationToken,
        model_id: &str,
        model_config: &ModelConfig,
        models_dir: &Path,
    ) -> Result<PathBuf> {
        let model_source = model_config
            .source()
            .map_err(|e| Error::Config(format!("model {model_id}: {e}")))?;

        let downloader = self
            .downloaders
            .get(&model_source.source_type())
            .ok_or_else(|| Error::Config(format!("no downloader for model {model_id} source")))?;

        let (download_path, _cached) = downloader
            .download(cancel, model_config, models_dir)
            .await
            .map_err(|e| {
                Error::Download(format!(
                    "failed to download model {model_id} into {}: {e}",
                    models_dir.display()
                ))
            })?;

        let include = model_config
            .source
            .huggingface
            .as_ref()
            .map(|hf| hf.include.as_slice())
            .unwrap_or_default();
        Ok(resolve_primary_file(&download_path, include))
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

/// Models directory precedence: env override, then config, then platform
/// default.
fn resolve_models_dir(config: &Config) -> PathBuf {
    if let Ok(path) = std::env::var(envvar::MODELS_PATH) {
        if !path.is_empty() {
            return defaults::expand_tilde(&path);
        }
    }
    if let Some(dir) = &config.storage.models_dir {
        return defaults::expand_tilde(dir);
    }
    defaults::default_models_dir()
}

/// Resolve the primary model file within a downloaded directory.
///
/// When the include globs match exactly one regular file, that file wins.
/// Otherwise a heuristic picks the first file with a known model extension,
/// then the first whose name suggests weights. Ambiguity returns the
/// directory itself.
fn resolve_primary_file(dir: &Path, include: &[String]) -> PathBuf {
    if dir.is_file() {
        return dir.to_path_buf();
    }

    let mut files = Vec::new();
    collect_files(dir, &mut files);
    files.sort();

    if !include.is_empty() {
        let patterns: Vec<glob::Pattern> = include
            .iter()
            .filter_map(|p| glob::Pattern::new(p).ok())
            .collect();
        let matches: Vec<&PathBuf> = files
            .iter()
            .filter(|f| {
                let name = f.file_name().and_then(|n| n.to_str()).unwrap_or_default();
                let relative = f
                    .strip_prefix(dir)
                    .ok()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default();
                patterns
                    .iter()
                    .any(|p| p.matches(name) || p.matches(&relative))
            })
            .collect();
        if matches.len() == 1 {
            return matches[0].clone();
        }
    }

    if let Some(file) = files.iter().find(|f| {
        f.extension()
            .and_then(|e| e.to_str())
            .map(|e| MODEL_EXTENSIONS.contains(&e.to_lowercase().as_str()))
            .unwrap_or(false)
    }) {
        return file.clone();
    }

    if let Some(file) = files.iter().find(|f| {
        let name = f
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_lowercase();
        name.contains("model") || name.contains("checkpoint") || name.contains("weights")
    }) {
        return file.clone();
    }

    dir.to_path_buf()
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, files);
        } else if path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n != MARKER_FILENAME)
            .unwrap_or(true)
        {
            files.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        HuggingFaceSource, ModelConfig, ModelType, ServiceAssignment, ServicesConfig,
        SourceConfig, StorageConfig,
    };
    use crate::model::ModelStatus;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Downloader double: creates the repo directory with one fake weight
    /// file and counts invocations. Repos matching `fail_repo` error out.
    struct FakeDownloader {
        calls: AtomicUsize,
        fail_repo: Option<String>,
    }

    impl FakeDownloader {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_repo: None,
            }
        }

        fn failing(repo: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_repo: Some(repo.to_string()),
            }
        }

        fn table(self: Arc<Self>) -> HashMap<SourceType, Arc<dyn Downloader>> {
            let mut table: HashMap<SourceType, Arc<dyn Downloader>> = HashMap::new();
            table.insert(SourceType::HuggingFace, self);
            table
        }
    }

    #[async_trait]
    impl Downloader for FakeDownloader {
        async fn download(
            &self,
            _cancel: &CancellationToken,
            model: &ModelConfig,
            target_dir: &Path,
        ) -> Result<(PathBuf, bool)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let repo = &model.source.huggingface.as_ref().unwrap().repo;
            if self.fail_repo.as_deref() == Some(repo.as_str()) {
                return Err(Error::Download(format!("no route to hub for {repo}")));
            }
            let dir = target_dir.join(repo);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("weights.gguf"), b"gguf").unwrap();
            Ok((dir, false))
        }
    }

    fn config_with(ids: &[&str], models_dir: &Path) -> Config {
        let mut models = HashMap::new();
        for id in ids {
            models.insert(
                id.to_string(),
                ModelConfig {
                    model_type: ModelType::Llm,
                    backend: "llama.cpp".to_string(),
                    source: SourceConfig {
                        huggingface: Some(HuggingFaceSource {
                            repo: format!("org/{id}"),
                            include: vec!["*.gguf".to_string()],
                            ..Default::default()
                        }),
                    },
                    order: 0,
                    tags: Vec::new(),
                },
            );
        }

        Config {
            version: "1".to_string(),
            storage: StorageConfig {
                models_dir: Some(models_dir.display().to_string()),
            },
            models,
            services: ServicesConfig {
                llm: ServiceAssignment {
                    models: ids.iter().map(|s| s.to_string()).collect(),
                },
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn load_inserts_referenced_models_as_unloaded() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Arc::new(FakeDownloader::new());
        let manager = Manager::with_downloaders(downloader.clone().table());

        let cfg = config_with(&["m1", "m2"], dir.path());
        manager
            .load_models_from_config(&CancellationToken::new(), &cfg)
            .await
            .unwrap();

        let registry = manager.registry();
        let m1 = registry.get("m1").unwrap();
        assert_eq!(m1.status, ModelStatus::Unloaded);
        assert!(m1.path.ends_with("weights.gguf"), "{:?}", m1.path);
        assert!(registry.get("m2").is_some());
        assert_eq!(downloader.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reload_evicts_models_no_longer_referenced() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Arc::new(FakeDownloader::new());
        let manager = Manager::with_downloaders(downloader.table());

        manager
            .load_models_from_config(
                &CancellationToken::new(),
                &config_with(&["m1"], dir.path()),
            )
            .await
            .unwrap();
        assert!(manager.registry().get("m1").is_some());

        manager
            .load_models_from_config(
                &CancellationToken::new(),
                &config_with(&["m2"], dir.path()),
            )
            .await
            .unwrap();

        let registry = manager.registry();
        assert!(registry.get("m1").is_none(), "evicted model still present");
        assert!(registry.get("m2").is_some());
    }

    #[tokio::test]
    async fn unknown_model_ids_are_skipped_with_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Arc::new(FakeDownloader::new());
        let manager = Manager::with_downloaders(downloader.table());

        let mut cfg = config_with(&["m1"], dir.path());
        cfg.services.llm.models.push("ghost".to_string());

        manager
            .load_models_from_config(&CancellationToken::new(), &cfg)
            .await
            .unwrap();

        let registry = manager.registry();
        assert!(registry.get("m1").is_some());
        assert!(registry.get("ghost").is_none());
    }

    #[tokio::test]
    async fn failed_download_is_recorded_and_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Arc::new(FakeDownloader::failing("org/bad"));
        let manager = Manager::with_downloaders(downloader.table());

        let err = manager
            .load_models_from_config(
                &CancellationToken::new(),
                &config_with(&["bad", "good"], dir.path()),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad"), "{err}");

        let registry = manager.registry();
        // The healthy model still landed.
        assert_eq!(registry.get("good").unwrap().status, ModelStatus::Unloaded);

        // The failed one is visible with its error recorded.
        let bad = registry.get("bad").unwrap();
        assert_eq!(bad.status, ModelStatus::Failed);
        assert!(
            bad.error.as_deref().unwrap().contains("no route to hub"),
            "{:?}",
            bad.error
        );
    }

    #[test]
    fn primary_file_single_include_match_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.gguf"), b"x").unwrap();
        std::fs::write(dir.path().join("README.md"), b"x").unwrap();

        let path = resolve_primary_file(dir.path(), &["*.gguf".to_string()]);
        assert!(path.ends_with("model.gguf"));
    }

    #[test]
    fn primary_file_ambiguous_include_falls_back_to_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.gguf"), b"x").unwrap();
        std::fs::write(dir.path().join("b.gguf"), b"x").unwrap();

        // Two matches: include is ambiguous, extension heuristic picks the
        // first in sorted order.
        let path = resolve_primary_file(dir.path(), &["*.gguf".to_string()]);
        assert!(path.ends_with("a.gguf"));
    }

    #[test]
    fn primary_file_name_heuristic() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("checkpoint.dat"), b"x").unwrap();
        std::fs::write(dir.path().join("vocab.txt"), b"x").unwrap();

        let path = resolve_primary_file(dir.path(), &[]);
        assert!(path.ends_with("checkpoint.dat"));
    }

    #[test]
    fn primary_file_no_candidate_returns_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("vocab.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.md"), b"x").unwrap();

        assert_eq!(resolve_primary_file(dir.path(), &[]), dir.path());
    }
}
