//! Debounced hot reload of the config file.
//!
//! A dedicated thread owns the filesystem watcher. Write events are
//! debounced for 500 ms (later events extend the window) before the file is
//! reloaded and validated. Failed reloads never replace the current
//! snapshot; the callback receives the error instead.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecursiveMode, Watcher as _};

use super::{loader, Config};
use crate::error::Result;

const DEBOUNCE: Duration = Duration::from_millis(500);

/// Invoked after every reload attempt, on the watcher's debounce thread.
/// Reloads are at-least-once; callbacks must be idempotent.
pub type ReloadCallback = Box<dyn Fn(Result<Arc<Config>>) + Send + Sync>;

/// Watches the config file and republishes validated snapshots.
pub struct Watcher {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    schema_path: PathBuf,
    current: RwLock<Arc<Config>>,
    reloads: AtomicU32,
    on_reload: ReloadCallback,
}

impl Watcher {
    /// Load and validate once, then start watching. An invalid initial
    /// config fails construction.
    pub fn new(path: &Path, schema_path: &Path, on_reload: ReloadCallback) -> Result<Self> {
        let cfg = loader::load_and_validate(path, schema_path)?;

        let inner = Arc::new(Inner {
            path: path.to_path_buf(),
            schema_path: schema_path.to_path_buf(),
            current: RwLock::new(Arc::new(cfg)),
            reloads: AtomicU32::new(0),
            on_reload,
        });

        let watch_inner = inner.clone();
        std::thread::Builder::new()
            .name("config-watcher".to_string())
            .spawn(move || watch_loop(watch_inner))?;

        Ok(Self { inner })
    }

    /// The currently active config snapshot.
    pub fn snapshot(&self) -> Arc<Config> {
        self.inner
            .current
            .read()
            .expect("config lock poisoned")
            .clone()
    }

    /// Number of reload attempts since construction.
    pub fn reload_count(&self) -> u32 {
        self.inner.reloads.load(Ordering::SeqCst)
    }
}

fn is_write(event: &Event) -> bool {
    matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
}

fn watch_loop(inner: Arc<Inner>) {
    let (tx, rx) = std::sync::mpsc::channel::<notify::Result<Event>>();
    let mut watcher = match notify::recommended_watcher(tx) {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(error = %e, "failed to create file watcher");
            return;
        }
    };

    if let Err(e) = watcher.watch(&inner.path, RecursiveMode::NonRecursive) {
        tracing::error!(path = %inner.path.display(), error = %e, "failed to watch config file");
        return;
    }

    for res in &rx {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "watcher error");
                continue;
            }
        };
        if !is_write(&event) {
            continue;
        }

        // Debounce: later writes extend the window.
        let mut deadline = Instant::now() + DEBOUNCE;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match rx.recv_timeout(deadline - now) {
                Ok(Ok(event)) if is_write(&event) => deadline = Instant::now() + DEBOUNCE,
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        reload(&inner);
    }
}

fn reload(inner: &Inner) {
    let count = inner.reloads.fetch_add(1, Ordering::SeqCst) + 1;
    tracing::info!(path = %inner.path.display(), count, "reloading config file");

    match loader::load_and_validate(&inner.path, &inner.schema_path) {
        Ok(cfg) => {
            let cfg = Arc::new(cfg);
            *inner.current.write().expect("config lock poisoned") = cfg.clone();
            tracing::info!(count, "config reloaded");
            (inner.on_reload)(Ok(cfg));
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to reload config");
            (inner.on_reload)(Err(e));
        }
    }
}
