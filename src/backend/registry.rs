//! Backend registry keyed by provider identifier.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::{Backend, StreamingBackend};
use crate::error::{Error, Result};

/// Registry of all registered inference backends.
pub struct Registry {
    // Ordered by provider id so `close` walks backends deterministically.
    backends: RwLock<BTreeMap<String, Arc<dyn Backend>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            backends: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a backend. Fails when the provider id is already taken.
    pub async fn register(&self, backend: Arc<dyn Backend>) -> Result<()> {
        let mut backends = self.backends.write().await;

        let provider = backend.provider().to_string();
        if backends.contains_key(&provider) {
            return Err(Error::AlreadyRegistered(provider));
        }

        backends.insert(provider, backend);
        Ok(())
    }

    /// Retrieve a backend by provider id.
    pub async fn get(&self, provider: &str) -> Option<Arc<dyn Backend>> {
        let backends = self.backends.read().await;
        backends.get(provider).cloned()
    }

    /// Retrieve a backend that supports streaming, probing the capability.
    pub async fn get_streaming(&self, provider: &str) -> Option<Arc<dyn StreamingBackend>> {
        self.get(provider).await.and_then(|b| b.as_streaming())
    }

    /// Close every registered backend, aborting on the first error.
    pub async fn close(&self) -> Result<()> {
        let backends: Vec<Arc<dyn Backend>> = {
            let guard = self.backends.read().await;
            guard.values().cloned().collect()
        };

        for backend in backends {
            backend.close().await?;
        }

        Ok(())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
