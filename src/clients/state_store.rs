use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, warn};

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, Error>;

    async fn set(&self, key: &str, value: &str) -> Result<(), Error>;

    async fn delete(&self, key: &str) -> Result<(), Error>;

    async fn ping(&self) -> Result<(), Error> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str;
}

#[derive(Default)]
pub struct InMemoryStateStore {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Best-effort persistence: a primary (usually remote) store backed by an
/// in-memory copy that absorbs every primary failure.
///
/// Writes land in memory first so a later read can still be served when the
/// primary goes away. Reads that reach the primary refresh the memory copy.
/// `get`, `set` and `delete` never return an error; `ping` reports the
/// primary's reachability for health checks.
pub struct FallbackStateStore {
    primary: Option<Arc<dyn StateStore>>,
    memory: InMemoryStateStore,
    operation_timeout: Duration,
}

impl FallbackStateStore {
    pub fn new(primary: Arc<dyn StateStore>, operation_timeout: Duration) -> Self {
        Self {
            primary: Some(primary),
            memory: InMemoryStateStore::new(),
            operation_timeout,
        }
    }

    pub fn memory_only() -> Self {
        Self {
            primary: None,
            memory: InMemoryStateStore::new(),
            operation_timeout: Duration::from_millis(500),
        }
    }

    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    pub fn primary(&self) -> Option<Arc<dyn StateStore>> {
        self.primary.clone()
    }

    async fn bounded<T, Fut>(&self, operation: &'static str, key: &str, call: Fut) -> Option<T>
    where
        Fut: Future<Output = Result<T, Error>>,
    {
        let outcome = match timeout(self.operation_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "state store {} timed out after {:?}",
                operation,
                self.operation_timeout
            )),
        };

        match outcome {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(
                    operation,
                    key,
                    error = %e,
                    "Primary state store failed, using in-memory copy"
                );
                None
            }
        }
    }
}

#[async_trait]
impl StateStore for FallbackStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let Some(primary) = &self.primary else {
            return self.memory.get(key).await;
        };

        match self.bounded("get", key, primary.get(key)).await {
            Some(Some(value)) => {
                self.memory.set(key, &value).await?;
                Ok(Some(value))
            }
            Some(None) => {
                self.memory.delete(key).await?;
                Ok(None)
            }
            None => self.memory.get(key).await,
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.memory.set(key, value).await?;

        if let Some(primary) = &self.primary {
            if self.bounded("set", key, primary.set(key, value)).await.is_some() {
                debug!(key, backend = primary.backend_name(), "State persisted");
            }
        }

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.memory.delete(key).await?;

        if let Some(primary) = &self.primary {
            self.bounded("delete", key, primary.delete(key)).await;
        }

        Ok(())
    }

    async fn ping(&self) -> Result<(), Error> {
        match &self.primary {
            Some(primary) => timeout(self.operation_timeout, primary.ping())
                .await
                .map_err(|_| anyhow!("state store ping timed out"))?,
            None => Ok(()),
        }
    }

    fn backend_name(&self) -> &'static str {
        match &self.primary {
            Some(primary) => primary.backend_name(),
            None => self.memory.backend_name(),
        }
    }
}
