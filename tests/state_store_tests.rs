use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use resilience_engine::{
    clients::state_store::{FallbackStateStore, InMemoryStateStore, StateStore},
    models::circuit_breaker::{CircuitState, PersistedCircuitState},
};
use tokio::time::{Instant, sleep};
use tokio_test::{assert_err, assert_ok};

/// In-memory primary that can be switched off or slowed down.
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryStateStore,
    down: AtomicBool,
    slow: AtomicBool,
}

impl FlakyStore {
    async fn guard(&self) -> Result<(), Error> {
        if self.slow.load(Ordering::SeqCst) {
            sleep(Duration::from_secs(5)).await;
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(anyhow!("primary store unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        self.guard().await?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.guard().await?;
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.guard().await?;
        self.inner.delete(key).await
    }

    async fn ping(&self) -> Result<(), Error> {
        self.guard().await
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}

/// Test: Writes made while the primary is down are still readable
#[tokio::test]
async fn test_writes_survive_primary_outage() -> Result<()> {
    let primary = Arc::new(FlakyStore::default());
    let store = FallbackStateStore::new(primary.clone(), Duration::from_millis(100));

    primary.down.store(true, Ordering::SeqCst);

    assert_ok!(store.set("circuit_breaker:payments", "open").await);
    assert_eq!(store.get("circuit_breaker:payments").await?.as_deref(), Some("open"));
    assert_err!(store.ping().await);

    primary.down.store(false, Ordering::SeqCst);
    assert_ok!(store.ping().await);

    Ok(())
}

/// Test: Reads from a healthy primary refresh the in-memory copy
#[tokio::test]
async fn test_primary_reads_refresh_memory_copy() -> Result<()> {
    let primary = Arc::new(FlakyStore::default());
    let store = FallbackStateStore::new(primary.clone(), Duration::from_millis(100));

    primary.inner.set("key", "written-elsewhere").await?;
    assert_eq!(store.get("key").await?.as_deref(), Some("written-elsewhere"));

    primary.down.store(true, Ordering::SeqCst);
    assert_eq!(
        store.get("key").await?.as_deref(),
        Some("written-elsewhere"),
        "Memory copy should serve the last value seen from the primary"
    );

    primary.down.store(false, Ordering::SeqCst);
    primary.inner.delete("key").await?;
    assert_eq!(store.get("key").await?, None);

    primary.down.store(true, Ordering::SeqCst);
    assert_eq!(
        store.get("key").await?,
        None,
        "Deletion seen on the primary should clear the memory copy"
    );

    Ok(())
}

/// Test: A hanging primary is bounded by the operation timeout
#[tokio::test]
async fn test_slow_primary_is_bounded() -> Result<()> {
    let primary = Arc::new(FlakyStore::default());
    let store = FallbackStateStore::new(primary.clone(), Duration::from_millis(50));

    store.set("key", "value").await?;
    primary.slow.store(true, Ordering::SeqCst);

    let start = Instant::now();
    assert_eq!(store.get("key").await?.as_deref(), Some("value"));
    assert_ok!(store.set("key", "next").await);
    assert!(
        start.elapsed() < Duration::from_secs(1),
        "Store operations should not wait for the slow primary"
    );

    Ok(())
}

/// Test: A memory-only store reports the memory backend
#[tokio::test]
async fn test_memory_only_store() -> Result<()> {
    let store = FallbackStateStore::memory_only();

    assert!(!store.has_primary());
    assert_eq!(store.backend_name(), "memory");
    assert_ok!(store.ping().await);

    store.set("a", "1").await?;
    store.delete("a").await?;
    assert_eq!(store.get("a").await?, None);

    Ok(())
}

/// Test: Stored records decode across schema versions
#[tokio::test]
async fn test_persisted_state_schema_versions() -> Result<()> {
    let legacy = PersistedCircuitState::decode(r#"{"state":"HALF-OPEN","failure_count":2}"#)?;
    assert_eq!(legacy.version, 1);
    assert_eq!(legacy.state, CircuitState::HalfOpen);
    assert_eq!(legacy.failure_count, 2);
    assert_eq!(legacy.total_calls, 0);

    let current = PersistedCircuitState::decode(
        r#"{"version":1,"state":"open","failure_count":5,"total_calls":9,"added_later":true}"#,
    )?;
    assert_eq!(current.state, CircuitState::Open);
    assert_eq!(current.total_calls, 9);

    let reencoded = PersistedCircuitState::decode(&current.encode()?)?;
    assert_eq!(reencoded, current);

    assert_err!(PersistedCircuitState::decode("not json"));

    Ok(())
}
