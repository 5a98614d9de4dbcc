use std::{sync::Arc, time::Duration};

use anyhow::Result;
use resilience_engine::{
    clients::{
        circuit_breaker::CircuitBreaker,
        redis::RedisStateStore,
        state_store::{FallbackStateStore, StateStore},
    },
    models::{
        circuit_breaker::{CircuitConfig, CircuitState},
        retry::RetryConfig,
    },
};
use testcontainers::{
    ContainerAsync, GenericImage,
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
};

async fn start_redis() -> Result<(ContainerAsync<GenericImage>, String)> {
    let container = GenericImage::new("redis", "7.2.4")
        .with_exposed_port(6379.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
        .start()
        .await?;

    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(6379).await?;

    Ok((container, format!("redis://{}:{}", host, port)))
}

async fn connect(url: &str, circuit_ttl: Duration) -> Result<RedisStateStore> {
    RedisStateStore::connect_with(url, &RetryConfig::default(), circuit_ttl, Duration::from_secs(3600))
        .await
}

/// Test: Values round-trip through Redis and circuit keys expire
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_store_operations() -> Result<()> {
    let (_container, url) = start_redis().await?;
    let store = connect(&url, Duration::from_secs(1)).await?;

    store.ping().await?;
    assert_eq!(store.backend_name(), "redis");

    store.set("settings:theme", "dark").await?;
    assert_eq!(store.get("settings:theme").await?.as_deref(), Some("dark"));
    store.delete("settings:theme").await?;
    assert_eq!(store.get("settings:theme").await?, None);

    store.set("circuit_breaker:payments", "{}").await?;
    assert!(store.get("circuit_breaker:payments").await?.is_some());

    tokio::time::sleep(Duration::from_millis(2_100)).await;
    assert_eq!(
        store.get("circuit_breaker:payments").await?,
        None,
        "Circuit keys should expire after their TTL"
    );

    Ok(())
}

/// Test: Two breakers sharing Redis agree on circuit state
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_circuit_state_shared_through_redis() -> Result<()> {
    let (_container, url) = start_redis().await?;

    let config = CircuitConfig::new("ledger")
        .with_failure_threshold(2)
        .with_recovery_timeout(Duration::from_secs(60));

    let first = CircuitBreaker::new(
        config.clone(),
        Arc::new(FallbackStateStore::new(
            Arc::new(connect(&url, Duration::from_secs(10)).await?),
            Duration::from_millis(500),
        )),
    );
    let second = CircuitBreaker::new(
        config,
        Arc::new(FallbackStateStore::new(
            Arc::new(connect(&url, Duration::from_secs(10)).await?),
            Duration::from_millis(500),
        )),
    );

    for _ in 0..2 {
        let _ = first
            .call(|| async { Err::<(), _>(anyhow::anyhow!("ledger unavailable")) })
            .await;
    }

    assert_eq!(second.state().await, CircuitState::Open);

    Ok(())
}
