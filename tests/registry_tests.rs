use std::{sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use resilience_engine::{
    api,
    config::Config,
    models::{
        circuit_breaker::CircuitState,
        health::HealthStatus,
        recovery::RecoveryActionKind,
    },
    registry::{Registry, STATE_STORE_CHECKER},
};
use serde_json::{Value, json};
use tokio::{net::TcpListener, sync::oneshot};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

/// Test: An empty environment yields a working in-memory registry
#[tokio::test]
async fn test_registry_defaults_to_memory_store() -> Result<()> {
    let registry = Registry::init(&Config::default()).await?;

    assert_eq!(registry.store().backend_name(), "memory");

    let results = registry.monitor().check_now().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].service, STATE_STORE_CHECKER);
    assert_eq!(results[0].status, HealthStatus::Healthy);

    Ok(())
}

/// Test: Circuits are created once and looked up by name
#[tokio::test]
async fn test_circuit_get_or_create() -> Result<()> {
    let registry = Registry::init(&Config::default()).await?;

    let first = registry.circuit_breaker(registry.circuit_defaults("payments"));
    let second = registry.circuit_breaker(registry.circuit_defaults("payments"));
    assert!(Arc::ptr_eq(&first, &second));

    registry.circuit_breaker(registry.circuit_defaults("inventory"));
    let names: Vec<String> = registry
        .circuits()
        .iter()
        .map(|breaker| breaker.name().to_string())
        .collect();
    assert_eq!(names, vec!["inventory", "payments"]);

    assert!(registry.circuit("payments").is_some());
    assert!(registry.circuit("unknown").is_none());

    let defaults = registry.circuit_defaults("payments");
    assert_eq!(defaults.failure_threshold, 5);
    assert_eq!(defaults.recovery_timeout, Duration::from_secs(60));
    assert_eq!(defaults.call_timeout, Some(Duration::from_secs(30)));

    Ok(())
}

/// Test: Health endpoints and recovery rules come from configuration
#[tokio::test]
async fn test_registry_wires_configured_components() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let config = Config {
        health_endpoints: vec![format!("orders={}/health", server.uri())],
        recovery_rules: vec!["orders=manual:1".to_string(), "billing=restart".to_string()],
        recovery_failure_threshold: 4,
        ..Config::default()
    };
    let registry = Registry::init(&config).await?;

    let billing = registry.recovery().rules("billing");
    assert_eq!(billing.len(), 1);
    assert_eq!(billing[0].action.kind(), RecoveryActionKind::Restart);
    assert_eq!(billing[0].failure_threshold, 4);

    registry.monitor().check_service("orders").await;

    let status = registry.status().await;
    assert_eq!(status.health.status, HealthStatus::Unhealthy);
    assert_eq!(status.recovery.total_attempts, 1, "Manual intervention recorded");
    assert_eq!(
        status.recovery.attempts_by_action.get(&RecoveryActionKind::ManualIntervention),
        Some(&1)
    );

    Ok(())
}

/// Test: Malformed configuration entries are rejected
#[tokio::test]
async fn test_invalid_configuration_is_rejected() -> Result<()> {
    let bad_endpoint = Config {
        health_endpoints: vec!["missing-separator".to_string()],
        ..Config::default()
    };
    assert!(Registry::init(&bad_endpoint).await.is_err());

    let bad_rule = Config {
        recovery_rules: vec!["orders=reboot".to_string()],
        ..Config::default()
    };
    assert!(Registry::init(&bad_rule).await.is_err());

    let no_timeout = Config {
        circuit_breaker_call_timeout_seconds: 0,
        ..Config::default()
    };
    assert_eq!(no_timeout.circuit_config("batch").call_timeout, None);

    Ok(())
}

/// Test: Monitor lifecycle is driven by the registry
#[tokio::test]
async fn test_registry_start_and_shutdown() -> Result<()> {
    let config = Config {
        health_check_interval_seconds: 1,
        ..Config::default()
    };
    let registry = Registry::init(&config).await?;

    registry.start();
    assert!(registry.status().await.monitor_running);

    registry.shutdown().await;
    assert!(!registry.status().await.monitor_running);

    Ok(())
}

/// Test: Admin API exposes health and circuit operations
#[tokio::test]
async fn test_admin_api() -> Result<()> {
    let registry = Arc::new(Registry::init(&Config::default()).await?);
    registry.circuit_breaker(registry.circuit_defaults("payments"));
    registry.monitor().check_now().await;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let base = format!("http://{}", listener.local_addr()?);
    let (stop, stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(api::serve(listener, Arc::clone(&registry), async move {
        let _ = stopped.await;
    }));

    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("{}/health", base))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    assert_eq!(health["success"], json!(true));
    assert_eq!(health["data"]["status"], json!("healthy"));

    let missing = client.get(format!("{}/circuits/unknown", base)).send().await?;
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    let opened: Value = client
        .post(format!("{}/circuits/payments/open", base))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    assert_eq!(opened["data"]["state"], json!("open"));

    let breaker = registry
        .circuit("payments")
        .ok_or_else(|| anyhow!("circuit should exist"))?;
    assert_eq!(breaker.state().await, CircuitState::Open);

    let reset: Value = client
        .post(format!("{}/circuits/payments/reset", base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(reset["data"]["state"], json!("closed"));

    let circuits: Value = client.get(format!("{}/circuits", base)).send().await?.json().await?;
    assert_eq!(circuits["data"].as_array().map(Vec::len), Some(1));

    let status: Value = client.get(format!("{}/status", base)).send().await?.json().await?;
    assert_eq!(status["data"]["store_backend"], json!("memory"));

    let stats: Value = client
        .get(format!("{}/recovery/stats", base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(stats["data"]["total_attempts"], json!(0));

    let _ = stop.send(());
    server.await??;

    Ok(())
}
