use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use resilience_engine::{
    clients::{
        health::CallbackHealthChecker,
        health_monitor::{FailureHandler, HealthMonitor},
    },
    models::health::{HealthCheckResult, HealthStatus, HealthTransition, ProbeOutcome},
};
use tokio::time::sleep;

/// Checker whose reported status is switched by the test.
fn switchable(name: &str, status: &Arc<Mutex<HealthStatus>>) -> Arc<CallbackHealthChecker> {
    let status = Arc::clone(status);
    Arc::new(CallbackHealthChecker::new(name, move || {
        let status = *status.lock().unwrap();
        async move { Ok(ProbeOutcome::healthy().with_status(status)) }
    }))
}

/// Handler that stays busy long enough to span several polling cycles.
#[derive(Default)]
struct SlowHandler {
    started: AtomicU32,
}

#[async_trait]
impl FailureHandler for SlowHandler {
    async fn handle_service_failure(
        &self,
        _service: &str,
        _result: &HealthCheckResult,
        _consecutive_failures: u32,
    ) {
        self.started.fetch_add(1, Ordering::SeqCst);
        sleep(Duration::from_millis(400)).await;
    }
}

#[derive(Default)]
struct RecordingHandler {
    calls: Mutex<Vec<(String, u32)>>,
}

#[async_trait]
impl FailureHandler for RecordingHandler {
    async fn handle_service_failure(
        &self,
        service: &str,
        _result: &HealthCheckResult,
        consecutive_failures: u32,
    ) {
        self.calls
            .lock()
            .unwrap()
            .push((service.to_string(), consecutive_failures));
    }
}

/// Test: The change callback fires only when the status actually changes
#[tokio::test]
async fn test_change_callback_only_on_transition() -> Result<()> {
    let monitor = HealthMonitor::new(Duration::from_secs(30));
    let status = Arc::new(Mutex::new(HealthStatus::Healthy));
    monitor.register_checker(switchable("api", &status));

    let transitions: Arc<Mutex<Vec<HealthTransition>>> = Arc::default();
    let seen = Arc::clone(&transitions);
    monitor.on_health_change(move |transition| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock().unwrap().push(transition);
        }
    });

    monitor.check_now().await;
    monitor.check_now().await;
    monitor.check_now().await;
    assert_eq!(transitions.lock().unwrap().len(), 1);

    *status.lock().unwrap() = HealthStatus::Unhealthy;
    monitor.check_now().await;
    monitor.check_now().await;

    let transitions = transitions.lock().unwrap();
    assert_eq!(transitions.len(), 2);
    assert_eq!(transitions[0].old_status, HealthStatus::Unknown);
    assert_eq!(transitions[0].new_status, HealthStatus::Healthy);
    assert_eq!(transitions[1].old_status, HealthStatus::Healthy);
    assert_eq!(transitions[1].new_status, HealthStatus::Unhealthy);

    Ok(())
}

/// Test: Consecutive counters follow the latest streak
#[tokio::test]
async fn test_consecutive_counters() -> Result<()> {
    let monitor = HealthMonitor::new(Duration::from_secs(30));
    let status = Arc::new(Mutex::new(HealthStatus::Unhealthy));
    monitor.register_checker(switchable("db", &status));

    for _ in 0..3 {
        monitor.check_now().await;
    }
    let health = monitor.service_health("db").expect("db is registered");
    assert_eq!(health.consecutive_failures, 3);
    assert_eq!(health.consecutive_successes, 0);

    *status.lock().unwrap() = HealthStatus::Degraded;
    monitor.check_now().await;
    let health = monitor.service_health("db").expect("db is registered");
    assert_eq!(health.consecutive_failures, 4, "Degraded extends the failure streak");

    *status.lock().unwrap() = HealthStatus::Healthy;
    monitor.check_now().await;
    let health = monitor.service_health("db").expect("db is registered");
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.consecutive_failures, 0);
    assert_eq!(health.consecutive_successes, 1);

    Ok(())
}

/// Test: Recovery callbacks fire when a failing service becomes healthy
#[tokio::test]
async fn test_recovery_callback() -> Result<()> {
    let monitor = HealthMonitor::new(Duration::from_secs(30));
    let status = Arc::new(Mutex::new(HealthStatus::Healthy));
    monitor.register_checker(switchable("cache", &status));

    let recoveries = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&recoveries);
    monitor.on_recovery("cache", move |_| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    monitor.check_now().await;
    assert_eq!(
        recoveries.load(Ordering::SeqCst),
        0,
        "First healthy result is not a recovery"
    );

    *status.lock().unwrap() = HealthStatus::Unhealthy;
    monitor.check_now().await;
    *status.lock().unwrap() = HealthStatus::Healthy;
    monitor.check_now().await;

    assert_eq!(recoveries.load(Ordering::SeqCst), 1);

    Ok(())
}

/// Test: Unhealthy results reach the failure handler with their streak length
#[tokio::test]
async fn test_failures_forwarded_to_handler() -> Result<()> {
    let monitor = HealthMonitor::new(Duration::from_secs(30));
    let status = Arc::new(Mutex::new(HealthStatus::Unhealthy));
    monitor.register_checker(switchable("payments", &status));

    let handler = Arc::new(RecordingHandler::default());
    monitor.set_failure_handler(handler.clone());

    monitor.check_now().await;
    monitor.check_service("payments").await;

    *status.lock().unwrap() = HealthStatus::Degraded;
    monitor.check_now().await;

    assert_eq!(
        *handler.calls.lock().unwrap(),
        vec![("payments".to_string(), 1), ("payments".to_string(), 2)]
    );

    Ok(())
}

/// Test: A panicking callback does not break monitoring
#[tokio::test]
async fn test_panicking_callback_is_contained() -> Result<()> {
    let monitor = HealthMonitor::new(Duration::from_secs(30));
    let status = Arc::new(Mutex::new(HealthStatus::Healthy));
    monitor.register_checker(switchable("search", &status));

    monitor.on_health_change(|_| async {
        panic!("callback exploded");
    });

    let results = monitor.check_now().await;
    assert_eq!(results.len(), 1);
    assert_eq!(
        monitor.service_health("search").map(|health| health.status),
        Some(HealthStatus::Healthy)
    );

    Ok(())
}

/// Test: The report aggregates every registered service
#[tokio::test]
async fn test_health_report() -> Result<()> {
    let monitor = HealthMonitor::new(Duration::from_secs(30));
    let healthy = Arc::new(Mutex::new(HealthStatus::Healthy));
    let degraded = Arc::new(Mutex::new(HealthStatus::Degraded));
    monitor.register_checker(switchable("api", &healthy));
    monitor.register_checker(switchable("search", &degraded));

    let report = monitor.health_report();
    assert_eq!(report.status, HealthStatus::Unknown);
    assert_eq!(report.summary.unknown, 2);

    monitor.check_now().await;
    let report = monitor.health_report();
    assert_eq!(report.status, HealthStatus::Degraded);
    assert_eq!(report.summary.healthy, 1);
    assert_eq!(report.summary.degraded, 1);
    assert_eq!(report.summary.total(), 2);

    *degraded.lock().unwrap() = HealthStatus::Unhealthy;
    monitor.check_service("search").await;
    assert_eq!(monitor.health_report().status, HealthStatus::Unhealthy);

    assert!(monitor.unregister_checker("search"));
    assert!(!monitor.unregister_checker("search"));
    assert!(monitor.check_service("search").await.is_none());
    assert_eq!(
        monitor.service_health("search").map(|health| health.status),
        Some(HealthStatus::Unhealthy),
        "Health history outlives the checker"
    );
    assert_eq!(monitor.health_report().summary.total(), 2);

    Ok(())
}

/// Test: The polling loop runs until stopped
#[tokio::test]
async fn test_start_and_stop() -> Result<()> {
    let monitor = Arc::new(HealthMonitor::new(Duration::from_millis(50)));

    let probes = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&probes);
    monitor.register_checker(Arc::new(CallbackHealthChecker::new("worker", move || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(ProbeOutcome::degraded("warming up"))
        }
    })));

    let handler = Arc::new(RecordingHandler::default());
    monitor.set_failure_handler(handler.clone());

    monitor.start();
    assert!(monitor.is_running());

    sleep(Duration::from_millis(220)).await;
    monitor.stop().await;
    assert!(!monitor.is_running());

    let observed = probes.load(Ordering::SeqCst);
    assert!(observed >= 2, "expected several polling cycles, saw {}", observed);

    sleep(Duration::from_millis(150)).await;
    assert_eq!(probes.load(Ordering::SeqCst), observed, "No checks after stop");

    assert!(
        handler.calls.lock().unwrap().is_empty(),
        "Degraded results are not forwarded"
    );
    assert_eq!(
        monitor.service_health("worker").map(|health| health.status),
        Some(HealthStatus::Degraded)
    );

    Ok(())
}

/// Test: A service with a recovery in progress is not dispatched again
#[tokio::test]
async fn test_one_recovery_task_per_service() -> Result<()> {
    let monitor = Arc::new(HealthMonitor::new(Duration::from_millis(50)));
    let down = Arc::new(Mutex::new(HealthStatus::Unhealthy));
    monitor.register_checker(switchable("billing", &down));
    monitor.register_checker(switchable("ledger", &down));

    let handler = Arc::new(SlowHandler::default());
    monitor.set_failure_handler(handler.clone());

    monitor.start();
    sleep(Duration::from_millis(250)).await;
    monitor.stop().await;

    assert_eq!(
        handler.started.load(Ordering::SeqCst),
        2,
        "One recovery per service while the first is still running"
    );
    assert!(
        monitor
            .service_health("billing")
            .is_some_and(|health| health.consecutive_failures >= 3)
    );

    Ok(())
}
