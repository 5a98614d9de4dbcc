use std::{future::Future, sync::Arc};

use anyhow::{Error, Result};
use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    clients::circuit_breaker::CircuitBreaker,
    models::{health::HealthStatus, response::ApiResponse},
    registry::Registry,
};

pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/circuits", get(list_circuits))
        .route("/circuits/{name}", get(get_circuit))
        .route("/circuits/{name}/open", post(open_circuit))
        .route("/circuits/{name}/close", post(close_circuit))
        .route("/circuits/{name}/reset", post(reset_circuit))
        .route("/recovery/stats", get(recovery_stats))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

pub async fn run_api_server<S>(registry: Arc<Registry>, port: u16, shutdown: S) -> Result<(), Error>
where
    S: Future<Output = ()> + Send + 'static,
{
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!(address = %addr, "Admin API server started");

    serve(listener, registry, shutdown).await
}

pub async fn serve<S>(listener: TcpListener, registry: Arc<Registry>, shutdown: S) -> Result<(), Error>
where
    S: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(registry))
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Admin API server stopped");
    Ok(())
}

async fn health_check(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let report = registry.monitor().health_report();

    let status_code = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded | HealthStatus::Unknown => StatusCode::OK,
    };

    let message = format!("Overall status: {}", report.status);
    (status_code, Json(ApiResponse::success(report, message)))
}

async fn list_circuits(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let mut circuits = Vec::new();
    for breaker in registry.circuits() {
        circuits.push(breaker.metrics().await);
    }

    let message = format!("{} circuit(s)", circuits.len());
    Json(ApiResponse::success(circuits, message))
}

fn circuit_not_found(name: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ApiResponse::<()>::error(
            "circuit_not_found",
            format!("No circuit named '{}'", name),
        )),
    )
        .into_response()
}

fn lookup(registry: &Registry, name: &str) -> Result<Arc<CircuitBreaker>, Response> {
    registry.circuit(name).ok_or_else(|| circuit_not_found(name))
}

async fn get_circuit(State(registry): State<Arc<Registry>>, Path(name): Path<String>) -> Response {
    let breaker = match lookup(&registry, &name) {
        Ok(breaker) => breaker,
        Err(response) => return response,
    };

    Json(ApiResponse::success(breaker.metrics().await, "Circuit metrics")).into_response()
}

async fn open_circuit(State(registry): State<Arc<Registry>>, Path(name): Path<String>) -> Response {
    let breaker = match lookup(&registry, &name) {
        Ok(breaker) => breaker,
        Err(response) => return response,
    };

    breaker.force_open().await;
    Json(ApiResponse::success(breaker.metrics().await, "Circuit opened")).into_response()
}

async fn close_circuit(State(registry): State<Arc<Registry>>, Path(name): Path<String>) -> Response {
    let breaker = match lookup(&registry, &name) {
        Ok(breaker) => breaker,
        Err(response) => return response,
    };

    breaker.force_close().await;
    Json(ApiResponse::success(breaker.metrics().await, "Circuit closed")).into_response()
}

async fn reset_circuit(State(registry): State<Arc<Registry>>, Path(name): Path<String>) -> Response {
    let breaker = match lookup(&registry, &name) {
        Ok(breaker) => breaker,
        Err(response) => return response,
    };

    breaker.reset().await;
    Json(ApiResponse::success(breaker.metrics().await, "Circuit reset")).into_response()
}

async fn recovery_stats(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    Json(ApiResponse::success(
        registry.recovery().recovery_stats(),
        "Recovery statistics",
    ))
}

async fn status(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    Json(ApiResponse::success(registry.status().await, "Registry status"))
}
