//! Health check handlers

use axum::{extract::State, Json};
use serde::Serialize;
use std::future::Future;
use std::time::Instant;

use crate::AppState;
use askforge_common::errors::Result;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<CheckResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<CheckResult>,
}

#[derive(Serialize)]
pub struct CheckResult {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckResult {
    fn is_up(&self) -> bool {
        self.status == "up"
    }
}

async fn check(ping: impl Future<Output = Result<()>>) -> CheckResult {
    let start = Instant::now();
    match ping.await {
        Ok(()) => CheckResult {
            status: "up".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
            error: None,
        },
        Err(e) => CheckResult {
            status: "down".to_string(),
            latency_ms: None,
            error: Some(e.to_string()),
        },
    }
}

/// Liveness check - always returns healthy if server is running
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: askforge_common::VERSION,
    })
}

/// Readiness check - checks the configured backing services
pub async fn ready(State(state): State<AppState>) -> Json<ReadyResponse> {
    let database = match &state.db {
        Some(db) => Some(check(db.ping()).await),
        None => None,
    };
    let redis = match &state.cache {
        Some(cache) => Some(check(cache.ping()).await),
        None => None,
    };

    let all_healthy = database.iter().chain(redis.iter()).all(CheckResult::is_up);

    Json(ReadyResponse {
        status: if all_healthy { "ready" } else { "not_ready" }.to_string(),
        checks: HealthChecks { database, redis },
    })
}
