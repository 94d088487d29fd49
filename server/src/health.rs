use std::sync::Arc;
use std::time::SystemTime;

use axum::{extract::FromRef, extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use crate::db::{self, Db};
use crate::models::{AdminLog, SystemLog};
use crate::scheduler::{QueueManager, QueueStats};
use crate::settings::Settings;

/// Composite state for the admin router.
#[derive(Clone, FromRef)]
pub struct AppState {
    pub db: Db,
    pub queue: Arc<QueueManager>,
    pub settings: Settings,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    timestamp: u64,
    version: String,
    checks: HealthChecks,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    database: CheckStatus,
    queue: QueueStats,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    ready: bool,
}

/// Liveness probe - checks if the application is running
pub async fn liveness() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// Readiness probe - the service is ready once the database answers.
pub async fn readiness(State(db): State<Db>) -> (StatusCode, Json<ReadinessResponse>) {
    let ready = check_database(&db).await;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ReadinessResponse { ready }))
}

/// Health endpoint - database connectivity plus queue statistics.
pub async fn health(
    State(db): State<Db>,
    State(queue): State<Arc<QueueManager>>,
) -> (StatusCode, Json<HealthResponse>) {
    let db_healthy = check_database(&db).await;
    let queue_stats = queue.stats().await.unwrap_or_default();

    let status = if db_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let timestamp = match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_secs(),
        Err(_) => 0,
    };

    (
        status,
        Json(HealthResponse {
            status: if db_healthy { "healthy" } else { "unhealthy" }.to_string(),
            timestamp,
            version: env!("CARGO_PKG_VERSION").to_string(),
            checks: HealthChecks {
                database: if db_healthy {
                    CheckStatus::Healthy
                } else {
                    CheckStatus::Unhealthy
                },
                queue: queue_stats,
            },
        }),
    )
}

/// Queue statistics for operators.
pub async fn queue_stats(
    State(queue): State<Arc<QueueManager>>,
) -> Result<Json<QueueStats>, StatusCode> {
    queue
        .stats()
        .await
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Most recent system log entries, newest first.
pub async fn system_logs(State(db): State<Db>) -> Result<Json<Vec<SystemLog>>, StatusCode> {
    db::recent_system_logs(&db, 100)
        .await
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Most recent administrative actions, newest first.
pub async fn admin_logs(State(db): State<Db>) -> Result<Json<Vec<AdminLog>>, StatusCode> {
    db::recent_admin_logs(&db, 100)
        .await
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[derive(Debug, Deserialize)]
pub struct AutoDeleteUpdate {
    pub enabled: bool,
}

/// Toggle automatic deletion of players past the non-existence threshold.
/// The change is recorded in the admin log.
pub async fn set_auto_delete(
    State(db): State<Db>,
    State(settings): State<Settings>,
    Json(update): Json<AutoDeleteUpdate>,
) -> Result<StatusCode, StatusCode> {
    settings
        .set_auto_delete(update.enabled)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let _ = db::insert_admin_log(
        &db,
        "admin-api",
        "set_auto_delete",
        if update.enabled { "enabled" } else { "disabled" },
    )
    .await;
    Ok(StatusCode::NO_CONTENT)
}

async fn check_database(db: &Db) -> bool {
    sqlx::query("SELECT 1").execute(db.reader()).await.is_ok()
}
