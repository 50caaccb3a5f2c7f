use axum::extract::{Json, State};
use std::sync::Arc;

use crate::AppState;
use crate::models::HealthResponse;

/// GET /health
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service and database status", body = HealthResponse)),
    tag = "System"
)]
pub async fn health_check(State(s): State<Arc<AppState>>) -> Json<HealthResponse> {
    let db_status = match sqlx::query("SELECT 1").execute(&s.db).await {
        Ok(_) => "ok",
        Err(e) => {
            tracing::warn!("Database health check failed: {}", e);
            "unavailable"
        },
    };

    Json(HealthResponse { api_status: "ok".to_string(), db_status: db_status.to_string() })
}
