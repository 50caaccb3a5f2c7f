use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::services::sql_analyzer;
use crate::{AppState, handlers, models};

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::analysis::analyze,
        handlers::analysis::analyze_bulk,
        handlers::analysis::list_rules,
        handlers::health::health_check,
    ),
    components(
        schemas(
            models::AnalysisRequest,
            models::BulkAnalysisRequest,
            models::BulkAnalysisItem,
            models::BulkAnalysisResponse,
            models::HealthResponse,
            models::ErrorResponse,
            sql_analyzer::AnalysisResult,
            sql_analyzer::Diagnose,
            sql_analyzer::Severity,
            sql_analyzer::RuleDescriptor,
        )
    ),
    tags(
        (name = "Analysis", description = "SQL query linting"),
        (name = "System", description = "Service health"),
    )
)]
pub struct ApiDoc;

/// Build the application router with docs, tracing and CORS layers
pub fn app_router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        .route("/api/v1/analysis", post(handlers::analysis::analyze))
        .route("/api/v1/analysis/bulk", post(handlers::analysis::analyze_bulk))
        .route("/api/v1/rules", get(handlers::analysis::list_rules))
        .route("/health", get(handlers::health::health_check))
        .with_state(state);

    Router::new()
        .merge(SwaggerUi::new("/api-docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_routes)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
}
