//! SQL Analysis Handlers - advisory linting of PostgreSQL queries

use axum::extract::{Json, State};
use std::sync::Arc;
use validator::Validate;

use crate::AppState;
use crate::models::{AnalysisRequest, BulkAnalysisItem, BulkAnalysisRequest, BulkAnalysisResponse};
// Referenced only inside `#[utoipa::path]` so the schema $ref resolves to `ErrorResponse`
#[allow(unused_imports)]
use crate::models::ErrorResponse;
use crate::services::sql_analyzer::{AnalysisResult, RuleDescriptor};
use crate::utils::error::ApiResult;

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/v1/analysis
#[utoipa::path(
    post,
    path = "/api/v1/analysis",
    request_body = AnalysisRequest,
    responses(
        (status = 200, description = "Diagnoses for the query", body = AnalysisResult),
        (status = 400, description = "Blank or malformed query", body = ErrorResponse),
        (status = 422, description = "The query could not be planned", body = ErrorResponse),
        (status = 500, description = "Internal error", body = ErrorResponse),
    ),
    tag = "Analysis"
)]
pub async fn analyze(
    State(s): State<Arc<AppState>>,
    Json(req): Json<AnalysisRequest>,
) -> ApiResult<Json<AnalysisResult>> {
    req.validate()?;
    let result = s.analyzer.analyze(&req.sql_query).await?;
    Ok(Json(result))
}

/// POST /api/v1/analysis/bulk
///
/// Every query is analyzed independently; a failing query only fails its own item.
#[utoipa::path(
    post,
    path = "/api/v1/analysis/bulk",
    request_body = BulkAnalysisRequest,
    responses(
        (status = 200, description = "One item per query, in request order", body = BulkAnalysisResponse),
        (status = 400, description = "Empty list or a blank query", body = ErrorResponse),
    ),
    tag = "Analysis"
)]
pub async fn analyze_bulk(
    State(s): State<Arc<AppState>>,
    Json(req): Json<BulkAnalysisRequest>,
) -> ApiResult<Json<BulkAnalysisResponse>> {
    req.validate()?;

    let results = s
        .analyzer
        .analyze_many(req.sql_query)
        .await
        .into_iter()
        .enumerate()
        .map(|(index, outcome)| match outcome {
            Ok(result) => BulkAnalysisItem::ok(index, result),
            Err(e) => BulkAnalysisItem::fail(index, e.to_string()),
        })
        .collect();

    Ok(Json(BulkAnalysisResponse { results }))
}

/// GET /api/v1/rules
#[utoipa::path(
    get,
    path = "/api/v1/rules",
    responses((status = 200, description = "Registered rules in evaluation order", body = Vec<RuleDescriptor>)),
    tag = "Analysis"
)]
pub async fn list_rules(State(s): State<Arc<AppState>>) -> Json<Vec<RuleDescriptor>> {
    Json(s.analyzer.rules())
}
