use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use utoipa::ToSchema;
use validator::{Validate, ValidationError};

use crate::services::sql_analyzer::AnalysisResult;

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct AnalysisRequest {
    /// SQL text to analyze. Only the first statement is planned.
    #[validate(custom(function = "validate_sql_query"))]
    pub sql_query: String,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct BulkAnalysisRequest {
    #[validate(
        length(min = 1, message = "sql_query must contain at least one query"),
        custom(function = "validate_sql_queries")
    )]
    pub sql_query: Vec<String>,
}

/// One entry of a bulk response, in request order
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BulkAnalysisItem {
    pub index: usize,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<AnalysisResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BulkAnalysisItem {
    pub fn ok(index: usize, result: AnalysisResult) -> Self {
        Self { index, ok: true, result: Some(result), error: None }
    }

    pub fn fail(index: usize, error: impl Into<String>) -> Self {
        Self { index, ok: false, result: None, error: Some(error.into()) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BulkAnalysisResponse {
    pub results: Vec<BulkAnalysisItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub api_status: String,
    pub db_status: String,
}

/// Error body of every non-2xx response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub code: u16,
    pub message: String,
}

fn validate_sql_query(sql_query: &str) -> Result<(), ValidationError> {
    if sql_query.trim().is_empty() {
        let mut error = ValidationError::new("blank_query");
        error.message = Some(Cow::Borrowed("sql_query must not be empty"));
        return Err(error);
    }
    Ok(())
}

fn validate_sql_queries(sql_queries: &[String]) -> Result<(), ValidationError> {
    if let Some(index) = sql_queries.iter().position(|q| q.trim().is_empty()) {
        let mut error = ValidationError::new("blank_query");
        error.message = Some(Cow::Owned(format!("sql_query[{}] must not be empty", index)));
        return Err(error);
    }
    Ok(())
}
