//! SQL Advisor Library
//!
//! Advisory linting for PostgreSQL queries: a rule catalog evaluated against the query
//! text, its estimated plan and live database statistics, served over HTTP.

use sqlx::PgPool;
use std::sync::Arc;

pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod router;
pub mod services;
pub mod utils;

pub use config::Config;
pub use services::sql_analyzer::{AnalysisResult, Diagnose, Severity, SqlAnalyzer, init_catalog};
pub use utils::{ApiError, ApiResult};

/// Application shared state
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub analyzer: Arc<SqlAnalyzer>,
}
