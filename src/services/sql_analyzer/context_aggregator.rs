//! Context aggregation
//!
//! Five read-only statistics queries run concurrently. A failing category is logged and
//! left empty so rules depending on the other categories still run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use super::context::{
    ActivityEntry, AnalysisContext, ContextCategory, IndexStats, IoStats, SettingValue, TableStats,
    qualified_name,
};

const SETTINGS_QUERY: &str = "SELECT name, setting, unit, context FROM pg_settings";

const TABLE_STATS_QUERY: &str = r#"
SELECT schemaname::text AS schemaname,
       relname::text AS relname,
       COALESCE(n_live_tup, 0) AS n_live_tup,
       COALESCE(n_dead_tup, 0) AS n_dead_tup,
       COALESCE(n_mod_since_analyze, 0) AS n_mod_since_analyze,
       last_analyze,
       last_autoanalyze,
       pg_size_pretty(pg_total_relation_size(relid)) AS total_size,
       pg_size_pretty(pg_relation_size(relid)) AS table_size
FROM pg_stat_user_tables
ORDER BY schemaname, relname
"#;

const INDEX_STATS_QUERY: &str = r#"
SELECT schemaname::text AS schemaname,
       relname::text AS relname,
       indexrelname::text AS indexrelname,
       COALESCE(idx_scan, 0) AS idx_scan,
       COALESCE(idx_tup_read, 0) AS idx_tup_read,
       COALESCE(idx_tup_fetch, 0) AS idx_tup_fetch,
       pg_size_pretty(pg_relation_size(indexrelid)) AS index_size
FROM pg_stat_user_indexes
ORDER BY schemaname, relname, indexrelname
"#;

const IO_STATS_QUERY: &str = r#"
SELECT schemaname::text AS schemaname,
       relname::text AS relname,
       COALESCE(heap_blks_read, 0) AS heap_blks_read,
       COALESCE(heap_blks_hit, 0) AS heap_blks_hit,
       COALESCE(idx_blks_read, 0) AS idx_blks_read,
       COALESCE(idx_blks_hit, 0) AS idx_blks_hit
FROM pg_statio_user_tables
"#;

// LEFT() length is QUERY_PREVIEW_LEN
const ACTIVITY_QUERY: &str = r#"
SELECT pid,
       usename::text AS usename,
       application_name,
       client_addr::text AS client_addr,
       query_start,
       state,
       LEFT(query, 100) AS query_preview
FROM pg_stat_activity
WHERE datname = current_database() AND state = 'active'
ORDER BY pid
"#;

/// Error from one statistics category
#[derive(Debug, Error)]
pub enum ContextFetchError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Statistics unavailable: {0}")]
    Unavailable(String),
}

/// Source of the five statistics categories
#[async_trait]
pub trait StatisticsSource: Send + Sync {
    async fn fetch_settings(&self) -> Result<BTreeMap<String, SettingValue>, ContextFetchError>;
    async fn fetch_table_stats(&self) -> Result<BTreeMap<String, TableStats>, ContextFetchError>;
    async fn fetch_index_stats(&self) -> Result<Vec<IndexStats>, ContextFetchError>;
    async fn fetch_io_stats(&self) -> Result<BTreeMap<String, IoStats>, ContextFetchError>;
    async fn fetch_activity(&self) -> Result<Vec<ActivityEntry>, ContextFetchError>;
}

// ============================================================================
// PostgreSQL statistics source
// ============================================================================

#[derive(sqlx::FromRow)]
struct SettingRow {
    name: String,
    setting: Option<String>,
    unit: Option<String>,
    context: String,
}

#[derive(sqlx::FromRow)]
struct TableStatsRow {
    schemaname: String,
    relname: String,
    n_live_tup: i64,
    n_dead_tup: i64,
    n_mod_since_analyze: i64,
    last_analyze: Option<DateTime<Utc>>,
    last_autoanalyze: Option<DateTime<Utc>>,
    total_size: String,
    table_size: String,
}

#[derive(sqlx::FromRow)]
struct IndexStatsRow {
    schemaname: String,
    relname: String,
    indexrelname: String,
    idx_scan: i64,
    idx_tup_read: i64,
    idx_tup_fetch: i64,
    index_size: String,
}

#[derive(sqlx::FromRow)]
struct IoStatsRow {
    schemaname: String,
    relname: String,
    heap_blks_read: i64,
    heap_blks_hit: i64,
    idx_blks_read: i64,
    idx_blks_hit: i64,
}

#[derive(sqlx::FromRow)]
struct ActivityRow {
    pid: i32,
    usename: Option<String>,
    application_name: Option<String>,
    client_addr: Option<String>,
    query_start: Option<DateTime<Utc>>,
    state: Option<String>,
    query_preview: Option<String>,
}

/// Reads statistics from the PostgreSQL system views
pub struct PgStatisticsSource {
    pool: PgPool,
}

impl PgStatisticsSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StatisticsSource for PgStatisticsSource {
    async fn fetch_settings(&self) -> Result<BTreeMap<String, SettingValue>, ContextFetchError> {
        let rows: Vec<SettingRow> = sqlx::query_as(SETTINGS_QUERY).fetch_all(&self.pool).await?;
        // pg_settings is never empty for a role allowed to read it
        if rows.is_empty() {
            return Err(ContextFetchError::Unavailable("pg_settings returned no rows".to_string()));
        }
        Ok(rows
            .into_iter()
            .map(|row| {
                let value = SettingValue {
                    value: row.setting.unwrap_or_default(),
                    unit: row.unit,
                    scope: row.context,
                };
                (row.name, value)
            })
            .collect())
    }

    async fn fetch_table_stats(&self) -> Result<BTreeMap<String, TableStats>, ContextFetchError> {
        let rows: Vec<TableStatsRow> = sqlx::query_as(TABLE_STATS_QUERY).fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let stats = TableStats {
                    live_rows: row.n_live_tup,
                    dead_rows: row.n_dead_tup,
                    mods_since_analyze: row.n_mod_since_analyze,
                    last_analyze: row.last_analyze,
                    last_autoanalyze: row.last_autoanalyze,
                    total_size: row.total_size,
                    table_size: row.table_size,
                };
                (qualified_name(&row.schemaname, &row.relname), stats)
            })
            .collect())
    }

    async fn fetch_index_stats(&self) -> Result<Vec<IndexStats>, ContextFetchError> {
        let rows: Vec<IndexStatsRow> = sqlx::query_as(INDEX_STATS_QUERY).fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| IndexStats {
                schema: row.schemaname,
                table: row.relname,
                index: row.indexrelname,
                scans: row.idx_scan,
                tuples_read: row.idx_tup_read,
                tuples_fetched: row.idx_tup_fetch,
                size: row.index_size,
            })
            .collect())
    }

    async fn fetch_io_stats(&self) -> Result<BTreeMap<String, IoStats>, ContextFetchError> {
        let rows: Vec<IoStatsRow> = sqlx::query_as(IO_STATS_QUERY).fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let io = IoStats {
                    heap_blocks_read: row.heap_blks_read,
                    heap_blocks_hit: row.heap_blks_hit,
                    index_blocks_read: row.idx_blks_read,
                    index_blocks_hit: row.idx_blks_hit,
                };
                (qualified_name(&row.schemaname, &row.relname), io)
            })
            .collect())
    }

    async fn fetch_activity(&self) -> Result<Vec<ActivityEntry>, ContextFetchError> {
        let rows: Vec<ActivityRow> = sqlx::query_as(ACTIVITY_QUERY).fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| ActivityEntry {
                pid: row.pid,
                user: row.usename,
                app_name: row.application_name,
                client_addr: row.client_addr,
                query_start: row.query_start,
                state: row.state,
                query_preview: row.query_preview.unwrap_or_default(),
            })
            .collect())
    }
}

// ============================================================================
// Aggregator
// ============================================================================

/// Merges the five categories into one [`AnalysisContext`]
#[derive(Clone)]
pub struct ContextAggregator {
    source: Arc<dyn StatisticsSource>,
}

impl ContextAggregator {
    pub fn new(source: Arc<dyn StatisticsSource>) -> Self {
        Self { source }
    }

    /// Never fails: a category whose fetch fails is left empty and listed in `degraded`
    pub async fn get_context(&self) -> AnalysisContext {
        let captured_at = Utc::now();
        let (settings, table_stats, index_stats, io_stats, activity) = tokio::join!(
            self.source.fetch_settings(),
            self.source.fetch_table_stats(),
            self.source.fetch_index_stats(),
            self.source.fetch_io_stats(),
            self.source.fetch_activity(),
        );

        let mut degraded = Vec::new();
        let context = AnalysisContext {
            settings: or_empty(ContextCategory::Settings, settings, &mut degraded),
            table_stats: or_empty(ContextCategory::TableStats, table_stats, &mut degraded),
            index_stats: or_empty(ContextCategory::IndexStats, index_stats, &mut degraded),
            io_stats: or_empty(ContextCategory::IoStats, io_stats, &mut degraded),
            activity: or_empty(ContextCategory::Activity, activity, &mut degraded),
            captured_at,
            degraded,
        };

        tracing::debug!(
            settings = context.settings.len(),
            tables = context.table_stats.len(),
            indexes = context.index_stats.len(),
            io = context.io_stats.len(),
            activity = context.activity.len(),
            degraded = context.degraded.len(),
            "Analysis context collected"
        );
        context
    }
}

fn or_empty<T: Default>(
    category: ContextCategory,
    result: Result<T, ContextFetchError>,
    degraded: &mut Vec<ContextCategory>,
) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(category = %category, error = %e, "Statistics fetch failed, category left empty");
            degraded.push(category);
            T::default()
        },
    }
}
