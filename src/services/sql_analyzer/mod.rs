//! PostgreSQL SQL Analyzer
//!
//! Advisory linting of SQL text against its estimated execution plan and a snapshot of
//! database statistics.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         SqlAnalyzer                          │
//! │                          analyze()                           │
//! │                              │                               │
//! │            ┌─────────────────┴─────────────────┐             │
//! │            ▼ (concurrent)                      ▼             │
//! │   ┌────────────────┐               ┌────────────────────┐    │
//! │   │  PlanProvider  │               │ ContextAggregator  │    │
//! │   │ EXPLAIN (JSON) │               │ settings / tables  │    │
//! │   └────────────────┘               │ indexes / io / act │    │
//! │            │                       └────────────────────┘    │
//! │            └─────────────────┬─────────────────┘             │
//! │                              ▼                               │
//! │                 ┌──────────────────────────┐                 │
//! │                 │ RuleExecutor(RuleCatalog)│                 │
//! │                 └──────────────────────────┘                 │
//! │                              ▼                               │
//! │            ResultAggregator  →  Summarizer (optional)        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let analyzer = SqlAnalyzer::from_pool(pool, Arc::new(init_catalog()), &config.analysis);
//! let result = analyzer.analyze("SELECT * FROM orders").await?;
//! for d in &result.diagnoses {
//!     println!("{}:{} [{}] {}", d.line, d.col, d.severity, d.message);
//! }
//! ```

pub mod analyzer;
pub mod context;
pub mod context_aggregator;
pub mod models;
pub mod plan;
pub mod plan_provider;
pub mod summary;

#[cfg(test)]
mod tests;

pub use analyzer::{
    LintRule, RuleCatalog, RuleDescriptor, RuleEngineConfig, RuleError, RuleExecutor,
    init_catalog,
};
pub use context::AnalysisContext;
pub use context_aggregator::{
    ContextAggregator, ContextFetchError, PgStatisticsSource, StatisticsSource,
};
pub use models::{AnalysisResult, Diagnose, Severity};
pub use plan::{ExecutionPlanNode, PlanRetrievalError};
pub use plan_provider::{PgPlanProvider, PlanProvider};
pub use summary::{ResultAggregator, SeverityBreakdownSummarizer, Summarizer};

use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::AnalysisConfig;

/// Analysis-fatal errors. Everything else degrades.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Plan retrieval failed: {0}")]
    Plan(#[from] PlanRetrievalError),

    #[error("Analysis task failed: {0}")]
    Internal(String),
}

/// Orchestrates plan retrieval, context aggregation and rule execution
pub struct SqlAnalyzer {
    plan_provider: Arc<dyn PlanProvider>,
    context_aggregator: ContextAggregator,
    executor: Arc<RuleExecutor>,
    summarizer: Option<Arc<dyn Summarizer>>,
    bulk_concurrency: usize,
}

impl SqlAnalyzer {
    pub fn new(
        plan_provider: Arc<dyn PlanProvider>,
        context_aggregator: ContextAggregator,
        executor: RuleExecutor,
    ) -> Self {
        Self {
            plan_provider,
            context_aggregator,
            executor: Arc::new(executor),
            summarizer: None,
            bulk_concurrency: 4,
        }
    }

    /// Wire the PostgreSQL providers and apply the `[analysis]` settings
    pub fn from_pool(pool: PgPool, catalog: Arc<RuleCatalog>, config: &AnalysisConfig) -> Self {
        let executor = RuleExecutor::with_config(
            catalog,
            RuleEngineConfig {
                enable_rewrites: config.enable_rewrites,
                parallel: config.parallel_rules,
            },
        );
        let aggregator = ContextAggregator::new(Arc::new(PgStatisticsSource::new(pool.clone())));
        let analyzer = Self::new(Arc::new(PgPlanProvider::new(pool)), aggregator, executor)
            .with_bulk_concurrency(config.bulk_concurrency);

        if config.summary {
            analyzer.with_summarizer(Arc::new(SeverityBreakdownSummarizer))
        } else {
            analyzer
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_bulk_concurrency(mut self, limit: usize) -> Self {
        self.bulk_concurrency = limit.max(1);
        self
    }

    /// Registered rules in catalog order
    pub fn rules(&self) -> Vec<RuleDescriptor> {
        self.executor.catalog().descriptors()
    }

    /// Analyze one query
    pub async fn analyze(&self, query: &str) -> Result<AnalysisResult, AnalysisError> {
        self.analyze_in(query, None).await
    }

    /// Analyze against `context` when given, otherwise against a freshly fetched one
    async fn analyze_in(
        &self,
        query: &str,
        context: Option<Arc<AnalysisContext>>,
    ) -> Result<AnalysisResult, AnalysisError> {
        if query.trim().is_empty() {
            return Err(AnalysisError::InvalidQuery("sql_query must not be empty".to_string()));
        }

        let span = tracing::info_span!("analysis", id = %Uuid::new_v4());
        self.run_analysis(query.to_string(), context).instrument(span).await
    }

    async fn run_analysis(
        &self,
        query: String,
        shared: Option<Arc<AnalysisContext>>,
    ) -> Result<AnalysisResult, AnalysisError> {
        let (plan, context) = match shared {
            Some(context) => (self.plan_provider.get_plan(&query).await, context),
            None => {
                let (plan, context) = tokio::join!(
                    self.plan_provider.get_plan(&query),
                    self.context_aggregator.get_context()
                );
                (plan, Arc::new(context))
            },
        };
        let plan = plan.inspect_err(|e| tracing::warn!(error = %e, "Plan retrieval failed"))?;
        let degraded = context.degraded.clone();

        // Rules are CPU-bound and fan out on rayon
        let executor = Arc::clone(&self.executor);
        let input = query.clone();
        let report =
            tokio::task::spawn_blocking(move || executor.run(&input, Some(&plan), Some(context.as_ref())))
                .await
                .map_err(|e| AnalysisError::Internal(e.to_string()))?;

        let mut result = ResultAggregator::build(report.diagnoses, None);
        if report.final_query != query {
            result.rewritten_query = Some(report.final_query);
        }
        if let Some(summarizer) = &self.summarizer {
            result.summary = summarizer.summarize(&result);
        }

        tracing::info!(
            diagnoses = result.diagnoses.len(),
            rule_failures = report.failures.len(),
            degraded = ?degraded,
            rewritten = result.rewritten_query.is_some(),
            "Analysis completed"
        );
        Ok(result)
    }

    /// Analyze a batch. Each query is an independent task; results keep input order.
    ///
    /// The statistics snapshot is fetched once and shared by the whole batch, so each
    /// task only holds a connection for its own plan.
    pub async fn analyze_many(
        self: &Arc<Self>,
        queries: Vec<String>,
    ) -> Vec<Result<AnalysisResult, AnalysisError>> {
        if queries.is_empty() {
            return Vec::new();
        }
        let semaphore = Arc::new(Semaphore::new(self.bulk_concurrency));
        tracing::info!(queries = queries.len(), concurrency = self.bulk_concurrency, "Bulk analysis started");
        let context = Arc::new(self.context_aggregator.get_context().await);

        let handles: Vec<_> = queries
            .into_iter()
            .map(|query| {
                let analyzer = Arc::clone(self);
                let semaphore = Arc::clone(&semaphore);
                let context = Arc::clone(&context);
                tokio::spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|e| AnalysisError::Internal(e.to_string()))?;
                    analyzer.analyze_in(&query, Some(context)).await
                })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await.unwrap_or_else(|e| Err(AnalysisError::Internal(e.to_string()))));
        }
        results
    }
}
