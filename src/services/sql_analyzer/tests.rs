//! Scenario tests for the analysis pipeline, run against in-memory providers

#[cfg(test)]
mod support {
    use crate::services::sql_analyzer::context::*;
    use crate::services::sql_analyzer::context_aggregator::*;
    use crate::services::sql_analyzer::*;
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves canned plans by exact query text
    #[derive(Default)]
    pub struct StaticPlans {
        plans: HashMap<String, ExecutionPlanNode>,
    }

    impl StaticPlans {
        pub fn with(mut self, query: &str, plan: ExecutionPlanNode) -> Self {
            self.plans.insert(query.to_string(), plan);
            self
        }
    }

    #[async_trait]
    impl PlanProvider for StaticPlans {
        async fn get_plan(&self, query: &str) -> Result<ExecutionPlanNode, PlanRetrievalError> {
            self.plans.get(query).cloned().ok_or(PlanRetrievalError::MissingPlan)
        }
    }

    /// In-memory statistics with per-category failure injection
    #[derive(Default, Clone)]
    pub struct StaticStats {
        pub settings: BTreeMap<String, SettingValue>,
        pub tables: BTreeMap<String, TableStats>,
        pub indexes: Vec<IndexStats>,
        pub io: BTreeMap<String, IoStats>,
        pub activity: Vec<ActivityEntry>,
        pub failing: Vec<ContextCategory>,
        /// Number of snapshots taken, counted on the settings fetch
        pub snapshots: Arc<AtomicUsize>,
    }

    impl StaticStats {
        fn check(&self, category: ContextCategory) -> Result<(), ContextFetchError> {
            if self.failing.contains(&category) {
                return Err(ContextFetchError::Unavailable(format!("{} view unreadable", category)));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl StatisticsSource for StaticStats {
        async fn fetch_settings(&self) -> Result<BTreeMap<String, SettingValue>, ContextFetchError> {
            self.snapshots.fetch_add(1, Ordering::SeqCst);
            self.check(ContextCategory::Settings)?;
            Ok(self.settings.clone())
        }
        async fn fetch_table_stats(&self) -> Result<BTreeMap<String, TableStats>, ContextFetchError> {
            self.check(ContextCategory::TableStats)?;
            Ok(self.tables.clone())
        }
        async fn fetch_index_stats(&self) -> Result<Vec<IndexStats>, ContextFetchError> {
            self.check(ContextCategory::IndexStats)?;
            Ok(self.indexes.clone())
        }
        async fn fetch_io_stats(&self) -> Result<BTreeMap<String, IoStats>, ContextFetchError> {
            self.check(ContextCategory::IoStats)?;
            Ok(self.io.clone())
        }
        async fn fetch_activity(&self) -> Result<Vec<ActivityEntry>, ContextFetchError> {
            self.check(ContextCategory::Activity)?;
            Ok(self.activity.clone())
        }
    }

    pub fn analyzer(plans: StaticPlans, stats: StaticStats) -> SqlAnalyzer {
        SqlAnalyzer::new(
            Arc::new(plans),
            ContextAggregator::new(Arc::new(stats)),
            RuleExecutor::new(Arc::new(init_catalog())),
        )
    }
}

#[cfg(test)]
mod pipeline_tests {
    use super::support::*;
    use crate::services::sql_analyzer::context::*;
    use crate::services::sql_analyzer::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn orders_stats() -> StaticStats {
        let mut stats = StaticStats::default();
        stats.tables.insert(
            "orders".to_string(),
            TableStats {
                live_rows: 250_000,
                dead_rows: 100,
                total_size: "2 GB".to_string(),
                table_size: "2 GB".to_string(),
                ..Default::default()
            },
        );
        stats
    }

    #[tokio::test]
    async fn test_seq_scan_on_large_table() {
        let query = "SELECT * FROM orders";
        let plan = ExecutionPlanNode::new("Seq Scan").with_relation("orders").with_cost(15000.0).with_rows(250_000);
        let analyzer = analyzer(StaticPlans::default().with(query, plan), orders_stats());

        let result = analyzer.analyze(query).await.unwrap();

        assert!(
            result
                .diagnoses
                .iter()
                .any(|d| d.severity == Severity::High && d.message.contains("orders")),
            "expected a HIGH diagnosis naming orders: {:#?}",
            result.diagnoses
        );
        let star = result.diagnoses.iter().find(|d| d.rule_id == "select_star").unwrap();
        assert_eq!(star.severity, Severity::Medium);
        assert_eq!((star.line, star.col), (1, 8));
        assert!(result.rewritten_query.is_none());
    }

    #[tokio::test]
    async fn test_scale_factor_above_range() {
        let query = "SELECT id FROM accounts WHERE id = 7";
        let mut stats = StaticStats::default();
        stats.settings.insert(
            "autovacuum_vacuum_scale_factor".to_string(),
            SettingValue::new("0.5", None),
        );
        let analyzer =
            analyzer(StaticPlans::default().with(query, ExecutionPlanNode::default()), stats);

        let result = analyzer.analyze(query).await.unwrap();

        assert_eq!(result.diagnoses.len(), 1, "{:#?}", result.diagnoses);
        let diagnose = &result.diagnoses[0];
        assert_eq!(diagnose.severity, Severity::Low);
        assert!(diagnose.recommendation.contains("Decrease autovacuum_vacuum_scale_factor to 0.1-0.2"));
    }

    #[tokio::test]
    async fn test_cross_join_is_one_high_and_query_unchanged() {
        let query = "SELECT a.id, b.name FROM a CROSS JOIN b";
        let analyzer = analyzer(
            StaticPlans::default().with(query, ExecutionPlanNode::default()),
            StaticStats::default(),
        );

        let result = analyzer.analyze(query).await.unwrap();

        assert_eq!(result.diagnoses.len(), 1, "{:#?}", result.diagnoses);
        assert_eq!(result.diagnoses[0].severity, Severity::High);
        assert_eq!(result.diagnoses[0].rule_id, "hard_joins");
        assert_eq!(result.rewritten_query, None);
    }

    #[tokio::test]
    async fn test_blank_query_is_rejected() {
        let analyzer = analyzer(StaticPlans::default(), StaticStats::default());
        let err = analyzer.analyze("   \n").await.unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidQuery(_)));
    }

    #[tokio::test]
    async fn test_plan_failure_is_fatal() {
        let analyzer = analyzer(StaticPlans::default(), orders_stats());
        let err = analyzer.analyze("SELECT 1").await.unwrap_err();
        assert!(matches!(err, AnalysisError::Plan(PlanRetrievalError::MissingPlan)));
    }

    #[tokio::test]
    async fn test_analysis_is_deterministic() {
        let query = "SELECT * FROM orders o JOIN items i ON i.order_id = o.id ORDER BY o.id";
        let plan = ExecutionPlanNode::new("Sort")
            .with_cost(20000.0)
            .with_rows(50_000)
            .with_child(
                ExecutionPlanNode::new("Nested Loop")
                    .with_rows(50_000)
                    .with_child(ExecutionPlanNode::new("Seq Scan").with_relation("orders").with_rows(250_000))
                    .with_child(ExecutionPlanNode::new("Index Scan").with_relation("items").with_index("items_order_idx")),
            );
        let analyzer = analyzer(StaticPlans::default().with(query, plan), orders_stats());

        let first = analyzer.analyze(query).await.unwrap();
        let second = analyzer.analyze(query).await.unwrap();
        assert_eq!(first, second);
        assert!(!first.diagnoses.is_empty());
    }

    #[tokio::test]
    async fn test_rewrite_is_reported() {
        let query = "SELECT name FROM users WHERE id = 1; SELECT name FROM users WHERE id = 2";
        let analyzer = analyzer(
            StaticPlans::default().with(query, ExecutionPlanNode::default()),
            StaticStats::default(),
        );

        let result = analyzer.analyze(query).await.unwrap();

        assert_eq!(
            result.rewritten_query.as_deref(),
            Some("SELECT name FROM users WHERE id IN (1, 2)")
        );
        assert!(result.diagnoses.iter().any(|d| d.rule_id == "n_plus_one" && d.severity == Severity::High));
    }

    #[tokio::test]
    async fn test_summary_is_attached() {
        let query = "SELECT a.id, b.name FROM a CROSS JOIN b";
        let analyzer = analyzer(
            StaticPlans::default().with(query, ExecutionPlanNode::default()),
            StaticStats::default(),
        )
        .with_summarizer(Arc::new(SeverityBreakdownSummarizer));

        let result = analyzer.analyze(query).await.unwrap();
        let summary = result.summary.unwrap();
        assert!(summary.starts_with("Analysis summary: 1 issue(s) found (1 high, 0 medium, 0 low)."));
    }

    #[test]
    fn test_catalog_descriptors_follow_registration_order() {
        let analyzer = analyzer(StaticPlans::default(), StaticStats::default());
        let rules = analyzer.rules();
        assert_eq!(rules.len(), 21);
        assert_eq!(rules[0].id, "select_star");
        assert!(rules.iter().any(|r| r.id == "n_plus_one" && r.rewrites));
    }
}

#[cfg(test)]
mod bulk_tests {
    use super::support::*;
    use crate::services::sql_analyzer::*;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_failed_plan_only_fails_its_item() {
        let plans = StaticPlans::default()
            .with("SELECT * FROM a", ExecutionPlanNode::new("Seq Scan").with_relation("a"))
            .with("SELECT id FROM c", ExecutionPlanNode::new("Seq Scan").with_relation("c"));
        let analyzer = Arc::new(analyzer(plans, StaticStats::default()).with_bulk_concurrency(2));

        let results = analyzer
            .analyze_many(vec![
                "SELECT * FROM a".to_string(),
                "SELECT * FROM b".to_string(),
                "SELECT id FROM c".to_string(),
            ])
            .await;

        assert_eq!(results.len(), 3);
        let first = results[0].as_ref().unwrap();
        assert!(first.diagnoses.iter().any(|d| d.rule_id == "select_star"));
        assert!(matches!(results[1], Err(AnalysisError::Plan(_))));
        let third = results[2].as_ref().unwrap();
        assert!(third.diagnoses.iter().all(|d| d.rule_id != "select_star"));
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let stats = StaticStats::default();
        let snapshots = Arc::clone(&stats.snapshots);
        let analyzer = Arc::new(analyzer(StaticPlans::default(), stats));

        assert!(analyzer.analyze_many(vec![]).await.is_empty());
        assert_eq!(snapshots.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_batch_shares_one_statistics_snapshot() {
        let plans = StaticPlans::default()
            .with("SELECT id FROM a WHERE id = 1", ExecutionPlanNode::new("Index Scan").with_relation("a"))
            .with("SELECT id FROM a WHERE id = 2", ExecutionPlanNode::new("Index Scan").with_relation("a"))
            .with("SELECT id FROM a WHERE id = 3", ExecutionPlanNode::new("Index Scan").with_relation("a"));
        let stats = StaticStats::default();
        let snapshots = Arc::clone(&stats.snapshots);
        let analyzer = Arc::new(analyzer(plans, stats).with_bulk_concurrency(3));

        let results = analyzer
            .analyze_many((1..=3).map(|id| format!("SELECT id FROM a WHERE id = {}", id)).collect())
            .await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(snapshots.load(Ordering::SeqCst), 1);

        analyzer.analyze("SELECT id FROM a WHERE id = 1").await.unwrap();
        assert_eq!(snapshots.load(Ordering::SeqCst), 2);
    }
}

#[cfg(test)]
mod context_tests {
    use super::support::*;
    use crate::services::sql_analyzer::context::*;
    use crate::services::sql_analyzer::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn populated() -> StaticStats {
        let mut stats = StaticStats::default();
        stats.settings.insert("work_mem".to_string(), SettingValue::new("4096", Some("kB")));
        stats.tables.insert("t".to_string(), TableStats { live_rows: 10, ..Default::default() });
        stats.io.insert("t".to_string(), IoStats::default());
        stats.activity.push(ActivityEntry { pid: 42, query_preview: "SELECT 1".to_string(), ..Default::default() });
        stats
    }

    #[tokio::test]
    async fn test_failed_category_degrades_alone() {
        let mut stats = populated();
        stats.failing = vec![ContextCategory::Activity];
        let context = ContextAggregator::new(Arc::new(stats)).get_context().await;

        assert_eq!(context.degraded, vec![ContextCategory::Activity]);
        assert!(context.activity.is_empty());
        assert_eq!(context.settings.len(), 1);
        assert_eq!(context.table_stats.len(), 1);
        assert_eq!(context.io_stats.len(), 1);
    }

    #[tokio::test]
    async fn test_all_categories_failing_still_analyzes() {
        let query = "SELECT a.id FROM a CROSS JOIN b";
        let mut stats = populated();
        stats.failing = vec![
            ContextCategory::Settings,
            ContextCategory::TableStats,
            ContextCategory::IndexStats,
            ContextCategory::IoStats,
            ContextCategory::Activity,
        ];
        let analyzer = analyzer(StaticPlans::default().with(query, ExecutionPlanNode::default()), stats);

        let result = analyzer.analyze(query).await.unwrap();
        assert_eq!(result.diagnoses.len(), 1);
    }

    #[tokio::test]
    async fn test_degraded_settings_match_missing_settings() {
        let query = "SELECT id FROM t WHERE id = 1";
        let mut failing = populated();
        failing.failing = vec![ContextCategory::Settings];
        let mut missing = populated();
        missing.settings.clear();

        let degraded = analyzer(StaticPlans::default().with(query, ExecutionPlanNode::default()), failing);
        let empty = analyzer(StaticPlans::default().with(query, ExecutionPlanNode::default()), missing);

        assert_eq!(degraded.analyze(query).await.unwrap(), empty.analyze(query).await.unwrap());
    }
}
