//! Statistics rules
//!
//! Derived purely from the statistics snapshot: table bloat, stale planner statistics,
//! table size and index layout, cache efficiency and concurrent activity. None of these
//! look at the plan.

use super::*;
use chrono::Duration;

static LITERAL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"'(?:[^']|'')*'|\b\d+(?:\.\d+)?\b").expect("valid regex"));

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * MB;

/// vacuum_needed: more than 10,000 dead rows in a table (MEDIUM)
pub struct VacuumNeeded;

impl LintRule for VacuumNeeded {
    fn id(&self) -> &str {
        "vacuum_needed"
    }
    fn name(&self) -> &str {
        "VACUUM ANALYZE needed"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleOutput, RuleError> {
        let diagnoses = ctx
            .context
            .table_stats
            .iter()
            .filter(|(_, stats)| stats.dead_rows > 10_000)
            .map(|(table, stats)| {
                Diagnose::new(
                    self.id(),
                    Severity::Medium,
                    format!("Table {} has {} dead rows", table, stats.dead_rows),
                    format!("Run VACUUM ANALYZE {}", table),
                )
            })
            .collect();

        Ok(ctx.finish(diagnoses))
    }
}

/// defragmentation: bloat, stale statistics, cache misses and unused indexes
/// - dead fraction above 0.2: HIGH
/// - otherwise more than 10% of rows modified since last analyze: MEDIUM
/// - otherwise larger than 100 MB and not analyzed for 30 days: MEDIUM
/// - heap blocks read / hit above 0.5: MEDIUM
/// - never scanned index above 500 MB: MEDIUM, above 100 MB: LOW
pub struct Defragmentation;

impl Defragmentation {
    const STALE_AFTER_DAYS: i64 = 30;
}

impl LintRule for Defragmentation {
    fn id(&self) -> &str {
        "defragmentation"
    }
    fn name(&self) -> &str {
        "Table and index defragmentation"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleOutput, RuleError> {
        let context = ctx.context;
        let stale_before = context.captured_at - Duration::days(Self::STALE_AFTER_DAYS);
        let mut diagnoses = Vec::new();

        for (table, stats) in &context.table_stats {
            let dead_fraction = stats.dead_fraction();
            let size = stats.table_size_bytes().unwrap_or(0);

            if dead_fraction > 0.2 {
                diagnoses.push(Diagnose::new(
                    self.id(),
                    Severity::High,
                    format!("Table {} is bloated: {:.1}% of its rows are dead", table, dead_fraction * 100.0),
                    format!("Run VACUUM {}; use pg_repack or VACUUM FULL to return space to the OS", table),
                ));
            } else if stats.live_rows > 0 && stats.mods_since_analyze * 10 > stats.live_rows {
                diagnoses.push(Diagnose::new(
                    self.id(),
                    Severity::Medium,
                    format!(
                        "Statistics of {} are stale: {} rows modified since the last analyze",
                        table, stats.mods_since_analyze
                    ),
                    format!("Run ANALYZE {}", table),
                ));
            } else if size > 100 * MB && stats.last_analyzed().is_none_or(|at| at < stale_before) {
                diagnoses.push(Diagnose::new(
                    self.id(),
                    Severity::Medium,
                    format!(
                        "Table {} ({}) has not been analyzed in the last {} days",
                        table,
                        stats.table_size,
                        Self::STALE_AFTER_DAYS
                    ),
                    format!("Run ANALYZE {} and check the autovacuum settings of this table", table),
                ));
            }
        }

        for (table, io) in &context.io_stats {
            if let Some(ratio) = io.heap_read_ratio()
                && ratio > 0.5
            {
                diagnoses.push(Diagnose::new(
                    self.id(),
                    Severity::Medium,
                    format!(
                        "Table {} reads {:.0}% as many heap blocks from disk as it finds in cache",
                        table,
                        ratio * 100.0
                    ),
                    "Increase shared_buffers or reduce the working set with better indexes",
                ));
            }
        }

        for index in context.index_stats.iter().filter(|idx| idx.scans == 0) {
            let size = index.size_bytes().unwrap_or(0);
            let severity = if size > 500 * MB {
                Severity::Medium
            } else if size > 100 * MB {
                Severity::Low
            } else {
                continue;
            };
            diagnoses.push(Diagnose::new(
                self.id(),
                severity,
                format!("Index {} on {} ({}) has never been scanned", index.index, index.table_key(), index.size),
                format!("Drop index {} if no query needs it; it still costs write throughput", index.index),
            ));
        }

        Ok(ctx.finish(diagnoses))
    }
}

/// partitioning: large or churning tables
/// - larger than 5 GB: HIGH
/// - larger than 1 GB: MEDIUM
/// - more than 1M rows with dead fraction above 0.1: MEDIUM
pub struct Partitioning;

impl LintRule for Partitioning {
    fn id(&self) -> &str {
        "partitioning"
    }
    fn name(&self) -> &str {
        "Partitioning candidate"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleOutput, RuleError> {
        let mut diagnoses = Vec::new();

        for (table, stats) in &ctx.context.table_stats {
            let size = stats.total_size_bytes().or_else(|| stats.table_size_bytes()).unwrap_or(0);
            let recommendation =
                format!("Consider declarative partitioning of {} by a time or key range", table);

            if size > 5 * GB {
                diagnoses.push(Diagnose::new(
                    self.id(),
                    Severity::High,
                    format!("Table {} is {}", table, format_bytes(size)),
                    recommendation,
                ));
            } else if size > GB {
                diagnoses.push(Diagnose::new(
                    self.id(),
                    Severity::Medium,
                    format!("Table {} is {}", table, format_bytes(size)),
                    recommendation,
                ));
            } else if stats.live_rows > 1_000_000 && stats.dead_fraction() > 0.1 {
                diagnoses.push(Diagnose::new(
                    self.id(),
                    Severity::Medium,
                    format!(
                        "Table {} has {} rows with {:.1}% dead rows",
                        table,
                        stats.live_rows,
                        stats.dead_fraction() * 100.0
                    ),
                    format!("{}; dropping old partitions avoids bulk DELETE churn", recommendation),
                ));
            }
        }

        Ok(ctx.finish(diagnoses))
    }
}

/// table_structure: row counts and index layout
/// - more than 5M rows: HIGH
/// - larger than 100 MB with fewer than 2 indexes: MEDIUM
/// - more than 10 indexes: LOW
pub struct TableStructure;

impl LintRule for TableStructure {
    fn id(&self) -> &str {
        "table_structure"
    }
    fn name(&self) -> &str {
        "Table structure"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleOutput, RuleError> {
        let mut diagnoses = Vec::new();

        for (table, stats) in &ctx.context.table_stats {
            let index_count = ctx.context.indexes_of(table).count();
            let size = stats.table_size_bytes().unwrap_or(0);

            if stats.live_rows > 5_000_000 {
                diagnoses.push(Diagnose::new(
                    self.id(),
                    Severity::High,
                    format!("Table {} holds {} rows", table, stats.live_rows),
                    "Archive cold rows or partition the table to keep scans and maintenance bounded",
                ));
            }
            if size > 100 * MB && index_count < 2 {
                diagnoses.push(Diagnose::new(
                    self.id(),
                    Severity::Medium,
                    format!("Table {} ({}) has only {} index(es)", table, stats.table_size, index_count),
                    "Index the columns used by frequent filters and joins",
                ));
            }
            if index_count > 10 {
                diagnoses.push(Diagnose::new(
                    self.id(),
                    Severity::Low,
                    format!("Table {} has {} indexes", table, index_count),
                    "Review overlapping or unused indexes; each one slows down writes",
                ));
            }
        }

        Ok(ctx.finish(diagnoses))
    }
}

/// concurrent_duplicates: the analyzed query is running in 3 or more sessions (MEDIUM)
pub struct ConcurrentDuplicates;

impl ConcurrentDuplicates {
    const MIN_SESSIONS: usize = 3;

    /// Lowercased text with literals replaced by `?`
    fn fingerprint(query: &str) -> String {
        let normalized = normalize_query(query).to_lowercase();
        LITERAL_REGEX.replace_all(&normalized, "?").trim_end_matches(';').trim().to_string()
    }
}

impl LintRule for ConcurrentDuplicates {
    fn id(&self) -> &str {
        "concurrent_duplicates"
    }
    fn name(&self) -> &str {
        "Concurrent duplicate queries"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleOutput, RuleError> {
        let target = Self::fingerprint(ctx.query);
        if target.is_empty() {
            return Ok(ctx.finish(vec![]));
        }

        // A truncated preview matches any query it is a prefix of
        let sessions = ctx
            .context
            .activity
            .iter()
            .filter(|entry| {
                let preview = Self::fingerprint(&entry.query_preview);
                if preview.is_empty() {
                    false
                } else if entry.is_truncated() {
                    target.starts_with(preview.as_str())
                } else {
                    target == preview
                }
            })
            .count();

        let mut diagnoses = Vec::new();
        if sessions >= Self::MIN_SESSIONS {
            diagnoses.push(Diagnose::new(
                self.id(),
                Severity::Medium,
                format!("{} active sessions are running this query right now", sessions),
                "Check the application for per-row query loops (N+1) and batch or cache the lookups",
            ));
        }

        Ok(ctx.finish(diagnoses))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::sql_analyzer::context::{ActivityEntry, IndexStats, IoStats, QUERY_PREVIEW_LEN, TableStats};
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn run(rule: &dyn LintRule, context: &AnalysisContext) -> Vec<Diagnose> {
        let plan = ExecutionPlanNode::default();
        rule.evaluate(&RuleContext::new("SELECT 1", &plan, context)).unwrap().diagnoses
    }

    fn with_table(name: &str, stats: TableStats) -> AnalysisContext {
        let mut context = AnalysisContext::default();
        context.table_stats.insert(name.to_string(), stats);
        context
    }

    #[test]
    fn test_vacuum_needed() {
        let context = with_table("events", TableStats { dead_rows: 10_001, ..Default::default() });
        let diagnoses = run(&VacuumNeeded, &context);
        assert_eq!(diagnoses.len(), 1);
        assert_eq!(diagnoses[0].recommendation, "Run VACUUM ANALYZE events");

        let context = with_table("events", TableStats { dead_rows: 10_000, ..Default::default() });
        assert!(run(&VacuumNeeded, &context).is_empty());
    }

    #[test]
    fn test_defragmentation_branches() {
        let bloated = with_table("a", TableStats { live_rows: 70, dead_rows: 30, ..Default::default() });
        assert_eq!(run(&Defragmentation, &bloated)[0].severity, Severity::High);

        let churned = with_table(
            "b",
            TableStats { live_rows: 1_000, mods_since_analyze: 101, ..Default::default() },
        );
        assert!(run(&Defragmentation, &churned)[0].message.contains("stale"));

        let captured_at = Utc.with_ymd_and_hms(2024, 6, 30, 0, 0, 0).unwrap();
        let mut stale = with_table(
            "c",
            TableStats {
                live_rows: 1_000,
                table_size: "200 MB".to_string(),
                last_autoanalyze: Some(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()),
                ..Default::default()
            },
        );
        stale.captured_at = captured_at;
        let diagnoses = run(&Defragmentation, &stale);
        assert_eq!(diagnoses.len(), 1);
        assert!(diagnoses[0].message.contains("30 days"));

        if let Some(stats) = stale.table_stats.get_mut("c") {
            stats.last_analyze = Some(Utc.with_ymd_and_hms(2024, 6, 20, 0, 0, 0).unwrap());
        }
        assert!(run(&Defragmentation, &stale).is_empty());
    }

    #[test]
    fn test_defragmentation_io_and_indexes() {
        let mut context = AnalysisContext::default();
        context.io_stats.insert(
            "orders".to_string(),
            IoStats { heap_blocks_read: 600, heap_blocks_hit: 1_000, ..Default::default() },
        );
        context.index_stats.push(IndexStats {
            schema: "public".to_string(),
            table: "orders".to_string(),
            index: "orders_note_idx".to_string(),
            scans: 0,
            size: "600 MB".to_string(),
            ..Default::default()
        });
        context.index_stats.push(IndexStats {
            schema: "public".to_string(),
            table: "orders".to_string(),
            index: "orders_pkey".to_string(),
            scans: 12,
            size: "900 MB".to_string(),
            ..Default::default()
        });

        let diagnoses = run(&Defragmentation, &context);
        let severities: Vec<Severity> = diagnoses.iter().map(|d| d.severity).collect();
        assert_eq!(severities, vec![Severity::Medium, Severity::Medium]);
        assert!(diagnoses[1].message.contains("orders_note_idx"));
    }

    #[test]
    fn test_partitioning_checks_largest_size_first() {
        let huge = with_table("logs", TableStats { total_size: "6 GB".to_string(), ..Default::default() });
        assert_eq!(run(&Partitioning, &huge)[0].severity, Severity::High);

        let large = with_table("logs", TableStats { table_size: "2 GB".to_string(), ..Default::default() });
        assert_eq!(run(&Partitioning, &large)[0].severity, Severity::Medium);

        let churning = with_table(
            "logs",
            TableStats { live_rows: 2_000_000, dead_rows: 400_000, ..Default::default() },
        );
        assert_eq!(run(&Partitioning, &churning).len(), 1);
    }

    #[test]
    fn test_table_structure() {
        let context = with_table(
            "orders",
            TableStats { live_rows: 6_000_000, table_size: "300 MB".to_string(), ..Default::default() },
        );
        let severities: Vec<Severity> = run(&TableStructure, &context).iter().map(|d| d.severity).collect();
        assert_eq!(severities, vec![Severity::High, Severity::Medium]);
    }

    #[test]
    fn test_concurrent_duplicates() {
        let mut context = AnalysisContext::default();
        for (pid, id) in [(1, 10), (2, 11), (3, 12)] {
            context.activity.push(ActivityEntry {
                pid,
                query_preview: format!("select name from users where id = {}", id),
                ..Default::default()
            });
        }
        let plan = ExecutionPlanNode::default();
        let query = "SELECT name FROM users WHERE id = 99";

        let diagnoses = ConcurrentDuplicates
            .evaluate(&RuleContext::new(query, &plan, &context))
            .unwrap()
            .diagnoses;
        assert_eq!(diagnoses.len(), 1);
        assert!(diagnoses[0].message.starts_with("3 active sessions"));

        context.activity.pop();
        assert!(
            ConcurrentDuplicates
                .evaluate(&RuleContext::new(query, &plan, &context))
                .unwrap()
                .diagnoses
                .is_empty()
        );
    }

    #[test]
    fn test_concurrent_duplicates_requires_full_match_for_short_previews() {
        let mut context = AnalysisContext::default();
        for pid in 1..=3 {
            context.activity.push(ActivityEntry {
                pid,
                query_preview: "SELECT * FROM orders".to_string(),
                ..Default::default()
            });
        }
        let plan = ExecutionPlanNode::default();

        let diagnoses = ConcurrentDuplicates
            .evaluate(&RuleContext::new("SELECT * FROM orders_archive WHERE id = 5", &plan, &context))
            .unwrap()
            .diagnoses;
        assert!(diagnoses.is_empty());
    }

    #[test]
    fn test_concurrent_duplicates_truncated_preview() {
        let columns: Vec<String> = (1..=30).map(|i| format!("col_{}", i)).collect();
        let query = format!("SELECT {} FROM wide_report WHERE id = 7", columns.join(", "));
        let preview: String = query.chars().take(QUERY_PREVIEW_LEN).collect();

        let mut context = AnalysisContext::default();
        for pid in 1..=3 {
            context.activity.push(ActivityEntry { pid, query_preview: preview.clone(), ..Default::default() });
        }
        assert!(context.activity[0].is_truncated());

        let plan = ExecutionPlanNode::default();
        let diagnoses = ConcurrentDuplicates
            .evaluate(&RuleContext::new(&query, &plan, &context))
            .unwrap()
            .diagnoses;
        assert_eq!(diagnoses.len(), 1);
        assert!(diagnoses[0].message.starts_with("3 active sessions"));
    }
}
