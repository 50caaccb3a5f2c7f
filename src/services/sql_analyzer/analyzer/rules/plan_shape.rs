//! Plan shape rules
//!
//! Walk the execution plan depth-first and flag expensive operators, cross-referencing
//! table and index statistics where available.

use super::*;
use crate::services::sql_analyzer::context::{ContextCategory, qualified_name};

static WHERE_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bWHERE\b").expect("valid regex"));

static LIMIT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bLIMIT\s+(\d+)").expect("valid regex"));

static OFFSET_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bOFFSET\s+(\d+)").expect("valid regex"));

static ROW_LIMIT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:LIMIT|FETCH\s+(?:FIRST|NEXT))\b").expect("valid regex"));

/// Matches a parenthesized column followed by a cast, as EXPLAIN prints `((o.id)::text = ...)`
static COLUMN_CAST_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(((?:\w+\.)?\w+)\)::(\w+)").expect("valid regex"));

const LARGE_ROWS: u64 = 10_000;
const MANY_ROWS: u64 = 1_000;
const HIGH_COST: f64 = 10_000.0;
const MEDIUM_COST: f64 = 1_000.0;
const SMALL_LIMIT: u64 = 100;
const DEEP_OFFSET: u64 = 10_000;
const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * MB;

/// Statistics key for the relation a scan node reads, resolved against the context
fn relation_key(ctx: &RuleContext, node: &ExecutionPlanNode) -> Option<String> {
    let relation = node.relation_name.as_deref()?;
    let schema = node.extra_str("Schema");
    match ctx.context.table_entry(relation, schema) {
        Some((key, _)) => Some(key.to_string()),
        None => Some(qualified_name(schema.unwrap_or("public"), relation)),
    }
}

fn is_read_query(ctx: &RuleContext) -> bool {
    ctx.is_statement("SELECT") || ctx.is_statement("WITH")
}

/// missing_where: statements touching whole tables
/// - UPDATE/DELETE without WHERE: HIGH
/// - SELECT without WHERE doing a Seq Scan over more than 10,000 live rows: HIGH
pub struct MissingWhere;

impl LintRule for MissingWhere {
    fn id(&self) -> &str {
        "missing_where"
    }
    fn name(&self) -> &str {
        "Missing WHERE clause"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleOutput, RuleError> {
        if WHERE_REGEX.is_match(&ctx.normalized) {
            return Ok(ctx.finish(vec![]));
        }

        let mut diagnoses = Vec::new();
        for statement in ["UPDATE", "DELETE"] {
            if ctx.is_statement(statement) {
                diagnoses.push(Diagnose::new(
                    self.id(),
                    Severity::High,
                    format!("{} without WHERE modifies every row of the table", statement),
                    "Add a WHERE clause, or use TRUNCATE when clearing the table is intended",
                ));
            }
        }

        if is_read_query(ctx) {
            for node in ctx.plan.find_by_type("Seq Scan") {
                let Some(relation) = node.relation_name.as_deref() else {
                    continue;
                };
                let Some(stats) = ctx.context.table(relation, node.extra_str("Schema")) else {
                    continue;
                };
                if stats.live_rows > LARGE_ROWS as i64 {
                    diagnoses.push(Diagnose::new(
                        self.id(),
                        Severity::High,
                        format!(
                            "Query has no WHERE clause and scans all {} rows of {}",
                            stats.live_rows, relation
                        ),
                        "Filter the rows with a WHERE clause or paginate with LIMIT / keyset pagination",
                    ));
                }
            }
        }

        Ok(ctx.finish(diagnoses))
    }
}

/// missing_index: sequential scans that an index could avoid
/// - Seq Scan on a table of at least 1 GB: HIGH, at least 1 MB: MEDIUM
/// - Seq Scan with a filter: MEDIUM
/// - Seq Scan on a table without any index: MEDIUM
pub struct MissingIndex;

impl LintRule for MissingIndex {
    fn id(&self) -> &str {
        "missing_index"
    }
    fn name(&self) -> &str {
        "Missing index"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleOutput, RuleError> {
        let mut diagnoses = Vec::new();
        let index_stats_known = !ctx.context.degraded.contains(&ContextCategory::IndexStats);

        for node in ctx.plan.find_by_type("Seq Scan") {
            let (Some(relation), Some(key)) = (node.relation_name.as_deref(), relation_key(ctx, node))
            else {
                continue;
            };
            let stats = ctx.context.table(relation, node.extra_str("Schema"));

            if let Some(stats) = stats
                && let Some(size) = stats.table_size_bytes()
            {
                let severity = if size >= GB {
                    Some(Severity::High)
                } else if size >= MB {
                    Some(Severity::Medium)
                } else {
                    None
                };
                if let Some(severity) = severity {
                    diagnoses.push(Diagnose::new(
                        self.id(),
                        severity,
                        format!("Sequential scan on table {} ({})", relation, stats.table_size),
                        format!(
                            "Create an index on the columns {} is filtered or joined on",
                            relation
                        ),
                    ));
                }
            }

            if let Some(filter) = node.extra_str("Filter") {
                diagnoses.push(Diagnose::new(
                    self.id(),
                    Severity::Medium,
                    format!("Sequential scan on {} evaluates filter {} on every row", relation, filter),
                    format!("Consider CREATE INDEX ON {} for the filtered columns", relation),
                ));
            } else if stats.is_some() && index_stats_known && ctx.context.indexes_of(&key).next().is_none() {
                diagnoses.push(Diagnose::new(
                    self.id(),
                    Severity::Medium,
                    format!("No index is available for table {}", relation),
                    format!("Add a primary key or an index matching the access pattern of {}", relation),
                ));
            }
        }

        Ok(ctx.finish(diagnoses))
    }
}

/// inefficient_join: Nested Loop over more than 10,000 estimated rows (MEDIUM)
pub struct InefficientJoin;

impl LintRule for InefficientJoin {
    fn id(&self) -> &str {
        "inefficient_join"
    }
    fn name(&self) -> &str {
        "Inefficient join"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleOutput, RuleError> {
        let diagnoses = ctx
            .plan
            .find_by_type("Nested Loop")
            .filter(|node| node.plan_rows > LARGE_ROWS)
            .map(|node| {
                Diagnose::new(
                    self.id(),
                    Severity::Medium,
                    format!("Nested Loop join produces an estimated {} rows", node.plan_rows),
                    "Index the join key of the inner relation, or give the planner room for a hash join (work_mem)",
                )
            })
            .collect();

        Ok(ctx.finish(diagnoses))
    }
}

/// inefficient_sort: Sort over more than 10,000 estimated rows (MEDIUM)
pub struct InefficientSort;

impl LintRule for InefficientSort {
    fn id(&self) -> &str {
        "inefficient_sort"
    }
    fn name(&self) -> &str {
        "Expensive ORDER BY"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleOutput, RuleError> {
        let mut diagnoses = Vec::new();
        for node in ctx.plan.find_by_type("Sort").filter(|node| node.plan_rows > LARGE_ROWS) {
            let keys = node
                .extra
                .get("Sort Key")
                .and_then(|v| v.as_array())
                .map(|keys| keys.iter().filter_map(|k| k.as_str()).collect::<Vec<_>>().join(", "))
                .filter(|keys| !keys.is_empty());
            let message = match keys {
                Some(keys) => format!("Sorting an estimated {} rows by {}", node.plan_rows, keys),
                None => format!("Sorting an estimated {} rows", node.plan_rows),
            };
            diagnoses.push(Diagnose::new(
                self.id(),
                Severity::Medium,
                message,
                "Create an index matching the ORDER BY columns or reduce the rows before sorting",
            ));
        }

        Ok(ctx.finish(diagnoses))
    }
}

/// inefficient_group_by: hashed or sorted aggregation over more than 10,000 rows (MEDIUM)
pub struct InefficientGroupBy;

impl InefficientGroupBy {
    fn strategy(node: &ExecutionPlanNode) -> Option<&str> {
        match node.node_type.as_str() {
            "HashAggregate" => Some("Hashed"),
            "GroupAggregate" => Some("Sorted"),
            "Aggregate" => node
                .extra_str("Strategy")
                .filter(|s| matches!(*s, "Hashed" | "Sorted" | "Mixed")),
            _ => None,
        }
    }
}

impl LintRule for InefficientGroupBy {
    fn id(&self) -> &str {
        "inefficient_group_by"
    }
    fn name(&self) -> &str {
        "Expensive GROUP BY"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleOutput, RuleError> {
        let mut diagnoses = Vec::new();
        for node in ctx.plan.iter().filter(|node| node.plan_rows > LARGE_ROWS) {
            if let Some(strategy) = Self::strategy(node) {
                diagnoses.push(Diagnose::new(
                    self.id(),
                    Severity::Medium,
                    format!("{} aggregation over an estimated {} groups", strategy, node.plan_rows),
                    "Filter before grouping, pre-aggregate into a summary table, or index the GROUP BY columns",
                ));
            }
        }

        Ok(ctx.finish(diagnoses))
    }
}

/// inefficient_subquery: correlated subplans
/// - any SubPlan: HIGH
/// - more than 2 SubPlans: MEDIUM
pub struct InefficientSubquery;

impl LintRule for InefficientSubquery {
    fn id(&self) -> &str {
        "inefficient_subquery"
    }
    fn name(&self) -> &str {
        "Correlated subquery"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleOutput, RuleError> {
        let subplans: Vec<_> = ctx
            .plan
            .iter()
            .filter(|node| node.extra_str("Parent Relationship") == Some("SubPlan"))
            .collect();

        let mut diagnoses = Vec::new();
        if let Some(first) = subplans.first() {
            let name = first.extra_str("Subplan Name").unwrap_or("SubPlan");
            diagnoses.push(Diagnose::new(
                self.id(),
                Severity::High,
                format!("Correlated subquery ({}) is re-executed for every outer row", name),
                "Rewrite the subquery as a JOIN or LATERAL join so it runs once",
            ));
        }
        if subplans.len() > 2 {
            diagnoses.push(Diagnose::new(
                self.id(),
                Severity::Medium,
                format!("Plan contains {} correlated subplans", subplans.len()),
                "Consolidate the subqueries into joins or a CTE",
            ));
        }

        Ok(ctx.finish(diagnoses))
    }
}

/// inefficient_limit: pagination over large intermediate results
/// - LIMIT below 100 over a plan producing more than 10,000 rows: MEDIUM
/// - OFFSET above 10,000: MEDIUM
pub struct InefficientLimit;

impl LintRule for InefficientLimit {
    fn id(&self) -> &str {
        "inefficient_limit"
    }
    fn name(&self) -> &str {
        "Inefficient LIMIT/OFFSET"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleOutput, RuleError> {
        let mut diagnoses = Vec::new();
        let max_rows = ctx.plan.iter().map(|node| node.plan_rows).max().unwrap_or(0);

        if let Some(caps) = LIMIT_REGEX.captures(ctx.query)
            && let (Some(whole), Ok(limit)) = (caps.get(0), caps[1].parse::<u64>())
            && limit < SMALL_LIMIT
            && max_rows > LARGE_ROWS
        {
            diagnoses.push(
                Diagnose::new(
                    self.id(),
                    Severity::Medium,
                    format!("LIMIT {} is applied after producing an estimated {} rows", limit, max_rows),
                    "Support the WHERE and ORDER BY with an index so execution can stop early",
                )
                .at_offset(ctx.query, whole.start()),
            );
        }

        if let Some(caps) = OFFSET_REGEX.captures(ctx.query)
            && let (Some(whole), Ok(offset)) = (caps.get(0), caps[1].parse::<u64>())
            && offset > DEEP_OFFSET
        {
            diagnoses.push(
                Diagnose::new(
                    self.id(),
                    Severity::Medium,
                    format!("OFFSET {} reads and discards {} rows", offset, offset),
                    "Use keyset pagination (WHERE key > last_seen ORDER BY key LIMIT n)",
                )
                .at_offset(ctx.query, whole.start()),
            );
        }

        Ok(ctx.finish(diagnoses))
    }
}

/// many_rows: read query returning more than 1,000 rows without a row limit (MEDIUM)
pub struct ManyRows;

impl LintRule for ManyRows {
    fn id(&self) -> &str {
        "many_rows"
    }
    fn name(&self) -> &str {
        "Large result set"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleOutput, RuleError> {
        let mut diagnoses = Vec::new();
        if is_read_query(ctx) && ctx.plan.plan_rows > MANY_ROWS && !ROW_LIMIT_REGEX.is_match(&ctx.normalized) {
            diagnoses.push(Diagnose::new(
                self.id(),
                Severity::Medium,
                format!("Query returns an estimated {} rows", ctx.plan.plan_rows),
                "Add LIMIT or paginate the results",
            ));
        }

        Ok(ctx.finish(diagnoses))
    }
}

/// cost_estimation: overall plan cost and row locking
/// - root cost above 10,000: HIGH, above 1,000: MEDIUM
/// - UPDATE/DELETE touching more than 1,000 rows: HIGH
/// - LockRows: MEDIUM
pub struct CostEstimation;

impl LintRule for CostEstimation {
    fn id(&self) -> &str {
        "cost_estimation"
    }
    fn name(&self) -> &str {
        "Plan cost estimation"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleOutput, RuleError> {
        let mut diagnoses = Vec::new();
        let cost = ctx.plan.total_cost;
        let reading = ctx
            .plan
            .iter()
            .find_map(|node| node.relation_name.as_deref())
            .map(|relation| format!(" (reading {})", relation))
            .unwrap_or_default();

        let severity = if cost > HIGH_COST {
            Some((Severity::High, HIGH_COST))
        } else if cost > MEDIUM_COST {
            Some((Severity::Medium, MEDIUM_COST))
        } else {
            None
        };
        if let Some((severity, bound)) = severity {
            diagnoses.push(Diagnose::new(
                self.id(),
                severity,
                format!("Estimated plan cost {:.2} exceeds {}{}", cost, bound, reading),
                "Review the plan for full scans, large sorts and nested loops; add indexes or narrow the filter",
            ));
        }

        for node in ctx.plan.find_by_type("ModifyTable") {
            let operation = node.extra_str("Operation").unwrap_or_default();
            // ModifyTable estimates 0 output rows without RETURNING; the scan below it
            // carries the number of rows touched
            let affected = node.children.iter().map(|child| child.plan_rows).max().unwrap_or(node.plan_rows);
            if matches!(operation, "Update" | "Delete") && affected > MANY_ROWS {
                diagnoses.push(Diagnose::new(
                    self.id(),
                    Severity::High,
                    format!(
                        "{} locks an estimated {} rows of {}",
                        operation.to_uppercase(),
                        affected,
                        node.relation_name.as_deref().unwrap_or("the target table")
                    ),
                    "Modify rows in smaller batches to keep lock time and WAL volume bounded",
                ));
            }
        }

        if ctx.plan.contains_type("LockRows") {
            diagnoses.push(Diagnose::new(
                self.id(),
                Severity::Medium,
                "SELECT ... FOR UPDATE/SHARE locks every returned row",
                "Lock only the rows you modify; use SKIP LOCKED or NOWAIT for queue-like access",
            ));
        }

        Ok(ctx.finish(diagnoses))
    }
}

/// implicit_cast: column wrapped in a cast inside a plan predicate (MEDIUM)
pub struct ImplicitCast;

impl LintRule for ImplicitCast {
    fn id(&self) -> &str {
        "implicit_cast"
    }
    fn name(&self) -> &str {
        "Type cast in predicate"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleOutput, RuleError> {
        let mut seen: Vec<(String, String)> = Vec::new();
        let mut diagnoses = Vec::new();

        for node in ctx.plan.iter() {
            for condition in node.conditions() {
                for caps in COLUMN_CAST_REGEX.captures_iter(condition) {
                    let (column, target) = (caps[1].to_string(), caps[2].to_string());
                    if column.chars().all(|c| c.is_ascii_digit()) {
                        continue;
                    }
                    let key = (column, target);
                    if seen.contains(&key) {
                        continue;
                    }
                    diagnoses.push(Diagnose::new(
                        self.id(),
                        Severity::Medium,
                        format!("Column {} is cast to {} in predicate {}", key.0, key.1, condition),
                        format!(
                            "Compare against a value of the column's own type, or create an expression index on (({})::{})",
                            key.0, key.1
                        ),
                    ));
                    seen.push(key);
                }
            }
        }

        Ok(ctx.finish(diagnoses))
    }
}
