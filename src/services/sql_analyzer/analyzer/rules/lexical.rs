//! Query text rules
//!
//! Pattern matching over the raw and normalized query text. Positions are reported
//! against the text the rule received.

use super::*;
use std::collections::BTreeMap;

static SELECT_STAR_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bSELECT\s+(?:DISTINCT\s+)?(\*)").expect("valid regex"));

static CROSS_JOIN_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bCROSS\s+JOIN\b").expect("valid regex"));

static JOIN_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bJOIN\b").expect("valid regex"));

static JOIN_CONDITION_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:ON|USING)\b").expect("valid regex"));

static SINGLE_ROW_LOOKUP_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^SELECT\s+(?P<cols>.+?)\s+FROM\s+(?P<table>[\w.]+)\s+WHERE\s+(?P<col>(?:\w+\.)?\w*id)\s*=\s*(?P<value>\d+|'[^']*')$",
    )
    .expect("valid regex")
});

static IN_SUBQUERY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bIN\s*\(\s*SELECT\b").expect("valid regex"));

static IN_SUBQUERY_REWRITE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^SELECT\s+(?P<cols>.+?)\s+FROM\s+(?P<outer>\w+(?:\s+(?:AS\s+)?\w+)?)\s+WHERE\s+(?P<left>[\w.]+)\s+IN\s*\(\s*SELECT\s+(?P<right>\w+)\s+FROM\s+(?P<inner>\w+)(?:\s+WHERE\s+(?P<cond>[^()]+?))?\s*\)\s*(?P<rest>(?:ORDER\s+BY|LIMIT)\b.*)?$",
    )
    .expect("valid regex")
});

static NOT_IN_SUBQUERY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bNOT\s+IN\s*\(\s*SELECT\b").expect("valid regex"));

static IN_LIST_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bIN\s*\(([^()]*)\)").expect("valid regex"));

static UNION_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bUNION\b(\s+ALL\b)?").expect("valid regex"));

static LEADING_WILDCARD_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bI?LIKE\s+'%").expect("valid regex"));

const MAX_JOINS: usize = 3;
const MAX_IN_LIST_VALUES: usize = 5;

/// select_star: `SELECT *` projections
/// Severity: MEDIUM, one per occurrence
pub struct SelectStar;

impl LintRule for SelectStar {
    fn id(&self) -> &str {
        "select_star"
    }
    fn name(&self) -> &str {
        "SELECT * usage"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleOutput, RuleError> {
        let diagnoses = SELECT_STAR_REGEX
            .captures_iter(ctx.query)
            .filter_map(|caps| caps.get(1))
            .map(|star| {
                Diagnose::new(
                    self.id(),
                    Severity::Medium,
                    "SELECT * fetches every column of the referenced tables",
                    "List only the columns the caller needs; narrower rows reduce I/O and allow index-only scans",
                )
                .at_offset(ctx.query, star.start())
            })
            .collect();

        Ok(ctx.finish(diagnoses))
    }
}

/// hard_joins: Cartesian products and joins without a condition
/// - CROSS JOIN: HIGH
/// - JOIN without ON/USING: HIGH
/// - more than 3 joins: MEDIUM
pub struct HardJoins;

impl LintRule for HardJoins {
    fn id(&self) -> &str {
        "hard_joins"
    }
    fn name(&self) -> &str {
        "Expensive joins"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleOutput, RuleError> {
        let query = ctx.query;
        let mut diagnoses = Vec::new();

        for cross in CROSS_JOIN_REGEX.find_iter(query) {
            diagnoses.push(
                Diagnose::new(
                    self.id(),
                    Severity::High,
                    "CROSS JOIN produces the Cartesian product of both inputs",
                    "Replace it with an INNER JOIN ... ON ... unless every combination of rows is really needed",
                )
                .at_offset(query, cross.start()),
            );
        }

        let joins: Vec<_> = JOIN_REGEX.find_iter(query).collect();
        for (i, join) in joins.iter().enumerate() {
            if preceded_by_word(query, join.start(), "CROSS")
                || preceded_by_word(query, join.start(), "NATURAL")
            {
                continue;
            }
            let end = joins.get(i + 1).map(|next| next.start()).unwrap_or(query.len());
            if !JOIN_CONDITION_REGEX.is_match(&query[join.end()..end]) {
                diagnoses.push(
                    Diagnose::new(
                        self.id(),
                        Severity::High,
                        "JOIN without an ON or USING condition",
                        "Add an explicit join condition; without one every row of the left input is paired with every row of the right input",
                    )
                    .at_offset(query, join.start()),
                );
            }
        }

        if joins.len() > MAX_JOINS {
            diagnoses.push(Diagnose::new(
                self.id(),
                Severity::Medium,
                format!("Query performs {} joins", joins.len()),
                "Check that every joined table is needed; consider splitting the query or materializing intermediate results",
            ));
        }

        Ok(ctx.finish(diagnoses))
    }
}

/// n_plus_one: per-row query patterns, with heuristic rewrites
/// - several `SELECT ... WHERE id = N` statements on one table: HIGH, rewritten to `IN (...)`
/// - `col IN (SELECT ...)`: MEDIUM, rewritten to `INNER JOIN` for the simple single-table form
pub struct NPlusOne;

impl NPlusOne {
    fn batch_lookups(&self, statements: &[&str], diagnoses: &mut Vec<Diagnose>) -> Option<String> {
        let lookups: Vec<_> =
            statements.iter().filter_map(|s| SINGLE_ROW_LOOKUP_REGEX.captures(s)).collect();

        let mut groups: BTreeMap<(String, String), Vec<usize>> = BTreeMap::new();
        for (i, caps) in lookups.iter().enumerate() {
            let key = (caps["table"].to_ascii_lowercase(), caps["col"].to_ascii_lowercase());
            groups.entry(key).or_default().push(i);
        }

        for ((table, col), members) in &groups {
            if members.len() >= 2 {
                diagnoses.push(Diagnose::new(
                    self.id(),
                    Severity::High,
                    format!(
                        "{} separate single-row lookups on {} by {} (N+1 query pattern)",
                        members.len(),
                        table,
                        col
                    ),
                    "Fetch all rows in one query with WHERE ... IN (...) or a join instead of one query per row",
                ));
            }
        }

        // Only rewrite when every statement is the same lookup
        if groups.len() != 1 || lookups.len() != statements.len() || lookups.len() < 2 {
            return None;
        }
        let first = &lookups[0];
        if lookups.iter().any(|caps| caps["cols"] != first["cols"]) {
            return None;
        }

        let mut values: Vec<&str> = Vec::new();
        for caps in &lookups {
            let value = caps.name("value").map(|m| m.as_str())?;
            if !values.contains(&value) {
                values.push(value);
            }
        }

        Some(format!(
            "SELECT {} FROM {} WHERE {} IN ({})",
            &first["cols"],
            &first["table"],
            &first["col"],
            values.join(", ")
        ))
    }

    fn join_subquery(&self, statement: &str) -> Option<String> {
        let caps = IN_SUBQUERY_REWRITE_REGEX.captures(statement)?;
        if caps["left"].eq_ignore_ascii_case("NOT") {
            return None;
        }

        let inner = &caps["inner"];
        let mut rewritten = format!(
            "SELECT {} FROM {} INNER JOIN {} ON {} = {}.{}",
            &caps["cols"], &caps["outer"], inner, &caps["left"], inner, &caps["right"]
        );
        if let Some(cond) = caps.name("cond") {
            rewritten.push_str(" WHERE ");
            rewritten.push_str(cond.as_str());
        }
        if let Some(rest) = caps.name("rest") {
            rewritten.push(' ');
            rewritten.push_str(rest.as_str());
        }
        Some(rewritten)
    }
}

impl LintRule for NPlusOne {
    fn id(&self) -> &str {
        "n_plus_one"
    }
    fn name(&self) -> &str {
        "N+1 query pattern"
    }
    fn rewrites(&self) -> bool {
        true
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleOutput, RuleError> {
        let mut diagnoses = Vec::new();
        let statements: Vec<&str> =
            ctx.normalized.split(';').map(str::trim).filter(|s| !s.is_empty()).collect();

        if statements.len() > 1
            && let Some(rewritten) = self.batch_lookups(&statements, &mut diagnoses)
        {
            return Ok(ctx.finish_with_rewrite(diagnoses, rewritten));
        }

        let subqueries: Vec<_> = IN_SUBQUERY_REGEX
            .find_iter(ctx.query)
            .filter(|m| !preceded_by_word(ctx.query, m.start(), "NOT"))
            .collect();
        for m in &subqueries {
            diagnoses.push(
                Diagnose::new(
                    self.id(),
                    Severity::Medium,
                    "IN (SELECT ...) subquery evaluated against every outer row",
                    "Rewrite as a JOIN (check for duplicate rows) or EXISTS so the planner can use a hash or merge join",
                )
                .at_offset(ctx.query, m.start()),
            );
        }

        if statements.len() == 1
            && subqueries.len() == 1
            && let Some(rewritten) = self.join_subquery(statements[0])
        {
            return Ok(ctx.finish_with_rewrite(diagnoses, rewritten));
        }

        Ok(ctx.finish(diagnoses))
    }
}

/// query_hints: smaller textual anti-patterns
/// - NOT IN (SELECT ...): MEDIUM
/// - LIKE/ILIKE with leading wildcard: MEDIUM
/// - IN list with more than 5 values: LOW
/// - UNION without ALL: LOW
pub struct QueryHints;

impl LintRule for QueryHints {
    fn id(&self) -> &str {
        "query_hints"
    }
    fn name(&self) -> &str {
        "Query rewriting hints"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleOutput, RuleError> {
        let query = ctx.query;
        let mut diagnoses = Vec::new();

        for m in NOT_IN_SUBQUERY_REGEX.find_iter(query) {
            diagnoses.push(
                Diagnose::new(
                    self.id(),
                    Severity::Medium,
                    "NOT IN (SELECT ...) returns no rows if the subquery yields a NULL and prevents an anti-join",
                    "Use NOT EXISTS (SELECT 1 FROM ... WHERE ...) instead",
                )
                .at_offset(query, m.start()),
            );
        }

        for m in LEADING_WILDCARD_REGEX.find_iter(query) {
            diagnoses.push(
                Diagnose::new(
                    self.id(),
                    Severity::Medium,
                    "LIKE pattern starts with a wildcard and cannot use a B-tree index",
                    "Use a pg_trgm GIN index or full-text search for substring matching",
                )
                .at_offset(query, m.start()),
            );
        }

        for caps in IN_LIST_REGEX.captures_iter(query) {
            let (Some(whole), Some(list)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let list = list.as_str().trim();
            if list.is_empty() || list.get(..6).is_some_and(|head| head.eq_ignore_ascii_case("SELECT")) {
                continue;
            }
            let values = list.split(',').count();
            if values > MAX_IN_LIST_VALUES {
                diagnoses.push(
                    Diagnose::new(
                        self.id(),
                        Severity::Low,
                        format!("IN list with {} values", values),
                        "Pass the values as an array (= ANY($1)) or join against a VALUES list",
                    )
                    .at_offset(query, whole.start()),
                );
            }
        }

        for caps in UNION_REGEX.captures_iter(query) {
            if caps.get(1).is_some() {
                continue;
            }
            if let Some(m) = caps.get(0) {
                diagnoses.push(
                    Diagnose::new(
                        self.id(),
                        Severity::Low,
                        "UNION removes duplicates with an extra sort or hash step",
                        "Use UNION ALL when the branches cannot overlap or duplicates are acceptable",
                    )
                    .at_offset(query, m.start()),
                );
            }
        }

        Ok(ctx.finish(diagnoses))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn run(rule: &dyn LintRule, query: &str) -> RuleOutput {
        let plan = ExecutionPlanNode::default();
        let context = AnalysisContext::default();
        rule.evaluate(&RuleContext::new(query, &plan, &context)).unwrap()
    }

    #[test]
    fn test_select_star_position() {
        let output = run(&SelectStar, "SELECT *\nFROM orders");
        assert_eq!(output.diagnoses.len(), 1);
        assert_eq!(output.diagnoses[0].severity, Severity::Medium);
        assert_eq!((output.diagnoses[0].line, output.diagnoses[0].col), (1, 8));
    }

    #[test]
    fn test_select_star_ignores_count_star() {
        assert!(run(&SelectStar, "SELECT count(*) FROM orders").diagnoses.is_empty());
    }

    #[test]
    fn test_cross_join_single_high() {
        let query = "SELECT a.id, b.name FROM a CROSS JOIN b";
        let output = run(&HardJoins, query);

        assert_eq!(output.diagnoses.len(), 1);
        assert_eq!(output.diagnoses[0].severity, Severity::High);
        assert_eq!(output.diagnoses[0].col, 28);
        assert_eq!(output.rewritten_query, query);
    }

    #[test]
    fn test_join_without_condition() {
        let output = run(&HardJoins, "SELECT * FROM a JOIN b WHERE a.x = 1");
        assert_eq!(output.diagnoses.len(), 1);
        assert!(output.diagnoses[0].message.contains("ON or USING"));

        let output = run(&HardJoins, "SELECT * FROM a JOIN b ON a.id = b.a_id JOIN c USING (id)");
        assert!(output.diagnoses.is_empty());
    }

    #[test]
    fn test_many_joins() {
        let query = "SELECT 1 FROM a JOIN b ON a.id = b.id JOIN c ON c.id = b.id \
                     JOIN d ON d.id = c.id LEFT JOIN e ON e.id = d.id";
        let output = run(&HardJoins, query);
        assert_eq!(output.diagnoses.len(), 1);
        assert_eq!(output.diagnoses[0].severity, Severity::Medium);
    }

    #[test]
    fn test_n_plus_one_batches_lookups() {
        let query = "SELECT name FROM users WHERE id = 1;\nSELECT name FROM users WHERE id = 2; SELECT name FROM users WHERE id = 3;";
        let output = run(&NPlusOne, query);

        assert_eq!(output.diagnoses.len(), 1);
        assert_eq!(output.diagnoses[0].severity, Severity::High);
        assert_eq!(output.rewritten_query, "SELECT name FROM users WHERE id IN (1, 2, 3)");
    }

    #[test]
    fn test_n_plus_one_mixed_statements_not_rewritten() {
        let query = "SELECT name FROM users WHERE id = 1; SELECT name FROM users WHERE id = 2; DELETE FROM logs";
        let output = run(&NPlusOne, query);

        assert_eq!(output.diagnoses.len(), 1);
        assert_eq!(output.rewritten_query, query);
    }

    #[test]
    fn test_in_subquery_rewritten_to_join() {
        let query = "SELECT o.id FROM orders o WHERE o.customer_id IN (SELECT id FROM customers WHERE region = 'EU')";
        let output = run(&NPlusOne, query);

        assert_eq!(output.diagnoses.len(), 1);
        assert_eq!(output.diagnoses[0].severity, Severity::Medium);
        assert_eq!(
            output.rewritten_query,
            "SELECT o.id FROM orders o INNER JOIN customers ON o.customer_id = customers.id WHERE region = 'EU'"
        );
    }

    #[test]
    fn test_not_in_subquery_left_to_hints() {
        let query = "SELECT id FROM orders WHERE customer_id NOT IN (SELECT id FROM blocked)";
        let output = run(&NPlusOne, query);
        assert!(output.diagnoses.is_empty());
        assert_eq!(output.rewritten_query, query);

        let hints = run(&QueryHints, query);
        assert_eq!(hints.diagnoses.len(), 1);
        assert!(hints.diagnoses[0].recommendation.contains("NOT EXISTS"));
    }

    #[test]
    fn test_query_hints() {
        let output = run(
            &QueryHints,
            "SELECT id FROM t WHERE x IN (1, 2, 3, 4, 5, 6) UNION SELECT id FROM u WHERE name LIKE '%abc'",
        );
        let severities: Vec<Severity> = output.diagnoses.iter().map(|d| d.severity).collect();
        assert_eq!(severities, vec![Severity::Medium, Severity::Low, Severity::Low]);

        assert!(run(&QueryHints, "SELECT 1 UNION ALL SELECT 2").diagnoses.is_empty());
    }
}
