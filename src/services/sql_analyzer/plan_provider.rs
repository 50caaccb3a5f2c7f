//! Plan retrieval via `EXPLAIN (FORMAT JSON)`

use async_trait::async_trait;
use sqlx::PgPool;

use super::plan::{ExecutionPlanNode, PlanRetrievalError};

/// Source of execution plans
#[async_trait]
pub trait PlanProvider: Send + Sync {
    async fn get_plan(&self, query: &str) -> Result<ExecutionPlanNode, PlanRetrievalError>;
}

/// PostgreSQL plan provider. Plans are estimated only, the query is never executed.
pub struct PgPlanProvider {
    pool: PgPool,
}

impl PgPlanProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PlanProvider for PgPlanProvider {
    async fn get_plan(&self, query: &str) -> Result<ExecutionPlanNode, PlanRetrievalError> {
        // EXPLAIN accepts exactly one statement
        let statement = split_statements(query).into_iter().next().ok_or(PlanRetrievalError::EmptyQuery)?;
        let explain = format!("EXPLAIN (FORMAT JSON) {}", statement);

        let (raw,): (serde_json::Value,) = sqlx::query_as(&explain).fetch_one(&self.pool).await?;
        let plan = ExecutionPlanNode::from_explain(raw)?;

        tracing::debug!(
            node_type = %plan.node_type,
            total_cost = plan.total_cost,
            plan_rows = plan.plan_rows,
            "Plan retrieved"
        );
        Ok(plan)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Scan {
    Code,
    SingleQuoted,
    DoubleQuoted,
    LineComment,
    BlockComment(u32),
    DollarQuoted,
}

/// Split SQL text on `;` outside of literals, quoted identifiers and comments.
///
/// Dollar quoting (`$$...$$`, `$tag$...$tag$`) and nested block comments are honored.
/// Parts holding nothing but whitespace and comments are dropped.
pub fn split_statements(query: &str) -> Vec<&str> {
    let bytes = query.as_bytes();
    let mut statements = Vec::new();
    let mut state = Scan::Code;
    let mut dollar_tag = "";
    let mut start = 0;
    let mut has_code = false;
    let mut i = 0;

    while i < bytes.len() {
        let rest = &bytes[i..];
        match state {
            Scan::Code => match bytes[i] {
                b'\'' => {
                    state = Scan::SingleQuoted;
                    has_code = true;
                },
                b'"' => {
                    state = Scan::DoubleQuoted;
                    has_code = true;
                },
                b'-' if rest.starts_with(b"--") => {
                    state = Scan::LineComment;
                    i += 1;
                },
                b'/' if rest.starts_with(b"/*") => {
                    state = Scan::BlockComment(1);
                    i += 1;
                },
                b'$' => {
                    has_code = true;
                    if let Some(tag) = dollar_tag_at(query, i) {
                        dollar_tag = tag;
                        state = Scan::DollarQuoted;
                        i += tag.len() - 1;
                    }
                },
                b';' => {
                    if has_code {
                        statements.push(query[start..i].trim());
                    }
                    start = i + 1;
                    has_code = false;
                },
                c if !c.is_ascii_whitespace() => has_code = true,
                _ => {},
            },
            Scan::SingleQuoted if bytes[i] == b'\'' => state = Scan::Code,
            Scan::DoubleQuoted if bytes[i] == b'"' => state = Scan::Code,
            Scan::LineComment if bytes[i] == b'\n' => state = Scan::Code,
            Scan::BlockComment(depth) if rest.starts_with(b"*/") => {
                state = if depth == 1 { Scan::Code } else { Scan::BlockComment(depth - 1) };
                i += 1;
            },
            Scan::BlockComment(depth) if rest.starts_with(b"/*") => {
                state = Scan::BlockComment(depth + 1);
                i += 1;
            },
            Scan::DollarQuoted if rest.starts_with(dollar_tag.as_bytes()) => {
                state = Scan::Code;
                i += dollar_tag.len() - 1;
            },
            _ => {},
        }
        i += 1;
    }
    if has_code {
        statements.push(query[start..].trim());
    }

    statements
}

/// Opening `$tag$` delimiter at `pos`, if any. `$1` parameters and `$` inside identifiers
/// are not delimiters.
fn dollar_tag_at(query: &str, pos: usize) -> Option<&str> {
    let bytes = query.as_bytes();
    if pos > 0 && (bytes[pos - 1].is_ascii_alphanumeric() || bytes[pos - 1] == b'_') {
        return None;
    }
    let tag_len = bytes[pos + 1..]
        .iter()
        .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
        .count();
    let end = pos + 1 + tag_len;
    if bytes.get(end) != Some(&b'$') || bytes.get(pos + 1).is_some_and(u8::is_ascii_digit) {
        return None;
    }
    Some(&query[pos..=end])
}
