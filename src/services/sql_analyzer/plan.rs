//! Execution plan tree
//!
//! Mirrors PostgreSQL `EXPLAIN (FORMAT JSON)` output. Only the attributes the lint
//! rules branch on are typed; every other key of a node is kept in `extra`.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised while obtaining or decoding a plan
#[derive(Debug, Error)]
pub enum PlanRetrievalError {
    #[error("Query must not be empty")]
    EmptyQuery,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Missing Plan object in EXPLAIN output")]
    MissingPlan,

    #[error("Invalid plan structure: {0}")]
    InvalidStructure(#[from] serde_json::Error),
}

/// One operator of an execution plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlanNode {
    #[serde(rename = "Node Type", default)]
    pub node_type: String,

    #[serde(rename = "Relation Name", default, skip_serializing_if = "Option::is_none")]
    pub relation_name: Option<String>,

    #[serde(rename = "Index Name", default, skip_serializing_if = "Option::is_none")]
    pub index_name: Option<String>,

    #[serde(rename = "Total Cost", default)]
    pub total_cost: f64,

    #[serde(rename = "Plan Rows", default, deserialize_with = "deserialize_rows")]
    pub plan_rows: u64,

    #[serde(rename = "Plans", default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ExecutionPlanNode>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Row estimates are integral in EXPLAIN output, but hand-written plans may carry floats.
fn deserialize_rows<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)).unwrap_or(0),
        _ => 0,
    })
}

impl ExecutionPlanNode {
    /// Convenience constructor, mostly for tests and synthetic plans
    pub fn new(node_type: &str) -> Self {
        Self { node_type: node_type.to_string(), ..Default::default() }
    }

    pub fn with_relation(mut self, relation: &str) -> Self {
        self.relation_name = Some(relation.to_string());
        self
    }

    pub fn with_index(mut self, index: &str) -> Self {
        self.index_name = Some(index.to_string());
        self
    }

    pub fn with_cost(mut self, total_cost: f64) -> Self {
        self.total_cost = total_cost;
        self
    }

    pub fn with_rows(mut self, plan_rows: u64) -> Self {
        self.plan_rows = plan_rows;
        self
    }

    pub fn with_child(mut self, child: ExecutionPlanNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    /// Decode the value returned by `EXPLAIN (FORMAT JSON)`.
    ///
    /// Accepts the native `[ { "Plan": {...} } ]` wrapper, a bare `{ "Plan": {...} }`,
    /// or a sequence whose first element is the node itself.
    pub fn from_explain(value: Value) -> Result<Self, PlanRetrievalError> {
        let first = match value {
            Value::Array(mut items) => {
                if items.is_empty() {
                    return Err(PlanRetrievalError::MissingPlan);
                }
                items.swap_remove(0)
            },
            other @ Value::Object(_) => other,
            _ => return Err(PlanRetrievalError::MissingPlan),
        };

        let node = match first {
            Value::Object(mut obj) => match obj.remove("Plan") {
                Some(plan) => plan,
                None => Value::Object(obj),
            },
            _ => return Err(PlanRetrievalError::MissingPlan),
        };

        if node.get("Node Type").is_none() {
            return Err(PlanRetrievalError::MissingPlan);
        }

        Ok(serde_json::from_value(node)?)
    }

    /// True for the placeholder substituted when no plan is available
    pub fn is_empty(&self) -> bool {
        self.node_type.is_empty() && self.children.is_empty()
    }

    /// Depth-first, parent-before-children traversal
    pub fn iter(&self) -> PlanNodeIter<'_> {
        PlanNodeIter { stack: vec![self] }
    }

    pub fn find_by_type<'a>(&'a self, node_type: &'a str) -> impl Iterator<Item = &'a Self> + 'a {
        self.iter().filter(move |n| n.node_type == node_type)
    }

    pub fn contains_type(&self, node_type: &str) -> bool {
        self.iter().any(|n| n.node_type == node_type)
    }

    /// Read a string attribute kept in `extra` (e.g. "Filter", "Parent Relationship")
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }

    /// All predicate expressions attached to this node
    pub fn conditions(&self) -> impl Iterator<Item = &str> {
        const CONDITION_KEYS: [&str; 6] =
            ["Filter", "Index Cond", "Hash Cond", "Merge Cond", "Join Filter", "Recheck Cond"];
        CONDITION_KEYS.into_iter().filter_map(move |key| self.extra_str(key))
    }
}

/// Iterator for traversing plan nodes depth-first
pub struct PlanNodeIter<'a> {
    stack: Vec<&'a ExecutionPlanNode>,
}

impl<'a> Iterator for PlanNodeIter<'a> {
    type Item = &'a ExecutionPlanNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        // Reverse so the first child is visited first
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}
