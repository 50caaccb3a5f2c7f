//! Lint rules
//!
//! Every rule implements [`LintRule`] and is listed exactly once in [`init_catalog`].
//! Rules are grouped by the inputs they read:
//! - `lexical`: query text only
//! - `plan_shape`: execution plan, cross-referenced with statistics
//! - `settings`: server settings against recommended bounds
//! - `maintenance`: table, index, I/O and activity statistics

pub mod lexical;
pub mod maintenance;
pub mod plan_shape;
pub mod settings;

pub use crate::services::sql_analyzer::context::AnalysisContext;
pub use crate::services::sql_analyzer::models::{Diagnose, Severity};
pub use crate::services::sql_analyzer::plan::ExecutionPlanNode;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

static WHITESPACE_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Collapse every whitespace run into one space and trim the ends
pub fn normalize_query(query: &str) -> String {
    WHITESPACE_REGEX.replace_all(query.trim(), " ").into_owned()
}

// ============================================================================
// Rule Trait and Types
// ============================================================================

/// Inputs handed to a rule. Everything is borrowed and read-only.
pub struct RuleContext<'a> {
    /// Query text as produced by the previous rewriting rule (or the caller)
    pub query: &'a str,
    /// `query` with whitespace collapsed
    pub normalized: String,
    pub plan: &'a ExecutionPlanNode,
    pub context: &'a AnalysisContext,
}

impl<'a> RuleContext<'a> {
    pub fn new(query: &'a str, plan: &'a ExecutionPlanNode, context: &'a AnalysisContext) -> Self {
        Self { query, normalized: normalize_query(query), plan, context }
    }

    /// Output that keeps the query unchanged
    pub fn finish(&self, diagnoses: Vec<Diagnose>) -> RuleOutput {
        RuleOutput { diagnoses, rewritten_query: self.query.to_string() }
    }

    /// Output carrying a proposed rewrite
    pub fn finish_with_rewrite(&self, diagnoses: Vec<Diagnose>, rewritten: String) -> RuleOutput {
        RuleOutput { diagnoses, rewritten_query: rewritten }
    }

    /// Whether the normalized query is a statement of the given kind (SELECT, UPDATE...)
    pub fn is_statement(&self, keyword: &str) -> bool {
        let head = self.normalized.trim_start_matches('(').trim_start();
        head.get(..keyword.len()).is_some_and(|h| h.eq_ignore_ascii_case(keyword))
    }
}

/// Unified result of one rule invocation
#[derive(Debug, Clone, PartialEq)]
pub struct RuleOutput {
    pub diagnoses: Vec<Diagnose>,
    /// Equal to the input query when the rule proposes no rewrite
    pub rewritten_query: String,
}

/// Fault raised by a single rule invocation
#[derive(Debug, Clone, Error)]
pub enum RuleError {
    #[error("evaluation failed: {0}")]
    Evaluation(String),

    #[error("rewrite failed: {0}")]
    Rewrite(String),

    #[error("rule panicked: {0}")]
    Panicked(String),
}

/// A diagnostic rule. Must be pure: no I/O and no shared mutable state.
pub trait LintRule: Send + Sync {
    /// Stable identifier, used for logging and ordering
    fn id(&self) -> &str;

    /// Human readable name
    fn name(&self) -> &str;

    /// Whether this rule may return a query different from its input
    fn rewrites(&self) -> bool {
        false
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleOutput, RuleError>;
}

// ============================================================================
// Rule Catalog
// ============================================================================

/// Public description of a registered rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct RuleDescriptor {
    pub id: String,
    pub name: String,
    pub rewrites: bool,
}

/// Ordered, immutable set of rules. Registration order is diagnosis order.
#[derive(Default)]
pub struct RuleCatalog {
    rules: Vec<Box<dyn LintRule>>,
}

impl RuleCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Append a rule. A rule whose id is already registered is ignored.
    pub fn register<R: LintRule + 'static>(mut self, rule: R) -> Self {
        if self.rules.iter().any(|r| r.id() == rule.id()) {
            tracing::warn!(rule_id = rule.id(), "Duplicate rule id, registration ignored");
            return self;
        }
        self.rules.push(Box::new(rule));
        self
    }

    pub fn rules(&self) -> &[Box<dyn LintRule>] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn descriptors(&self) -> Vec<RuleDescriptor> {
        self.rules
            .iter()
            .map(|r| RuleDescriptor {
                id: r.id().to_string(),
                name: r.name().to_string(),
                rewrites: r.rewrites(),
            })
            .collect()
    }
}

/// Build the catalog of all built-in rules. Called once at startup.
pub fn init_catalog() -> RuleCatalog {
    let catalog = RuleCatalog::empty()
        // Query text
        .register(lexical::SelectStar)
        .register(lexical::HardJoins)
        .register(lexical::NPlusOne)
        .register(lexical::QueryHints)
        // Plan shape
        .register(plan_shape::MissingWhere)
        .register(plan_shape::MissingIndex)
        .register(plan_shape::InefficientJoin)
        .register(plan_shape::InefficientSort)
        .register(plan_shape::InefficientGroupBy)
        .register(plan_shape::InefficientSubquery)
        .register(plan_shape::InefficientLimit)
        .register(plan_shape::ManyRows)
        .register(plan_shape::CostEstimation)
        .register(plan_shape::ImplicitCast)
        // Server settings
        .register(settings::SettingThresholds::autovacuum_tuning())
        .register(settings::SettingThresholds::database_tuning())
        // Statistics
        .register(maintenance::VacuumNeeded)
        .register(maintenance::Defragmentation)
        .register(maintenance::Partitioning)
        .register(maintenance::TableStructure)
        .register(maintenance::ConcurrentDuplicates);

    tracing::debug!(rules = catalog.len(), "Rule catalog initialized");
    catalog
}

// ============================================================================
// Helpers
// ============================================================================

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Whether the word right before `offset` in `text` equals `word` (case-insensitive)
pub fn preceded_by_word(text: &str, offset: usize, word: &str) -> bool {
    text[..offset]
        .trim_end()
        .rsplit(|c: char| !(c.is_alphanumeric() || c == '_'))
        .next()
        .is_some_and(|prev| prev.eq_ignore_ascii_case(word))
}
