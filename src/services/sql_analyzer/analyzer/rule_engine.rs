//! Rule executor
//!
//! Runs every cataloged rule against one `(query, plan, context)` triple.
//!
//! Rewriting rules run first, sequentially in catalog order, so each rewrite is fed to
//! the rules registered after it. The query visible at every catalog position is
//! recorded, then the remaining (pure, non-rewriting) rules run on the rayon pool with
//! their recorded query. Outputs are reassembled by catalog index, which makes the
//! result identical to a plain sequential run.

use super::rules::{
    AnalysisContext, Diagnose, ExecutionPlanNode, LintRule, RuleCatalog, RuleContext, RuleError,
    RuleOutput,
};
use once_cell::sync::Lazy;
use rayon::prelude::*;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

static EMPTY_PLAN: Lazy<ExecutionPlanNode> = Lazy::new(ExecutionPlanNode::default);
static EMPTY_CONTEXT: Lazy<AnalysisContext> = Lazy::new(AnalysisContext::default);

/// Rule executor configuration
#[derive(Debug, Clone)]
pub struct RuleEngineConfig {
    /// Forward rule-proposed rewrites to later rules and to the result
    pub enable_rewrites: bool,
    /// Evaluate non-rewriting rules concurrently
    pub parallel: bool,
}

impl Default for RuleEngineConfig {
    fn default() -> Self {
        Self { enable_rewrites: true, parallel: true }
    }
}

/// A rule that failed during one run
#[derive(Debug, Clone)]
pub struct RuleFailure {
    pub rule_id: String,
    pub error: RuleError,
}

/// Everything a run produced
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    /// Diagnoses in catalog order
    pub diagnoses: Vec<Diagnose>,
    /// Input query after all accepted rewrites
    pub final_query: String,
    pub failures: Vec<RuleFailure>,
}

/// Runs the catalog against analysis inputs
pub struct RuleExecutor {
    config: RuleEngineConfig,
    catalog: Arc<RuleCatalog>,
}

impl RuleExecutor {
    pub fn new(catalog: Arc<RuleCatalog>) -> Self {
        Self { config: RuleEngineConfig::default(), catalog }
    }

    pub fn with_config(catalog: Arc<RuleCatalog>, config: RuleEngineConfig) -> Self {
        Self { config, catalog }
    }

    pub fn catalog(&self) -> &RuleCatalog {
        &self.catalog
    }

    /// Run all rules. A missing plan or context is replaced by an empty one.
    pub fn run(
        &self,
        query: &str,
        plan: Option<&ExecutionPlanNode>,
        context: Option<&AnalysisContext>,
    ) -> ExecutionReport {
        let plan = plan.unwrap_or(&EMPTY_PLAN);
        let context = context.unwrap_or(&EMPTY_CONTEXT);
        let rules = self.catalog.rules();
        let started = Instant::now();

        let mut outcomes: Vec<Option<Result<RuleOutput, RuleError>>> =
            (0..rules.len()).map(|_| None).collect();
        // Every accepted rewrite appends a version; `visible[i]` is the version rule i sees
        let mut versions: Vec<String> = vec![query.to_string()];
        let mut visible: Vec<usize> = Vec::with_capacity(rules.len());

        for (i, rule) in rules.iter().enumerate() {
            let current = versions.len() - 1;
            visible.push(current);
            if !rule.rewrites() {
                continue;
            }

            let mut result = invoke(rule.as_ref(), &versions[current], plan, context);
            let rewritten = match &result {
                Ok(output) if output.rewritten_query != versions[current] => {
                    Some(output.rewritten_query.clone())
                },
                _ => None,
            };
            if let Some(rewritten) = rewritten {
                if rewritten.trim().is_empty() {
                    result = Err(RuleError::Rewrite("rule produced an empty query".to_string()));
                } else if self.config.enable_rewrites {
                    tracing::debug!(rule_id = rule.id(), "Query rewritten");
                    versions.push(rewritten);
                }
            }
            outcomes[i] = Some(result);
        }

        let pending: Vec<usize> = (0..rules.len()).filter(|&i| !rules[i].rewrites()).collect();
        let evaluate =
            |i: usize| (i, invoke(rules[i].as_ref(), &versions[visible[i]], plan, context));
        let results: Vec<(usize, Result<RuleOutput, RuleError>)> = if self.config.parallel {
            pending.par_iter().map(|&i| evaluate(i)).collect()
        } else {
            pending.iter().map(|&i| evaluate(i)).collect()
        };
        for (i, result) in results {
            outcomes[i] = Some(result);
        }

        let mut report = ExecutionReport {
            final_query: versions[versions.len() - 1].clone(),
            ..Default::default()
        };
        for (i, (rule, outcome)) in rules.iter().zip(outcomes).enumerate() {
            match outcome {
                Some(Ok(output)) => {
                    if !rule.rewrites() && output.rewritten_query != versions[visible[i]] {
                        tracing::warn!(
                            rule_id = rule.id(),
                            "Rule is not registered as rewriting, proposed rewrite ignored"
                        );
                    }
                    report.diagnoses.extend(output.diagnoses);
                },
                Some(Err(error)) => {
                    tracing::warn!(rule_id = rule.id(), error = %error, "Rule failed, skipping its diagnoses");
                    report.failures.push(RuleFailure { rule_id: rule.id().to_string(), error });
                },
                None => {},
            }
        }

        tracing::debug!(
            rules = rules.len(),
            diagnoses = report.diagnoses.len(),
            failures = report.failures.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Rule execution finished"
        );
        report
    }
}

/// Evaluate one rule, turning a panic into a rule failure
fn invoke(
    rule: &dyn LintRule,
    query: &str,
    plan: &ExecutionPlanNode,
    context: &AnalysisContext,
) -> Result<RuleOutput, RuleError> {
    let ctx = RuleContext::new(query, plan, context);
    panic::catch_unwind(AssertUnwindSafe(|| rule.evaluate(&ctx)))
        .unwrap_or_else(|payload| Err(RuleError::Panicked(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::sql_analyzer::models::Severity;
    use pretty_assertions::assert_eq;

    /// Emits one diagnosis whose message is the query it saw
    struct Echo(&'static str);

    impl LintRule for Echo {
        fn id(&self) -> &str {
            self.0
        }
        fn name(&self) -> &str {
            "echo"
        }
        fn evaluate(&self, ctx: &RuleContext) -> Result<RuleOutput, RuleError> {
            Ok(ctx.finish(vec![Diagnose::new(self.0, Severity::Low, ctx.query, "")]))
        }
    }

    /// Appends a suffix to the query
    struct Append(&'static str, &'static str);

    impl LintRule for Append {
        fn id(&self) -> &str {
            self.0
        }
        fn name(&self) -> &str {
            "append"
        }
        fn rewrites(&self) -> bool {
            true
        }
        fn evaluate(&self, ctx: &RuleContext) -> Result<RuleOutput, RuleError> {
            let diagnoses = vec![Diagnose::new(self.0, Severity::Medium, ctx.query, "")];
            Ok(ctx.finish_with_rewrite(diagnoses, format!("{}{}", ctx.query, self.1)))
        }
    }

    struct Failing;

    impl LintRule for Failing {
        fn id(&self) -> &str {
            "failing"
        }
        fn name(&self) -> &str {
            "failing"
        }
        fn evaluate(&self, _ctx: &RuleContext) -> Result<RuleOutput, RuleError> {
            Err(RuleError::Evaluation("boom".to_string()))
        }
    }

    struct Panicking;

    impl LintRule for Panicking {
        fn id(&self) -> &str {
            "panicking"
        }
        fn name(&self) -> &str {
            "panicking"
        }
        fn rewrites(&self) -> bool {
            true
        }
        fn evaluate(&self, _ctx: &RuleContext) -> Result<RuleOutput, RuleError> {
            panic!("rule bug")
        }
    }

    /// Claims not to rewrite but returns a different query anyway
    struct Sneaky;

    impl LintRule for Sneaky {
        fn id(&self) -> &str {
            "sneaky"
        }
        fn name(&self) -> &str {
            "sneaky"
        }
        fn evaluate(&self, ctx: &RuleContext) -> Result<RuleOutput, RuleError> {
            Ok(ctx.finish_with_rewrite(vec![], "DROP TABLE users".to_string()))
        }
    }

    /// Rewrites the query to whitespace
    struct Blanking;

    impl LintRule for Blanking {
        fn id(&self) -> &str {
            "blanking"
        }
        fn name(&self) -> &str {
            "blanking"
        }
        fn rewrites(&self) -> bool {
            true
        }
        fn evaluate(&self, ctx: &RuleContext) -> Result<RuleOutput, RuleError> {
            let diagnoses = vec![Diagnose::new("blanking", Severity::High, ctx.query, "")];
            Ok(ctx.finish_with_rewrite(diagnoses, "  \n ".to_string()))
        }
    }

    fn messages(report: &ExecutionReport) -> Vec<(String, String)> {
        report.diagnoses.iter().map(|d| (d.rule_id.clone(), d.message.clone())).collect()
    }

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect()
    }

    #[test]
    fn test_rewrites_compose_left_to_right() {
        let catalog = RuleCatalog::empty()
            .register(Echo("e1"))
            .register(Append("a1", " /*a*/"))
            .register(Echo("e2"))
            .register(Append("a2", " /*b*/"))
            .register(Echo("e3"));
        let report = RuleExecutor::new(Arc::new(catalog)).run("SELECT 1", None, None);

        assert_eq!(
            messages(&report),
            pairs(&[
                ("e1", "SELECT 1"),
                ("a1", "SELECT 1"),
                ("e2", "SELECT 1 /*a*/"),
                ("a2", "SELECT 1 /*a*/"),
                ("e3", "SELECT 1 /*a*/ /*b*/"),
            ])
        );
        assert_eq!(report.final_query, "SELECT 1 /*a*/ /*b*/");
    }

    #[test]
    fn test_rewrites_disabled() {
        let catalog = RuleCatalog::empty().register(Append("a1", " /*a*/")).register(Echo("e1"));
        let config = RuleEngineConfig { enable_rewrites: false, parallel: false };
        let report = RuleExecutor::with_config(Arc::new(catalog), config).run("SELECT 1", None, None);

        assert_eq!(messages(&report), pairs(&[("a1", "SELECT 1"), ("e1", "SELECT 1")]));
        assert_eq!(report.final_query, "SELECT 1");
    }

    #[test]
    fn test_failures_are_isolated() {
        let catalog = RuleCatalog::empty()
            .register(Echo("e1"))
            .register(Failing)
            .register(Panicking)
            .register(Append("a1", " /*a*/"))
            .register(Echo("e2"));
        let report = RuleExecutor::new(Arc::new(catalog)).run("SELECT 1", None, None);

        assert_eq!(
            messages(&report),
            pairs(&[("e1", "SELECT 1"), ("a1", "SELECT 1"), ("e2", "SELECT 1 /*a*/")])
        );
        let failed: Vec<&str> = report.failures.iter().map(|f| f.rule_id.as_str()).collect();
        assert_eq!(failed, vec!["failing", "panicking"]);
        assert!(matches!(&report.failures[1].error, RuleError::Panicked(msg) if msg == "rule bug"));
    }

    #[test]
    fn test_empty_rewrite_keeps_previous_query() {
        let catalog = RuleCatalog::empty()
            .register(Echo("e1"))
            .register(Blanking)
            .register(Echo("e2"))
            .register(Append("a1", " /*a*/"))
            .register(Echo("e3"));
        let report = RuleExecutor::new(Arc::new(catalog)).run("SELECT 1", None, None);

        assert_eq!(
            messages(&report),
            pairs(&[
                ("e1", "SELECT 1"),
                ("e2", "SELECT 1"),
                ("a1", "SELECT 1"),
                ("e3", "SELECT 1 /*a*/"),
            ])
        );
        assert_eq!(report.final_query, "SELECT 1 /*a*/");
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].rule_id, "blanking");
        assert!(matches!(&report.failures[0].error, RuleError::Rewrite(_)));
    }

    #[test]
    fn test_undeclared_rewrite_is_ignored() {
        let catalog = RuleCatalog::empty().register(Sneaky).register(Echo("e1"));
        let report = RuleExecutor::new(Arc::new(catalog)).run("SELECT 1", None, None);

        assert_eq!(report.final_query, "SELECT 1");
        assert_eq!(messages(&report), pairs(&[("e1", "SELECT 1")]));
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let build = || {
            Arc::new(
                RuleCatalog::empty()
                    .register(Echo("e1"))
                    .register(Append("a1", " x"))
                    .register(Echo("e2"))
                    .register(Echo("e3"))
                    .register(Append("a2", " y"))
                    .register(Echo("e4")),
            )
        };
        let sequential = RuleExecutor::with_config(
            build(),
            RuleEngineConfig { enable_rewrites: true, parallel: false },
        )
        .run("SELECT 1", None, None);
        let parallel = RuleExecutor::new(build()).run("SELECT 1", None, None);

        assert_eq!(sequential.diagnoses, parallel.diagnoses);
        assert_eq!(sequential.final_query, parallel.final_query);
    }

    #[test]
    fn test_empty_catalog() {
        let report = RuleExecutor::new(Arc::new(RuleCatalog::empty())).run("SELECT 1", None, None);
        assert!(report.diagnoses.is_empty());
        assert_eq!(report.final_query, "SELECT 1");
    }
}
