//! Rule catalog and executor

pub mod rule_engine;
pub mod rules;

pub use rule_engine::{ExecutionReport, RuleEngineConfig, RuleExecutor, RuleFailure};
pub use rules::{
    LintRule, RuleCatalog, RuleContext, RuleDescriptor, RuleError, RuleOutput, init_catalog,
};
