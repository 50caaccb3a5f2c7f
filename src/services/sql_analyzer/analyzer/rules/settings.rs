//! Server setting rules
//!
//! Each rule is a table of settings checked against a recommended `[low, high]` range.
//! Values outside the range yield one diagnosis; missing or unparsable settings are skipped.

use super::*;
use crate::services::sql_analyzer::context::SettingValue;

const KB: f64 = 1024.0;
const MB: f64 = 1024.0 * KB;
const GB: f64 = 1024.0 * MB;

/// How a setting value is interpreted before comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    /// Plain number, compared as-is
    Number,
    /// Memory size, compared in bytes
    Bytes,
}

/// Recommended range for one setting
#[derive(Debug, Clone)]
pub struct SettingBound {
    pub name: &'static str,
    pub kind: SettingKind,
    pub low: f64,
    pub high: f64,
    pub low_severity: Severity,
    pub high_severity: Severity,
    pub increase: &'static str,
    pub decrease: &'static str,
}

/// A boolean setting that should not be turned off
#[derive(Debug, Clone)]
pub struct SettingSwitch {
    pub name: &'static str,
    pub severity: Severity,
    pub message: &'static str,
    pub recommendation: &'static str,
}

/// Table driven threshold-on-setting rule
pub struct SettingThresholds {
    id: &'static str,
    name: &'static str,
    switches: Vec<SettingSwitch>,
    bounds: Vec<SettingBound>,
}

#[allow(clippy::too_many_arguments)]
fn bound(
    name: &'static str,
    kind: SettingKind,
    low: f64,
    high: f64,
    low_severity: Severity,
    high_severity: Severity,
    increase: &'static str,
    decrease: &'static str,
) -> SettingBound {
    SettingBound { name, kind, low, high, low_severity, high_severity, increase, decrease }
}

impl SettingThresholds {
    pub fn new(
        id: &'static str,
        name: &'static str,
        switches: Vec<SettingSwitch>,
        bounds: Vec<SettingBound>,
    ) -> Self {
        Self { id, name, switches, bounds }
    }

    /// autovacuum_tuning: autovacuum daemon configuration
    #[rustfmt::skip]
    pub fn autovacuum_tuning() -> Self {
        use SettingKind::Number;
        use Severity::{High, Low};

        let switches = vec![
            SettingSwitch {
                name: "autovacuum",
                severity: High,
                message: "Autovacuum is disabled",
                recommendation: "Enable autovacuum; without it dead rows accumulate and statistics go stale",
            },
            SettingSwitch {
                name: "track_counts",
                severity: High,
                message: "track_counts is disabled, autovacuum cannot decide which tables need work",
                recommendation: "Set track_counts = on",
            },
        ];

        let bounds = vec![
            bound(
                "autovacuum_vacuum_scale_factor", Number, 0.05, 0.3, Low, Low,
                "Increase autovacuum_vacuum_scale_factor to 0.1-0.2 to avoid vacuuming small changes",
                "Decrease autovacuum_vacuum_scale_factor to 0.1-0.2 so large tables are vacuumed sooner",
            ),
            bound(
                "autovacuum_analyze_scale_factor", Number, 0.01, 0.2, Low, Low,
                "Increase autovacuum_analyze_scale_factor to around 0.05",
                "Decrease autovacuum_analyze_scale_factor to 0.05-0.1 to keep planner statistics fresh",
            ),
            bound(
                "autovacuum_vacuum_threshold", Number, 10.0, 100.0, Low, Low,
                "Increase autovacuum_vacuum_threshold to about 50",
                "Decrease autovacuum_vacuum_threshold to about 50",
            ),
            bound(
                "autovacuum_analyze_threshold", Number, 10.0, 100.0, Low, Low,
                "Increase autovacuum_analyze_threshold to about 50",
                "Decrease autovacuum_analyze_threshold to about 50",
            ),
            bound(
                "autovacuum_vacuum_cost_limit", Number, 100.0, 2000.0, Low, Low,
                "Increase autovacuum_vacuum_cost_limit so vacuum keeps up with write load",
                "Decrease autovacuum_vacuum_cost_limit to limit vacuum I/O pressure",
            ),
            bound(
                "autovacuum_vacuum_cost_delay", Number, 2.0, 20.0, Low, Low,
                "Increase autovacuum_vacuum_cost_delay to 2ms to throttle vacuum I/O",
                "Decrease autovacuum_vacuum_cost_delay to 2ms so vacuum finishes faster",
            ),
            bound(
                "autovacuum_freeze_max_age", Number, 100_000_000.0, 300_000_000.0, Low, Low,
                "Increase autovacuum_freeze_max_age to about 200 million to avoid needless freezing",
                "Decrease autovacuum_freeze_max_age to about 200 million to reduce wraparound risk",
            ),
            bound(
                "autovacuum_multixact_freeze_max_age", Number, 200_000_000.0, 600_000_000.0, Low, Low,
                "Increase autovacuum_multixact_freeze_max_age to about 400 million",
                "Decrease autovacuum_multixact_freeze_max_age to about 400 million",
            ),
            bound(
                "autovacuum_max_workers", Number, 2.0, 10.0, Low, Low,
                "Increase autovacuum_max_workers to 3-5",
                "Decrease autovacuum_max_workers; each worker competes for I/O",
            ),
            bound(
                "autovacuum_naptime", Number, 30.0, 120.0, Low, Low,
                "Increase autovacuum_naptime to about 60s",
                "Decrease autovacuum_naptime to about 60s so busy tables are checked more often",
            ),
        ];

        Self::new("autovacuum_tuning", "Autovacuum tuning", switches, bounds)
    }

    /// database_tuning: memory, planner and connection settings
    #[rustfmt::skip]
    pub fn database_tuning() -> Self {
        use SettingKind::{Bytes, Number};
        use Severity::{High, Low, Medium};

        let switches = vec![SettingSwitch {
            name: "ssl",
            severity: High,
            message: "SSL is disabled for client connections",
            recommendation: "Enable ssl and require it in pg_hba.conf (hostssl)",
        }];

        let bounds = vec![
            bound(
                "work_mem", Bytes, 16.0 * MB, 256.0 * MB, Medium, Low,
                "Increase work_mem to at least 16MB so sorts and hashes stay in memory",
                "Decrease work_mem; it is allocated per sort/hash node and per connection",
            ),
            bound(
                "shared_buffers", Bytes, 512.0 * MB, 8.0 * GB, High, Low,
                "Increase shared_buffers to about 25% of system memory",
                "Decrease shared_buffers to about 25% of system memory, the OS cache covers the rest",
            ),
            bound(
                "effective_cache_size", Bytes, 2.0 * GB, 16.0 * GB, Medium, Low,
                "Increase effective_cache_size to 50-75% of system memory",
                "Decrease effective_cache_size to 50-75% of the memory actually available",
            ),
            bound(
                "maintenance_work_mem", Bytes, 128.0 * MB, 2.0 * GB, Low, Low,
                "Increase maintenance_work_mem to speed up VACUUM and CREATE INDEX",
                "Decrease maintenance_work_mem; autovacuum workers each allocate it",
            ),
            bound(
                "random_page_cost", Number, 1.0, 1.5, Low, Low,
                "Increase random_page_cost to 1.1",
                "Decrease random_page_cost to 1.1-1.5 on SSD storage so index scans are preferred",
            ),
            bound(
                "effective_io_concurrency", Number, 2.0, 200.0, Low, Low,
                "Increase effective_io_concurrency to about 200 on SSD storage",
                "Decrease effective_io_concurrency to 200 or lower",
            ),
            bound(
                "checkpoint_completion_target", Number, 0.7, 0.9, Low, Low,
                "Increase checkpoint_completion_target to 0.9 to spread checkpoint I/O",
                "Decrease checkpoint_completion_target to 0.9",
            ),
            bound(
                "wal_buffers", Bytes, 16.0 * MB, 64.0 * MB, Low, Low,
                "Increase wal_buffers to 16MB",
                "Decrease wal_buffers to 16-64MB",
            ),
            bound(
                "max_connections", Number, 50.0, 200.0, Low, Medium,
                "Increase max_connections to at least 50",
                "Decrease max_connections and put a connection pooler (PgBouncer) in front",
            ),
        ];

        Self::new("database_tuning", "Database tuning", switches, bounds)
    }

    fn check_bound(&self, bound: &SettingBound, setting: &SettingValue) -> Option<Diagnose> {
        let value = match bound.kind {
            SettingKind::Number => setting.as_f64()?,
            SettingKind::Bytes => setting.as_bytes()? as f64,
        };
        // -1 and friends mean "inherit" or "auto"
        if value < 0.0 {
            return None;
        }

        let render = |v: f64| match bound.kind {
            SettingKind::Number => format!("{}", v),
            SettingKind::Bytes => format_bytes(v as u64),
        };

        if value < bound.low {
            Some(Diagnose::new(
                self.id,
                bound.low_severity,
                format!("{} is {}, below the recommended minimum of {}", bound.name, render(value), render(bound.low)),
                bound.increase,
            ))
        } else if value > bound.high {
            Some(Diagnose::new(
                self.id,
                bound.high_severity,
                format!("{} is {}, above the recommended maximum of {}", bound.name, render(value), render(bound.high)),
                bound.decrease,
            ))
        } else {
            None
        }
    }
}

impl LintRule for SettingThresholds {
    fn id(&self) -> &str {
        self.id
    }
    fn name(&self) -> &str {
        self.name
    }

    fn evaluate(&self, ctx: &RuleContext) -> Result<RuleOutput, RuleError> {
        let mut diagnoses = Vec::new();

        for switch in &self.switches {
            if ctx.context.setting(switch.name).is_some_and(SettingValue::is_off) {
                diagnoses.push(Diagnose::new(self.id, switch.severity, switch.message, switch.recommendation));
            }
        }

        for bound in &self.bounds {
            if let Some(setting) = ctx.context.setting(bound.name)
                && let Some(diagnose) = self.check_bound(bound, setting)
            {
                diagnoses.push(diagnose);
            }
        }

        Ok(ctx.finish(diagnoses))
    }
}
