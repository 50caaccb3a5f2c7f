//! Analysis result data structures
//!
//! Diagnoses produced by lint rules and the per-query result returned to callers.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

// ============================================================================
// Diagnose
// ============================================================================

/// Severity of a single diagnosis
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "LOW"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::High => write!(f, "HIGH"),
        }
    }
}

/// One finding emitted by a lint rule.
///
/// `line`/`col` are 1-based best-effort positions in the query text the rule saw,
/// `1,1` when the rule cannot localize the issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Diagnose {
    pub rule_id: String,
    pub line: u32,
    pub col: u32,
    pub severity: Severity,
    pub message: String,
    pub recommendation: String,
}

impl Diagnose {
    pub fn new(
        rule_id: &str,
        severity: Severity,
        message: impl Into<String>,
        recommendation: impl Into<String>,
    ) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            line: 1,
            col: 1,
            severity,
            message: message.into(),
            recommendation: recommendation.into(),
        }
    }

    /// Pin the diagnosis to the byte offset `offset` of `query`.
    pub fn at_offset(mut self, query: &str, offset: usize) -> Self {
        let (line, col) = line_col(query, offset);
        self.line = line;
        self.col = col;
        self
    }
}

/// Convert a byte offset into a 1-based (line, column) pair counted in characters.
pub fn line_col(text: &str, offset: usize) -> (u32, u32) {
    let mut offset = offset.min(text.len());
    while !text.is_char_boundary(offset) {
        offset -= 1;
    }
    let before = &text[..offset];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map(|i| i + 1).unwrap_or(0);
    let col = before[line_start..].chars().count() + 1;
    (line as u32, col as u32)
}

// ============================================================================
// Analysis Result
// ============================================================================

/// Final result of analyzing one query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AnalysisResult {
    /// Diagnoses in rule registration order
    pub diagnoses: Vec<Diagnose>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Heuristic rewrite proposed by the rule chain, if it differs from the input
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rewritten_query: Option<String>,
}

impl AnalysisResult {
    pub fn count_by_severity(&self, severity: Severity) -> usize {
        self.diagnoses.iter().filter(|d| d.severity == severity).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_col_first_line() {
        assert_eq!(line_col("SELECT * FROM t", 7), (1, 8));
        assert_eq!(line_col("SELECT * FROM t", 0), (1, 1));
    }

    #[test]
    fn test_line_col_multiline() {
        let sql = "SELECT a\nFROM t\nCROSS JOIN u";
        let offset = sql.find("CROSS").unwrap();
        assert_eq!(line_col(sql, offset), (3, 1));
    }

    #[test]
    fn test_line_col_out_of_range_clamps() {
        assert_eq!(line_col("ab", 99), (1, 3));
    }

    #[test]
    fn test_severity_serializes_uppercase() {
        let json = serde_json::to_string(&Severity::Medium).unwrap();
        assert_eq!(json, "\"MEDIUM\"");
        assert!(Severity::High > Severity::Low);
    }
}
