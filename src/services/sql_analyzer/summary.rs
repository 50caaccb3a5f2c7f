//! Result aggregation and free-text summaries

use super::models::{AnalysisResult, Diagnose, Severity};

/// Optional post-step producing the `summary` text of a result
pub trait Summarizer: Send + Sync {
    fn summarize(&self, result: &AnalysisResult) -> Option<String>;
}

/// Deterministic summary: issue counts by severity plus the most severe recommendation
#[derive(Debug, Default, Clone, Copy)]
pub struct SeverityBreakdownSummarizer;

impl Summarizer for SeverityBreakdownSummarizer {
    fn summarize(&self, result: &AnalysisResult) -> Option<String> {
        if result.diagnoses.is_empty() {
            return Some("No issues found in the analysis.".to_string());
        }

        let mut text = format!(
            "Analysis summary: {} issue(s) found ({} high, {} medium, {} low).",
            result.diagnoses.len(),
            result.count_by_severity(Severity::High),
            result.count_by_severity(Severity::Medium),
            result.count_by_severity(Severity::Low),
        );
        if let Some(top) = most_severe(&result.diagnoses) {
            text.push_str(" Top recommendation: ");
            text.push_str(&top.recommendation);
        }
        Some(text)
    }
}

/// First diagnosis carrying the highest severity
fn most_severe(diagnoses: &[Diagnose]) -> Option<&Diagnose> {
    diagnoses.iter().fold(None, |best: Option<&Diagnose>, d| match best {
        Some(b) if b.severity >= d.severity => Some(b),
        _ => Some(d),
    })
}

/// Packs rule output into the public result shape. No dedup, no ranking.
pub struct ResultAggregator;

impl ResultAggregator {
    pub fn build(diagnoses: Vec<Diagnose>, summary: Option<String>) -> AnalysisResult {
        AnalysisResult { diagnoses, summary, rewritten_query: None }
    }
}
