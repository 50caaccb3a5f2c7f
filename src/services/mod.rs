pub mod sql_analyzer;

pub use sql_analyzer::{AnalysisError, SqlAnalyzer};
