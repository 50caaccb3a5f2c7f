//! Analysis context: a read-only snapshot of database statistics
//!
//! Assembled once per analysis by the context aggregator. All maps are ordered so
//! rules iterating over them emit diagnoses in a stable order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Statistics categories fetched independently from the database
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextCategory {
    Settings,
    TableStats,
    IndexStats,
    IoStats,
    Activity,
}

impl std::fmt::Display for ContextCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ContextCategory::Settings => "settings",
            ContextCategory::TableStats => "table_stats",
            ContextCategory::IndexStats => "index_stats",
            ContextCategory::IoStats => "io_stats",
            ContextCategory::Activity => "activity",
        };
        f.write_str(name)
    }
}

/// One row of `pg_settings`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingValue {
    pub value: String,
    pub unit: Option<String>,
    /// `pg_settings.context`: user, superuser, sighup, postmaster...
    pub scope: String,
}

impl SettingValue {
    pub fn new(value: &str, unit: Option<&str>) -> Self {
        Self { value: value.to_string(), unit: unit.map(str::to_string), scope: "user".to_string() }
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.value.trim().parse().ok()
    }

    /// Byte size of a memory setting, combining the value with the `unit` column.
    ///
    /// `shared_buffers = 16384` with unit `8kB` is 128 MB. Values with an explicit
    /// suffix ("64MB", "1 GB") are read directly; bare numbers without a unit are bytes.
    pub fn as_bytes(&self) -> Option<u64> {
        let value = self.value.trim();
        if let Ok(number) = value.parse::<f64>() {
            if number < 0.0 {
                return None;
            }
            let multiplier = match self.unit.as_deref() {
                None | Some("") => 1,
                Some(unit) => unit_multiplier(unit)?,
            };
            return Some((number * multiplier as f64) as u64);
        }
        parse_size(value)
    }

    pub fn is_off(&self) -> bool {
        self.value.trim().eq_ignore_ascii_case("off")
    }
}

/// Multiplier of a `pg_settings.unit` value such as "kB", "8kB" or "MB"
fn unit_multiplier(unit: &str) -> Option<u64> {
    let unit = unit.trim();
    let digits_end = unit.find(|c: char| !c.is_ascii_digit()).unwrap_or(unit.len());
    let factor: u64 = if digits_end == 0 { 1 } else { unit[..digits_end].parse().ok()? };
    let base = match unit[digits_end..].to_ascii_uppercase().as_str() {
        "B" => 1,
        "KB" => 1024,
        "MB" => 1024 * 1024,
        "GB" => 1024 * 1024 * 1024,
        "TB" => 1024u64 * 1024 * 1024 * 1024,
        _ => return None,
    };
    Some(factor * base)
}

/// Parse a human readable size: "2 GB", "64MB", "8192 bytes", "512kB", "1024".
///
/// Suffixes KB/MB/GB/TB are binary multiples; a bare number is read as bytes.
pub fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let split = s.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(s.len());
    let value: f64 = s[..split].parse().ok()?;
    let unit = s[split..].trim();

    let multiplier: u64 = match unit.to_ascii_uppercase().as_str() {
        "" | "B" | "BYTES" => 1,
        _ => unit_multiplier(unit)?,
    };
    Some((value * multiplier as f64) as u64)
}

/// One row of `pg_stat_user_tables`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableStats {
    pub live_rows: i64,
    pub dead_rows: i64,
    pub mods_since_analyze: i64,
    pub last_analyze: Option<DateTime<Utc>>,
    pub last_autoanalyze: Option<DateTime<Utc>>,
    /// `pg_size_pretty` of table + indexes + toast
    pub total_size: String,
    /// `pg_size_pretty` of the heap only
    pub table_size: String,
}

impl TableStats {
    pub fn table_size_bytes(&self) -> Option<u64> {
        parse_size(&self.table_size)
    }

    pub fn total_size_bytes(&self) -> Option<u64> {
        parse_size(&self.total_size)
    }

    /// Fraction of dead tuples among all tuples, 0 for an empty table
    pub fn dead_fraction(&self) -> f64 {
        let total = self.live_rows + self.dead_rows;
        if total <= 0 { 0.0 } else { self.dead_rows as f64 / total as f64 }
    }

    /// Most recent manual or automatic analyze
    pub fn last_analyzed(&self) -> Option<DateTime<Utc>> {
        self.last_analyze.max(self.last_autoanalyze)
    }
}

/// One row of `pg_stat_user_indexes`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub schema: String,
    pub table: String,
    pub index: String,
    pub scans: i64,
    pub tuples_read: i64,
    pub tuples_fetched: i64,
    pub size: String,
}

impl IndexStats {
    pub fn size_bytes(&self) -> Option<u64> {
        parse_size(&self.size)
    }

    /// Same key format as the table maps
    pub fn table_key(&self) -> String {
        qualified_name(&self.schema, &self.table)
    }
}

/// One row of `pg_statio_user_tables`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IoStats {
    pub heap_blocks_read: i64,
    pub heap_blocks_hit: i64,
    pub index_blocks_read: i64,
    pub index_blocks_hit: i64,
}

impl IoStats {
    /// Ratio of heap blocks read from disk over blocks found in shared buffers
    pub fn heap_read_ratio(&self) -> Option<f64> {
        (self.heap_blocks_hit > 0).then(|| self.heap_blocks_read as f64 / self.heap_blocks_hit as f64)
    }
}

/// One active backend of `pg_stat_activity`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub pid: i32,
    pub user: Option<String>,
    pub app_name: Option<String>,
    pub client_addr: Option<String>,
    pub query_start: Option<DateTime<Utc>>,
    pub state: Option<String>,
    pub query_preview: String,
}

/// Characters of `pg_stat_activity.query` kept in [`ActivityEntry::query_preview`]
pub const QUERY_PREVIEW_LEN: usize = 100;

impl ActivityEntry {
    /// The preview was cut at [`QUERY_PREVIEW_LEN`] and only holds a prefix of the query
    pub fn is_truncated(&self) -> bool {
        self.query_preview.chars().count() >= QUERY_PREVIEW_LEN
    }
}

/// Snapshot of database state shared read-only by all rules
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisContext {
    pub settings: BTreeMap<String, SettingValue>,
    pub table_stats: BTreeMap<String, TableStats>,
    pub index_stats: Vec<IndexStats>,
    pub io_stats: BTreeMap<String, IoStats>,
    pub activity: Vec<ActivityEntry>,
    pub captured_at: DateTime<Utc>,
    /// Categories whose fetch failed and were replaced by empty values
    pub degraded: Vec<ContextCategory>,
}

impl AnalysisContext {
    pub fn setting(&self, name: &str) -> Option<&SettingValue> {
        self.settings.get(name)
    }

    /// Look up table statistics by the relation name found in a plan node.
    ///
    /// Plan nodes carry the bare relation name and optionally its schema.
    pub fn table(&self, relation: &str, schema: Option<&str>) -> Option<&TableStats> {
        self.table_entry(relation, schema).map(|(_, stats)| stats)
    }

    /// Like [`AnalysisContext::table`], also returning the map key that matched.
    ///
    /// Without a schema the lookup tries `relation`, then `public.relation`, and finally
    /// a `schema.relation` key that is the only one with that table name.
    pub fn table_entry(&self, relation: &str, schema: Option<&str>) -> Option<(&str, &TableStats)> {
        if let Some(schema) = schema {
            return self
                .table_stats
                .get_key_value(&qualified_name(schema, relation))
                .map(|(key, stats)| (key.as_str(), stats));
        }

        if let Some((key, stats)) = self
            .table_stats
            .get_key_value(relation)
            .or_else(|| self.table_stats.get_key_value(&format!("public.{}", relation)))
        {
            return Some((key.as_str(), stats));
        }

        let suffix = format!(".{}", relation);
        let mut matches = self.table_stats.iter().filter(|(key, _)| key.ends_with(&suffix));
        match (matches.next(), matches.next()) {
            (Some((key, stats)), None) => Some((key.as_str(), stats)),
            _ => None,
        }
    }

    /// Indexes defined on a table, in fetch order
    pub fn indexes_of<'a>(&'a self, table_key: &'a str) -> impl Iterator<Item = &'a IndexStats> + 'a {
        self.index_stats.iter().filter(move |idx| idx.table_key() == table_key)
    }

    pub fn index(&self, name: &str) -> Option<&IndexStats> {
        self.index_stats.iter().find(|idx| idx.index == name)
    }
}

/// Key used by the table maps: `schema.table`, or `table` for the public schema
pub fn qualified_name(schema: &str, table: &str) -> String {
    if schema.is_empty() || schema == "public" {
        table.to_string()
    } else {
        format!("{}.{}", schema, table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("2 GB"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_size("64MB"), Some(64 * 1024 * 1024));
        assert_eq!(parse_size("8192 bytes"), Some(8192));
        assert_eq!(parse_size("512 kB"), Some(512 * 1024));
        assert_eq!(parse_size("1.5 TB"), Some((1.5 * 1024f64.powi(4)) as u64));
        assert_eq!(parse_size("1024"), Some(1024));
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("lots"), None);
        assert_eq!(parse_size("12 parsecs"), None);
    }

    #[test]
    fn test_setting_bytes_with_unit_column() {
        assert_eq!(SettingValue::new("4096", Some("kB")).as_bytes(), Some(4 * 1024 * 1024));
        assert_eq!(SettingValue::new("16384", Some("8kB")).as_bytes(), Some(128 * 1024 * 1024));
        assert_eq!(SettingValue::new("64MB", None).as_bytes(), Some(64 * 1024 * 1024));
        assert_eq!(SettingValue::new("2048", None).as_bytes(), Some(2048));
        assert_eq!(SettingValue::new("-1", Some("kB")).as_bytes(), None);
        assert_eq!(SettingValue::new("12", Some("s")).as_bytes(), None);
    }

    #[test]
    fn test_table_lookup() {
        let mut context = AnalysisContext::default();
        context.table_stats.insert("orders".to_string(), TableStats::default());
        context.table_stats.insert(
            "sales.invoices".to_string(),
            TableStats { live_rows: 7, ..Default::default() },
        );

        assert!(context.table("orders", None).is_some());
        assert!(context.table("orders", Some("public")).is_some());
        assert_eq!(context.table("invoices", Some("sales")).map(|t| t.live_rows), Some(7));
        assert!(context.table("invoices", Some("billing")).is_none());
    }

    #[test]
    fn test_table_lookup_without_schema() {
        let mut context = AnalysisContext::default();
        context.table_stats.insert(
            "sales.invoices".to_string(),
            TableStats { live_rows: 7, ..Default::default() },
        );
        context.table_stats.insert("sales.items".to_string(), TableStats::default());
        context.table_stats.insert("archive.items".to_string(), TableStats::default());

        assert_eq!(
            context.table_entry("invoices", None).map(|(key, t)| (key, t.live_rows)),
            Some(("sales.invoices", 7))
        );
        // Ambiguous across schemas
        assert!(context.table("items", None).is_none());
        assert!(context.table("missing", None).is_none());
    }

    #[test]
    fn test_dead_fraction() {
        let stats = TableStats { live_rows: 75, dead_rows: 25, ..Default::default() };
        assert!((stats.dead_fraction() - 0.25).abs() < f64::EPSILON);
        assert_eq!(TableStats::default().dead_fraction(), 0.0);
    }
}
