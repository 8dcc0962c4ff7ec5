//! Core data types for Dossier research sessions.
//!
//! A [`Session`] is the persisted aggregate for one (subject, target) pair.
//! It owns one [`DomainRecord`] per research domain, each holding the
//! [`DataTable`]s extracted from the model output for that domain.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Current schema version for the session file format.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Default minimum rows for a table to count as populated.
pub const DEFAULT_MIN_ROWS: usize = 2;

/// Normalize one slug component: lowercase, spaces and `-` to `_`, non-word characters stripped.
fn slug_component(s: &str) -> String {
    static NON_WORD_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[^\w]").expect("valid regex"));

    let lowered = s.trim().to_lowercase().replace([' ', '-'], "_");
    NON_WORD_RE.replace_all(&lowered, "").into_owned()
}

/// Deterministic session identifier: `<target>_<subject>`.
pub fn session_slug(subject: &str, target: &str) -> String {
    format!("{}_{}", slug_component(target), slug_component(subject))
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle of a single research domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl DomainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DomainStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall session status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    InProgress,
    Completed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProgress => f.write_str("in_progress"),
            Self::Completed => f.write_str("completed"),
        }
    }
}

/// Confidence attached to a table or a quality summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Confidence {
    High,
    #[default]
    Medium,
    Low,
}

impl Confidence {
    /// Lenient parse of model-provided confidence strings. Unknown values map to `Medium`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_uppercase().as_str() {
            "HIGH" => Self::High,
            "LOW" => Self::Low,
            _ => Self::Medium,
        }
    }
}

/// Which parsing strategy produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseMethod {
    JsonBlock,
    RawJson,
    MarkdownFallback,
    Failed,
}

impl std::fmt::Display for ParseMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::JsonBlock => "json_block",
            Self::RawJson => "raw_json",
            Self::MarkdownFallback => "markdown_fallback",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Tables and logs
// ---------------------------------------------------------------------------

/// A table row. Rows need not populate every header.
pub type Row = BTreeMap<String, serde_json::Value>;

/// Render a row the way the validator searches it.
pub fn render_row(row: &Row) -> String {
    serde_json::to_string(row).unwrap_or_default()
}

/// One structured table extracted for a domain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataTable {
    /// Unique within its domain record.
    pub table_name: String,
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Row>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub confidence_level: Confidence,
    #[serde(default)]
    pub data_gaps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl DataTable {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Populated iff the table has at least `min_rows` rows.
    pub fn is_populated(&self, min_rows: usize) -> bool {
        self.row_count() >= min_rows
    }
}

/// A single search executed while researching a domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchLogEntry {
    pub query: String,
    #[serde(default)]
    pub source_found: String,
    #[serde(default)]
    pub key_data_points: String,
    #[serde(default)]
    pub cached: bool,
    #[serde(default)]
    pub results_count: usize,
    pub timestamp: DateTime<Utc>,
}

/// Quality metrics for one domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualitySummary {
    #[serde(default)]
    pub searches_completed: usize,
    #[serde(default)]
    pub tables_populated: usize,
    #[serde(default)]
    pub confidence_level: Confidence,
    #[serde(default = "default_source_quality")]
    pub primary_source_quality: Confidence,
    #[serde(default = "default_recency")]
    pub data_recency: String,
    #[serde(default)]
    pub validation_gaps: Vec<String>,
    #[serde(default)]
    pub parse_method: Option<ParseMethod>,
}

fn default_source_quality() -> Confidence {
    Confidence::Medium
}
fn default_recency() -> String {
    "Unknown".into()
}

impl Default for QualitySummary {
    fn default() -> Self {
        Self {
            searches_completed: 0,
            tables_populated: 0,
            confidence_level: Confidence::Medium,
            primary_source_quality: default_source_quality(),
            data_recency: default_recency(),
            validation_gaps: Vec::new(),
            parse_method: None,
        }
    }
}

// ---------------------------------------------------------------------------
// DomainRecord
// ---------------------------------------------------------------------------

/// Everything collected for a single research domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainRecord {
    pub domain_id: u32,
    pub domain_name: String,
    #[serde(default)]
    pub status: DomainStatus,
    #[serde(default)]
    pub search_log: Vec<SearchLogEntry>,
    #[serde(default)]
    pub tables: Vec<DataTable>,
    #[serde(default)]
    pub raw_synthesis_output: Option<String>,
    #[serde(default)]
    pub quality_summary: QualitySummary,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub estimated_cost_usd: f64,
}

impl DomainRecord {
    /// A fresh, not-yet-started record.
    pub fn new(domain_id: u32, domain_name: impl Into<String>) -> Self {
        Self {
            domain_id,
            domain_name: domain_name.into(),
            status: DomainStatus::NotStarted,
            search_log: Vec::new(),
            tables: Vec::new(),
            raw_synthesis_output: None,
            quality_summary: QualitySummary::default(),
            started_at: None,
            completed_at: None,
            input_tokens: 0,
            output_tokens: 0,
            estimated_cost_usd: 0.0,
        }
    }

    /// Processing time, when both timestamps are known.
    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }

    pub fn get_table(&self, name: &str) -> Option<&DataTable> {
        self.tables.iter().find(|t| t.table_name == name)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// The persisted aggregate for one (subject, target) research run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub subject: String,
    pub target: String,
    pub session_id: String,
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Next domain to process, 1..=N+1 (N+1 means all complete).
    pub current_domain: u32,
    pub total_domains: u32,
    #[serde(default)]
    pub overall_status: SessionStatus,
    /// Keyed by domain id.
    #[serde(default)]
    pub domains: BTreeMap<u32, DomainRecord>,
    #[serde(default)]
    pub completeness_score: f64,
    #[serde(default)]
    pub data_gaps_summary: Vec<String>,
    #[serde(default)]
    pub total_cost_usd: f64,
}

impl Session {
    /// Create a fresh session with the cursor on the first domain.
    pub fn new(subject: &str, target: &str, total_domains: u32, now: DateTime<Utc>) -> Self {
        Self {
            subject: subject.to_string(),
            target: target.to_string(),
            session_id: session_slug(subject, target),
            schema_version: CURRENT_SCHEMA_VERSION,
            created_at: now,
            updated_at: now,
            current_domain: 1,
            total_domains,
            overall_status: SessionStatus::InProgress,
            domains: BTreeMap::new(),
            completeness_score: 0.0,
            data_gaps_summary: Vec::new(),
            total_cost_usd: 0.0,
        }
    }

    pub fn get_domain(&self, domain_id: u32) -> Option<&DomainRecord> {
        self.domains.get(&domain_id)
    }

    /// Insert or replace a domain record.
    pub fn set_domain(&mut self, record: DomainRecord) {
        self.domains.insert(record.domain_id, record);
    }

    /// Percentage of configured domains in `Completed`.
    pub fn calculate_completeness(&self) -> f64 {
        if self.total_domains == 0 {
            return 0.0;
        }
        let completed = self
            .domains
            .values()
            .filter(|d| d.status == DomainStatus::Completed)
            .count();
        (completed as f64 / self.total_domains as f64) * 100.0
    }

    pub fn completed_domains(&self) -> usize {
        self.domains
            .values()
            .filter(|d| d.status == DomainStatus::Completed)
            .count()
    }

    /// Tables from every domain, in domain order.
    pub fn all_tables(&self) -> Vec<&DataTable> {
        self.domains.values().flat_map(|d| d.tables.iter()).collect()
    }

    /// Recompute every derived field: completeness, total cost, gap summary.
    pub fn refresh_derived(&mut self) {
        self.completeness_score = self.calculate_completeness();
        self.total_cost_usd = self.domains.values().map(|d| d.estimated_cost_usd).sum();
        self.data_gaps_summary = self
            .domains
            .values()
            .flat_map(|d| {
                d.quality_summary
                    .validation_gaps
                    .iter()
                    .map(move |gap| format!("Domain {} ({}): {gap}", d.domain_id, d.domain_name))
            })
            .collect();
    }
}

// ---------------------------------------------------------------------------
// Collaborator payloads
// ---------------------------------------------------------------------------

/// One web search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub source: String,
}

/// Outcome of fetching one page. Fetching never raises; failures land in `error`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchedContent {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl FetchedContent {
    pub fn success(&self) -> bool {
        self.error.is_none() && self.content.as_deref().is_some_and(|c| !c.is_empty())
    }

    pub fn failed(url: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Token counts reported by the LLM provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Cost in USD from per-million-token prices.
    pub fn cost_usd(&self, input_per_mtok: f64, output_per_mtok: f64) -> f64 {
        (self.input_tokens as f64 * input_per_mtok + self.output_tokens as f64 * output_per_mtok)
            / 1_000_000.0
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
    }
}
