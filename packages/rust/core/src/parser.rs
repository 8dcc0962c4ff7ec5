//! Multi-strategy extraction of structured tables from free-form model output.
//!
//! [`parse`] never fails. It tries, in order:
//!
//! 1. fenced JSON blocks (```` ```json ```` or bare ```` ``` ````)
//! 2. the whole text as JSON
//! 3. Markdown pipe tables
//!
//! and reports which one succeeded in [`ParseResult::parse_method`]. When all
//! three fail the result carries every structural error collected on the way.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use dossier_shared::{Confidence, DataTable, ParseMethod, Row};

/// Data gap attached to every Markdown-fallback payload.
pub const FALLBACK_GAP: &str = "Structured output parsing failed - extracted from markdown";

/// Final error appended when no strategy produced a payload.
pub const ALL_STRATEGIES_FAILED: &str = "all parsing strategies failed";

/// How far back (in characters) to look for a heading naming a Markdown table.
const HEADING_LOOKBACK_CHARS: usize = 200;

/// Maximum length of a slugified table name.
const MAX_TABLE_NAME_CHARS: usize = 50;

static EMPTY_TABLES: BTreeMap<String, DataTable> = BTreeMap::new();

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// One `search_log` entry as reported by the model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportedSearch {
    pub query: String,
    pub source_found: String,
    pub key_data_points: String,
}

/// The model's own `quality_summary`. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportedQuality {
    pub searches_completed: Option<usize>,
    pub tables_populated: Option<usize>,
    pub confidence_level: Option<Confidence>,
    pub primary_source_quality: Option<Confidence>,
    pub data_recency: Option<String>,
}

/// Everything extracted from one model response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedPayload {
    /// Tables keyed by name; each table's `table_name` equals its key.
    pub tables: BTreeMap<String, DataTable>,
    pub search_log: Vec<ReportedSearch>,
    pub data_gaps: Vec<String>,
    pub quality_summary: ReportedQuality,
    pub named_entities: Option<Value>,
}

/// Outcome of [`parse`].
#[derive(Debug, Clone, PartialEq)]
pub struct ParseResult {
    pub success: bool,
    pub payload: Option<ParsedPayload>,
    pub errors: Vec<String>,
    pub raw_output: String,
    pub parse_method: ParseMethod,
}

impl ParseResult {
    /// Extracted tables; empty for a failed parse.
    pub fn tables(&self) -> &BTreeMap<String, DataTable> {
        self.payload.as_ref().map_or(&EMPTY_TABLES, |p| &p.tables)
    }

    pub fn table(&self, name: &str) -> Option<&DataTable> {
        self.tables().get(name)
    }

    /// Payload-level data gaps; empty for a failed parse.
    pub fn data_gaps(&self) -> &[String] {
        self.payload.as_ref().map_or(&[], |p| p.data_gaps.as_slice())
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Extract a structured payload from raw model output.
pub fn parse(raw_text: &str) -> ParseResult {
    let mut errors = Vec::new();

    // Strategy 1: fenced blocks.
    if let Some(candidate) = first_fenced_candidate(raw_text) {
        let issues = structural_errors(&candidate);
        if issues.is_empty() {
            debug!("parsed fenced JSON block");
            return success(raw_text, payload_from_json(&candidate), ParseMethod::JsonBlock, errors);
        }
        errors.extend(issues);
    }

    // Strategy 2: the whole text.
    match serde_json::from_str::<Value>(raw_text.trim()) {
        Ok(value) => {
            let issues = structural_errors(&value);
            if issues.is_empty() {
                debug!("parsed raw JSON");
                return success(raw_text, payload_from_json(&value), ParseMethod::RawJson, errors);
            }
            errors.extend(issues);
        }
        Err(e) => debug!(error = %e, "output is not raw JSON"),
    }

    // Strategy 3: Markdown tables.
    let tables = markdown_tables(raw_text);
    if !tables.is_empty() {
        warn!(tables = tables.len(), "structured parsing failed, using markdown tables");
        let payload = ParsedPayload {
            tables,
            data_gaps: vec![FALLBACK_GAP.to_string()],
            ..ParsedPayload::default()
        };
        return success(raw_text, payload, ParseMethod::MarkdownFallback, errors);
    }

    errors.push(ALL_STRATEGIES_FAILED.to_string());
    warn!(errors = errors.len(), "all parsing strategies failed");
    ParseResult {
        success: false,
        payload: None,
        errors,
        raw_output: raw_text.to_string(),
        parse_method: ParseMethod::Failed,
    }
}

fn success(
    raw_text: &str,
    payload: ParsedPayload,
    parse_method: ParseMethod,
    errors: Vec<String>,
) -> ParseResult {
    ParseResult {
        success: true,
        payload: Some(payload),
        errors,
        raw_output: raw_text.to_string(),
        parse_method,
    }
}

// ---------------------------------------------------------------------------
// JSON strategies
// ---------------------------------------------------------------------------

/// First fenced block, in order of appearance, decoding to an object with `tables`.
fn first_fenced_candidate(text: &str) -> Option<Value> {
    static FENCE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)\s*```").expect("valid regex"));

    FENCE_RE
        .captures_iter(text)
        .filter_map(|caps| serde_json::from_str::<Value>(caps.get(1)?.as_str()).ok())
        .find(|v| v.get("tables").is_some())
}

/// Every structural violation in a decoded payload.
fn structural_errors(value: &Value) -> Vec<String> {
    let Some(root) = value.as_object() else {
        return vec!["root must be an object".into()];
    };
    let Some(tables) = root.get("tables") else {
        return vec!["missing 'tables' key".into()];
    };
    let Some(tables) = tables.as_object() else {
        return vec!["'tables' must be an object".into()];
    };

    let mut errors = Vec::new();
    for (name, table) in tables {
        let Some(table) = table.as_object() else {
            errors.push(format!("table '{name}' must be an object"));
            continue;
        };
        if !table.contains_key("headers") {
            errors.push(format!("table '{name}' missing 'headers'"));
        }
        match table.get("rows") {
            None => errors.push(format!("table '{name}' missing 'rows'")),
            Some(rows) if !rows.is_array() => {
                errors.push(format!("table '{name}' rows must be a list"))
            }
            Some(_) => {}
        }
    }
    errors
}

/// Build a payload from a structurally valid JSON value. Unknown shapes inside
/// otherwise valid tables are read leniently.
fn payload_from_json(value: &Value) -> ParsedPayload {
    let empty = Map::new();
    let root = value.as_object().unwrap_or(&empty);

    let tables = root
        .get("tables")
        .and_then(Value::as_object)
        .map(|tables| {
            tables
                .iter()
                .filter_map(|(name, t)| Some((name.clone(), table_from_json(name, t.as_object()?))))
                .collect()
        })
        .unwrap_or_default();

    let search_log = root
        .get("search_log")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(Value::as_object)
                .map(|e| ReportedSearch {
                    query: text_field(e, "query"),
                    source_found: text_field(e, "source_found"),
                    key_data_points: text_field(e, "key_data_points"),
                })
                .collect()
        })
        .unwrap_or_default();

    let quality_summary = root
        .get("quality_summary")
        .and_then(Value::as_object)
        .map(|q| ReportedQuality {
            searches_completed: count_field(q, "searches_completed"),
            tables_populated: count_field(q, "tables_populated"),
            confidence_level: q.get("confidence_level").and_then(Value::as_str).map(Confidence::from_label),
            primary_source_quality: q
                .get("primary_source_quality")
                .and_then(Value::as_str)
                .map(Confidence::from_label),
            data_recency: q.get("data_recency").map(value_text),
        })
        .unwrap_or_default();

    ParsedPayload {
        tables,
        search_log,
        data_gaps: string_list(root.get("data_gaps")),
        quality_summary,
        named_entities: root.get("named_entities").cloned(),
    }
}

fn table_from_json(name: &str, table: &Map<String, Value>) -> DataTable {
    let headers = string_list(table.get("headers"));
    let rows = table
        .get("rows")
        .and_then(Value::as_array)
        .map(|rows| rows.iter().map(|r| row_from_json(r, &headers)).collect())
        .unwrap_or_default();

    DataTable {
        table_name: name.to_string(),
        headers,
        rows,
        sources: string_list(table.get("sources")),
        confidence_level: table
            .get("confidence_level")
            .and_then(Value::as_str)
            .map(Confidence::from_label)
            .unwrap_or_default(),
        data_gaps: string_list(table.get("data_gaps")),
        notes: table.get("notes").and_then(Value::as_str).map(str::to_string),
    }
}

/// Objects are taken as-is; arrays are zipped onto the headers. Any other
/// value becomes a one-cell row under the first header (or `value`).
fn row_from_json(row: &Value, headers: &[String]) -> Row {
    match row {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        Value::Array(cells) => headers
            .iter()
            .zip(cells)
            .map(|(h, v)| (h.clone(), v.clone()))
            .collect(),
        scalar => {
            let key = headers.first().map_or("value", String::as_str);
            Row::from([(key.to_string(), scalar.clone())])
        }
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().map(value_text).collect())
        .unwrap_or_default()
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn text_field(map: &Map<String, Value>, key: &str) -> String {
    map.get(key).map(value_text).unwrap_or_default()
}

fn count_field(map: &Map<String, Value>, key: &str) -> Option<usize> {
    match map.get(key)? {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Markdown fallback
// ---------------------------------------------------------------------------

/// Pipe tables found in `text`, each at `LOW` confidence.
fn markdown_tables(text: &str) -> BTreeMap<String, DataTable> {
    static TABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?:^|\n)(\|[^\n]+\|)\n(\|[-:| ]+\|)\n((?:\|[^\n]+\|\n?)+)")
            .expect("valid regex")
    });

    let normalized: String = text
        .replace("\r\n", "\n")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");

    let mut tables = BTreeMap::new();
    for (index, caps) in TABLE_RE.captures_iter(&normalized).enumerate() {
        let (Some(header), Some(body)) = (caps.get(1), caps.get(3)) else {
            continue;
        };

        let headers: Vec<String> = split_cells(header.as_str())
            .into_iter()
            .filter(|h| !h.is_empty())
            .collect();
        if headers.is_empty() {
            continue;
        }

        let rows: Vec<Row> = body
            .as_str()
            .lines()
            .map(split_cells)
            .filter(|cells| cells.iter().any(|c| !c.is_empty()))
            .map(|cells| {
                headers
                    .iter()
                    .zip(cells)
                    .map(|(h, c)| (h.clone(), Value::String(c)))
                    .collect()
            })
            .collect();
        if rows.is_empty() {
            continue;
        }

        let base = heading_before(&normalized, header.start())
            .map(|h| slugify(&h))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("table_{}", index + 1));
        let name = unique_name(&tables, base);

        tables.insert(
            name.clone(),
            DataTable {
                table_name: name,
                headers,
                rows,
                confidence_level: Confidence::Low,
                ..DataTable::default()
            },
        );
    }
    tables
}

fn split_cells(line: &str) -> Vec<String> {
    line.trim()
        .trim_start_matches('|')
        .trim_end_matches('|')
        .split('|')
        .map(|c| c.trim().to_string())
        .collect()
}

/// Heading on the last non-blank line before byte offset `pos`, if that line
/// lies within the lookback window.
fn heading_before(text: &str, pos: usize) -> Option<String> {
    static HEADING_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^#+[ \t]*(.+?)[ \t#]*$").expect("valid regex"));

    let window_start = text[..pos]
        .char_indices()
        .rev()
        .nth(HEADING_LOOKBACK_CHARS - 1)
        .map_or(0, |(i, _)| i);
    let last_line = text[window_start..pos].trim_end().rsplit('\n').next()?;
    HEADING_RE
        .captures(last_line.trim_start())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Lowercase, punctuation stripped, whitespace runs to `_`, capped length.
fn slugify(heading: &str) -> String {
    static PUNCT_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[^\w\s]").expect("valid regex"));
    static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

    let lowered = heading.to_lowercase();
    let stripped = PUNCT_RE.replace_all(&lowered, "");
    let slug = SPACE_RE.replace_all(stripped.trim(), "_");
    slug.chars().take(MAX_TABLE_NAME_CHARS).collect()
}

fn unique_name(existing: &BTreeMap<String, DataTable>, base: String) -> String {
    if !existing.contains_key(&base) {
        return base;
    }
    (2..)
        .map(|n| format!("{base}_{n}"))
        .find(|candidate| !existing.contains_key(candidate))
        .unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_payload() -> Value {
        json!({
            "search_log": [
                {"query": "asthma prevalence france", "source_found": "who.int", "key_data_points": "6.7%"}
            ],
            "tables": {
                "prevalence_incidence": {
                    "headers": ["Metric", "Value", "Source"],
                    "rows": [
                        {"Metric": "Prevalence", "Value": "6.7%", "Source": "WHO"},
                        {"Metric": "Incidence", "Value": "NOT_FOUND", "Source": "n/a"}
                    ],
                    "sources": ["https://www.who.int"],
                    "confidence_level": "HIGH"
                },
                "demographics": {
                    "headers": ["Category", "Value"],
                    "rows": [
                        {"Category": "female", "Value": "55%"},
                        {"Category": "male", "Value": "45%"}
                    ],
                    "sources": [],
                    "confidence_level": "MEDIUM",
                    "notes": "2022 survey"
                }
            },
            "data_gaps": ["No incidence data"],
            "quality_summary": {
                "searches_completed": 12,
                "tables_populated": 2,
                "confidence_level": "HIGH",
                "primary_source_quality": "MEDIUM",
                "data_recency": "2020-2024"
            }
        })
    }

    #[test]
    fn fenced_block_round_trip() {
        let payload = sample_payload();
        let text = format!(
            "Here is the analysis.\n\n```json\n{}\n```\n\nLet me know if you need more.",
            serde_json::to_string_pretty(&payload).unwrap()
        );

        let result = parse(&text);
        assert!(result.success);
        assert_eq!(result.parse_method, ParseMethod::JsonBlock);
        assert!(result.errors.is_empty());

        let original = payload["tables"].as_object().unwrap();
        assert_eq!(result.tables().len(), original.len());
        for (name, table) in original {
            let parsed = result.table(name).unwrap();
            assert_eq!(parsed.table_name, *name);
            let headers: Vec<String> = serde_json::from_value(table["headers"].clone()).unwrap();
            let rows: Vec<Row> = serde_json::from_value(table["rows"].clone()).unwrap();
            let sources: Vec<String> = serde_json::from_value(table["sources"].clone()).unwrap();
            assert_eq!(parsed.headers, headers);
            assert_eq!(parsed.rows, rows);
            assert_eq!(parsed.sources, sources);
            assert_eq!(
                parsed.confidence_level,
                Confidence::from_label(table["confidence_level"].as_str().unwrap())
            );
        }

        let prevalence = result.table("prevalence_incidence").unwrap();
        assert_eq!(prevalence.headers, vec!["Metric", "Value", "Source"]);
        assert_eq!(prevalence.rows.len(), 2);
        assert_eq!(prevalence.rows[0]["Value"], json!("6.7%"));
        assert_eq!(prevalence.confidence_level, Confidence::High);
        assert_eq!(
            result.table("demographics").unwrap().notes.as_deref(),
            Some("2022 survey")
        );

        let p = result.payload.unwrap();
        assert_eq!(p.data_gaps, vec!["No incidence data"]);
        assert_eq!(p.search_log[0].source_found, "who.int");
        assert_eq!(p.quality_summary.searches_completed, Some(12));
        assert_eq!(p.quality_summary.data_recency.as_deref(), Some("2020-2024"));
    }

    #[test]
    fn generic_fence_and_first_candidate_wins() {
        let text = "```\n{\"note\": \"no tables here\"}\n```\n\
                    ```\n{\"tables\": {\"a\": {\"headers\": [\"x\"], \"rows\": [{\"x\": 1}]}}}\n```\n\
                    ```json\n{\"tables\": {\"b\": {\"headers\": [\"y\"], \"rows\": []}}}\n```";
        let result = parse(text);
        assert_eq!(result.parse_method, ParseMethod::JsonBlock);
        assert!(result.table("a").is_some());
        assert!(result.table("b").is_none());
    }

    #[test]
    fn raw_json_strategy() {
        let text = format!("  {}  ", sample_payload());
        let result = parse(&text);
        assert!(result.success);
        assert_eq!(result.parse_method, ParseMethod::RawJson);
        assert_eq!(result.tables().len(), 2);
    }

    #[test]
    fn structural_errors_are_collected() {
        let value = json!({
            "tables": {
                "a": [],
                "b": {"rows": []},
                "c": {"headers": []},
                "d": {"headers": [], "rows": "none"}
            }
        });
        let errors = structural_errors(&value);
        assert_eq!(
            errors,
            vec![
                "table 'a' must be an object",
                "table 'b' missing 'headers'",
                "table 'c' missing 'rows'",
                "table 'd' rows must be a list",
            ]
        );
        assert_eq!(structural_errors(&json!([1])), vec!["root must be an object"]);
        assert_eq!(structural_errors(&json!({})), vec!["missing 'tables' key"]);
        assert_eq!(
            structural_errors(&json!({"tables": []})),
            vec!["'tables' must be an object"]
        );
    }

    #[test]
    fn invalid_fenced_candidate_falls_through_to_markdown() {
        let text = "```json\n{\"tables\": {\"a\": {\"headers\": [\"x\"]}}}\n```\n\n\
                    ## Prevalence Data\n\n\
                    | Metric | Value |\n\
                    |---|---|\n\
                    | Prevalence | 6.7% |\n\
                    | Incidence | 0.5% |\n";
        let result = parse(text);
        assert!(result.success);
        assert_eq!(result.parse_method, ParseMethod::MarkdownFallback);
        assert!(result.errors.contains(&"table 'a' missing 'rows'".to_string()));
        assert!(result.table("prevalence_data").is_some());
    }

    #[test]
    fn markdown_fallback_tables_are_low_confidence() {
        let text = "I could not produce JSON, but here is what I found.\n\n\
                    ### Prevalence & Incidence (2023)\n\n\
                    | Metric | Value | Source |\n\
                    | :--- | ---: | --- |\n\
                    | Prevalence | 6.7% | WHO |\n\
                    | Incidence | NOT_FOUND |\n\
                    \n\
                    Some commentary in between.\n\n\
                    | Segment | Share |\n\
                    |---|---|\n\
                    | Mild | 60% |\n";

        let result = parse(text);
        assert!(result.success);
        assert_eq!(result.parse_method, ParseMethod::MarkdownFallback);
        assert_eq!(result.tables().len(), 2);
        assert!(result.tables().values().all(|t| t.confidence_level == Confidence::Low));
        assert_eq!(result.data_gaps().to_vec(), vec![FALLBACK_GAP.to_string()]);

        let first = result.table("prevalence_incidence_2023").unwrap();
        assert_eq!(first.headers, vec!["Metric", "Value", "Source"]);
        assert_eq!(first.rows.len(), 2);
        // Short rows are zipped, not rejected.
        assert_eq!(first.rows[1].len(), 2);
        assert_eq!(first.rows[1]["Value"], json!("NOT_FOUND"));

        assert!(result.tables().contains_key("table_2"));
    }

    #[test]
    fn duplicate_markdown_headings_get_suffixes() {
        let table = "| a | b |\n|---|---|\n| 1 | 2 |\n";
        let text = format!("## Costs\n{table}\n## Costs\n{table}");
        let result = parse(&text);
        assert!(result.tables().contains_key("costs"));
        assert!(result.tables().contains_key("costs_2"));
    }

    #[test]
    fn prose_fails_every_strategy() {
        let result = parse("I'm sorry, I could not find any reliable data for this request.");
        assert!(!result.success);
        assert_eq!(result.parse_method, ParseMethod::Failed);
        assert!(result.payload.is_none());
        assert!(result.tables().is_empty());
        assert_eq!(result.errors.last().map(String::as_str), Some(ALL_STRATEGIES_FAILED));
    }

    #[test]
    fn failed_parse_keeps_earlier_errors() {
        let result = parse("{\"tables\": 3}");
        assert!(!result.success);
        assert_eq!(
            result.errors,
            vec!["'tables' must be an object".to_string(), ALL_STRATEGIES_FAILED.to_string()]
        );
    }

    #[test]
    fn slugify_rules() {
        assert_eq!(slugify("Treatment Costs (EUR)"), "treatment_costs_eur");
        assert_eq!(slugify("  Multiple   Spaces  "), "multiple_spaces");
        assert_eq!(slugify(&"x".repeat(80)).len(), 50);
    }

    #[test]
    fn array_rows_are_zipped_onto_headers() {
        let text = json!({
            "tables": {"t": {"headers": ["a", "b"], "rows": [["1", "2"], ["3"]]}}
        })
        .to_string();
        let result = parse(&text);
        let t = result.table("t").unwrap();
        assert_eq!(t.rows[0]["b"], json!("2"));
        assert_eq!(t.rows[1].len(), 1);
    }

    #[test]
    fn scalar_rows_are_kept() {
        let result = parse(
            r#"{"tables": {"t": {"headers": ["Metric"], "rows": ["Prevalence 6.7%", "Incidence 0.5%"]}}}"#,
        );
        assert!(result.success);
        assert_eq!(result.parse_method, ParseMethod::RawJson);
        let table = result.table("t").unwrap();
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.rows[1]["Metric"], json!("Incidence 0.5%"));

        let headless = parse(r#"{"tables": {"u": {"headers": [], "rows": [42, null]}}}"#);
        let table = headless.table("u").unwrap();
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.rows[0]["value"], json!(42));
    }

    const PIPE_TABLE: &str = "| Metric | Value |\n|---|---|\n| Prevalence | 6.7% |\n";

    #[test]
    fn heading_at_edge_of_lookback_is_used() {
        // "# Prevalence" plus blank lines fills exactly 200 characters.
        let text = format!("# Prevalence{}{PIPE_TABLE}", "\n".repeat(188));
        let result = parse(&text);
        assert_eq!(result.parse_method, ParseMethod::MarkdownFallback);
        assert!(result.table("prevalence").is_some());
    }

    #[test]
    fn heading_outside_lookback_is_ignored() {
        let text = format!("# Prevalence{}{PIPE_TABLE}", "\n".repeat(189));
        let result = parse(&text);
        assert_eq!(result.parse_method, ParseMethod::MarkdownFallback);
        assert!(result.table("prevalence").is_none());
        assert!(result.table("table_1").is_some());
    }
}
