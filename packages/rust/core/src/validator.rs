//! Completeness checks for parsed model output.

use std::collections::BTreeMap;

use dossier_shared::{DEFAULT_MIN_ROWS, DataTable, render_row};

use crate::parser::ParseResult;

/// More `NOT_FOUND` markers than this across all rows raises an issue.
const NOT_FOUND_THRESHOLD: usize = 10;

/// Tables with this many rows get the full row-count credit.
const FULL_CREDIT_ROWS: f64 = 5.0;

/// Cell values that count as unfilled (compared case-insensitively).
const UNFILLED_MARKERS: [&str; 3] = ["N/A", "NOT_FOUND", "-"];

/// Issues found in one parse result. Empty means valid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub issues: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Validates parse results against a domain's required tables and critical fields.
#[derive(Debug, Clone, Copy)]
pub struct OutputValidator {
    min_rows: usize,
}

impl Default for OutputValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_ROWS)
    }
}

impl OutputValidator {
    pub fn new(min_rows: usize) -> Self {
        Self { min_rows }
    }

    pub fn min_rows(&self) -> usize {
        self.min_rows
    }

    /// Check `result` against the required tables and, when given, the
    /// critical `(table, fields)` map.
    pub fn validate(
        &self,
        result: &ParseResult,
        required_tables: &[String],
        critical_fields: Option<&BTreeMap<String, Vec<String>>>,
    ) -> ValidationReport {
        if !result.success {
            return ValidationReport {
                issues: vec!["parsing failed".into()],
            };
        }

        let mut issues = Vec::new();

        for name in required_tables {
            match result.table(name) {
                None => issues.push(format!("missing required table {name}")),
                Some(table) if !table.is_populated(self.min_rows) => issues.push(format!(
                    "insufficient data in {name}: {} rows (minimum {})",
                    table.row_count(),
                    self.min_rows
                )),
                Some(_) => {}
            }
        }

        for (name, fields) in critical_fields.into_iter().flatten() {
            let Some(table) = result.table(name) else {
                continue;
            };
            let rendered: Vec<String> = table.rows.iter().map(|r| render_row(r).to_lowercase()).collect();
            for field in fields {
                let needle = field.to_lowercase();
                if !rendered.iter().any(|row| row.contains(&needle)) {
                    issues.push(format!("missing critical data '{field}' in {name}"));
                }
            }
        }

        let not_found = count_not_found(result.tables().values());
        if not_found > NOT_FOUND_THRESHOLD {
            issues.push(format!("high number of missing data points: {not_found}"));
        }

        ValidationReport { issues }
    }

    /// Score in `[0, 1]`: per table with headers and rows, 40% row volume and
    /// 60% filled cells, averaged over those tables.
    pub fn completeness_score(&self, result: &ParseResult) -> f64 {
        if !result.success {
            return 0.0;
        }

        let scores: Vec<f64> = result
            .tables()
            .values()
            .filter(|t| !t.headers.is_empty() && !t.rows.is_empty())
            .map(table_score)
            .collect();

        if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        }
    }
}

fn table_score(table: &DataTable) -> f64 {
    let row_score = (table.row_count() as f64 / FULL_CREDIT_ROWS).min(1.0);

    let total = table.headers.len() * table.rows.len();
    let filled = table
        .rows
        .iter()
        .flat_map(|row| table.headers.iter().map(move |h| row.get(h)))
        .filter(|cell| cell.is_some_and(is_filled))
        .count();
    let fill_score = if total == 0 {
        0.0
    } else {
        filled as f64 / total as f64
    };

    0.4 * row_score + 0.6 * fill_score
}

fn is_filled(value: &serde_json::Value) -> bool {
    let text = match value {
        serde_json::Value::Null => return false,
        serde_json::Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    };
    !text.is_empty() && !UNFILLED_MARKERS.iter().any(|m| text.eq_ignore_ascii_case(m))
}

/// Case-insensitive occurrences of `NOT_FOUND` across every row rendering.
fn count_not_found<'a>(tables: impl Iterator<Item = &'a DataTable>) -> usize {
    tables
        .flat_map(|t| t.rows.iter())
        .map(|row| render_row(row).to_uppercase().matches("NOT_FOUND").count())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use serde_json::json;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn result_with(tables: serde_json::Value) -> ParseResult {
        parse(&json!({ "tables": tables }).to_string())
    }

    #[test]
    fn failed_parse_is_a_single_issue() {
        let result = parse("no data at all");
        let report = OutputValidator::default().validate(&result, &names(&["a"]), None);
        assert!(!report.is_ok());
        assert_eq!(report.issues, vec!["parsing failed"]);
    }

    #[test]
    fn required_tables_missing_and_thin() {
        let result = result_with(json!({
            "prevalence_incidence": {
                "headers": ["Metric", "Value"],
                "rows": [{"Metric": "Prevalence", "Value": "6.7%"}]
            }
        }));
        let report = OutputValidator::new(2).validate(
            &result,
            &names(&["prevalence_incidence", "demographics"]),
            None,
        );
        assert_eq!(
            report.issues,
            vec![
                "insufficient data in prevalence_incidence: 1 rows (minimum 2)",
                "missing required table demographics",
            ]
        );
    }

    #[test]
    fn valid_output_passes() {
        let result = result_with(json!({
            "demographics": {
                "headers": ["Category", "Value"],
                "rows": [
                    {"Category": "Female", "Value": "55%"},
                    {"Category": "Male", "Value": "45%"},
                    {"Category": "Median age", "Value": "41"}
                ]
            }
        }));
        let critical = BTreeMap::from([(
            "demographics".to_string(),
            names(&["female", "male", "age"]),
        )]);
        let report = OutputValidator::default().validate(&result, &names(&["demographics"]), Some(&critical));
        assert!(report.is_ok(), "{:?}", report.issues);
    }

    #[test]
    fn critical_fields_are_case_insensitive_and_skip_missing_tables() {
        let result = result_with(json!({
            "demographics": {
                "headers": ["Category", "Value"],
                "rows": [{"Category": "FEMALE", "Value": "55%"}, {"Category": "other", "Value": "1"}]
            }
        }));
        let critical = BTreeMap::from([
            ("demographics".to_string(), names(&["female", "age"])),
            ("absent".to_string(), names(&["anything"])),
        ]);
        let report = OutputValidator::default().validate(&result, &[], Some(&critical));
        assert_eq!(report.issues, vec!["missing critical data 'age' in demographics"]);
    }

    #[test]
    fn many_not_found_markers_raise_one_issue() {
        let rows: Vec<_> = (0..11).map(|i| json!({"k": i, "v": "not_found"})).collect();
        let result = result_with(json!({ "t": { "headers": ["k", "v"], "rows": rows } }));
        let report = OutputValidator::default().validate(&result, &[], None);
        assert_eq!(report.issues, vec!["high number of missing data points: 11"]);

        let rows: Vec<_> = (0..10).map(|i| json!({"k": i, "v": "NOT_FOUND"})).collect();
        let result = result_with(json!({ "t": { "headers": ["k", "v"], "rows": rows } }));
        assert!(OutputValidator::default().validate(&result, &[], None).is_ok());
    }

    #[test]
    fn completeness_of_full_and_sparse_tables() {
        let v = OutputValidator::default();

        let full = result_with(json!({
            "t": {
                "headers": ["a", "b"],
                "rows": (0..5).map(|i| json!({"a": i, "b": "x"})).collect::<Vec<_>>()
            }
        }));
        assert!((v.completeness_score(&full) - 1.0).abs() < 1e-9);

        // 2 rows of 5 -> 0.4 * 0.4; 1 of 4 cells filled ("N/A", "-" and the missing "b" are empty) -> 0.6 * 0.25.
        let sparse = result_with(json!({
            "t": {
                "headers": ["a", "b"],
                "rows": [{"a": "1", "b": "N/A"}, {"a": "-"}]
            }
        }));
        let expected = 0.4 * 0.4 + 0.6 * (1.0 / 4.0);
        assert!((v.completeness_score(&sparse) - expected).abs() < 1e-9);
    }

    #[test]
    fn completeness_averages_only_tables_with_content() {
        let v = OutputValidator::default();
        let result = result_with(json!({
            "full": {
                "headers": ["a"],
                "rows": (0..5).map(|i| json!({"a": i})).collect::<Vec<_>>()
            },
            "empty": {"headers": ["a"], "rows": []},
            "headless": {"headers": [], "rows": [{"a": 1}]}
        }));
        assert!((v.completeness_score(&result) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn completeness_is_zero_without_tables() {
        let v = OutputValidator::default();
        assert_eq!(v.completeness_score(&parse("prose only")), 0.0);
        assert_eq!(v.completeness_score(&result_with(json!({}))), 0.0);
    }
}
