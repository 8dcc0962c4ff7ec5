//! Data-driven registry of research domains.
//!
//! Each domain is plain configuration: query templates, table schemas,
//! required tables, critical fields and prompt instructions. The built-in set
//! ships as an embedded TOML file; a custom registry can be loaded from disk
//! with the same format.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use dossier_shared::{DossierError, Result};

const BUILTIN_DOMAINS: &str = include_str!("default_domains.toml");

/// Column layout of one table a domain asks the model to fill.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub headers: Vec<String>,
}

/// Configuration of one research domain.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DomainConfig {
    pub id: u32,
    pub name: String,
    /// Query templates with `{subject}`, `{target}` and `{locality}` placeholders.
    pub queries: Vec<String>,
    #[serde(default)]
    pub tables: Vec<TableSchema>,
    #[serde(default)]
    pub required_tables: Vec<String>,
    /// Table name → values that must appear somewhere in that table's rows.
    #[serde(default)]
    pub critical_fields: BTreeMap<String, Vec<String>>,
    /// Domain-specific prompt text appended after the shared preamble.
    #[serde(default)]
    pub instructions: String,
}

impl DomainConfig {
    /// Fill the query templates. An absent locality leaves no trace in the query.
    pub fn render_queries(&self, subject: &str, target: &str, locality: Option<&str>) -> Vec<String> {
        self.queries
            .iter()
            .map(|template| {
                let filled = template
                    .replace("{subject}", subject)
                    .replace("{target}", target)
                    .replace("{locality}", locality.unwrap_or(""));
                collapse_whitespace(&filled)
            })
            .filter(|q| !q.is_empty())
            .collect()
    }

    /// Table schemas rendered as a JSON object, in declaration order.
    pub fn schemas_json(&self) -> String {
        if self.tables.is_empty() {
            return "{}".to_string();
        }
        let entries: Vec<String> = self
            .tables
            .iter()
            .map(|t| {
                let name = serde_json::Value::String(t.name.clone());
                let headers = serde_json::to_string(&t.headers).unwrap_or_else(|_| "[]".into());
                format!("  {name}: {headers}")
            })
            .collect();
        format!("{{\n{}\n}}", entries.join(",\n"))
    }
}

/// Work a run over a range of domains would do.
#[derive(Debug, Clone, PartialEq)]
pub struct RunEstimate {
    pub domains: u32,
    pub total_queries: usize,
    /// `(id, name, query count)` per domain.
    pub per_domain: Vec<(u32, String, usize)>,
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    preamble: String,
    domains: Vec<DomainConfig>,
}

/// The fixed, ordered set of domains a session is researched against.
#[derive(Debug, Clone)]
pub struct DomainRegistry {
    preamble: String,
    domains: BTreeMap<u32, DomainConfig>,
}

impl DomainRegistry {
    /// The embedded default registry.
    pub fn builtin() -> Result<Self> {
        Self::from_toml_str(BUILTIN_DOMAINS)
    }

    /// Load a registry file with the same layout as the built-in one.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| DossierError::io(path, e))?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: RegistryFile = toml::from_str(raw)
            .map_err(|e| DossierError::config(format!("invalid domain registry: {e}")))?;

        if file.domains.is_empty() {
            return Err(DossierError::config("domain registry defines no domains"));
        }

        let mut domains = BTreeMap::new();
        for domain in file.domains {
            for required in &domain.required_tables {
                if !domain.tables.iter().any(|t| &t.name == required) {
                    return Err(DossierError::config(format!(
                        "domain {} requires table '{required}' but defines no schema for it",
                        domain.id
                    )));
                }
            }
            let id = domain.id;
            if domains.insert(id, domain).is_some() {
                return Err(DossierError::config(format!("duplicate domain id {id}")));
            }
        }

        let expected = 1..=domains.len() as u32;
        if !domains.keys().copied().eq(expected) {
            return Err(DossierError::config(format!(
                "domain ids must run 1..={} without gaps",
                domains.len()
            )));
        }

        Ok(Self {
            preamble: file.preamble,
            domains,
        })
    }

    /// Number of domains (N).
    pub fn len(&self) -> u32 {
        self.domains.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&DomainConfig> {
        self.domains.get(&id)
    }

    /// Look up a domain, failing with a config error for unknown ids.
    pub fn require(&self, id: u32) -> Result<&DomainConfig> {
        self.get(id).ok_or_else(|| {
            DossierError::config(format!("invalid domain id {id}: must be 1-{}", self.len()))
        })
    }

    /// Domains in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &DomainConfig> {
        self.domains.values()
    }

    /// Reject ranges outside `1 <= start <= end <= N`.
    pub fn check_range(&self, domains: &RangeInclusive<u32>) -> Result<()> {
        let (start, end) = (*domains.start(), *domains.end());
        let n = self.len();
        if start < 1 || end > n || start > end {
            return Err(DossierError::config(format!(
                "invalid domain range {start}-{end}: must satisfy 1 <= start <= end <= {n}"
            )));
        }
        Ok(())
    }

    /// Domain and query counts for a range, without running anything.
    pub fn estimate(&self, domains: RangeInclusive<u32>) -> Result<RunEstimate> {
        self.check_range(&domains)?;
        let per_domain: Vec<(u32, String, usize)> = domains
            .filter_map(|id| self.get(id))
            .map(|d| (d.id, d.name.clone(), d.queries.len()))
            .collect();
        Ok(RunEstimate {
            domains: per_domain.len() as u32,
            total_queries: per_domain.iter().map(|(_, _, q)| q).sum(),
            per_domain,
        })
    }

    /// Full synthesis prompt for one domain: preamble, schemas, instructions.
    pub fn prompt_for(&self, domain: &DomainConfig, subject: &str, target: &str) -> String {
        let fill = |text: &str| {
            text.replace("{subject}", subject)
                .replace("{target}", target)
                .replace("{table_schemas}", &domain.schemas_json())
        };
        let mut prompt = fill(self.preamble.trim());
        if !domain.instructions.trim().is_empty() {
            prompt.push_str("\n\n");
            prompt.push_str(&fill(domain.instructions.trim()));
        }
        prompt
    }
}

fn collapse_whitespace(s: &str) -> String {
    static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));
    WS_RE.replace_all(s.trim(), " ").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL: &str = r#"
preamble = "Research {subject} in {target}.\n{table_schemas}"

[[domains]]
id = 1
name = "First"
queries = ["{subject} {target}"]
required_tables = ["a"]

[[domains.tables]]
name = "a"
headers = ["x"]

[[domains]]
id = 2
name = "Second"
queries = ["{subject}"]
"#;

    #[test]
    fn builtin_registry_has_seven_contiguous_domains() {
        let registry = DomainRegistry::builtin().unwrap();
        assert_eq!(registry.len(), 7);
        let ids: Vec<u32> = registry.iter().map(|d| d.id).collect();
        assert_eq!(ids, (1..=7).collect::<Vec<_>>());

        let epi = registry.get(1).unwrap();
        assert_eq!(epi.name, "Epidemiology");
        assert_eq!(
            epi.required_tables,
            vec!["prevalence_incidence", "demographics", "estimated_patient_population"]
        );
        assert_eq!(epi.critical_fields["demographics"], vec!["female", "male", "age"]);
        assert_eq!(registry.get(7).unwrap().name, "Stakeholder Mapping");
        assert!(registry.iter().all(|d| !d.queries.is_empty()));
    }

    #[test]
    fn query_rendering_fills_and_collapses() {
        let registry = DomainRegistry::builtin().unwrap();
        let epi = registry.get(1).unwrap();

        let with_city = epi.render_queries("asthma", "France", Some("Paris"));
        assert_eq!(with_city[0], "asthma prevalence France epidemiology");
        assert!(with_city.contains(&"France population Paris".to_string()));

        let without = epi.render_queries("asthma", "France", None);
        assert!(without.contains(&"France population".to_string()));
        assert!(without.iter().all(|q| !q.contains('{')));
    }

    #[test]
    fn prompt_contains_preamble_schemas_and_instructions() {
        let registry = DomainRegistry::builtin().unwrap();
        let domain = registry.get(2).unwrap();
        let prompt = registry.prompt_for(domain, "psoriasis", "Germany");

        assert!(prompt.contains("conducting research on psoriasis in Germany"));
        assert!(prompt.contains("\"healthcare_costs\": [\"Cost Category\""));
        assert!(prompt.contains("DOMAIN-SPECIFIC INSTRUCTIONS: HEALTHCARE FINANCES"));
        assert!(prompt.contains("NOT_FOUND"));
        assert!(!prompt.contains("{table_schemas}"));
    }

    #[test]
    fn small_registry_parses() {
        let registry = DomainRegistry::from_toml_str(SMALL).unwrap();
        assert_eq!(registry.len(), 2);
        let first = registry.require(1).unwrap();
        assert_eq!(first.schemas_json(), "{\n  \"a\": [\"x\"]\n}");
        assert_eq!(registry.get(2).unwrap().schemas_json(), "{}");
        assert!(registry.require(3).is_err());
    }

    #[test]
    fn gaps_in_ids_are_rejected() {
        let raw = SMALL.replace("id = 2", "id = 3");
        let err = DomainRegistry::from_toml_str(&raw).unwrap_err();
        assert!(err.to_string().contains("without gaps"));
    }

    #[test]
    fn required_table_without_schema_is_rejected() {
        let raw = SMALL.replace("required_tables = [\"a\"]", "required_tables = [\"b\"]");
        assert!(DomainRegistry::from_toml_str(&raw).is_err());
    }

    #[test]
    fn ranges_and_estimates() {
        let registry = DomainRegistry::from_toml_str(SMALL).unwrap();
        assert!(registry.check_range(&(1..=2)).is_ok());
        assert!(registry.check_range(&(0..=1)).is_err());
        assert!(registry.check_range(&(2..=1)).is_err());
        assert!(registry.check_range(&(1..=3)).is_err());

        let estimate = registry.estimate(1..=2).unwrap();
        assert_eq!(estimate.domains, 2);
        assert_eq!(estimate.total_queries, 2);
        assert_eq!(estimate.per_domain[1], (2, "Second".to_string(), 1));
    }

    #[test]
    fn load_from_file() {
        let path = std::env::temp_dir().join(format!("dossier_domains_{}.toml", uuid::Uuid::now_v7()));
        std::fs::write(&path, SMALL).unwrap();
        let registry = DomainRegistry::load(&path).unwrap();
        assert_eq!(registry.len(), 2);
        let _ = std::fs::remove_file(&path);
    }
}
