//! Research modes: how a domain turns a prompt into parsed tables.
//!
//! [`GatherAndSynthesize`] runs the domain's queries against a
//! [`SearchClient`], fetches the top hits, and hands the evidence to the
//! synthesis retry loop. [`IntegratedResearch`] makes a single call to a model
//! with built-in web search and parses the answer once. The integrated mode has
//! no gap-filling retry: its one call already spends the search budget.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use dossier_search::{Fetcher, SearchClient};
use dossier_shared::{
    Clock, FetchedContent, ResearchMode, Result, SearchLogEntry, SearchResult, SearchSettings,
    TokenUsage,
};

use crate::domains::DomainConfig;
use crate::parser::{self, ParseResult};
use crate::synthesis::{Generator, Requirements, SynthesisOptions, synthesize};
use crate::validator::OutputValidator;

/// Marker used in the evidence context for pages that could not be fetched.
pub const CONTENT_UNAVAILABLE: &str = "[Content not available - page could not be fetched]";

/// Suggested queries shown to the model in integrated mode.
const QUERY_HINTS: usize = 5;

/// Output of a model that searched the web on its own.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WebResearch {
    pub text: String,
    pub usage: TokenUsage,
    /// Number of web sources the model cited.
    pub search_count: usize,
}

/// A model with built-in web search.
#[async_trait]
pub trait WebResearcher: Send + Sync {
    async fn research(&self, task: &str) -> Result<WebResearch>;
}

/// Everything a research mode needs to know about the domain at hand.
#[derive(Debug, Clone)]
pub struct DomainTask<'a> {
    pub domain: &'a DomainConfig,
    pub subject: &'a str,
    pub target: &'a str,
    pub locality: Option<&'a str>,
    /// Synthesis prompt built from the registry.
    pub prompt: String,
}

/// What one domain's research produced.
#[derive(Debug, Clone)]
pub struct DomainResearch {
    pub parse_result: ParseResult,
    pub search_log: Vec<SearchLogEntry>,
    pub searches_completed: usize,
    pub attempts: u32,
    pub usage: TokenUsage,
    pub estimated_cost_usd: f64,
}

/// A way of researching one domain.
#[async_trait]
pub trait ResearchStrategy: Send + Sync {
    fn mode(&self) -> ResearchMode;

    async fn research(&self, task: &DomainTask<'_>) -> Result<DomainResearch>;
}

// ---------------------------------------------------------------------------
// Standard mode
// ---------------------------------------------------------------------------

/// Search + fetch evidence, then synthesis with gap-filling retries.
pub struct GatherAndSynthesize {
    search: Arc<dyn SearchClient>,
    fetcher: Arc<dyn Fetcher>,
    generator: Arc<dyn Generator>,
    validator: OutputValidator,
    settings: SearchSettings,
    options: SynthesisOptions,
    clock: Arc<dyn Clock>,
}

impl GatherAndSynthesize {
    pub fn new(
        search: Arc<dyn SearchClient>,
        fetcher: Arc<dyn Fetcher>,
        generator: Arc<dyn Generator>,
        validator: OutputValidator,
        settings: SearchSettings,
        options: SynthesisOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            search,
            fetcher,
            generator,
            validator,
            settings,
            options,
            clock,
        }
    }

    /// Run every query, fetch the top hits, and log each search.
    async fn gather(
        &self,
        queries: &[String],
    ) -> Result<(Vec<(SearchResult, FetchedContent)>, Vec<SearchLogEntry>)> {
        let mut evidence = Vec::new();
        let mut log = Vec::with_capacity(queries.len());
        let mut cached_count = 0usize;

        for (i, query) in queries.iter().enumerate() {
            debug!(current = i + 1, total = queries.len(), %query, "searching");
            let (results, cached) = self.search.search(query, None, self.settings.max_results).await?;
            if cached {
                cached_count += 1;
            }

            for hit in results.iter().take(self.settings.top_results_to_fetch) {
                let page = self.fetcher.fetch(&hit.url).await;
                if !page.success() {
                    debug!(url = %hit.url, error = ?page.error, "source unavailable");
                }
                evidence.push((hit.clone(), page));
            }

            log.push(SearchLogEntry {
                query: query.clone(),
                source_found: results.first().map(|r| r.source.clone()).unwrap_or_default(),
                key_data_points: format!("Found {} results", results.len()),
                cached,
                results_count: results.len(),
                timestamp: self.clock.now(),
            });

            let is_last = i + 1 == queries.len();
            if !cached && !is_last && !self.settings.search_delay.is_zero() {
                tokio::time::sleep(self.settings.search_delay).await;
            }
        }

        info!(sources = evidence.len(), cached = cached_count, "evidence gathered");
        Ok((evidence, log))
    }
}

#[async_trait]
impl ResearchStrategy for GatherAndSynthesize {
    fn mode(&self) -> ResearchMode {
        ResearchMode::Standard
    }

    #[instrument(skip_all, fields(domain = task.domain.id))]
    async fn research(&self, task: &DomainTask<'_>) -> Result<DomainResearch> {
        let queries = task.domain.render_queries(task.subject, task.target, task.locality);
        let (evidence, search_log) = self.gather(&queries).await?;
        let context = build_context(&evidence);

        let (parse_result, metrics) = synthesize(
            self.generator.as_ref(),
            &self.validator,
            &task.prompt,
            &context,
            Requirements {
                required_tables: &task.domain.required_tables,
                critical_fields: None,
            },
            &self.options,
        )
        .await?;

        Ok(DomainResearch {
            parse_result,
            search_log,
            searches_completed: queries.len(),
            attempts: metrics.attempts,
            usage: metrics.usage,
            estimated_cost_usd: metrics.estimated_cost_usd,
        })
    }
}

/// Numbered source blocks: title, URL, description and page content.
pub fn build_context(evidence: &[(SearchResult, FetchedContent)]) -> String {
    evidence
        .iter()
        .enumerate()
        .map(|(i, (hit, page))| {
            let title = if hit.title.is_empty() { "Unknown" } else { hit.title.as_str() };
            let description = if hit.description.is_empty() {
                "No description"
            } else {
                hit.description.as_str()
            };
            let content = match page.content.as_deref() {
                Some(text) if page.success() => text,
                _ => CONTENT_UNAVAILABLE,
            };
            format!(
                "### Source {}: {title}\nURL: {}\nDescription: {description}\n\nContent:\n{content}\n---",
                i + 1,
                hit.url
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ---------------------------------------------------------------------------
// Integrated mode
// ---------------------------------------------------------------------------

/// A single model call with built-in web search, parsed once.
pub struct IntegratedResearch {
    researcher: Arc<dyn WebResearcher>,
    input_cost_per_mtok: f64,
    output_cost_per_mtok: f64,
    clock: Arc<dyn Clock>,
}

impl IntegratedResearch {
    pub fn new(
        researcher: Arc<dyn WebResearcher>,
        input_cost_per_mtok: f64,
        output_cost_per_mtok: f64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            researcher,
            input_cost_per_mtok,
            output_cost_per_mtok,
            clock,
        }
    }
}

#[async_trait]
impl ResearchStrategy for IntegratedResearch {
    fn mode(&self) -> ResearchMode {
        ResearchMode::Integrated
    }

    #[instrument(skip_all, fields(domain = task.domain.id))]
    async fn research(&self, task: &DomainTask<'_>) -> Result<DomainResearch> {
        let hints = task.domain.render_queries(task.subject, task.target, task.locality);
        let prompt = integrated_prompt(task, &hints);

        let outcome = self.researcher.research(&prompt).await?;
        let parse_result = parser::parse(&outcome.text);
        info!(
            searches = outcome.search_count,
            parse_method = %parse_result.parse_method,
            "integrated research parsed"
        );

        let now = self.clock.now();
        let search_log = parse_result
            .payload
            .as_ref()
            .map(|p| {
                p.search_log
                    .iter()
                    .map(|entry| SearchLogEntry {
                        query: entry.query.clone(),
                        source_found: entry.source_found.clone(),
                        key_data_points: entry.key_data_points.clone(),
                        cached: false,
                        results_count: 0,
                        timestamp: now,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(DomainResearch {
            parse_result,
            search_log,
            searches_completed: outcome.search_count,
            attempts: 1,
            usage: outcome.usage,
            estimated_cost_usd: outcome
                .usage
                .cost_usd(self.input_cost_per_mtok, self.output_cost_per_mtok),
        })
    }
}

/// Research task wrapping the domain prompt for a model that searches on its own.
fn integrated_prompt(task: &DomainTask<'_>, query_hints: &[String]) -> String {
    let (subject, target) = (task.subject, task.target);

    let hint_section = if query_hints.is_empty() {
        String::new()
    } else {
        let list: Vec<String> = query_hints
            .iter()
            .take(QUERY_HINTS)
            .map(|q| format!("- {q}"))
            .collect();
        format!(
            "## SUGGESTED STARTING QUERIES\n\
             These are suggested queries to begin your research. You may modify them or \
             create new queries as needed:\n{}\n\n",
            list.join("\n")
        )
    };

    format!(
        "# RESEARCH TASK\n\n\
         ## OBJECTIVE\n\
         You are conducting comprehensive research on **{subject}** in **{target}**.\n\
         You are researching **{domain}**.\n\n\
         ## RESEARCH INSTRUCTIONS\n\
         You have access to web search. Use it strategically to:\n\
         1. Search iteratively: start broad, then narrow based on findings\n\
         2. Verify key statistics across multiple sources\n\
         3. Prioritize {target}-specific sources over international proxies\n\
         4. Identify named entities: actual people, institutions, organizations\n\
         5. Document every source\n\n\
         If you cannot find specific data after searching, document the gap and use \
         \"NOT_FOUND\" rather than making up data.\n\n\
         {hint_section}\
         ## OUTPUT REQUIREMENTS\n\
         After completing your research, provide your findings in the following format:\n\n\
         {prompt}\n\n\
         Begin your research now.",
        domain = task.domain.name,
        prompt = task.prompt,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::DomainRegistry;
    use chrono::{TimeZone, Utc};
    use dossier_shared::{DossierError, FixedClock};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    struct StubSearch {
        hits: HashMap<String, Vec<SearchResult>>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SearchClient for StubSearch {
        async fn search(&self, query: &str, _: Option<&str>, _: u32) -> Result<(Vec<SearchResult>, bool)> {
            self.calls.lock().unwrap().push(query.to_string());
            Ok((self.hits.get(query).cloned().unwrap_or_default(), query.contains("cached")))
        }
    }

    struct StubFetcher;

    #[async_trait]
    impl Fetcher for StubFetcher {
        async fn fetch(&self, url: &str) -> FetchedContent {
            if url.contains("broken") {
                FetchedContent::failed(url, "timeout")
            } else {
                FetchedContent {
                    url: url.to_string(),
                    content: Some(format!("content of {url}")),
                    ..FetchedContent::default()
                }
            }
        }
    }

    struct EchoGenerator {
        contexts: Mutex<Vec<String>>,
        reply: String,
    }

    #[async_trait]
    impl Generator for EchoGenerator {
        async fn generate(&self, _: &str, context: &str, _: &[String]) -> Result<crate::synthesis::Generation> {
            self.contexts.lock().unwrap().push(context.to_string());
            Ok(crate::synthesis::Generation {
                text: self.reply.clone(),
                usage: TokenUsage::new(10, 5),
            })
        }
    }

    struct StubResearcher {
        reply: Result<WebResearch>,
        tasks: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WebResearcher for StubResearcher {
        async fn research(&self, task: &str) -> Result<WebResearch> {
            self.tasks.lock().unwrap().push(task.to_string());
            match &self.reply {
                Ok(r) => Ok(r.clone()),
                Err(e) => Err(DossierError::Llm(e.to_string())),
            }
        }
    }

    fn hit(title: &str, url: &str) -> SearchResult {
        SearchResult {
            title: title.into(),
            url: url.into(),
            description: format!("about {title}"),
            source: "example.org".into(),
        }
    }

    const REGISTRY: &str = r#"
preamble = "Research {subject} in {target}."

[[domains]]
id = 1
name = "Epidemiology"
queries = ["{subject} prevalence", "{subject} cached stats", "{subject} {locality}"]
required_tables = ["prevalence"]

[[domains.tables]]
name = "prevalence"
headers = ["Metric", "Value"]
"#;

    fn good_reply() -> String {
        format!(
            "```json\n{}\n```",
            json!({
                "search_log": [{"query": "asthma registry", "source_found": "who.int", "key_data_points": "6%"}],
                "tables": {"prevalence": {"headers": ["Metric", "Value"], "rows": [
                    {"Metric": "Prevalence", "Value": "6%"},
                    {"Metric": "Incidence", "Value": "1%"}
                ]}}
            })
        )
    }

    fn clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap()))
    }

    #[tokio::test]
    async fn standard_mode_gathers_then_synthesizes() {
        let registry = DomainRegistry::from_toml_str(REGISTRY).unwrap();
        let domain = registry.get(1).unwrap();

        let search = Arc::new(StubSearch {
            hits: HashMap::from([(
                "asthma prevalence".to_string(),
                vec![
                    hit("WHO", "https://who.example/asthma"),
                    hit("Broken", "https://broken.example"),
                    hit("Third", "https://third.example"),
                ],
            )]),
            calls: Mutex::new(Vec::new()),
        });
        let generator = Arc::new(EchoGenerator {
            contexts: Mutex::new(Vec::new()),
            reply: good_reply(),
        });
        let settings = SearchSettings {
            max_results: 10,
            top_results_to_fetch: 2,
            search_delay: Duration::ZERO,
            max_content_chars: 1000,
        };
        let mode = GatherAndSynthesize::new(
            search.clone(),
            Arc::new(StubFetcher),
            generator.clone(),
            OutputValidator::default(),
            settings,
            SynthesisOptions {
                backoff_base: Duration::ZERO,
                ..SynthesisOptions::default()
            },
            clock(),
        );

        let task = DomainTask {
            domain,
            subject: "asthma",
            target: "France",
            locality: None,
            prompt: registry.prompt_for(domain, "asthma", "France"),
        };
        let research = mode.research(&task).await.unwrap();

        assert_eq!(
            *search.calls.lock().unwrap(),
            vec!["asthma prevalence", "asthma cached stats", "asthma"]
        );
        assert_eq!(research.searches_completed, 3);
        assert_eq!(research.search_log.len(), 3);
        assert_eq!(research.search_log[0].results_count, 3);
        assert_eq!(research.search_log[0].key_data_points, "Found 3 results");
        assert!(research.search_log[1].cached);
        assert_eq!(research.attempts, 1);
        assert!(research.parse_result.success);

        let context = &generator.contexts.lock().unwrap()[0];
        assert!(context.contains("### Source 1: WHO\nURL: https://who.example/asthma"));
        assert!(context.contains("content of https://who.example/asthma"));
        assert!(context.contains(&format!("### Source 2: Broken\nURL: https://broken.example\nDescription: about Broken\n\nContent:\n{CONTENT_UNAVAILABLE}")));
        assert!(!context.contains("Third"));
    }

    #[tokio::test]
    async fn integrated_mode_makes_one_call_and_parses_once() {
        let registry = DomainRegistry::from_toml_str(REGISTRY).unwrap();
        let domain = registry.get(1).unwrap();
        let researcher = Arc::new(StubResearcher {
            reply: Ok(WebResearch {
                text: good_reply(),
                usage: TokenUsage::new(1_000_000, 0),
                search_count: 4,
            }),
            tasks: Mutex::new(Vec::new()),
        });
        let mode = IntegratedResearch::new(researcher.clone(), 3.0, 15.0, clock());

        let task = DomainTask {
            domain,
            subject: "asthma",
            target: "France",
            locality: Some("Paris"),
            prompt: registry.prompt_for(domain, "asthma", "France"),
        };
        let research = mode.research(&task).await.unwrap();

        assert_eq!(mode.mode(), ResearchMode::Integrated);
        assert_eq!(researcher.tasks.lock().unwrap().len(), 1);
        let sent = &researcher.tasks.lock().unwrap()[0];
        assert!(sent.contains("**asthma** in **France**"));
        assert!(sent.contains("- asthma Paris"));
        assert!(sent.contains("Research asthma in France."));

        assert_eq!(research.attempts, 1);
        assert_eq!(research.searches_completed, 4);
        assert!((research.estimated_cost_usd - 3.0).abs() < 1e-9);
        assert_eq!(research.search_log.len(), 1);
        assert_eq!(research.search_log[0].source_found, "who.int");
        assert!(research.parse_result.table("prevalence").is_some());
    }

    #[tokio::test]
    async fn integrated_mode_propagates_errors() {
        let registry = DomainRegistry::from_toml_str(REGISTRY).unwrap();
        let domain = registry.get(1).unwrap();
        let researcher = Arc::new(StubResearcher {
            reply: Err(DossierError::Llm("overloaded".into())),
            tasks: Mutex::new(Vec::new()),
        });
        let mode = IntegratedResearch::new(researcher, 3.0, 15.0, clock());
        let task = DomainTask {
            domain,
            subject: "asthma",
            target: "France",
            locality: None,
            prompt: String::new(),
        };
        assert!(mode.research(&task).await.is_err());
    }

    #[test]
    fn context_numbering_and_defaults() {
        let evidence = vec![(
            SearchResult {
                title: String::new(),
                url: "https://x.example".into(),
                description: String::new(),
                source: String::new(),
            },
            FetchedContent {
                url: "https://x.example".into(),
                content: Some("body".into()),
                ..FetchedContent::default()
            },
        )];
        assert_eq!(
            build_context(&evidence),
            "### Source 1: Unknown\nURL: https://x.example\nDescription: No description\n\nContent:\nbody\n---"
        );
        assert_eq!(build_context(&[]), "");
    }
}
