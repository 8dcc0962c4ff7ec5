//! The validate → retry → accept loop around a text generator.
//!
//! Each attempt generates, parses and validates. Validation issues become gap
//! hints for the next prompt; generator errors back off exponentially. The
//! loop always returns its best effort once the retry budget is spent.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use dossier_shared::{Result, TokenUsage};

use crate::parser::{self, ParseResult};
use crate::validator::OutputValidator;

/// Heading of the section appended to the prompt on gap-filling retries.
pub const GAPS_HEADING: &str = "## IMPORTANT: PREVIOUS GAPS TO ADDRESS";

/// One generation: the model's text and what it cost.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    pub text: String,
    pub usage: TokenUsage,
}

/// A text generator (an LLM behind some API).
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate a response for `prompt` grounded in `context`. `gap_hints`
    /// lists the issues of the previous attempt; `prompt` already carries them.
    async fn generate(&self, prompt: &str, context: &str, gap_hints: &[String]) -> Result<Generation>;
}

/// Retry budget and pricing for one synthesis run.
#[derive(Debug, Clone, Copy)]
pub struct SynthesisOptions {
    /// Extra attempts after the first.
    pub max_retries: u32,
    /// Base delay after a generator error; doubled per attempt.
    pub backoff_base: Duration,
    pub input_cost_per_mtok: f64,
    pub output_cost_per_mtok: f64,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base: Duration::from_secs(1),
            input_cost_per_mtok: 0.0,
            output_cost_per_mtok: 0.0,
        }
    }
}

/// What the loop measured while producing its result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SynthesisMetrics {
    pub attempts: u32,
    /// Issues of the accepted result.
    pub validation_issues: Vec<String>,
    pub completeness_score: f64,
    /// Summed over every attempt, including failed ones that reported usage.
    pub usage: TokenUsage,
    pub estimated_cost_usd: f64,
}

/// What a domain requires of the synthesized output.
#[derive(Debug, Clone, Copy)]
pub struct Requirements<'a> {
    pub required_tables: &'a [String],
    pub critical_fields: Option<&'a BTreeMap<String, Vec<String>>>,
}

/// `base_prompt` plus a section listing the gaps of the previous attempt.
pub fn prompt_with_gaps(base_prompt: &str, gaps: &[String]) -> String {
    if gaps.is_empty() {
        return base_prompt.to_string();
    }
    let list: Vec<String> = gaps.iter().map(|g| format!("- {g}")).collect();
    format!(
        "{base_prompt}\n\n{GAPS_HEADING}\n\
         The following data gaps were identified in a previous attempt. \
         Please focus on finding this information:\n{}\n\n\
         If data cannot be found, mark as \"NOT_FOUND\" with explanation.\n",
        list.join("\n")
    )
}

/// Run the synthesis loop: at most `max_retries + 1` generator calls.
#[instrument(skip_all, fields(max_retries = options.max_retries))]
pub async fn synthesize(
    generator: &dyn Generator,
    validator: &OutputValidator,
    base_prompt: &str,
    evidence: &str,
    requirements: Requirements<'_>,
    options: &SynthesisOptions,
) -> Result<(ParseResult, SynthesisMetrics)> {
    let mut usage = TokenUsage::default();
    let mut gaps: Vec<String> = Vec::new();
    let mut attempt: u32 = 0;

    loop {
        let prompt = prompt_with_gaps(base_prompt, &gaps);

        let generation = match generator.generate(&prompt, evidence, &gaps).await {
            Ok(g) => g,
            Err(e) if attempt >= options.max_retries || e.is_permanent() => {
                warn!(attempt = attempt + 1, error = %e, "synthesis failed");
                return Err(e);
            }
            Err(e) => {
                let delay = options.backoff_base.saturating_mul(1u32 << attempt.min(16));
                warn!(attempt = attempt + 1, error = %e, ?delay, "generator error, backing off");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
        };
        usage += generation.usage;

        let result = parser::parse(&generation.text);
        let report = validator.validate(&result, requirements.required_tables, requirements.critical_fields);

        if report.is_ok() || attempt >= options.max_retries {
            let metrics = SynthesisMetrics {
                attempts: attempt + 1,
                completeness_score: validator.completeness_score(&result),
                validation_issues: report.issues,
                usage,
                estimated_cost_usd: usage
                    .cost_usd(options.input_cost_per_mtok, options.output_cost_per_mtok),
            };
            info!(
                attempts = metrics.attempts,
                issues = metrics.validation_issues.len(),
                parse_method = %result.parse_method,
                completeness = metrics.completeness_score,
                "synthesis accepted"
            );
            return Ok((result, metrics));
        }

        debug!(
            attempt = attempt + 1,
            issues = ?&report.issues[..report.issues.len().min(3)],
            "synthesis incomplete, retrying with gaps"
        );
        gaps = report.issues;
        attempt += 1;
    }
}
