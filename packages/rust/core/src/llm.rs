//! OpenRouter chat-completions client.
//!
//! One HTTP shape serves both research modes: plain synthesis over gathered
//! evidence ([`Generator`]) and research with OpenRouter's web plugin enabled
//! ([`WebResearcher`]).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use dossier_shared::{
    AppConfig, DossierError, Result, RetryPolicy, TokenUsage, classify_status, resolve_api_key,
    retry_with_backoff,
};

use crate::research::{WebResearch, WebResearcher};
use crate::synthesis::{Generation, Generator};

const USER_AGENT: &str = concat!("Dossier/", env!("CARGO_PKG_VERSION"));

/// Heading separating the prompt from the evidence in a synthesis request.
pub const EVIDENCE_HEADING: &str = "## SEARCH RESULTS AND SOURCES";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    plugins: Vec<Plugin>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct Plugin {
    id: &'static str,
    max_results: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    annotations: Vec<Annotation>,
}

#[derive(Debug, Deserialize)]
struct Annotation {
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// A completed chat request.
#[derive(Debug)]
struct Completion {
    text: String,
    usage: TokenUsage,
    citations: usize,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client for `POST {base_url}/chat/completions`.
pub struct OpenRouterClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_output_tokens: u32,
    max_search_results: u32,
    retry: RetryPolicy,
}

impl OpenRouterClient {
    /// Build from application config; the API key is read from the configured env var.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let api_key = resolve_api_key(&config.llm.api_key_env)?;
        let mut client = Self::new(
            &config.llm.base_url,
            api_key,
            &config.llm.model,
            RetryPolicy::from(config),
            Duration::from_secs(config.llm.timeout_secs),
        )?;
        client.max_output_tokens = config.llm.max_output_tokens;
        client.max_search_results = config.llm.max_search_iterations;
        Ok(client)
    }

    pub fn new(
        base_url: &str,
        api_key: String,
        model: &str,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| DossierError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: model.to_string(),
            max_output_tokens: 8000,
            max_search_results: 15,
            retry,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, content: &str, web_search: bool) -> Result<Completion> {
        retry_with_backoff(&self.retry, "openrouter", || self.execute(content, web_search)).await
    }

    async fn execute(&self, content: &str, web_search: bool) -> Result<Completion> {
        let url = format!("{}/chat/completions", self.base_url);
        let plugins = if web_search {
            vec![Plugin {
                id: "web",
                max_results: self.max_search_results,
            }]
        } else {
            Vec::new()
        };
        let request = ChatRequest {
            model: &self.model,
            max_tokens: self.max_output_tokens,
            messages: vec![ChatMessage {
                role: "user",
                content,
            }],
            plugins,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    DossierError::Transient(format!("openrouter: {e}"))
                } else {
                    DossierError::Llm(format!("openrouter request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), retry_after.as_deref(), &body));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| DossierError::Llm(format!("invalid chat response: {e}")))?;

        let usage = body.usage.unwrap_or_default();
        let message = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| DossierError::Llm("chat response contained no choices".into()))?;

        let citations = message
            .annotations
            .iter()
            .filter(|a| a.kind == "url_citation")
            .count();

        Ok(Completion {
            text: message.content.unwrap_or_default(),
            usage: TokenUsage::new(usage.prompt_tokens, usage.completion_tokens),
            citations,
        })
    }
}

#[async_trait]
impl Generator for OpenRouterClient {
    #[instrument(skip_all, fields(model = %self.model, gaps = gap_hints.len()))]
    async fn generate(&self, prompt: &str, context: &str, gap_hints: &[String]) -> Result<Generation> {
        let content = format!("{prompt}\n\n{EVIDENCE_HEADING}\n\n{context}");
        let completion = self.complete(&content, false).await?;
        info!(
            input_tokens = completion.usage.input_tokens,
            output_tokens = completion.usage.output_tokens,
            "synthesis call completed"
        );
        Ok(Generation {
            text: completion.text,
            usage: completion.usage,
        })
    }
}

#[async_trait]
impl WebResearcher for OpenRouterClient {
    #[instrument(skip_all, fields(model = %self.model))]
    async fn research(&self, task: &str) -> Result<WebResearch> {
        let completion = self.complete(task, true).await?;
        debug!(citations = completion.citations, "integrated research call completed");
        Ok(WebResearch {
            text: completion.text,
            usage: completion.usage,
            search_count: completion.citations,
        })
    }
}
