//! Brave Search API client with caching, retry, and adaptive rate limiting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, instrument};

use dossier_shared::{
    AdaptiveRateLimiter, AppConfig, DossierError, Result, RetryPolicy, SearchResult,
    classify_status, resolve_api_key, retry_with_backoff,
};
use dossier_storage::{Cache, CacheKind};

use crate::{SearchClient, USER_AGENT, transport_error};

/// Brave caps `count` at 20.
const MAX_COUNT: u32 = 20;

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Default, Deserialize)]
struct BraveResponse {
    #[serde(default)]
    web: BraveWeb,
}

#[derive(Debug, Default, Deserialize)]
struct BraveWeb {
    #[serde(default)]
    results: Vec<BraveHit>,
}

#[derive(Debug, Deserialize)]
struct BraveHit {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    description: String,
}

/// HTTP client for `GET {base_url}/web/search`.
pub struct BraveSearchClient {
    client: Client,
    base_url: String,
    api_key: String,
    cache: Arc<Cache>,
    limiter: AdaptiveRateLimiter,
    retry: RetryPolicy,
}

impl BraveSearchClient {
    /// Build a client from application config; the API key is read from the configured env var.
    pub fn from_config(config: &AppConfig, cache: Arc<Cache>) -> Result<Self> {
        let api_key = resolve_api_key(&config.search.api_key_env)?;
        Self::new(
            &config.search.base_url,
            api_key,
            cache,
            RetryPolicy::from(config),
            Duration::from_millis(config.search.search_delay_ms),
        )
    }

    pub fn new(
        base_url: &str,
        api_key: String,
        cache: Arc<Cache>,
        retry: RetryPolicy,
        request_delay: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| DossierError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            cache,
            limiter: AdaptiveRateLimiter::new(request_delay),
            retry,
        })
    }

    async fn execute(&self, query: &str, locale: Option<&str>, count: u32) -> Result<Vec<SearchResult>> {
        self.limiter.wait().await;

        let url = format!("{}/web/search", self.base_url);
        let mut params: Vec<(&str, String)> = vec![
            ("q", query.to_string()),
            ("count", count.min(MAX_COUNT).to_string()),
            ("search_lang", "en".to_string()),
            ("text_decorations", "false".to_string()),
        ];
        if let Some(country) = locale {
            params.push(("country", country.to_uppercase()));
        }

        let response = self
            .client
            .get(&url)
            .header("X-Subscription-Token", &self.api_key)
            .header("Accept", "application/json")
            .query(&params)
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response.text().await.unwrap_or_default();
            let err = classify_status(status.as_u16(), retry_after.as_deref(), &body);
            if let DossierError::RateLimited { retry_after } = &err {
                self.limiter.on_rate_limit(*retry_after);
            }
            return Err(err);
        }
        self.limiter.on_success();

        let body: BraveResponse = response
            .json()
            .await
            .map_err(|e| DossierError::parse(format!("brave response: {e}")))?;

        Ok(body
            .web
            .results
            .into_iter()
            .map(|hit| SearchResult {
                source: host_of(&hit.url),
                title: hit.title,
                url: hit.url,
                description: hit.description,
            })
            .collect())
    }
}

#[async_trait]
impl SearchClient for BraveSearchClient {
    #[instrument(skip_all, fields(query = %query))]
    async fn search(
        &self,
        query: &str,
        locale: Option<&str>,
        max_results: u32,
    ) -> Result<(Vec<SearchResult>, bool)> {
        let cache_key = format!("search:{query}:{}:{max_results}", locale.unwrap_or(""));

        if let Some(cached) = self
            .cache
            .get::<Vec<SearchResult>>(CacheKind::Search, &cache_key)
            .await?
        {
            debug!(results = cached.len(), "search cache hit");
            return Ok((cached, true));
        }

        let results = retry_with_backoff(&self.retry, "brave_search", || {
            self.execute(query, locale, max_results)
        })
        .await?;

        if !results.is_empty() {
            self.cache.set(CacheKind::Search, &cache_key, &results).await?;
        }

        info!(results = results.len(), "search completed");
        Ok((results, false))
    }
}

fn host_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}
