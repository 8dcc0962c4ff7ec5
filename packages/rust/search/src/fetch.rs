//! Page fetcher: downloads a URL and reduces it to Markdown text.
//!
//! Fetching never fails. Network errors, non-success statuses, unsupported
//! content types, and blocked targets all come back as a [`FetchedContent`]
//! with `error` set, so one bad source never aborts a domain.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::redirect::Policy;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use dossier_shared::{
    AdaptiveRateLimiter, AppConfig, DossierError, FetchedContent, Result, RetryPolicy,
    classify_status, retry_with_backoff,
};
use dossier_storage::{Cache, CacheKind};

use crate::extract::{extract_main_markdown, truncate_content};
use crate::{Fetcher, USER_AGENT, transport_error};

/// Largest body we are willing to download (5 MB).
const MAX_BODY_BYTES: u64 = 5 * 1024 * 1024;

/// Maximum number of redirects to follow.
const MAX_REDIRECTS: usize = 5;

/// Default delay between page requests.
const DEFAULT_FETCH_DELAY: Duration = Duration::from_millis(500);

/// What the content cache stores for a URL.
#[derive(Debug, Serialize, Deserialize)]
struct CachedPage {
    title: Option<String>,
    content: String,
}

/// HTTP page fetcher with caching, retry, and SSRF protection.
pub struct WebFetcher {
    client: Client,
    cache: Arc<Cache>,
    limiter: AdaptiveRateLimiter,
    retry: RetryPolicy,
    max_chars: usize,
    timeout: Duration,
    /// Allow localhost/private IPs (for tests against a mock server).
    allow_private: bool,
}

impl WebFetcher {
    pub fn from_config(config: &AppConfig, cache: Arc<Cache>) -> Result<Self> {
        Self::new(
            cache,
            RetryPolicy::from(config),
            config.search.max_content_chars,
            Duration::from_secs(config.search.fetch_timeout_secs),
        )
    }

    pub fn new(
        cache: Arc<Cache>,
        retry: RetryPolicy,
        max_chars: usize,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout, false)?,
            cache,
            limiter: AdaptiveRateLimiter::new(DEFAULT_FETCH_DELAY),
            retry,
            max_chars,
            timeout,
            allow_private: false,
        })
    }

    /// Allow fetching localhost/private IPs and drop the inter-request delay.
    #[cfg(test)]
    pub(crate) fn for_tests(mut self) -> Self {
        self.client = build_client(self.timeout, true).expect("test client");
        self.allow_private = true;
        self.limiter = AdaptiveRateLimiter::new(Duration::ZERO);
        self
    }

    async fn download(&self, url: &Url) -> Result<CachedPage> {
        self.limiter.wait().await;

        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| transport_error(url.as_str(), e))?;

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

        if let Some(len) = response.content_length() {
            if len > MAX_BODY_BYTES {
                return Err(DossierError::Network(format!("content too large: {len} bytes")));
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/html")
            .to_ascii_lowercase();
        if content_type.contains("application/pdf") {
            return Err(DossierError::Network("PDF extraction not available".into()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| DossierError::Network(format!("{url}: body read failed: {e}")))?;

        if content_type.starts_with("text/plain") {
            return Ok(CachedPage {
                title: None,
                content: truncate_content(body.trim(), self.max_chars),
            });
        }

        let (title, markdown) = extract_main_markdown(&body)?;
        Ok(CachedPage {
            title,
            content: truncate_content(&markdown, self.max_chars),
        })
    }
}

#[async_trait]
impl Fetcher for WebFetcher {
    async fn fetch(&self, url: &str) -> FetchedContent {
        let parsed = match Url::parse(url) {
            Ok(u) => u,
            Err(e) => return FetchedContent::failed(url, format!("invalid URL: {e}")),
        };
        if !self.allow_private && is_ssrf_target(&parsed) {
            warn!(%url, "SSRF protection: blocked");
            return FetchedContent::failed(url, "blocked: private or non-HTTP target");
        }

        let cache_key = format!("content:{url}");
        match self.cache.get::<CachedPage>(CacheKind::Content, &cache_key).await {
            Ok(Some(page)) => {
                debug!(%url, "content cache hit");
                return FetchedContent {
                    url: url.to_string(),
                    title: page.title,
                    content: Some(page.content),
                    error: None,
                };
            }
            Ok(None) => {}
            Err(e) => warn!(%url, error = %e, "content cache read failed"),
        }

        let result = retry_with_backoff(&self.retry, "fetch", || self.download(&parsed)).await;
        match result {
            Ok(page) if page.content.is_empty() => {
                FetchedContent::failed(url, "no extractable content")
            }
            Ok(page) => {
                if let Err(e) = self.cache.set(CacheKind::Content, &cache_key, &page).await {
                    warn!(%url, error = %e, "content cache write failed");
                }
                FetchedContent {
                    url: url.to_string(),
                    title: page.title,
                    content: Some(page.content),
                    error: None,
                }
            }
            Err(e) => {
                warn!(%url, error = %e, "fetch failed");
                FetchedContent::failed(url, e.to_string())
            }
        }
    }
}

fn build_client(timeout: Duration, allow_private: bool) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(redirect_policy(allow_private))
        .timeout(timeout)
        .build()
        .map_err(|e| DossierError::Network(format!("failed to build HTTP client: {e}")))
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Follows up to [`MAX_REDIRECTS`] hops, applying the SSRF check to each one.
fn redirect_policy(allow_private: bool) -> Policy {
    Policy::custom(move |attempt| {
        if attempt.previous().len() > MAX_REDIRECTS {
            attempt.error("too many redirects")
        } else if !allow_private && is_ssrf_target(attempt.url()) {
            warn!(url = %attempt.url(), "SSRF protection: redirect blocked");
            attempt.error("blocked: redirect to private or non-HTTP target")
        } else {
            attempt.follow()
        }
    })
}

/// Check if a URL targets a potentially dangerous resource.
fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(cache: Arc<Cache>, max_chars: usize) -> WebFetcher {
        WebFetcher::new(cache, RetryPolicy::immediate(2), max_chars, Duration::from_secs(5))
            .expect("fetcher")
            .for_tests()
    }

    #[tokio::test]
    async fn fetches_and_extracts_html() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/report"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "<html><head><title>Report</title></head><body><nav>menu</nav>\
                 <article><p>Incidence rose to 12 per 100,000.</p></article></body></html>",
                "text/html; charset=utf-8",
            ))
            .mount(&server)
            .await;

        let f = fetcher(Arc::new(Cache::disabled()), 10_000);
        let page = f.fetch(&format!("{}/report", server.uri())).await;
        assert!(page.success(), "error: {:?}", page.error);
        assert_eq!(page.title.as_deref(), Some("Report"));
        let content = page.content.unwrap();
        assert!(content.contains("12 per 100,000"));
        assert!(!content.contains("menu"));
    }

    #[tokio::test]
    async fn content_is_truncated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/long"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("x".repeat(500), "text/plain"))
            .mount(&server)
            .await;

        let f = fetcher(Arc::new(Cache::disabled()), 100);
        let page = f.fetch(&format!("{}/long", server.uri())).await;
        let content = page.content.unwrap();
        assert!(content.ends_with("[...truncated]"));
        assert!(content.len() < 200);
    }

    #[tokio::test]
    async fn http_errors_become_failed_content() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let f = fetcher(Arc::new(Cache::disabled()), 1000);
        let page = f.fetch(&format!("{}/missing", server.uri())).await;
        assert!(!page.success());
        assert!(page.error.unwrap().contains("404"));
    }

    #[tokio::test]
    async fn second_fetch_is_served_from_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cached"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("hello cache", "text/plain"))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = std::env::temp_dir().join(format!("dossier_fetch_{}.db", Uuid::now_v7()));
        let cache = Arc::new(Cache::open(&tmp, Duration::from_secs(60)).await.unwrap());
        let f = fetcher(cache, 1000);
        let url = format!("{}/cached", server.uri());

        assert!(f.fetch(&url).await.success());
        let again = f.fetch(&url).await;
        assert_eq!(again.content.as_deref(), Some("hello cache"));
    }

    #[tokio::test]
    async fn private_targets_are_blocked_by_default() {
        let f = WebFetcher::new(
            Arc::new(Cache::disabled()),
            RetryPolicy::immediate(1),
            1000,
            Duration::from_secs(1),
        )
        .unwrap();
        let page = f.fetch("http://127.0.0.1:9/secret").await;
        assert!(page.error.unwrap().contains("blocked"));

        let page = f.fetch("file:///etc/passwd").await;
        assert!(!page.success());
    }

    #[tokio::test]
    async fn redirects_to_private_targets_are_not_followed() {
        let server = MockServer::start().await;
        let port = server.address().port();
        Mock::given(method("GET"))
            .and(path("/bounce"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("Location", format!("http://localhost:{port}/secret")),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/secret"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("internal", "text/plain"))
            .expect(0)
            .mount(&server)
            .await;

        // The public-facing client, called past the initial URL check so the
        // mock server on loopback can play the public origin.
        let f = WebFetcher::new(
            Arc::new(Cache::disabled()),
            RetryPolicy::immediate(1),
            1000,
            Duration::from_secs(5),
        )
        .unwrap();
        let url = Url::parse(&format!("{}/bounce", server.uri())).unwrap();
        assert!(f.download(&url).await.is_err());
    }

    #[tokio::test]
    async fn redirects_between_public_pages_are_followed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(
                ResponseTemplate::new(301).insert_header("Location", format!("{}/new", server.uri())),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/new"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("moved here", "text/plain"))
            .mount(&server)
            .await;

        let f = fetcher(Arc::new(Cache::disabled()), 1000);
        let page = f.fetch(&format!("{}/old", server.uri())).await;
        assert_eq!(page.content.as_deref(), Some("moved here"));
    }

    #[test]
    fn ssrf_detection() {
        let check = |s: &str| is_ssrf_target(&Url::parse(s).unwrap());
        assert!(check("http://localhost/x"));
        assert!(check("http://10.1.2.3/x"));
        assert!(check("http://[::1]/x"));
        assert!(check("ftp://example.com/x"));
        assert!(!check("https://www.who.int/data"));
    }
}
