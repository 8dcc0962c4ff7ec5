//! Search and fetch collaborators for the research pipeline.
//!
//! - [`SearchClient`] runs a web query; [`BraveSearchClient`] is the HTTP
//!   implementation against the Brave Search API.
//! - [`Fetcher`] downloads a page and reduces it to Markdown text;
//!   [`WebFetcher`] is the HTTP implementation.
//!
//! Both consult the shared [`dossier_storage::Cache`] before going to the network.

mod brave;
mod extract;
mod fetch;

use async_trait::async_trait;
use dossier_shared::{FetchedContent, Result, SearchResult};

pub use brave::BraveSearchClient;
pub use extract::{extract_main_markdown, truncate_content};
pub use fetch::WebFetcher;

/// User-Agent string for outbound requests.
pub(crate) const USER_AGENT: &str = concat!("Dossier/", env!("CARGO_PKG_VERSION"));

/// Web search capability.
#[async_trait]
pub trait SearchClient: Send + Sync {
    /// Run one query. Returns the hits and whether they came from the cache.
    async fn search(
        &self,
        query: &str,
        locale: Option<&str>,
        max_results: u32,
    ) -> Result<(Vec<SearchResult>, bool)>;
}

/// Page fetch capability. Never fails: errors are carried in the result.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> FetchedContent;
}

/// Map a transport-level reqwest error onto the retry taxonomy.
pub(crate) fn transport_error(url: &str, e: reqwest::Error) -> dossier_shared::DossierError {
    if e.is_timeout() || e.is_connect() {
        dossier_shared::DossierError::Transient(format!("{url}: {e}"))
    } else {
        dossier_shared::DossierError::Network(format!("{url}: {e}"))
    }
}
