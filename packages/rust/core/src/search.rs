//! Web search over the Serper API, with a domain blocklist.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use url::Url;

use cellforge_shared::{CellforgeError, Result, SearchConfig, WebSource, resolve_key};

const USER_AGENT: &str = concat!("Cellforge/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<WebSource>>;
}

/// Serper (`google.serper.dev`) search client.
#[derive(Clone)]
pub struct SerperSearch {
    client: Client,
    endpoint: String,
    api_key: String,
    results_per_query: usize,
    blocklist: Vec<String>,
}

impl SerperSearch {
    pub fn new(config: &SearchConfig, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CellforgeError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: api_key.into(),
            results_per_query: config.results_per_query,
            blocklist: config
                .blocklist
                .iter()
                .map(|d| d.trim().trim_start_matches("www.").to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        })
    }

    /// Build a client with the key read from `config.api_key_env`.
    pub fn from_config(config: &SearchConfig) -> Result<Self> {
        Self::new(config, resolve_key(&config.api_key_env)?)
    }

    /// The query with a `-site:` exclusion per blocked domain.
    fn query_with_exclusions(&self, query: &str) -> String {
        let mut q = query.trim().to_string();
        for domain in &self.blocklist {
            q.push_str(" -site:");
            q.push_str(domain);
        }
        q
    }

    fn is_blocked(&self, url: &str) -> bool {
        let Some(host) = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        else {
            return true;
        };
        self.blocklist
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{d}")))
    }
}

#[async_trait]
impl WebSearch for SerperSearch {
    #[instrument(skip(self))]
    async fn search(&self, query: &str) -> Result<Vec<WebSource>> {
        let body = SerperRequest {
            q: self.query_with_exclusions(query),
            num: self.results_per_query,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .header("X-API-KEY", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CellforgeError::Search(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CellforgeError::Search(format!(
                "search failed ({status}): {text}"
            )));
        }

        let parsed: SerperResponse = response
            .json()
            .await
            .map_err(|e| CellforgeError::Search(format!("invalid search response: {e}")))?;

        let results: Vec<WebSource> = parsed
            .organic
            .into_iter()
            .filter(|r| !self.is_blocked(&r.link))
            .map(|r| WebSource {
                title: r.title,
                url: r.link,
                snippet: r.snippet.unwrap_or_default(),
            })
            .collect();
        debug!(count = results.len(), "search results");
        Ok(results)
    }
}

/// Outcome of running several queries.
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub sources: Vec<WebSource>,
    /// One message per failed query.
    pub errors: Vec<String>,
}

/// Run every query, dedupe results by URL, and keep at most `max_sources`.
/// A failed query is recorded and the others still run.
pub async fn search_queries_to_sources(
    search: &dyn WebSearch,
    queries: &[String],
    max_sources: usize,
) -> SearchOutcome {
    let mut outcome = SearchOutcome::default();
    for query in queries {
        match search.search(query).await {
            Ok(results) => {
                for source in results {
                    if !outcome.sources.iter().any(|s| s.url == source.url) {
                        outcome.sources.push(source);
                    }
                }
            }
            Err(e) => {
                warn!(query, error = %e, "search failed, skipping");
                outcome
                    .errors
                    .push(format!("Failed to search for \"{query}\": {e}"));
            }
        }
    }
    outcome.sources.truncate(max_sources);
    outcome
}

#[derive(Debug, Serialize)]
struct SerperRequest {
    q: String,
    num: usize,
}

#[derive(Debug, Deserialize)]
struct SerperResponse {
    #[serde(default)]
    organic: Vec<SerperResult>,
}

#[derive(Debug, Deserialize)]
struct SerperResult {
    title: String,
    link: String,
    #[serde(default)]
    snippet: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> SearchConfig {
        SearchConfig {
            endpoint: format!("{}/search", server.uri()),
            results_per_query: 3,
            blocklist: vec!["youtube.com".into(), "www.x.com".into()],
            ..SearchConfig::default()
        }
    }

    #[test]
    fn exclusions_and_blocked_hosts() {
        let search = SerperSearch::new(&SearchConfig {
            blocklist: vec!["youtube.com".into()],
            ..SearchConfig::default()
        }, "k")
        .unwrap();
        assert_eq!(search.query_with_exclusions(" rivers "), "rivers -site:youtube.com");
        assert!(search.is_blocked("https://www.youtube.com/watch?v=1"));
        assert!(search.is_blocked("https://youtube.com/"));
        assert!(!search.is_blocked("https://notyoutube.com/"));
        assert!(search.is_blocked("not a url"));
    }

    #[tokio::test]
    async fn search_posts_query_and_filters_results() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-api-key", "serper-key"))
            .and(body_partial_json(json!({
                "q": "longest rivers -site:youtube.com -site:x.com",
                "num": 3
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "organic": [
                    {"title": "Rivers", "link": "https://rivers.example/list", "snippet": "The Nile..."},
                    {"title": "Video", "link": "https://m.youtube.com/watch?v=2"},
                    {"title": "No snippet", "link": "https://geo.example/"}
                ]
            })))
            .mount(&server)
            .await;

        let search = SerperSearch::new(&config(&server), "serper-key").unwrap();
        let results = search.search("longest rivers").await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].url, "https://rivers.example/list");
        assert_eq!(results[0].snippet, "The Nile...");
        assert_eq!(results[1].snippet, "");
    }

    #[tokio::test]
    async fn http_failure_is_a_search_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("bad key"))
            .mount(&server)
            .await;
        let search = SerperSearch::new(&config(&server), "nope").unwrap();
        let err = search.search("anything").await.unwrap_err();
        assert!(matches!(err, CellforgeError::Search(_)));
    }

    struct Canned;

    #[async_trait]
    impl WebSearch for Canned {
        async fn search(&self, query: &str) -> Result<Vec<WebSource>> {
            if query == "broken" {
                return Err(CellforgeError::Search("quota".into()));
            }
            Ok(vec![
                WebSource {
                    title: "A".into(),
                    url: "https://a.example".into(),
                    snippet: String::new(),
                },
                WebSource {
                    title: format!("{query} B"),
                    url: format!("https://{query}.example"),
                    snippet: String::new(),
                },
            ])
        }
    }

    #[tokio::test]
    async fn sources_are_deduped_and_capped() {
        let queries = vec!["one".to_string(), "broken".to_string(), "two".to_string()];
        let outcome = search_queries_to_sources(&Canned, &queries, 10).await;
        let urls: Vec<&str> = outcome.sources.iter().map(|s| s.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a.example", "https://one.example", "https://two.example"]);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].contains("broken"));

        let capped = search_queries_to_sources(&Canned, &queries, 2).await;
        assert_eq!(capped.sources.len(), 2);
    }
}
