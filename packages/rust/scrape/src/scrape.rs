//! Fetch, extract, and render pages as Markdown.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use tracing::{debug, info, instrument, warn};
use url::Url;

use cellforge_markdown::{MarkdownTree, TreeOptions, build_tree};
use cellforge_shared::{PageMetadata, ScrapeConfig, SerializedElement};

use crate::browser::PageFetcher;
use crate::extract::Extractor;

/// Media types rendered as a single paragraph instead of being extracted.
const PLAIN_TEXT_TYPES: &[&str] = &[
    "text/plain",
    "text/markdown",
    "application/json",
    "application/xml",
    "text/xml",
    "text/csv",
];

const TRUNCATION_MARKER: &str = "...";

#[derive(Debug, Clone)]
pub struct ScrapeOptions {
    pub timeout: Duration,
    pub max_chars_per_element: i64,
    pub max_total_content_length: usize,
    pub concurrency: usize,
}

impl From<&ScrapeConfig> for ScrapeOptions {
    fn from(config: &ScrapeConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            max_chars_per_element: config.max_chars_per_element,
            max_total_content_length: config.max_total_content_length,
            concurrency: config.concurrency.max(1),
        }
    }
}

impl Default for ScrapeOptions {
    fn default() -> Self {
        Self::from(&ScrapeConfig::default())
    }
}

/// A page reduced to its main content.
#[derive(Debug, Clone)]
pub struct ScrapedPage {
    pub url: String,
    pub title: String,
    /// Rendered Markdown, truncated to the configured length.
    pub content: String,
    pub tree: MarkdownTree,
    pub metadata: PageMetadata,
}

/// Turns URLs into [`ScrapedPage`]s.
#[derive(Clone)]
pub struct Scraper {
    fetcher: Arc<dyn PageFetcher>,
    extractor: Extractor,
    opts: ScrapeOptions,
}

impl Scraper {
    pub fn new(fetcher: Arc<dyn PageFetcher>, opts: ScrapeOptions) -> Self {
        Self {
            fetcher,
            extractor: Extractor::default(),
            opts,
        }
    }

    pub fn with_extractor(mut self, extractor: Extractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Scrape one page. Any failure makes the page unusable and yields `None`.
    #[instrument(skip(self))]
    pub async fn scrape_url(&self, url: &str) -> Option<ScrapedPage> {
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(url, error = %e, "invalid URL, skipping");
                return None;
            }
        };

        let page = match self.fetcher.fetch_page(&parsed, self.opts.timeout).await {
            Ok(page) => page,
            Err(e) => {
                warn!(url, error = %e, "fetch failed, skipping");
                return None;
            }
        };
        if !page.is_success() {
            warn!(url, status = page.status, "non-success status, skipping");
            return None;
        }

        let is_plain_text = page
            .mime_type()
            .is_some_and(|m| PLAIN_TEXT_TYPES.contains(&m.as_str()));

        let (elements, metadata) = if is_plain_text {
            let paragraph = SerializedElement::new("p").with_text(page.body.as_str());
            (vec![paragraph], PageMetadata::default())
        } else {
            match page.evaluate(|dom| self.extractor.extract(dom)) {
                Some(extracted) => (extracted.elements, extracted.metadata),
                None => {
                    warn!(url, "no main content found, skipping");
                    return None;
                }
            }
        };

        let title = if metadata.title.is_empty() {
            url.to_string()
        } else {
            metadata.title.clone()
        };

        let tree = build_tree(
            &title,
            &elements,
            &TreeOptions {
                max_chars_per_element: self.opts.max_chars_per_element,
                base_url: Some(page.url.clone()),
            },
        );
        let content = truncate_content(tree.stringify(), self.opts.max_total_content_length);
        debug!(url, chars = content.len(), "page scraped");

        Some(ScrapedPage {
            url: url.to_string(),
            title,
            content,
            tree,
            metadata,
        })
    }

    /// Scrape many pages with bounded concurrency, yielding each result as it
    /// completes.
    pub fn scrape_urls(
        &self,
        urls: Vec<String>,
    ) -> impl Stream<Item = (String, Option<ScrapedPage>)> + '_ {
        info!(urls = urls.len(), concurrency = self.opts.concurrency, "scraping sources");
        stream::iter(urls)
            .map(move |url| async move {
                let page = self.scrape_url(&url).await;
                (url, page)
            })
            .buffer_unordered(self.opts.concurrency.max(1))
    }
}

/// Cut rendered content at `max_chars` characters and mark the cut.
fn truncate_content(content: String, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        Some((cut, _)) => {
            let mut truncated = content[..cut].to_string();
            truncated.push_str(TRUNCATION_MARKER);
            truncated
        }
        None => content,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::BrowserPool;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ARTICLE: &str = r#"<html><head><title>Tea guide</title></head><body>
        <nav><a href="/">Home page link</a></nav>
        <main>
          <h1>Brewing green tea</h1>
          <p>Green tea prefers water well below boiling point.</p>
          <p>Steep the leaves for two to three minutes at most.</p>
          <p>Longer steeping makes the cup <a href="/bitter">noticeably bitter</a>.</p>
        </main>
        </body></html>"#;

    fn scraper() -> Scraper {
        Scraper::new(
            Arc::new(BrowserPool::new().allow_private_hosts()),
            ScrapeOptions::default(),
        )
    }

    async fn serve(server: &MockServer, route: &str, content_type: &str, body: &str) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(body, content_type),
            )
            .mount(server)
            .await;
    }

    #[test]
    fn truncation_appends_marker() {
        assert_eq!(truncate_content("abcdef".into(), 4), "abcd...");
        assert_eq!(truncate_content("abc".into(), 4), "abc");
        assert_eq!(truncate_content("ééé".into(), 2), "éé...");
    }

    #[tokio::test]
    async fn scrapes_html_into_markdown() {
        let server = MockServer::start().await;
        serve(&server, "/tea", "text/html; charset=utf-8", ARTICLE).await;

        let url = format!("{}/tea", server.uri());
        let page = scraper().scrape_url(&url).await.expect("page");

        assert_eq!(page.url, url);
        assert_eq!(page.title, "Tea guide");
        assert!(page.content.starts_with("# Tea guide\n\n## Brewing green tea"));
        assert!(page.content.contains("well below boiling point"));
        assert!(page.content.contains("noticeably bitter"));
        assert!(!page.content.contains("Home page link"));
    }

    #[tokio::test]
    async fn plain_text_is_wrapped_in_a_paragraph() {
        let server = MockServer::start().await;
        serve(&server, "/notes.txt", "text/plain", "Just some plain notes.\nSecond line.").await;

        let url = format!("{}/notes.txt", server.uri());
        let page = scraper().scrape_url(&url).await.expect("page");
        assert_eq!(page.title, url);
        assert_eq!(page.content, format!("# {url}\n\nJust some plain notes. Second line."));
    }

    #[tokio::test]
    async fn failures_yield_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        serve(&server, "/empty", "text/html", "<html><body><p>tiny</p></body></html>").await;

        let s = scraper();
        assert!(s.scrape_url(&format!("{}/gone", server.uri())).await.is_none());
        assert!(s.scrape_url(&format!("{}/empty", server.uri())).await.is_none());
        assert!(s.scrape_url("not a url").await.is_none());
    }

    #[tokio::test]
    async fn batch_yields_every_url() {
        let server = MockServer::start().await;
        serve(&server, "/tea", "text/html", ARTICLE).await;

        let good = format!("{}/tea", server.uri());
        let bad = format!("{}/missing", server.uri());
        let s = scraper();
        let mut results: Vec<(String, Option<ScrapedPage>)> =
            s.scrape_urls(vec![good.clone(), bad.clone()]).collect().await;
        results.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(results.len(), 2);
        let by_url = |u: &str| results.iter().find(|(url, _)| url == u).map(|(_, p)| p.is_some());
        assert_eq!(by_url(&good), Some(true));
        assert_eq!(by_url(&bad), Some(false));
    }
}
