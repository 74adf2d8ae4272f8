//! Page fetching.
//!
//! [`BrowserPool`] is opened lazily on the first fetch and torn down with
//! [`BrowserPool::close`]. Each fetch is an independent request with no shared
//! cookie state.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use reqwest::redirect::Policy;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use cellforge_shared::{CellforgeError, Result};

use crate::dom::Dom;

/// User-Agent string for page requests.
const USER_AGENT: &str = concat!("Cellforge/", env!("CARGO_PKG_VERSION"));

const MAX_REDIRECTS: usize = 5;

/// Bodies are cut off after this many bytes.
pub const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

/// A loaded page.
#[derive(Debug, Clone)]
pub struct Page {
    pub status: u16,
    pub content_type: Option<String>,
    /// Final URL after redirects.
    pub url: Url,
    pub body: String,
}

impl Page {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Media type without parameters, lowercased.
    pub fn mime_type(&self) -> Option<String> {
        self.content_type
            .as_deref()
            .and_then(|ct| ct.split(';').next())
            .map(|m| m.trim().to_ascii_lowercase())
    }

    /// Run `f` against the page's parsed DOM.
    pub fn evaluate<T>(&self, f: impl FnOnce(&Dom) -> T) -> T {
        let dom = Dom::parse(&self.body);
        f(&dom)
    }
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, url: &Url, timeout: Duration) -> Result<Page>;
}

enum PoolState {
    Idle,
    Open(Client),
    Closed,
}

/// HTTP-backed page loader shared by every scrape in a process.
pub struct BrowserPool {
    state: Mutex<PoolState>,
    /// Allow localhost/private IPs (local servers and tests).
    allow_private_hosts: bool,
    max_body_bytes: usize,
}

impl Default for BrowserPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BrowserPool {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PoolState::Idle),
            allow_private_hosts: false,
            max_body_bytes: MAX_BODY_BYTES,
        }
    }

    /// Allow fetching localhost/private IPs.
    pub fn allow_private_hosts(mut self) -> Self {
        self.allow_private_hosts = true;
        self
    }

    pub fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Open the pool now instead of on the first fetch.
    pub async fn open(&self) -> Result<()> {
        self.client().await.map(|_| ())
    }

    pub async fn is_open(&self) -> bool {
        matches!(*self.state.lock().await, PoolState::Open(_))
    }

    /// Tear the pool down. Later fetches fail.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if matches!(*state, PoolState::Open(_)) {
            info!("closing browser pool");
        }
        *state = PoolState::Closed;
    }

    async fn client(&self) -> Result<Client> {
        let mut state = self.state.lock().await;
        match &*state {
            PoolState::Open(client) => Ok(client.clone()),
            PoolState::Closed => Err(CellforgeError::Network("browser pool is closed".into())),
            PoolState::Idle => {
                let allow_private_hosts = self.allow_private_hosts;
                let client = Client::builder()
                    .user_agent(USER_AGENT)
                    .redirect(Policy::custom(move |attempt| {
                        let hops = attempt.previous().len();
                        match redirect_refusal(attempt.url(), hops, allow_private_hosts) {
                            Some(reason) => attempt.error(reason),
                            None => attempt.follow(),
                        }
                    }))
                    .build()
                    .map_err(|e| {
                        CellforgeError::Network(format!("failed to build HTTP client: {e}"))
                    })?;
                debug!("browser pool opened");
                *state = PoolState::Open(client.clone());
                Ok(client)
            }
        }
    }
}

#[async_trait]
impl PageFetcher for BrowserPool {
    async fn fetch_page(&self, url: &Url, timeout: Duration) -> Result<Page> {
        if !self.allow_private_hosts && is_ssrf_target(url) {
            warn!(%url, "SSRF protection: blocked");
            return Err(CellforgeError::validation(format!(
                "refusing to fetch private address: {url}"
            )));
        }

        let client = self.client().await?;
        debug!(%url, "fetching page");

        let response = client
            .get(url.as_str())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| CellforgeError::Network(format!("{url}: {e}")))?;

        let status = response.status().as_u16();
        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut body = Vec::new();
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk =
                chunk.map_err(|e| CellforgeError::Network(format!("{url}: body read failed: {e}")))?;
            let room = self.max_body_bytes - body.len();
            if chunk.len() >= room {
                body.extend_from_slice(&chunk[..room]);
                warn!(%url, limit = self.max_body_bytes, "body too large, truncating");
                break;
            }
            body.extend_from_slice(&chunk);
        }
        let body = String::from_utf8_lossy(&body).into_owned();

        Ok(Page {
            status,
            content_type,
            url: final_url,
            body,
        })
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
pub fn is_ssrf_target(url: &Url) -> bool {
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

/// Why a redirect to `url` must not be followed, if it must not.
fn redirect_refusal(url: &Url, hops: usize, allow_private_hosts: bool) -> Option<String> {
    if hops >= MAX_REDIRECTS {
        return Some(format!("too many redirects (max {MAX_REDIRECTS})"));
    }
    if !allow_private_hosts && is_ssrf_target(url) {
        warn!(%url, "SSRF protection: blocked redirect");
        return Some(format!("refusing to follow redirect to private address: {url}"));
    }
    None
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
                // 192.0.0.0/24
                || (v4.octets()[0] == 192 && v4.octets()[1] == 0 && v4.octets()[2] == 0)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}
