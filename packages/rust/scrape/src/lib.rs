//! Page fetching and main-content extraction.
//!
//! This crate provides:
//! - [`browser`] — [`PageFetcher`] and the pooled [`BrowserPool`] implementation
//! - [`dom`] / [`layout`] — a DOM arena and the geometry used to locate content
//! - [`cluster`] / [`extract`] — spatial clustering and serialization of the main content
//! - [`Scraper`] — fetch, extract, and render pages as Markdown

pub mod browser;
pub mod cluster;
pub mod dom;
pub mod extract;
pub mod layout;
pub mod scrape;

pub use browser::{BrowserPool, Page, PageFetcher, is_ssrf_target};
pub use cluster::ClusterThresholds;
pub use dom::{Dom, DomId};
pub use extract::{Extracted, Extractor, page_metadata};
pub use layout::{FlowLayout, Layout, LayoutEngine, Rect, Viewport};
pub use scrape::{ScrapeOptions, ScrapedPage, Scraper};
