//! Source location and table extraction for SCDP: listing configuration,
//! pagination, and the HTML / PDF text / OCR strategy chain.

mod extract;
mod html;
mod layout;
mod pdf;
pub mod text;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use scdp_core::{ContentHint, RawDocument, SourceRef};
use scdp_storage::{CancelToken, FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

pub use extract::{
    reliability, select_per_region, ExtractionFailed, ExtractionStrategy, Extractor, StrategyAttempt,
    StrategyOutcome, TableSignals,
};
pub use html::{parse_tables, HtmlGrid, HtmlTableStrategy};
pub use layout::{line_cells, parse_page, split_cells, stitch, Cell, PageTable, PageText, StitchedTable};
pub use pdf::{CommandOcrEngine, OcrEngine, PdfOcrStrategy, PdfTextStrategy};

pub const CRATE_NAME: &str = "scdp-adapters";

fn default_true() -> bool {
    true
}

fn default_hint() -> ContentHint {
    ContentHint::Html
}

/// One configured listing or report in `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub listing_url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_hint")]
    pub content_hint: ContentHint,
    /// CSS selector of the "next page" link.
    #[serde(default)]
    pub next_selector: Option<String>,
    /// CSS selector of per-entity document links (e.g. PDF reports).
    #[serde(default)]
    pub document_selector: Option<String>,
    #[serde(default)]
    pub market: Option<String>,
    #[serde(default)]
    pub board: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcesConfig {
    pub sources: Vec<SourceConfig>,
}

pub fn load_sources_config(path: impl AsRef<Path>) -> Result<SourcesConfig> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid scope {0:?}; expected all, market:<key> or board:<key>")]
pub struct ScopeParseError(String);

/// Which part of the taxonomy a run covers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Scope {
    #[default]
    All,
    Market(String),
    Board(String),
}

impl Scope {
    /// Unknown (`None`) hints are always compatible.
    pub fn admits(&self, market: Option<&str>, board: Option<&str>) -> bool {
        match self {
            Self::All => true,
            Self::Market(key) => market.map_or(true, |m| m == key),
            Self::Board(key) => board.map_or(true, |b| b == key),
        }
    }

    pub fn admits_source(&self, source: &SourceConfig) -> bool {
        self.admits(source.market.as_deref(), source.board.as_deref())
    }
}

impl FromStr for Scope {
    type Err = ScopeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        match s.split_once(':') {
            Some(("market", key)) if !key.trim().is_empty() => Ok(Self::Market(key.trim().to_string())),
            Some(("board", key)) if !key.trim().is_empty() => Ok(Self::Board(key.trim().to_string())),
            _ => Err(ScopeParseError(s.to_string())),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Market(key) => write!(f, "market:{key}"),
            Self::Board(key) => write!(f, "board:{key}"),
        }
    }
}

/// Lowercase scheme and host, no fragment, no default port, sorted query pairs.
pub fn canonical_url(raw: &str) -> Result<String, url::ParseError> {
    let mut url = Url::parse(raw.trim())?;
    url.set_fragment(None);
    let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }
    Ok(url.to_string())
}

fn resolve_href(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.to_ascii_lowercase().starts_with("javascript:") {
        return None;
    }
    let joined = Url::parse(base).ok()?.join(href).ok()?;
    canonical_url(joined.as_str()).ok()
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LocatorError {
    #[error("listing {source_id} does not terminate at {url}: {reason}")]
    Exhausted {
        source_id: String,
        url: String,
        reason: String,
    },
    #[error("invalid selector {selector:?} for source {source_id}: {reason}")]
    InvalidSelector {
        source_id: String,
        selector: String,
        reason: String,
    },
    #[error("invalid url {url:?} for source {source_id}")]
    InvalidUrl { source_id: String, url: String },
    #[error("source location cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedListing {
    pub source_id: String,
    pub url: String,
    pub reason: String,
}

/// Everything the locator found, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct Located {
    pub refs: Vec<SourceRef>,
    /// Listing pages already downloaded while paginating, keyed by canonical URL.
    pub prefetched: BTreeMap<String, RawDocument>,
    pub warnings: Vec<String>,
    pub skipped: Vec<SkippedListing>,
    pub retry_events: usize,
}

struct PageLinks {
    documents: Vec<String>,
    next: Option<String>,
}

fn parse_selector(source: &SourceConfig, selector: &str) -> Result<Selector, LocatorError> {
    Selector::parse(selector).map_err(|e| LocatorError::InvalidSelector {
        source_id: source.id.clone(),
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

fn is_disabled(link: ElementRef<'_>) -> bool {
    let el = link.value();
    el.attr("aria-disabled") == Some("true")
        || el.attr("class").is_some_and(|c| c.split_whitespace().any(|c| c == "disabled"))
}

fn page_links(body: &[u8], page_url: &str, source: &SourceConfig) -> Result<PageLinks, LocatorError> {
    let html = Html::parse_document(&String::from_utf8_lossy(body));
    let mut documents = Vec::new();
    if let Some(selector) = &source.document_selector {
        let sel = parse_selector(source, selector)?;
        for link in html.select(&sel) {
            if let Some(url) = link.value().attr("href").and_then(|h| resolve_href(page_url, h)) {
                documents.push(url);
            }
        }
    }
    let next = match &source.next_selector {
        Some(selector) => {
            let sel = parse_selector(source, selector)?;
            html.select(&sel)
                .filter(|link| !is_disabled(*link))
                .find_map(|link| link.value().attr("href").and_then(|h| resolve_href(page_url, h)))
        }
        None => None,
    };
    Ok(PageLinks { documents, next })
}

/// Walks configured listings and produces the ordered, deduplicated set of
/// documents a run has to extract.
#[derive(Debug)]
pub struct Locator<'a> {
    fetcher: &'a HttpFetcher,
    max_pages: usize,
}

impl<'a> Locator<'a> {
    pub fn new(fetcher: &'a HttpFetcher, max_pages: usize) -> Self {
        Self {
            fetcher,
            max_pages: max_pages.max(1),
        }
    }

    pub async fn locate(
        &self,
        sources: &[SourceConfig],
        scope: &Scope,
        cancel: &CancelToken,
    ) -> Result<Located, LocatorError> {
        let mut located = Located::default();
        let mut seen = HashSet::new();
        for source in sources.iter().filter(|s| s.enabled && scope.admits_source(s)) {
            if cancel.is_cancelled() {
                return Err(LocatorError::Cancelled);
            }
            self.locate_source(source, cancel, &mut located, &mut seen).await?;
        }
        info!(
            documents = located.refs.len(),
            prefetched = located.prefetched.len(),
            skipped = located.skipped.len(),
            "source location finished"
        );
        Ok(located)
    }

    async fn locate_source(
        &self,
        source: &SourceConfig,
        cancel: &CancelToken,
        located: &mut Located,
        seen: &mut HashSet<String>,
    ) -> Result<(), LocatorError> {
        let start = canonical_url(&source.listing_url).map_err(|_| LocatorError::InvalidUrl {
            source_id: source.id.clone(),
            url: source.listing_url.clone(),
        })?;
        let hinted = |r: SourceRef| r.with_hints(source.market.clone(), source.board.clone());

        if source.content_hint == ContentHint::Pdf {
            if seen.insert(start.clone()) {
                located.refs.push(hinted(SourceRef::new(&source.id, start, ContentHint::Pdf)));
            }
            return Ok(());
        }

        let mut visited = HashSet::new();
        let mut body_hashes = HashSet::new();
        let mut url = start;
        let mut parent: Option<String> = None;
        let mut page_index = 0u32;

        loop {
            visited.insert(url.clone());
            let page_ref = hinted(
                SourceRef::new(&source.id, url.clone(), source.content_hint).with_page(parent.clone(), page_index),
            );
            let fetched = match self.fetcher.fetch(&page_ref, cancel).await {
                Ok(fetched) => fetched,
                Err(FetchError::Cancelled { .. }) => return Err(LocatorError::Cancelled),
                Err(err) => {
                    warn!(source_id = %source.id, %url, error = %err, "listing page skipped");
                    located.skipped.push(SkippedListing {
                        source_id: source.id.clone(),
                        url: url.clone(),
                        reason: err.to_string(),
                    });
                    return Ok(());
                }
            };
            located.retry_events += fetched.retries.len();
            let document = fetched.document;

            if !body_hashes.insert(document.content_hash().to_string()) {
                return Err(LocatorError::Exhausted {
                    source_id: source.id.clone(),
                    url,
                    reason: format!("page {} repeats an earlier page of the listing", page_index + 1),
                });
            }

            let links = page_links(document.body(), &url, source)?;
            if seen.insert(url.clone()) {
                located.refs.push(page_ref);
                located.prefetched.insert(url.clone(), document);
            }
            for link in links.documents {
                if seen.insert(link.clone()) {
                    let mut doc_ref = SourceRef::new(&source.id, link.clone(), ContentHint::from_url(&link));
                    doc_ref.parent = Some(url.clone());
                    located.refs.push(hinted(doc_ref));
                }
            }

            let Some(next) = links.next else { break };
            if visited.contains(&next) {
                return Err(LocatorError::Exhausted {
                    source_id: source.id.clone(),
                    url: next,
                    reason: "next link points back to an already visited page".to_string(),
                });
            }
            if page_index as usize + 1 >= self.max_pages {
                let message = format!(
                    "source {} stopped at the page cap of {} with more pages remaining",
                    source.id, self.max_pages
                );
                warn!(source_id = %source.id, max_pages = self.max_pages, "pagination cap reached");
                located.warnings.push(message);
                break;
            }
            parent = Some(url);
            url = next;
            page_index += 1;
        }
        Ok(())
    }
}
