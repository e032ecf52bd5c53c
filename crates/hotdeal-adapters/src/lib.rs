//! Site adapter contracts, raw listing records and the fixture-first adapter.
//!
//! Raw records keep the shape each board family exposes. Everything after
//! [`normalize`] works on [`hotdeal_core::HotDealDraft`] only.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hotdeal_core::SiteId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

mod normalize;

pub use normalize::{
    extract_post_id_from_link, extract_seller, fallback_post_id, infer_category, normalize,
    parse_post_date, parse_price, PriceInfo, DEFAULT_SELLER,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("network error: {0}")]
    Network(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
}

impl AdapterError {
    /// Network failures and throttling are transient; a page that does not
    /// parse will not parse on the next attempt either.
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Network(_) | AdapterError::RateLimited(_))
    }
}

/// Listing row as exposed by the classic boards (ppomppu, ruliweb, clien,
/// coolenjoy, eomisae, itcm).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoardPost {
    #[serde(default)]
    pub post_number: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub price_text: Option<String>,
    #[serde(default)]
    pub date_text: Option<String>,
    #[serde(default)]
    pub views: u64,
    #[serde(default, alias = "recommends")]
    pub likes: u64,
    #[serde(default)]
    pub comments: u64,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub sold_out: bool,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
}

/// Listing row of market-style boards (quasarzone) that split price, store
/// and a status label into their own columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketPost {
    #[serde(default)]
    pub post_number: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub price: Option<u64>,
    #[serde(default)]
    pub original_price: Option<u64>,
    #[serde(default)]
    pub store: Option<String>,
    #[serde(default)]
    pub shipping: Option<String>,
    #[serde(default)]
    pub status_label: Option<String>,
    #[serde(default)]
    pub date_text: Option<String>,
    #[serde(default)]
    pub views: u64,
    #[serde(default)]
    pub recommends: u64,
    #[serde(default)]
    pub comments: u64,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
}

impl MarketPost {
    pub fn is_ended(&self) -> bool {
        self.status_label
            .as_deref()
            .is_some_and(|label| matches!(label.trim(), "종료" | "품절" | "마감"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawRecord {
    Board(BoardPost),
    Market(MarketPost),
}

impl RawRecord {
    pub fn title(&self) -> &str {
        match self {
            RawRecord::Board(p) => &p.title,
            RawRecord::Market(p) => &p.title,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            RawRecord::Board(p) => &p.url,
            RawRecord::Market(p) => &p.url,
        }
    }

    pub fn post_number(&self) -> Option<&str> {
        let raw = match self {
            RawRecord::Board(p) => p.post_number.as_deref(),
            RawRecord::Market(p) => p.post_number.as_deref(),
        };
        raw.map(str::trim).filter(|s| !s.is_empty())
    }

    pub fn is_ended(&self) -> bool {
        match self {
            RawRecord::Board(p) => p.sold_out,
            RawRecord::Market(p) => p.is_ended(),
        }
    }
}

/// Extra content from a listing's own page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetailRecord {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

#[async_trait]
pub trait SiteAdapter: Send + Sync {
    fn site(&self) -> SiteId;

    /// Raw records of board page `page` (1-based). An empty page means the
    /// board has no more listings.
    async fn fetch_page(&self, page: u32) -> Result<Vec<RawRecord>, AdapterError>;

    async fn fetch_detail(&self, _link: &str) -> Result<DetailRecord, AdapterError> {
        Ok(DetailRecord::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum SimulatedFailure {
    Network,
    RateLimited,
}

#[derive(Debug, Deserialize)]
struct PageFixture {
    #[serde(default)]
    records: Vec<RawRecord>,
    #[serde(default)]
    error: Option<SimulatedFailure>,
}

/// Adapter that replays recorded board pages from `<root>/<site>/page-<n>.json`.
#[derive(Debug, Clone)]
pub struct FixtureSiteAdapter {
    site: SiteId,
    dir: PathBuf,
}

impl FixtureSiteAdapter {
    pub fn new(root: impl AsRef<Path>, site: SiteId) -> Self {
        Self {
            site,
            dir: root.as_ref().join(site.as_str()),
        }
    }

    pub fn page_path(&self, page: u32) -> PathBuf {
        self.dir.join(format!("page-{page}.json"))
    }

    pub fn detail_path(&self, post_id: &str) -> PathBuf {
        self.dir.join(format!("detail-{post_id}.json"))
    }

    async fn read_optional(&self, path: &Path) -> Result<Option<String>, AdapterError> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(AdapterError::Network(format!(
                "reading {}: {err}",
                path.display()
            ))),
        }
    }
}

#[async_trait]
impl SiteAdapter for FixtureSiteAdapter {
    fn site(&self) -> SiteId {
        self.site
    }

    async fn fetch_page(&self, page: u32) -> Result<Vec<RawRecord>, AdapterError> {
        let path = self.page_path(page);
        let Some(text) = self.read_optional(&path).await? else {
            debug!(site = %self.site, page, "no fixture page; treating as end of board");
            return Ok(Vec::new());
        };
        let fixture: PageFixture = serde_json::from_str(&text)
            .map_err(|e| AdapterError::Parse(format!("{}: {e}", path.display())))?;
        match fixture.error {
            Some(SimulatedFailure::Network) => Err(AdapterError::Network(format!(
                "{} page {page} unreachable",
                self.site
            ))),
            Some(SimulatedFailure::RateLimited) => Err(AdapterError::RateLimited(format!(
                "{} page {page} throttled",
                self.site
            ))),
            None => Ok(fixture.records),
        }
    }

    async fn fetch_detail(&self, link: &str) -> Result<DetailRecord, AdapterError> {
        let Some(post_id) = extract_post_id_from_link(link) else {
            return Ok(DetailRecord::default());
        };
        let path = self.detail_path(&post_id);
        let Some(text) = self.read_optional(&path).await? else {
            return Ok(DetailRecord::default());
        };
        serde_json::from_str(&text)
            .map_err(|e| AdapterError::Parse(format!("{}: {e}", path.display())))
    }
}

/// Adapters by source. One adapter per external site.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<SiteId, Arc<dyn SiteAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixture adapters for every known site rooted at `root`.
    pub fn fixture_backed(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let mut registry = Self::new();
        for site in SiteId::ALL {
            registry.register(Arc::new(FixtureSiteAdapter::new(root, site)));
        }
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn SiteAdapter>) {
        self.adapters.insert(adapter.site(), adapter);
    }

    pub fn get(&self, site: SiteId) -> Option<Arc<dyn SiteAdapter>> {
        self.adapters.get(&site).cloned()
    }

    pub fn sites(&self) -> Vec<SiteId> {
        let mut sites: Vec<_> = self.adapters.keys().copied().collect();
        sites.sort();
        sites
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("sites", &self.sites())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, body: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(name), body).unwrap();
    }

    #[tokio::test]
    async fn missing_page_is_end_of_board() {
        let root = tempfile::tempdir().unwrap();
        let adapter = FixtureSiteAdapter::new(root.path(), SiteId::Clien);
        assert!(adapter.fetch_page(7).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn simulated_failures_and_bad_json_surface_as_errors() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("ruliweb");
        write(&dir, "page-1.json", r#"{"error":"network"}"#);
        write(&dir, "page-2.json", r#"{"error":"rate_limited"}"#);
        write(&dir, "page-3.json", "{ nope");

        let adapter = FixtureSiteAdapter::new(root.path(), SiteId::Ruliweb);
        let e1 = adapter.fetch_page(1).await.unwrap_err();
        let e2 = adapter.fetch_page(2).await.unwrap_err();
        let e3 = adapter.fetch_page(3).await.unwrap_err();
        assert!(matches!(e1, AdapterError::Network(_)));
        assert!(matches!(e2, AdapterError::RateLimited(_)));
        assert!(matches!(e3, AdapterError::Parse(_)));
        assert!(e1.is_transient() && e2.is_transient() && !e3.is_transient());
    }

    #[tokio::test]
    async fn detail_is_looked_up_by_link_id() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("clien");
        write(&dir, "detail-18812345.json", r#"{"description":"본문","image_url":null}"#);

        let adapter = FixtureSiteAdapter::new(root.path(), SiteId::Clien);
        let detail = adapter
            .fetch_detail("https://www.clien.net/service/board/jirum/18812345")
            .await
            .unwrap();
        assert_eq!(detail.description.as_deref(), Some("본문"));

        let none = adapter
            .fetch_detail("https://www.clien.net/service/board/jirum/1")
            .await
            .unwrap();
        assert_eq!(none, DetailRecord::default());
    }

    #[test]
    fn market_status_label_marks_ended() {
        let post = MarketPost {
            status_label: Some(" 종료 ".into()),
            ..Default::default()
        };
        assert!(RawRecord::Market(post).is_ended());
        assert!(!RawRecord::Board(BoardPost::default()).is_ended());
    }

    #[test]
    fn registry_covers_every_site() {
        let registry = AdapterRegistry::fixture_backed("fixtures");
        assert_eq!(registry.sites(), SiteId::ALL.to_vec());
        assert_eq!(registry.get(SiteId::Itcm).unwrap().site(), SiteId::Itcm);
    }
}
