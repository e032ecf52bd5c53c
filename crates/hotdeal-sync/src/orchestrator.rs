use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hotdeal_adapters::{normalize, AdapterError, AdapterRegistry, RawRecord, SiteAdapter};
use hotdeal_core::{CrawlStatistics, HotDealDraft, SiteId};
use hotdeal_storage::BackoffPolicy;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{PipelineError, UpsertEngine};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlOptions {
    pub max_pages: u32,
    pub page_delay_ms: u64,
    pub detail_delay_ms: u64,
    pub skip_detail: bool,
    /// Bound for the whole run; `None` runs until the last page.
    pub timeout_ms: Option<u64>,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            max_pages: 1,
            page_delay_ms: 2000,
            detail_delay_ms: 1000,
            skip_detail: false,
            timeout_ms: None,
            retry_attempts: 2,
            retry_delay_ms: 1000,
        }
    }
}

impl CrawlOptions {
    fn backoff(&self) -> BackoffPolicy {
        let base = Duration::from_millis(self.retry_delay_ms);
        BackoffPolicy {
            max_retries: self.retry_attempts as usize,
            base_delay: base,
            max_delay: base.saturating_mul(8),
        }
    }
}

/// Per-call overrides of the configured [`CrawlOptions`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlOverrides {
    pub max_pages: Option<u32>,
    pub page_delay_ms: Option<u64>,
    pub detail_delay_ms: Option<u64>,
    pub skip_detail: Option<bool>,
    pub timeout_ms: Option<u64>,
    pub retry_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
}

impl CrawlOverrides {
    pub fn apply(&self, base: &CrawlOptions) -> CrawlOptions {
        CrawlOptions {
            max_pages: self.max_pages.unwrap_or(base.max_pages),
            page_delay_ms: self.page_delay_ms.unwrap_or(base.page_delay_ms),
            detail_delay_ms: self.detail_delay_ms.unwrap_or(base.detail_delay_ms),
            skip_detail: self.skip_detail.unwrap_or(base.skip_detail),
            timeout_ms: self.timeout_ms.or(base.timeout_ms),
            retry_attempts: self.retry_attempts.unwrap_or(base.retry_attempts),
            retry_delay_ms: self.retry_delay_ms.unwrap_or(base.retry_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrawlResult {
    pub source: SiteId,
    pub hotdeals: Vec<HotDealDraft>,
    pub stats: CrawlStatistics,
    pub skipped: usize,
    pub pages_fetched: u32,
    pub timed_out: bool,
    /// Set when no page could be fetched or the run hit its timeout.
    pub error: Option<String>,
}

impl CrawlResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CrawlProgress {
    PageStarted { source: SiteId, page: u32 },
    PageFinished { source: SiteId, page: u32, records: usize },
    PageFailed { source: SiteId, page: u32, error: String },
    UpsertFinished { source: SiteId, saved: usize, updated: usize, errors: usize },
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &CrawlProgress);
}

/// Logs progress events at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressReporter for TracingProgress {
    fn report(&self, event: &CrawlProgress) {
        match event {
            CrawlProgress::PageFailed { source, page, error } => {
                warn!(%source, page, %error, "page failed");
            }
            other => debug!(?other, "crawl progress"),
        }
    }
}

/// Outcome of one source inside a multi-source run.
#[derive(Debug, Clone, Serialize)]
pub struct SourceOutcome {
    pub source: SiteId,
    pub succeeded: bool,
    pub result: Option<CrawlResult>,
    pub error: Option<String>,
}

enum PageFetch {
    Records(Vec<RawRecord>),
    Failed(AdapterError),
    TimedOut,
}

/// Awaits `fut` unless `deadline` passes first.
async fn before_deadline<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, fut).await.ok(),
        None => Some(fut.await),
    }
}

#[derive(Clone)]
pub struct CrawlOrchestrator {
    adapters: Arc<AdapterRegistry>,
    upsert: UpsertEngine,
    progress: Arc<dyn ProgressReporter>,
}

impl CrawlOrchestrator {
    pub fn new(adapters: AdapterRegistry, upsert: UpsertEngine) -> Self {
        Self {
            adapters: Arc::new(adapters),
            upsert,
            progress: Arc::new(TracingProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn sources(&self) -> Vec<SiteId> {
        self.adapters.sites()
    }

    /// Crawls pages `1..=max_pages` of one source in order and upserts the
    /// drafts in one pass. Page failures are counted, not fatal.
    pub async fn crawl(&self, source: SiteId, options: &CrawlOptions) -> Result<CrawlResult, PipelineError> {
        let adapter = self
            .adapters
            .get(source)
            .ok_or_else(|| PipelineError::NotFound(format!("no adapter registered for {source}")))?;
        let span = info_span!("crawl", %source, max_pages = options.max_pages);
        Ok(self.crawl_with(adapter, options).instrument(span).await)
    }

    async fn crawl_with(&self, adapter: Arc<dyn SiteAdapter>, options: &CrawlOptions) -> CrawlResult {
        let source = adapter.site();
        let started = Instant::now();
        let deadline = options
            .timeout_ms
            .map(|ms| started + Duration::from_millis(ms));
        let page_delay = Duration::from_millis(options.page_delay_ms);

        let mut drafts: Vec<HotDealDraft> = Vec::new();
        let mut page_errors = 0usize;
        let mut pages_fetched = 0u32;
        let mut last_error: Option<String> = None;
        let mut timed_out = false;

        for page in 1..=options.max_pages {
            if page > 1
                && !page_delay.is_zero()
                && before_deadline(deadline, tokio::time::sleep(page_delay)).await.is_none()
            {
                timed_out = true;
                break;
            }

            self.progress.report(&CrawlProgress::PageStarted { source, page });
            match self.fetch_page(adapter.as_ref(), page, options, deadline).await {
                PageFetch::Records(records) if records.is_empty() => {
                    pages_fetched += 1;
                    self.progress.report(&CrawlProgress::PageFinished { source, page, records: 0 });
                    debug!(page, "empty page; stopping");
                    break;
                }
                PageFetch::Records(records) => {
                    pages_fetched += 1;
                    let crawled_at = Utc::now();
                    let mut page_drafts: Vec<_> = records
                        .iter()
                        .map(|record| normalize(source, record, crawled_at))
                        .collect();
                    if !options.skip_detail
                        && !self
                            .fill_details(adapter.as_ref(), &mut page_drafts, options, deadline)
                            .await
                    {
                        timed_out = true;
                    }
                    self.progress.report(&CrawlProgress::PageFinished {
                        source,
                        page,
                        records: page_drafts.len(),
                    });
                    drafts.extend(page_drafts);
                    if timed_out {
                        break;
                    }
                }
                PageFetch::Failed(err) => {
                    page_errors += 1;
                    self.progress.report(&CrawlProgress::PageFailed {
                        source,
                        page,
                        error: err.to_string(),
                    });
                    last_error = Some(err.to_string());
                }
                PageFetch::TimedOut => {
                    timed_out = true;
                    break;
                }
            }
        }

        let total_crawled = drafts.len();
        let upsert = self.upsert.upsert(drafts.clone()).await;
        self.progress.report(&CrawlProgress::UpsertFinished {
            source,
            saved: upsert.saved,
            updated: upsert.updated,
            errors: upsert.errors,
        });

        let error = if timed_out {
            Some(format!(
                "crawl timed out after {} ms; {pages_fetched} page(s) kept",
                options.timeout_ms.unwrap_or_default()
            ))
        } else if pages_fetched == 0 && options.max_pages > 0 {
            Some(format!(
                "no page could be fetched: {}",
                last_error.as_deref().unwrap_or("unknown error")
            ))
        } else {
            None
        };

        let stats = CrawlStatistics {
            total_crawled,
            new_deals: upsert.saved,
            updated_deals: upsert.updated,
            errors: page_errors + upsert.errors,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            total = stats.total_crawled,
            new = stats.new_deals,
            updated = stats.updated_deals,
            errors = stats.errors,
            duration_ms = stats.duration_ms,
            "crawl finished"
        );

        CrawlResult {
            source,
            hotdeals: drafts,
            stats,
            skipped: upsert.skipped,
            pages_fetched,
            timed_out,
            error,
        }
    }

    async fn fetch_page(
        &self,
        adapter: &dyn SiteAdapter,
        page: u32,
        options: &CrawlOptions,
        deadline: Option<Instant>,
    ) -> PageFetch {
        let backoff = options.backoff();
        let mut attempt = 0usize;
        loop {
            let Some(result) = before_deadline(deadline, adapter.fetch_page(page)).await else {
                return PageFetch::TimedOut;
            };
            match result {
                Ok(records) => return PageFetch::Records(records),
                Err(err) if err.is_transient() && attempt < backoff.max_retries => {
                    let delay = backoff.delay_for_attempt(attempt);
                    debug!(page, attempt, error = %err, ?delay, "retrying page");
                    if before_deadline(deadline, tokio::time::sleep(delay)).await.is_none() {
                        return PageFetch::TimedOut;
                    }
                    attempt += 1;
                }
                Err(err) => return PageFetch::Failed(err),
            }
        }
    }

    /// Returns `false` when the deadline passed before every detail was read.
    async fn fill_details(
        &self,
        adapter: &dyn SiteAdapter,
        drafts: &mut [HotDealDraft],
        options: &CrawlOptions,
        deadline: Option<Instant>,
    ) -> bool {
        let delay = Duration::from_millis(options.detail_delay_ms);
        for (i, draft) in drafts.iter_mut().enumerate() {
            if i > 0
                && !delay.is_zero()
                && before_deadline(deadline, tokio::time::sleep(delay)).await.is_none()
            {
                return false;
            }
            let Some(result) = before_deadline(deadline, adapter.fetch_detail(&draft.original_url)).await
            else {
                return false;
            };
            match result {
                Ok(detail) => {
                    if detail.description.is_some() {
                        draft.description = detail.description;
                    }
                    if draft.image_url.is_none() {
                        draft.image_url = detail.image_url;
                    }
                }
                Err(err) => {
                    debug!(post_id = %draft.source_post_id, error = %err, "detail fetch failed");
                }
            }
        }
        true
    }

    /// Crawls several sources. Concurrent mode runs one task per source and
    /// waits for all of them; one failing source never cancels the rest.
    pub async fn crawl_many(
        &self,
        sources: &[SiteId],
        options: &CrawlOptions,
        concurrent: bool,
    ) -> Vec<SourceOutcome> {
        if !concurrent {
            let mut outcomes = Vec::with_capacity(sources.len());
            for source in sources {
                outcomes.push(outcome(*source, self.crawl(*source, options).await));
            }
            return outcomes;
        }

        let handles: Vec<_> = sources
            .iter()
            .map(|source| {
                let this = self.clone();
                let options = options.clone();
                let source = *source;
                (
                    source,
                    tokio::spawn(async move { this.crawl(source, &options).await }),
                )
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (source, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(PipelineError::Storage(format!("crawl task failed: {join_err}"))),
            };
            outcomes.push(outcome(source, result));
        }
        outcomes
    }
}

fn outcome(source: SiteId, result: Result<CrawlResult, PipelineError>) -> SourceOutcome {
    match result {
        Ok(result) => SourceOutcome {
            source,
            succeeded: result.is_success(),
            error: result.error.clone(),
            result: Some(result),
        },
        Err(err) => SourceOutcome {
            source,
            succeeded: false,
            result: None,
            error: Some(err.to_string()),
        },
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use hotdeal_adapters::{BoardPost, DetailRecord};
    use hotdeal_core::HotDeal;
    use hotdeal_storage::{HotDealStore, MemoryHotDealStore};
    use uuid::Uuid;

    pub(crate) fn board_record(no: u32) -> RawRecord {
        RawRecord::Board(BoardPost {
            post_number: Some(no.to_string()),
            title: format!("[쿠팡] 테스트 상품 {no} (10,000원)"),
            url: format!("https://www.ppomppu.co.kr/zboard/view.php?id=ppomppu&no={no}"),
            views: u64::from(no),
            ..Default::default()
        })
    }

    /// Scripted adapter: each page either returns records or an error.
    pub(crate) struct ScriptedAdapter {
        pub site: SiteId,
        pub pages: HashMap<u32, Result<Vec<RawRecord>, AdapterError>>,
        pub page_latency: Duration,
        pub calls: AtomicUsize,
        pub details: HashMap<String, DetailRecord>,
    }

    impl ScriptedAdapter {
        pub(crate) fn new(site: SiteId) -> Self {
            Self {
                site,
                pages: HashMap::new(),
                page_latency: Duration::ZERO,
                calls: AtomicUsize::new(0),
                details: HashMap::new(),
            }
        }

        pub(crate) fn page(mut self, n: u32, result: Result<Vec<RawRecord>, AdapterError>) -> Self {
            self.pages.insert(n, result);
            self
        }
    }

    #[async_trait]
    impl SiteAdapter for ScriptedAdapter {
        fn site(&self) -> SiteId {
            self.site
        }

        async fn fetch_page(&self, page: u32) -> Result<Vec<RawRecord>, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.page_latency.is_zero() {
                tokio::time::sleep(self.page_latency).await;
            }
            self.pages.get(&page).cloned().unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn fetch_detail(&self, link: &str) -> Result<DetailRecord, AdapterError> {
            self.details
                .get(link)
                .cloned()
                .ok_or_else(|| AdapterError::Network("detail unavailable".into()))
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<CrawlProgress>>);

    impl ProgressReporter for Recorder {
        fn report(&self, event: &CrawlProgress) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn fast_options(max_pages: u32) -> CrawlOptions {
        CrawlOptions {
            max_pages,
            page_delay_ms: 0,
            detail_delay_ms: 0,
            skip_detail: true,
            timeout_ms: None,
            retry_attempts: 0,
            retry_delay_ms: 0,
        }
    }

    pub(crate) fn orchestrator_with(
        adapter: ScriptedAdapter,
        store: Arc<MemoryHotDealStore>,
    ) -> CrawlOrchestrator {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(adapter));
        CrawlOrchestrator::new(registry, UpsertEngine::new(store))
    }

    #[tokio::test]
    async fn network_failure_on_second_page_keeps_first_page() {
        let store = Arc::new(MemoryHotDealStore::new());
        for no in [1, 2] {
            let draft = normalize(SiteId::Ppomppu, &board_record(no), Utc::now());
            store
                .insert(HotDeal::from_draft(Uuid::new_v4(), draft, Utc::now()))
                .await
                .unwrap();
        }
        let adapter = ScriptedAdapter::new(SiteId::Ppomppu)
            .page(1, Ok((1..=10).map(board_record).collect()))
            .page(2, Err(AdapterError::Network("connection reset".into())));
        let recorder = Arc::new(Recorder::default());
        let orchestrator = orchestrator_with(adapter, store.clone()).with_progress(recorder.clone());

        let result = orchestrator.crawl(SiteId::Ppomppu, &fast_options(2)).await.unwrap();

        assert_eq!(result.stats.total_crawled, 10);
        assert_eq!(result.stats.new_deals, 8);
        assert_eq!(result.stats.updated_deals, 2);
        assert_eq!(result.stats.errors, 1);
        assert!(result.error.is_none());
        assert_eq!(store.len().await, 10);

        let events = recorder.0.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, CrawlProgress::PageFailed { page: 2, .. })));
    }

    #[tokio::test]
    async fn same_page_twice_is_idempotent() {
        let store = Arc::new(MemoryHotDealStore::new());
        let adapter = ScriptedAdapter::new(SiteId::Ppomppu).page(1, Ok((1..=4).map(board_record).collect()));
        let orchestrator = orchestrator_with(adapter, store.clone());

        let first = orchestrator.crawl(SiteId::Ppomppu, &fast_options(1)).await.unwrap();
        let second = orchestrator.crawl(SiteId::Ppomppu, &fast_options(1)).await.unwrap();
        assert_eq!(first.stats.new_deals, 4);
        assert_eq!((second.stats.new_deals, second.stats.updated_deals), (0, 4));
        assert_eq!(store.len().await, 4);
    }

    #[tokio::test]
    async fn unreachable_source_sets_result_error() {
        let store = Arc::new(MemoryHotDealStore::new());
        let adapter = ScriptedAdapter::new(SiteId::Clien)
            .page(1, Err(AdapterError::Network("down".into())))
            .page(2, Err(AdapterError::Network("down".into())));
        let orchestrator = orchestrator_with(adapter, store);

        let result = orchestrator.crawl(SiteId::Clien, &fast_options(2)).await.unwrap();
        assert_eq!(result.stats.errors, 2);
        assert!(result.error.as_deref().unwrap().contains("no page could be fetched"));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_but_parse_errors_are_not() {
        let store = Arc::new(MemoryHotDealStore::new());
        let adapter = ScriptedAdapter::new(SiteId::Ruliweb)
            .page(1, Err(AdapterError::RateLimited("429".into())))
            .page(2, Err(AdapterError::Parse("bad markup".into())))
            .page(3, Ok(vec![board_record(1)]));
        let mut registry = AdapterRegistry::new();
        let adapter = Arc::new(adapter);
        registry.register(adapter.clone());
        let orchestrator = CrawlOrchestrator::new(registry, UpsertEngine::new(store));

        let options = CrawlOptions {
            retry_attempts: 2,
            retry_delay_ms: 1,
            ..fast_options(3)
        };
        let result = orchestrator.crawl(SiteId::Ruliweb, &options).await.unwrap();
        // page 1: 1 + 2 retries, page 2: 1, page 3: 1
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 5);
        assert_eq!(result.stats.errors, 2);
        assert_eq!(result.stats.total_crawled, 1);
    }

    #[tokio::test]
    async fn timeout_keeps_completed_pages() {
        let store = Arc::new(MemoryHotDealStore::new());
        let mut adapter = ScriptedAdapter::new(SiteId::Eomisae)
            .page(1, Ok(vec![board_record(1), board_record(2)]))
            .page(2, Ok(vec![board_record(3)]));
        adapter.page_latency = Duration::from_millis(40);
        let orchestrator = orchestrator_with(adapter, store.clone());

        let options = CrawlOptions {
            page_delay_ms: 200,
            timeout_ms: Some(120),
            ..fast_options(2)
        };
        let result = orchestrator.crawl(SiteId::Eomisae, &options).await.unwrap();
        assert!(result.timed_out);
        assert!(result.error.is_some());
        assert_eq!(result.stats.new_deals, 2);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn detail_pages_fill_description_and_failures_are_ignored() {
        let store = Arc::new(MemoryHotDealStore::new());
        let mut adapter = ScriptedAdapter::new(SiteId::Ppomppu)
            .page(1, Ok(vec![board_record(1), board_record(2)]));
        adapter.details.insert(
            "https://www.ppomppu.co.kr/zboard/view.php?id=ppomppu&no=1".into(),
            DetailRecord {
                description: Some("본문".into()),
                image_url: None,
            },
        );
        let orchestrator = orchestrator_with(adapter, store.clone());

        let options = CrawlOptions {
            skip_detail: false,
            ..fast_options(1)
        };
        let result = orchestrator.crawl(SiteId::Ppomppu, &options).await.unwrap();
        assert_eq!(result.stats.errors, 0);
        assert_eq!(result.hotdeals[0].description.as_deref(), Some("본문"));
        assert!(result.hotdeals[1].description.is_none());
    }

    #[tokio::test]
    async fn concurrent_sources_settle_independently() {
        let store = Arc::new(MemoryHotDealStore::new());
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(
            ScriptedAdapter::new(SiteId::Ppomppu).page(1, Ok(vec![board_record(1)])),
        ));
        registry.register(Arc::new(
            ScriptedAdapter::new(SiteId::Clien).page(1, Err(AdapterError::Network("down".into()))),
        ));
        let orchestrator = CrawlOrchestrator::new(registry, UpsertEngine::new(store.clone()));

        let outcomes = orchestrator
            .crawl_many(
                &[SiteId::Ppomppu, SiteId::Clien, SiteId::Itcm],
                &fast_options(1),
                true,
            )
            .await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].succeeded);
        assert!(!outcomes[1].succeeded);
        assert!(!outcomes[2].succeeded);
        assert!(outcomes[2].result.is_none());
        assert_eq!(store.len().await, 1);
    }

    #[test]
    fn overrides_replace_only_given_fields() {
        let base = CrawlOptions::default();
        let merged = CrawlOverrides {
            max_pages: Some(5),
            skip_detail: Some(true),
            ..Default::default()
        }
        .apply(&base);
        assert_eq!(merged.max_pages, 5);
        assert!(merged.skip_detail);
        assert_eq!(merged.page_delay_ms, base.page_delay_ms);
    }
}
