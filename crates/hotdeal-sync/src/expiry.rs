use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use hotdeal_core::{DealStatus, HotDeal, HotDealPatch};
use hotdeal_storage::{HotDealStore, KeyedLocks};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::PipelineError;

const EXPIRING_SOON_LIMIT_MAX: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpiryConfig {
    pub dry_run: bool,
    pub batch_size: usize,
    pub warning_hours: i64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            batch_size: 500,
            warning_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExpiryReport {
    pub total_checked: usize,
    pub expired: usize,
    pub expiring_soon: usize,
    pub errors: usize,
    pub processing_time_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExpiryStatistics {
    pub active: u64,
    pub ended: u64,
    pub expiring_soon: u64,
    pub expired_today: u64,
}

/// Midnight of the current Korean calendar day.
fn start_of_day_kst(now: DateTime<Utc>) -> DateTime<Utc> {
    let Some(kst) = FixedOffset::east_opt(9 * 3600) else {
        return now;
    };
    now.with_timezone(&kst)
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| midnight.and_local_timezone(kst).single())
        .map(|midnight| midnight.with_timezone(&Utc))
        .unwrap_or(now)
}

/// Moves active deals past their end date to `ended`.
#[derive(Clone)]
pub struct ExpiryEngine {
    store: Arc<dyn HotDealStore>,
    locks: Arc<KeyedLocks<Uuid>>,
}

impl ExpiryEngine {
    pub fn new(store: Arc<dyn HotDealStore>) -> Self {
        Self {
            store,
            locks: Arc::new(KeyedLocks::new()),
        }
    }

    pub async fn process_expired_deals(&self, config: &ExpiryConfig) -> Result<ExpiryReport, PipelineError> {
        self.process_at(Utc::now(), config).await
    }

    /// Walks the active set one page of `batch_size` rows at a time.
    pub async fn process_at(&self, now: DateTime<Utc>, config: &ExpiryConfig) -> Result<ExpiryReport, PipelineError> {
        let started = Instant::now();
        let horizon = now + Duration::hours(config.warning_hours.max(0));
        let page_size = config.batch_size.max(1);
        let mut report = ExpiryReport::default();
        let mut cursor = None;

        for batch in 0usize.. {
            let page = self.store.scan_active(cursor, page_size).await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(last.id);
            report.total_checked += page.len();
            debug!(batch, size = page.len(), dry_run = config.dry_run, "expiry batch");

            for deal in &page {
                let Some(end) = deal.end_date else {
                    continue;
                };
                if end > now {
                    if end <= horizon {
                        report.expiring_soon += 1;
                    }
                    continue;
                }
                if config.dry_run {
                    report.expired += 1;
                    continue;
                }
                match self.expire_one(deal.id, now).await {
                    Ok(true) => report.expired += 1,
                    Ok(false) => {}
                    Err(err) => {
                        warn!(deal_id = %deal.id, error = %err, "could not end deal");
                        report.errors += 1;
                    }
                }
            }

            if page.len() < page_size {
                break;
            }
        }

        report.processing_time_ms = started.elapsed().as_millis() as u64;
        info!(
            checked = report.total_checked,
            expired = report.expired,
            expiring_soon = report.expiring_soon,
            errors = report.errors,
            dry_run = config.dry_run,
            "expiry run finished"
        );
        Ok(report)
    }

    /// Re-reads the deal under its lock; a deal extended meanwhile is left alone.
    async fn expire_one(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, PipelineError> {
        let _guard = self.locks.lock(id).await;
        let Some(current) = self.store.find_by_id(id).await? else {
            return Ok(false);
        };
        let due = current.status == DealStatus::Active && current.end_date.is_some_and(|end| end <= now);
        if !due {
            return Ok(false);
        }
        self.store.update_status(id, DealStatus::Ended).await?;
        Ok(true)
    }

    pub async fn statistics(&self, now: DateTime<Utc>) -> Result<ExpiryStatistics, PipelineError> {
        let active = self.store.count_by_status(DealStatus::Active).await?;
        let ended = self.store.count_by_status(DealStatus::Ended).await?;
        let expiring_soon = self
            .store
            .count_active_expiring(now, now + Duration::hours(24))
            .await?;
        let expired_today = self.store.count_ended_since(start_of_day_kst(now)).await?;
        Ok(ExpiryStatistics {
            active,
            ended,
            expiring_soon,
            expired_today,
        })
    }

    /// Active deals ending within `hours`, soonest first.
    pub async fn expiring_soon(
        &self,
        now: DateTime<Utc>,
        hours: i64,
        limit: usize,
    ) -> Result<Vec<HotDeal>, PipelineError> {
        if hours <= 0 {
            return Err(PipelineError::Validation("hours must be positive".into()));
        }
        let limit = limit.clamp(1, EXPIRING_SOON_LIMIT_MAX);
        Ok(self
            .store
            .find_active_expiring(now, now + Duration::hours(hours), limit)
            .await?)
    }

    pub async fn extend_expiry(&self, id: Uuid, hours: i64) -> Result<HotDeal, PipelineError> {
        if hours <= 0 {
            return Err(PipelineError::Validation("hours must be positive".into()));
        }
        let _guard = self.locks.lock(id).await;
        let deal = self.require(id).await?;
        let base = deal.end_date.unwrap_or_else(Utc::now);
        self.reopen(id, base + Duration::hours(hours)).await
    }

    pub async fn reactivate(&self, id: Uuid, hours: i64) -> Result<HotDeal, PipelineError> {
        if hours <= 0 {
            return Err(PipelineError::Validation("hours must be positive".into()));
        }
        let _guard = self.locks.lock(id).await;
        let deal = self.require(id).await?;
        if deal.status != DealStatus::Ended {
            return Err(PipelineError::Validation(format!(
                "deal {id} is {}, only ended deals can be reactivated",
                deal.status.as_str()
            )));
        }
        self.reopen(id, Utc::now() + Duration::hours(hours)).await
    }

    async fn require(&self, id: Uuid) -> Result<HotDeal, PipelineError> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("hot deal {id}")))
    }

    async fn reopen(&self, id: Uuid, end_date: DateTime<Utc>) -> Result<HotDeal, PipelineError> {
        let patch = HotDealPatch {
            status: Some(DealStatus::Active),
            end_date: Some(end_date),
            ..HotDealPatch::default()
        };
        Ok(self.store.update(id, patch).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use hotdeal_core::{Category, HotDealDraft, IdentityMode, SiteId};
    use hotdeal_storage::{MemoryHotDealStore, StoreError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).single().unwrap()
    }

    fn deal(post_id: &str, end_date: Option<DateTime<Utc>>) -> HotDeal {
        let draft = HotDealDraft {
            source: SiteId::Quasarzone,
            source_post_id: post_id.to_string(),
            identity_mode: IdentityMode::SourceId,
            title: format!("특가 {post_id}"),
            description: None,
            price: 1000,
            original_price: None,
            discount_rate: None,
            category: Category::Electronics,
            image_url: None,
            original_url: format!("https://quasarzone.com/bbs/qb_saleinfo/views/{post_id}"),
            seller: "11번가".into(),
            crawled_at: now() - Duration::days(3),
            ended: false,
            end_date,
            view_count: 0,
            like_count: 0,
            comment_count: 0,
        };
        HotDeal::from_draft(Uuid::new_v4(), draft, now() - Duration::days(3))
    }

    async fn seeded() -> (Arc<MemoryHotDealStore>, Vec<Uuid>) {
        let store = Arc::new(MemoryHotDealStore::new());
        let rows = [
            deal("1", Some(now() - Duration::hours(2))),
            deal("2", Some(now() - Duration::minutes(1))),
            deal("3", Some(now() + Duration::hours(5))),
            deal("4", Some(now() + Duration::days(3))),
            deal("5", None),
        ];
        let mut ids = Vec::new();
        for row in rows {
            ids.push(store.insert(row).await.unwrap().id);
        }
        (store, ids)
    }

    #[tokio::test]
    async fn expires_due_deals_and_counts_soon_ones() {
        let (store, ids) = seeded().await;
        let engine = ExpiryEngine::new(store.clone());

        let report = engine.process_at(now(), &ExpiryConfig::default()).await.unwrap();
        assert_eq!(report.total_checked, 5);
        assert_eq!(report.expired, 2);
        assert_eq!(report.expiring_soon, 1);
        assert_eq!(report.errors, 0);

        let ended = store.find_by_id(ids[0]).await.unwrap().unwrap();
        assert_eq!(ended.status, DealStatus::Ended);
        let soon = store.find_by_id(ids[2]).await.unwrap().unwrap();
        assert_eq!(soon.status, DealStatus::Active);

        let again = engine.process_at(now(), &ExpiryConfig::default()).await.unwrap();
        assert_eq!(again.expired, 0);
        assert_eq!(again.total_checked, 3);
    }

    #[tokio::test]
    async fn dry_run_counts_without_writing() {
        let (store, _) = seeded().await;
        let engine = ExpiryEngine::new(store.clone());
        let config = ExpiryConfig {
            dry_run: true,
            batch_size: 1,
            ..ExpiryConfig::default()
        };

        let report = engine.process_at(now(), &config).await.unwrap();
        assert_eq!(report.expired, 2);
        assert_eq!(report.total_checked, 5);
        assert_eq!(store.count_by_status(DealStatus::Ended).await.unwrap(), 0);
    }

    /// Records scan sizes and fails status writes for one id.
    struct RecordingStore {
        inner: MemoryHotDealStore,
        broken: Option<Uuid>,
        scans: AtomicUsize,
        largest_scan: AtomicUsize,
    }

    impl RecordingStore {
        fn new(inner: MemoryHotDealStore, broken: Option<Uuid>) -> Self {
            Self {
                inner,
                broken,
                scans: AtomicUsize::new(0),
                largest_scan: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl HotDealStore for RecordingStore {
        async fn find_by_identity(&self, source: SiteId, id: &str) -> Result<Option<HotDeal>, StoreError> {
            self.inner.find_by_identity(source, id).await
        }
        async fn find_by_id(&self, id: Uuid) -> Result<Option<HotDeal>, StoreError> {
            self.inner.find_by_id(id).await
        }
        async fn insert(&self, deal: HotDeal) -> Result<HotDeal, StoreError> {
            self.inner.insert(deal).await
        }
        async fn update(&self, id: Uuid, patch: HotDealPatch) -> Result<HotDeal, StoreError> {
            self.inner.update(id, patch).await
        }
        async fn scan_active(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<HotDeal>, StoreError> {
            let page = self.inner.scan_active(after, limit).await?;
            self.scans.fetch_add(1, Ordering::SeqCst);
            self.largest_scan.fetch_max(page.len(), Ordering::SeqCst);
            Ok(page)
        }
        async fn find_active_expiring(
            &self,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<HotDeal>, StoreError> {
            self.inner.find_active_expiring(from, to, limit).await
        }
        async fn count_active_expiring(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<u64, StoreError> {
            self.inner.count_active_expiring(from, to).await
        }
        async fn count_ended_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError> {
            self.inner.count_ended_since(since).await
        }
        async fn update_status(&self, id: Uuid, status: DealStatus) -> Result<(), StoreError> {
            if self.broken == Some(id) {
                return Err(StoreError::Corrupt("write rejected".into()));
            }
            self.inner.update_status(id, status).await
        }
        async fn count_by_status(&self, status: DealStatus) -> Result<u64, StoreError> {
            self.inner.count_by_status(status).await
        }
    }

    #[tokio::test]
    async fn each_read_is_bounded_by_batch_size() {
        let inner = MemoryHotDealStore::new();
        for n in 0..10 {
            inner
                .insert(deal(&n.to_string(), Some(now() - Duration::hours(1))))
                .await
                .unwrap();
        }
        let store = Arc::new(RecordingStore::new(inner, None));
        let engine = ExpiryEngine::new(store.clone());
        let config = ExpiryConfig {
            batch_size: 2,
            ..ExpiryConfig::default()
        };

        let report = engine.process_at(now(), &config).await.unwrap();
        assert_eq!((report.total_checked, report.expired), (10, 10));
        assert_eq!(store.largest_scan.load(Ordering::SeqCst), 2);
        assert_eq!(store.scans.load(Ordering::SeqCst), 6);
        assert_eq!(store.count_by_status(DealStatus::Active).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn one_failed_write_does_not_stop_the_batch() {
        let inner = MemoryHotDealStore::new();
        let first = inner.insert(deal("1", Some(now() - Duration::hours(1)))).await.unwrap();
        inner.insert(deal("2", Some(now() - Duration::hours(1)))).await.unwrap();
        let store = Arc::new(RecordingStore::new(inner, Some(first.id)));
        let engine = ExpiryEngine::new(store.clone());

        let report = engine.process_at(now(), &ExpiryConfig::default()).await.unwrap();
        assert_eq!((report.expired, report.errors), (1, 1));
    }

    #[tokio::test]
    async fn reactivate_and_extend() {
        let (store, ids) = seeded().await;
        let engine = ExpiryEngine::new(store.clone());
        engine.process_at(now(), &ExpiryConfig::default()).await.unwrap();

        let err = engine.reactivate(ids[2], 24).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));

        let revived = engine.reactivate(ids[0], 48).await.unwrap();
        assert_eq!(revived.status, DealStatus::Active);
        assert!(revived.end_date.unwrap() > Utc::now() + Duration::hours(47));

        let before = store.find_by_id(ids[3]).await.unwrap().unwrap().end_date.unwrap();
        let extended = engine.extend_expiry(ids[3], 12).await.unwrap();
        assert_eq!(extended.end_date.unwrap(), before + Duration::hours(12));

        let missing = engine.extend_expiry(Uuid::new_v4(), 1).await.unwrap_err();
        assert!(matches!(missing, PipelineError::NotFound(_)));
    }

    #[tokio::test]
    async fn statistics_split_active_and_ended() {
        let (store, _) = seeded().await;
        let engine = ExpiryEngine::new(store);
        engine.process_at(now(), &ExpiryConfig::default()).await.unwrap();

        let stats = engine.statistics(now()).await.unwrap();
        assert_eq!(stats.active, 3);
        assert_eq!(stats.ended, 2);
        assert_eq!(stats.expiring_soon, 1);

        let today = engine.statistics(Utc::now()).await.unwrap();
        assert_eq!(today.expired_today, 2);
        let later = engine.statistics(Utc::now() + Duration::days(2)).await.unwrap();
        assert_eq!(later.expired_today, 0);
    }

    #[tokio::test]
    async fn expiring_soon_lists_upcoming_deals_first() {
        let (store, ids) = seeded().await;
        let engine = ExpiryEngine::new(store);

        let day: Vec<_> = engine.expiring_soon(now(), 24, 50).await.unwrap().iter().map(|d| d.id).collect();
        assert_eq!(day, vec![ids[2]]);

        let week: Vec<_> = engine.expiring_soon(now(), 168, 50).await.unwrap().iter().map(|d| d.id).collect();
        assert_eq!(week, vec![ids[2], ids[3]]);

        assert_eq!(engine.expiring_soon(now(), 168, 1).await.unwrap().len(), 1);
        let err = engine.expiring_soon(now(), 0, 50).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }
}
