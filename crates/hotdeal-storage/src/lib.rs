//! Persistence contracts and backends for deals, translations and crawl jobs,
//! plus the HTTP client used by outbound integrations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hotdeal_core::{CrawlJob, DealStatus, HotDeal, HotDealPatch, Language, SiteId, Translation};
use thiserror::Error;
use uuid::Uuid;

mod http;
mod jobs;
mod locks;
mod memory;
mod postgres;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, HttpClientConfig,
    HttpFetcher, RetryDisposition,
};
pub use jobs::{FileJobStore, MemoryJobStore};
pub use locks::{KeyGuard, KeyedLocks};
pub use memory::{MemoryHotDealStore, MemoryTranslationStore};
pub use postgres::{connect_and_migrate, PgHotDealStore, PgTranslationStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("identity already stored: {0}")]
    Conflict(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Durable storage of deals keyed by `(source, source_post_id)`.
#[async_trait]
pub trait HotDealStore: Send + Sync {
    async fn find_by_identity(
        &self,
        source: SiteId,
        source_post_id: &str,
    ) -> Result<Option<HotDeal>, StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<HotDeal>, StoreError>;

    /// Fails with [`StoreError::Conflict`] when the identity is already stored.
    async fn insert(&self, deal: HotDeal) -> Result<HotDeal, StoreError>;

    async fn update(&self, id: Uuid, patch: HotDealPatch) -> Result<HotDeal, StoreError>;

    /// One page of active deals in id order, strictly after the `after` cursor.
    async fn scan_active(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<HotDeal>, StoreError>;

    /// Active deals with `from <= end_date <= to`, soonest first, at most `limit`.
    async fn find_active_expiring(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<HotDeal>, StoreError>;

    async fn count_active_expiring(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Ended deals last written at or after `since`.
    async fn count_ended_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn update_status(&self, id: Uuid, status: DealStatus) -> Result<(), StoreError>;

    async fn count_by_status(&self, status: DealStatus) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait TranslationStore: Send + Sync {
    async fn get(&self, hot_deal_id: Uuid, language: Language) -> Result<Option<Translation>, StoreError>;

    async fn list_for_deal(&self, hot_deal_id: Uuid) -> Result<Vec<Translation>, StoreError>;

    /// Insert or replace the entry for `(hot_deal_id, language)`.
    async fn put(&self, translation: Translation) -> Result<Translation, StoreError>;
}

/// Key-value registry of crawl jobs keyed by job id.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<CrawlJob>, StoreError>;

    async fn put(&self, job: &CrawlJob) -> Result<(), StoreError>;

    /// Returns whether a job was removed.
    async fn delete(&self, job_id: &str) -> Result<bool, StoreError>;
}
