use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hotdeal_core::{DealStatus, HotDeal, HotDealPatch, Language, SiteId, Translation};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{HotDealStore, StoreError, TranslationStore};

#[derive(Debug, Default)]
struct DealTable {
    rows: HashMap<Uuid, HotDeal>,
    identity: HashMap<(SiteId, String), Uuid>,
}

/// Process-local deal store with a unique `(source, source_post_id)` index.
#[derive(Debug, Default)]
pub struct MemoryHotDealStore {
    table: RwLock<DealTable>,
}

impl MemoryHotDealStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn all(&self) -> Vec<HotDeal> {
        let table = self.table.read().await;
        let mut rows: Vec<_> = table.rows.values().cloned().collect();
        rows.sort_by(|a, b| (a.source, &a.source_post_id).cmp(&(b.source, &b.source_post_id)));
        rows
    }
}

#[async_trait]
impl HotDealStore for MemoryHotDealStore {
    async fn find_by_identity(
        &self,
        source: SiteId,
        source_post_id: &str,
    ) -> Result<Option<HotDeal>, StoreError> {
        let table = self.table.read().await;
        Ok(table
            .identity
            .get(&(source, source_post_id.to_string()))
            .and_then(|id| table.rows.get(id))
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<HotDeal>, StoreError> {
        Ok(self.table.read().await.rows.get(&id).cloned())
    }

    async fn insert(&self, deal: HotDeal) -> Result<HotDeal, StoreError> {
        let mut table = self.table.write().await;
        let key = (deal.source, deal.source_post_id.clone());
        if table.identity.contains_key(&key) {
            return Err(StoreError::Conflict(format!("{}:{}", key.0, key.1)));
        }
        if table.rows.contains_key(&deal.id) {
            return Err(StoreError::Conflict(deal.id.to_string()));
        }
        table.identity.insert(key, deal.id);
        table.rows.insert(deal.id, deal.clone());
        Ok(deal)
    }

    async fn update(&self, id: Uuid, patch: HotDealPatch) -> Result<HotDeal, StoreError> {
        let mut table = self.table.write().await;
        let row = table
            .rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        patch.apply_to(row, Utc::now());
        Ok(row.clone())
    }

    async fn scan_active(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<HotDeal>, StoreError> {
        let table = self.table.read().await;
        let mut rows: Vec<_> = table
            .rows
            .values()
            .filter(|d| d.status == DealStatus::Active)
            .filter(|d| after.map_or(true, |cursor| d.id > cursor))
            .cloned()
            .collect();
        rows.sort_by_key(|d| d.id);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn find_active_expiring(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<HotDeal>, StoreError> {
        let table = self.table.read().await;
        let mut rows: Vec<_> = table
            .rows
            .values()
            .filter(|d| d.status == DealStatus::Active)
            .filter(|d| d.end_date.is_some_and(|end| from <= end && end <= to))
            .cloned()
            .collect();
        rows.sort_by_key(|d| (d.end_date, d.id));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn count_active_expiring(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<u64, StoreError> {
        let table = self.table.read().await;
        Ok(table
            .rows
            .values()
            .filter(|d| d.status == DealStatus::Active)
            .filter(|d| d.end_date.is_some_and(|end| from <= end && end <= to))
            .count() as u64)
    }

    async fn count_ended_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError> {
        let table = self.table.read().await;
        Ok(table
            .rows
            .values()
            .filter(|d| d.status == DealStatus::Ended && d.updated_at >= since)
            .count() as u64)
    }

    async fn update_status(&self, id: Uuid, status: DealStatus) -> Result<(), StoreError> {
        let mut table = self.table.write().await;
        let row = table
            .rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        row.status = status;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn count_by_status(&self, status: DealStatus) -> Result<u64, StoreError> {
        let table = self.table.read().await;
        Ok(table.rows.values().filter(|d| d.status == status).count() as u64)
    }
}

#[derive(Debug, Default)]
pub struct MemoryTranslationStore {
    rows: RwLock<HashMap<(Uuid, Language), Translation>>,
}

impl MemoryTranslationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TranslationStore for MemoryTranslationStore {
    async fn get(&self, hot_deal_id: Uuid, language: Language) -> Result<Option<Translation>, StoreError> {
        Ok(self.rows.read().await.get(&(hot_deal_id, language)).cloned())
    }

    async fn list_for_deal(&self, hot_deal_id: Uuid) -> Result<Vec<Translation>, StoreError> {
        let rows = self.rows.read().await;
        let mut out: Vec<_> = rows
            .values()
            .filter(|t| t.hot_deal_id == hot_deal_id)
            .cloned()
            .collect();
        out.sort_by_key(|t| t.language);
        Ok(out)
    }

    async fn put(&self, translation: Translation) -> Result<Translation, StoreError> {
        self.rows
            .write()
            .await
            .insert((translation.hot_deal_id, translation.language), translation.clone());
        Ok(translation)
    }
}
