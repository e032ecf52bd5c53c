use std::sync::Arc;

use chrono::Utc;
use hotdeal_core::{DealStatus, HotDeal, HotDealDraft, HotDealPatch, SiteId};
use hotdeal_storage::{HotDealStore, KeyedLocks, StoreError};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertStats {
    pub saved: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
}

enum Outcome {
    Saved,
    Updated,
}

/// Inserts unseen drafts and refreshes the mutable counters of known ones.
/// Writes to one `(source, source_post_id)` never interleave.
#[derive(Clone)]
pub struct UpsertEngine {
    store: Arc<dyn HotDealStore>,
    locks: Arc<KeyedLocks<(SiteId, String)>>,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn HotDealStore>) -> Self {
        Self {
            store,
            locks: Arc::new(KeyedLocks::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn HotDealStore> {
        &self.store
    }

    pub async fn upsert(&self, drafts: Vec<HotDealDraft>) -> UpsertStats {
        let mut stats = UpsertStats::default();
        for draft in drafts {
            if let Err(reason) = validate(&draft) {
                warn!(source = %draft.source, post_id = %draft.source_post_id, reason, "skipping invalid draft");
                stats.skipped += 1;
                continue;
            }
            match self.upsert_one(draft).await {
                Ok(Outcome::Saved) => stats.saved += 1,
                Ok(Outcome::Updated) => stats.updated += 1,
                Err((key, err)) => {
                    warn!(identity = %key, error = %err, "upsert failed");
                    stats.errors += 1;
                }
            }
        }
        debug!(?stats, "upsert batch finished");
        stats
    }

    async fn upsert_one(&self, draft: HotDealDraft) -> Result<Outcome, (String, StoreError)> {
        let key = (draft.source, draft.source_post_id.clone());
        let label = format!("{}:{}", key.0, key.1);
        let _guard = self.locks.lock(key).await;

        let existing = self
            .store
            .find_by_identity(draft.source, &draft.source_post_id)
            .await
            .map_err(|e| (label.clone(), e))?;

        if let Some(existing) = existing {
            self.merge(&existing, &draft)
                .await
                .map_err(|e| (label.clone(), e))?;
            return Ok(Outcome::Updated);
        }

        let deal = HotDeal::from_draft(Uuid::new_v4(), draft.clone(), Utc::now());
        match self.store.insert(deal).await {
            Ok(_) => Ok(Outcome::Saved),
            Err(StoreError::Conflict(_)) => {
                // another writer (another process) stored it first
                let winner = self
                    .store
                    .find_by_identity(draft.source, &draft.source_post_id)
                    .await
                    .map_err(|e| (label.clone(), e))?
                    .ok_or_else(|| (label.clone(), StoreError::NotFound(label.clone())))?;
                self.merge(&winner, &draft)
                    .await
                    .map_err(|e| (label.clone(), e))?;
                Ok(Outcome::Updated)
            }
            Err(err) => Err((label, err)),
        }
    }

    async fn merge(&self, existing: &HotDeal, draft: &HotDealDraft) -> Result<HotDeal, StoreError> {
        let patch = merge_patch(existing, draft);
        self.store.update(existing.id, patch).await
    }
}

fn validate(draft: &HotDealDraft) -> Result<(), &'static str> {
    if draft.title.trim().is_empty() {
        return Err("missing title");
    }
    if draft.source_post_id.trim().is_empty() {
        return Err("missing source post id");
    }
    if draft.discount_rate.is_some_and(|rate| rate > 100) {
        return Err("discount rate out of range");
    }
    Ok(())
}

/// Title, price and category stay as first seen.
fn merge_patch(existing: &HotDeal, draft: &HotDealDraft) -> HotDealPatch {
    HotDealPatch {
        view_count: Some(draft.view_count),
        like_count: Some(draft.like_count),
        comment_count: Some(draft.comment_count),
        status: (draft.ended && existing.status == DealStatus::Active).then_some(DealStatus::Ended),
        end_date: if existing.end_date.is_none() { draft.end_date } else { None },
        description: if existing.description.is_none() {
            draft.description.clone()
        } else {
            None
        },
        translation_status: None,
    }
}
