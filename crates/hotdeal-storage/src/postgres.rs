use std::str::FromStr;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hotdeal_core::{
    DealStatus, HotDeal, HotDealPatch, Language, SiteId, Translation, UnknownVariant,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::{HotDealStore, StoreError, TranslationStore};

const DEAL_COLUMNS: &str = r#"
    id, source, source_post_id, identity_mode, title, description, price,
    original_price, discount_rate, category, image_url, original_url, seller,
    crawled_at, updated_at, status, end_date, view_count, like_count,
    comment_count, translation_status
"#;

pub async fn connect_and_migrate(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(database_url)
        .await
        .context("connecting to postgres")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("running migrations")?;
    info!("database migrations applied");
    Ok(pool)
}

fn corrupt(err: UnknownVariant) -> StoreError {
    StoreError::Corrupt(err.to_string())
}

fn parse_column<T>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T: FromStr<Err = UnknownVariant>,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>().map_err(corrupt)
}

fn count(row: &PgRow, column: &str) -> Result<u64, StoreError> {
    let v: i64 = row.try_get(column)?;
    u64::try_from(v).map_err(|_| StoreError::Corrupt(format!("{column} is negative: {v}")))
}

/// BIGINT columns hold at most `i64::MAX`.
fn to_bigint(value: u64, column: &str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} out of range: {value}")))
}

fn page_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn deal_from_row(row: &PgRow) -> Result<HotDeal, StoreError> {
    let original_price: Option<i64> = row.try_get("original_price")?;
    let discount_rate: Option<i16> = row.try_get("discount_rate")?;
    Ok(HotDeal {
        id: row.try_get("id")?,
        source: parse_column(row, "source")?,
        source_post_id: row.try_get("source_post_id")?,
        identity_mode: parse_column(row, "identity_mode")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        price: count(row, "price")?,
        original_price: original_price
            .map(|v| u64::try_from(v).map_err(|_| StoreError::Corrupt(format!("original_price is negative: {v}"))))
            .transpose()?,
        discount_rate: discount_rate.map(|v| v.clamp(0, 100) as u8),
        category: parse_column(row, "category")?,
        image_url: row.try_get("image_url")?,
        original_url: row.try_get("original_url")?,
        seller: row.try_get("seller")?,
        crawled_at: row.try_get("crawled_at")?,
        updated_at: row.try_get("updated_at")?,
        status: parse_column(row, "status")?,
        end_date: row.try_get("end_date")?,
        view_count: count(row, "view_count")?,
        like_count: count(row, "like_count")?,
        comment_count: count(row, "comment_count")?,
        translation_status: parse_column(row, "translation_status")?,
    })
}

fn map_insert_error(err: sqlx::Error, identity: String) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StoreError::Conflict(identity);
        }
    }
    StoreError::Database(err)
}

#[derive(Debug, Clone)]
pub struct PgHotDealStore {
    pool: PgPool,
}

impl PgHotDealStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HotDealStore for PgHotDealStore {
    async fn find_by_identity(
        &self,
        source: SiteId,
        source_post_id: &str,
    ) -> Result<Option<HotDeal>, StoreError> {
        let sql = format!(
            "SELECT {DEAL_COLUMNS} FROM hot_deals WHERE source = $1 AND source_post_id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(source.as_str())
            .bind(source_post_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(deal_from_row).transpose()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<HotDeal>, StoreError> {
        let sql = format!("SELECT {DEAL_COLUMNS} FROM hot_deals WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(deal_from_row).transpose()
    }

    async fn insert(&self, deal: HotDeal) -> Result<HotDeal, StoreError> {
        let identity = format!("{}:{}", deal.source, deal.source_post_id);
        let price = to_bigint(deal.price, "price")?;
        let original_price = deal
            .original_price
            .map(|v| to_bigint(v, "original_price"))
            .transpose()?;
        let view_count = to_bigint(deal.view_count, "view_count")?;
        let like_count = to_bigint(deal.like_count, "like_count")?;
        let comment_count = to_bigint(deal.comment_count, "comment_count")?;
        sqlx::query(
            r#"
            INSERT INTO hot_deals (
                id, source, source_post_id, identity_mode, title, description, price,
                original_price, discount_rate, category, image_url, original_url, seller,
                crawled_at, updated_at, status, end_date, view_count, like_count,
                comment_count, translation_status
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                $17, $18, $19, $20, $21
            )
            "#,
        )
        .bind(deal.id)
        .bind(deal.source.as_str())
        .bind(&deal.source_post_id)
        .bind(deal.identity_mode.as_str())
        .bind(&deal.title)
        .bind(&deal.description)
        .bind(price)
        .bind(original_price)
        .bind(deal.discount_rate.map(i16::from))
        .bind(deal.category.as_str())
        .bind(&deal.image_url)
        .bind(&deal.original_url)
        .bind(&deal.seller)
        .bind(deal.crawled_at)
        .bind(deal.updated_at)
        .bind(deal.status.as_str())
        .bind(deal.end_date)
        .bind(view_count)
        .bind(like_count)
        .bind(comment_count)
        .bind(deal.translation_status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|err| map_insert_error(err, identity))?;
        Ok(deal)
    }

    async fn update(&self, id: Uuid, patch: HotDealPatch) -> Result<HotDeal, StoreError> {
        let mut tx = self.pool.begin().await?;
        let sql = format!("SELECT {DEAL_COLUMNS} FROM hot_deals WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut deal = deal_from_row(&row)?;
        patch.apply_to(&mut deal, Utc::now());
        let view_count = to_bigint(deal.view_count, "view_count")?;
        let like_count = to_bigint(deal.like_count, "like_count")?;
        let comment_count = to_bigint(deal.comment_count, "comment_count")?;

        sqlx::query(
            r#"
            UPDATE hot_deals
               SET view_count = $2,
                   like_count = $3,
                   comment_count = $4,
                   status = $5,
                   end_date = $6,
                   description = $7,
                   translation_status = $8,
                   updated_at = $9
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(view_count)
        .bind(like_count)
        .bind(comment_count)
        .bind(deal.status.as_str())
        .bind(deal.end_date)
        .bind(&deal.description)
        .bind(deal.translation_status.as_str())
        .bind(deal.updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(deal)
    }

    async fn scan_active(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<HotDeal>, StoreError> {
        let sql = format!(
            r#"
            SELECT {DEAL_COLUMNS}
              FROM hot_deals
             WHERE status = 'active'
               AND ($1::uuid IS NULL OR id > $1)
             ORDER BY id ASC
             LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(after)
            .bind(page_limit(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(deal_from_row).collect()
    }

    async fn find_active_expiring(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<HotDeal>, StoreError> {
        let sql = format!(
            r#"
            SELECT {DEAL_COLUMNS}
              FROM hot_deals
             WHERE status = 'active'
               AND end_date BETWEEN $1 AND $2
             ORDER BY end_date ASC, id ASC
             LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(from)
            .bind(to)
            .bind(page_limit(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(deal_from_row).collect()
    }

    async fn count_active_expiring(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM hot_deals WHERE status = 'active' AND end_date BETWEEN $1 AND $2",
        )
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;
        count(&row, "n")
    }

    async fn count_ended_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM hot_deals WHERE status = 'ended' AND updated_at >= $1")
            .bind(since)
            .fetch_one(&self.pool)
            .await?;
        count(&row, "n")
    }

    async fn update_status(&self, id: Uuid, status: DealStatus) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE hot_deals SET status = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn count_by_status(&self, status: DealStatus) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM hot_deals WHERE status = $1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        count(&row, "n")
    }
}

#[derive(Debug, Clone)]
pub struct PgTranslationStore {
    pool: PgPool,
}

impl PgTranslationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn translation_from_row(row: &PgRow) -> Result<Translation, StoreError> {
    Ok(Translation {
        hot_deal_id: row.try_get("hot_deal_id")?,
        language: parse_column::<Language>(row, "language")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        status: parse_column(row, "status")?,
        is_auto_translated: row.try_get("is_auto_translated")?,
        error: row.try_get("error")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl TranslationStore for PgTranslationStore {
    async fn get(&self, hot_deal_id: Uuid, language: Language) -> Result<Option<Translation>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT hot_deal_id, language, title, description, status,
                   is_auto_translated, error, updated_at
              FROM hotdeal_translations
             WHERE hot_deal_id = $1 AND language = $2
            "#,
        )
        .bind(hot_deal_id)
        .bind(language.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(translation_from_row).transpose()
    }

    async fn list_for_deal(&self, hot_deal_id: Uuid) -> Result<Vec<Translation>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT hot_deal_id, language, title, description, status,
                   is_auto_translated, error, updated_at
              FROM hotdeal_translations
             WHERE hot_deal_id = $1
            "#,
        )
        .bind(hot_deal_id)
        .fetch_all(&self.pool)
        .await?;
        let mut out = rows
            .iter()
            .map(translation_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        out.sort_by_key(|t| t.language);
        Ok(out)
    }

    async fn put(&self, translation: Translation) -> Result<Translation, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO hotdeal_translations (
                hot_deal_id, language, title, description, status,
                is_auto_translated, error, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (hot_deal_id, language) DO UPDATE
               SET title = EXCLUDED.title,
                   description = EXCLUDED.description,
                   status = EXCLUDED.status,
                   is_auto_translated = EXCLUDED.is_auto_translated,
                   error = EXCLUDED.error,
                   updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(translation.hot_deal_id)
        .bind(translation.language.as_str())
        .bind(&translation.title)
        .bind(&translation.description)
        .bind(translation.status.as_str())
        .bind(translation.is_auto_translated)
        .bind(&translation.error)
        .bind(translation.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(translation)
    }
}
