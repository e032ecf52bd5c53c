//! Core domain model for the hotdeal ingestion pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// External community board a deal was crawled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteId {
    Ppomppu,
    Ruliweb,
    Clien,
    Quasarzone,
    Coolenjoy,
    Eomisae,
    Itcm,
}

impl SiteId {
    pub const ALL: [SiteId; 7] = [
        SiteId::Ppomppu,
        SiteId::Ruliweb,
        SiteId::Clien,
        SiteId::Quasarzone,
        SiteId::Coolenjoy,
        SiteId::Eomisae,
        SiteId::Itcm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SiteId::Ppomppu => "ppomppu",
            SiteId::Ruliweb => "ruliweb",
            SiteId::Clien => "clien",
            SiteId::Quasarzone => "quasarzone",
            SiteId::Coolenjoy => "coolenjoy",
            SiteId::Eomisae => "eomisae",
            SiteId::Itcm => "itcm",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            SiteId::Ppomppu => "뽐뿌",
            SiteId::Ruliweb => "루리웹",
            SiteId::Clien => "클리앙",
            SiteId::Quasarzone => "퀘이사존",
            SiteId::Coolenjoy => "쿨엔조이",
            SiteId::Eomisae => "어미새",
            SiteId::Itcm => "잇츠엠",
        }
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SiteId {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        SiteId::ALL
            .into_iter()
            .find(|site| site.as_str() == needle)
            .ok_or_else(|| UnknownVariant {
                kind: "site",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DealStatus {
    #[default]
    Active,
    Ended,
}

impl DealStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DealStatus::Active => "active",
            DealStatus::Ended => "ended",
        }
    }
}

impl FromStr for DealStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(DealStatus::Active),
            "ended" => Ok(DealStatus::Ended),
            other => Err(UnknownVariant {
                kind: "deal status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TranslationStatus {
    #[default]
    Pending,
    Translating,
    Completed,
    Failed,
}

impl TranslationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranslationStatus::Pending => "pending",
            TranslationStatus::Translating => "translating",
            TranslationStatus::Completed => "completed",
            TranslationStatus::Failed => "failed",
        }
    }
}

impl FromStr for TranslationStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TranslationStatus::Pending),
            "translating" => Ok(TranslationStatus::Translating),
            "completed" => Ok(TranslationStatus::Completed),
            "failed" => Ok(TranslationStatus::Failed),
            other => Err(UnknownVariant {
                kind: "translation status",
                value: other.to_string(),
            }),
        }
    }
}

/// Advisory product category inferred from keywords.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Electronics,
    Food,
    Beauty,
    Living,
    Fashion,
    Books,
    Sports,
    Travel,
    Game,
    #[default]
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Electronics => "electronics",
            Category::Food => "food",
            Category::Beauty => "beauty",
            Category::Living => "living",
            Category::Fashion => "fashion",
            Category::Books => "books",
            Category::Sports => "sports",
            Category::Travel => "travel",
            Category::Game => "game",
            Category::Other => "other",
        }
    }
}

impl FromStr for Category {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let category = match s {
            "electronics" => Category::Electronics,
            "food" => Category::Food,
            "beauty" => Category::Beauty,
            "living" => Category::Living,
            "fashion" => Category::Fashion,
            "books" => Category::Books,
            "sports" => Category::Sports,
            "travel" => Category::Travel,
            "game" => Category::Game,
            "other" => Category::Other,
            other => {
                return Err(UnknownVariant {
                    kind: "category",
                    value: other.to_string(),
                })
            }
        };
        Ok(category)
    }
}

/// How the `source_post_id` half of the identity key was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IdentityMode {
    #[default]
    SourceId,
    /// Hash of title + link + timestamp; dedup is unreliable for these rows.
    FallbackHash,
}

impl IdentityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityMode::SourceId => "source_id",
            IdentityMode::FallbackHash => "fallback_hash",
        }
    }
}

impl FromStr for IdentityMode {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source_id" => Ok(IdentityMode::SourceId),
            "fallback_hash" => Ok(IdentityMode::FallbackHash),
            other => Err(UnknownVariant {
                kind: "identity mode",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Ko,
    En,
    Zh,
    Vi,
    Mn,
    Th,
    Ja,
    Ru,
}

impl Language {
    /// Language every crawled listing is written in.
    pub const SOURCE: Language = Language::Ko;

    pub const ALL: [Language; 8] = [
        Language::Ko,
        Language::En,
        Language::Zh,
        Language::Vi,
        Language::Mn,
        Language::Th,
        Language::Ja,
        Language::Ru,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Ko => "ko",
            Language::En => "en",
            Language::Zh => "zh",
            Language::Vi => "vi",
            Language::Mn => "mn",
            Language::Th => "th",
            Language::Ja => "ja",
            Language::Ru => "ru",
        }
    }

    /// Code expected by the Google Translate v2 API.
    pub fn google_code(&self) -> &'static str {
        match self {
            Language::Zh => "zh-CN",
            other => other.as_str(),
        }
    }

    pub fn targets() -> impl Iterator<Item = Language> {
        Language::ALL
            .into_iter()
            .filter(|lang| *lang != Language::SOURCE)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Language::ALL
            .into_iter()
            .find(|lang| lang.as_str() == needle)
            .ok_or_else(|| UnknownVariant {
                kind: "language",
                value: s.to_string(),
            })
    }
}

/// Normalized, not-yet-persisted deal produced from one raw adapter record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotDealDraft {
    pub source: SiteId,
    pub source_post_id: String,
    pub identity_mode: IdentityMode,
    pub title: String,
    pub description: Option<String>,
    pub price: u64,
    pub original_price: Option<u64>,
    pub discount_rate: Option<u8>,
    pub category: Category,
    pub image_url: Option<String>,
    pub original_url: String,
    pub seller: String,
    pub crawled_at: DateTime<Utc>,
    pub ended: bool,
    pub end_date: Option<DateTime<Utc>>,
    pub view_count: u64,
    pub like_count: u64,
    pub comment_count: u64,
}

impl HotDealDraft {
    pub fn status(&self) -> DealStatus {
        if self.ended {
            DealStatus::Ended
        } else {
            DealStatus::Active
        }
    }
}

/// Persisted deal. `(source, source_post_id)` is the identity; `id` is a surrogate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotDeal {
    pub id: Uuid,
    pub source: SiteId,
    pub source_post_id: String,
    pub identity_mode: IdentityMode,
    pub title: String,
    pub description: Option<String>,
    pub price: u64,
    pub original_price: Option<u64>,
    pub discount_rate: Option<u8>,
    pub category: Category,
    pub image_url: Option<String>,
    pub original_url: String,
    pub seller: String,
    pub crawled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: DealStatus,
    pub end_date: Option<DateTime<Utc>>,
    pub view_count: u64,
    pub like_count: u64,
    pub comment_count: u64,
    pub translation_status: TranslationStatus,
}

impl HotDeal {
    pub fn from_draft(id: Uuid, draft: HotDealDraft, now: DateTime<Utc>) -> Self {
        let status = draft.status();
        Self {
            id,
            source: draft.source,
            source_post_id: draft.source_post_id,
            identity_mode: draft.identity_mode,
            title: draft.title,
            description: draft.description,
            price: draft.price,
            original_price: draft.original_price,
            discount_rate: draft.discount_rate,
            category: draft.category,
            image_url: draft.image_url,
            original_url: draft.original_url,
            seller: draft.seller,
            crawled_at: draft.crawled_at,
            updated_at: now,
            status,
            end_date: draft.end_date,
            view_count: draft.view_count,
            like_count: draft.like_count,
            comment_count: draft.comment_count,
            translation_status: TranslationStatus::Pending,
        }
    }

    pub fn identity(&self) -> (SiteId, &str) {
        (self.source, &self.source_post_id)
    }
}

/// Partial update applied by `update`. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HotDealPatch {
    pub view_count: Option<u64>,
    pub like_count: Option<u64>,
    pub comment_count: Option<u64>,
    pub status: Option<DealStatus>,
    pub end_date: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub translation_status: Option<TranslationStatus>,
}

impl HotDealPatch {
    pub fn is_empty(&self) -> bool {
        *self == HotDealPatch::default()
    }

    pub fn apply_to(&self, deal: &mut HotDeal, now: DateTime<Utc>) {
        if let Some(v) = self.view_count {
            deal.view_count = v;
        }
        if let Some(v) = self.like_count {
            deal.like_count = v;
        }
        if let Some(v) = self.comment_count {
            deal.comment_count = v;
        }
        if let Some(status) = self.status {
            deal.status = status;
        }
        if let Some(end_date) = self.end_date {
            deal.end_date = Some(end_date);
        }
        if let Some(description) = &self.description {
            deal.description = Some(description.clone());
        }
        if let Some(status) = self.translation_status {
            deal.translation_status = status;
        }
        deal.updated_at = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Idle,
    Running,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CrawlStatistics {
    pub total_crawled: usize,
    pub new_deals: usize,
    pub updated_deals: usize,
    pub errors: usize,
    pub duration_ms: u64,
}

/// Registered recurring crawl of one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlJob {
    pub id: String,
    pub source: SiteId,
    pub schedule: String,
    pub enabled: bool,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_statistics: Option<CrawlStatistics>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl CrawlJob {
    pub fn new(id: impl Into<String>, source: SiteId, schedule: impl Into<String>, enabled: bool) -> Self {
        Self {
            id: id.into(),
            source,
            schedule: schedule.into(),
            enabled,
            status: JobStatus::Idle,
            last_run: None,
            next_run: None,
            last_statistics: None,
            last_error: None,
        }
    }
}

/// Translated content of one deal in one target language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Translation {
    pub hot_deal_id: Uuid,
    pub language: Language,
    pub title: String,
    pub description: Option<String>,
    pub status: TranslationStatus,
    pub is_auto_translated: bool,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Translation {
    pub fn translating(hot_deal_id: Uuid, language: Language, now: DateTime<Utc>) -> Self {
        Self {
            hot_deal_id,
            language,
            title: String::new(),
            description: None,
            status: TranslationStatus::Translating,
            is_auto_translated: true,
            error: None,
            updated_at: now,
        }
    }
}
