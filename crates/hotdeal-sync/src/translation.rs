use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hotdeal_core::{HotDeal, HotDealPatch, Language, Translation, TranslationStatus};
use hotdeal_storage::{FetchError, HotDealStore, HttpFetcher, TranslationStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{PipelineConfig, PipelineError};

const GOOGLE_ENDPOINT: &str = "https://translation.googleapis.com/language/translate/v2";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslationError {
    #[error("{0}")]
    Backend(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
}

#[async_trait]
pub trait Translator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn translate(&self, text: &str, source: Language, target: Language) -> Result<String, TranslationError>;
}

/// Deterministic backend: prefixes the text with the target code, e.g. `[EN] `.
#[derive(Debug, Default)]
pub struct SimulatedTranslator {
    latency: Duration,
    fail_next: AtomicUsize,
    calls: AtomicUsize,
}

impl SimulatedTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Makes the next `n` calls fail.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Translator for SimulatedTranslator {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn translate(&self, text: &str, _source: Language, target: Language) -> Result<String, TranslationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let should_fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(TranslationError::Backend("simulated backend failure".into()));
        }
        Ok(format!("[{}] {text}", target.as_str().to_ascii_uppercase()))
    }
}

#[derive(Serialize)]
struct GoogleRequest<'a> {
    q: &'a str,
    source: &'a str,
    target: &'a str,
    format: &'a str,
}

#[derive(Deserialize)]
struct GoogleResponse {
    data: GoogleData,
}

#[derive(Deserialize)]
struct GoogleData {
    translations: Vec<GoogleTranslation>,
}

#[derive(Deserialize)]
struct GoogleTranslation {
    #[serde(rename = "translatedText")]
    translated_text: String,
}

/// Google Cloud Translation v2 over the shared [`HttpFetcher`].
#[derive(Debug)]
pub struct GoogleTranslator {
    fetcher: HttpFetcher,
    api_key: String,
    endpoint: String,
}

impl GoogleTranslator {
    pub fn new(fetcher: HttpFetcher, api_key: impl Into<String>) -> Self {
        Self {
            fetcher,
            api_key: api_key.into(),
            endpoint: GOOGLE_ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl Translator for GoogleTranslator {
    fn name(&self) -> &'static str {
        "google"
    }

    async fn translate(&self, text: &str, source: Language, target: Language) -> Result<String, TranslationError> {
        let body = GoogleRequest {
            q: text,
            source: source.google_code(),
            target: target.google_code(),
            format: "text",
        };
        let headers = [("X-Goog-Api-Key", self.api_key.as_str())];
        let response: GoogleResponse = self
            .fetcher
            .post_json(&self.endpoint, &headers, &body)
            .await
            .map_err(|err: FetchError| {
                if err.is_rate_limited() {
                    TranslationError::RateLimited(err.to_string())
                } else {
                    TranslationError::Backend(err.to_string())
                }
            })?;
        response
            .data
            .translations
            .into_iter()
            .next()
            .map(|t| t.translated_text)
            .ok_or_else(|| TranslationError::Backend("empty translation response".into()))
    }
}

/// Google when an API key is configured, the simulated backend otherwise.
pub fn build_translator(config: &PipelineConfig) -> anyhow::Result<Arc<dyn Translator>> {
    match &config.google_api_key {
        Some(key) => {
            let fetcher = HttpFetcher::new(config.http_client_config())?;
            info!("using google translation backend");
            Ok(Arc::new(GoogleTranslator::new(fetcher, key.clone())))
        }
        None => {
            info!("GOOGLE_TRANSLATE_API_KEY not set; using simulated translator");
            Ok(Arc::new(SimulatedTranslator::new()))
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchTranslationReport {
    pub completed: usize,
    pub failed: usize,
}

type Key = (Uuid, Language);
type Shared = Option<Result<Translation, PipelineError>>;
type Registry = Arc<Mutex<HashMap<Key, watch::Receiver<Shared>>>>;

/// Unregisters an in-flight attempt when its task ends, even by panic.
struct InflightEntry {
    registry: Registry,
    key: Key,
}

impl Drop for InflightEntry {
    fn drop(&mut self) {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.key);
    }
}

/// Lazily translates deals, caching completed translations in the store and
/// collapsing concurrent requests for one `(deal, language)` into one attempt.
#[derive(Clone)]
pub struct TranslationCoordinator {
    deals: Arc<dyn HotDealStore>,
    translations: Arc<dyn TranslationStore>,
    backend: Arc<dyn Translator>,
    inflight: Registry,
}

impl TranslationCoordinator {
    pub fn new(
        deals: Arc<dyn HotDealStore>,
        translations: Arc<dyn TranslationStore>,
        backend: Arc<dyn Translator>,
    ) -> Self {
        Self {
            deals,
            translations,
            backend,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn get_or_create(&self, deal_id: Uuid, language: Language) -> Result<Translation, PipelineError> {
        if language == Language::SOURCE {
            return Ok(original(&self.require_deal(deal_id).await?));
        }
        if let Some(existing) = self.translations.get(deal_id, language).await? {
            if existing.status == TranslationStatus::Completed {
                return Ok(existing);
            }
        }

        let mut rx = self.join_or_start((deal_id, language));
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            Err(PipelineError::TranslationBackend(
                "translation attempt ended without a result".into(),
            ))
        })
    }

    /// Returns a receiver for the attempt on `key`, spawning one if none runs.
    fn join_or_start(&self, key: Key) -> watch::Receiver<Shared> {
        let mut registry = self
            .inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(rx) = registry.get(&key) {
            debug!(deal_id = %key.0, language = %key.1, "joining in-flight translation");
            return rx.clone();
        }
        let (tx, rx) = watch::channel(None);
        registry.insert(key, rx.clone());

        let this = self.clone();
        tokio::spawn(async move {
            let _entry = InflightEntry {
                registry: this.inflight.clone(),
                key,
            };
            let result = this.attempt(key.0, key.1).await;
            let _ = tx.send(Some(result));
        });
        rx
    }

    async fn attempt(&self, deal_id: Uuid, language: Language) -> Result<Translation, PipelineError> {
        if let Some(existing) = self.translations.get(deal_id, language).await? {
            if existing.status == TranslationStatus::Completed {
                return Ok(existing);
            }
        }
        let deal = self.require_deal(deal_id).await?;

        self.translations
            .put(Translation::translating(deal_id, language, Utc::now()))
            .await?;
        if deal.translation_status != TranslationStatus::Completed {
            self.set_deal_status(deal_id, TranslationStatus::Translating).await?;
        }

        match self.translate_deal(&deal, language).await {
            Ok((title, description)) => {
                let stored = self
                    .translations
                    .put(Translation {
                        title,
                        description,
                        status: TranslationStatus::Completed,
                        error: None,
                        updated_at: Utc::now(),
                        ..Translation::translating(deal_id, language, Utc::now())
                    })
                    .await?;
                self.set_deal_status(deal_id, TranslationStatus::Completed).await?;
                debug!(%deal_id, %language, "translation completed");
                Ok(stored)
            }
            Err(err) => {
                warn!(%deal_id, %language, error = %err, "translation failed");
                self.translations
                    .put(Translation {
                        status: TranslationStatus::Failed,
                        error: Some(err.to_string()),
                        ..Translation::translating(deal_id, language, Utc::now())
                    })
                    .await?;
                let any_completed = self
                    .translations
                    .list_for_deal(deal_id)
                    .await?
                    .iter()
                    .any(|t| t.status == TranslationStatus::Completed);
                let status = if any_completed {
                    TranslationStatus::Completed
                } else {
                    TranslationStatus::Failed
                };
                self.set_deal_status(deal_id, status).await?;
                Err(err.into())
            }
        }
    }

    async fn translate_deal(
        &self,
        deal: &HotDeal,
        language: Language,
    ) -> Result<(String, Option<String>), TranslationError> {
        let title = self
            .backend
            .translate(&deal.title, Language::SOURCE, language)
            .await?;
        let description = match deal.description.as_deref().filter(|d| !d.trim().is_empty()) {
            Some(text) => Some(self.backend.translate(text, Language::SOURCE, language).await?),
            None => None,
        };
        Ok((title, description))
    }

    /// Translates every `(deal, language)` pair; one failure does not stop the rest.
    pub async fn batch_translate(&self, deal_ids: &[Uuid], languages: &[Language]) -> BatchTranslationReport {
        let mut tasks = JoinSet::new();
        for deal_id in deal_ids {
            for language in languages {
                let this = self.clone();
                let (deal_id, language) = (*deal_id, *language);
                tasks.spawn(async move { this.get_or_create(deal_id, language).await });
            }
        }

        let mut report = BatchTranslationReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(_)) => report.completed += 1,
                Ok(Err(_)) | Err(_) => report.failed += 1,
            }
        }
        info!(completed = report.completed, failed = report.failed, "batch translation finished");
        report
    }

    /// Status per target language; languages never requested report `pending`.
    pub async fn translation_status(
        &self,
        deal_id: Uuid,
    ) -> Result<BTreeMap<Language, TranslationStatus>, PipelineError> {
        self.require_deal(deal_id).await?;
        let mut statuses: BTreeMap<_, _> = Language::targets()
            .map(|language| (language, TranslationStatus::Pending))
            .collect();
        for translation in self.translations.list_for_deal(deal_id).await? {
            statuses.insert(translation.language, translation.status);
        }
        Ok(statuses)
    }

    pub async fn list_translations(&self, deal_id: Uuid) -> Result<Vec<Translation>, PipelineError> {
        self.require_deal(deal_id).await?;
        Ok(self.translations.list_for_deal(deal_id).await?)
    }

    async fn require_deal(&self, deal_id: Uuid) -> Result<HotDeal, PipelineError> {
        self.deals
            .find_by_id(deal_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("hot deal {deal_id}")))
    }

    async fn set_deal_status(&self, deal_id: Uuid, status: TranslationStatus) -> Result<(), PipelineError> {
        let patch = HotDealPatch {
            translation_status: Some(status),
            ..HotDealPatch::default()
        };
        self.deals.update(deal_id, patch).await?;
        Ok(())
    }
}

fn original(deal: &HotDeal) -> Translation {
    Translation {
        hot_deal_id: deal.id,
        language: Language::SOURCE,
        title: deal.title.clone(),
        description: deal.description.clone(),
        status: TranslationStatus::Completed,
        is_auto_translated: false,
        error: None,
        updated_at: deal.updated_at,
    }
}
