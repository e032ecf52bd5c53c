//! Crawl pipeline: upsert, orchestration, scheduling, expiry and translation.

use std::sync::Arc;

use anyhow::Context;
use hotdeal_adapters::{AdapterError, AdapterRegistry};
use hotdeal_storage::{
    connect_and_migrate, FileJobStore, HotDealStore, JobStore, MemoryHotDealStore,
    MemoryTranslationStore, PgHotDealStore, PgTranslationStore, StoreError, TranslationStore,
};
use thiserror::Error;
use tracing::info;

mod config;
mod expiry;
mod orchestrator;
mod scheduler;
mod translation;
mod upsert;

pub use config::{JobSeed, JobsSeedFile, PipelineConfig};
pub use expiry::{ExpiryConfig, ExpiryEngine, ExpiryReport, ExpiryStatistics};
pub use orchestrator::{
    CrawlOptions, CrawlOrchestrator, CrawlOverrides, CrawlProgress, CrawlResult, ProgressReporter,
    SourceOutcome, TracingProgress,
};
pub use scheduler::{next_run_after, validate_schedule, CrawlScheduler, SchedulerEvent};
pub use translation::{
    build_translator, BatchTranslationReport, GoogleTranslator, SimulatedTranslator,
    TranslationCoordinator, TranslationError, Translator,
};
pub use upsert::{UpsertEngine, UpsertStats};

/// Error taxonomy shared by every pipeline operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("network error: {0}")]
    Network(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("busy: {0}")]
    Busy(String),
    #[error("translation backend error: {0}")]
    TranslationBackend(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(key) => PipelineError::Conflict(key),
            StoreError::NotFound(key) => PipelineError::NotFound(key),
            other => PipelineError::Storage(other.to_string()),
        }
    }
}

impl From<AdapterError> for PipelineError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Network(msg) | AdapterError::RateLimited(msg) => {
                PipelineError::Network(msg)
            }
            AdapterError::Parse(msg) => PipelineError::Parse(msg),
        }
    }
}

impl From<TranslationError> for PipelineError {
    fn from(err: TranslationError) -> Self {
        PipelineError::TranslationBackend(err.to_string())
    }
}

/// Every long-lived component of a running pipeline, wired from config.
#[derive(Clone)]
pub struct Pipeline {
    pub config: PipelineConfig,
    pub deals: Arc<dyn HotDealStore>,
    pub translations: Arc<dyn TranslationStore>,
    pub orchestrator: CrawlOrchestrator,
    pub scheduler: CrawlScheduler,
    pub expiry: ExpiryEngine,
    pub translator: TranslationCoordinator,
}

impl Pipeline {
    /// Builds stores (Postgres when `DATABASE_URL` is set, memory otherwise),
    /// loads the job registry and seeds it from `jobs.yaml` when empty.
    pub async fn from_config(config: PipelineConfig) -> anyhow::Result<Self> {
        let (deals, translations): (Arc<dyn HotDealStore>, Arc<dyn TranslationStore>) =
            match &config.database_url {
                Some(url) => {
                    let pool = connect_and_migrate(url).await?;
                    info!("using postgres store");
                    (
                        Arc::new(PgHotDealStore::new(pool.clone())),
                        Arc::new(PgTranslationStore::new(pool)),
                    )
                }
                None => {
                    info!("DATABASE_URL not set; using in-memory store");
                    (
                        Arc::new(MemoryHotDealStore::new()),
                        Arc::new(MemoryTranslationStore::new()),
                    )
                }
            };
        let job_store: Arc<dyn JobStore> = Arc::new(FileJobStore::new(&config.jobs_file));

        let adapters = AdapterRegistry::fixture_backed(&config.fixtures_dir);
        let orchestrator = CrawlOrchestrator::new(adapters, UpsertEngine::new(deals.clone()));
        let scheduler = CrawlScheduler::load(job_store, orchestrator.clone(), config.crawl_options())
            .await
            .context("loading job registry")?;
        let seeded = scheduler
            .seed_from_yaml(&config.jobs_seed)
            .await
            .with_context(|| format!("seeding jobs from {}", config.jobs_seed.display()))?;
        if seeded > 0 {
            info!(seeded, "job registry seeded");
        }

        let expiry = ExpiryEngine::new(deals.clone());
        let backend = build_translator(&config)?;
        let translator = TranslationCoordinator::new(deals.clone(), translations.clone(), backend);

        Ok(Self {
            config,
            deals,
            translations,
            orchestrator,
            scheduler,
            expiry,
            translator,
        })
    }
}
