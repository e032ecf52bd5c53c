use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

use anyhow::Context;
use chrono::{DateTime, Utc};
use croner::Cron;
use hotdeal_core::{CrawlJob, CrawlStatistics, JobStatus, SiteId};
use hotdeal_storage::JobStore;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex as AsyncMutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    CrawlOptions, CrawlOrchestrator, CrawlOverrides, CrawlResult, ExpiryConfig, ExpiryEngine,
    JobsSeedFile, PipelineError,
};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    Started {
        job_id: Option<String>,
        source: SiteId,
        at: DateTime<Utc>,
    },
    Completed {
        job_id: Option<String>,
        source: SiteId,
        stats: CrawlStatistics,
    },
    Failed {
        job_id: Option<String>,
        source: SiteId,
        error: String,
    },
}

/// Accepts 5-field (minute) and 6-field (seconds) cron expressions.
pub fn validate_schedule(expression: &str) -> Result<Cron, PipelineError> {
    Cron::new(&driver_expression(expression))
        .with_seconds_optional()
        .parse()
        .map_err(|err| PipelineError::Validation(format!("invalid cron expression {expression:?}: {err}")))
}

pub fn next_run_after(expression: &str, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, PipelineError> {
    let cron = validate_schedule(expression)?;
    Ok(cron.find_next_occurrence(&now, false).ok())
}

/// The cron driver wants a seconds column.
fn driver_expression(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

struct Driver {
    sched: JobScheduler,
    ids: HashMap<String, Uuid>,
}

struct Inner {
    jobs: RwLock<BTreeMap<String, CrawlJob>>,
    store: Arc<dyn JobStore>,
    orchestrator: CrawlOrchestrator,
    defaults: CrawlOptions,
    running: Mutex<HashSet<SiteId>>,
    events: broadcast::Sender<SchedulerEvent>,
    driver: AsyncMutex<Option<Driver>>,
}

/// Held for the duration of one crawl of a source.
struct RunSlot {
    inner: Arc<Inner>,
    source: SiteId,
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        self.inner
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.source);
    }
}

/// Registry of crawl jobs plus the in-process cron driver that fires them.
/// The registry is usable without ever calling [`CrawlScheduler::start`].
#[derive(Clone)]
pub struct CrawlScheduler {
    inner: Arc<Inner>,
}

impl CrawlScheduler {
    /// Loads persisted jobs. Jobs left `running` by a previous process are reset to `idle`.
    pub async fn load(
        store: Arc<dyn JobStore>,
        orchestrator: CrawlOrchestrator,
        defaults: CrawlOptions,
    ) -> Result<Self, PipelineError> {
        let now = Utc::now();
        let mut jobs = BTreeMap::new();
        for mut job in store.load_all().await? {
            if job.status == JobStatus::Running {
                warn!(job_id = %job.id, "job was left running; resetting to idle");
                job.status = JobStatus::Idle;
                store.put(&job).await?;
            }
            if job.enabled {
                job.next_run = next_run_after(&job.schedule, now).unwrap_or(None);
            }
            jobs.insert(job.id.clone(), job);
        }
        debug!(jobs = jobs.len(), "job registry loaded");

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                jobs: RwLock::new(jobs),
                store,
                orchestrator,
                defaults,
                running: Mutex::new(HashSet::new()),
                events,
                driver: AsyncMutex::new(None),
            }),
        })
    }

    /// Registers the jobs of a `jobs.yaml` seed when the registry is empty.
    pub async fn seed_from_yaml(&self, path: &Path) -> anyhow::Result<usize> {
        if !self.inner.jobs.read().await.is_empty() {
            return Ok(0);
        }
        let Some(seed) = JobsSeedFile::load(path).await? else {
            return Ok(0);
        };
        let mut added = 0;
        for entry in seed.jobs {
            let job = CrawlJob::new(entry.id.clone(), entry.source, entry.schedule, entry.enabled);
            self.add_job(job)
                .await
                .with_context(|| format!("adding seeded job {}", entry.id))?;
            added += 1;
        }
        Ok(added)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    pub fn defaults(&self) -> &CrawlOptions {
        &self.inner.defaults
    }

    /// Adds or replaces a job. The schedule is validated and `next_run` recomputed.
    pub async fn add_job(&self, mut job: CrawlJob) -> Result<CrawlJob, PipelineError> {
        if job.id.trim().is_empty() {
            return Err(PipelineError::Validation("job id must not be empty".into()));
        }
        validate_schedule(&job.schedule)?;
        job.next_run = if job.enabled {
            next_run_after(&job.schedule, Utc::now())?
        } else {
            None
        };

        {
            let mut jobs = self.inner.jobs.write().await;
            // a replaced job keeps showing its crawl in progress
            job.status = match jobs.get(&job.id) {
                Some(existing) if existing.status == JobStatus::Running => JobStatus::Running,
                _ => JobStatus::Idle,
            };
            self.inner.store.put(&job).await?;
            jobs.insert(job.id.clone(), job.clone());
        }
        info!(job_id = %job.id, source = %job.source, schedule = %job.schedule, "job added");

        let mut driver = self.inner.driver.lock().await;
        if let Some(driver) = driver.as_mut() {
            self.unregister(driver, &job.id).await;
            if job.enabled {
                self.register(driver, &job).await?;
            }
        }
        Ok(job)
    }

    pub async fn remove_job(&self, job_id: &str) -> Result<bool, PipelineError> {
        let removed = {
            let mut jobs = self.inner.jobs.write().await;
            let existed = self.inner.store.delete(job_id).await?;
            jobs.remove(job_id).is_some() || existed
        };
        if removed {
            if let Some(driver) = self.inner.driver.lock().await.as_mut() {
                self.unregister(driver, job_id).await;
            }
            info!(job_id, "job removed");
        }
        Ok(removed)
    }

    pub async fn toggle_job(&self, job_id: &str, enabled: bool) -> Result<CrawlJob, PipelineError> {
        let job = self
            .modify(job_id, |job| {
                job.enabled = enabled;
                job.next_run = upcoming_run(job);
            })
            .await?;

        if let Some(driver) = self.inner.driver.lock().await.as_mut() {
            self.unregister(driver, job_id).await;
            if enabled {
                self.register(driver, &job).await?;
            }
        }
        info!(job_id, enabled, "job toggled");
        Ok(job)
    }

    pub async fn get_job(&self, job_id: &str) -> Option<CrawlJob> {
        self.inner.jobs.read().await.get(job_id).cloned()
    }

    pub async fn all_jobs(&self) -> Vec<CrawlJob> {
        self.inner.jobs.read().await.values().cloned().collect()
    }

    /// Crawls `source` now. Rejected with `Busy` while that source is being crawled.
    pub async fn run_manually(
        &self,
        source: SiteId,
        overrides: &CrawlOverrides,
    ) -> Result<CrawlResult, PipelineError> {
        let options = overrides.apply(&self.inner.defaults);
        let job_id = self
            .inner
            .jobs
            .read()
            .await
            .values()
            .find(|job| job.source == source)
            .map(|job| job.id.clone());

        match job_id {
            Some(job_id) => self.run_job(&job_id, options).await,
            None => {
                let _slot = self.claim(source)?;
                self.emit(SchedulerEvent::Started {
                    job_id: None,
                    source,
                    at: Utc::now(),
                });
                let outcome = self.inner.orchestrator.crawl(source, &options).await;
                self.emit(finished_event(None, source, &outcome));
                outcome
            }
        }
    }

    /// Entry point of the cron driver. Disabled or busy jobs are skipped.
    pub async fn trigger(&self, job_id: &str) -> Option<CrawlResult> {
        let Some(job) = self.get_job(job_id).await else {
            warn!(job_id, "trigger for unknown job");
            return None;
        };
        if !job.enabled {
            debug!(job_id, "trigger ignored; job disabled");
            self.refresh_next_run(job_id).await;
            return None;
        }
        match self.run_job(job_id, self.inner.defaults.clone()).await {
            Ok(result) => Some(result),
            Err(PipelineError::Busy(_)) => {
                info!(job_id, source = %job.source, "trigger skipped; job already running");
                self.refresh_next_run(job_id).await;
                None
            }
            Err(err) => {
                error!(job_id, error = %err, "scheduled crawl failed");
                None
            }
        }
    }

    async fn run_job(&self, job_id: &str, options: CrawlOptions) -> Result<CrawlResult, PipelineError> {
        let source = self
            .get_job(job_id)
            .await
            .map(|job| job.source)
            .ok_or_else(|| PipelineError::NotFound(format!("job {job_id}")))?;
        let _slot = self.claim(source)?;

        let started = Utc::now();
        self.modify(job_id, |job| {
            job.status = JobStatus::Running;
            job.last_run = Some(started);
        })
        .await?;
        self.emit(SchedulerEvent::Started {
            job_id: Some(job_id.to_string()),
            source,
            at: started,
        });

        let outcome = self.inner.orchestrator.crawl(source, &options).await;

        let finished = self
            .modify(job_id, |job| {
                match &outcome {
                    Ok(result) => {
                        job.last_statistics = Some(result.stats);
                        job.last_error = result.error.clone();
                        job.status = if result.error.is_some() {
                            JobStatus::Failed
                        } else {
                            JobStatus::Idle
                        };
                    }
                    Err(err) => {
                        job.last_error = Some(err.to_string());
                        job.status = JobStatus::Failed;
                    }
                }
                job.next_run = upcoming_run(job);
            })
            .await;
        if let Err(err) = finished {
            warn!(job_id, error = %err, "could not record job outcome");
        }

        self.emit(finished_event(Some(job_id.to_string()), source, &outcome));
        outcome
    }

    async fn refresh_next_run(&self, job_id: &str) {
        let refreshed = self
            .modify(job_id, |job| job.next_run = upcoming_run(job))
            .await;
        if let Err(err) = refreshed {
            warn!(job_id, error = %err, "could not refresh next run");
        }
    }

    fn claim(&self, source: SiteId) -> Result<RunSlot, PipelineError> {
        let mut running = self
            .inner
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !running.insert(source) {
            return Err(PipelineError::Busy(format!("a crawl of {source} is already running")));
        }
        Ok(RunSlot {
            inner: self.inner.clone(),
            source,
        })
    }

    /// Applies `change` to a job and writes it through to the job store.
    async fn modify<F>(&self, job_id: &str, change: F) -> Result<CrawlJob, PipelineError>
    where
        F: FnOnce(&mut CrawlJob),
    {
        let mut jobs = self.inner.jobs.write().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| PipelineError::NotFound(format!("job {job_id}")))?;
        let mut updated = job.clone();
        change(&mut updated);
        self.inner.store.put(&updated).await?;
        *job = updated.clone();
        Ok(updated)
    }

    fn emit(&self, event: SchedulerEvent) {
        // no subscribers is fine
        let _ = self.inner.events.send(event);
    }

    pub async fn is_running(&self) -> bool {
        self.inner.driver.lock().await.is_some()
    }

    /// Starts the cron driver with every enabled job.
    pub async fn start(&self) -> anyhow::Result<()> {
        let mut slot = self.inner.driver.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let mut driver = Driver {
            sched,
            ids: HashMap::new(),
        };
        for job in self.all_jobs().await.into_iter().filter(|job| job.enabled) {
            self.register(&mut driver, &job)
                .await
                .with_context(|| format!("registering job {}", job.id))?;
        }
        driver.sched.start().await.context("starting scheduler")?;
        info!(jobs = driver.ids.len(), "scheduler started");
        *slot = Some(driver);
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        let Some(mut driver) = self.inner.driver.lock().await.take() else {
            return Ok(());
        };
        driver.sched.shutdown().await.context("stopping scheduler")?;
        info!("scheduler stopped");
        Ok(())
    }

    /// Runs the expiry sweep on `cron` while the driver is started.
    pub async fn add_expiry_job(
        &self,
        cron: &str,
        engine: ExpiryEngine,
        config: ExpiryConfig,
    ) -> anyhow::Result<()> {
        validate_schedule(cron)?;
        let mut slot = self.inner.driver.lock().await;
        let driver = slot
            .as_mut()
            .context("scheduler must be started before adding the expiry job")?;
        let expiry_job = Job::new_async(driver_expression(cron).as_str(), move |_uuid, _lock| {
            let engine = engine.clone();
            let config = config.clone();
            Box::pin(async move {
                match engine.process_expired_deals(&config).await {
                    Ok(report) => info!(
                        expired = report.expired,
                        expiring_soon = report.expiring_soon,
                        errors = report.errors,
                        "expiry sweep finished"
                    ),
                    Err(err) => error!(error = %err, "expiry sweep failed"),
                }
            })
        })
        .with_context(|| format!("creating expiry job for cron {cron}"))?;
        driver.sched.add(expiry_job).await.context("adding expiry job")?;
        Ok(())
    }

    async fn register(&self, driver: &mut Driver, job: &CrawlJob) -> Result<(), PipelineError> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let job_id = job.id.clone();
        let cron_job = Job::new_async(driver_expression(&job.schedule).as_str(), move |_uuid, _lock| {
            let weak = weak.clone();
            let job_id = job_id.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                CrawlScheduler { inner }.trigger(&job_id).await;
            })
        })
        .map_err(|err| PipelineError::Validation(format!("cron driver rejected {:?}: {err}", job.schedule)))?;
        let uuid = driver
            .sched
            .add(cron_job)
            .await
            .map_err(|err| PipelineError::Storage(format!("adding cron job: {err}")))?;
        driver.ids.insert(job.id.clone(), uuid);
        Ok(())
    }

    async fn unregister(&self, driver: &mut Driver, job_id: &str) {
        if let Some(uuid) = driver.ids.remove(job_id) {
            if let Err(err) = driver.sched.remove(&uuid).await {
                warn!(job_id, error = %err, "removing cron job failed");
            }
        }
    }
}

fn upcoming_run(job: &CrawlJob) -> Option<DateTime<Utc>> {
    if job.enabled {
        next_run_after(&job.schedule, Utc::now()).unwrap_or(None)
    } else {
        None
    }
}

fn finished_event(
    job_id: Option<String>,
    source: SiteId,
    outcome: &Result<CrawlResult, PipelineError>,
) -> SchedulerEvent {
    match outcome {
        Ok(result) => match &result.error {
            None => SchedulerEvent::Completed {
                job_id,
                source,
                stats: result.stats,
            },
            Some(error) => SchedulerEvent::Failed {
                job_id,
                source,
                error: error.clone(),
            },
        },
        Err(err) => SchedulerEvent::Failed {
            job_id,
            source,
            error: err.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use chrono::TimeZone;
    use hotdeal_adapters::{AdapterError, AdapterRegistry};
    use hotdeal_core::{DealStatus, HotDeal};
    use hotdeal_storage::{FileJobStore, HotDealStore, MemoryHotDealStore, MemoryJobStore};

    use crate::orchestrator::tests::{board_record, ScriptedAdapter};
    use crate::upsert::tests::draft;
    use crate::UpsertEngine;

    fn quick() -> CrawlOptions {
        CrawlOptions {
            max_pages: 1,
            page_delay_ms: 0,
            detail_delay_ms: 0,
            skip_detail: true,
            timeout_ms: None,
            retry_attempts: 0,
            retry_delay_ms: 0,
        }
    }

    async fn scheduler_with(adapters: Vec<Arc<ScriptedAdapter>>, store: Arc<dyn JobStore>) -> CrawlScheduler {
        let mut registry = AdapterRegistry::new();
        for adapter in adapters {
            registry.register(adapter);
        }
        let orchestrator = CrawlOrchestrator::new(
            registry,
            UpsertEngine::new(Arc::new(MemoryHotDealStore::new())),
        );
        CrawlScheduler::load(store, orchestrator, quick()).await.unwrap()
    }

    fn ppomppu_ok() -> Arc<ScriptedAdapter> {
        Arc::new(ScriptedAdapter::new(SiteId::Ppomppu).page(1, Ok(vec![board_record(1), board_record(2)])))
    }

    #[test]
    fn next_run_accepts_minute_and_second_forms() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 5, 0).single().unwrap();
        let five = next_run_after("*/30 * * * *", now).unwrap().unwrap();
        assert_eq!(five, Utc.with_ymd_and_hms(2026, 3, 1, 10, 30, 0).single().unwrap());
        let six = next_run_after("0 0 * * * *", now).unwrap().unwrap();
        assert_eq!(six, Utc.with_ymd_and_hms(2026, 3, 1, 11, 0, 0).single().unwrap());
        assert!(matches!(validate_schedule("every tuesday"), Err(PipelineError::Validation(_))));
        assert_eq!(driver_expression("*/30 * * * *"), "0 */30 * * * *");
        assert_eq!(driver_expression("* * * * * *"), "* * * * * *");
    }

    #[tokio::test]
    async fn add_job_rejects_bad_cron_and_sets_next_run() {
        let scheduler = scheduler_with(vec![], Arc::new(MemoryJobStore::new())).await;
        let err = scheduler
            .add_job(CrawlJob::new("bad", SiteId::Clien, "61 * * * *", true))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));

        let job = scheduler
            .add_job(CrawlJob::new("clien", SiteId::Clien, "*/30 * * * *", true))
            .await
            .unwrap();
        assert!(job.next_run.is_some());
        assert_eq!(scheduler.all_jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn registry_mutations_are_written_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        {
            let scheduler = scheduler_with(vec![], Arc::new(FileJobStore::new(&path))).await;
            scheduler
                .add_job(CrawlJob::new("a", SiteId::Ppomppu, "0 */30 * * * *", true))
                .await
                .unwrap();
            scheduler
                .add_job(CrawlJob::new("b", SiteId::Clien, "0 0 * * * *", true))
                .await
                .unwrap();
            scheduler.toggle_job("a", false).await.unwrap();
            assert!(scheduler.remove_job("b").await.unwrap());
            assert!(!scheduler.remove_job("b").await.unwrap());
        }

        let reopened = scheduler_with(vec![], Arc::new(FileJobStore::new(&path))).await;
        let jobs = reopened.all_jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "a");
        assert!(!jobs[0].enabled);
        assert!(jobs[0].next_run.is_none());
    }

    #[tokio::test]
    async fn toggle_unknown_job_is_not_found() {
        let scheduler = scheduler_with(vec![], Arc::new(MemoryJobStore::new())).await;
        let err = scheduler.toggle_job("missing", true).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[tokio::test]
    async fn jobs_left_running_are_reset_on_load() {
        let store = Arc::new(MemoryJobStore::new());
        let mut stale = CrawlJob::new("stale", SiteId::Ppomppu, "0 * * * *", true);
        stale.status = JobStatus::Running;
        store.put(&stale).await.unwrap();

        let scheduler = scheduler_with(vec![], store.clone()).await;
        assert_eq!(scheduler.get_job("stale").await.unwrap().status, JobStatus::Idle);
        assert_eq!(store.load_all().await.unwrap()[0].status, JobStatus::Idle);
    }

    #[tokio::test]
    async fn manual_run_goes_through_job_lifecycle() {
        let scheduler = scheduler_with(vec![ppomppu_ok()], Arc::new(MemoryJobStore::new())).await;
        scheduler
            .add_job(CrawlJob::new("ppomppu", SiteId::Ppomppu, "*/30 * * * *", false))
            .await
            .unwrap();
        let mut events = scheduler.subscribe();

        let result = scheduler
            .run_manually(SiteId::Ppomppu, &CrawlOverrides::default())
            .await
            .unwrap();
        assert_eq!(result.stats.new_deals, 2);

        let job = scheduler.get_job("ppomppu").await.unwrap();
        assert_eq!(job.status, JobStatus::Idle);
        assert!(job.last_run.is_some());
        assert_eq!(job.last_statistics.unwrap().new_deals, 2);

        assert!(matches!(events.recv().await.unwrap(), SchedulerEvent::Started { .. }));
        assert!(matches!(events.recv().await.unwrap(), SchedulerEvent::Completed { .. }));
    }

    #[tokio::test]
    async fn manual_run_while_running_is_busy() {
        let mut slow = ScriptedAdapter::new(SiteId::Ppomppu).page(1, Ok(vec![board_record(1)]));
        slow.page_latency = Duration::from_millis(300);
        let scheduler = scheduler_with(vec![Arc::new(slow)], Arc::new(MemoryJobStore::new())).await;
        scheduler
            .add_job(CrawlJob::new("ppomppu", SiteId::Ppomppu, "*/30 * * * *", true))
            .await
            .unwrap();

        let first = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .run_manually(SiteId::Ppomppu, &CrawlOverrides::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = scheduler
            .run_manually(SiteId::Ppomppu, &CrawlOverrides::default())
            .await;
        assert!(matches!(second, Err(PipelineError::Busy(_))));
        let during = scheduler.get_job("ppomppu").await.unwrap();
        assert_eq!(during.status, JobStatus::Running);
        assert!(during.last_statistics.is_none());

        first.await.unwrap().unwrap();
        let after = scheduler.get_job("ppomppu").await.unwrap();
        assert_eq!(after.status, JobStatus::Idle);
        assert_eq!(after.last_statistics.unwrap().total_crawled, 1);
    }

    #[tokio::test]
    async fn replacing_a_running_job_keeps_it_running() {
        let mut slow = ScriptedAdapter::new(SiteId::Ppomppu).page(1, Ok(vec![board_record(1)]));
        slow.page_latency = Duration::from_millis(300);
        let scheduler = scheduler_with(vec![Arc::new(slow)], Arc::new(MemoryJobStore::new())).await;
        scheduler
            .add_job(CrawlJob::new("ppomppu", SiteId::Ppomppu, "*/30 * * * *", true))
            .await
            .unwrap();

        let first = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.trigger("ppomppu").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let replaced = scheduler
            .add_job(CrawlJob::new("ppomppu", SiteId::Ppomppu, "0 * * * *", true))
            .await
            .unwrap();
        assert_eq!(replaced.status, JobStatus::Running);
        assert_eq!(scheduler.get_job("ppomppu").await.unwrap().schedule, "0 * * * *");

        assert!(first.await.unwrap().is_some());
        assert_eq!(scheduler.get_job("ppomppu").await.unwrap().status, JobStatus::Idle);
    }

    #[tokio::test]
    async fn skipped_trigger_still_moves_next_run_forward() {
        let mut slow = ScriptedAdapter::new(SiteId::Ppomppu).page(1, Ok(vec![board_record(1)]));
        slow.page_latency = Duration::from_millis(1500);
        let scheduler = scheduler_with(vec![Arc::new(slow)], Arc::new(MemoryJobStore::new())).await;
        scheduler
            .add_job(CrawlJob::new("ppomppu", SiteId::Ppomppu, "* * * * * *", true))
            .await
            .unwrap();

        let first = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .run_manually(SiteId::Ppomppu, &CrawlOverrides::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let before = Utc::now();
        let stale = scheduler.get_job("ppomppu").await.unwrap().next_run.unwrap();
        assert!(stale < before);

        assert!(scheduler.trigger("ppomppu").await.is_none());
        let refreshed = scheduler.get_job("ppomppu").await.unwrap().next_run.unwrap();
        assert!(refreshed > before);

        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unreachable_source_marks_job_failed_and_next_run_recovers() {
        let adapter = Arc::new(
            ScriptedAdapter::new(SiteId::Clien).page(1, Err(AdapterError::Network("down".into()))),
        );
        let scheduler = scheduler_with(vec![adapter], Arc::new(MemoryJobStore::new())).await;
        scheduler
            .add_job(CrawlJob::new("clien", SiteId::Clien, "0 * * * *", true))
            .await
            .unwrap();

        scheduler.trigger("clien").await.unwrap();
        let failed = scheduler.get_job("clien").await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.last_error.is_some());
        assert_eq!(failed.last_statistics.unwrap().errors, 1);

        // page 2 of the board is empty, which counts as a successful fetch
        let recovered = scheduler
            .run_manually(
                SiteId::Clien,
                &CrawlOverrides {
                    max_pages: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(recovered.error.is_none());
        assert_eq!(scheduler.get_job("clien").await.unwrap().status, JobStatus::Idle);
    }

    #[tokio::test]
    async fn trigger_skips_disabled_jobs() {
        let adapter = ppomppu_ok();
        let scheduler = scheduler_with(vec![adapter.clone()], Arc::new(MemoryJobStore::new())).await;
        scheduler
            .add_job(CrawlJob::new("ppomppu", SiteId::Ppomppu, "0 * * * *", false))
            .await
            .unwrap();

        assert!(scheduler.trigger("ppomppu").await.is_none());
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
        assert!(scheduler.trigger("unknown").await.is_none());
    }

    #[tokio::test]
    async fn seed_only_applies_to_an_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let seed = dir.path().join("jobs.yaml");
        tokio::fs::write(
            &seed,
            "jobs:\n  - id: ppomppu-30m\n    source: ppomppu\n    schedule: \"*/30 * * * *\"\n",
        )
        .await
        .unwrap();

        let scheduler = scheduler_with(vec![], Arc::new(MemoryJobStore::new())).await;
        assert_eq!(scheduler.seed_from_yaml(&seed).await.unwrap(), 1);
        assert_eq!(scheduler.seed_from_yaml(&seed).await.unwrap(), 0);
        assert_eq!(scheduler.all_jobs().await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn driver_starts_and_stops() {
        let scheduler = scheduler_with(vec![ppomppu_ok()], Arc::new(MemoryJobStore::new())).await;
        scheduler
            .add_job(CrawlJob::new("ppomppu", SiteId::Ppomppu, "0 0 3 * * *", true))
            .await
            .unwrap();

        scheduler.start().await.unwrap();
        assert!(scheduler.is_running().await);
        scheduler.toggle_job("ppomppu", false).await.unwrap();
        scheduler.shutdown().await.unwrap();
        assert!(!scheduler.is_running().await);
    }

    async fn wait_until<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn driver_fires_registered_jobs() {
        let scheduler = scheduler_with(vec![ppomppu_ok()], Arc::new(MemoryJobStore::new())).await;
        scheduler
            .add_job(CrawlJob::new("ppomppu", SiteId::Ppomppu, "* * * * * *", true))
            .await
            .unwrap();
        scheduler.start().await.unwrap();

        let fired = wait_until(|| {
            let scheduler = scheduler.clone();
            async move {
                scheduler
                    .get_job("ppomppu")
                    .await
                    .is_some_and(|job| job.last_statistics.is_some())
            }
        })
        .await;
        scheduler.shutdown().await.unwrap();

        assert!(fired, "cron driver never ran the job");
        let job = scheduler.get_job("ppomppu").await.unwrap();
        assert!(job.last_run.is_some());
        assert_eq!(job.last_statistics.unwrap().total_crawled, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn driver_runs_the_expiry_sweep() {
        let deals = Arc::new(MemoryHotDealStore::new());
        let mut overdue = draft("1");
        overdue.end_date = Some(Utc::now() - chrono::Duration::hours(1));
        deals
            .insert(HotDeal::from_draft(Uuid::new_v4(), overdue, Utc::now()))
            .await
            .unwrap();

        let scheduler = scheduler_with(vec![], Arc::new(MemoryJobStore::new())).await;
        let engine = ExpiryEngine::new(deals.clone());
        let err = scheduler
            .add_expiry_job("* * * * * *", engine.clone(), ExpiryConfig::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("must be started"));

        scheduler.start().await.unwrap();
        scheduler
            .add_expiry_job("* * * * * *", engine, ExpiryConfig::default())
            .await
            .unwrap();

        let swept = wait_until(|| {
            let deals = deals.clone();
            async move { deals.count_by_status(DealStatus::Ended).await.unwrap_or(0) == 1 }
        })
        .await;
        scheduler.shutdown().await.unwrap();
        assert!(swept, "expiry job never ran");
    }
}
