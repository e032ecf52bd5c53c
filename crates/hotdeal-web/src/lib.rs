//! JSON admin API over the job scheduler, expiry engine and translations.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use hotdeal_core::{CrawlJob, HotDeal, Language, SiteId, Translation, TranslationStatus};
use hotdeal_sync::{
    CrawlOverrides, CrawlScheduler, ExpiryConfig, ExpiryEngine, Pipeline, PipelineError,
    TranslationCoordinator,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: CrawlScheduler,
    pub expiry: ExpiryEngine,
    pub translator: TranslationCoordinator,
}

impl AppState {
    pub fn new(scheduler: CrawlScheduler, expiry: ExpiryEngine, translator: TranslationCoordinator) -> Self {
        Self {
            scheduler,
            expiry,
            translator,
        }
    }

    pub fn from_pipeline(pipeline: &Pipeline) -> Self {
        Self::new(
            pipeline.scheduler.clone(),
            pipeline.expiry.clone(),
            pipeline.translator.clone(),
        )
    }
}

/// Maps the pipeline error taxonomy onto HTTP status codes.
#[derive(Debug)]
pub struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PipelineError::Validation(_) | PipelineError::Parse(_) => StatusCode::BAD_REQUEST,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::Conflict(_) | PipelineError::Busy(_) => StatusCode::CONFLICT,
            PipelineError::Network(_)
            | PipelineError::TranslationBackend(_)
            | PipelineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/jobs", get(list_jobs_handler).post(add_job_handler))
        .route(
            "/api/jobs/{id}",
            get(get_job_handler).put(toggle_job_handler).delete(remove_job_handler),
        )
        .route("/api/crawl/{source}", post(crawl_handler))
        .route("/api/expiry/stats", get(expiry_stats_handler))
        .route("/api/expiry/run", post(expiry_run_handler))
        .route("/api/expiry/soon", get(expiring_soon_handler))
        .route("/api/hotdeals/{id}/extend", post(extend_handler))
        .route("/api/hotdeals/{id}/reactivate", post(reactivate_handler))
        .route("/api/hotdeals/{id}/translations", get(translations_handler))
        .route("/api/hotdeals/{id}/translations/{lang}", get(translation_handler))
        .with_state(Arc::new(state))
}

pub async fn serve<F>(bind_addr: &str, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(bind_addr).await?;
    info!(addr = %listener.local_addr()?, "http server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Empty bodies fall back to `T::default()`.
fn body_or_default<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    body_required(body)
}

fn body_required<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|err| ApiError(PipelineError::Validation(format!("invalid request body: {err}"))))
}

fn parse_path<T>(raw: &str, what: &str) -> Result<T, ApiError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|err| ApiError(PipelineError::Validation(format!("invalid {what} {raw:?}: {err}"))))
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_jobs_handler(State(state): State<Arc<AppState>>) -> Json<Vec<CrawlJob>> {
    Json(state.scheduler.all_jobs().await)
}

#[derive(Debug, Deserialize)]
struct NewJob {
    id: String,
    source: SiteId,
    schedule: String,
    #[serde(default = "enabled_default")]
    enabled: bool,
}

fn enabled_default() -> bool {
    true
}

async fn add_job_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Response, ApiError> {
    let new: NewJob = body_required(&body)?;
    let job = state
        .scheduler
        .add_job(CrawlJob::new(new.id, new.source, new.schedule, new.enabled))
        .await?;
    Ok((StatusCode::CREATED, Json(job)).into_response())
}

async fn get_job_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<CrawlJob> {
    state
        .scheduler
        .get_job(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError(PipelineError::NotFound(format!("job {id}"))))
}

#[derive(Debug, Deserialize)]
struct ToggleBody {
    enabled: bool,
}

async fn toggle_job_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<CrawlJob> {
    let toggle: ToggleBody = body_required(&body)?;
    Ok(Json(state.scheduler.toggle_job(&id, toggle.enabled).await?))
}

async fn remove_job_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    if state.scheduler.remove_job(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError(PipelineError::NotFound(format!("job {id}"))))
    }
}

async fn crawl_handler(
    State(state): State<Arc<AppState>>,
    Path(source): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let source: SiteId = parse_path(&source, "source")?;
    let overrides: CrawlOverrides = body_or_default(&body)?;
    let result = state.scheduler.run_manually(source, &overrides).await?;
    Ok(Json(result).into_response())
}

async fn expiry_stats_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let stats = state.expiry.statistics(Utc::now()).await?;
    Ok(Json(stats).into_response())
}

async fn expiry_run_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Response, ApiError> {
    let config: ExpiryConfig = body_or_default(&body)?;
    let report = state.expiry.process_expired_deals(&config).await?;
    Ok(Json(report).into_response())
}

#[derive(Debug, Deserialize)]
struct ExpiringSoonQuery {
    #[serde(default = "expiring_soon_hours")]
    hours: i64,
    #[serde(default = "expiring_soon_limit")]
    limit: usize,
}

fn expiring_soon_hours() -> i64 {
    24
}

fn expiring_soon_limit() -> usize {
    50
}

async fn expiring_soon_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ExpiringSoonQuery>,
) -> ApiResult<Vec<HotDeal>> {
    let deals = state
        .expiry
        .expiring_soon(Utc::now(), query.hours, query.limit)
        .await?;
    Ok(Json(deals))
}

#[derive(Debug, Deserialize)]
struct HoursBody {
    hours: i64,
}

async fn extend_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let id: Uuid = parse_path(&id, "hot deal id")?;
    let HoursBody { hours } = body_required(&body)?;
    Ok(Json(state.expiry.extend_expiry(id, hours).await?).into_response())
}

async fn reactivate_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let id: Uuid = parse_path(&id, "hot deal id")?;
    let HoursBody { hours } = body_required(&body)?;
    Ok(Json(state.expiry.reactivate(id, hours).await?).into_response())
}

#[derive(Debug, Serialize)]
struct TranslationsView {
    statuses: BTreeMap<Language, TranslationStatus>,
    translations: Vec<Translation>,
}

async fn translations_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<TranslationsView> {
    let id: Uuid = parse_path(&id, "hot deal id")?;
    let statuses = state.translator.translation_status(id).await?;
    let translations = state.translator.list_translations(id).await?;
    Ok(Json(TranslationsView {
        statuses,
        translations,
    }))
}

async fn translation_handler(
    State(state): State<Arc<AppState>>,
    Path((id, lang)): Path<(String, String)>,
) -> ApiResult<Translation> {
    let id: Uuid = parse_path(&id, "hot deal id")?;
    let language: Language = parse_path(&lang, "language")?;
    Ok(Json(state.translator.get_or_create(id, language).await?))
}
