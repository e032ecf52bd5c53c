use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use hotdeal_core::SiteId;
use hotdeal_storage::{BackoffPolicy, HttpClientConfig};
use serde::Deserialize;

use crate::CrawlOptions;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: Option<String>,
    pub fixtures_dir: PathBuf,
    pub jobs_file: PathBuf,
    pub jobs_seed: PathBuf,
    pub scheduler_enabled: bool,
    pub expiry_cron: String,
    pub max_pages: u32,
    pub page_delay_ms: u64,
    pub detail_delay_ms: u64,
    pub crawl_timeout_secs: u64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub google_api_key: Option<String>,
    pub bind_addr: String,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: env_nonempty("DATABASE_URL"),
            fixtures_dir: std::env::var("HOTDEAL_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./fixtures")),
            jobs_file: std::env::var("HOTDEAL_JOBS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/jobs.json")),
            jobs_seed: std::env::var("HOTDEAL_JOBS_SEED")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./jobs.yaml")),
            scheduler_enabled: std::env::var("HOTDEAL_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            expiry_cron: std::env::var("HOTDEAL_EXPIRY_CRON")
                .unwrap_or_else(|_| "0 0 * * * *".to_string()),
            max_pages: env_parse("HOTDEAL_MAX_PAGES", 2),
            page_delay_ms: env_parse("HOTDEAL_PAGE_DELAY_MS", 3000),
            detail_delay_ms: env_parse("HOTDEAL_DETAIL_DELAY_MS", 1000),
            crawl_timeout_secs: env_parse("HOTDEAL_CRAWL_TIMEOUT_SECS", 600),
            http_timeout_secs: env_parse("HOTDEAL_HTTP_TIMEOUT_SECS", 20),
            user_agent: std::env::var("HOTDEAL_USER_AGENT")
                .unwrap_or_else(|_| "hotdeal-bot/0.1".to_string()),
            google_api_key: env_nonempty("GOOGLE_TRANSLATE_API_KEY"),
            bind_addr: std::env::var("HOTDEAL_BIND_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
        }
    }

    /// Crawl options used by scheduled runs and as the base for manual ones.
    pub fn crawl_options(&self) -> CrawlOptions {
        CrawlOptions {
            max_pages: self.max_pages,
            page_delay_ms: self.page_delay_ms,
            detail_delay_ms: self.detail_delay_ms,
            timeout_ms: (self.crawl_timeout_secs > 0).then(|| self.crawl_timeout_secs * 1000),
            ..CrawlOptions::default()
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            max_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Default jobs registered on first start.
#[derive(Debug, Clone, Deserialize)]
pub struct JobsSeedFile {
    #[serde(default)]
    pub jobs: Vec<JobSeed>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobSeed {
    pub id: String,
    pub source: SiteId,
    pub schedule: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl JobsSeedFile {
    pub async fn load(path: &Path) -> anyhow::Result<Option<Self>> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        let parsed = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(parsed))
    }
}
