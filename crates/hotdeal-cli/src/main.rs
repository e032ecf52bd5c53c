use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hotdeal_core::{CrawlJob, SiteId};
use hotdeal_sync::{CrawlOverrides, ExpiryConfig, Pipeline, PipelineConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "hotdeal-cli")]
#[command(about = "Hotdeal ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl one or more sources once.
    Crawl {
        /// Sources to crawl; every registered source when omitted.
        #[arg(long = "source")]
        sources: Vec<SiteId>,
        #[arg(long)]
        pages: Option<u32>,
        #[arg(long)]
        concurrent: bool,
        #[arg(long)]
        skip_detail: bool,
    },
    /// End deals past their end date.
    Expire {
        #[arg(long)]
        dry_run: bool,
        #[arg(long, default_value_t = 500)]
        batch_size: usize,
        #[arg(long, default_value_t = 24)]
        warning_hours: i64,
    },
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },
    /// HTTP API plus the cron scheduler and the hourly expiry sweep.
    Serve,
    Migrate,
}

#[derive(Debug, Subcommand)]
enum JobsCommand {
    List,
    Add {
        #[arg(long)]
        id: String,
        #[arg(long)]
        source: SiteId,
        #[arg(long)]
        schedule: String,
        #[arg(long)]
        disabled: bool,
    },
    Toggle {
        id: String,
        #[arg(long, action = clap::ArgAction::Set)]
        enabled: bool,
    },
    Remove {
        id: String,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hotdeal_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Crawl {
            sources,
            pages,
            concurrent,
            skip_detail,
        } => {
            let pipeline = Pipeline::from_config(config).await?;
            let sources = if sources.is_empty() {
                pipeline.orchestrator.sources()
            } else {
                sources
            };
            let options = CrawlOverrides {
                max_pages: pages,
                skip_detail: skip_detail.then_some(true),
                ..CrawlOverrides::default()
            }
            .apply(&pipeline.config.crawl_options());

            let outcomes = pipeline
                .orchestrator
                .crawl_many(&sources, &options, concurrent)
                .await;
            for outcome in &outcomes {
                match &outcome.result {
                    Some(result) => println!(
                        "crawl {}: total={} new={} updated={} errors={} duration_ms={}{}",
                        outcome.source,
                        result.stats.total_crawled,
                        result.stats.new_deals,
                        result.stats.updated_deals,
                        result.stats.errors,
                        result.stats.duration_ms,
                        result
                            .error
                            .as_deref()
                            .map(|e| format!(" error={e}"))
                            .unwrap_or_default(),
                    ),
                    None => println!(
                        "crawl {}: failed: {}",
                        outcome.source,
                        outcome.error.as_deref().unwrap_or("unknown error")
                    ),
                }
            }
            let failed = outcomes.iter().filter(|o| !o.succeeded).count();
            println!("crawl complete: sources={} failed={failed}", outcomes.len());
        }
        Commands::Expire {
            dry_run,
            batch_size,
            warning_hours,
        } => {
            let pipeline = Pipeline::from_config(config).await?;
            let report = pipeline
                .expiry
                .process_expired_deals(&ExpiryConfig {
                    dry_run,
                    batch_size,
                    warning_hours,
                })
                .await?;
            println!(
                "expiry complete: checked={} expired={} expiring_soon={} errors={} dry_run={dry_run}",
                report.total_checked, report.expired, report.expiring_soon, report.errors
            );
        }
        Commands::Jobs { command } => {
            let pipeline = Pipeline::from_config(config).await?;
            run_jobs_command(&pipeline, command).await?;
        }
        Commands::Serve => serve(config).await?,
        Commands::Migrate => match &config.database_url {
            Some(url) => {
                hotdeal_storage::connect_and_migrate(url).await?;
                println!("migrations applied");
            }
            None => eprintln!("DATABASE_URL is not set; the in-memory store needs no migrations"),
        },
    }

    Ok(())
}

async fn run_jobs_command(pipeline: &Pipeline, command: JobsCommand) -> Result<()> {
    let scheduler = &pipeline.scheduler;
    match command {
        JobsCommand::List => {
            for job in scheduler.all_jobs().await {
                println!(
                    "{}\t{}\t{}\tenabled={}\tstatus={:?}\tnext_run={}",
                    job.id,
                    job.source,
                    job.schedule,
                    job.enabled,
                    job.status,
                    job.next_run.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()),
                );
            }
        }
        JobsCommand::Add {
            id,
            source,
            schedule,
            disabled,
        } => {
            let job = scheduler
                .add_job(CrawlJob::new(id, source, schedule, !disabled))
                .await?;
            println!("job {} added", job.id);
        }
        JobsCommand::Toggle { id, enabled } => {
            let job = scheduler.toggle_job(&id, enabled).await?;
            println!("job {} enabled={}", job.id, job.enabled);
        }
        JobsCommand::Remove { id } => {
            if scheduler.remove_job(&id).await? {
                println!("job {id} removed");
            } else {
                println!("job {id} not found");
            }
        }
    }
    Ok(())
}

async fn serve(config: PipelineConfig) -> Result<()> {
    let pipeline = Pipeline::from_config(config).await?;
    let scheduler = pipeline.scheduler.clone();

    if pipeline.config.scheduler_enabled {
        scheduler.start().await?;
        scheduler
            .add_expiry_job(
                &pipeline.config.expiry_cron,
                pipeline.expiry.clone(),
                ExpiryConfig::default(),
            )
            .await?;
    } else {
        info!("HOTDEAL_SCHEDULER_ENABLED is off; jobs only run on demand");
    }

    let state = hotdeal_web::AppState::from_pipeline(&pipeline);
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    };
    hotdeal_web::serve(&pipeline.config.bind_addr, state, shutdown)
        .await
        .context("running http server")?;

    scheduler.shutdown().await
}
