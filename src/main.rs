//! Job service
//!
//! Entry point of the job service worker and its operator commands.

mod cli;
mod demo_jobs;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use jobservice_config::{Backend, Config, ConfigLoader, ConfigValidator, LoggerConfig};
use jobservice_kv::{KvStore, MemoryKv, RedisKv};
use jobservice_pool::{Controller, JobLogSweeper, JobLoggerFactory, PoolConfig, WorkerPool};
use jobservice_protocols::{JobActionRequest, JobKind, JobMetadata, JobRequest, Parameters};

use cli::{Cli, Commands};
use demo_jobs::{DEMO, DemoJob, SAMPLE_FAIL, SampleFailJob};

/// Initialize tracing with console and daily rotated file output.
fn init_tracing(config: &LoggerConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.dir)
        .with_context(|| format!("Failed to create log directory {}", config.dir))?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("jobservice")
        .filename_suffix("log")
        .max_log_files(14)
        .build(&config.dir)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    Ok(())
}

/// Load the configuration file, falling back to defaults when it is absent.
fn load_config(path: &Path) -> anyhow::Result<(Config, bool)> {
    if !path.exists() {
        return Ok((Config::default(), false));
    }
    let config = ConfigLoader::load(path)
        .with_context(|| format!("Failed to load configuration {}", path.display()))?;
    Ok((config, true))
}

async fn connect(config: &Config) -> anyhow::Result<Arc<dyn KvStore>> {
    let kv: Arc<dyn KvStore> = match config.worker_pool.backend {
        Backend::Redis => Arc::new(
            RedisKv::connect(&config.worker_pool.redis.url)
                .await
                .with_context(|| format!("Failed to connect to {}", config.worker_pool.redis.url))?,
        ),
        Backend::Memory => {
            warn!("Using the in-memory backend, state is lost on exit");
            Arc::new(MemoryKv::new())
        }
    };
    Ok(kv)
}

/// Build the pool with the bundled jobs registered.
async fn build_pool(config: &Config, workers: Option<usize>) -> anyhow::Result<Arc<WorkerPool>> {
    let kv = connect(config).await?;
    let level: Level = config
        .job_logger
        .level
        .parse()
        .with_context(|| format!("Invalid job log level '{}'", config.job_logger.level))?;
    let loggers = JobLoggerFactory::new(&config.job_logger.base_dir, level);

    let pool = WorkerPool::new(
        kv,
        &config.worker_pool.redis.namespace,
        loggers,
        PoolConfig::with_workers(workers.unwrap_or(config.worker_pool.workers)),
    )?;
    pool.register_job(DEMO, Arc::new(DemoJob::new(Duration::from_secs(1))))?;
    pool.register_job(SAMPLE_FAIL, Arc::new(SampleFailJob))?;
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (config, found) = load_config(&cli.config)?;
    init_tracing(&config.logger)?;
    if !found {
        warn!(
            "Configuration {} not found, using defaults",
            cli.config.display()
        );
    }

    match cli.command.unwrap_or(Commands::Run { workers: None }) {
        Commands::Run { workers } => run(&config, workers).await,
        Commands::Launch {
            name,
            params,
            delay,
            cron,
            unique,
            hook,
        } => {
            let parameters: Parameters =
                serde_json::from_str(&params).context("Parameters must be a JSON object")?;
            let kind = match (&delay, &cron) {
                (_, Some(_)) => JobKind::Periodic,
                (Some(_), None) => JobKind::Scheduled,
                (None, None) => JobKind::Generic,
            };
            let mut request = JobRequest::generic(name, parameters).with_metadata(JobMetadata {
                kind,
                schedule_delay: delay,
                cron_spec: cron,
                unique,
            });
            if let Some(url) = hook {
                request = request.with_status_hook(url);
            }
            launch(&config, request).await
        }
        Commands::Action { job_id, action } => {
            with_controller(&config, |controller| async move {
                controller
                    .handle_action(&job_id, &JobActionRequest { action })
                    .await?;
                println!("ok");
                Ok(())
            })
            .await
        }
        Commands::Get { job_id } => {
            with_controller(&config, |controller| async move {
                let stats = controller.get_job(&job_id).await?;
                println!("{}", serde_json::to_string_pretty(&stats)?);
                Ok(())
            })
            .await
        }
        Commands::Status => {
            with_controller(&config, |controller| async move {
                let pools = controller.check_status().await?;
                println!("{}", serde_json::to_string_pretty(&pools)?);
                Ok(())
            })
            .await
        }
        Commands::Sweep => sweep(&config).await,
        Commands::ValidateConfig => validate_config(&config),
    }
}

/// Run the worker pool until Ctrl-C.
async fn run(config: &Config, workers: Option<usize>) -> anyhow::Result<()> {
    info!("Starting job service v{}", env!("CARGO_PKG_VERSION"));
    for warning in ConfigValidator::validate(config).into_result()? {
        warn!("Configuration {}: {}", warning.path, warning.message);
    }
    let pool = build_pool(config, workers).await?;
    let _controller = Controller::new(Arc::clone(&pool));
    let cancel = CancellationToken::new();

    JobLogSweeper::new(
        &config.job_logger.base_dir,
        config.job_logger.sweeper_duration_days,
    )
    .start(cancel.clone());

    pool.start(cancel.clone()).await?;
    info!(
        pool_id = %pool.id(),
        namespace = %config.worker_pool.redis.namespace,
        "Job service is running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down, waiting for in-flight jobs");
    cancel.cancel();
    pool.wait().await;
    Ok(())
}

/// Run `f` against a controller whose stats writer is running.
async fn with_controller<F, Fut>(config: &Config, f: F) -> anyhow::Result<()>
where
    F: FnOnce(Arc<Controller>) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>>,
{
    let pool = build_pool(config, None).await?;
    let cancel = CancellationToken::new();
    pool.stats_manager().start(cancel.clone())?;
    let controller = Controller::new(Arc::clone(&pool));

    let result = f(controller).await;
    pool.stats_manager().sync().await;
    cancel.cancel();
    result
}

async fn launch(config: &Config, request: JobRequest) -> anyhow::Result<()> {
    with_controller(config, |controller| async move {
        let stats = controller.launch_job(request).await?;
        println!("{}", serde_json::to_string_pretty(&stats)?);
        Ok(())
    })
    .await
}

async fn sweep(config: &Config) -> anyhow::Result<()> {
    with_controller(config, |controller| async move {
        let entries = controller.pool().sweep_outdated().await?;
        let logs = JobLogSweeper::new(
            &config.job_logger.base_dir,
            config.job_logger.sweeper_duration_days,
        )
        .sweep(SystemTime::now())
        .await?;
        println!(
            "Removed {} outdated delayed entr(ies) and {} job log(s)",
            entries, logs
        );
        Ok(())
    })
    .await
}

fn validate_config(config: &Config) -> anyhow::Result<()> {
    let warnings = ConfigValidator::validate(config).into_result()?;
    for warning in &warnings {
        println!("warning: {}: {}", warning.path, warning.message);
    }
    println!("Configuration is valid");
    Ok(())
}
