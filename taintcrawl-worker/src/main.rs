//! # Taintcrawl Worker
//!
//! One crawl worker process. Workers share nothing but the Postgres
//! database; start as many as the crawl needs.
//!
//! Exit codes: `0` after a normal deregistration, `1` when terminated by a
//! signal or on setup/store failure.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use taintcrawl_config::{
    ConfigSource, CrawlerConfig, DatabaseEnv, resolve_database_url,
};
use taintcrawl_core::{
    CommandExecutor, CrawlWorker, EntityStore, ExitReason, SubjectFactory,
    WorkerLifecycle,
};
use taintcrawl_model::{SessionId, WorkerId, WorkerType};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const MAX_CONNECTIONS: u32 = 4;

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "taintcrawl-worker")]
#[command(about = "Distributed crawl worker backed by a shared Postgres store")]
struct Cli {
    /// Config file (TOML or JSON). Defaults to $TAINTCRAWL_CONFIG_PATH,
    /// $TAINTCRAWL_CONFIG_JSON, then ./taintcrawl.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// PostgreSQL connection URL. Falls back to DATABASE_URL_FILE and PG*.
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register a worker and crawl until the work drains
    Run {
        #[arg(long, default_value = "BROWSER")]
        worker_type: WorkerType,
        /// Executor program (overrides executor.program)
        #[arg(long)]
        executor: Option<String>,
        /// Extra executor argument, repeatable (overrides executor.args)
        #[arg(long = "executor-arg")]
        executor_args: Vec<String>,
        /// Analysis module handed to the executor
        #[arg(long)]
        module: Option<String>,
        /// Seconds between polls when no work is available
        #[arg(long)]
        poll_interval: Option<u64>,
        /// Keep polling instead of exiting once the work drains
        #[arg(long, default_value_t = false)]
        forever: bool,
    },
    /// Seed entry points
    Seed {
        /// Addresses to seed. With --session-id and no address, the
        /// session's landing page is seeded.
        urls: Vec<String>,
        #[arg(long)]
        session_id: Option<i64>,
    },
    /// Deregister a worker that died without doing so, resetting its
    /// in-flight subjects
    Deregister {
        #[arg(long)]
        worker_id: i64,
        #[arg(long, default_value = "Deregistered by operator")]
        message: String,
    },
    /// Mark a session as unlocked; its remaining work is skipped
    UnlockSession {
        #[arg(long)]
        session_id: i64,
    },
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> ExitCode {
    let env_loaded = dotenvy::dotenv().is_ok();
    init_tracing();
    if env_loaded {
        info!("loaded .env file");
    }

    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,taintcrawl_core=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = load_config(cli.config.as_deref())?;
    let database_url = database_url(cli.database_url)?;

    if let Command::Migrate = cli.command {
        let store = connect(&database_url, true).await?;
        info!(pool = ?store, "database migrations applied successfully");
        return Ok(ExitCode::SUCCESS);
    }

    let store = connect(&database_url, false).await?;
    match cli.command {
        Command::Run {
            worker_type,
            executor,
            executor_args,
            module,
            poll_interval,
            forever,
        } => {
            let mut config = config;
            if executor.is_some() {
                config.executor.program = executor;
            }
            if !executor_args.is_empty() {
                config.executor.args = executor_args;
            }
            if module.is_some() {
                config.executor.module = module;
            }
            if poll_interval.is_some() {
                config.scheduler.poll_interval_secs = poll_interval;
            }
            config.scheduler.forever |= forever;
            run_worker(store, config, worker_type).await
        }
        Command::Seed { urls, session_id } => {
            let factory = SubjectFactory::new(store, config);
            let session = session_id.map(SessionId);
            if urls.is_empty() {
                factory
                    .seed(None, session)
                    .await
                    .context("failed to seed session landing page")?;
            }
            for url in &urls {
                factory
                    .seed(Some(url), session)
                    .await
                    .with_context(|| format!("failed to seed {url}"))?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Deregister { worker_id, message } => {
            let lifecycle =
                WorkerLifecycle::new(store, config.scheduler.crash_reset);
            let report = lifecycle
                .deregister(WorkerId(worker_id), 0, &message)
                .await
                .context("failed to deregister worker")?;
            println!("{}", serde_json::json!({
                "worker": worker_id,
                "reset": report.reset,
                "released": report.released,
            }));
            Ok(ExitCode::SUCCESS)
        }
        Command::UnlockSession { session_id } => {
            let unlocked = store
                .unlock_session(SessionId(session_id))
                .await
                .context("failed to unlock session")?;
            if !unlocked {
                return Err(anyhow!("session {session_id} does not exist"));
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Migrate => Ok(ExitCode::SUCCESS),
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<CrawlerConfig> {
    let (config, source) = match path {
        Some(path) => (
            CrawlerConfig::load_from_file(path)?,
            ConfigSource::File(path.to_path_buf()),
        ),
        None => CrawlerConfig::load_from_env()
            .context("failed to load configuration")?,
    };
    match &source {
        ConfigSource::Default => info!("using default configuration"),
        ConfigSource::EnvInline => {
            info!("configuration loaded from inline environment json")
        }
        ConfigSource::EnvPath(path) | ConfigSource::File(path) => {
            info!(path = %path.display(), "configuration loaded from file")
        }
    }

    let warnings = config
        .validate()
        .context("configuration rejected by guard rails")?;
    for warning in &warnings.items {
        warn!(message = %warning, "configuration warning");
    }
    Ok(config)
}

fn database_url(explicit: Option<String>) -> anyhow::Result<String> {
    if let Some(url) = explicit.filter(|url| !url.trim().is_empty()) {
        return Ok(url);
    }
    resolve_database_url(&DatabaseEnv::gather())
        .context("failed to resolve database url")?
        .ok_or_else(|| {
            anyhow!("no database configured; set DATABASE_URL or PGHOST/PGUSER/PGDATABASE")
        })
}

async fn connect(database_url: &str, migrate: bool) -> anyhow::Result<EntityStore> {
    if migrate {
        let pool = taintcrawl_core::store::connect_pool(database_url, MAX_CONNECTIONS)
            .await
            .context("failed to connect to PostgreSQL for migration")?;
        EntityStore::migrate(&pool)
            .await
            .context("database migration failed")?;
        return EntityStore::new(pool)
            .await
            .context("schema validation failed after migration");
    }
    EntityStore::connect(database_url, MAX_CONNECTIONS)
        .await
        .context("failed to connect to PostgreSQL")
}

async fn run_worker(
    store: EntityStore,
    config: CrawlerConfig,
    worker_type: WorkerType,
) -> anyhow::Result<ExitCode> {
    let executor =
        CommandExecutor::from_settings(&config.executor, &config.timeouts)
            .context("no subject executor configured")?;
    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let exit = CrawlWorker::new(store, config, executor)
        .run(worker_type, cancel)
        .await
        .context("worker failed")?;
    info!(
        worker = %exit.worker,
        processed = exit.processed,
        reset = exit.recovery.reset,
        released = exit.recovery.released,
        "{}",
        exit.reason.message()
    );
    Ok(match exit.reason {
        ExitReason::Drained => ExitCode::SUCCESS,
        ExitReason::Cancelled => ExitCode::FAILURE,
    })
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("termination signal received, deregistering worker");
        cancel.cancel();
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        ) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
