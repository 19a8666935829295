//! # Leadflow: lead engagement engine
//!
//! Usage:
//!   leadflow serve                  # Gateway + dispatch loop (default port 3100)
//!   leadflow serve --no-dispatcher  # Gateway only, dispatch runs elsewhere
//!   leadflow worker                 # Dispatch loop only (scale horizontally)
//!   leadflow dispatch-once          # One cycle, print the report, exit
//!   leadflow init-config            # Write a default config file

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use leadflow_core::LeadflowConfig;
use leadflow_engine::{
    DispatchWorker, LeadEngine, RateLimiter, SequenceStore, UnsubscribeLinks, spawn_dispatcher,
};
use leadflow_gateway::AppState;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "leadflow", version, about = "📬 Leadflow: lead scoring and sequenced outreach")]
struct Cli {
    /// Config file (default: ~/.leadflow/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON log lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP gateway and, unless disabled, the dispatch loop
    Serve {
        /// Gateway port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Do not run the dispatch loop in this process
        #[arg(long)]
        no_dispatcher: bool,
    },
    /// Run only the dispatch loop
    Worker,
    /// Run a single dispatch cycle and print its report
    DispatchOnce,
    /// Write the default configuration file and exit
    InitConfig,
}

fn init_logging(verbose: bool, json: bool) {
    let default = if verbose {
        "leadflow=debug,leadflow_engine=debug,leadflow_channels=debug,leadflow_gateway=debug,tower_http=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .as_deref()
        .map(|p| PathBuf::from(shellexpand::tilde(p).to_string()))
        .unwrap_or_else(LeadflowConfig::default_path)
}

fn load_config(path: &std::path::Path) -> Result<LeadflowConfig> {
    let mut config = if path.exists() {
        LeadflowConfig::load_from(path)?
    } else {
        tracing::info!("No config at {}, using defaults", path.display());
        LeadflowConfig::default()
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

/// Everything a process needs, wired from one config.
struct Runtime {
    engine: Arc<LeadEngine>,
    worker: Arc<DispatchWorker>,
    links: UnsubscribeLinks,
}

fn build_runtime(config: &LeadflowConfig) -> Result<Runtime> {
    let db_path = config.database_path();
    let store = Arc::new(
        SequenceStore::open(&db_path)
            .with_context(|| format!("opening database {}", db_path.display()))?,
    );
    tracing::info!("💾 Database: {}", db_path.display());

    let provider = leadflow_channels::build_provider(
        &config.delivery,
        Duration::from_secs(config.dispatch.send_timeout_secs),
    )?;
    let links = UnsubscribeLinks::new(&config.gateway.public_base_url, &config.unsubscribe.secret)?;
    let limiter = RateLimiter::from_config(store.clone(), &config.rate_limit);
    let worker = DispatchWorker::new(
        store.clone(),
        provider,
        limiter,
        links.clone(),
        config.dispatch.clone(),
    );

    Ok(Runtime {
        engine: Arc::new(LeadEngine::new(store)),
        worker: Arc::new(worker),
        links,
    })
}

fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("🛑 Shutdown requested");
        }
        let _ = tx.send(true);
    });
    rx
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    let path = config_path(&cli);
    let command = cli.command.unwrap_or(Command::Serve {
        port: None,
        no_dispatcher: false,
    });

    if let Command::InitConfig = command {
        if path.exists() {
            println!("⚠️  Config already exists: {}", path.display());
        } else {
            LeadflowConfig::default().save_to(&path)?;
            println!("✅ Wrote default config to {}", path.display());
        }
        return Ok(());
    }

    let mut config = load_config(&path)?;
    let runtime = build_runtime(&config)?;

    match command {
        Command::DispatchOnce => {
            let report = runtime.worker.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Worker => {
            let shutdown = shutdown_on_ctrl_c();
            spawn_dispatcher(runtime.worker, config.dispatch.interval_secs, shutdown).await;
        }
        Command::Serve {
            port,
            no_dispatcher,
        } => {
            if let Some(port) = port {
                config.gateway.port = port;
            }
            let shutdown = shutdown_on_ctrl_c();
            let retrier = runtime.engine.spawn_retrier();

            let dispatcher = (!no_dispatcher).then(|| {
                tokio::spawn(spawn_dispatcher(
                    runtime.worker.clone(),
                    config.dispatch.interval_secs,
                    shutdown.clone(),
                ))
            });

            let state = AppState {
                gateway_config: config.gateway.clone(),
                engine: runtime.engine,
                dispatcher: runtime.worker,
                links: runtime.links,
                start_time: std::time::Instant::now(),
            };
            leadflow_gateway::start_server(state, shutdown).await?;

            if let Some(handle) = dispatcher {
                let _ = handle.await;
            }
            if let Some(handle) = retrier {
                handle.abort();
            }
        }
        Command::InitConfig => {}
    }

    Ok(())
}
