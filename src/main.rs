use std::sync::Arc;
use anyhow::Context;
use clap::{Parser, Subcommand};
use line_infra::{
    api::{create_router, ApiState},
    collection::collectors::factory_for,
    collection::{CircuitBreakers, CollectorRegistry, CycleScheduler, Orchestrator, OrchestratorSettings, RateLimiter},
    config::{AppConfig, BreakerConfig},
    health::{HealthDetector, HealthMonitor},
    observability::{metrics::register_metrics, tracing::init_tracing},
    staging::StagingIngestor,
    storage,
    types::timestamp::{Clock, SystemClock, Timestamp},
    utils::task_supervisor::TaskSupervisor,
};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

/// Odds-feed collection and staging service
#[derive(Parser, Debug)]
#[command(name = "line_infra", version, about, long_about = None)]
struct Cli {
    /// Configuration file; defaults to config/default plus config/<env>
    #[arg(short, long, env = "LINE_INFRA_CONFIG")]
    config: Option<String>,

    /// Environment overlay loaded after config/default
    #[arg(long, default_value = "development", env = "LINE_INFRA_ENV")]
    env: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler, health monitor and admin API until interrupted
    Serve,
    /// Run one collection cycle and print its report
    Cycle {
        /// Restrict the cycle to these sources (names or aliases)
        #[arg(long = "source")]
        sources: Vec<String>,
    },
    /// Print collection gaps for a source
    Gaps {
        source: String,
        /// RFC 3339 start of the window; defaults to the health lookback
        #[arg(long)]
        since: Option<String>,
    },
    /// Validate configuration and print the effective settings
    CheckConfig,
}

struct Components {
    orchestrator: Orchestrator,
    detector: Arc<HealthDetector>,
}

fn build(config: &AppConfig) -> anyhow::Result<Components> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (staging, history) = storage::open(&config.storage).context("opening storage")?;

    let orchestrator = Orchestrator::new(
        Arc::new(CollectorRegistry::new()),
        Arc::new(RateLimiter::new(clock.clone())),
        Arc::new(CircuitBreakers::new(BreakerConfig::default(), clock.clone())),
        Arc::new(StagingIngestor::new(staging.clone(), config.orchestrator.staging_write_timeout)),
        history.clone(),
        clock.clone(),
        OrchestratorSettings::from(&config.orchestrator),
    );
    for source in config.enabled_sources() {
        orchestrator
            .register_source(source, factory_for(source))
            .with_context(|| format!("registering source {}", source.name))?;
    }

    let detector = Arc::new(HealthDetector::new(
        Arc::clone(orchestrator.registry()),
        Arc::clone(orchestrator.breakers()),
        history,
        staging,
        clock,
        config.health.clone(),
    ));
    Ok(Components { orchestrator, detector })
}

fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let config = match &cli.config {
        Some(path) => AppConfig::load_file(path),
        None => AppConfig::load(&cli.env),
    };
    config.context("loading configuration")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(&config.logging);
    register_metrics().context("registering metrics")?;

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Cycle { sources } => {
            let components = build(&config)?;
            let sources = (!sources.is_empty()).then_some(sources);
            let report = components.orchestrator.run_cycle(sources.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            let status = report.status();
            tracing::info!(status = status.as_str(), "Cycle complete");
            std::process::exit(status.exit_code());
        }
        Command::Gaps { source, since } => {
            let components = build(&config)?;
            let since = match since {
                Some(raw) => Timestamp::parse(&raw).with_context(|| format!("invalid --since {}", raw))?,
                None => Timestamp::now().saturating_sub(config.health.lookback),
            };
            let gaps = components.detector.detect_gaps(&source, since).await?;
            println!("{}", serde_json::to_string_pretty(&gaps)?);
            Ok(())
        }
        Command::CheckConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
            tracing::info!(sources = config.sources.len(), "Configuration is valid");
            Ok(())
        }
    }
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let components = build(&config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut supervisor = TaskSupervisor::new();

    let (scheduler, scheduler_handle) = CycleScheduler::new(components.orchestrator.clone(), config.orchestrator.cycle_interval);
    supervisor.spawn("cycle_scheduler", scheduler.run(shutdown_rx.clone()));

    let monitor = Arc::new(HealthMonitor::new(Arc::clone(&components.detector)));
    let monitor_rx = shutdown_rx.clone();
    supervisor.spawn("health_monitor", async move { monitor.run(monitor_rx).await });

    let state = Arc::new(ApiState {
        orchestrator: components.orchestrator.clone(),
        detector: components.detector,
        scheduler: scheduler_handle,
    });
    let router = create_router(state).layer(TraceLayer::new_for_http());
    let listener = tokio::net::TcpListener::bind(&config.api.bind)
        .await
        .with_context(|| format!("binding {}", config.api.bind))?;
    tracing::info!("Admin API listening on {}", config.api.bind);

    let mut api_rx = shutdown_rx.clone();
    supervisor.spawn("admin_api", async move {
        let shutdown = async move {
            while api_rx.changed().await.is_ok() {
                if *api_rx.borrow() {
                    break;
                }
            }
        };
        if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(shutdown).await {
            tracing::error!("Admin API stopped: {}", e);
        }
    });

    let mut health_tick = tokio::time::interval(config.health.check_interval);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown requested");
                break;
            }
            _ = health_tick.tick() => {
                if let Err(e) = supervisor.check_health().await {
                    tracing::error!("Background task died: {}", e);
                    break;
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(config.orchestrator.cycle_deadline, supervisor.join_all()).await {
        Ok(joined) => joined?,
        Err(_) => {
            tracing::warn!("Background tasks did not stop within the cycle deadline, aborting");
            supervisor.shutdown_all().await;
        }
    }
    tracing::info!("Stopped");
    Ok(())
}
