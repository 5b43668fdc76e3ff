//! vigil CLI entry point. Three subcommands — `run`, `config validate`,
//! `state inspect` — dispatched from a single `match` the way the teacher's
//! `main` dispatches `Commands` into free functions, rather than a
//! multi-crate `cmd/` module tree.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer};

use vigil::audit::AuditLogger;
use vigil::config::Settings;
use vigil::coordinator::ReviewCoordinator;
use vigil::decision::SystemClock;
use vigil::features::audit_log::AuditLogFeature;
use vigil::features::auto_description::AutoDescriptionFeature;
use vigil::features::auto_label::AutoLabelFeature;
use vigil::features::jira::JiraFeature;
use vigil::features::slack::SlackFeature;
use vigil::features::{Feature, FeatureRunner};
use vigil::forge::github::GithubForgeClient;
use vigil::forge::ForgeClient;
use vigil::llm::LlmClient;
use vigil::metrics::MetricsCollector;
use vigil::poller::{PollerLoop, StopFlag};
use vigil::ratelimit::RateLimitGuard;
use vigil::startup::StartupRecovery;
use vigil::state::StateStore;
use vigil::webhook::{self, WebhookState};
use vigil::worktree::WorktreeManager;

#[derive(Parser)]
#[command(name = "vigil")]
#[command(version, about = "Autonomous code-review agent for hosted-forge pull requests")]
struct Cli {
    /// Path to the vigil.toml config file.
    #[arg(long, global = true, default_value = "vigil.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the poller and/or webhook ingress per the configured mode.
    Run,
    /// Configuration inspection.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Persisted-state inspection.
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Load the config (file + env overrides) and report whether it's valid.
    Validate,
}

#[derive(Subcommand)]
enum StateCommands {
    /// Print per-status counts from the persisted state file.
    Inspect,
}

/// Initializes the global subscriber: stdout always, plus an optional
/// rolling file sink (`VIGIL_LOG_DIR`) and an optional OTLP exporter (the
/// `otlp` feature, `VIGIL_OTLP_ENDPOINT`) layered on top the way the
/// teacher's CLI composes its subscriber before dispatching commands.
/// The returned guard must be held for the process lifetime — dropping it
/// stops the non-blocking file writer from flushing.
fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false).with_filter(env_filter());

    let (file_layer, guard) = match std::env::var("VIGIL_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "vigil.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false).with_filter(env_filter());
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    let registry = tracing_subscriber::registry().with(stdout_layer).with(file_layer);

    #[cfg(feature = "otlp")]
    {
        if let Ok(endpoint) = std::env::var("VIGIL_OTLP_ENDPOINT") {
            match build_otlp_layer(&endpoint) {
                Ok(otel_layer) => {
                    registry.with(otel_layer.with_filter(env_filter())).init();
                    return guard;
                }
                Err(e) => {
                    eprintln!("failed to initialize OTLP exporter at {endpoint}: {e:#}; continuing without it");
                }
            }
        }
    }

    registry.init();
    guard
}

#[cfg(feature = "otlp")]
fn build_otlp_layer<S>(endpoint: &str) -> Result<impl tracing_subscriber::Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    use opentelemetry_otlp::WithExportConfig;

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint))
        .install_batch(opentelemetry_sdk::runtime::Tokio)
        .context("failed to install OTLP trace pipeline")?;
    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = init_logging();
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Run => cmd_run(&cli.config).await,
        Commands::Config { command: ConfigCommands::Validate } => cmd_config_validate(&cli.config),
        Commands::State { command: StateCommands::Inspect } => cmd_state_inspect(&cli.config).await,
    };

    if let Err(e) = &result {
        error!(error = %e, "vigil exited with a fatal error");
    }
    result
}

fn load_settings(config_path: &PathBuf) -> Result<Settings> {
    let _ = dotenvy::dotenv();
    Settings::load(config_path).context("failed to load configuration")
}

fn cmd_config_validate(config_path: &PathBuf) -> Result<()> {
    match load_settings(config_path) {
        Ok(settings) => {
            println!("Configuration is valid.");
            let redacted = settings.redacted();
            println!("{}", serde_json::to_string_pretty(&redacted)?);
            Ok(())
        }
        Err(e) => {
            println!("Configuration is invalid: {e:#}");
            Err(e)
        }
    }
}

async fn cmd_state_inspect(config_path: &PathBuf) -> Result<()> {
    let settings = load_settings(config_path)?;
    let state = StateStore::load(&settings.operational.state_file).await;
    let counts = state.get_status_counts().await;
    println!("State file: {}", settings.operational.state_file.display());
    println!("Tracked PRs: {}", state.keys().await.len());
    let mut counts: Vec<_> = counts.into_iter().collect();
    counts.sort_by_key(|(status, _)| status.to_string());
    for (status, n) in counts {
        println!("  {status}: {n}");
    }
    Ok(())
}

/// Builds every collaborator and wires the ingresses per the scheduling
/// model, then blocks until a shutdown signal triggers the drain sequence.
async fn cmd_run(config_path: &PathBuf) -> Result<()> {
    let settings = load_settings(config_path)?;
    info!(mode = ?settings.mode, repos = settings.repos.len(), "vigil starting");

    let state = Arc::new(StateStore::load(&settings.operational.state_file).await);
    let forge: Arc<dyn ForgeClient> = Arc::new(GithubForgeClient::new(settings.forge_token.clone()));
    let llm = Arc::new(LlmClient::new(settings.llm_cmd.clone()));
    let worktree = Arc::new(WorktreeManager::new(
        settings.operational.clone_dir.clone(),
        Duration::from_secs(settings.operational.git_timeout_secs),
    ));
    let rate_limit = Arc::new(RateLimitGuard::new());
    let metrics = Arc::new(MetricsCollector::new());
    let audit = Arc::new(AuditLogger::new(settings.operational.audit_dir.clone(), settings.operational.audit_max_entries).await);
    let features = Arc::new(build_feature_runner(&settings, forge.clone(), audit.clone()));
    let clock = Arc::new(SystemClock);

    let coordinator = Arc::new(ReviewCoordinator::new(
        state.clone(),
        forge.clone(),
        llm,
        worktree.clone(),
        rate_limit.clone(),
        metrics,
        features,
        clock,
        settings.review.clone(),
        settings.operational.clone(),
    ));

    StartupRecovery::new(settings.clone(), state.clone(), forge.clone(), coordinator.clone()).run().await;

    let stop = Arc::new(StopFlag::new());
    let mut handles = Vec::new();

    if matches!(settings.mode, vigil::config::Mode::Polling | vigil::config::Mode::Both) {
        let poller = PollerLoop::new(settings.clone(), coordinator.clone(), forge.clone(), state.clone(), worktree.clone(), audit.clone(), stop.clone());
        handles.push(tokio::spawn(async move { poller.run().await }));
    }

    let shutdown_tx = if matches!(settings.mode, vigil::config::Mode::Webhook | vigil::config::Mode::Both) {
        let webhook_state = Arc::new(WebhookState::new(settings.clone(), coordinator.clone(), state.clone())?);
        let app = webhook::build_router(webhook_state);
        let port = settings.operational.webhook_port;
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind webhook port {port}"))?;
        info!(port, "webhook ingress listening");
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        handles.push(tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await;
        }));
        Some(tx)
    } else {
        None
    };

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");
    stop.stop();
    if let Some(tx) = shutdown_tx {
        let _ = tx.send(());
    }

    for handle in handles {
        let _ = handle.await;
    }

    let drain = Duration::from_secs(settings.operational.shutdown_drain_secs);
    info!(seconds = drain.as_secs(), inflight = coordinator.inflight(), "draining in-flight reviews");
    coordinator.wait_for_drain(drain).await;
    rate_limit.shutdown();

    info!("vigil shut down cleanly");
    Ok(())
}

fn build_feature_runner(settings: &Settings, forge: Arc<dyn ForgeClient>, audit: Arc<AuditLogger>) -> FeatureRunner {
    let mut features: Vec<Box<dyn Feature>> = Vec::new();
    if settings.features.audit_log {
        features.push(Box::new(AuditLogFeature::new(audit)));
    }
    if settings.features.auto_label {
        features.push(Box::new(AutoLabelFeature::new(forge.clone(), settings.review.security_paths.clone())));
    }
    if settings.features.auto_description {
        features.push(Box::new(AutoDescriptionFeature::new(forge)));
    }
    if settings.features.jira {
        features.push(Box::new(JiraFeature::new(None)));
    }
    if settings.features.slack {
        features.push(Box::new(SlackFeature::new(None)));
    }
    FeatureRunner::new(features)
}
