// SPDX-License-Identifier: MIT
use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tracing::{info, warn};

use trakd::api::http::HttpRemoteApi;
use trakd::config::CoordinatorConfig;
use trakd::credentials::FileCredentialStore;
use trakd::logout::{LogoutOrchestrator, LogoutOutcome};
use trakd::notify::Notifier;
use trakd::scheduler::TaskScheduler;
use trakd::session::{SessionTuning, SessionVerifier};
use trakd::storage::Storage;
use trakd::sync::{SyncEngine, SyncTuning};
use trakd::telemetry::{FeedTelemetryProvider, Reading};
use trakd::CoordinatorContext;

#[derive(Parser)]
#[command(
    name = "trakd",
    about = "Device telemetry sync coordinator",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Data directory for config, credentials, and the SQLite database
    #[arg(long, env = "TRAKD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "TRAKD_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "TRAKD_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Override the remote service base URL
    #[arg(long, env = "TRAKD_API_URL")]
    api_url: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordinator in the foreground (default when no subcommand given).
    ///
    /// Telemetry readings are accepted as JSONL on stdin, one reading per
    /// line; whatever adapter owns the actual sensors pipes them in.
    /// Ctrl-C performs a complete logout before exiting.
    ///
    /// Examples:
    ///   sensor-adapter | trakd serve
    ///   trakd
    Serve,
    /// Persist an identity and announce it to the remote service.
    ///
    /// Must run before `serve` — the coordinator refuses to start without a
    /// persisted identity.
    ///
    /// Examples:
    ///   trakd login --identity tok_12345678 --tenant DEP-01
    Login {
        /// Identity token issued by the service
        #[arg(long)]
        identity: String,
        /// Tenant code, e.g. DEP-01
        #[arg(long)]
        tenant: String,
    },
    /// Perform a complete logout.
    ///
    /// Runs the five-phase teardown against the persisted state. A
    /// coordinator running in another process notices the newer logout
    /// epoch within one guard tick and tears itself down.
    ///
    /// Examples:
    ///   trakd logout
    ///   trakd logout --force-offline
    Logout {
        /// Ask the server to mark the device offline immediately
        #[arg(long)]
        force_offline: bool,
    },
    /// Verify that a previous logout completed.
    ///
    /// Read-only: checks for active schedulers, leftover persisted identity
    /// keys, and non-empty credential storage. Exit code 0 when clean.
    ///
    /// Examples:
    ///   trakd verify
    Verify,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Arc::new(CoordinatorConfig::new(
        args.data_dir,
        args.log,
        args.api_url,
    ));
    let _log_guard = setup_logging(&config.log, args.log_file.as_deref(), &config.log_format);

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Login { identity, tenant } => login(config, &identity, &tenant).await,
        Command::Logout { force_offline } => logout(config, force_offline).await,
        Command::Verify => verify(config).await,
    }
}

async fn serve(config: Arc<CoordinatorConfig>) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %config.data_dir.display(),
        api = %config.api_base_url,
        "trakd starting"
    );

    let storage = Arc::new(Storage::new(&config.data_dir).await?);
    let credentials = Arc::new(FileCredentialStore::new(&config.data_dir));
    let api = Arc::new(
        HttpRemoteApi::new(&config.api_base_url).map_err(|e| anyhow::anyhow!(e))?,
    );
    let provider = Arc::new(FeedTelemetryProvider::new());

    // Feed readings from stdin into the provider.
    {
        let provider = provider.clone();
        tokio::spawn(async move {
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            let mut lines = stdin.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Reading>(&line) {
                    Ok(reading) => provider.publish(reading),
                    Err(e) => warn!(err = %e, "unparseable telemetry line dropped"),
                }
            }
            info!("telemetry input closed");
        });
    }

    let context =
        CoordinatorContext::start(config, storage, credentials, api, provider).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested — logging out");

    match context.shutdown().await {
        LogoutOutcome::Completed(result) => {
            print_logout_result(&result);
            if result.success {
                Ok(())
            } else {
                anyhow::bail!("logout finished with errors")
            }
        }
        LogoutOutcome::AlreadyInProgress => {
            warn!("logout already in progress elsewhere");
            Ok(())
        }
    }
}

async fn login(config: Arc<CoordinatorConfig>, identity: &str, tenant: &str) -> Result<()> {
    let storage = Storage::new(&config.data_dir).await?;
    let credentials = FileCredentialStore::new(&config.data_dir);
    let api = HttpRemoteApi::new(&config.api_base_url).map_err(|e| anyhow::anyhow!(e))?;
    trakd::perform_login(&storage, &credentials, &api, identity, tenant).await?;
    println!("logged in as tenant {tenant}");
    Ok(())
}

async fn logout(config: Arc<CoordinatorConfig>, force_offline: bool) -> Result<()> {
    let orchestrator = offline_orchestrator(&config).await?;
    match orchestrator.perform_complete_logout(force_offline).await {
        LogoutOutcome::Completed(result) => {
            print_logout_result(&result);
            if result.success {
                Ok(())
            } else {
                anyhow::bail!("logout finished with errors")
            }
        }
        LogoutOutcome::AlreadyInProgress => anyhow::bail!("logout already in progress"),
    }
}

async fn verify(config: Arc<CoordinatorConfig>) -> Result<()> {
    let orchestrator = offline_orchestrator(&config).await?;
    let report = orchestrator.verify_logout_complete().await;
    if report.complete {
        println!("logout verified: persisted state is clean");
        Ok(())
    } else {
        for issue in &report.issues {
            println!("issue: {issue}");
        }
        anyhow::bail!("logout incomplete ({} issues)", report.issues.len())
    }
}

/// Orchestrator over persisted state only — no channels, no running engine.
/// Used by the `logout` and `verify` subcommands, which operate from a
/// separate process; a live coordinator reacts via its stale-instance guard.
async fn offline_orchestrator(config: &CoordinatorConfig) -> Result<LogoutOrchestrator> {
    let storage = Arc::new(Storage::new(&config.data_dir).await?);
    let credentials = Arc::new(FileCredentialStore::new(&config.data_dir));
    let api = Arc::new(
        HttpRemoteApi::new(&config.api_base_url).map_err(|e| anyhow::anyhow!(e))?,
    );
    let notifier = Arc::new(Notifier::new());
    let connectivity = Arc::new(trakd::connectivity::ConnectivityMonitor::new(
        &config.api_base_url,
        notifier.clone(),
    ));
    let scheduler = TaskScheduler::new(Vec::new());
    let verifier = Arc::new(SessionVerifier::new(
        api.clone(),
        credentials.clone(),
        connectivity,
        notifier.clone(),
        SessionTuning::default(),
    ));
    let provider = Arc::new(FeedTelemetryProvider::new());
    let engine = SyncEngine::new(
        provider,
        api.clone(),
        verifier.clone(),
        credentials.clone(),
        SyncTuning::default(),
    );
    Ok(LogoutOrchestrator::new(
        api,
        scheduler,
        engine,
        verifier,
        storage,
        credentials,
        notifier,
        config.server_notify_timeout(),
    ))
}

fn print_logout_result(result: &trakd::logout::LogoutResult) {
    println!(
        "logout {} in {} ms{}",
        if result.success { "succeeded" } else { "FAILED" },
        result.duration.as_millis(),
        if result.emergency { " (emergency)" } else { "" }
    );
    for phase in &result.phases {
        println!(
            "  {} {}",
            if phase.ok { "ok  " } else { "fail" },
            phase.name
        );
    }
    for warning in &result.warnings {
        println!("  warning: {warning}");
    }
    for error in &result.errors {
        println!("  error: {error}");
    }
}

// ── Logging ──────────────────────────────────────────────────────────────────

fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
    log_format: &str,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let use_json = log_format == "json";

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("trakd.log"));

        // Ensure the directory exists before tracing-appender tries to open it.
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            if use_json {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(log_level)
                    .init();
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(log_level)
                    .compact()
                    .init();
            }
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        if use_json {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().json())
                .with(fmt::layer().json().with_writer(non_blocking))
                .init();
        } else {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().compact())
                .with(fmt::layer().with_writer(non_blocking))
                .init();
        }

        Some(guard)
    } else if use_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(log_level)
            .init();
        None
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        None
    }
}
