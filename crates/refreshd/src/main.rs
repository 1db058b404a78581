//! refreshd: the Refresh daemon.
//!
//! Assembles the rollout subsystems in one process:
//! - State store (redb)
//! - Rollout controller and action gateway
//! - Health monitor
//! - REST API
//!
//! # Usage
//!
//! ```text
//! refreshd init --name postgresql --variant partition --code 14/1.12.0 --workload sha256:...
//! refreshd serve --port 8450 --data-dir /var/lib/refresh --config refresh.toml
//! refreshd status --data-dir /var/lib/refresh --app postgresql
//! ```

mod monitor;
mod workload;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use refresh_core::config::parse_duration;
use refresh_core::{PlatformVariant, RefreshConfig};
use refresh_health::{HealthProbe, HttpProbe, StaticProbe};
use refresh_state::{ApplicationRecord, StateStore};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::monitor::HealthMonitor;
use crate::workload::ConfiguredWorkload;

const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "refreshd", about = "Refresh rolling-upgrade daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the API and run the health monitor.
    Serve {
        /// Port to listen on.
        #[arg(long, default_value = "8450")]
        port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/refresh")]
        data_dir: PathBuf,

        /// refresh.toml to register (or update) an application from.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Health sweep interval, e.g. `5s`. Overrides the config.
        #[arg(long)]
        health_interval: Option<String>,

        /// While this file exists, pre-upgrade checks fail with its first line.
        #[arg(long)]
        hold_file: Option<PathBuf>,
    },

    /// Write a starter refresh.toml.
    Init {
        #[arg(long)]
        name: String,

        #[arg(long, value_parser = parse_variant)]
        variant: PlatformVariant,

        /// Orchestration code version, e.g. `14/1.12.0`.
        #[arg(long)]
        code: String,

        /// Pinned workload version (an image digest for `partition`).
        #[arg(long)]
        workload: String,

        #[arg(long, default_value = "refresh.toml")]
        output: PathBuf,
    },

    /// Print an application's status from the store (daemon stopped).
    Status {
        #[arg(long, default_value = "/var/lib/refresh")]
        data_dir: PathBuf,

        #[arg(long)]
        app: String,
    },

    /// Print an application's audit trail from the store (daemon stopped).
    Audit {
        #[arg(long, default_value = "/var/lib/refresh")]
        data_dir: PathBuf,

        #[arg(long)]
        app: String,
    },
}

fn parse_variant(raw: &str) -> Result<PlatformVariant, String> {
    match raw {
        "partition" => Ok(PlatformVariant::Partition),
        "per_unit" | "per-unit" => Ok(PlatformVariant::PerUnit),
        other => Err(format!("unknown variant {other:?} (expected partition or per_unit)")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,refreshd=debug,refresh=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            port,
            data_dir,
            config,
            health_interval,
            hold_file,
        } => run_serve(port, data_dir, config, health_interval, hold_file).await,
        Command::Init {
            name,
            variant,
            code,
            workload,
            output,
        } => run_init(&name, variant, &code, &workload, &output),
        Command::Status { data_dir, app } => {
            let store = open_store(&data_dir)?;
            let state = refresh_api::ApiState::new(
                store,
                Arc::new(ConfiguredWorkload::new("workload", None)),
                Arc::new(StaticProbe::new()),
            );
            let report = state.controller(&app).status()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Audit { data_dir, app } => {
            let store = open_store(&data_dir)?;
            for entry in store.list_audit(&app)? {
                println!("{}", serde_json::to_string(&entry)?);
            }
            Ok(())
        }
    }
}

fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("refresh.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

fn run_init(
    name: &str,
    variant: PlatformVariant,
    code: &str,
    workload: &str,
    output: &Path,
) -> anyhow::Result<()> {
    if output.exists() {
        anyhow::bail!("{} already exists", output.display());
    }
    let config = RefreshConfig::scaffold(name, variant, code, workload);
    config.validate()?;
    std::fs::write(output, config.to_toml_string()?)?;
    info!(path = ?output, app = %name, "config written");
    Ok(())
}

/// Register the configured application, or bring an existing one in line
/// with the config: a changed version pin is a target change.
fn seed_application(state: &refresh_api::ApiState, config: &RefreshConfig) -> anyhow::Result<()> {
    let app = &config.application;
    let pin = config.version_pin();
    if state.store.get_app(&app.name)?.is_none() {
        let mut record = ApplicationRecord::new(&app.name, app.variant);
        record.coordinator = app.coordinator.unwrap_or(0);
        record.pause_policy_raw = config.pause_policy_raw();
        record.target = Some(pin.clone());
        record.original = Some(pin);
        record.workload_name = app.workload_name.clone().unwrap_or_default();
        record.docs_url = app.docs_url.clone().unwrap_or_default();
        record.resource_name = app.resource_name.clone();
        state.store.put_app(&record)?;
        info!(app = %app.name, variant = %app.variant, "application registered from config");
        return Ok(());
    }

    let controller = state.controller(&app.name);
    controller.set_pause_policy(&config.pause_policy_raw())?;
    if let Some(coordinator) = app.coordinator {
        controller.set_coordinator(coordinator)?;
    }
    let decision = controller.change_target(&pin)?;
    info!(app = %app.name, target = %pin, state = %decision.state, "application updated from config");
    Ok(())
}

fn probe_for(config: Option<&RefreshConfig>) -> (Arc<dyn HealthProbe>, Option<Duration>) {
    let Some(health) = config.and_then(|c| c.health.as_ref()) else {
        return (Arc::new(StaticProbe::new()), None);
    };
    let Some(template) = &health.address_template else {
        return (Arc::new(StaticProbe::new()), None);
    };
    let timeout = health
        .timeout
        .as_deref()
        .and_then(parse_duration)
        .unwrap_or(DEFAULT_PROBE_TIMEOUT);
    let interval = health
        .interval
        .as_deref()
        .and_then(parse_duration)
        .unwrap_or(DEFAULT_HEALTH_INTERVAL);
    let endpoint = health.endpoint.as_deref().unwrap_or("/healthz");
    (
        Arc::new(HttpProbe::new(template, endpoint, timeout)),
        Some(interval),
    )
}

async fn run_serve(
    port: u16,
    data_dir: PathBuf,
    config_path: Option<PathBuf>,
    health_interval: Option<String>,
    hold_file: Option<PathBuf>,
) -> anyhow::Result<()> {
    info!("Refresh daemon starting");

    let config = config_path
        .as_deref()
        .map(RefreshConfig::from_file)
        .transpose()?;

    // ── Initialize subsystems ──────────────────────────────────

    let store = open_store(&data_dir)?;

    let workload_name = config
        .as_ref()
        .and_then(|c| c.application.workload_name.clone())
        .or_else(|| config.as_ref().map(|c| c.application.name.clone()))
        .unwrap_or_else(|| "workload".to_string());
    let workload = Arc::new(ConfiguredWorkload::new(&workload_name, hold_file));
    info!(workload = %workload_name, "workload hooks initialized");

    let (probe, configured_interval) = probe_for(config.as_ref());
    let interval = match health_interval.as_deref() {
        Some(raw) => Some(
            parse_duration(raw)
                .ok_or_else(|| anyhow::anyhow!("invalid --health-interval {raw:?}"))?,
        ),
        None => configured_interval,
    };

    let state = refresh_api::ApiState::new(store, workload, probe);
    if let Some(config) = &config {
        seed_application(&state, config)?;
    }

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    // Without a probe address, health is pushed by the workload instead.
    let monitor_handle = match interval {
        Some(interval) => {
            let monitor = HealthMonitor::new(state.clone());
            info!(interval_ms = interval.as_millis() as u64, "health monitor initialized");
            Some(tokio::spawn(async move {
                monitor.run(interval, shutdown_rx).await;
            }))
        }
        None => {
            warn!("no health probe configured; expecting health reports over the API");
            None
        }
    };

    // ── Start API server ───────────────────────────────────────

    let router = refresh_api::build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    if let Some(handle) = monitor_handle {
        let _ = handle.await;
    }

    info!("Refresh daemon stopped");
    Ok(())
}
