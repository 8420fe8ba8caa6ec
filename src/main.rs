//! `fleetvisord` — the daemon entrypoint (spec §6 "Internal interfaces").
//!
//! `serve` wires every collaborator crate into one running process: the SSH
//! pool and HTTP transport registry, the provider registry (doubling as
//! `ProviderDirectory`), the reservation/lifecycle/network/traffic engines,
//! [`fleetvisor::FleetHooks`], and the task runner + batch processor loops.
//! The other subcommands are one-shot storage operations that share the same
//! backend construction but skip the background loops entirely.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fv_core::config::{DaemonConfig, LogFormat};
use fv_lifecycle::{Engine, TaskRunner};
use fv_provider::http_transport::TransportRegistry;
use fv_queue::{BatchProcessor, TaskQueue, TrafficJobHandler};
use fv_reservation::{LevelLimitsTable, PortAllocator, QuotaEngine, VmidAllocator};
use fv_ssh::{SshPool, SshPoolConfig};
use fv_storage::Storage;
use fv_storage::memory::MemoryStorage;
use fv_storage::mysql::MySqlStorage;
use fleetvisor::FleetHooks;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

mod cli;

use cli::{Cli, Command};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the tokio runtime")?;
    rt.block_on(dispatch(cli, config))
}

/// `FLEETVISOR_CONFIG` points at a TOML file; absent that, built-in defaults
/// plus env overrides apply (spec §3's config layer: file-then-env
/// precedence).
fn load_config() -> Result<DaemonConfig> {
    let config = match std::env::var("FLEETVISOR_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file {path}"))?;
            DaemonConfig::from_toml_str(&raw).with_context(|| format!("failed to parse config file {path}"))?
        }
        Err(_) => DaemonConfig::default(),
    };
    Ok(config.apply_env_overrides())
}

async fn dispatch(cli: Cli, config: DaemonConfig) -> Result<()> {
    match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let storage = MySqlStorage::connect(&url, 10).await.context("failed to connect to MySQL")?;
            run_with_storage(Arc::new(storage), cli, config).await
        }
        Err(_) => {
            info!("DATABASE_URL not set, using in-memory storage");
            run_with_storage(Arc::new(MemoryStorage::new()), cli, config).await
        }
    }
}

async fn run_with_storage<S: Storage + 'static>(storage: Arc<S>, cli: Cli, config: DaemonConfig) -> Result<()> {
    match cli.command {
        Command::Serve => serve(storage, config).await,
        Command::Action { user_id, instance_id, verb } => {
            Ok(cli::submit_action(storage.as_ref(), &user_id, &instance_id, verb).await?)
        }
        Command::ResetPassword { user_id, instance_id } => {
            Ok(cli::submit_reset_password(storage.as_ref(), &user_id, &instance_id).await?)
        }
        Command::Task { task_id } => Ok(cli::show_task(storage.as_ref(), &task_id).await?),
        Command::Instance { instance_id } => Ok(cli::show_instance(storage.as_ref(), &instance_id).await?),
        Command::NewPassword { instance_id, task_id } => {
            Ok(cli::show_new_password(storage.as_ref(), &instance_id, &task_id).await?)
        }
    }
}

/// Runs until interrupted: task runner loop, batch processor, transport and
/// reservation sweepers, all wired against the same `storage`.
async fn serve<S: Storage + 'static>(storage: Arc<S>, config: DaemonConfig) -> Result<()> {
    let ssh = Arc::new(SshPool::new(SshPoolConfig { idle_evict_after: Duration::from_secs(config.ssh_pool_idle_evict_secs) }));
    let transports = Arc::new(TransportRegistry::new());
    let directory = Arc::new(fv_registry::ProviderRegistry::new(storage.clone(), ssh.clone(), transports.clone()));

    let quota = Arc::new(QuotaEngine::new(storage.clone(), LevelLimitsTable::default(), config.reservation_ttl()));
    let vmid = Arc::new(VmidAllocator::new(ssh.clone()));
    let ports = Arc::new(PortAllocator::new(storage.clone()));

    let network = Arc::new(fv_network::NetworkConfigurator::new(storage.clone(), ssh.clone()));
    let traffic = Arc::new(fv_traffic::TrafficEngine::new(storage.clone(), ssh.clone()));

    let hooks = Arc::new(FleetHooks::new(storage.clone(), directory.clone(), network.clone(), traffic.clone()));
    let engine = Arc::new(Engine::new(storage.clone(), directory.clone(), hooks, quota.clone(), vmid, ports));
    let runner = Arc::new(TaskRunner::new(engine));

    let queue = Arc::new(TaskQueue::new());
    let handler = Arc::new(TrafficJobHandler::new(traffic));
    let batch = Arc::new(BatchProcessor::new(queue.clone(), handler));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut transport_shutdown = shutdown_rx.clone();
    let transport_fut = async move {
        while transport_shutdown.changed().await.is_ok() {
            if *transport_shutdown.borrow() {
                return;
            }
        }
    };
    tokio::spawn(fv_registry::transport_cleanup::run(transports, transport_fut));

    let mut health_shutdown = shutdown_rx.clone();
    let health_fut = async move {
        while health_shutdown.changed().await.is_ok() {
            if *health_shutdown.borrow() {
                return;
            }
        }
    };
    tokio::spawn(fv_registry::health_probe::run(directory, health_fut));

    tokio::spawn(batch.run(shutdown_rx.clone()));
    tokio::spawn(run_task_loop(runner, shutdown_rx.clone()));
    tokio::spawn(run_reservation_sweep(quota, config.reservation_sweep_interval_secs, shutdown_rx.clone()));
    tokio::spawn(run_metrics_sampler(ssh, queue, shutdown_rx.clone()));

    info!("fleetvisord started");
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown signal received, draining background work");
    let _ = shutdown_tx.send(true);

    // Give the batch processor's shutdown drain (spec §4.8: 60s deadline) a
    // moment to run before the process exits.
    tokio::time::sleep(Duration::from_secs(1)).await;
    Ok(())
}

/// Polls for claimable tasks (spec §4.4); backs off briefly when the queue is
/// empty rather than busy-looping `claim_next_task`.
async fn run_task_loop<S, D, H>(runner: Arc<TaskRunner<S, D, H>>, mut shutdown: watch::Receiver<bool>)
where
    S: Storage + 'static,
    D: fv_lifecycle::ProviderDirectory + 'static,
    H: fv_lifecycle::PostCreateHooks + 'static,
{
    const POLL_WHEN_EMPTY: Duration = Duration::from_secs(2);
    loop {
        if *shutdown.borrow() {
            return;
        }
        match runner.claim_and_run(None).await {
            Ok(Some(_)) => continue,
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(POLL_WHEN_EMPTY) => {}
                    changed = shutdown.changed() => if changed.is_err() { return; },
                }
            }
            Err(err) => {
                error!(error = %err, "task claim failed");
                tokio::select! {
                    _ = tokio::time::sleep(POLL_WHEN_EMPTY) => {}
                    changed = shutdown.changed() => if changed.is_err() { return; },
                }
            }
        }
    }
}

/// Drives [`QuotaEngine::sweep_expired`] on a fixed cadence (spec §4.3).
async fn run_reservation_sweep<S: Storage + 'static>(quota: Arc<QuotaEngine<S>>, interval_secs: u64, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match quota.sweep_expired().await {
                    Ok(released) if released > 0 => info!(released, "swept expired reservations"),
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "reservation sweep failed"),
                }
            }
            changed = shutdown.changed() => if changed.is_err() || *shutdown.borrow() { return; },
        }
    }
}

/// Samples the process-wide gauges (spec §10.5) into `fv-core`'s in-process
/// [`fv_core::metrics::Metrics`] registry and emits them as a structured log
/// line every minute. There is no separate status command reading this from
/// another process — the HTTP surface that would make that meaningful is
/// explicitly out of scope (spec §1) — so the daemon's own tracing output is
/// the operator-facing view of these counters.
async fn run_metrics_sampler(ssh: Arc<SshPool>, queue: Arc<TaskQueue>, mut shutdown: watch::Receiver<bool>) {
    let metrics = fv_core::metrics::Metrics::new();
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                metrics.metric("ssh_active_connections").set(ssh.active_connections() as i64);
                metrics.metric("queue_depth").set(queue.depth() as i64);
                info!(snapshot = ?metrics.snapshot(), "metrics sample");
            }
            changed = shutdown.changed() => if changed.is_err() || *shutdown.borrow() { return; },
        }
    }
}
