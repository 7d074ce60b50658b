use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{error, info};
use tokio_util::sync::CancellationToken;

mod binding;
mod config;
mod diff;
mod error;
mod queue;
mod reconciler;
mod store;
mod topology;

use binding::RouterBinding;
use config::{load_config, DaemonConfig};
use queue::WorkQueue;
use reconciler::Reconciler;
use store::ClusterStore;

const RESYNC_PERIOD: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "vrouterd", version, about = "VirtualRouter node daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon with a config file
    Start {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Start { config } => {
            let cfg = load_config(config)?;
            run(cfg).await
        }
    }
}

async fn run(mut cfg: DaemonConfig) -> anyhow::Result<()> {
    info!("vrouterd starting on node {}", cfg.node_name);

    // Startup failures below are fatal: without the runtime socket, the
    // orchestrator, or a netlink handle there is nothing to reconcile.
    let crio_cfg = libcrio::CrioConfig::resolve(
        cfg.runtime_endpoint.as_deref(),
        cfg.image_endpoint.as_deref(),
        cfg.timeout,
    )
    .context("resolving container runtime config")?;
    let crio = libcrio::CrioClient::connect(&crio_cfg)
        .await
        .context("connecting to the container runtime")?;
    let runtime_version = crio
        .version()
        .await
        .context("probing the container runtime")?;
    info!("container runtime answers (version {runtime_version})");

    let store = Arc::new(
        ClusterStore::connect(&cfg.orchestrator_endpoints, &cfg.node_name)
            .await
            .context("connecting to the orchestrator")?,
    );

    resolve_uplinks(&mut cfg, &store).await?;
    let cfg = Arc::new(cfg);

    let root = libvrnet::ns::netns::root_handle().context("opening the root netlink handle")?;

    let snapshot = topology::install(&root, &cfg)
        .await
        .context("installing host topology")?;

    let queue = Arc::new(WorkQueue::default());
    let cancel = CancellationToken::new();

    let pod_informer = tokio::spawn(
        store
            .clone()
            .run_pod_informer(queue.clone(), cancel.clone()),
    );
    let router_informer = tokio::spawn(
        store
            .clone()
            .run_router_informer(queue.clone(), cancel.clone()),
    );

    let resync_store = store.clone();
    let resync_queue = queue.clone();
    let resync_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(RESYNC_PERIOD);
        tick.tick().await; // the informers already enqueue the initial list
        loop {
            tokio::select! {
                _ = resync_cancel.cancelled() => return,
                _ = tick.tick() => resync_store.resync(&resync_queue).await,
            }
        }
    });

    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        crio,
        RouterBinding::new(cfg.clone(), root.clone()),
    ));
    let mut workers = Vec::new();
    for _ in 0..cfg.workers {
        workers.push(tokio::spawn(
            reconciler.clone().run_worker(queue.clone()),
        ));
    }
    info!("{} worker(s) started", cfg.workers);

    shutdown_signal().await;
    info!("shutdown signal received");

    // stop event ingestion and dequeueing; in-flight items finish
    cancel.cancel();
    queue.shut_down();
    for worker in workers {
        if let Err(e) = worker.await {
            error!("worker ended abnormally: {e}");
        }
    }
    let _ = pod_informer.await;
    let _ = router_informer.await;

    topology::restore(&root, &cfg, &snapshot).await;
    info!("vrouterd stopped cleanly");
    Ok(())
}

/// Uplink names not present in the config file come from the node object's
/// annotations; a node without them cannot be wired.
async fn resolve_uplinks(cfg: &mut DaemonConfig, store: &ClusterStore) -> anyhow::Result<()> {
    if !cfg.internal_interface.is_empty() && !cfg.external_interface.is_empty() {
        return Ok(());
    }

    let node = store
        .get_node(&cfg.node_name)
        .await
        .context("reading the node object")?
        .with_context(|| format!("node {} not found in the orchestrator", cfg.node_name))?;

    if cfg.internal_interface.is_empty() {
        cfg.internal_interface = node
            .annotation(common::ANNOTATION_INTERNAL_INTERFACE)
            .with_context(|| {
                format!(
                    "node {} lacks the {} annotation",
                    cfg.node_name,
                    common::ANNOTATION_INTERNAL_INTERFACE
                )
            })?
            .to_string();
    }
    if cfg.external_interface.is_empty() {
        cfg.external_interface = node
            .annotation(common::ANNOTATION_EXTERNAL_INTERFACE)
            .with_context(|| {
                format!(
                    "node {} lacks the {} annotation",
                    cfg.node_name,
                    common::ANNOTATION_EXTERNAL_INTERFACE
                )
            })?
            .to_string();
    }

    info!(
        "uplinks resolved: internal {}, external {}",
        cfg.internal_interface, cfg.external_interface
    );
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(e) => {
            error!("cannot listen for SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}
