use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::catalogue::{NetworkCatalogue, StaticCatalogue};
use crate::config::Config;
use crate::connection::WsConnector;
use crate::orchestrator::{ConnectionOrchestrator, EndpointServices};
use crate::storage::{FileStorage, Storage};
use crate::store::{AccountChainScope, ChainScope, PreferenceStore, Scope};

/// Orchestrators get this long to notice the stop signal before being aborted.
const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
pub struct KeeperOptions {
    pub log_path: Option<PathBuf>,
    pub mirror_log_to_stdout: bool,
}

pub struct KeeperHandle {
    shutdown: std::sync::mpsc::Sender<()>,
    join: Option<std::thread::JoinHandle<Result<()>>>,
}

impl KeeperHandle {
    pub fn stop(mut self) -> Result<()> {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            match join.join() {
                Ok(res) => res,
                Err(_) => anyhow::bail!("endpoint keeper thread panicked"),
            }
        } else {
            Ok(())
        }
    }
}

/// Keeps one live connection per configured chain on the *current* tokio
/// runtime until `shutdown` is notified.
pub async fn run_keeper_with_shutdown(
    cfg: Config,
    opts: KeeperOptions,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let stop = shutdown.notified();
    tokio::pin!(stop);

    let log_path = opts.log_path.unwrap_or_else(|| cfg.log_path());
    crate::logging::init_log_file(&log_path, opts.mirror_log_to_stdout)?;
    crate::logging::info(format!(
        "keeper start version={} config={} log={}",
        env!("CARGO_PKG_VERSION"),
        cfg.config_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        log_path.display()
    ));

    let catalogue = StaticCatalogue::load(&cfg.catalogue_path)?;
    let chains = if cfg.chains.is_empty() {
        catalogue.chain_ids()
    } else {
        cfg.chains.clone()
    };
    if chains.is_empty() {
        anyhow::bail!("no chains to keep: config and catalogue are both empty");
    }
    let catalogue: Arc<dyn NetworkCatalogue> = Arc::new(catalogue);
    let storage: Arc<dyn Storage> = Arc::new(FileStorage::open(&cfg.storage_dir()).await?);
    let services = EndpointServices::new(
        catalogue,
        Arc::new(WsConnector::new()),
        cfg.worst_case_delay(),
        cfg.in_flight_ttl(),
    );

    match cfg.account.clone() {
        Some(address) => {
            let scopes = chains
                .iter()
                .map(|chain| AccountChainScope::new(address.clone(), chain.clone()))
                .collect();
            keep(&cfg, storage, services, scopes, stop).await
        }
        None => {
            let scopes = chains.iter().map(ChainScope::new).collect();
            keep(&cfg, storage, services, scopes, stop).await
        }
    }
}

async fn keep<S: Scope>(
    cfg: &Config,
    storage: Arc<dyn Storage>,
    services: EndpointServices,
    scopes: Vec<S>,
    stop: std::pin::Pin<&mut tokio::sync::futures::Notified<'_>>,
) -> Result<()> {
    let store = PreferenceStore::<S>::open(storage, cfg.no_pass_period()).await;
    let halt = Arc::new(Notify::new());

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    for scope in scopes {
        crate::logging::info_kv("keeping chain", &[("chain", scope.chain_id())]);
        let orchestrator = ConnectionOrchestrator::new(scope, store.clone(), services.clone());
        tasks.push(tokio::spawn(
            orchestrator.run(cfg.keepalive_interval(), halt.clone()),
        ));
    }

    let pool = services.pool.clone();
    let ttl = cfg.in_flight_ttl();
    let pruner = tokio::spawn(async move {
        let mut tick = tokio::time::interval(ttl);
        loop {
            tick.tick().await;
            let pruned = pool.prune_stale_requests();
            if pruned > 0 {
                crate::logging::warn(format!("pruned {pruned} stale in-flight dials"));
            }
        }
    });

    stop.await;
    crate::logging::info("keeper stopping");
    pruner.abort();
    halt.notify_waiters();
    for task in tasks {
        let abort = task.abort_handle();
        if tokio::time::timeout(STOP_GRACE, task).await.is_err() {
            abort.abort();
        }
    }

    if let Err(err) = store.persist_now().await {
        crate::logging::error(format!("flush preferences: {err:#}"));
    }
    services.pool.close_all().await;
    crate::logging::info(services.stats.snapshot().log_line());
    Ok(())
}

/// Runs the keeper on a dedicated thread with its own tokio runtime.
///
/// Meant for embedding in applications that don't want to own the keeper's
/// async lifecycle directly.
pub fn start_threaded(cfg: Config, opts: KeeperOptions) -> Result<KeeperHandle> {
    let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();
    let join = thread::Builder::new()
        .name("endpoint-keeper".to_string())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .worker_threads(2)
                .build()
                .context("build tokio runtime")?;

            rt.block_on(async move {
                let shutdown = Arc::new(Notify::new());
                let shutdown_task = shutdown.clone();
                tokio::task::spawn_blocking(move || {
                    let _ = shutdown_rx.recv();
                    shutdown_task.notify_one();
                });

                run_keeper_with_shutdown(cfg, opts, shutdown).await
            })
        })
        .context("spawn endpoint keeper thread")?;

    Ok(KeeperHandle {
        shutdown: shutdown_tx,
        join: Some(join),
    })
}
