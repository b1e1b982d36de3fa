use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::future::join_all;

use chain_endpoints::catalogue::{NetworkCatalogue, Protocol, StaticCatalogue};
use chain_endpoints::config::Config;
use chain_endpoints::connection::WsConnector;
use chain_endpoints::keeper::{run_keeper_with_shutdown, KeeperOptions};
use chain_endpoints::prober::LatencyProber;
use chain_endpoints::selector::FastestEndpointSelector;
use chain_endpoints::storage::{FileStorage, Storage};
use chain_endpoints::store::{
    now_ms, AccountChainScope, ChainScope, EndpointPreference, PreferenceStore, Scope,
};
use chain_endpoints::telemetry::ConnectionStats;

#[derive(Parser, Debug)]
#[command(name = "chain-endpoints", version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Keep a live connection per configured chain until Ctrl+C
    Daemon,
    /// Measure every live-socket endpoint of a chain
    Probe {
        #[arg(long)]
        chain: String,
    },
    /// Race the endpoints of a chain and print the winner
    Fastest {
        #[arg(long)]
        chain: String,
    },
    /// Read or change the stored endpoint preference
    Endpoint {
        #[command(subcommand)]
        action: EndpointCommand,
    },
}

#[derive(Subcommand, Debug)]
enum EndpointCommand {
    Get {
        #[arg(long)]
        chain: String,
    },
    Set {
        #[arg(long)]
        chain: String,
        #[arg(long, conflicts_with = "auto", required_unless_present = "auto")]
        url: Option<String>,
        /// Let the fastest endpoint be picked
        #[arg(long)]
        auto: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;

    match cli.command {
        Commands::Daemon => run_daemon(cfg).await?,
        Commands::Probe { chain } => probe(&cfg, &chain).await?,
        Commands::Fastest { chain } => fastest(&cfg, &chain).await?,
        Commands::Endpoint { action } => {
            chain_endpoints::logging::init_log_file(&cfg.log_path(), false)?;
            match cfg.account.clone() {
                Some(address) => {
                    endpoint(&cfg, action, |chain| AccountChainScope::new(address.clone(), chain)).await?
                }
                None => endpoint(&cfg, action, ChainScope::new).await?,
            }
        }
    }

    Ok(())
}

async fn run_daemon(cfg: Config) -> Result<()> {
    let shutdown = Arc::new(tokio::sync::Notify::new());
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.notify_one();
        }
    });
    run_keeper_with_shutdown(
        cfg,
        KeeperOptions {
            log_path: None,
            mirror_log_to_stdout: true,
        },
        shutdown,
    )
    .await
}

fn prober(cfg: &Config) -> LatencyProber {
    LatencyProber::new(
        Arc::new(WsConnector::new()),
        cfg.worst_case_delay(),
        Arc::new(ConnectionStats::default()),
    )
}

async fn probe(cfg: &Config, chain: &str) -> Result<()> {
    let catalogue = StaticCatalogue::load(&cfg.catalogue_path)?;
    let candidates = catalogue.live_socket_endpoints(chain)?;
    let prober = prober(cfg);

    let mut results = join_all(candidates.iter().map(|c| prober.probe(&c.url))).await;
    results.sort_by_key(|r| r.latency);
    for result in &results {
        let status = if result.is_success() {
            "ok"
        } else {
            "failed"
        };
        println!(
            "{:>6} ms  {:<6}  {}",
            result.latency.as_millis(),
            status,
            result.endpoint_url
        );
    }
    for result in results {
        if let Some(conn) = result.connection {
            conn.disconnect().await;
        }
    }
    Ok(())
}

async fn fastest(cfg: &Config, chain: &str) -> Result<()> {
    let catalogue = StaticCatalogue::load(&cfg.catalogue_path)?;
    let candidates = catalogue.endpoints(chain)?;
    let selector = FastestEndpointSelector::new(prober(cfg));
    let Some(winner) = selector.select_fastest(&candidates).await else {
        anyhow::bail!(
            "no endpoint for {chain} answered within {} ms",
            cfg.worst_case_delay_ms
        );
    };
    println!("{} {} ms", winner.endpoint_url, winner.latency.as_millis());
    winner.connection.disconnect().await;
    Ok(())
}

async fn endpoint<S, F>(cfg: &Config, action: EndpointCommand, scope_for: F) -> Result<()>
where
    S: Scope,
    F: Fn(String) -> S,
{
    let storage: Arc<dyn Storage> = Arc::new(FileStorage::open(&cfg.storage_dir()).await?);
    let store = PreferenceStore::<S>::open(storage, cfg.no_pass_period()).await;

    let pref = match action {
        EndpointCommand::Get { chain } => {
            let scope = scope_for(chain.to_lowercase());
            store.effective(&scope, now_ms())
        }
        EndpointCommand::Set { chain, url, auto } => {
            let scope = scope_for(chain.to_lowercase());
            let pref = match (url, auto) {
                (_, true) => EndpointPreference::auto_refresh(now_ms()),
                (Some(url), false) => {
                    match Protocol::of(&url) {
                        Some(Protocol::Wss) | Some(Protocol::Light) => {}
                        _ => anyhow::bail!("unsupported endpoint url: {url}"),
                    }
                    EndpointPreference::manual(url, now_ms())
                }
                (None, false) => anyhow::bail!("either --url or --auto is required"),
            };
            store.set(&scope, pref.clone());
            store.persist_now().await.context("save endpoint preference")?;
            store.get(&scope).unwrap_or(pref)
        }
    };
    println!("{}", serde_json::to_string_pretty(&pref)?);
    Ok(())
}
