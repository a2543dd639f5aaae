//! Moira consensus node binary.
//!
//! A single `run` command starts the node: gossip listener, heartbeat sync
//! loop, processing pipeline, HTTP stats service and the application gateway.
//! Exit code 0 on clean shutdown, 1 on fatal error.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use moira::config::MoiraConfig;
use moira::crypto::SigningKeypair;
use moira::node::{consume_commits, Node, NodeConfig, SelectorKind};
use moira::peers::{Peer, Peers};
use moira::poset::{InmemStore, Poset, SledStore, Store};
use moira::proxy::AppGateway;
use moira::{constants, service};

/// Moira aBFT consensus node.
#[derive(Parser, Debug)]
#[command(name = "moira", version, about = "DAG-based aBFT consensus node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the consensus node.
    Run {
        /// Data directory for keys, config and the durable store.
        #[arg(long, default_value = "./moira-data")]
        datadir: PathBuf,

        /// Gossip listen address.
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// HTTP stats service address.
        #[arg(long)]
        service_listen: Option<SocketAddr>,

        /// Application proxy listen address.
        #[arg(long)]
        proxy_listen: Option<SocketAddr>,

        /// Application client connect address.
        #[arg(long)]
        client_connect: Option<SocketAddr>,

        /// Maximum connection pool size for the sync transport.
        #[arg(long)]
        max_pool: Option<usize>,

        /// Use the durable on-disk store.
        #[arg(long)]
        store: bool,

        /// Capacity of the predicate and store caches.
        #[arg(long)]
        cache_size: Option<usize>,

        /// Gossip heartbeat in milliseconds.
        #[arg(long)]
        heartbeat: Option<u64>,

        /// TCP dial/read timeout in milliseconds.
        #[arg(long)]
        timeout: Option<u64>,

        /// Maximum events per sync response.
        #[arg(long)]
        sync_limit: Option<usize>,

        /// Log level: trace, debug, info, warn, error.
        #[arg(long)]
        log: Option<String>,

        /// Peer selector: random, smart, fair, unfair, franky.
        #[arg(long)]
        peer_selector: Option<String>,

        /// Test mode: submit this many synthetic transactions.
        #[arg(long, default_value_t = 0)]
        test_count: u64,

        /// Test mode: delay between synthetic transactions (ms).
        #[arg(long, default_value_t = 100)]
        test_delay: u64,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            datadir,
            listen,
            service_listen,
            proxy_listen,
            client_connect,
            max_pool,
            store,
            cache_size,
            heartbeat,
            timeout,
            sync_limit,
            log,
            peer_selector,
            test_count,
            test_delay,
        } => {
            let mut config = MoiraConfig::load(&datadir);
            config.node.data_dir = datadir.display().to_string();
            if let Some(v) = listen {
                config.node.listen_addr = v.to_string();
            }
            if let Some(v) = service_listen {
                config.node.service_addr = v.to_string();
            }
            if let Some(v) = proxy_listen {
                config.node.proxy_listen_addr = v.to_string();
            }
            if let Some(v) = client_connect {
                config.node.client_connect_addr = v.to_string();
            }
            if let Some(v) = max_pool {
                config.node.max_pool = v;
            }
            if store {
                config.node.store = true;
            }
            if let Some(v) = cache_size {
                config.node.cache_size = v;
            }
            if let Some(v) = heartbeat {
                config.node.heartbeat_ms = v;
            }
            if let Some(v) = timeout {
                config.node.tcp_timeout_ms = v;
            }
            if let Some(v) = sync_limit {
                config.node.sync_limit = v;
            }
            if let Some(v) = log {
                config.node.log_level = v;
            }
            if let Some(v) = peer_selector {
                config.node.peer_selector = v;
            }

            init_logging(&config.node.log_level);
            match run_node(config, test_count, test_delay) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!(error = %e, "fatal");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("moira={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run_node(
    config: MoiraConfig,
    test_count: u64,
    test_delay: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_node_inner(config, test_count, test_delay))
}

async fn run_node_inner(
    config: MoiraConfig,
    test_count: u64,
    test_delay: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let data_dir = PathBuf::from(&config.node.data_dir);
    std::fs::create_dir_all(&data_dir)?;
    let keypair = load_or_generate_keypair(&data_dir)?;
    tracing::info!(key = %keypair.public.to_hex(), "node identity");

    let selector: SelectorKind = config.node.peer_selector.parse()?;

    // The participant set must contain this node; a missing config means a
    // single-node network (useful for smoke tests).
    let mut peer_list = config.resolve_peers().map_err(std::io::Error::other)?;
    if !peer_list.iter().any(|p| p.public_key == keypair.public) {
        peer_list.push(Peer::new(
            keypair.public.clone(),
            config.node.listen_addr.clone(),
        ));
    }
    let peers = Arc::new(Peers::new(peer_list));

    let store: Arc<dyn Store> = if config.node.store {
        Arc::new(SledStore::open(
            &data_dir.join("store"),
            Arc::clone(&peers),
            config.node.cache_size,
        )?)
    } else {
        Arc::new(InmemStore::new(Arc::clone(&peers), config.node.cache_size))
    };

    let (commit_tx, commit_rx) = mpsc::channel(constants::COMMIT_CHANNEL_CAPACITY);
    let poset = Arc::new(Poset::new(
        Arc::clone(&peers),
        Arc::clone(&store),
        Some(commit_tx),
    ));

    if store.need_bootstrap() {
        tracing::info!("existing graph found, bootstrapping");
        let bootstrap_poset = Arc::clone(&poset);
        tokio::task::spawn_blocking(move || bootstrap_poset.bootstrap()).await??;
    }

    let shutdown = CancellationToken::new();
    let node_config = NodeConfig {
        listen_addr: config.node.listen_addr.parse()?,
        heartbeat: Duration::from_millis(config.node.heartbeat_ms),
        tcp_timeout: Duration::from_millis(config.node.tcp_timeout_ms),
        sync_limit: config.node.sync_limit,
        selector,
    };
    let node = Arc::new(Node::new(
        node_config,
        keypair,
        Arc::clone(&peers),
        Arc::clone(&poset),
        shutdown.clone(),
    )?);

    // Commit fan-out toward the application gateway, bounded end to end.
    let (app_tx, app_rx) = mpsc::channel(constants::COMMIT_CHANNEL_CAPACITY);
    tokio::spawn(consume_commits(Arc::clone(&node), commit_rx, app_tx));

    let gateway = AppGateway::new(
        Arc::clone(&node),
        config.node.proxy_listen_addr.parse()?,
        app_rx,
        shutdown.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = gateway.run().await {
            tracing::error!(error = %e, "application gateway failed");
        }
    });

    let service_addr: SocketAddr = config.node.service_addr.parse()?;
    let service_poset = Arc::clone(&poset);
    let service_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = service::serve(service_addr, service_poset, service_shutdown).await {
            tracing::error!(error = %e, "stats service failed");
        }
    });

    if test_count > 0 {
        let test_node = Arc::clone(&node);
        tokio::spawn(async move {
            for i in 0..test_count {
                test_node.submit_transaction(format!("test-tx-{i}").into_bytes());
                tokio::time::sleep(Duration::from_millis(test_delay)).await;
            }
            tracing::info!(count = test_count, "test transactions submitted");
        });
    }

    let runner = tokio::spawn(Arc::clone(&node).run());

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");
    shutdown.cancel();
    let _ = runner.await;
    store.close()?;
    Ok(())
}

/// Load the node key from `datadir/priv_key.hex`, generating one on first
/// run.
fn load_or_generate_keypair(data_dir: &std::path::Path) -> std::io::Result<SigningKeypair> {
    let key_path = data_dir.join("priv_key.hex");
    if key_path.exists() {
        let contents = std::fs::read_to_string(&key_path)?;
        let seed = hex::decode(contents.trim())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        return SigningKeypair::from_seed(&seed).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "corrupt key file")
        });
    }
    let keypair = SigningKeypair::generate();
    std::fs::write(&key_path, hex::encode(keypair.seed()))?;
    Ok(keypair)
}
