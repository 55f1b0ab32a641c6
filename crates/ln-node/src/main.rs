use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use libp2p::Multiaddr;
use ln_node::{AccountManager, NodeConfig, NodeEvent, NodeService, P2pConfig, P2pServer, ServiceContext, Wallet};
use ln_sync::SyncMode;
use ln_types::{Address, U256};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Ledger node daemon.
#[derive(Parser, Debug)]
#[command(
    name = "ln-node",
    version,
    about = "Peer-to-peer ledger node",
    long_about = "Runs a ledger node: keeps the chain, admits transactions, \
                  syncs with peers over gossip and optionally mines."
)]
struct Cli {
    /// Data directory for the transaction journal and PoW datasets.
    /// Omit to run ephemerally.
    #[arg(long, env = "LN_DATADIR")]
    datadir: Option<PathBuf>,

    /// TCP port to listen on.
    #[arg(short, long, default_value_t = 30303, env = "LN_PORT")]
    port: u16,

    /// Network identifier.
    #[arg(long, default_value_t = 1, env = "LN_NETWORK_ID")]
    network_id: u64,

    /// Sync mode: full or fast.
    #[arg(long, default_value = "fast", env = "LN_SYNC_MODE")]
    syncmode: SyncMode,

    /// Keep all state in memory instead of flushing on a timer.
    #[arg(long, default_value_t = false, env = "LN_NO_PRUNING")]
    no_pruning: bool,

    /// Total peer slots.
    #[arg(long, default_value_t = 25, env = "LN_MAX_PEERS")]
    max_peers: usize,

    /// Percentage of time allowed for serving light clients (0 disables).
    #[arg(long, default_value_t = 0, env = "LN_LIGHT_SERV")]
    light_serv: u32,

    /// Peer slots reserved for light clients.
    #[arg(long, default_value_t = 100, env = "LN_LIGHT_PEERS")]
    light_peers: usize,

    /// Peers to dial on startup.
    #[arg(long, value_delimiter = ',', env = "LN_BOOTNODES")]
    bootnodes: Vec<Multiaddr>,

    /// Disable mDNS discovery.
    #[arg(long, default_value_t = false, env = "LN_NO_MDNS")]
    no_mdns: bool,

    /// Mining beneficiary.
    #[arg(long, env = "LN_ETHERBASE")]
    etherbase: Option<Address>,

    /// Start mining.
    #[arg(long, default_value_t = false, env = "LN_MINE")]
    mine: bool,

    /// Block extra-data set by the miner.
    #[arg(long, env = "LN_EXTRA_DATA")]
    extra_data: Option<String>,

    /// Minimum gas price for mined transactions, in wei.
    #[arg(long, env = "LN_GAS_PRICE")]
    gas_price: Option<u64>,

    /// Single-node proof-of-authority chain with a throw-away signer.
    #[arg(long, default_value_t = false, env = "LN_DEV")]
    dev: bool,

    /// Block period of the development chain, in seconds.
    #[arg(long, default_value_t = 0, env = "LN_DEV_PERIOD")]
    dev_period: u64,

    /// Skip the chain database version check.
    #[arg(long, default_value_t = false, env = "LN_SKIP_BC_VERSION_CHECK")]
    skip_bc_version_check: bool,

    /// Suppress log output to stderr (run silently).
    #[arg(short, long, default_value_t = false, env = "LN_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_filter = if cli.quiet {
        EnvFilter::new("off")
    } else {
        EnvFilter::from_default_env().add_directive("ln_node=info".parse()?)
    };
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let accounts = Arc::new(AccountManager::default());
    let mut config = if cli.dev {
        let wallet = Wallet::generate("keystore://dev");
        let signer = wallet.accounts()[0];
        accounts.add_wallet(wallet);
        info!(%signer, "Using developer account");
        NodeConfig::dev(signer, cli.dev_period)
    } else {
        NodeConfig {
            network_id: cli.network_id,
            sync_mode: cli.syncmode,
            ..NodeConfig::default()
        }
    };
    config.no_pruning = cli.no_pruning;
    config.light_serv = cli.light_serv;
    config.light_peers = cli.light_peers;
    config.skip_bc_version_check = cli.skip_bc_version_check;
    if let Some(etherbase) = cli.etherbase {
        config.etherbase = Some(etherbase);
    }
    if let Some(extra) = cli.extra_data {
        config.extra_data = extra.into_bytes();
    }
    if let Some(price) = cli.gas_price {
        config.gas_price = U256::from(price);
    }

    info!(
        port = cli.port,
        network = config.network_id,
        mode = %config.sync_mode,
        "Starting ledger node"
    );

    let ctx = ServiceContext::new(cli.datadir, accounts);
    let node = NodeService::new(ctx, config).await.context("failed to create node service")?;

    let server = P2pServer::new(P2pConfig {
        listen_port: cli.port,
        max_peers: cli.max_peers,
        bootnodes: cli.bootnodes,
        mdns: !cli.no_mdns,
    });
    info!(peer_id = %server.peer_id(), "Local peer id");
    node.start(&server).await.context("failed to start node service")?;
    server.spawn(node.protocol_manager())?;

    if cli.mine || cli.dev {
        if let Err(err) = node.start_mining(true) {
            warn!(%err, "Mining not started");
        }
    }

    let mut events = node.event_mux().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                NodeEvent::NewMinedBlock(block) => {
                    info!(number = block.number(), hash = %block.hash(), "Mined new block")
                }
                other => info!("NodeEvent: {other:?}"),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Got interrupt, shutting down");
    server.stop().await;
    node.stop().await?;
    Ok(())
}
