use std::sync::Arc;

use colored::*;
use tracing_subscriber::EnvFilter;

use catena::config::NodeConfig;
use catena::consensus::app::CounterApplication;
use catena::consensus::chain::MemoryChain;
use catena::consensus::ledger::Ledger;
use catena::crypto::keys::Identity;
use catena::miner::miner::Miner;
use catena::net::node::Node;
use catena::primitives::block::Block;
use catena::primitives::payload::TransactionPayload;

fn banner() {
    println!(
        "{}",
        "  ██████╗ █████╗ ████████╗███████╗███╗   ██╗ █████╗ ".bright_cyan()
    );
    println!(
        "{}",
        " ██╔════╝██╔══██╗╚══██╔══╝██╔════╝████╗  ██║██╔══██╗".bright_cyan()
    );
    println!(
        "{}",
        " ██║     ███████║   ██║   █████╗  ██╔██╗ ██║███████║".bright_cyan().bold()
    );
    println!(
        "{}",
        " ██║     ██╔══██║   ██║   ██╔══╝  ██║╚██╗██║██╔══██║".blue()
    );
    println!(
        "{}",
        " ╚██████╗██║  ██║   ██║   ███████╗██║ ╚████║██║  ██║".blue()
    );
    println!(
        "{}",
        "  ╚═════╝╚═╝  ╚═╝   ╚═╝   ╚══════╝╚═╝  ╚═══╝╚═╝  ╚═╝".blue()
    );
    println!();
    println!(
        "{}",
        "        SQL ledger over proof-of-work gossip        "
            .bright_green()
            .bold()
    );
    println!();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("catena=info")),
        )
        .init();

    banner();

    let mut config = NodeConfig::default();

    // Environment overrides for multi-node testing.
    if let Ok(p) = std::env::var("CATENA_P2P_PORT")
        && let Ok(port) = p.parse()
    {
        config.port = port;
    }
    if let Ok(v) = std::env::var("CATENA_PASSIVE") {
        config.passive = v == "1" || v.eq_ignore_ascii_case("true");
    }
    let genesis_seed = std::env::var("CATENA_GENESIS_SEED").unwrap_or_default();
    let genesis_difficulty: usize = std::env::var("CATENA_GENESIS_DIFFICULTY")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(16);
    let mine = std::env::var("CATENA_MINE")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);

    println!(
        "{} mining deterministic genesis (difficulty {genesis_difficulty})",
        "[init]".bright_blue().bold()
    );
    let genesis =
        Block::<TransactionPayload>::genesis(genesis_seed.as_bytes(), genesis_difficulty);
    println!(
        "{} genesis: {}",
        "[init]".bright_blue().bold(),
        genesis.signature.expect("genesis is sealed").to_hex()
    );

    let app = Arc::new(CounterApplication::new());
    let chain = MemoryChain::new(genesis)?;
    let ledger = Arc::new(Ledger::new(chain, app, config.limits.clone()));

    let identity = Identity::generate();
    println!(
        "{} miner identity: {}",
        "[init]".bright_blue().bold(),
        identity.public.hash_string()
    );

    let (mined_tx, mined_rx) = tokio::sync::mpsc::unbounded_channel();
    let miner = Miner::new(ledger.clone(), identity.public.hash(), mined_tx);
    miner.set_enabled(mine);

    let port = config.port;
    let bind = config.bind_address.clone();
    let node = Node::new(config, ledger, miner);
    node.start(mined_rx).await?;

    println!(
        "{} gossip listening on {}:{}",
        "[p2p] ".bright_green().bold(),
        bind,
        port
    );
    println!(
        "{} our peer URL: ws://{}:{}/?uuid={}",
        "[p2p] ".bright_green().bold(),
        bind,
        port,
        node.uuid
    );
    println!(
        "{}",
        "  Seed other nodes with CATENA_SEEDS=<that URL>".bright_yellow()
    );
    println!();

    // Seed peers: comma-separated peer URLs carrying the remote UUID.
    if let Ok(seeds) = std::env::var("CATENA_SEEDS") {
        for seed in seeds.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match node.add_peer_url(seed) {
                Some(peer) => println!(
                    "{} seeded peer {}",
                    "[p2p] ".bright_green().bold(),
                    peer.uuid
                ),
                None => eprintln!(
                    "{} invalid seed '{seed}'",
                    "[p2p] ".bright_red().bold()
                ),
            }
        }
    }

    tokio::signal::ctrl_c().await?;
    println!("{} done", "[shutdown]".bright_red().bold());
    Ok(())
}
