//! Thrylos node daemon.
//!
//! # Usage
//!
//! ```bash
//! # Start a node (configuration comes from the environment)
//! DATA_DIR=/var/lib/thrylos HTTP_ADDRESS=127.0.0.1:6080 \
//! AES_KEY=$(head -c32 /dev/urandom | base64) GENESIS_ACCOUNT=<address> \
//! thrylosd node
//!
//! # Generate a keypair and its address
//! thrylosd keygen
//! ```

use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use thrylos::node::{Node, NodeConfig, NoopPeerSender};
use thrylos::storage::SledStore;
use thrylos::types::Address;
use thrylos_crypto::KeyPair;

/// Thrylos proof-of-stake node and key tool.
#[derive(Parser)]
#[command(name = "thrylosd")]
#[command(version)]
#[command(about = "Thrylos blockchain node", long_about = None)]
struct Cli {
    /// Verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node; configuration is read from the environment
    Node,
    /// Generate an Ed25519 keypair and print its chain address
    Keygen(KeygenArgs),
}

#[derive(Args)]
struct KeygenArgs {
    /// Derive the key deterministically from a seed string
    #[arg(long)]
    seed: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Keygen(args) => keygen(args),
        Commands::Node => {
            if run_node().await.is_err() {
                std::process::exit(1);
            }
        }
    }
}

fn keygen(args: KeygenArgs) {
    let keypair = match args.seed {
        Some(seed) => KeyPair::from_seed(seed.as_bytes()),
        None => KeyPair::generate(),
    };
    let address = Address::from_public_key(&keypair.public_key());

    println!("address:     {address}");
    println!("public key:  {}", hex::encode(keypair.public_key().to_bytes()));
    println!("private key: {}", hex::encode(keypair.to_bytes()));
    println!();
    println!("Keep the private key offline; anyone holding it can spend.");
}

async fn run_node() -> Result<(), ()> {
    let config = NodeConfig::from_env().map_err(|err| {
        error!("Configuration error: {err}");
    })?;
    info!("Starting thrylosd with {config:?}");
    if config.testnet {
        info!("Running in testnet mode");
    }

    let store = SledStore::open(config.data_dir.join("chain")).map_err(|err| {
        error!("Failed to open store: {err}");
    })?;

    let node = Node::new(config, Arc::new(store), Arc::new(NoopPeerSender)).map_err(|err| {
        error!("Failed to assemble node: {err}");
    })?;

    node.check_integrity().map_err(|err| {
        error!("Chain integrity check failed: {err}");
    })?;
    info!("Chain integrity check passed");

    node.start();

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Signal handler failed: {err}");
    }
    node.stop();
    Ok(())
}
