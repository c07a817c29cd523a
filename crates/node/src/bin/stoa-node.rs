//! The stoa validator binary.
//!
//! Loads a TOML configuration, assembles a node over its data directory, and
//! runs the event loop. Without a peer transport configured this is a
//! standalone chain of one validator, which is still useful for development
//! and soak testing.
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 consensus
//! divergence.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use stoa_crypto::Pair;
use stoa_node::genesis::GenesisSpec;
use stoa_node::runner::{self, NullNetwork};
use stoa_node::store::FileStore;
use stoa_node::Node;
use stoa_types::app::{Hash, TxType, UtxoValue};
use stoa_types::config::NodeConfig;
use stoa_types::error::ConfigError;
use stoa_validator::EnrollmentManager;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "stoa-node", about = "stoa validator node")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "stoa.toml")]
    config: PathBuf,

    /// Overrides the configured validator seed (hex scalar).
    #[arg(long)]
    seed: Option<String>,
}

fn load_config(args: &Args) -> Result<NodeConfig, ConfigError> {
    let raw = std::fs::read_to_string(&args.config)
        .map_err(|e| ConfigError::Io(format!("{}: {e}", args.config.display())))?;
    let mut config: NodeConfig =
        toml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
    if let Some(seed) = &args.seed {
        config.seed = Some(seed.clone());
    }
    config.validate()?;
    Ok(config)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration rejected");
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "runtime startup failed");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(Fault::Config(e)) => {
            error!(error = %e, "startup failed");
            ExitCode::from(1)
        }
        Err(Fault::Fatal(e)) => {
            error!(error = %e, "fatal error; stopping");
            ExitCode::from(2)
        }
    }
}

enum Fault {
    Config(anyhow::Error),
    Fatal(stoa_types::error::FatalError),
}

async fn run(config: NodeConfig) -> Result<(), Fault> {
    let seed = config
        .seed
        .as_deref()
        .ok_or_else(|| Fault::Config(anyhow::anyhow!("a seed is required")))?;
    let pair = Pair::from_seed_hex(seed).map_err(|e| Fault::Config(e.into()))?;

    // Until a peer transport is wired in, the node bootstraps a standalone
    // network: its own stake, its own enrollment, a quorum of one. All of it
    // lives under the configured data directory, so a restarted process
    // resumes the same chain instead of starting a new one.
    let store = Arc::new(
        FileStore::open(&config.data_dir).map_err(|e| Fault::Config(e.into()))?,
    );
    let params = config.consensus.clone();
    let stake_key = GenesisSpec::stake_utxo_key(pair.public(), params.min_freeze_stake);
    let owner = pair.public();
    let stake = params.min_freeze_stake;
    let finder = move |key: &Hash| {
        (*key == stake_key).then_some(UtxoValue {
            unlock_height: 0,
            tx_type: TxType::Freeze,
            amount: stake,
            address: owner,
        })
    };
    let mut manager =
        EnrollmentManager::load(store.clone(), params.min_freeze_stake, params.cycle_length)
            .map_err(|e| Fault::Config(e.into()))?;
    let enrollment = match manager.own().map(|own| own.enroll_key) {
        // A previous run already enrolled; reuse the persisted record so the
        // pre-image chain and signature noise stay the ones genesis saw.
        Some(enroll_key) => manager.get(&enroll_key).cloned().ok_or_else(|| {
            Fault::Config(anyhow::anyhow!("own enrollment record is missing from the store"))
        })?,
        None => manager
            .create_own(&finder, stake_key, &pair)
            .map_err(|e| Fault::Config(e.into()))?,
    };
    drop(manager);

    let genesis = GenesisSpec {
        stakes: vec![(pair.public(), params.min_freeze_stake)],
        enrollments: vec![enrollment],
        funding: vec![],
    }
    .build();

    let node = Node::new(pair, params, store, genesis).map_err(Fault::Config)?;
    info!(key = %node.public_key(), "node assembled");

    let (tx, rx) = mpsc::unbounded_channel();
    runner::run(node, rx, tx, Arc::new(NullNetwork))
        .await
        .map_err(Fault::Fatal)
}
