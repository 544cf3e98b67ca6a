mod config;

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tx_settler::{
    bridge::BridgeContractAdapter,
    ledger::{client::LedgerClientWrapper, LedgerWallet},
    poller::{BatcherCycle, FetchFailurePolicy, PollCycle, RelayerCycle, SettlementPoller},
    tx_builder::BatchTxBuilder,
    utils::key_wallet::KeyWallet,
};
use tx_settler_evm::{rpc::AlloyConnector, wallet::AlloyLedgerWallet};
use tx_settler_ogmios::client::OgmiosClient;

use crate::config::{LedgerConfig, NodeConfig};

type Bridge = BridgeContractAdapter<AlloyConnector, AlloyLedgerWallet>;

#[derive(Debug, clap::Args)]
struct RunArgs {
    /// JSON config file
    #[arg(short, long)]
    config: PathBuf,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Sign settlement transactions of pending transfers and report them to the bridge contract
    Batcher(RunArgs),
    /// Submit fully witnessed batches to the UTxO chains
    Relayer(RunArgs),
}

/// Bridge settlement daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    #[arg(long, short, action, global = true)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(if args.debug {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(err = %err, "Couldn't listen for the shutdown signal");
            }
            info!("Shutting down");
            cancel.cancel();
        }
    });

    match args.command {
        Command::Batcher(run_args) => {
            let config = NodeConfig::load(&run_args.config).await?;
            run_pollers(batchers(&config).await?, &cancel).await
        }
        Command::Relayer(run_args) => {
            let config = NodeConfig::load(&run_args.config).await?;
            run_pollers(relayers(&config).await?, &cancel).await
        }
    }
}

async fn bridge(config: &LedgerConfig) -> Result<Bridge> {
    let wallet = AlloyLedgerWallet::from_key_file(&config.key_file)
        .await
        .with_context(|| format!("Couldn't load ledger key {}", config.key_file.display()))?;

    info!(address = %wallet.address(), contract = %config.bridge_contract, "Ledger wallet loaded");

    let client = LedgerClientWrapper::new(
        AlloyConnector::new(config.node_url.clone()),
        wallet,
        config.nonce_strategy,
        config.tx_config()?,
    );

    Ok(BridgeContractAdapter::new(client, config.bridge_contract))
}

async fn load_signers(paths: &[PathBuf]) -> Result<Vec<KeyWallet>> {
    let mut signers = Vec::with_capacity(paths.len());
    for path in paths {
        let signer = KeyWallet::from_skey_file(path)
            .await
            .with_context(|| format!("Couldn't load signing key {}", path.display()))?;
        signers.push(signer);
    }
    Ok(signers)
}

async fn batchers(
    config: &NodeConfig,
) -> Result<Vec<SettlementPoller<BatcherCycle<Bridge, OgmiosClient, KeyWallet>>>> {
    let mut pollers = Vec::with_capacity(config.chains.len());

    for (chain_id, chain) in &config.chains {
        let ogmios = OgmiosClient::connect(chain.ogmios_config()?)
            .await
            .with_context(|| format!("Couldn't connect to Ogmios of chain {}", chain_id))?;

        let cycle = BatcherCycle::new(
            bridge(&config.ledger).await?,
            BatchTxBuilder::new(ogmios, chain.builder_config()?),
            chain_id.clone(),
            load_signers(&chain.primary_key_files).await?,
            load_signers(&chain.fee_key_files).await?,
        );

        info!(chain_id = %chain_id, "Batcher ready");
        pollers.push(SettlementPoller::new(
            cycle,
            config.pull_interval(),
            FetchFailurePolicy::Exit,
        ));
    }

    Ok(pollers)
}

async fn relayers(config: &NodeConfig) -> Result<Vec<SettlementPoller<RelayerCycle<Bridge, OgmiosClient>>>> {
    let mut pollers = Vec::with_capacity(config.chains.len());

    for (chain_id, chain) in &config.chains {
        let ogmios = OgmiosClient::connect(chain.ogmios_config()?)
            .await
            .with_context(|| format!("Couldn't connect to Ogmios of chain {}", chain_id))?;

        let cycle = RelayerCycle::new(
            bridge(&config.ledger).await?,
            ogmios,
            chain_id.clone(),
            chain.await_confirmation,
        );

        info!(chain_id = %chain_id, "Relayer ready");
        pollers.push(SettlementPoller::new(
            cycle,
            config.pull_interval(),
            FetchFailurePolicy::Continue,
        ));
    }

    Ok(pollers)
}

/// Run every poller until cancellation, or until one of them gives up
async fn run_pollers<C: PollCycle>(mut pollers: Vec<SettlementPoller<C>>, cancel: &CancellationToken) -> Result<()> {
    let results = join_all(pollers.iter_mut().map(|poller| poller.run(cancel))).await;

    let failures = results
        .into_iter()
        .filter_map(|result| result.err())
        .inspect(|err| error!(phase = %err.phase, err = %err.source, "Settlement loop failed"))
        .count();

    if failures > 0 {
        return Err(anyhow!("{} settlement loop(s) failed", failures));
    }

    Ok(())
}
