//! Node configuration file

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy_primitives::Address;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tx_settler::{
    chain_query::Network,
    ledger::{
        client::{GasEstimation, LedgerTxConfig, LedgerTxConfigBuilder},
        nonce::NonceStrategy,
    },
    tx_builder::{BuilderConfig, BuilderConfigBuilder, FeePayer},
};
use tx_settler_ogmios::client::{OgmiosClientConfig, OgmiosClientConfigBuilder};
use url::Url;

fn default_pull_time_millis() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    pub ledger: LedgerConfig,
    /// UTxO chains by the chain id the bridge contract knows them by
    pub chains: BTreeMap<String, UtxoChainConfig>,
    #[serde(default = "default_pull_time_millis")]
    pub pull_time_millis: u64,
}

impl NodeConfig {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Couldn't read config file {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: NodeConfig = serde_json::from_str(content).context("Invalid config file")?;

        if config.chains.is_empty() {
            return Err(anyhow!("Config has no UTxO chains"));
        }
        if config.pull_time_millis == 0 {
            return Err(anyhow!("pullTimeMillis must be positive"));
        }

        Ok(config)
    }

    pub fn pull_interval(&self) -> Duration {
        Duration::from_millis(self.pull_time_millis)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasLimitRamp {
    pub min: u64,
    pub max: u64,
    pub steps: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerConfig {
    pub node_url: Url,
    pub bridge_contract: Address,
    /// File holding the hex encoded signing key
    pub key_file: PathBuf,
    #[serde(default)]
    pub dynamic_fees: bool,
    #[serde(default)]
    pub zero_gas_price: bool,
    pub gas_fee_multiplier_percent: Option<u128>,
    /// Estimate gas on the node when absent
    pub gas_limit_ramp: Option<GasLimitRamp>,
    #[serde(default)]
    pub nonce_strategy: NonceStrategy,
    pub receipt_wait_millis: Option<u64>,
    pub receipt_retries: Option<u32>,
    /// Wait for sent transactions to pass through the node's tx pool before polling receipts
    #[serde(default)]
    pub track_tx_pool: bool,
}

impl LedgerConfig {
    pub fn tx_config(&self) -> Result<LedgerTxConfig> {
        let mut builder = LedgerTxConfigBuilder::default();
        builder
            .dynamic_fees(self.dynamic_fees)
            .zero_gas_price(self.zero_gas_price)
            .tx_pool_tracking(self.track_tx_pool);

        if let Some(ramp) = self.gas_limit_ramp {
            builder.gas_estimation(GasEstimation::Ramp {
                min: ramp.min,
                max: ramp.max,
                steps: ramp.steps,
            });
        }
        if let Some(percent) = self.gas_fee_multiplier_percent {
            builder.gas_fee_multiplier_percent(percent);
        }
        if let Some(millis) = self.receipt_wait_millis {
            builder.receipt_wait_time(Duration::from_millis(millis));
        }
        if let Some(retries) = self.receipt_retries {
            builder.receipt_retries(retries);
        }

        builder
            .build()
            .map_err(|err| anyhow!("Invalid ledger chain config: {}", err))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtxoChainConfig {
    pub ogmios_url: Url,
    pub network: Network,
    /// Text envelope files of the local primary multisig co-signers
    pub primary_key_files: Vec<PathBuf>,
    /// Text envelope files of the local fee multisig co-signers
    #[serde(default)]
    pub fee_key_files: Vec<PathBuf>,
    #[serde(default)]
    pub fee_payer: FeePayer,
    pub potential_fee: Option<u64>,
    pub ttl_slot_increment: Option<u64>,
    pub max_inputs: Option<usize>,
    pub min_utxo_lovelace: Option<u64>,
    /// Relayer waits for submitted transactions to leave the mempool
    #[serde(default = "default_true")]
    pub await_confirmation: bool,
}

impl UtxoChainConfig {
    pub fn builder_config(&self) -> Result<BuilderConfig> {
        let mut builder = BuilderConfigBuilder::default();
        builder.fee_payer(self.fee_payer);

        if let Some(fee) = self.potential_fee {
            builder.potential_fee(fee);
        }
        if let Some(increment) = self.ttl_slot_increment {
            builder.ttl_slot_increment(increment);
        }
        if let Some(max_inputs) = self.max_inputs {
            builder.max_inputs(max_inputs);
        }
        if let Some(min_utxo) = self.min_utxo_lovelace {
            builder.min_utxo_lovelace(min_utxo);
        }

        builder
            .build()
            .map_err(|err| anyhow!("Invalid UTxO chain config: {}", err))
    }

    pub fn ogmios_config(&self) -> Result<OgmiosClientConfig> {
        OgmiosClientConfigBuilder::default()
            .url(self.ogmios_url.clone())
            .network(self.network)
            .build()
            .map_err(|err| anyhow!("Couldn't build OgmiosClientConfig: {}", err))
    }
}
