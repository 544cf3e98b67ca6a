use std::collections::BTreeMap;
use std::future::Future;

use num_traits::ToPrimitive;
use plutus_ledger_api::v3::{
    address::Address,
    transaction::TransactionInput,
    value::{CurrencySymbol, TokenName, Value},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::{ErrorPolicy, ErrorPolicyProvider};

/// A chain query client responsible for all read actions from the UTxO chain (no write)
pub trait ChainQuery {
    /// Query the network id (not identical to network magic)
    fn get_network(&self) -> Network;

    /// Query protocol parameters
    fn query_protocol_params(
        &self,
    ) -> impl Future<Output = Result<ProtocolParameters, ChainQueryError>>;

    fn query_tip(&self) -> impl Future<Output = Result<ChainTip, ChainQueryError>>;

    /// Query UTxOs at an address
    fn query_utxos_by_addr(
        &self,
        address: &Address,
    ) -> impl Future<Output = Result<BTreeMap<TransactionInput, FullTransactionOutput>, ChainQueryError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Testnet = 0b0000,
    Mainnet = 0b0001,
}

impl Network {
    pub fn to_network_id(&self) -> u8 {
        match self {
            Network::Testnet => 0b0000,
            Network::Mainnet => 0b0001,
        }
    }

    pub fn address_prefix(&self) -> &'static str {
        match self {
            Network::Testnet => "addr_test",
            Network::Mainnet => "addr",
        }
    }
}

#[derive(Error, Debug)]
pub enum ChainQueryError {
    #[error("Chain query transport failure: {0}")]
    Transport(anyhow::Error),

    /// Sentinel for "no result yet", always retried
    #[error("Chain query returned no result yet")]
    TryAgain,

    #[error(transparent)]
    Other(anyhow::Error),
}

impl ErrorPolicyProvider for ChainQueryError {
    fn get_error_policy(&self) -> ErrorPolicy {
        match self {
            ChainQueryError::Transport(_) | ChainQueryError::TryAgain => ErrorPolicy::Retry,
            ChainQueryError::Other(_) => ErrorPolicy::Exit,
        }
    }
}

/// The protocol parameters needed for fee and minimum UTxO computation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolParameters {
    /// Lovelace per transaction byte
    pub min_fee_coefficient: u64,
    pub min_fee_constant: u64,
    /// Lovelace per UTxO byte
    pub coins_per_utxo_byte: u64,
    pub max_transaction_size: Option<u32>,
    pub max_value_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainTip {
    Origin,
    Point { slot: u64, id: String },
}

impl ChainTip {
    pub fn slot(&self) -> u64 {
        match self {
            ChainTip::Origin => 0,
            ChainTip::Point { slot, id: _ } => *slot,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullTransactionOutput {
    pub address: Address,
    pub value: Value,
}

impl FullTransactionOutput {
    /// Lovelace held by the output. Amounts outside of `u64` are treated as 0.
    pub fn lovelace(&self) -> u64 {
        self.value
            .0
            .get(&CurrencySymbol::Ada)
            .and_then(|tokens| tokens.get(&TokenName::ada()))
            .and_then(|amount| amount.to_u64())
            .unwrap_or_default()
    }

    pub fn has_native_tokens(&self) -> bool {
        self.value
            .0
            .iter()
            .any(|(cur_sym, tokens)| *cur_sym != CurrencySymbol::Ada && !tokens.is_empty())
    }
}
