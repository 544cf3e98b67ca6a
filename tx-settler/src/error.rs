use plutus_ledger_api::csl::pla_to_csl::TryFromPLAError;
use thiserror::Error;

use crate::{
    chain_query::ChainQueryError, ledger::LedgerError, retry::RetryError,
    submitter::SubmitterError, wallet::WalletError,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not enough funds to generate the transaction: {available} available vs {required} required")]
    InsufficientFunds { available: u64, required: u64 },

    #[error("Payout of {amount} lovelace to {address} is below the minimum UTxO value of {minimum}")]
    OutputBelowMinimum {
        address: String,
        amount: u64,
        minimum: u64,
    },

    #[error("Change of {change} lovelace carries native tokens but is below the minimum UTxO value of {minimum}")]
    TokenChangeBelowMinimum { change: u64, minimum: u64 },

    #[error("Transaction of {size} bytes exceeds the maximum of {max_size} bytes")]
    TransactionTooLarge { size: usize, max_size: u32 },

    #[error("Expected {expected} witnesses, but the transaction carries {actual}")]
    WitnessCountMismatch { expected: usize, actual: usize },

    #[error("Assembled transaction hash {actual} differs from the expected {expected}")]
    HashMismatch { expected: String, actual: String },

    #[error("Invalid witness: {0}")]
    InvalidWitness(String),

    #[error("Invalid multisig key set: {0}")]
    InvalidKeySet(String),

    #[error(transparent)]
    TryFromPLAError(#[from] TryFromPLAError),

    #[error("Couldn't convert {label}: {source}")]
    ConversionError {
        label: String,
        source: anyhow::Error,
    },

    #[error("Transaction building failed: {0}")]
    TransactionBuildError(anyhow::Error),

    #[error("Chain query failed: {0}")]
    ChainQueryError(#[from] RetryError<ChainQueryError>),

    #[error("Transaction submission failed: {0}")]
    SubmitterError(#[from] RetryError<SubmitterError>),

    #[error("Ledger chain request failed: {0}")]
    LedgerError(#[from] LedgerError),

    #[error("Wallet error: {0}")]
    WalletError(#[from] WalletError),

    #[error("Error occurred due to a configuration for {0}")]
    InvalidConfiguration(String),
}

impl Error {
    pub(crate) fn conversion(label: &str, source: impl Into<anyhow::Error>) -> Self {
        Error::ConversionError {
            label: label.to_string(),
            source: source.into(),
        }
    }
}
