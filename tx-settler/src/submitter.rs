use std::future::Future;

use plutus_ledger_api::{csl::lib as csl, v3::transaction::TransactionHash};
use thiserror::Error;

use crate::retry::{ErrorPolicy, ErrorPolicyProvider};

/// Component which can submit write actions to the UTxO chain
pub trait Submitter {
    /// Submit a fully built and signed transaction
    fn submit_transaction(
        &self,
        tx: &csl::FixedTransaction,
    ) -> impl Future<Output = Result<TransactionHash, SubmitterError>>;

    /// Wait for transaction confirmation on the chain
    fn await_tx_confirm(
        &self,
        tx_hash: &TransactionHash,
    ) -> impl Future<Output = Result<(), SubmitterError>>;
}

#[derive(Error, Debug)]
pub enum SubmitterError {
    #[error("Submission transport failure: {0}")]
    Transport(anyhow::Error),

    #[error("Transaction rejected: {0}")]
    Rejected(anyhow::Error),

    #[error(transparent)]
    Other(anyhow::Error),
}

impl ErrorPolicyProvider for SubmitterError {
    fn get_error_policy(&self) -> ErrorPolicy {
        match self {
            SubmitterError::Transport(_) => ErrorPolicy::Retry,
            SubmitterError::Rejected(_) | SubmitterError::Other(_) => ErrorPolicy::Exit,
        }
    }
}
