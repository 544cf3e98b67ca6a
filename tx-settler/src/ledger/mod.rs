//! Ledger chain (EVM compatible) access: RPC capabilities, transaction options and errors

use std::future::Future;

use alloy_primitives::{Address, Bytes, B256, U256};
use thiserror::Error;

use crate::retry::{ErrorPolicy, ErrorPolicyProvider, RetryError};

pub mod client;
pub mod gas;
pub mod nonce;

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Node error messages that indicate a temporary condition (mempool races, stale nonces)
pub const TRANSIENT_ERROR_MESSAGES: [&str; 7] = [
    "nonce too low",
    "replacement transaction underpriced",
    "replacement tx underpriced",
    "already known",
    "intrinsic gas too low",
    "tx with the same nonce is already present",
    "rejected future tx due to low slots",
];

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Connection to the ledger node is closed")]
    ConnectionClosed,

    #[error("Transport error: {message}")]
    Transport { message: String, timeout: bool },

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Not found")]
    NotFound,

    /// Sentinel for "no result yet", always retried
    #[error("No result yet, try again")]
    TryAgain,

    #[error("Transaction {tx_hash} was included but failed (gas limit = {gas_limit}, gas used = {gas_used})")]
    ReceiptUnsuccessful {
        tx_hash: B256,
        gas_limit: u64,
        gas_used: u64,
    },

    #[error("Timeout while waiting for transaction {0} to be included")]
    ReceiptTimeout(B256),

    #[error("Timeout while waiting for transaction {0} to leave the tx pool")]
    TxPoolTimeout(B256),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<LedgerError>,
    },

    #[error("Transaction signing failed: {0}")]
    Signing(anyhow::Error),

    #[error(transparent)]
    Other(anyhow::Error),
}

impl LedgerError {
    /// Errors after which the current RPC connection must not be used again
    pub fn is_transport_broken(&self) -> bool {
        match self {
            LedgerError::ConnectionClosed
            | LedgerError::DeadlineExceeded
            | LedgerError::Cancelled
            | LedgerError::Transport { timeout: true, .. } => true,
            LedgerError::RetriesExhausted { last, .. } => last.is_transport_broken(),
            _ => false,
        }
    }

    pub fn is_transient_message(message: &str) -> bool {
        TRANSIENT_ERROR_MESSAGES
            .iter()
            .any(|transient| message.contains(transient))
    }
}

impl ErrorPolicyProvider for LedgerError {
    fn get_error_policy(&self) -> ErrorPolicy {
        match self {
            LedgerError::Cancelled | LedgerError::DeadlineExceeded => ErrorPolicy::Exit,
            LedgerError::ConnectionClosed
            | LedgerError::Transport { .. }
            | LedgerError::TryAgain => ErrorPolicy::Retry,
            LedgerError::Rpc { message, .. } if LedgerError::is_transient_message(message) => {
                ErrorPolicy::Retry
            }
            _ => ErrorPolicy::Exit,
        }
    }
}

impl From<RetryError<LedgerError>> for LedgerError {
    fn from(err: RetryError<LedgerError>) -> LedgerError {
        match err {
            RetryError::Cancelled => LedgerError::Cancelled,
            RetryError::Failed(err) => err,
            RetryError::Exhausted { attempts, last } => LedgerError::RetriesExhausted {
                attempts,
                last: Box::new(last),
            },
        }
    }
}

/// An ABI encoded contract invocation, before any nonce, gas or fee was decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedCall {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
}

impl UnsignedCall {
    pub fn new(to: Address, data: impl Into<Bytes>) -> Self {
        UnsignedCall {
            to,
            data: data.into(),
            value: U256::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasFees {
    Legacy {
        gas_price: u128,
    },
    Dynamic {
        max_fee_per_gas: u128,
        max_priority_fee_per_gas: u128,
    },
}

/// Everything needed on top of an `UnsignedCall` to sign a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerTxOpts {
    pub from: Address,
    pub nonce: u64,
    pub gas_limit: u64,
    pub fees: GasFees,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedLedgerTx {
    pub hash: B256,
    /// EIP-2718 encoded transaction
    pub raw: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerReceipt {
    pub tx_hash: B256,
    pub success: bool,
    pub block_number: Option<u64>,
    pub gas_used: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeeHistory {
    /// Base fees of the requested blocks, followed by the base fee of the next block
    pub base_fee_per_gas: Vec<u128>,
}

/// Read and write access to a ledger chain node
pub trait LedgerRpc {
    fn chain_id(&self) -> impl Future<Output = Result<u64>>;

    /// Nonce including transactions still in the mempool
    fn pending_nonce_at(&self, address: Address) -> impl Future<Output = Result<u64>>;

    /// Nonce as of the latest block
    fn nonce_at(&self, address: Address) -> impl Future<Output = Result<u64>>;

    fn suggest_gas_price(&self) -> impl Future<Output = Result<u128>>;

    fn suggest_gas_tip_cap(&self) -> impl Future<Output = Result<u128>>;

    fn fee_history(&self, block_count: u64) -> impl Future<Output = Result<FeeHistory>>;

    fn estimate_gas(
        &self,
        from: Address,
        call: &UnsignedCall,
    ) -> impl Future<Output = Result<u64>>;

    /// Read-only contract call against the latest state
    fn call(&self, call: &UnsignedCall) -> impl Future<Output = Result<Bytes>>;

    fn send_raw_transaction(&self, raw: &Bytes) -> impl Future<Output = Result<B256>>;

    /// `None` while the transaction is not included in a block
    fn transaction_receipt(
        &self,
        tx_hash: B256,
    ) -> impl Future<Output = Result<Option<LedgerReceipt>>>;

    fn block_number(&self) -> impl Future<Output = Result<u64>>;

    /// Whether `tx_hash` is pending or queued in the tx pool, among the transactions of `address`
    fn is_in_tx_pool(&self, address: Address, tx_hash: B256) -> impl Future<Output = Result<bool>>;
}

/// Creates fresh RPC clients, used after a connection was invalidated
pub trait LedgerConnector {
    type Rpc: LedgerRpc;

    fn connect(&self) -> impl Future<Output = Result<Self::Rpc>>;
}

/// Holder of the ledger chain signing key
pub trait LedgerWallet {
    fn address(&self) -> Address;

    fn sign_transaction(
        &self,
        chain_id: u64,
        call: &UnsignedCall,
        opts: &LedgerTxOpts,
    ) -> impl Future<Output = Result<SignedLedgerTx>>;
}
