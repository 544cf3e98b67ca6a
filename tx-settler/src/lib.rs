//! Transaction Settler
//!
//! Client side settlement engine of a bridge between an EVM ledger chain and a Cardano multisig
//! wallet. A settlement loop pulls pending transfers from the bridge contract, builds the
//! transaction paying them out, collects witnesses of the co-signers and reports the signed
//! batch back to the contract.

pub use plutus_ledger_api::csl::lib as csl;

pub mod bridge;
pub mod chain_query;
pub mod error;
pub mod ledger;
pub mod metadata;
pub mod multisig;
pub mod poller;
pub mod retry;
pub mod submitter;
pub mod tx_builder;
pub mod utils;
pub mod wallet;
pub mod witness;
