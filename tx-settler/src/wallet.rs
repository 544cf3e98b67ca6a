//! Signing capability of multisig co-signers

use plutus_ledger_api::{csl::lib as csl, v3::crypto::Ed25519PubKeyHash};
use thiserror::Error;

/// Holder of a UTxO chain signing key. Only ever asked to sign a transaction hash, the key
/// itself never leaves the implementation.
pub trait Signer {
    /// Hash of the verification key, as listed in the multisig policy
    fn key_hash(&self) -> Ed25519PubKeyHash;

    /// Witness over `tx_hash`
    fn make_witness(&self, tx_hash: &csl::TransactionHash) -> csl::Vkeywitness;
}

impl<S: Signer + ?Sized> Signer for &S {
    fn key_hash(&self) -> Ed25519PubKeyHash {
        (**self).key_hash()
    }

    fn make_witness(&self, tx_hash: &csl::TransactionHash) -> csl::Vkeywitness {
        (**self).make_witness(tx_hash)
    }
}

#[derive(Error, Debug)]
#[error(transparent)]
pub struct WalletError(pub anyhow::Error);
