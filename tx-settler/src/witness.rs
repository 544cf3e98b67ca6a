//! Witness collection and final assembly of settlement transactions

use std::collections::BTreeSet;

use anyhow::anyhow;
use data_encoding::HEXLOWER;
use plutus_ledger_api::csl::{csl_to_pla::ToPLA, lib as csl};
use plutus_ledger_api::v3::transaction::TransactionHash;
use tracing::debug;

use crate::error::{Error, Result};
use crate::tx_builder::BuiltTx;
use crate::wallet::Signer;

/// Witnesses of one transaction, primary wallet first, then the fee wallet
#[derive(Clone, Default)]
pub struct WitnessSet {
    primary: Vec<csl::Vkeywitness>,
    fee: Vec<csl::Vkeywitness>,
}

impl WitnessSet {
    pub fn new(primary: Vec<csl::Vkeywitness>, fee: Vec<csl::Vkeywitness>) -> Self {
        WitnessSet { primary, fee }
    }

    /// Decode CBOR encoded vkey witnesses
    pub fn from_bytes(primary: &[Vec<u8>], fee: &[Vec<u8>]) -> Result<Self> {
        let decode = |witnesses: &[Vec<u8>]| {
            witnesses
                .iter()
                .map(|bytes| {
                    csl::Vkeywitness::from_bytes(bytes.clone())
                        .map_err(|err| Error::InvalidWitness(format!("{}", err)))
                })
                .collect::<Result<Vec<_>>>()
        };

        Ok(WitnessSet {
            primary: decode(primary)?,
            fee: decode(fee)?,
        })
    }

    pub fn primary(&self) -> &[csl::Vkeywitness] {
        &self.primary
    }

    pub fn fee(&self) -> &[csl::Vkeywitness] {
        &self.fee
    }

    pub fn len(&self) -> usize {
        self.primary.len() + self.fee.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &csl::Vkeywitness> {
        self.primary.iter().chain(self.fee.iter())
    }

    pub fn primary_bytes(&self) -> Vec<Vec<u8>> {
        self.primary.iter().map(|witness| witness.to_bytes()).collect()
    }

    pub fn fee_bytes(&self) -> Vec<Vec<u8>> {
        self.fee.iter().map(|witness| witness.to_bytes()).collect()
    }
}

/// Sign the transaction hash once with every key. Signers are independent of each other.
pub fn collect_witnesses<P, F>(tx: &BuiltTx, primary_signers: &[P], fee_signers: &[F]) -> WitnessSet
where
    P: Signer,
    F: Signer,
{
    let tx_hash = tx.transaction().transaction_hash();

    let primary = primary_signers
        .iter()
        .map(|signer| signer.make_witness(&tx_hash))
        .collect();
    let fee = fee_signers
        .iter()
        .map(|signer| signer.make_witness(&tx_hash))
        .collect();

    debug!(
        tx_hash = ?tx.tx_hash(),
        primary = primary_signers.len(),
        fee = fee_signers.len(),
        "Collected witnesses"
    );

    WitnessSet { primary, fee }
}

/// Check that a witness is a valid signature of `tx_hash`
pub fn verify_witness(tx_hash: &csl::TransactionHash, witness: &csl::Vkeywitness) -> bool {
    witness
        .vkey()
        .public_key()
        .verify(&tx_hash.to_bytes(), &witness.signature())
}

/// Signature thresholds of the m-of-n native scripts attached to `tx`, in attachment order
pub fn script_thresholds(tx: &csl::FixedTransaction) -> Vec<usize> {
    let Some(scripts) = tx.witness_set().native_scripts() else {
        return Vec::new();
    };

    (0..scripts.len())
        .filter_map(|index| scripts.get(index).as_script_n_of_k())
        .map(|script| script.n() as usize)
        .collect()
}

/// Make sure `witnesses` can satisfy the multisig scripts of `tx`. The first script belongs to
/// the primary wallet, the second one (if any) to the fee wallet.
pub fn check_thresholds(tx: &csl::FixedTransaction, witnesses: &WitnessSet) -> Result<()> {
    let thresholds = script_thresholds(tx);
    if thresholds.is_empty() {
        return Err(Error::InvalidWitness(
            "transaction carries no multisig script".to_string(),
        ));
    }

    let provided = [witnesses.primary().len(), witnesses.fee().len()];
    for (&expected, &actual) in thresholds.iter().zip(provided.iter()) {
        if actual < expected {
            return Err(Error::WitnessCountMismatch { expected, actual });
        }
    }

    Ok(())
}

/// Fully witnessed transaction, ready for submission
pub struct SignedTransaction {
    tx: csl::FixedTransaction,
    tx_hash: TransactionHash,
}

impl SignedTransaction {
    pub fn transaction(&self) -> &csl::FixedTransaction {
        &self.tx
    }

    pub fn tx_hash(&self) -> &TransactionHash {
        &self.tx_hash
    }

    pub fn raw(&self) -> Vec<u8> {
        self.tx.to_bytes()
    }

    pub fn witness_count(&self) -> usize {
        self.tx.witness_set().vkeys().map_or(0, |vkeys| vkeys.len())
    }
}

/// Attach `witnesses` to the unsigned transaction `raw_tx`.
///
/// The transaction must end up with exactly `expected_count` valid witnesses of distinct keys,
/// and its hash must still be `expected_hash`.
pub fn assemble(
    raw_tx: &[u8],
    expected_hash: &TransactionHash,
    witnesses: &WitnessSet,
    expected_count: usize,
) -> Result<SignedTransaction> {
    if witnesses.len() != expected_count {
        return Err(Error::WitnessCountMismatch {
            expected: expected_count,
            actual: witnesses.len(),
        });
    }

    let signers: BTreeSet<Vec<u8>> = witnesses
        .iter()
        .map(|witness| witness.vkey().public_key().as_bytes())
        .collect();
    if signers.len() != expected_count {
        return Err(Error::WitnessCountMismatch {
            expected: expected_count,
            actual: signers.len(),
        });
    }

    let mut tx = csl::FixedTransaction::from_bytes(raw_tx.to_vec())
        .map_err(|err| Error::conversion("raw transaction", anyhow!(err)))?;
    let csl_hash = tx.transaction_hash();

    for witness in witnesses.iter() {
        if !verify_witness(&csl_hash, witness) {
            return Err(Error::InvalidWitness(format!(
                "signature of key {} does not match transaction {}",
                HEXLOWER.encode(&witness.vkey().public_key().hash().to_bytes()),
                csl_hash.to_hex()
            )));
        }

        tx.add_vkey_witness(witness);
    }

    let signed = csl::FixedTransaction::from_bytes(tx.to_bytes())
        .map_err(|err| Error::conversion("signed transaction", anyhow!(err)))?;
    let tx_hash: TransactionHash = signed.transaction_hash().to_pla();

    if &tx_hash != expected_hash {
        return Err(Error::HashMismatch {
            expected: format!("{:?}", expected_hash),
            actual: format!("{:?}", tx_hash),
        });
    }

    let signed = SignedTransaction { tx: signed, tx_hash };
    if signed.witness_count() != expected_count {
        return Err(Error::WitnessCountMismatch {
            expected: expected_count,
            actual: signed.witness_count(),
        });
    }

    Ok(signed)
}
