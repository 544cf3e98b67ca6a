//! Bridge contract access
//!
//! The bridge contract on the ledger chain keeps the transfers waiting to be paid out on each
//! UTxO chain, and collects the witnesses of the settlement transactions. Values cross the
//! contract boundary as strings (bech32 addresses, hex encoded key hashes, transactions and
//! witnesses); this module converts them from and to the builder's types.

use std::future::Future;

use alloy_primitives::Address;
use alloy_sol_types::{sol, SolCall};
use anyhow::anyhow;
use data_encoding::{HEXLOWER, HEXLOWER_PERMISSIVE};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::ledger::{client::LedgerClientWrapper, LedgerConnector, LedgerReceipt, LedgerWallet, UnsignedCall};
use crate::multisig::MultisigPolicy;
use crate::tx_builder::Payout;

sol! {
    interface IBridgeSettlement {
        function getPendingTransfers(string calldata destinationChainId)
            external
            view
            returns (
                uint64 id,
                string[] memory receivers,
                uint64[] memory amounts,
                string[] memory multisigKeyHashes,
                string[] memory feeKeyHashes
            );

        function submitSignedBatch(
            uint64 id,
            string calldata destinationChainId,
            string calldata rawTransaction,
            string[] calldata multisigSignatures,
            string[] calldata feeSignatures
        ) external;

        function getConfirmedBatch(string calldata destinationChainId)
            external
            view
            returns (
                uint64 id,
                string memory rawTransaction,
                string[] memory multisigSignatures,
                string[] memory feeSignatures
            );
    }
}

use IBridgeSettlement::{getConfirmedBatchCall, getPendingTransfersCall, submitSignedBatchCall};

/// Transfers waiting to be paid out on one UTxO chain. Fetched fresh on every cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransferSet {
    pub id: u64,
    pub payouts: Vec<Payout>,
    /// Co-signers of the primary multisig, hex encoded
    pub multisig_key_hashes: Vec<String>,
    /// Co-signers of the fee multisig, hex encoded
    pub fee_key_hashes: Vec<String>,
}

impl PendingTransferSet {
    /// Sum of all payouts
    pub fn target_amount(&self) -> u64 {
        self.payouts
            .iter()
            .fold(0u64, |sum, payout| sum.saturating_add(payout.amount))
    }

    pub fn primary_policy(&self) -> Result<MultisigPolicy> {
        MultisigPolicy::from_hex(&self.multisig_key_hashes)
    }

    pub fn fee_policy(&self) -> Result<MultisigPolicy> {
        MultisigPolicy::from_hex(&self.fee_key_hashes)
    }
}

/// Settlement transaction with all witnesses the contract gathered for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedBatch {
    pub id: u64,
    pub raw_transaction: Vec<u8>,
    pub multisig_witnesses: Vec<Vec<u8>>,
    pub fee_witnesses: Vec<Vec<u8>>,
}

/// Settlement transaction with the witnesses of this instance's keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedBatch {
    pub id: u64,
    pub destination_chain_id: String,
    pub raw_transaction: Vec<u8>,
    pub multisig_witnesses: Vec<Vec<u8>>,
    pub fee_witnesses: Vec<Vec<u8>>,
}

impl SignedBatch {
    /// `submitSignedBatch` invocation, bytes encoded as lowercase hex
    pub fn to_call(&self, contract: Address) -> UnsignedCall {
        let encode_all =
            |items: &[Vec<u8>]| items.iter().map(|item| HEXLOWER.encode(item)).collect();

        let data = submitSignedBatchCall {
            id: self.id,
            destinationChainId: self.destination_chain_id.clone(),
            rawTransaction: HEXLOWER.encode(&self.raw_transaction),
            multisigSignatures: encode_all(&self.multisig_witnesses),
            feeSignatures: encode_all(&self.fee_witnesses),
        }
        .abi_encode();

        UnsignedCall::new(contract, data)
    }
}

/// Hex string from the contract, `0x` prefix tolerated
pub fn decode_hex(label: &str, value: &str) -> Result<Vec<u8>> {
    let value = value.strip_prefix("0x").unwrap_or(value);
    HEXLOWER_PERMISSIVE
        .decode(value.as_bytes())
        .map_err(|err| Error::conversion(label, anyhow!(err)))
}

/// `None` if nothing is pending (the contract reports batch id 0)
pub fn decode_pending_transfers(data: &[u8]) -> Result<Option<PendingTransferSet>> {
    let ret = getPendingTransfersCall::abi_decode_returns(data)
        .map_err(|err| Error::conversion("getPendingTransfers result", anyhow!(err)))?;

    if ret.id == 0 {
        return Ok(None);
    }

    if ret.receivers.len() != ret.amounts.len() {
        return Err(Error::conversion(
            "getPendingTransfers result",
            anyhow!(
                "{} receivers but {} amounts",
                ret.receivers.len(),
                ret.amounts.len()
            ),
        ));
    }

    Ok(Some(PendingTransferSet {
        id: ret.id,
        payouts: ret
            .receivers
            .into_iter()
            .zip(ret.amounts)
            .map(|(address, amount)| Payout { address, amount })
            .collect(),
        multisig_key_hashes: ret.multisigKeyHashes,
        fee_key_hashes: ret.feeKeyHashes,
    }))
}

/// `None` if no batch is confirmed (batch id 0)
pub fn decode_confirmed_batch(data: &[u8]) -> Result<Option<ConfirmedBatch>> {
    let ret = getConfirmedBatchCall::abi_decode_returns(data)
        .map_err(|err| Error::conversion("getConfirmedBatch result", anyhow!(err)))?;

    if ret.id == 0 {
        return Ok(None);
    }

    let decode_all = |label: &str, items: &[String]| {
        items
            .iter()
            .map(|item| decode_hex(label, item))
            .collect::<Result<Vec<_>>>()
    };

    Ok(Some(ConfirmedBatch {
        id: ret.id,
        raw_transaction: decode_hex("raw transaction", &ret.rawTransaction)?,
        multisig_witnesses: decode_all("multisig witness", &ret.multisigSignatures)?,
        fee_witnesses: decode_all("fee witness", &ret.feeSignatures)?,
    }))
}

/// Operations of the bridge contract used by the settlement loops
pub trait BridgeContract {
    /// Make sure the ledger chain can be reached
    fn ensure_connected(&mut self) -> impl Future<Output = Result<()>>;

    fn pending_transfers(
        &mut self,
        destination_chain_id: &str,
    ) -> impl Future<Output = Result<Option<PendingTransferSet>>>;

    fn confirmed_batch(
        &mut self,
        destination_chain_id: &str,
    ) -> impl Future<Output = Result<Option<ConfirmedBatch>>>;

    fn submit_signed_batch(
        &mut self,
        cancel: &CancellationToken,
        batch: &SignedBatch,
    ) -> impl Future<Output = Result<LedgerReceipt>>;
}

/// [`BridgeContract`] deployed at `contract`, accessed through a [`LedgerClientWrapper`]
pub struct BridgeContractAdapter<C: LedgerConnector, W> {
    client: LedgerClientWrapper<C, W>,
    contract: Address,
}

impl<C, W> BridgeContractAdapter<C, W>
where
    C: LedgerConnector,
    W: LedgerWallet,
{
    pub fn new(client: LedgerClientWrapper<C, W>, contract: Address) -> Self {
        BridgeContractAdapter { client, contract }
    }

    pub fn client(&self) -> &LedgerClientWrapper<C, W> {
        &self.client
    }

    pub fn contract(&self) -> Address {
        self.contract
    }
}

impl<C, W> BridgeContract for BridgeContractAdapter<C, W>
where
    C: LedgerConnector,
    W: LedgerWallet,
{
    async fn ensure_connected(&mut self) -> Result<()> {
        self.client.client().await?;
        Ok(())
    }

    async fn pending_transfers(
        &mut self,
        destination_chain_id: &str,
    ) -> Result<Option<PendingTransferSet>> {
        let call = UnsignedCall::new(
            self.contract,
            getPendingTransfersCall {
                destinationChainId: destination_chain_id.to_string(),
            }
            .abi_encode(),
        );

        let data = self.client.call(&call).await?;
        let pending = decode_pending_transfers(&data)?;

        debug!(
            destination_chain_id,
            batch_id = pending.as_ref().map(|pending| pending.id),
            "Fetched pending transfers"
        );

        Ok(pending)
    }

    async fn confirmed_batch(&mut self, destination_chain_id: &str) -> Result<Option<ConfirmedBatch>> {
        let call = UnsignedCall::new(
            self.contract,
            getConfirmedBatchCall {
                destinationChainId: destination_chain_id.to_string(),
            }
            .abi_encode(),
        );

        let data = self.client.call(&call).await?;
        decode_confirmed_batch(&data)
    }

    async fn submit_signed_batch(
        &mut self,
        cancel: &CancellationToken,
        batch: &SignedBatch,
    ) -> Result<LedgerReceipt> {
        let receipt = self.client.send_tx(cancel, batch.to_call(self.contract)).await?;
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::address;
    use alloy_sol_types::SolValue;

    use super::*;

    #[test]
    fn pending_transfers_are_decoded() {
        let data = (
            7u64,
            vec!["addr_test1a".to_string(), "addr_test1b".to_string()],
            vec![2_000_000u64, 3_000_000u64],
            vec!["aa".to_string()],
            vec!["bb".to_string(), "cc".to_string()],
        )
            .abi_encode_params();

        let pending = decode_pending_transfers(&data)
            .expect("valid result")
            .expect("pending batch");

        assert_eq!(pending.id, 7);
        assert_eq!(pending.target_amount(), 5_000_000);
        assert_eq!(
            pending.payouts[1],
            Payout {
                address: "addr_test1b".to_string(),
                amount: 3_000_000
            }
        );
        assert_eq!(pending.fee_key_hashes.len(), 2);
    }

    #[test]
    fn batch_id_zero_means_nothing_pending() {
        let data = (
            0u64,
            Vec::<String>::new(),
            Vec::<u64>::new(),
            Vec::<String>::new(),
            Vec::<String>::new(),
        )
            .abi_encode_params();

        assert_eq!(decode_pending_transfers(&data).expect("valid result"), None);
    }

    #[test]
    fn mismatching_receivers_are_rejected() {
        let data = (
            1u64,
            vec!["addr_test1a".to_string()],
            Vec::<u64>::new(),
            Vec::<String>::new(),
            Vec::<String>::new(),
        )
            .abi_encode_params();

        assert!(decode_pending_transfers(&data).is_err());
    }

    #[test]
    fn confirmed_batch_accepts_prefixed_hex() {
        let data = (
            3u64,
            "0x84a0".to_string(),
            vec!["0xAABB".to_string()],
            vec!["ccdd".to_string()],
        )
            .abi_encode_params();

        let batch = decode_confirmed_batch(&data)
            .expect("valid result")
            .expect("confirmed batch");

        assert_eq!(batch.raw_transaction, vec![0x84, 0xa0]);
        assert_eq!(batch.multisig_witnesses, vec![vec![0xaa, 0xbb]]);
        assert_eq!(batch.fee_witnesses, vec![vec![0xcc, 0xdd]]);
    }

    #[test]
    fn signed_batch_is_hex_encoded() {
        let batch = SignedBatch {
            id: 9,
            destination_chain_id: "prime".to_string(),
            raw_transaction: vec![0x84, 0xa0],
            multisig_witnesses: vec![vec![0xaa]],
            fee_witnesses: vec![vec![0xbb], vec![0xcc]],
        };
        let contract = address!("00000000000000000000000000000000000000ff");

        let call = batch.to_call(contract);
        let decoded = submitSignedBatchCall::abi_decode(&call.data).expect("valid call data");

        assert_eq!(call.to, contract);
        assert_eq!(decoded.id, 9);
        assert_eq!(decoded.rawTransaction, "84a0");
        assert_eq!(decoded.feeSignatures, vec!["bb".to_string(), "cc".to_string()]);
    }
}
