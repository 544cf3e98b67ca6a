#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use alloy_primitives::{keccak256, Address, Bytes, B256};
use data_encoding::HEXLOWER;
use num_bigint::BigInt;
use plutus_ledger_api::csl::{csl_to_pla::ToPLA, lib as csl};
use plutus_ledger_api::v3::{
    address::Address as UtxoAddress,
    crypto::LedgerBytes,
    transaction::{TransactionHash, TransactionInput},
    value::Value,
};
use tokio_util::sync::CancellationToken;
use tx_settler::{
    bridge::{BridgeContract, ConfirmedBatch, PendingTransferSet, SignedBatch},
    chain_query::{ChainQuery, ChainQueryError, ChainTip, FullTransactionOutput, Network, ProtocolParameters},
    error::{Error, Result},
    ledger::{
        FeeHistory, LedgerConnector, LedgerError, LedgerReceipt, LedgerRpc, LedgerTxOpts,
        LedgerWallet, SignedLedgerTx, UnsignedCall,
    },
    submitter::{Submitter, SubmitterError},
    utils::key_wallet::KeyWallet,
    wallet::Signer,
};

pub fn key_wallet(seed: u8) -> KeyWallet {
    KeyWallet::from_private_key(csl::PrivateKey::from_normal_bytes(&[seed; 32]).expect("valid key"))
}

pub fn key_hash_hex(wallet: &KeyWallet) -> String {
    HEXLOWER.encode(&wallet.key_hash().0 .0)
}

pub fn tx_input(byte: u8, index: u32) -> TransactionInput {
    TransactionInput {
        transaction_id: TransactionHash(LedgerBytes(vec![byte; 32])),
        index: BigInt::from(index),
    }
}

pub fn ada_output(address: &UtxoAddress, lovelace: u64) -> FullTransactionOutput {
    FullTransactionOutput {
        address: address.clone(),
        value: Value::ada_value(&BigInt::from(lovelace)),
    }
}

/// Lovelace of a CSL amount
pub fn coin(value: &csl::BigNum) -> u64 {
    value.to_str().parse().expect("u64 amount")
}

// Ledger chain

#[derive(Default)]
pub struct LedgerState {
    pub connects: u32,
    pub fail_connect: bool,
    pub pending_nonce: u64,
    pub nonce_queries: u32,
    pub send_errors: VecDeque<LedgerError>,
    pub call_results: VecDeque<std::result::Result<Bytes, LedgerError>>,
    pub sent: Vec<Bytes>,
    /// Sends that reach the node but whose response gets lost on the way back
    pub lost_responses: u32,
    pub signed: Vec<LedgerTxOpts>,
    pub receipts: VecDeque<std::result::Result<Option<LedgerReceipt>, LedgerError>>,
    /// Receipts never show up
    pub never_included: bool,
    pub reverts: bool,
    /// Answers to tx pool lookups, `false` once drained
    pub tx_pool: VecDeque<bool>,
    pub tx_pool_queries: u32,
}

pub type SharedLedger = Arc<Mutex<LedgerState>>;

pub fn ledger(pending_nonce: u64) -> SharedLedger {
    Arc::new(Mutex::new(LedgerState {
        pending_nonce,
        ..LedgerState::default()
    }))
}

pub struct MockConnector(pub SharedLedger);

pub struct MockRpc(SharedLedger);

impl LedgerConnector for MockConnector {
    type Rpc = MockRpc;

    async fn connect(&self) -> std::result::Result<MockRpc, LedgerError> {
        let mut state = self.0.lock().unwrap();
        if state.fail_connect {
            return Err(LedgerError::ConnectionClosed);
        }
        state.connects += 1;
        Ok(MockRpc(self.0.clone()))
    }
}

impl LedgerRpc for MockRpc {
    async fn chain_id(&self) -> std::result::Result<u64, LedgerError> {
        Ok(1337)
    }

    async fn pending_nonce_at(&self, _address: Address) -> std::result::Result<u64, LedgerError> {
        let mut state = self.0.lock().unwrap();
        state.nonce_queries += 1;
        Ok(state.pending_nonce)
    }

    async fn nonce_at(&self, _address: Address) -> std::result::Result<u64, LedgerError> {
        Ok(self.0.lock().unwrap().pending_nonce)
    }

    async fn suggest_gas_price(&self) -> std::result::Result<u128, LedgerError> {
        Ok(1_000_000_000)
    }

    async fn suggest_gas_tip_cap(&self) -> std::result::Result<u128, LedgerError> {
        Ok(100_000_000)
    }

    async fn fee_history(&self, _block_count: u64) -> std::result::Result<FeeHistory, LedgerError> {
        Ok(FeeHistory {
            base_fee_per_gas: vec![1_000_000_000, 1_100_000_000],
        })
    }

    async fn estimate_gas(
        &self,
        _from: Address,
        _call: &UnsignedCall,
    ) -> std::result::Result<u64, LedgerError> {
        Ok(150_000)
    }

    async fn call(&self, _call: &UnsignedCall) -> std::result::Result<Bytes, LedgerError> {
        self.0
            .lock()
            .unwrap()
            .call_results
            .pop_front()
            .unwrap_or_else(|| Ok(Bytes::new()))
    }

    async fn send_raw_transaction(&self, raw: &Bytes) -> std::result::Result<B256, LedgerError> {
        let mut state = self.0.lock().unwrap();
        if let Some(err) = state.send_errors.pop_front() {
            return Err(err);
        }
        if state.sent.contains(raw) {
            return Err(LedgerError::Rpc {
                code: -32000,
                message: "already known".to_string(),
            });
        }
        state.sent.push(raw.clone());
        state.pending_nonce += 1;
        if state.lost_responses > 0 {
            state.lost_responses -= 1;
            return Err(LedgerError::Transport {
                message: "connection reset by peer".to_string(),
                timeout: false,
            });
        }
        Ok(keccak256(raw))
    }

    async fn is_in_tx_pool(&self, _address: Address, _tx_hash: B256) -> std::result::Result<bool, LedgerError> {
        let mut state = self.0.lock().unwrap();
        state.tx_pool_queries += 1;
        Ok(state.tx_pool.pop_front().unwrap_or(false))
    }

    async fn transaction_receipt(
        &self,
        tx_hash: B256,
    ) -> std::result::Result<Option<LedgerReceipt>, LedgerError> {
        let mut state = self.0.lock().unwrap();
        if let Some(receipt) = state.receipts.pop_front() {
            return receipt;
        }
        if state.never_included {
            return Ok(None);
        }
        Ok(Some(LedgerReceipt {
            tx_hash,
            success: !state.reverts,
            block_number: Some(42),
            gas_used: 90_000,
        }))
    }

    async fn block_number(&self) -> std::result::Result<u64, LedgerError> {
        Ok(42)
    }
}

pub struct MockWallet {
    pub address: Address,
    pub ledger: SharedLedger,
}

impl LedgerWallet for MockWallet {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign_transaction(
        &self,
        chain_id: u64,
        call: &UnsignedCall,
        opts: &LedgerTxOpts,
    ) -> std::result::Result<SignedLedgerTx, LedgerError> {
        self.ledger.lock().unwrap().signed.push(opts.clone());

        let raw: Bytes = [
            chain_id.to_be_bytes().as_slice(),
            opts.nonce.to_be_bytes().as_slice(),
            opts.gas_limit.to_be_bytes().as_slice(),
            call.data.as_ref(),
        ]
        .concat()
        .into();

        Ok(SignedLedgerTx {
            hash: keccak256(&raw),
            raw,
        })
    }
}

// UTxO chain

pub struct MockChainQuery {
    pub params: ProtocolParameters,
    pub tip_slot: u64,
    pub utxos: Vec<(UtxoAddress, BTreeMap<TransactionInput, FullTransactionOutput>)>,
}

impl MockChainQuery {
    pub fn new(params: ProtocolParameters) -> Self {
        MockChainQuery {
            params,
            tip_slot: 1_000,
            utxos: Vec::new(),
        }
    }

    pub fn with_utxos(mut self, address: &UtxoAddress, utxos: Vec<(TransactionInput, u64)>) -> Self {
        self.utxos.push((
            address.clone(),
            utxos
                .into_iter()
                .map(|(input, lovelace)| (input, ada_output(address, lovelace)))
                .collect(),
        ));
        self
    }
}

impl ChainQuery for MockChainQuery {
    fn get_network(&self) -> Network {
        Network::Testnet
    }

    async fn query_protocol_params(&self) -> std::result::Result<ProtocolParameters, ChainQueryError> {
        Ok(self.params.clone())
    }

    async fn query_tip(&self) -> std::result::Result<ChainTip, ChainQueryError> {
        Ok(ChainTip::Point {
            slot: self.tip_slot,
            id: "tip".to_string(),
        })
    }

    async fn query_utxos_by_addr(
        &self,
        address: &UtxoAddress,
    ) -> std::result::Result<BTreeMap<TransactionInput, FullTransactionOutput>, ChainQueryError> {
        Ok(self
            .utxos
            .iter()
            .find(|(utxo_address, _)| utxo_address == address)
            .map(|(_, utxos)| utxos.clone())
            .unwrap_or_default())
    }
}

pub fn flat_fee_params(fee: u64) -> ProtocolParameters {
    ProtocolParameters {
        min_fee_coefficient: 0,
        min_fee_constant: fee,
        coins_per_utxo_byte: 4310,
        max_transaction_size: Some(16384),
        max_value_size: Some(5000),
    }
}

pub fn linear_fee_params() -> ProtocolParameters {
    ProtocolParameters {
        min_fee_coefficient: 44,
        min_fee_constant: 155_381,
        ..flat_fee_params(0)
    }
}

#[derive(Default)]
pub struct MockSubmitter {
    pub submitted: Mutex<Vec<Vec<u8>>>,
}

impl Submitter for MockSubmitter {
    async fn submit_transaction(
        &self,
        tx: &csl::FixedTransaction,
    ) -> std::result::Result<TransactionHash, SubmitterError> {
        self.submitted.lock().unwrap().push(tx.to_bytes());
        Ok(tx.transaction_hash().to_pla())
    }

    async fn await_tx_confirm(&self, _tx_hash: &TransactionHash) -> std::result::Result<(), SubmitterError> {
        Ok(())
    }
}

// Bridge contract

#[derive(Default)]
pub struct MockBridge {
    pub fetches: u32,
    pub pending: VecDeque<Result<Option<PendingTransferSet>>>,
    pub confirmed: Option<ConfirmedBatch>,
    pub submitted: Vec<SignedBatch>,
}

impl BridgeContract for MockBridge {
    async fn ensure_connected(&mut self) -> Result<()> {
        Ok(())
    }

    async fn pending_transfers(&mut self, _destination_chain_id: &str) -> Result<Option<PendingTransferSet>> {
        self.fetches += 1;
        self.pending.pop_front().unwrap_or(Ok(None))
    }

    async fn confirmed_batch(&mut self, _destination_chain_id: &str) -> Result<Option<ConfirmedBatch>> {
        self.fetches += 1;
        Ok(self.confirmed.clone())
    }

    async fn submit_signed_batch(
        &mut self,
        _cancel: &CancellationToken,
        batch: &SignedBatch,
    ) -> Result<LedgerReceipt> {
        self.submitted.push(batch.clone());
        Ok(LedgerReceipt {
            tx_hash: keccak256(&batch.raw_transaction),
            success: true,
            block_number: Some(1),
            gas_used: 50_000,
        })
    }
}

pub fn fetch_error() -> Error {
    Error::LedgerError(LedgerError::Rpc {
        code: -32000,
        message: "execution reverted".to_string(),
    })
}
