use std::collections::BTreeMap;

use alloy::{
    eips::BlockNumberOrTag,
    network::TransactionBuilder,
    primitives::{Address, Bytes, B256},
    providers::{Provider, RootProvider},
    rpc::types::TransactionRequest,
};
use serde::Deserialize;
use tracing::debug;
use tx_settler::ledger::{
    FeeHistory, LedgerConnector, LedgerReceipt, LedgerRpc, Result, UnsignedCall,
};
use url::Url;

use crate::error::map_rpc_error;

/// Opens HTTP connections to a ledger chain node
#[derive(Debug, Clone)]
pub struct AlloyConnector {
    url: Url,
}

impl AlloyConnector {
    pub fn new(url: Url) -> Self {
        AlloyConnector { url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl LedgerConnector for AlloyConnector {
    type Rpc = AlloyLedgerRpc;

    /// HTTP providers are lazy, the chain id request makes sure the node is reachable.
    async fn connect(&self) -> Result<AlloyLedgerRpc> {
        let provider = RootProvider::new_http(self.url.clone());
        let chain_id = provider.get_chain_id().await.map_err(map_rpc_error)?;
        debug!(url = %self.url, chain_id, "Ledger chain node reachable");

        Ok(AlloyLedgerRpc { provider })
    }
}

pub struct AlloyLedgerRpc {
    provider: RootProvider,
}

impl AlloyLedgerRpc {
    pub fn new(provider: RootProvider) -> Self {
        AlloyLedgerRpc { provider }
    }
}

/// `txpool_contentFrom` answer, transactions keyed by nonce
#[derive(Debug, Default, Deserialize)]
struct TxPoolContentFrom {
    #[serde(default)]
    pending: BTreeMap<String, PoolTransaction>,
    #[serde(default)]
    queued: BTreeMap<String, PoolTransaction>,
}

#[derive(Debug, Deserialize)]
struct PoolTransaction {
    hash: B256,
}

impl TxPoolContentFrom {
    fn contains(&self, tx_hash: B256) -> bool {
        self.pending
            .values()
            .chain(self.queued.values())
            .any(|tx| tx.hash == tx_hash)
    }
}

pub(crate) fn to_request(call: &UnsignedCall) -> TransactionRequest {
    TransactionRequest::default()
        .with_to(call.to)
        .with_input(call.data.clone())
        .with_value(call.value)
}

impl LedgerRpc for AlloyLedgerRpc {
    async fn chain_id(&self) -> Result<u64> {
        self.provider.get_chain_id().await.map_err(map_rpc_error)
    }

    async fn pending_nonce_at(&self, address: Address) -> Result<u64> {
        self.provider
            .get_transaction_count(address)
            .pending()
            .await
            .map_err(map_rpc_error)
    }

    async fn nonce_at(&self, address: Address) -> Result<u64> {
        self.provider
            .get_transaction_count(address)
            .latest()
            .await
            .map_err(map_rpc_error)
    }

    async fn suggest_gas_price(&self) -> Result<u128> {
        self.provider.get_gas_price().await.map_err(map_rpc_error)
    }

    async fn suggest_gas_tip_cap(&self) -> Result<u128> {
        self.provider
            .get_max_priority_fee_per_gas()
            .await
            .map_err(map_rpc_error)
    }

    async fn fee_history(&self, block_count: u64) -> Result<FeeHistory> {
        let history = self
            .provider
            .get_fee_history(block_count, BlockNumberOrTag::Latest, &[])
            .await
            .map_err(map_rpc_error)?;

        Ok(FeeHistory {
            base_fee_per_gas: history.base_fee_per_gas,
        })
    }

    async fn estimate_gas(&self, from: Address, call: &UnsignedCall) -> Result<u64> {
        self.provider
            .estimate_gas(to_request(call).with_from(from))
            .await
            .map_err(map_rpc_error)
    }

    async fn call(&self, call: &UnsignedCall) -> Result<Bytes> {
        self.provider
            .call(to_request(call))
            .await
            .map_err(map_rpc_error)
    }

    async fn send_raw_transaction(&self, raw: &Bytes) -> Result<B256> {
        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .map_err(map_rpc_error)?;

        Ok(*pending.tx_hash())
    }

    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<LedgerReceipt>> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(map_rpc_error)?;

        Ok(receipt.map(|receipt| LedgerReceipt {
            tx_hash,
            success: receipt.status(),
            block_number: receipt.block_number,
            gas_used: receipt.gas_used,
        }))
    }

    async fn block_number(&self) -> Result<u64> {
        self.provider.get_block_number().await.map_err(map_rpc_error)
    }

    async fn is_in_tx_pool(&self, address: Address, tx_hash: B256) -> Result<bool> {
        let content: TxPoolContentFrom = self
            .provider
            .raw_request("txpool_contentFrom".into(), (address,))
            .await
            .map_err(map_rpc_error)?;

        Ok(content.contains(tx_hash))
    }
}
