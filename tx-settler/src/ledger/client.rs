//! Resilient ledger chain client
//!
//! [`LedgerClientWrapper`] owns the RPC connection, the nonce state and the gas limit ramp of
//! one sender. It is driven by a single settlement loop, so all of its state is mutated through
//! `&mut self` and never shared.

use std::{sync::Arc, time::Duration};

use alloy_primitives::{Address, Bytes, B256};
use anyhow::anyhow;
use derive_builder::Builder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    gas::GasLimitHolder,
    nonce::{NonceAssigner, NonceStrategy},
    GasFees, LedgerConnector, LedgerError, LedgerReceipt, LedgerRpc, LedgerTxOpts, LedgerWallet,
    Result, SignedLedgerTx, UnsignedCall,
};
use crate::retry::{ErrorPolicy, ErrorPolicyProvider, RetryBudget, RetryPolicy};

/// Source of the gas limit of outgoing transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasEstimation {
    /// `eth_estimateGas` on the unsigned call
    Node,
    /// `GasLimitHolder` ramp, raised after every failure
    Ramp { min: u64, max: u64, steps: u64 },
}

#[derive(Debug, Builder, Clone)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct LedgerTxConfig {
    /// EIP-1559 fees instead of a legacy gas price
    #[builder(default = "false")]
    pub dynamic_fees: bool,
    /// Legacy transactions with a gas price of 0, for chains without fees
    #[builder(default = "false")]
    pub zero_gas_price: bool,
    /// Applied to node fee suggestions, in percent
    #[builder(default = "160")]
    pub gas_fee_multiplier_percent: u128,
    #[builder(default = "GasEstimation::Node")]
    pub gas_estimation: GasEstimation,
    #[builder(default = "Duration::from_millis(300)")]
    pub receipt_wait_time: Duration,
    #[builder(default = "1000")]
    pub receipt_retries: u32,
    /// Policy for the populate, sign and send step
    #[builder(default = "RetryPolicy::fixed(5, Duration::from_secs(2))")]
    pub send_retry: RetryPolicy,
    /// Wait for a sent transaction to enter and then leave the sender's tx pool
    /// (`txpool_contentFrom`) before polling for its receipt
    #[builder(default = "false")]
    pub tx_pool_tracking: bool,
    /// Tx pool polls before a transaction that never showed up is left to the receipt wait
    #[builder(default = "10")]
    pub tx_pool_entry_retries: u32,
}

impl LedgerTxConfigBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(GasEstimation::Ramp { min, max, .. }) = self.gas_estimation {
            if min > max {
                return Err(format!(
                    "Gas limit ramp is invalid: min {} is greater than max {}",
                    min, max
                ));
            }
        }

        if self.dynamic_fees == Some(true) && self.zero_gas_price == Some(true) {
            return Err("Zero gas price is only supported with legacy transactions".to_string());
        }

        Ok(())
    }
}

impl Default for LedgerTxConfig {
    fn default() -> Self {
        LedgerTxConfig {
            dynamic_fees: false,
            zero_gas_price: false,
            gas_fee_multiplier_percent: 160,
            gas_estimation: GasEstimation::Node,
            receipt_wait_time: Duration::from_millis(300),
            receipt_retries: 1000,
            send_retry: RetryPolicy::fixed(5, Duration::from_secs(2)),
            tx_pool_tracking: false,
            tx_pool_entry_retries: 10,
        }
    }
}

/// Connection lifecycle. `Connecting` is only observable while a connection attempt is in flight
/// (or after such an attempt was dropped), and is treated like `Disconnected`.
#[derive(Debug)]
pub enum Connection<R> {
    Disconnected,
    Connecting,
    Connected(Arc<R>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl<R> Connection<R> {
    pub fn state(&self) -> ConnectionState {
        match self {
            Connection::Disconnected => ConnectionState::Disconnected,
            Connection::Connecting => ConnectionState::Connecting,
            Connection::Connected(_) => ConnectionState::Connected,
        }
    }
}

pub struct LedgerClientWrapper<C: LedgerConnector, W> {
    connector: C,
    wallet: W,
    config: LedgerTxConfig,
    nonces: NonceAssigner,
    gas: Option<GasLimitHolder>,
    connection: Connection<C::Rpc>,
}

impl<C, W> LedgerClientWrapper<C, W>
where
    C: LedgerConnector,
    W: LedgerWallet,
{
    pub fn new(connector: C, wallet: W, nonce_strategy: NonceStrategy, config: LedgerTxConfig) -> Self {
        let gas = match config.gas_estimation {
            GasEstimation::Node => None,
            GasEstimation::Ramp { min, max, steps } => Some(GasLimitHolder::new(min, max, steps)),
        };

        LedgerClientWrapper {
            connector,
            wallet,
            config,
            nonces: NonceAssigner::new(nonce_strategy),
            gas,
            connection: Connection::Disconnected,
        }
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn nonces(&self) -> &NonceAssigner {
        &self.nonces
    }

    pub fn gas_limit_holder(&self) -> Option<&GasLimitHolder> {
        self.gas.as_ref()
    }

    /// Current RPC client, connecting first if there is none
    pub async fn client(&mut self) -> Result<Arc<C::Rpc>> {
        if let Connection::Connected(rpc) = &self.connection {
            return Ok(rpc.clone());
        }

        self.connection = Connection::Connecting;
        match self.connector.connect().await {
            Ok(rpc) => {
                let rpc = Arc::new(rpc);
                self.connection = Connection::Connected(rpc.clone());
                info!(address=%self.wallet.address(), "Connected to ledger chain node");
                Ok(rpc)
            }
            Err(err) => {
                self.connection = Connection::Disconnected;
                warn!(%err, "Failed to connect to ledger chain node");
                Err(err)
            }
        }
    }

    pub fn disconnect(&mut self) {
        self.connection = Connection::Disconnected;
    }

    /// Drop the connection if `err` means it cannot be used anymore. Any other error leaves the
    /// connection in place.
    pub fn process_error(&mut self, err: &LedgerError) {
        if err.is_transport_broken() && self.connection.state() != ConnectionState::Disconnected {
            warn!(%err, "Ledger chain connection invalidated");
            self.disconnect();
        }
    }

    /// Read-only contract call
    pub async fn call(&mut self, call: &UnsignedCall) -> Result<Bytes> {
        let rpc = self.client().await?;
        let result = rpc.call(call).await;
        if let Err(err) = &result {
            self.process_error(err);
        }
        result
    }

    /// Nonce of `address`, either including the mempool or as of the latest block
    pub async fn nonce(&mut self, address: Address, pending: bool) -> Result<u64> {
        let rpc = self.client().await?;
        let result = if pending {
            rpc.pending_nonce_at(address).await
        } else {
            rpc.nonce_at(address).await
        };
        if let Err(err) = &result {
            self.process_error(err);
        }
        result
    }

    /// Decide nonce, gas limit and fees for `call`
    pub async fn populate_tx_opts(&self, rpc: &C::Rpc, call: &UnsignedCall) -> Result<LedgerTxOpts> {
        let from = self.wallet.address();
        let nonce = self.nonces.next_nonce(rpc, from).await?;

        let gas_limit = match &self.gas {
            Some(holder) => holder.gas_limit(),
            None => rpc.estimate_gas(from, call).await?,
        };

        let fees = if self.config.dynamic_fees {
            let tip = rpc.suggest_gas_tip_cap().await?;
            let history = rpc.fee_history(1).await?;
            let base_fee = history
                .base_fee_per_gas
                .last()
                .copied()
                .ok_or_else(|| LedgerError::Other(anyhow!("Fee history has no base fee")))?;

            GasFees::Dynamic {
                max_priority_fee_per_gas: self.apply_fee_multiplier(tip),
                max_fee_per_gas: self.apply_fee_multiplier(base_fee.saturating_add(tip)),
            }
        } else if self.config.zero_gas_price {
            GasFees::Legacy { gas_price: 0 }
        } else {
            GasFees::Legacy {
                gas_price: self.apply_fee_multiplier(rpc.suggest_gas_price().await?),
            }
        };

        Ok(LedgerTxOpts {
            from,
            nonce,
            gas_limit,
            fees,
        })
    }

    fn apply_fee_multiplier(&self, value: u128) -> u128 {
        value.saturating_mul(self.config.gas_fee_multiplier_percent) / 100
    }

    /// Sign and submit `call`, then wait until it is included.
    ///
    /// Nonce, gas limit and fees are decided again only while no signed transaction has reached
    /// the node. A transaction that is included but failed is reported as
    /// `LedgerError::ReceiptUnsuccessful` and never resubmitted.
    pub async fn send_tx(
        &mut self,
        cancel: &CancellationToken,
        call: UnsignedCall,
    ) -> Result<LedgerReceipt> {
        let (signed, opts) = self.broadcast(cancel, &call).await?;
        let tx_hash = signed.hash;

        if self.config.tx_pool_tracking {
            self.wait_for_tx_pool_exit(cancel, tx_hash).await?;
        }

        let receipt = self.wait_for_receipt(cancel, tx_hash).await?;

        if receipt.success {
            if let Some(holder) = &mut self.gas {
                holder.record_success();
            }
            info!(%tx_hash, block_number=?receipt.block_number, gas_used=receipt.gas_used, "Ledger transaction included");
            Ok(receipt)
        } else {
            if let Some(holder) = &mut self.gas {
                holder.record_failure();
            }
            Err(LedgerError::ReceiptUnsuccessful {
                tx_hash,
                gas_limit: opts.gas_limit,
                gas_used: receipt.gas_used,
            })
        }
    }

    /// Get `call` accepted by the node, retrying under the `send_retry` policy.
    ///
    /// A broadcast that fails on the transport may still have reached the node, so the same raw
    /// transaction is sent again instead of a fresh one. When the node then answers
    /// "already known" or "nonce too low", the earlier broadcast went through. Any other
    /// rejection drops the signed transaction and the next attempt starts from a new nonce.
    async fn broadcast(
        &mut self,
        cancel: &CancellationToken,
        call: &UnsignedCall,
    ) -> Result<(SignedLedgerTx, LedgerTxOpts)> {
        let policy = self.config.send_retry;
        let mut budget = RetryBudget::new(&policy);
        let from = self.wallet.address();
        let mut prepared: Option<(SignedLedgerTx, LedgerTxOpts)> = None;
        let mut maybe_sent = false;

        loop {
            if cancel.is_cancelled() {
                self.forget_nonce(from);
                return Err(LedgerError::Cancelled);
            }

            let (signed, opts) = match prepared.take() {
                Some(tx) => tx,
                None => match self.prepare(call).await {
                    Ok(tx) => tx,
                    Err(err) => {
                        self.record_send_failure(from, &err);
                        budget.on_failure(cancel, err).await?;
                        continue;
                    }
                },
            };

            let rpc = match self.client().await {
                Ok(rpc) => rpc,
                Err(err) => {
                    prepared = Some((signed, opts));
                    if let Err(err) = budget.on_failure(cancel, err).await {
                        self.forget_nonce(from);
                        return Err(err.into());
                    }
                    continue;
                }
            };

            let err = match rpc.send_raw_transaction(&signed.raw).await {
                Ok(tx_hash) => {
                    debug!(%tx_hash, nonce=opts.nonce, "Ledger transaction accepted by node");
                    self.nonces.update_nonce(from, opts.nonce, true);
                    return Ok((signed, opts));
                }
                Err(err) if maybe_sent && is_duplicate_send(&err) => {
                    info!(tx_hash=%signed.hash, nonce=opts.nonce, %err, "Earlier broadcast of ledger transaction was accepted");
                    self.nonces.update_nonce(from, opts.nonce, true);
                    return Ok((signed, opts));
                }
                Err(err) => err,
            };

            if outcome_unknown(&err) {
                warn!(tx_hash=%signed.hash, nonce=opts.nonce, %err, "Ledger transaction broadcast has no answer, resending it");
                self.process_error(&err);
                maybe_sent = true;
                prepared = Some((signed, opts));
            } else {
                maybe_sent = false;
                self.record_send_failure(from, &err);
            }

            if let Err(err) = budget.on_failure(cancel, err).await {
                self.forget_nonce(from);
                return Err(err.into());
            }
        }
    }

    async fn prepare(&mut self, call: &UnsignedCall) -> Result<(SignedLedgerTx, LedgerTxOpts)> {
        let rpc = self.client().await?;
        let chain_id = rpc.chain_id().await?;
        let opts = self.populate_tx_opts(&rpc, call).await?;
        let signed = self.wallet.sign_transaction(chain_id, call, &opts).await?;

        debug!(tx_hash=%signed.hash, nonce=opts.nonce, gas_limit=opts.gas_limit, "Sending ledger transaction");
        Ok((signed, opts))
    }

    fn record_send_failure(&mut self, from: Address, err: &LedgerError) {
        self.forget_nonce(from);
        if let Some(holder) = &mut self.gas {
            holder.record_failure();
        }
        self.process_error(err);
    }

    fn forget_nonce(&mut self, from: Address) {
        self.nonces.update_nonce(from, 0, false);
    }

    /// Wait until the sender's tx pool has taken `tx_hash` in and let it go again. A transaction
    /// that never shows up in the pool is left to the receipt wait.
    pub async fn wait_for_tx_pool_exit(
        &mut self,
        cancel: &CancellationToken,
        tx_hash: B256,
    ) -> Result<()> {
        let entry_retries = self.config.tx_pool_entry_retries;
        if !self.poll_tx_pool(cancel, tx_hash, true, entry_retries).await? {
            debug!(%tx_hash, "Ledger transaction not seen in tx pool");
            return Ok(());
        }

        let exit_retries = self.config.receipt_retries;
        if !self.poll_tx_pool(cancel, tx_hash, false, exit_retries).await? {
            return Err(LedgerError::TxPoolTimeout(tx_hash));
        }

        info!(%tx_hash, "Ledger transaction left tx pool");
        Ok(())
    }

    /// Poll until `tx_hash` is in the tx pool (`in_pool`) or out of it. `false` if that did not
    /// happen within `retries` polls.
    async fn poll_tx_pool(
        &mut self,
        cancel: &CancellationToken,
        tx_hash: B256,
        in_pool: bool,
        retries: u32,
    ) -> Result<bool> {
        let from = self.wallet.address();

        for _ in 0..retries {
            let outcome = match self.client().await {
                Ok(rpc) => rpc.is_in_tx_pool(from, tx_hash).await,
                Err(err) => Err(err),
            };

            match outcome {
                Ok(found) if found == in_pool => return Ok(true),
                Ok(_) => {}
                Err(err) if err.get_error_policy() == ErrorPolicy::Retry => {
                    debug!(%tx_hash, %err, "Tx pool query failed");
                    self.process_error(&err);
                }
                Err(err) => {
                    self.process_error(&err);
                    return Err(err);
                }
            }

            self.pause(cancel).await?;
        }

        Ok(false)
    }

    /// Poll for the receipt of `tx_hash` until it shows up, the poll budget is exhausted
    /// (`ReceiptTimeout`) or `cancel` fires (`Cancelled`).
    pub async fn wait_for_receipt(
        &mut self,
        cancel: &CancellationToken,
        tx_hash: B256,
    ) -> Result<LedgerReceipt> {
        for _ in 0..self.config.receipt_retries {
            let outcome = match self.client().await {
                Ok(rpc) => rpc.transaction_receipt(tx_hash).await,
                Err(err) => Err(err),
            };

            match outcome {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) | Err(LedgerError::NotFound) => {}
                Err(err) if err.get_error_policy() == ErrorPolicy::Retry => {
                    debug!(%tx_hash, %err, "Receipt query failed");
                    self.process_error(&err);
                }
                Err(err) => {
                    self.process_error(&err);
                    return Err(err);
                }
            }

            self.pause(cancel).await?;
        }

        Err(LedgerError::ReceiptTimeout(tx_hash))
    }

    /// Sleep for `receipt_wait_time` between polls, unless `cancel` fires first
    async fn pause(&mut self, cancel: &CancellationToken) -> Result<()> {
        let cancelled = tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(self.config.receipt_wait_time) => false,
        };

        if cancelled {
            self.process_error(&LedgerError::Cancelled);
            return Err(LedgerError::Cancelled);
        }
        Ok(())
    }
}

/// The broadcast may have reached the node even though it failed on our side
fn outcome_unknown(err: &LedgerError) -> bool {
    matches!(
        err,
        LedgerError::Transport { .. } | LedgerError::ConnectionClosed | LedgerError::DeadlineExceeded
    )
}

/// Node answers to a raw transaction it has already seen
fn is_duplicate_send(err: &LedgerError) -> bool {
    match err {
        LedgerError::Rpc { message, .. } => {
            message.contains("already known") || message.contains("nonce too low")
        }
        _ => false,
    }
}
