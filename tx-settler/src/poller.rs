//! Settlement loops
//!
//! A [`SettlementPoller`] drives one [`PollCycle`] per tick of a fixed interval. A cycle goes
//! through the states `Connecting`, `Fetching`, `Building` and `Submitting`, and always ends in
//! `Idle`, whether it succeeded or not.
//!
//! Two cycles exist: the [`BatcherCycle`] signs settlement transactions of pending transfers and
//! reports them to the bridge contract, the [`RelayerCycle`] submits batches the contract has
//! collected enough witnesses for to the UTxO chain.

use std::future::Future;
use std::time::Duration;

use plutus_ledger_api::csl::{csl_to_pla::ToPLA, lib as csl};
use plutus_ledger_api::v3::transaction::TransactionHash;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::{BridgeContract, ConfirmedBatch, PendingTransferSet, SignedBatch};
use crate::chain_query::ChainQuery;
use crate::error::{Error, Result};
use crate::multisig::MultisigPolicy;
use crate::retry::{perform_with_retry, RetryPolicy};
use crate::submitter::Submitter;
use crate::tx_builder::{BatchTxBuilder, SettlementRequest};
use crate::wallet::Signer;
use crate::witness::{assemble, check_thresholds, collect_witnesses, SignedTransaction, WitnessSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum PollerState {
    Idle,
    Connecting,
    Fetching,
    Building,
    Submitting,
}

/// What a failure to fetch pending work does to the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FetchFailurePolicy {
    /// End the loop with the error
    Exit,
    /// Log the error and try again on the next tick
    Continue,
}

#[derive(Error, Debug)]
#[error("{phase} failed: {source}")]
pub struct CycleError {
    pub phase: PollerState,
    #[source]
    pub source: Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing to settle
    NothingToDo,
    /// A batch was handed over to the other chain
    Submitted { batch_id: u64, tx_hash: String },
}

/// One settlement pass. Each step consumes the result of the previous one.
pub trait PollCycle {
    /// Pending work fetched from the ledger chain
    type Work;
    /// Result of building, ready for submission
    type Artifact;

    fn name(&self) -> &str;

    fn connect(&mut self) -> impl Future<Output = Result<()>>;

    /// `None` if there is nothing to do
    fn fetch(
        &mut self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Option<Self::Work>>>;

    fn build(
        &mut self,
        cancel: &CancellationToken,
        work: Self::Work,
    ) -> impl Future<Output = Result<Self::Artifact>>;

    fn submit(
        &mut self,
        cancel: &CancellationToken,
        artifact: Self::Artifact,
    ) -> impl Future<Output = Result<CycleOutcome>>;
}

pub struct SettlementPoller<C> {
    cycle: C,
    interval: Duration,
    fetch_failure: FetchFailurePolicy,
    state: PollerState,
}

impl<C: PollCycle> SettlementPoller<C> {
    pub fn new(cycle: C, interval: Duration, fetch_failure: FetchFailurePolicy) -> Self {
        SettlementPoller {
            cycle,
            interval,
            fetch_failure,
            state: PollerState::Idle,
        }
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    pub fn cycle(&self) -> &C {
        &self.cycle
    }

    pub fn cycle_mut(&mut self) -> &mut C {
        &mut self.cycle
    }

    /// Tick until `cancel` fires. Cancellation is only observed between cycles, a cycle in
    /// progress runs to completion (its retry loops still give up on cancellation).
    ///
    /// Returns an error only for fetch failures under `FetchFailurePolicy::Exit`.
    pub async fn run(&mut self, cancel: &CancellationToken) -> std::result::Result<(), CycleError> {
        info!(poller = self.cycle.name(), interval_ms = self.interval.as_millis(), "Starting settlement loop");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(poller = self.cycle.name(), "Settlement loop stopped");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.interval) => {}
            }

            match self.tick(cancel).await {
                Ok(CycleOutcome::NothingToDo) => {
                    debug!(poller = self.cycle.name(), "Nothing to settle");
                }
                Ok(CycleOutcome::Submitted { batch_id, tx_hash }) => {
                    info!(poller = self.cycle.name(), batch_id, tx_hash, "Batch submitted");
                }
                Err(err)
                    if err.phase == PollerState::Fetching
                        && self.fetch_failure == FetchFailurePolicy::Exit =>
                {
                    error!(poller = self.cycle.name(), %err, "Fetching pending work failed, stopping");
                    return Err(err);
                }
                Err(err) => {
                    error!(poller = self.cycle.name(), %err, "Settlement cycle failed");
                }
            }
        }
    }

    /// Run a single cycle
    pub async fn tick(&mut self, cancel: &CancellationToken) -> std::result::Result<CycleOutcome, CycleError> {
        let outcome = self.run_cycle(cancel).await;
        self.state = PollerState::Idle;
        outcome
    }

    async fn run_cycle(&mut self, cancel: &CancellationToken) -> std::result::Result<CycleOutcome, CycleError> {
        self.state = PollerState::Connecting;
        self.cycle.connect().await.map_err(|err| self.fail(err))?;

        self.state = PollerState::Fetching;
        let work = match self.cycle.fetch(cancel).await.map_err(|err| self.fail(err))? {
            Some(work) => work,
            None => return Ok(CycleOutcome::NothingToDo),
        };

        self.state = PollerState::Building;
        let artifact = self
            .cycle
            .build(cancel, work)
            .await
            .map_err(|err| self.fail(err))?;

        self.state = PollerState::Submitting;
        self.cycle
            .submit(cancel, artifact)
            .await
            .map_err(|err| self.fail(err))
    }

    fn fail(&self, source: Error) -> CycleError {
        CycleError {
            phase: self.state,
            source,
        }
    }
}

/// Signs settlement transactions of pending transfers and reports them to the bridge contract
pub struct BatcherCycle<B, Q, S> {
    bridge: B,
    builder: BatchTxBuilder<Q>,
    destination_chain_id: String,
    primary_signers: Vec<S>,
    fee_signers: Vec<S>,
}

impl<B, Q, S> BatcherCycle<B, Q, S>
where
    B: BridgeContract,
    Q: ChainQuery,
    S: Signer,
{
    pub fn new(
        bridge: B,
        builder: BatchTxBuilder<Q>,
        destination_chain_id: impl Into<String>,
        primary_signers: Vec<S>,
        fee_signers: Vec<S>,
    ) -> Self {
        BatcherCycle {
            bridge,
            builder,
            destination_chain_id: destination_chain_id.into(),
            primary_signers,
            fee_signers,
        }
    }

    pub fn bridge(&self) -> &B {
        &self.bridge
    }

    fn check_signers(&self, role: &str, policy: &MultisigPolicy, signers: &[S]) -> Result<()> {
        match signers.iter().find(|signer| !policy.contains(&signer.key_hash())) {
            Some(signer) => Err(Error::InvalidKeySet(format!(
                "{} signing key {:?} is not a co-signer of the multisig",
                role,
                signer.key_hash()
            ))),
            None => Ok(()),
        }
    }
}

impl<B, Q, S> PollCycle for BatcherCycle<B, Q, S>
where
    B: BridgeContract,
    Q: ChainQuery,
    S: Signer,
{
    type Work = PendingTransferSet;
    type Artifact = SignedBatch;

    fn name(&self) -> &str {
        "batcher"
    }

    async fn connect(&mut self) -> Result<()> {
        self.bridge.ensure_connected().await
    }

    async fn fetch(&mut self, _cancel: &CancellationToken) -> Result<Option<PendingTransferSet>> {
        self.bridge.pending_transfers(&self.destination_chain_id).await
    }

    async fn build(
        &mut self,
        cancel: &CancellationToken,
        work: PendingTransferSet,
    ) -> Result<SignedBatch> {
        let primary = work.primary_policy()?;
        let fee = work.fee_policy()?;
        self.check_signers("primary", &primary, &self.primary_signers)?;
        self.check_signers("fee", &fee, &self.fee_signers)?;

        info!(
            batch_id = work.id,
            payouts = work.payouts.len(),
            target = work.target_amount(),
            "Building settlement transaction"
        );

        let tx = self
            .builder
            .build(
                cancel,
                &SettlementRequest {
                    batch_id: work.id,
                    payouts: &work.payouts,
                    primary: &primary,
                    fee: &fee,
                },
            )
            .await?;

        let witnesses = collect_witnesses(&tx, &self.primary_signers, &self.fee_signers);

        Ok(SignedBatch {
            id: work.id,
            destination_chain_id: self.destination_chain_id.clone(),
            raw_transaction: tx.raw(),
            multisig_witnesses: witnesses.primary_bytes(),
            fee_witnesses: witnesses.fee_bytes(),
        })
    }

    async fn submit(&mut self, cancel: &CancellationToken, batch: SignedBatch) -> Result<CycleOutcome> {
        let receipt = self.bridge.submit_signed_batch(cancel, &batch).await?;

        Ok(CycleOutcome::Submitted {
            batch_id: batch.id,
            tx_hash: receipt.tx_hash.to_string(),
        })
    }
}

/// Submits batches the bridge contract has collected witnesses for to the UTxO chain
pub struct RelayerCycle<B, T> {
    bridge: B,
    submitter: T,
    destination_chain_id: String,
    await_confirmation: bool,
    submit_retry: RetryPolicy,
    last_submitted: Option<u64>,
}

impl<B, T> RelayerCycle<B, T>
where
    B: BridgeContract,
    T: Submitter,
{
    pub fn new(
        bridge: B,
        submitter: T,
        destination_chain_id: impl Into<String>,
        await_confirmation: bool,
    ) -> Self {
        RelayerCycle {
            bridge,
            submitter,
            destination_chain_id: destination_chain_id.into(),
            await_confirmation,
            submit_retry: RetryPolicy::default(),
            last_submitted: None,
        }
    }

    pub fn with_submit_retry(mut self, policy: RetryPolicy) -> Self {
        self.submit_retry = policy;
        self
    }

    pub fn bridge(&self) -> &B {
        &self.bridge
    }

    pub fn submitter(&self) -> &T {
        &self.submitter
    }

    /// Id of the last batch submitted by this instance
    pub fn last_submitted(&self) -> Option<u64> {
        self.last_submitted
    }
}

impl<B, T> PollCycle for RelayerCycle<B, T>
where
    B: BridgeContract,
    T: Submitter,
{
    type Work = ConfirmedBatch;
    type Artifact = (u64, SignedTransaction);

    fn name(&self) -> &str {
        "relayer"
    }

    async fn connect(&mut self) -> Result<()> {
        self.bridge.ensure_connected().await
    }

    async fn fetch(&mut self, _cancel: &CancellationToken) -> Result<Option<ConfirmedBatch>> {
        let batch = self.bridge.confirmed_batch(&self.destination_chain_id).await?;

        Ok(batch.filter(|batch| {
            let fresh = Some(batch.id) != self.last_submitted;
            if !fresh {
                debug!(batch_id = batch.id, "Batch already submitted");
            }
            fresh
        }))
    }

    async fn build(
        &mut self,
        _cancel: &CancellationToken,
        batch: ConfirmedBatch,
    ) -> Result<(u64, SignedTransaction)> {
        let unsigned = csl::FixedTransaction::from_bytes(batch.raw_transaction.clone())
            .map_err(|err| Error::conversion("confirmed batch transaction", anyhow::anyhow!(err)))?;
        let expected_hash: TransactionHash = unsigned.transaction_hash().to_pla();

        let witnesses = WitnessSet::from_bytes(&batch.multisig_witnesses, &batch.fee_witnesses)?;
        check_thresholds(&unsigned, &witnesses)?;
        let signed = assemble(
            &batch.raw_transaction,
            &expected_hash,
            &witnesses,
            witnesses.len(),
        )?;

        Ok((batch.id, signed))
    }

    async fn submit(
        &mut self,
        cancel: &CancellationToken,
        (batch_id, signed): (u64, SignedTransaction),
    ) -> Result<CycleOutcome> {
        let submitter = &self.submitter;
        let tx = signed.transaction();

        let tx_hash = perform_with_retry(cancel, &self.submit_retry, move || {
            submitter.submit_transaction(tx)
        })
        .await?;

        info!(batch_id, ?tx_hash, "Settlement transaction submitted");

        if self.await_confirmation {
            let hash = &tx_hash;
            perform_with_retry(cancel, &self.submit_retry, move || {
                submitter.await_tx_confirm(hash)
            })
            .await
            .inspect_err(|err| warn!(batch_id, %err, "Settlement transaction not confirmed"))?;
        }

        self.last_submitted = Some(batch_id);

        Ok(CycleOutcome::Submitted {
            batch_id,
            tx_hash: format!("{:?}", tx_hash),
        })
    }
}
