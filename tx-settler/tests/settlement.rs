use std::time::Duration;

use assertables::{assert_gt, assert_gt_as_result};
use tokio_util::sync::CancellationToken;
use tx_settler::{
    bridge::{ConfirmedBatch, PendingTransferSet},
    chain_query::Network,
    error::Error,
    multisig::MultisigPolicy,
    poller::{
        BatcherCycle, CycleOutcome, FetchFailurePolicy, PollerState, RelayerCycle,
        SettlementPoller,
    },
    retry::RetryPolicy,
    tx_builder::{BatchTxBuilder, BuilderConfig, FeePayer, Payout, SettlementRequest},
    utils::key_wallet::KeyWallet,
    wallet::Signer,
    witness::{assemble, collect_witnesses},
};

mod common;
use common::{
    coin, fetch_error, flat_fee_params, key_hash_hex, key_wallet, linear_fee_params, tx_input,
    MockBridge, MockChainQuery, MockSubmitter,
};

const CHAIN_ID: &str = "prime";

fn policy(seeds: &[u8]) -> MultisigPolicy {
    MultisigPolicy::new(seeds.iter().map(|seed| key_wallet(*seed).key_hash()).collect())
        .expect("valid policy")
}

fn receiver() -> String {
    policy(&[99])
        .bech32_address(Network::Testnet)
        .expect("bech32 address")
}

fn wallets(seeds: &[u8]) -> Vec<KeyWallet> {
    seeds.iter().map(|seed| key_wallet(*seed)).collect()
}

fn pending_set(id: u64, amount: u64) -> PendingTransferSet {
    PendingTransferSet {
        id,
        payouts: vec![Payout {
            address: receiver(),
            amount,
        }],
        multisig_key_hashes: wallets(&[1, 2, 3]).iter().map(key_hash_hex).collect(),
        fee_key_hashes: vec![key_hash_hex(&key_wallet(4))],
    }
}

/// Primary multisig of keys 1, 2, 3 holding 3 ADA and 2 ADA, fee multisig of key 4 holding 1.5 ADA
fn funded_chain(params: tx_settler::chain_query::ProtocolParameters) -> MockChainQuery {
    MockChainQuery::new(params)
        .with_utxos(
            &policy(&[1, 2, 3]).address().expect("address"),
            vec![(tx_input(1, 0), 3_000_000), (tx_input(2, 0), 2_000_000)],
        )
        .with_utxos(
            &policy(&[4]).address().expect("address"),
            vec![(tx_input(3, 0), 1_500_000)],
        )
}

fn primary_pays_config() -> BuilderConfig {
    BuilderConfig {
        fee_payer: FeePayer::Primary,
        potential_fee: 170_000,
        ..BuilderConfig::default()
    }
}

#[tokio::test]
async fn primary_wallet_pays_payouts_and_fee() {
    let builder = BatchTxBuilder::new(funded_chain(flat_fee_params(170_000)), primary_pays_config());
    let payouts = vec![Payout {
        address: receiver(),
        amount: 2_000_000,
    }];

    let tx = builder
        .build(
            &CancellationToken::new(),
            &SettlementRequest {
                batch_id: 1,
                payouts: &payouts,
                primary: &policy(&[1, 2, 3]),
                fee: &policy(&[4]),
            },
        )
        .await
        .expect("built");

    assert_eq!(tx.fee(), 170_000);
    assert_eq!(tx.inputs().len(), 2);
    assert_eq!(tx.output_count(), 2);
    assert_eq!(tx.ttl(), 1_200);

    let outputs = tx.transaction().body().outputs();
    assert_eq!(coin(&outputs.get(0).amount().coin()), 2_000_000);
    assert_eq!(coin(&outputs.get(1).amount().coin()), 2_830_000);

    let witnesses = collect_witnesses(&tx, &wallets(&[1, 2, 3]), &wallets(&[4]));
    let signed = assemble(&tx.raw(), tx.tx_hash(), &witnesses, 4).expect("assembled");

    assert_eq!(signed.witness_count(), 4);
    assert_eq!(signed.tx_hash(), tx.tx_hash());
}

#[tokio::test]
async fn fee_multisig_pays_the_fee() {
    let builder = BatchTxBuilder::new(funded_chain(linear_fee_params()), BuilderConfig::default());
    let payouts = vec![Payout {
        address: receiver(),
        amount: 1_500_000,
    }];

    let tx = builder
        .build(
            &CancellationToken::new(),
            &SettlementRequest {
                batch_id: 2,
                payouts: &payouts,
                primary: &policy(&[1, 2, 3]),
                fee: &policy(&[4]),
            },
        )
        .await
        .expect("built");

    let outputs = tx.transaction().body().outputs();
    let paid_out: u64 = (0..outputs.len())
        .map(|idx| coin(&outputs.get(idx).amount().coin()))
        .sum();

    assert_eq!(tx.inputs().len(), 2);
    assert_eq!(outputs.len(), 3);
    // primary change keeps everything but the payout
    assert_eq!(coin(&outputs.get(1).amount().coin()), 1_500_000);
    assert_gt!(tx.fee(), 155_381);
    assert_eq!(paid_out + tx.fee(), 4_500_000);
}

#[tokio::test]
async fn missing_funds_are_reported() {
    let builder = BatchTxBuilder::new(funded_chain(flat_fee_params(170_000)), primary_pays_config());
    let payouts = vec![Payout {
        address: receiver(),
        amount: 10_000_000,
    }];

    let result = builder
        .build(
            &CancellationToken::new(),
            &SettlementRequest {
                batch_id: 3,
                payouts: &payouts,
                primary: &policy(&[1, 2, 3]),
                fee: &policy(&[4]),
            },
        )
        .await;

    assert!(matches!(
        result,
        Err(Error::InsufficientFunds {
            available: 5_000_000,
            required: 11_170_000
        })
    ));
}

#[tokio::test]
async fn shared_fee_and_primary_wallet_is_rejected() {
    let builder = BatchTxBuilder::new(funded_chain(flat_fee_params(170_000)), BuilderConfig::default());
    let payouts = vec![Payout {
        address: receiver(),
        amount: 2_000_000,
    }];

    let result = builder
        .build(
            &CancellationToken::new(),
            &SettlementRequest {
                batch_id: 4,
                payouts: &payouts,
                primary: &policy(&[1, 2, 3]),
                fee: &policy(&[1, 2, 3]),
            },
        )
        .await;

    assert!(matches!(result, Err(Error::InvalidConfiguration(_))));
}

fn batcher(bridge: MockBridge, primary_signers: &[u8]) -> BatcherCycle<MockBridge, MockChainQuery, KeyWallet> {
    BatcherCycle::new(
        bridge,
        BatchTxBuilder::new(funded_chain(linear_fee_params()), BuilderConfig::default()),
        CHAIN_ID,
        wallets(primary_signers),
        wallets(&[4]),
    )
}

#[tokio::test]
async fn batcher_reports_signed_batch() {
    let mut bridge = MockBridge::default();
    bridge.pending.push_back(Ok(Some(pending_set(7, 1_500_000))));
    let mut poller = SettlementPoller::new(
        batcher(bridge, &[1, 2]),
        Duration::from_millis(10),
        FetchFailurePolicy::Exit,
    );

    let outcome = poller.tick(&CancellationToken::new()).await.expect("submitted");

    assert!(matches!(outcome, CycleOutcome::Submitted { batch_id: 7, .. }));
    assert_eq!(poller.state(), PollerState::Idle);

    let submitted = &poller.cycle().bridge().submitted;
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].destination_chain_id, CHAIN_ID);
    assert_eq!(submitted[0].multisig_witnesses.len(), 2);
    assert_eq!(submitted[0].fee_witnesses.len(), 1);
}

#[tokio::test]
async fn batcher_with_nothing_pending_is_idle() {
    let mut poller = SettlementPoller::new(
        batcher(MockBridge::default(), &[1]),
        Duration::from_millis(10),
        FetchFailurePolicy::Exit,
    );

    let outcome = poller.tick(&CancellationToken::new()).await.expect("idle");

    assert_eq!(outcome, CycleOutcome::NothingToDo);
    assert!(poller.cycle().bridge().submitted.is_empty());
}

#[tokio::test]
async fn foreign_signing_keys_fail_the_build() {
    let mut bridge = MockBridge::default();
    bridge.pending.push_back(Ok(Some(pending_set(8, 1_500_000))));
    let mut poller = SettlementPoller::new(
        batcher(bridge, &[1, 5]),
        Duration::from_millis(10),
        FetchFailurePolicy::Exit,
    );

    let err = poller
        .tick(&CancellationToken::new())
        .await
        .expect_err("unknown signer");

    assert_eq!(err.phase, PollerState::Building);
    assert!(matches!(err.source, Error::InvalidKeySet(_)));
    assert_eq!(poller.state(), PollerState::Idle);
}

#[tokio::test(start_paused = true)]
async fn fetch_failures_stop_the_batcher() {
    let mut bridge = MockBridge::default();
    bridge.pending.push_back(Err(fetch_error()));
    let mut poller = SettlementPoller::new(
        batcher(bridge, &[1]),
        Duration::from_millis(10),
        FetchFailurePolicy::Exit,
    );

    let err = poller
        .run(&CancellationToken::new())
        .await
        .expect_err("stopped by fetch failure");

    assert_eq!(err.phase, PollerState::Fetching);
}

#[tokio::test(start_paused = true)]
async fn build_failures_do_not_stop_the_loop() {
    let mut bridge = MockBridge::default();
    // payout below the minimum UTxO value
    bridge.pending.push_back(Ok(Some(pending_set(9, 1_000))));
    bridge.pending.push_back(Err(fetch_error()));
    let mut poller = SettlementPoller::new(
        batcher(bridge, &[1]),
        Duration::from_millis(10),
        FetchFailurePolicy::Exit,
    );

    let err = poller
        .run(&CancellationToken::new())
        .await
        .expect_err("stopped by fetch failure");

    assert_eq!(err.phase, PollerState::Fetching);
    assert_eq!(poller.cycle().bridge().fetches, 2);
    assert!(poller.cycle().bridge().submitted.is_empty());
}

#[tokio::test(start_paused = true)]
async fn continue_policy_runs_until_cancelled() {
    let mut bridge = MockBridge::default();
    bridge.pending.extend([Err(fetch_error()), Err(fetch_error())]);
    let mut poller = SettlementPoller::new(
        batcher(bridge, &[1]),
        Duration::from_millis(10),
        FetchFailurePolicy::Continue,
    );

    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(35)).await;
            cancel.cancel();
        }
    };

    let (result, _) = tokio::join!(poller.run(&cancel), canceller);

    assert!(result.is_ok());
    assert_eq!(poller.cycle().bridge().fetches, 3);
}

/// Signed batch as the contract would hand it out once every co-signer reported
async fn confirmed_batch(id: u64) -> ConfirmedBatch {
    let builder = BatchTxBuilder::new(funded_chain(linear_fee_params()), BuilderConfig::default());
    let set = pending_set(id, 1_500_000);
    let tx = builder
        .build(
            &CancellationToken::new(),
            &SettlementRequest {
                batch_id: id,
                payouts: &set.payouts,
                primary: &set.primary_policy().expect("policy"),
                fee: &set.fee_policy().expect("policy"),
            },
        )
        .await
        .expect("built");

    let witnesses = collect_witnesses(&tx, &wallets(&[1, 2, 3]), &wallets(&[4]));

    ConfirmedBatch {
        id,
        raw_transaction: tx.raw(),
        multisig_witnesses: witnesses.primary_bytes(),
        fee_witnesses: witnesses.fee_bytes(),
    }
}

#[tokio::test]
async fn relayer_submits_each_batch_once() {
    let bridge = MockBridge {
        confirmed: Some(confirmed_batch(11).await),
        ..MockBridge::default()
    };
    let relayer = RelayerCycle::new(bridge, MockSubmitter::default(), CHAIN_ID, true)
        .with_submit_retry(RetryPolicy::fixed(1, Duration::from_millis(1)));
    let mut poller = SettlementPoller::new(relayer, Duration::from_millis(10), FetchFailurePolicy::Continue);
    let cancel = CancellationToken::new();

    let first = poller.tick(&cancel).await.expect("submitted");
    let second = poller.tick(&cancel).await.expect("idle");

    assert!(matches!(first, CycleOutcome::Submitted { batch_id: 11, .. }));
    assert_eq!(second, CycleOutcome::NothingToDo);
    assert_eq!(poller.cycle().last_submitted(), Some(11));

    let submitted = poller.cycle().submitter().submitted.lock().unwrap();
    assert_eq!(submitted.len(), 1);

    let tx = tx_settler::csl::FixedTransaction::from_bytes(submitted[0].clone()).expect("valid tx");
    assert_eq!(tx.witness_set().vkeys().map(|vkeys| vkeys.len()), Some(4));
}

#[tokio::test]
async fn relayer_rejects_tampered_witnesses() {
    let mut batch = confirmed_batch(12).await;
    let other = confirmed_batch(13).await;
    batch.fee_witnesses = other.fee_witnesses;

    let bridge = MockBridge {
        confirmed: Some(batch),
        ..MockBridge::default()
    };
    let relayer = RelayerCycle::new(bridge, MockSubmitter::default(), CHAIN_ID, false);
    let mut poller = SettlementPoller::new(relayer, Duration::from_millis(10), FetchFailurePolicy::Continue);

    let err = poller
        .tick(&CancellationToken::new())
        .await
        .expect_err("invalid witness");

    assert_eq!(err.phase, PollerState::Building);
    assert!(matches!(err.source, Error::InvalidWitness(_)));
    assert!(poller.cycle().submitter().submitted.lock().unwrap().is_empty());
    assert_eq!(poller.cycle().last_submitted(), None);
}

#[tokio::test]
async fn relayer_requires_the_multisig_threshold() {
    let mut batch = confirmed_batch(14).await;
    batch.multisig_witnesses.pop();

    let bridge = MockBridge {
        confirmed: Some(batch),
        ..MockBridge::default()
    };
    let relayer = RelayerCycle::new(bridge, MockSubmitter::default(), CHAIN_ID, false);
    let mut poller = SettlementPoller::new(relayer, Duration::from_millis(10), FetchFailurePolicy::Continue);

    let err = poller
        .tick(&CancellationToken::new())
        .await
        .expect_err("too few witnesses");

    assert_eq!(err.phase, PollerState::Building);
    assert!(matches!(
        err.source,
        Error::WitnessCountMismatch {
            expected: 3,
            actual: 2
        }
    ));
    assert!(poller.cycle().submitter().submitted.lock().unwrap().is_empty());
}
