//! Settlement transaction builder
//!
//! A settlement transaction spends UTxOs of the bridge multisig wallets and pays out a batch of
//! transfers. The transaction goes through the following stages:
//!
//! - [`OpenTx`]: inputs, outputs, change and scripts can still be added
//! - [`FeeComputedTx`]: fee is set and the change outputs are final
//! - [`BuiltTx`]: the body is encoded and hashed, ready to be witnessed
//!
//! Every transition consumes the previous stage, so nothing can be added to a transaction after
//! its fee was computed.

use std::collections::BTreeMap;

use anyhow::anyhow;
use derive_builder::Builder;
use itertools::Itertools;
use plutus_ledger_api::csl::{csl_to_pla::ToPLA, lib as csl, pla_to_csl::TryToCSL};
use plutus_ledger_api::v3::transaction::{TransactionHash, TransactionInput};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain_query::{ChainQuery, FullTransactionOutput, ProtocolParameters};
use crate::error::{Error, Result};
use crate::metadata::{to_auxiliary_data, TransactionMetadata};
use crate::multisig::MultisigPolicy;
use crate::retry::{perform_with_retry, RetryPolicy};

/// Fixed per-entry overhead of a UTxO in the minimum value computation, in bytes
const UTXO_ENTRY_OVERHEAD: u64 = 160;

/// Fee written into the draft transaction. Any real fee encodes to the same or fewer bytes.
const PLACEHOLDER_FEE: u64 = u32::MAX as u64;

/// Wallet paying the transaction fee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FeePayer {
    /// The dedicated fee multisig covers the fee, the primary multisig only the payouts
    #[default]
    FeeMultisig,
    /// The primary multisig covers payouts and fee
    Primary,
}

#[derive(Debug, Builder, Clone)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct BuilderConfig {
    /// Upper bound of inputs over all funding wallets
    #[builder(default = "40")]
    pub max_inputs: usize,
    /// Lower bound of the change outputs, in lovelace
    #[builder(default = "1_000_000")]
    pub min_utxo_lovelace: u64,
    /// Fee estimate used to select inputs, before the actual fee is known
    #[builder(default = "300_000")]
    pub potential_fee: u64,
    /// Validity interval of the transaction, counted from the current tip
    #[builder(default = "200")]
    pub ttl_slot_increment: u64,
    #[builder(default)]
    pub fee_payer: FeePayer,
    /// Policy for protocol parameter, tip and UTxO queries
    #[builder(default = "RetryPolicy::chain_polling()")]
    pub query_retry: RetryPolicy,
}

impl BuilderConfigBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.max_inputs == Some(0) {
            return Err("Max inputs must be at least 1".to_string());
        }

        if self.ttl_slot_increment == Some(0) {
            return Err("TTL slot increment must be at least 1".to_string());
        }

        Ok(())
    }
}

impl Default for BuilderConfig {
    fn default() -> Self {
        BuilderConfig {
            max_inputs: 40,
            min_utxo_lovelace: 1_000_000,
            potential_fee: 300_000,
            ttl_slot_increment: 200,
            fee_payer: FeePayer::default(),
            query_retry: RetryPolicy::chain_polling(),
        }
    }
}

/// Lovelace paid to a bech32 address of the UTxO chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub address: String,
    pub amount: u64,
}

/// Everything the builder needs to know about one batch
#[derive(Debug, Clone)]
pub struct SettlementRequest<'a> {
    pub batch_id: u64,
    pub payouts: &'a [Payout],
    pub primary: &'a MultisigPolicy,
    pub fee: &'a MultisigPolicy,
}

/// Inputs chosen by [`select_utxos`], ordered by key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection<K> {
    pub inputs: Vec<K>,
    pub total: u64,
}

/// Choose inputs covering `target` lovelace, with at most `max_inputs` of them.
///
/// Candidates are scanned in iteration order. The first one covering the target on its own is
/// selected alone. Otherwise candidates are accumulated until the target is covered; once
/// `max_inputs` are held, a larger candidate replaces the smallest held one. This way the
/// selection succeeds whenever the `max_inputs` largest candidates cover the target.
pub fn select_utxos<K: Ord>(
    candidates: impl IntoIterator<Item = (K, u64)>,
    target: u64,
    max_inputs: usize,
) -> Result<Selection<K>> {
    let candidates: Vec<(K, u64)> = candidates.into_iter().collect();

    if max_inputs == 0 {
        return Err(Error::InsufficientFunds {
            available: 0,
            required: target,
        });
    }

    if let Some(idx) = candidates.iter().position(|(_, amount)| *amount >= target) {
        let (key, amount) = candidates
            .into_iter()
            .nth(idx)
            .ok_or_else(|| Error::TransactionBuildError(anyhow!("Selected UTxO vanished")))?;

        return Ok(Selection {
            inputs: vec![key],
            total: amount,
        });
    }

    let mut held: Vec<(K, u64)> = Vec::with_capacity(max_inputs);
    let mut total: u128 = 0;

    for (key, amount) in candidates {
        if held.len() < max_inputs {
            held.push((key, amount));
            total += u128::from(amount);
        } else {
            let smallest = held
                .iter()
                .position_min_by_key(|(_, held_amount)| *held_amount);

            match smallest {
                Some(idx) if held[idx].1 < amount => {
                    total = total - u128::from(held[idx].1) + u128::from(amount);
                    held[idx] = (key, amount);
                }
                _ => continue,
            }
        }

        if total >= u128::from(target) {
            held.sort_by(|(a, _), (b, _)| a.cmp(b));

            return Ok(Selection {
                inputs: held.into_iter().map(|(key, _)| key).collect(),
                total: u64::try_from(total).unwrap_or(u64::MAX),
            });
        }
    }

    Err(Error::InsufficientFunds {
        available: u64::try_from(total).unwrap_or(u64::MAX),
        required: target,
    })
}

/// Merge payouts to the same address and drop the ones that cannot be paid, ordered by address
/// so that every co-signer derives the same transaction from the same batch.
pub fn aggregate_payouts(payouts: &[Payout], network_id: u8) -> Result<Vec<Payout>> {
    let mut merged: BTreeMap<&str, u64> = BTreeMap::new();

    for payout in payouts.iter() {
        if payout.amount == 0 {
            warn!(address = payout.address, "Skipped payout with zero amount");
            continue;
        }

        let valid = csl::Address::from_bech32(&payout.address)
            .ok()
            .and_then(|addr| addr.network_id().ok())
            .is_some_and(|id| id == network_id);

        if !valid {
            warn!(address = payout.address, "Skipped payout to an invalid address");
            continue;
        }

        let amount = merged.entry(&payout.address).or_default();
        *amount = amount.checked_add(payout.amount).ok_or_else(|| {
            Error::TransactionBuildError(anyhow!("Payout sum overflow for {}", payout.address))
        })?;
    }

    Ok(merged
        .into_iter()
        .map(|(address, amount)| Payout {
            address: address.to_string(),
            amount,
        })
        .collect())
}

/// Minimum lovelace of an output given its encoded size
pub fn min_utxo_for_size(params: &ProtocolParameters, output_size: usize) -> u64 {
    (UTXO_ENTRY_OVERHEAD + output_size as u64).saturating_mul(params.coins_per_utxo_byte)
}

/// Minimum lovelace of `output`. The value is set to `u64::MAX` lovelace for the computation, so
/// the result stays valid for any amount actually paid.
pub fn min_utxo(params: &ProtocolParameters, address: &csl::Address, value: &csl::Value) -> u64 {
    let mut value = value.clone();
    value.set_coin(&csl::BigNum::from(u64::MAX));
    let output = csl::TransactionOutput::new(address, &value);

    min_utxo_for_size(params, output.to_bytes().len())
}

pub fn linear_fee(params: &ProtocolParameters, tx_size: usize) -> Result<u64> {
    params
        .min_fee_coefficient
        .checked_mul(tx_size as u64)
        .and_then(|fee| fee.checked_add(params.min_fee_constant))
        .ok_or_else(|| Error::TransactionBuildError(anyhow!("Fee overflow for {} bytes", tx_size)))
}

fn sum_values<'a>(outputs: impl IntoIterator<Item = &'a FullTransactionOutput>) -> Result<csl::Value> {
    outputs
        .into_iter()
        .try_fold(csl::Value::new(&csl::BigNum::zero()), |acc, output| {
            let value: csl::Value = output.value.try_to_csl()?;
            acc.checked_add(&value)
                .map_err(|err| Error::conversion("Value sum", anyhow!(err)))
        })
}

fn has_native_tokens(value: &csl::Value) -> bool {
    value.multiasset().is_some_and(|multiasset| multiasset.len() > 0)
}

/// Change returned to one funding wallet
#[derive(Clone)]
pub struct ChangeOutput {
    pub address: csl::Address,
    /// Native tokens of the spent inputs, returned as they are
    pub value: csl::Value,
    /// Lovelace of the spent inputs of this wallet
    pub available: u64,
    /// Lovelace of this wallet going to payouts
    pub spent: u64,
    /// Whether the fee is deducted from this change
    pub pays_fee: bool,
    pub min_utxo: u64,
}

impl ChangeOutput {
    fn output_with_coin(&self, coin: u64) -> csl::TransactionOutput {
        let mut value = self.value.clone();
        value.set_coin(&csl::BigNum::from(coin));
        csl::TransactionOutput::new(&self.address, &value)
    }
}

/// Transaction still accepting inputs and outputs
pub struct OpenTx {
    inputs: Vec<TransactionInput>,
    outputs: Vec<csl::TransactionOutput>,
    change: Vec<ChangeOutput>,
    native_scripts: csl::NativeScripts,
    expected_witnesses: usize,
    auxiliary_data: Option<csl::AuxiliaryData>,
    ttl: u64,
}

impl OpenTx {
    pub fn new(ttl: u64) -> Self {
        OpenTx {
            inputs: Vec::new(),
            outputs: Vec::new(),
            change: Vec::new(),
            native_scripts: csl::NativeScripts::new(),
            expected_witnesses: 0,
            auxiliary_data: None,
            ttl,
        }
    }

    pub fn add_input(&mut self, input: TransactionInput) -> &mut Self {
        self.inputs.push(input);
        self
    }

    pub fn add_output(&mut self, output: csl::TransactionOutput) -> &mut Self {
        self.outputs.push(output);
        self
    }

    /// Change outputs are appended after the regular outputs, in insertion order
    pub fn add_change(&mut self, change: ChangeOutput) -> &mut Self {
        self.change.push(change);
        self
    }

    pub fn add_native_script(&mut self, script: &csl::NativeScript) -> &mut Self {
        self.native_scripts.add(script);
        self
    }

    /// Number of vkey witnesses the signed transaction will carry, used to size the fee
    pub fn expect_witnesses(&mut self, count: usize) -> &mut Self {
        self.expected_witnesses += count;
        self
    }

    pub fn with_auxiliary_data(&mut self, auxiliary_data: csl::AuxiliaryData) -> &mut Self {
        self.auxiliary_data = Some(auxiliary_data);
        self
    }

    /// Size the transaction with placeholder witnesses, derive the fee and settle the change.
    ///
    /// Change below its minimum is dropped and added to the fee, unless it carries native
    /// tokens. Insufficient change for the fee is an error.
    pub fn compute_fee(self, params: &ProtocolParameters) -> Result<FeeComputedTx> {
        if self.inputs.is_empty() {
            return Err(Error::TransactionBuildError(anyhow!(
                "Transaction has no inputs"
            )));
        }

        let draft_outputs = self
            .outputs
            .iter()
            .cloned()
            .chain(self.change.iter().map(|change| {
                change.output_with_coin(change.available.saturating_sub(change.spent))
            }))
            .collect::<Vec<_>>();

        let placeholder_witnesses = placeholder_witnesses(self.expected_witnesses)?;
        let draft = encode_transaction(
            &self.inputs,
            &draft_outputs,
            PLACEHOLDER_FEE,
            self.ttl,
            &self.native_scripts,
            Some(&placeholder_witnesses),
            self.auxiliary_data.as_ref(),
        )?;
        let draft_size = draft.len();

        if let Some(max_size) = params.max_transaction_size {
            if draft_size > max_size as usize {
                return Err(Error::TransactionTooLarge {
                    size: draft_size,
                    max_size,
                });
            }
        }

        let fee = linear_fee(params, draft_size)?;
        debug!(draft_size, fee, "Computed transaction fee");

        let mut outputs = self.outputs;
        let mut folded_change: u64 = 0;

        for change in self.change.iter() {
            let fee_share = if change.pays_fee { fee } else { 0 };
            let required = change.spent.checked_add(fee_share).ok_or_else(|| {
                Error::TransactionBuildError(anyhow!("Required amount overflow"))
            })?;

            let amount = change
                .available
                .checked_sub(required)
                .ok_or(Error::InsufficientFunds {
                    available: change.available,
                    required,
                })?;

            if amount >= change.min_utxo {
                outputs.push(change.output_with_coin(amount));
            } else if has_native_tokens(&change.value) {
                return Err(Error::TokenChangeBelowMinimum {
                    change: amount,
                    minimum: change.min_utxo,
                });
            } else {
                debug!(
                    change = amount,
                    minimum = change.min_utxo,
                    "Change below minimum UTxO, adding it to the fee"
                );
                folded_change += amount;
            }
        }

        Ok(FeeComputedTx {
            inputs: self.inputs,
            outputs,
            fee: fee + folded_change,
            ttl: self.ttl,
            native_scripts: self.native_scripts,
            auxiliary_data: self.auxiliary_data,
        })
    }
}

/// Transaction with its final fee and outputs
pub struct FeeComputedTx {
    inputs: Vec<TransactionInput>,
    outputs: Vec<csl::TransactionOutput>,
    fee: u64,
    ttl: u64,
    native_scripts: csl::NativeScripts,
    auxiliary_data: Option<csl::AuxiliaryData>,
}

impl FeeComputedTx {
    pub fn fee(&self) -> u64 {
        self.fee
    }

    pub fn outputs(&self) -> &[csl::TransactionOutput] {
        &self.outputs
    }

    pub fn build(self) -> Result<BuiltTx> {
        let bytes = encode_transaction(
            &self.inputs,
            &self.outputs,
            self.fee,
            self.ttl,
            &self.native_scripts,
            None,
            self.auxiliary_data.as_ref(),
        )?;

        let tx = csl::FixedTransaction::from_bytes(bytes)
            .map_err(|err| Error::TransactionBuildError(anyhow!(err)))?;
        let tx_hash: TransactionHash = tx.transaction_hash().to_pla();

        Ok(BuiltTx {
            tx,
            tx_hash,
            fee: self.fee,
            ttl: self.ttl,
            inputs: self.inputs,
            output_count: self.outputs.len(),
        })
    }
}

/// Encoded and hashed transaction without witnesses
pub struct BuiltTx {
    tx: csl::FixedTransaction,
    tx_hash: TransactionHash,
    fee: u64,
    ttl: u64,
    inputs: Vec<TransactionInput>,
    output_count: usize,
}

impl BuiltTx {
    pub fn tx_hash(&self) -> &TransactionHash {
        &self.tx_hash
    }

    pub fn transaction(&self) -> &csl::FixedTransaction {
        &self.tx
    }

    /// CBOR of the transaction, body bytes preserved
    pub fn raw(&self) -> Vec<u8> {
        self.tx.to_bytes()
    }

    pub fn fee(&self) -> u64 {
        self.fee
    }

    pub fn ttl(&self) -> u64 {
        self.ttl
    }

    pub fn inputs(&self) -> &[TransactionInput] {
        &self.inputs
    }

    pub fn output_count(&self) -> usize {
        self.output_count
    }
}

fn encode_transaction(
    inputs: &[TransactionInput],
    outputs: &[csl::TransactionOutput],
    fee: u64,
    ttl: u64,
    native_scripts: &csl::NativeScripts,
    vkeys: Option<&csl::Vkeywitnesses>,
    auxiliary_data: Option<&csl::AuxiliaryData>,
) -> Result<Vec<u8>> {
    let mut csl_inputs = csl::TransactionInputs::new();
    for input in inputs.iter() {
        csl_inputs.add(&input.try_to_csl()?);
    }

    let mut csl_outputs = csl::TransactionOutputs::new();
    for output in outputs.iter() {
        csl_outputs.add(output);
    }

    let mut body =
        csl::TransactionBody::new_tx_body(&csl_inputs, &csl_outputs, &csl::BigNum::from(fee));
    body.set_ttl(&csl::BigNum::from(ttl));

    if let Some(auxiliary_data) = auxiliary_data {
        body.set_auxiliary_data_hash(&csl::hash_auxiliary_data(auxiliary_data));
    }

    let mut witness_set = csl::TransactionWitnessSet::new();
    if native_scripts.len() > 0 {
        witness_set.set_native_scripts(native_scripts);
    }
    if let Some(vkeys) = vkeys {
        witness_set.set_vkeys(vkeys);
    }

    Ok(csl::Transaction::new(&body, &witness_set, auxiliary_data.cloned()).to_bytes())
}

/// Distinct witnesses over a zero hash, the size of real witnesses
fn placeholder_witnesses(count: usize) -> Result<csl::Vkeywitnesses> {
    let tx_hash = csl::TransactionHash::from_bytes(vec![0; 32])
        .map_err(|err| Error::TransactionBuildError(anyhow!(err)))?;
    let mut vkeys = csl::Vkeywitnesses::new();

    for idx in 0..count {
        let mut seed = [0u8; 32];
        seed[..8].copy_from_slice(&(idx as u64 + 1).to_le_bytes());

        let key = csl::PrivateKey::from_normal_bytes(&seed)
            .map_err(|err| Error::TransactionBuildError(anyhow!(err)))?;
        vkeys.add(&csl::make_vkey_witness(&tx_hash, &key));
    }

    Ok(vkeys)
}

/// Funding wallet of a settlement transaction with its selected inputs
struct Funding {
    inputs: Vec<TransactionInput>,
    change: ChangeOutput,
}

/// Builds settlement transactions from the current UTxO chain state
pub struct BatchTxBuilder<Q> {
    chain_query: Q,
    config: BuilderConfig,
}

impl<Q: ChainQuery> BatchTxBuilder<Q> {
    pub fn new(chain_query: Q, config: BuilderConfig) -> Self {
        BatchTxBuilder {
            chain_query,
            config,
        }
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    pub fn chain_query(&self) -> &Q {
        &self.chain_query
    }

    /// Build the unsigned settlement transaction of a batch
    pub async fn build(
        &self,
        cancel: &CancellationToken,
        request: &SettlementRequest<'_>,
    ) -> Result<BuiltTx> {
        let query = &self.chain_query;
        let policy = &self.config.query_retry;
        let network_id = query.get_network().to_network_id();

        let params = perform_with_retry(cancel, policy, move || query.query_protocol_params()).await?;
        let tip = perform_with_retry(cancel, policy, move || query.query_tip()).await?;
        let ttl = tip
            .slot()
            .checked_add(self.config.ttl_slot_increment)
            .ok_or_else(|| Error::TransactionBuildError(anyhow!("TTL overflow")))?;

        let payouts = aggregate_payouts(request.payouts, network_id)?;
        if payouts.is_empty() {
            return Err(Error::TransactionBuildError(anyhow!(
                "Batch {} has no payable transfers",
                request.batch_id
            )));
        }

        let mut payout_sum: u64 = 0;
        let mut payout_outputs = Vec::with_capacity(payouts.len());
        for payout in payouts.iter() {
            let address = csl::Address::from_bech32(&payout.address)
                .map_err(|err| Error::conversion("Payout address", anyhow!(err)))?;
            let output =
                csl::TransactionOutput::new(&address, &csl::Value::new(&csl::BigNum::from(payout.amount)));

            let minimum = min_utxo_for_size(&params, output.to_bytes().len());
            if payout.amount < minimum {
                return Err(Error::OutputBelowMinimum {
                    address: payout.address.clone(),
                    amount: payout.amount,
                    minimum,
                });
            }

            payout_sum = payout_sum.checked_add(payout.amount).ok_or_else(|| {
                Error::TransactionBuildError(anyhow!("Payout sum overflow"))
            })?;
            payout_outputs.push(output);
        }

        let fundings = match self.config.fee_payer {
            FeePayer::Primary => {
                let primary = self
                    .fund(
                        cancel,
                        request.primary,
                        &params,
                        payout_sum,
                        self.config.potential_fee,
                        self.config.max_inputs,
                    )
                    .await?;
                vec![primary]
            }
            FeePayer::FeeMultisig => {
                if request.primary.address()? == request.fee.address()? {
                    return Err(Error::InvalidConfiguration(
                        "fee multisig must differ from the primary multisig".to_string(),
                    ));
                }

                let fee = self
                    .fund(
                        cancel,
                        request.fee,
                        &params,
                        0,
                        self.config.potential_fee,
                        self.config.max_inputs,
                    )
                    .await?;
                let primary = self
                    .fund(
                        cancel,
                        request.primary,
                        &params,
                        payout_sum,
                        0,
                        self.config.max_inputs.saturating_sub(fee.inputs.len()),
                    )
                    .await?;
                vec![primary, fee]
            }
        };

        let mut tx = OpenTx::new(ttl);
        tx.with_auxiliary_data(to_auxiliary_data(&TransactionMetadata::for_batch(
            request.batch_id,
        ))?);

        for output in payout_outputs {
            tx.add_output(output);
        }

        tx.add_native_script(&request.primary.native_script()?);
        if self.config.fee_payer == FeePayer::FeeMultisig {
            tx.add_native_script(&request.fee.native_script()?);
        }
        tx.expect_witnesses(request.primary.key_count() + request.fee.key_count());

        for funding in fundings {
            for input in funding.inputs {
                tx.add_input(input);
            }
            tx.add_change(funding.change);
        }

        let built = tx.compute_fee(&params)?.build()?;

        info!(
            batch_id = request.batch_id,
            tx_hash = ?built.tx_hash(),
            fee = built.fee(),
            ttl = built.ttl(),
            inputs = built.inputs().len(),
            "Built settlement transaction"
        );

        Ok(built)
    }

    /// Select inputs of `policy`'s wallet covering `spent + fee` plus the minimum change
    async fn fund(
        &self,
        cancel: &CancellationToken,
        policy: &MultisigPolicy,
        params: &ProtocolParameters,
        spent: u64,
        fee: u64,
        max_inputs: usize,
    ) -> Result<Funding> {
        let query = &self.chain_query;
        let network_id = query.get_network().to_network_id();
        let address = policy.address()?;
        let addr = &address;

        let utxos = perform_with_retry(cancel, &self.config.query_retry, move || {
            query.query_utxos_by_addr(addr)
        })
        .await?;

        let csl_address: csl::Address = address.with_extra_info(network_id).try_to_csl()?;
        let held = sum_values(utxos.values())?;
        let min_change = std::cmp::max(
            self.config.min_utxo_lovelace,
            min_utxo(params, &csl_address, &held),
        );

        let target = spent
            .checked_add(fee)
            .and_then(|target| target.checked_add(min_change))
            .ok_or_else(|| Error::TransactionBuildError(anyhow!("Target amount overflow")))?;

        debug!(
            ?address,
            utxos = utxos.len(),
            target,
            min_change,
            "Selecting inputs"
        );

        let selection = select_utxos(
            utxos.iter().map(|(input, output)| (input, output.lovelace())),
            target,
            max_inputs,
        )?;

        let value = sum_values(selection.inputs.iter().filter_map(|input| utxos.get(*input)))?;

        Ok(Funding {
            inputs: selection.inputs.into_iter().cloned().collect(),
            change: ChangeOutput {
                address: csl_address,
                value,
                available: selection.total,
                spent,
                pays_fee: fee > 0,
                min_utxo: min_change,
            },
        })
    }
}
