use std::collections::BTreeMap;

use anyhow::anyhow;
use data_encoding::HEXLOWER;
use jsonrpsee::core::traits::ToRpcParams;
use num_bigint::BigInt;
use plutus_ledger_api as pla;
use plutus_ledger_api::csl::{csl_to_pla::TryToPLA, lib as csl};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tx_settler::chain_query::{self, FullTransactionOutput};

use super::error::OgmiosError;

pub type Result<T> = std::result::Result<T, OgmiosError>;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OgmiosHealth {
    pub network_synchronization: f32,
    pub current_era: String,
    pub connection_status: String,
    pub version: String,
    pub network: String,
}

impl OgmiosHealth {
    pub fn is_synchronized(&self) -> bool {
        self.network_synchronization >= 1.0
    }
}

/// Params types are sent as a single JSON object
macro_rules! object_params {
    ($($ty:ty),*) => {
        $(
            impl ToRpcParams for $ty {
                fn to_rpc_params(self) -> std::result::Result<Option<Box<RawValue>>, serde_json::Error> {
                    serde_json::value::to_raw_value(&self).map(Some)
                }
            }
        )*
    };
}

object_params!(QueryLedgerStateUtxoByAddressParams, SubmitTransactionParams, NextTransactionParams);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct QueryLedgerStateUtxoByAddressParams {
    pub addresses: Vec<String>,
}

pub(crate) type QueryLedgerStateUtxoResponse = Vec<Utxo>;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum QueryLedgerStateTipResponse {
    Origin(String),
    Point { slot: u64, id: String },
}

impl From<QueryLedgerStateTipResponse> for chain_query::ChainTip {
    fn from(tip: QueryLedgerStateTipResponse) -> chain_query::ChainTip {
        match tip {
            QueryLedgerStateTipResponse::Origin(_) => Self::Origin,
            QueryLedgerStateTipResponse::Point { slot, id } => Self::Point { slot, id },
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Utxo {
    pub transaction: TransactionId,
    pub index: u32,
    pub address: String,
    pub value: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct TransactionId {
    pub id: String,
}

/// Policy id (or `ada`) to asset name (or `lovelace`) to quantity
type Value = BTreeMap<String, BTreeMap<String, u64>>;

fn decode_hex(label: &str, hex: &str) -> Result<Vec<u8>> {
    HEXLOWER
        .decode(hex.as_bytes())
        .map_err(|source| OgmiosError::ConversionError {
            label: label.to_string(),
            source: anyhow!(source),
        })
}

impl TryFrom<&Utxo> for pla::v3::transaction::TransactionInput {
    type Error = OgmiosError;

    fn try_from(utxo: &Utxo) -> Result<Self> {
        Ok(Self {
            transaction_id: (&utxo.transaction).try_into()?,
            index: utxo.index.into(),
        })
    }
}

impl TryFrom<&TransactionId> for pla::v3::transaction::TransactionHash {
    type Error = OgmiosError;

    fn try_from(tx_id: &TransactionId) -> Result<Self> {
        Ok(Self(pla::v3::crypto::LedgerBytes(decode_hex(
            "TransactionHash",
            &tx_id.id,
        )?)))
    }
}

impl From<&pla::v3::transaction::TransactionHash> for TransactionId {
    fn from(tx_hash: &pla::v3::transaction::TransactionHash) -> TransactionId {
        let pla::v3::transaction::TransactionHash(pla::v3::crypto::LedgerBytes(bytes)) = tx_hash;
        TransactionId {
            id: HEXLOWER.encode(bytes),
        }
    }
}

fn to_pla_value(value: &Value) -> Result<pla::v3::value::Value> {
    let mut assets = BTreeMap::new();

    for (cur_sym, tokens) in value.iter() {
        let cur_sym = if cur_sym == "ada" {
            pla::v3::value::CurrencySymbol::Ada
        } else {
            pla::v3::value::CurrencySymbol::NativeToken(pla::v3::script::MintingPolicyHash(
                pla::v3::script::ScriptHash(pla::v3::crypto::LedgerBytes(decode_hex(
                    "MintingPolicyHash",
                    cur_sym,
                )?)),
            ))
        };

        let tokens = tokens
            .iter()
            .map(|(token_name, amount)| {
                let token_name = if token_name == "lovelace" {
                    pla::v3::value::TokenName::ada()
                } else {
                    pla::v3::value::TokenName(pla::v3::crypto::LedgerBytes(decode_hex(
                        "TokenName",
                        token_name,
                    )?))
                };
                Ok((token_name, BigInt::from(*amount)))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        assets.insert(cur_sym, tokens);
    }

    Ok(pla::v3::value::Value(assets))
}

impl TryFrom<&Utxo> for FullTransactionOutput {
    type Error = OgmiosError;

    fn try_from(utxo: &Utxo) -> Result<FullTransactionOutput> {
        Ok(FullTransactionOutput {
            address: csl::Address::from_bech32(&utxo.address)
                .map_err(|source| OgmiosError::ConversionError {
                    label: "Address".to_string(),
                    source: anyhow!(source),
                })?
                .try_to_pla()?,
            value: to_pla_value(&utxo.value)?,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct SubmitTransactionParams {
    pub transaction: TransactionCbor,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct TransactionCbor {
    pub cbor: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct SubmitTransactionResponse {
    pub transaction: TransactionId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct AcquireMempoolResponse {
    pub acquired: String,
    pub slot: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct ReleaseMempoolResponse {
    pub released: String,
}

/// Only transaction ids are requested
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct NextTransactionParams {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct NextTransactionResponse {
    pub transaction: Option<TransactionId>,
}

pub type QueryLedgerStateProtocolParametersResponse = ProtocolParameters;

/// The protocol parameters the settlement builder needs. Ogmios sends many more, they are
/// ignored.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolParameters {
    pub min_fee_coefficient: u64,
    pub min_fee_constant: AdaOnly,
    pub min_utxo_deposit_coefficient: u64,
    pub max_transaction_size: Option<Bytes>,
    pub max_value_size: Option<Bytes>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Bytes {
    pub bytes: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdaOnly {
    pub ada: LovelaceOnly,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LovelaceOnly {
    pub lovelace: i64,
}

fn to_size(label: &str, bytes: Option<Bytes>) -> Result<Option<u32>> {
    bytes
        .map(|size| {
            u32::try_from(size.bytes).map_err(|source| OgmiosError::ConversionError {
                label: label.to_string(),
                source: anyhow!(source),
            })
        })
        .transpose()
}

impl TryFrom<ProtocolParameters> for chain_query::ProtocolParameters {
    type Error = OgmiosError;

    fn try_from(pparams: ProtocolParameters) -> Result<Self> {
        let min_fee_constant =
            u64::try_from(pparams.min_fee_constant.ada.lovelace).map_err(|source| {
                OgmiosError::ConversionError {
                    label: "minFeeConstant".to_string(),
                    source: anyhow!(source),
                }
            })?;

        Ok(chain_query::ProtocolParameters {
            min_fee_coefficient: pparams.min_fee_coefficient,
            min_fee_constant,
            coins_per_utxo_byte: pparams.min_utxo_deposit_coefficient,
            max_transaction_size: to_size("maxTransactionSize", pparams.max_transaction_size)?,
            max_value_size: to_size("maxValueSize", pparams.max_value_size)?,
        })
    }
}
