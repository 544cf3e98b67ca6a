use std::collections::BTreeMap;

use anyhow::anyhow;
use plutus_ledger_api::csl::lib as csl;

use crate::error::Error;

/// Metadata label of settlement transactions
pub const BATCH_METADATA_LABEL: u64 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionMetadata(pub BTreeMap<u64, Metadata>);

impl TransactionMetadata {
    /// `{0: {"type": "batch", "id": <batch id>}}`, so settlement transactions can be traced back
    /// to the bridge batch they pay out
    pub fn for_batch(batch_id: u64) -> Self {
        let id = i64::try_from(batch_id)
            .map_or_else(|_| Metadata::Text(batch_id.to_string()), Metadata::Int);

        TransactionMetadata::from([(
            BATCH_METADATA_LABEL,
            Metadata::Map(BTreeMap::from([
                (Metadata::Text("type".to_string()), Metadata::Text("batch".to_string())),
                (Metadata::Text("id".to_string()), id),
            ])),
        )])
    }
}

impl<const N: usize> From<[(u64, Metadata); N]> for TransactionMetadata {
    fn from(arr: [(u64, Metadata); N]) -> Self {
        TransactionMetadata(BTreeMap::from(arr))
    }
}

impl TryFrom<&TransactionMetadata> for csl::GeneralTransactionMetadata {
    type Error = Error;

    fn try_from(tx_metadata: &TransactionMetadata) -> Result<Self, Self::Error> {
        let mut csl_tx_metadata = csl::GeneralTransactionMetadata::new();

        for (key, value) in tx_metadata.0.iter() {
            let _ = csl_tx_metadata.insert(&csl::BigNum::from(*key), &value.try_into()?);
        }

        Ok(csl_tx_metadata)
    }
}

#[derive(Debug, Clone, PartialOrd, Ord, PartialEq, Eq)]
pub enum Metadata {
    Map(BTreeMap<Metadata, Metadata>),
    List(Vec<Metadata>),
    Int(i64),
    Bytes(Vec<u8>),
    Text(String),
}

impl TryFrom<&Metadata> for csl::TransactionMetadatum {
    type Error = Error;

    fn try_from(metadata: &Metadata) -> Result<Self, Self::Error> {
        match metadata {
            Metadata::Map(metadata_map) => {
                let mut csl_metadata_map = csl::MetadataMap::new();

                for (key, value) in metadata_map.iter() {
                    let _ = csl_metadata_map.insert(&key.try_into()?, &value.try_into()?);
                }

                Ok(csl::TransactionMetadatum::new_map(&csl_metadata_map))
            }

            Metadata::List(metadata_list) => {
                let mut csl_metadata_list = csl::MetadataList::new();

                for elem in metadata_list.iter() {
                    csl_metadata_list.add(&elem.try_into()?);
                }

                Ok(csl::TransactionMetadatum::new_list(&csl_metadata_list))
            }

            Metadata::Int(int) => Ok(csl::TransactionMetadatum::new_int(&to_int(*int))),

            Metadata::Bytes(bytes) => csl::TransactionMetadatum::new_bytes(bytes.to_owned())
                .map_err(|source| Error::conversion("Metadata::Bytes", anyhow!(source))),

            Metadata::Text(str) => csl::TransactionMetadatum::new_text(str.to_owned())
                .map_err(|source| Error::conversion("Metadata::Text", anyhow!(source))),
        }
    }
}

fn to_int(int: i64) -> csl::Int {
    if int >= 0 {
        csl::Int::new(&csl::BigNum::from(int.unsigned_abs()))
    } else {
        csl::Int::new_negative(&csl::BigNum::from(int.unsigned_abs()))
    }
}

/// Auxiliary data carrying `metadata`
pub fn to_auxiliary_data(metadata: &TransactionMetadata) -> Result<csl::AuxiliaryData, Error> {
    let mut aux_data = csl::AuxiliaryData::new();
    aux_data.set_metadata(&metadata.try_into()?);
    Ok(aux_data)
}
