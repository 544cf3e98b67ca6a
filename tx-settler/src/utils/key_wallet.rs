//! Signing key read from a cardano-cli text envelope

use std::io::Cursor;
use std::path::Path;

use anyhow::anyhow;
use data_encoding::HEXLOWER_PERMISSIVE;
use plutus_ledger_api::csl::{csl_to_pla::ToPLA, lib as csl};
use plutus_ledger_api::v3::crypto::Ed25519PubKeyHash;
use thiserror::Error;
use tokio::fs;

use crate::wallet::{Signer, WalletError};

#[derive(Error, Debug)]
pub enum KeyWalletError {
    #[error("Failed to read private key: {0}")]
    PrivateKeyReadError(std::io::Error),

    #[error("Failed to parse private key: {0}")]
    PrivateKeyParseError(anyhow::Error),
}

impl From<KeyWalletError> for WalletError {
    fn from(err: KeyWalletError) -> WalletError {
        WalletError(anyhow!(err))
    }
}

#[derive(Debug, serde::Deserialize)]
struct TextEnvelope {
    #[serde(rename(deserialize = "type"))]
    key_type: String,
    #[serde(rename(deserialize = "cborHex"))]
    cbor_hex: String,
}

/// Payment signing key of one multisig co-signer
pub struct KeyWallet {
    priv_key: csl::PrivateKey,
    pkh: Ed25519PubKeyHash,
}

impl KeyWallet {
    pub fn from_private_key(priv_key: csl::PrivateKey) -> KeyWallet {
        let pkh: Ed25519PubKeyHash = priv_key.to_public().hash().to_pla();
        KeyWallet { priv_key, pkh }
    }

    /// Read a `PaymentSigningKeyShelley_ed25519` text envelope
    pub async fn from_skey_file(skey_path: impl AsRef<Path>) -> Result<KeyWallet, KeyWalletError> {
        let skey_str = fs::read_to_string(&skey_path)
            .await
            .map_err(KeyWalletError::PrivateKeyReadError)?;

        Self::from_text_envelope(&skey_str)
    }

    pub fn from_text_envelope(skey_str: &str) -> Result<KeyWallet, KeyWalletError> {
        let text_envelope: TextEnvelope = serde_json::from_str(skey_str)
            .map_err(|err| KeyWalletError::PrivateKeyParseError(anyhow!(err)))?;

        if !text_envelope.key_type.starts_with("PaymentSigningKey") {
            return Err(KeyWalletError::PrivateKeyParseError(anyhow!(
                "Unexpected key type {}",
                text_envelope.key_type
            )));
        }

        let cbor = HEXLOWER_PERMISSIVE
            .decode(text_envelope.cbor_hex.as_bytes())
            .map_err(|err| KeyWalletError::PrivateKeyParseError(anyhow!(err)))?;

        let mut raw = cbor_event::de::Deserializer::from(Cursor::new(cbor));
        let bytes: Vec<u8> = raw
            .bytes()
            .map_err(|err| KeyWalletError::PrivateKeyParseError(anyhow!("{:?}", err)))?;

        let priv_key = csl::PrivateKey::from_normal_bytes(&bytes)
            .map_err(|err| KeyWalletError::PrivateKeyParseError(anyhow!(err)))?;

        Ok(Self::from_private_key(priv_key))
    }
}

impl Signer for KeyWallet {
    fn key_hash(&self) -> Ed25519PubKeyHash {
        self.pkh.clone()
    }

    fn make_witness(&self, tx_hash: &csl::TransactionHash) -> csl::Vkeywitness {
        csl::make_vkey_witness(tx_hash, &self.priv_key)
    }
}
