//! Threshold multisig wallets of the UTxO chain
//!
//! Both settlement wallets (the primary one paying out transfers and the one paying fees) are
//! `n-of-k` native scripts over the co-signers' payment key hashes, with `n = k * 2 / 3 + 1`.

use std::collections::BTreeSet;
use std::str::FromStr;

use anyhow::anyhow;
use data_encoding::HEXLOWER_PERMISSIVE;
use plutus_ledger_api::csl::{csl_to_pla::TryToPLA, lib as csl, pla_to_csl::TryToCSL};
use plutus_ledger_api::v3::{
    address::{Address, Credential},
    crypto::{Ed25519PubKeyHash, LedgerBytes},
    script::{ScriptHash, ValidatorHash},
};

use crate::chain_query::Network;
use crate::error::{Error, Result};

/// Byte length of a payment key hash
const KEY_HASH_LENGTH: usize = 28;

/// Signature threshold of a wallet with `key_count` co-signers
pub fn threshold(key_count: usize) -> usize {
    key_count * 2 / 3 + 1
}

/// Co-signer set of one multisig wallet, in the order the bridge contract lists them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigPolicy {
    key_hashes: Vec<Ed25519PubKeyHash>,
}

impl MultisigPolicy {
    pub fn new(key_hashes: Vec<Ed25519PubKeyHash>) -> Result<Self> {
        if key_hashes.is_empty() {
            return Err(Error::InvalidKeySet("no co-signer keys".to_string()));
        }

        let mut seen = BTreeSet::new();
        for Ed25519PubKeyHash(LedgerBytes(bytes)) in key_hashes.iter() {
            if bytes.len() != KEY_HASH_LENGTH {
                return Err(Error::InvalidKeySet(format!(
                    "key hash {} has {} bytes, expected {}",
                    HEXLOWER_PERMISSIVE.encode(bytes),
                    bytes.len(),
                    KEY_HASH_LENGTH
                )));
            }
            if !seen.insert(bytes) {
                return Err(Error::InvalidKeySet(format!(
                    "duplicate key hash {}",
                    HEXLOWER_PERMISSIVE.encode(bytes)
                )));
            }
        }

        Ok(MultisigPolicy { key_hashes })
    }

    /// Parse hex encoded key hashes, `0x` prefixes are tolerated
    pub fn from_hex<S: AsRef<str>>(key_hashes: &[S]) -> Result<Self> {
        key_hashes
            .iter()
            .map(|key_hash| parse_key_hash(key_hash.as_ref()))
            .collect::<Result<Vec<_>>>()
            .and_then(Self::new)
    }

    pub fn key_hashes(&self) -> &[Ed25519PubKeyHash] {
        &self.key_hashes
    }

    pub fn key_count(&self) -> usize {
        self.key_hashes.len()
    }

    pub fn threshold(&self) -> usize {
        threshold(self.key_hashes.len())
    }

    pub fn contains(&self, key_hash: &Ed25519PubKeyHash) -> bool {
        self.key_hashes.contains(key_hash)
    }

    pub fn native_script(&self) -> Result<csl::NativeScript> {
        let mut scripts = csl::NativeScripts::new();

        for key_hash in self.key_hashes.iter() {
            let csl_key_hash: csl::Ed25519KeyHash = key_hash.try_to_csl()?;
            scripts.add(&csl::NativeScript::new_script_pubkey(
                &csl::ScriptPubkey::new(&csl_key_hash),
            ));
        }

        let threshold = u32::try_from(self.threshold())
            .map_err(|err| Error::InvalidKeySet(format!("too many keys: {}", err)))?;

        Ok(csl::NativeScript::new_script_n_of_k(
            &csl::ScriptNOfK::new(threshold, &scripts),
        ))
    }

    pub fn script_hash(&self) -> Result<ScriptHash> {
        Ok(ScriptHash(LedgerBytes(self.native_script()?.hash().to_bytes())))
    }

    /// Enterprise address locked by the native script
    pub fn address(&self) -> Result<Address> {
        Ok(Address {
            credential: Credential::Script(ValidatorHash(self.script_hash()?)),
            staking_credential: None,
        })
    }

    pub fn bech32_address(&self, network: Network) -> Result<String> {
        let addr: csl::Address = self
            .address()?
            .with_extra_info(network.to_network_id())
            .try_to_csl()?;

        addr.to_bech32(Some(network.address_prefix().to_owned()))
            .map_err(|err| Error::conversion("Address to Bech32", anyhow!(err)))
    }
}

pub fn parse_key_hash(hex: &str) -> Result<Ed25519PubKeyHash> {
    let hex = hex.trim_start_matches("0x");
    HEXLOWER_PERMISSIVE
        .decode(hex.as_bytes())
        .map(|bytes| Ed25519PubKeyHash(LedgerBytes(bytes)))
        .map_err(|err| Error::InvalidKeySet(format!("invalid key hash {}: {}", hex, err)))
}

/// Parse a bech32 address of the UTxO chain
pub fn parse_address(bech32: &str) -> Result<Address> {
    csl::Address::from_bech32(bech32)
        .map_err(|err| Error::conversion("bech32 address", anyhow!(err)))?
        .try_to_pla()
        .map_err(|err| Error::conversion("bech32 address", anyhow!(err)))
}

impl FromStr for MultisigPolicy {
    type Err = Error;

    /// Comma separated list of hex key hashes
    fn from_str(s: &str) -> Result<Self> {
        let key_hashes: Vec<&str> = s
            .split(',')
            .map(str::trim)
            .filter(|key_hash| !key_hash.is_empty())
            .collect();

        Self::from_hex(&key_hashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_hash(byte: u8) -> String {
        HEXLOWER_PERMISSIVE.encode(&[byte; KEY_HASH_LENGTH])
    }

    #[test]
    fn threshold_is_two_thirds_plus_one() {
        assert_eq!(threshold(1), 1);
        assert_eq!(threshold(3), 3);
        assert_eq!(threshold(4), 3);
        assert_eq!(threshold(5), 4);
        assert_eq!(threshold(7), 5);
    }

    #[test]
    fn script_address_is_stable() {
        let policy = MultisigPolicy::from_hex(&[key_hash(1), key_hash(2), key_hash(3)])
            .expect("valid key set");
        let same = MultisigPolicy::from_str(&format!(
            "0x{}, {},{}",
            key_hash(1),
            key_hash(2),
            key_hash(3)
        ))
        .expect("valid key set");

        assert_eq!(policy, same);
        assert_eq!(
            policy.address().expect("address"),
            same.address().expect("address")
        );

        let bech32 = policy.bech32_address(Network::Testnet).expect("bech32");
        assert!(bech32.starts_with("addr_test1"));
        assert_eq!(parse_address(&bech32).expect("parse"), policy.address().expect("address"));
    }

    #[test]
    fn key_order_changes_the_script() {
        let a = MultisigPolicy::from_hex(&[key_hash(1), key_hash(2)]).expect("valid key set");
        let b = MultisigPolicy::from_hex(&[key_hash(2), key_hash(1)]).expect("valid key set");

        assert_ne!(a.script_hash().expect("hash"), b.script_hash().expect("hash"));
    }

    #[test]
    fn invalid_key_sets_are_rejected() {
        assert!(MultisigPolicy::from_hex::<String>(&[]).is_err());
        assert!(MultisigPolicy::from_hex(&[key_hash(1), key_hash(1)]).is_err());
        assert!(MultisigPolicy::from_hex(&["abcd"]).is_err());
        assert!(MultisigPolicy::from_hex(&["not hex"]).is_err());
    }
}
