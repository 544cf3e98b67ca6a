use std::path::Path;

use alloy::{
    eips::eip2718::Encodable2718,
    network::{EthereumWallet, TransactionBuilder},
    primitives::{keccak256, Address},
    signers::local::PrivateKeySigner,
};
use anyhow::anyhow;
use tx_settler::ledger::{
    GasFees, LedgerError, LedgerTxOpts, LedgerWallet, SignedLedgerTx, UnsignedCall,
};

use crate::error::{EvmError, Result};
use crate::rpc::to_request;

/// Local ledger chain signing key
#[derive(Clone)]
pub struct AlloyLedgerWallet {
    address: Address,
    wallet: EthereumWallet,
}

impl AlloyLedgerWallet {
    pub fn new(signer: PrivateKeySigner) -> Self {
        AlloyLedgerWallet {
            address: signer.address(),
            wallet: EthereumWallet::new(signer),
        }
    }

    /// Hex encoded secp256k1 key, `0x` prefix tolerated
    pub fn from_hex_key(key: &str) -> Result<Self> {
        let signer: PrivateKeySigner = key
            .trim()
            .trim_start_matches("0x")
            .parse::<PrivateKeySigner>()
            .map_err(|err| EvmError::InvalidKey(anyhow!(err)))?;

        Ok(Self::new(signer))
    }

    /// File holding a hex encoded key
    pub async fn from_key_file(path: impl AsRef<Path>) -> Result<Self> {
        let key = tokio::fs::read_to_string(path).await?;
        Self::from_hex_key(&key)
    }
}

impl LedgerWallet for AlloyLedgerWallet {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign_transaction(
        &self,
        chain_id: u64,
        call: &UnsignedCall,
        opts: &LedgerTxOpts,
    ) -> std::result::Result<SignedLedgerTx, LedgerError> {
        let mut request = to_request(call)
            .with_from(opts.from)
            .with_chain_id(chain_id)
            .with_nonce(opts.nonce)
            .with_gas_limit(opts.gas_limit);

        match opts.fees {
            GasFees::Legacy { gas_price } => request.set_gas_price(gas_price),
            GasFees::Dynamic {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                request.set_max_fee_per_gas(max_fee_per_gas);
                request.set_max_priority_fee_per_gas(max_priority_fee_per_gas);
            }
        }

        let envelope = request
            .build(&self.wallet)
            .await
            .map_err(|err| LedgerError::Signing(anyhow!(err)))?;
        let raw = envelope.encoded_2718();

        Ok(SignedLedgerTx {
            hash: keccak256(&raw),
            raw: raw.into(),
        })
    }
}
