use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use derive_builder::Builder;
use jsonrpsee::{
    core::{client::ClientT, traits::ToRpcParams},
    rpc_params,
    ws_client::{WsClient, WsClientBuilder},
};
use plutus_ledger_api::csl::pla_to_csl::TryToCSL;
use plutus_ledger_api::{
    csl::lib as csl,
    v3::{
        address::Address,
        transaction::{TransactionHash, TransactionInput},
    },
};
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tx_settler::{
    chain_query::{
        ChainQuery, ChainQueryError, ChainTip, FullTransactionOutput, Network, ProtocolParameters,
    },
    submitter::{Submitter, SubmitterError},
};
use url::Url;

use super::{
    api::{
        AcquireMempoolResponse, NextTransactionParams, NextTransactionResponse, OgmiosHealth,
        QueryLedgerStateProtocolParametersResponse, QueryLedgerStateTipResponse,
        QueryLedgerStateUtxoByAddressParams, QueryLedgerStateUtxoResponse, ReleaseMempoolResponse,
        SubmitTransactionParams, SubmitTransactionResponse, TransactionCbor, TransactionId,
    },
    error::{OgmiosError, Result},
};

#[derive(Debug, Builder, Clone)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct OgmiosClientConfig {
    pub url: Url,
    #[builder(default = "Network::Testnet")]
    pub network: Network,
    /// Seconds to wait for Ogmios to catch up with the network on startup
    #[builder(default = "90")]
    pub startup_timeout: u64,
    /// How long a submitted transaction may stay in the mempool
    #[builder(default = "Duration::from_secs(120)")]
    pub confirm_timeout: Duration,
}

impl OgmiosClientConfigBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(url) = &self.url {
            match url.scheme() {
                "http" | "https" => Ok(()),
                scheme => Err(format!(
                    "Ogmios URL must use http or https, got {}",
                    scheme,
                )),
            }
        } else {
            Ok(())
        }
    }
}

impl OgmiosClientConfig {
    pub fn get_ws_url(&self) -> Result<Url> {
        let mut url = self.url.clone();
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| OgmiosError::StartupError(anyhow!("Cannot use {} over websocket", self.url)))?;
        Ok(url)
    }

    pub fn get_restful_health_url(&self) -> Result<Url> {
        self.url
            .join("health")
            .map_err(|err| OgmiosError::StartupError(anyhow!(err)))
    }
}

/// Ogmios client for reading from and submitting to the UTxO chain.
///
/// The websocket connection is replaced transparently when it drops, the failed request
/// itself is not repeated.
pub struct OgmiosClient {
    config: OgmiosClientConfig,
    client: RwLock<Arc<WsClient>>,
}

impl OgmiosClient {
    /// Wait until Ogmios is synchronized, then open the websocket connection
    pub async fn connect(config: OgmiosClientConfig) -> Result<Self> {
        let giveup_time = Instant::now() + Duration::from_secs(config.startup_timeout);

        let base = Duration::from_secs(1);
        let mut attempt = 0;
        loop {
            let health = Self::check_health(&config).await;
            if health.as_ref().is_ok_and(OgmiosHealth::is_synchronized) {
                let client = WsClientBuilder::default()
                    .build(config.get_ws_url()?)
                    .await?;
                info!(url = %config.url, network = ?config.network, "Connected to Ogmios");

                return Ok(Self {
                    config,
                    client: RwLock::new(Arc::new(client)),
                });
            }

            if Instant::now() > giveup_time {
                return match health {
                    Err(err) => Err(OgmiosError::StartupError(anyhow!(
                        "health request failed: {:?}",
                        err
                    ))),
                    Ok(health) => Err(OgmiosError::StartupError(anyhow!(
                        "couldn't sync: {:?}",
                        health
                    ))),
                };
            }

            let wait_duration = base
                .checked_mul(2u32.pow(attempt))
                .ok_or(OgmiosError::StartupError(anyhow!("health wait overflowed")))?;
            debug!(attempt, wait_ms = wait_duration.as_millis(), "Ogmios not ready yet");
            tokio::time::sleep(wait_duration).await;
            attempt += 1;
        }
    }

    pub fn get_config(&self) -> &OgmiosClientConfig {
        &self.config
    }

    pub async fn check_health(config: &OgmiosClientConfig) -> Result<OgmiosHealth> {
        Ok(reqwest::Client::new()
            .get(config.get_restful_health_url()?)
            .send()
            .await?
            .json::<OgmiosHealth>()
            .await?)
    }

    /// Current websocket client, reconnecting if the previous one was closed
    async fn client(&self) -> Result<Arc<WsClient>> {
        {
            let client = self.client.read().await;
            if client.is_connected() {
                return Ok(client.clone());
            }
        }

        let mut client = self.client.write().await;
        if !client.is_connected() {
            warn!(url = %self.config.url, "Ogmios connection lost, reconnecting");
            *client = Arc::new(
                WsClientBuilder::default()
                    .build(self.config.get_ws_url()?)
                    .await?,
            );
        }

        Ok(client.clone())
    }

    async fn request<P, U>(&self, method: &str, params: P) -> Result<U>
    where
        U: DeserializeOwned,
        P: ToRpcParams + Send,
    {
        let client = self.client().await?;
        client.request(method, params).await.map_err(|err| {
            debug!(%err, method, "Ogmios JSON RPC call error.");
            OgmiosError::JSONRpcError(err)
        })
    }

    async fn acquire_mempool(&self) -> Result<u64> {
        let resp: AcquireMempoolResponse = self.request("acquireMempool", rpc_params![]).await?;
        Ok(resp.slot)
    }

    async fn release_mempool(&self) -> Result<ReleaseMempoolResponse> {
        self.request("releaseMempool", rpc_params![]).await
    }

    async fn next_transaction(&self) -> Result<Option<TransactionId>> {
        let resp: NextTransactionResponse = self
            .request("nextTransaction", NextTransactionParams::default())
            .await?;
        Ok(resp.transaction)
    }

    /// Returns once the transaction is no longer in the mempool snapshot. Acquiring a new
    /// snapshot while holding one waits for the mempool to change.
    async fn wait_for_mempool_exit(&self, tx_hash: &TransactionHash) -> Result<()> {
        let tx_id = TransactionId::from(tx_hash);

        loop {
            let slot = self.acquire_mempool().await?;

            let mut in_mempool = false;
            while let Some(pending) = self.next_transaction().await? {
                if pending == tx_id {
                    in_mempool = true;
                    break;
                }
            }

            if !in_mempool {
                self.release_mempool().await?;
                return Ok(());
            }

            debug!(?tx_hash, slot, "Transaction still in mempool");
        }
    }
}

impl ChainQuery for OgmiosClient {
    fn get_network(&self) -> Network {
        self.config.network
    }

    async fn query_protocol_params(
        &self,
    ) -> std::result::Result<ProtocolParameters, ChainQueryError> {
        let resp: QueryLedgerStateProtocolParametersResponse = self
            .request("queryLedgerState/protocolParameters", rpc_params![])
            .await?;

        Ok(resp.try_into()?)
    }

    /// Slot and id of the latest block
    async fn query_tip(&self) -> std::result::Result<ChainTip, ChainQueryError> {
        let resp: QueryLedgerStateTipResponse =
            self.request("queryLedgerState/tip", rpc_params![]).await?;
        Ok(resp.into())
    }

    async fn query_utxos_by_addr(
        &self,
        address: &Address,
    ) -> std::result::Result<BTreeMap<TransactionInput, FullTransactionOutput>, ChainQueryError>
    {
        debug!(?address, "Query UTxOs by address");
        let addr: csl::Address = address
            .with_extra_info(self.config.network.to_network_id())
            .try_to_csl()
            .map_err(OgmiosError::TryFromPLAError)?;

        let addr = addr
            .to_bech32(Some(self.config.network.address_prefix().to_owned()))
            .map_err(|source| OgmiosError::ConversionError {
                label: "Address to Bech32".to_string(),
                source: anyhow!(source),
            })?;
        let params = QueryLedgerStateUtxoByAddressParams {
            addresses: vec![addr],
        };

        let resp: QueryLedgerStateUtxoResponse =
            self.request("queryLedgerState/utxo", params).await?;

        Ok(decode_utxos(&resp)?)
    }
}

impl Submitter for OgmiosClient {
    async fn submit_transaction(
        &self,
        tx: &csl::FixedTransaction,
    ) -> std::result::Result<TransactionHash, SubmitterError> {
        debug!(tx_hash = %tx.transaction_hash().to_hex(), "Submitting settlement transaction");
        let params = SubmitTransactionParams {
            transaction: TransactionCbor {
                cbor: tx.to_hex(),
            },
        };

        let resp: SubmitTransactionResponse = self.request("submitTransaction", params).await?;

        Ok(TransactionHash::try_from(&resp.transaction)?)
    }

    async fn await_tx_confirm(
        &self,
        tx_hash: &TransactionHash,
    ) -> std::result::Result<(), SubmitterError> {
        info!(?tx_hash, "Waiting for the transaction to leave the mempool");

        bounded_mempool_wait(
            self.config.confirm_timeout,
            tx_hash,
            self.wait_for_mempool_exit(tx_hash),
            || self.release_mempool(),
        )
        .await?;

        Ok(())
    }
}

/// Run `wait` for at most `limit`. A wait cut short may still hold a mempool snapshot, so
/// `release` runs before the timeout is reported. Its failure is only logged.
async fn bounded_mempool_wait<W, R, RF, T>(
    limit: Duration,
    tx_hash: &TransactionHash,
    wait: W,
    release: R,
) -> Result<()>
where
    W: Future<Output = Result<()>>,
    R: FnOnce() -> RF,
    RF: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, wait).await {
        Ok(result) => result,
        Err(_) => {
            if let Err(err) = release().await {
                warn!(?tx_hash, %err, "Failed to release the mempool snapshot");
            }
            Err(OgmiosError::ConfirmationTimeout(format!("{:?}", tx_hash)))
        }
    }
}

fn decode_utxos(
    resp: &QueryLedgerStateUtxoResponse,
) -> Result<BTreeMap<TransactionInput, FullTransactionOutput>> {
    resp.iter()
        .map(|utxo| {
            Ok((
                TransactionInput::try_from(utxo)?,
                FullTransactionOutput::try_from(utxo)?,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> std::result::Result<OgmiosClientConfig, OgmiosClientConfigBuilderError> {
        OgmiosClientConfigBuilder::default()
            .url(Url::parse(url).expect("valid url"))
            .build()
    }

    #[test]
    fn websocket_url_follows_http_scheme() {
        let plain = config("http://127.0.0.1:1337").expect("valid config");
        let secure = config("https://ogmios.example.com/").expect("valid config");

        assert_eq!(plain.get_ws_url().expect("ws url").as_str(), "ws://127.0.0.1:1337/");
        assert_eq!(
            secure.get_ws_url().expect("ws url").as_str(),
            "wss://ogmios.example.com/"
        );
        assert_eq!(
            plain.get_restful_health_url().expect("health url").as_str(),
            "http://127.0.0.1:1337/health"
        );
    }

    #[test]
    fn non_http_urls_are_rejected() {
        assert!(config("ws://127.0.0.1:1337").is_err());
    }

    fn tx_hash() -> TransactionHash {
        TransactionHash(plutus_ledger_api::v3::crypto::LedgerBytes(vec![7; 32]))
    }

    #[tokio::test]
    async fn mempool_is_released_when_confirmation_times_out() {
        let released = std::sync::atomic::AtomicBool::new(false);

        let result = bounded_mempool_wait(
            Duration::from_millis(10),
            &tx_hash(),
            std::future::pending(),
            || async {
                released.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            },
        )
        .await;

        assert!(matches!(result, Err(OgmiosError::ConfirmationTimeout(_))));
        assert!(released.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failed_release_still_reports_the_timeout() {
        let result = bounded_mempool_wait(
            Duration::from_millis(10),
            &tx_hash(),
            std::future::pending(),
            || async { Err::<(), _>(OgmiosError::StartupError(anyhow!("socket closed"))) },
        )
        .await;

        assert!(matches!(result, Err(OgmiosError::ConfirmationTimeout(_))));
    }

    #[tokio::test]
    async fn finished_waits_skip_the_release() {
        let released = std::sync::atomic::AtomicBool::new(false);

        let result = bounded_mempool_wait(
            Duration::from_secs(5),
            &tx_hash(),
            async { Ok(()) },
            || async {
                released.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            },
        )
        .await;

        assert!(result.is_ok());
        assert!(!released.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn defaults() {
        let config = config("http://127.0.0.1:1337").expect("valid config");

        assert_eq!(config.network, Network::Testnet);
        assert_eq!(config.startup_timeout, 90);
        assert_eq!(config.confirm_timeout, Duration::from_secs(120));
    }
}
