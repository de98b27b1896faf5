//! JSON-RPC chain client used by the production deployer and registrar.

use std::{collections::HashMap, time::Duration};

use alloy_consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy_core::primitives::{Address, B256, Bytes, TxKind, U64, U128, U256};
use alloy_eips::eip2718::Encodable2718;
use alloy_signer::SignerSync;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use url::Url;

use crate::{
    error::RpcError,
    network::{ChainProbe, GasPolicy, NetworkProfile, Signer},
    rpc::{self, TxReceipt},
};

/// JSON-RPC requests a single send makes at most: simulation, gas price, gas estimate,
/// nonce and the broadcast itself.
pub const REQUESTS_PER_SEND: u64 = 5;

/// Timeouts for chain interaction.
#[derive(Debug, Clone, Copy)]
pub struct ChainOptions {
    /// Bound on a single JSON-RPC request.
    pub request_timeout: Duration,
    /// Bound on waiting for a transaction to be mined.
    pub receipt_timeout: Duration,
    /// Interval between receipt polls.
    pub poll_interval: Duration,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            request_timeout: rpc::DEFAULT_REQUEST_TIMEOUT,
            receipt_timeout: Duration::from_secs(300),
            poll_interval: rpc::DEFAULT_POLL_INTERVAL,
        }
    }
}

/// A transaction to send from the profile's signer.
#[derive(Debug, Clone)]
pub struct TxRequest {
    /// `None` creates a contract.
    pub to: Option<Address>,
    pub input: Bytes,
    pub value: U256,
}

impl TxRequest {
    pub fn create(code: Bytes) -> Self {
        Self {
            to: None,
            input: code,
            value: U256::ZERO,
        }
    }

    pub fn call(to: Address, input: Bytes) -> Self {
        Self {
            to: Some(to),
            input,
            value: U256::ZERO,
        }
    }

    fn as_call_object(&self, from: Address) -> Value {
        let mut object = json!({
            "from": from,
            "data": self.input,
            "value": format!("0x{:x}", self.value),
        });
        if let Some(to) = self.to {
            object["to"] = json!(to);
        }
        object
    }
}

/// Node messages meaning the exact transaction is already in its pool.
const ALREADY_KNOWN_MARKERS: &[&str] = &["already known", "known transaction"];

/// A broadcast that did not go through.
#[derive(Debug)]
pub enum SendError {
    /// Refused before or by the node. Nothing is on its way to the chain.
    NotSent(RpcError),
    /// The node never answered the broadcast, so it may have accepted the transaction.
    /// The hash is known when the transaction was signed locally.
    Unacknowledged {
        source: RpcError,
        tx_hash: Option<B256>,
    },
}

impl From<RpcError> for SendError {
    fn from(err: RpcError) -> Self {
        SendError::NotSent(err)
    }
}

fn is_already_known(err: &RpcError) -> bool {
    let message = err.message().to_ascii_lowercase();
    ALREADY_KNOWN_MARKERS.iter().any(|marker| message.contains(marker))
}

/// Sort out the answer to a broadcast. `local_hash` is the hash of a locally signed
/// transaction, which the node may report as already known.
fn broadcast_outcome(
    sent: Result<B256, RpcError>,
    local_hash: Option<B256>,
) -> Result<B256, SendError> {
    match sent {
        Ok(hash) => Ok(hash),
        Err(err) => match (err, local_hash) {
            (err @ RpcError::Response { .. }, Some(hash)) if is_already_known(&err) => Ok(hash),
            (err @ RpcError::Response { .. }, _) => Err(SendError::NotSent(err)),
            (source, tx_hash) => Err(SendError::Unacknowledged { source, tx_hash }),
        },
    }
}

/// JSON-RPC client with local signing and per-signer nonce allocation.
pub struct RpcChain {
    client: reqwest::Client,
    options: ChainOptions,
    /// Next nonce per (chain id, sender). Held while a transaction is signed and sent so
    /// concurrent deploys from one signer never reuse a nonce.
    nonces: Mutex<HashMap<(u64, Address), u64>>,
}

impl RpcChain {
    pub fn new(options: ChainOptions) -> Result<Self, RpcError> {
        Ok(Self {
            client: rpc::create_client(options.request_timeout)?,
            options,
            nonces: Mutex::new(HashMap::new()),
        })
    }

    pub fn options(&self) -> &ChainOptions {
        &self.options
    }

    async fn call<T: DeserializeOwned>(
        &self,
        url: &Url,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, RpcError> {
        rpc::json_rpc_call(&self.client, url.as_str(), method, params).await
    }

    /// Execute `request` without sending it, returning the call output.
    ///
    /// Reverts surface as [`RpcError::Response`] carrying the revert data.
    pub async fn simulate(
        &self,
        profile: &NetworkProfile,
        request: &TxRequest,
    ) -> Result<Bytes, RpcError> {
        self.call(
            &profile.rpc_url,
            "eth_call",
            vec![request.as_call_object(profile.signer.address()), json!("latest")],
        )
        .await
    }

    /// Gas price and gas limit for `request` under the profile's gas policy.
    async fn gas(
        &self,
        profile: &NetworkProfile,
        request: &TxRequest,
    ) -> Result<(u128, u64), RpcError> {
        match profile.gas {
            GasPolicy::Fixed {
                gas_price,
                gas_limit,
            } => Ok((u128::from(gas_price), gas_limit)),
            GasPolicy::Auto {
                multiplier_percent,
                gas_price,
            } => {
                let gas_price = match gas_price {
                    Some(price) => u128::from(price),
                    None => {
                        let price: U128 =
                            self.call(&profile.rpc_url, "eth_gasPrice", vec![]).await?;
                        price.to::<u128>()
                    }
                };
                let estimate: U64 = self
                    .call(
                        &profile.rpc_url,
                        "eth_estimateGas",
                        vec![request.as_call_object(profile.signer.address())],
                    )
                    .await?;
                let gas_limit = estimate.to::<u64>().saturating_mul(multiplier_percent) / 100;
                Ok((gas_price, gas_limit))
            }
        }
    }

    /// Sign (or hand to the node) and broadcast `request`. Returns the transaction hash
    /// as soon as the node accepts it; inclusion is awaited separately.
    pub async fn send(
        &self,
        profile: &NetworkProfile,
        request: &TxRequest,
    ) -> Result<B256, SendError> {
        let (gas_price, gas_limit) = self.gas(profile, request).await?;
        let from = profile.signer.address();
        let key = (profile.chain_id, from);

        let mut nonces = self.nonces.lock().await;
        let nonce = match nonces.get(&key) {
            Some(nonce) => *nonce,
            None => {
                let count: U64 = self
                    .call(
                        &profile.rpc_url,
                        "eth_getTransactionCount",
                        vec![json!(from), json!("pending")],
                    )
                    .await?;
                count.to::<u64>()
            }
        };

        let (sent, local_hash) = match &profile.signer {
            Signer::Local(signer) => {
                let tx = TxLegacy {
                    chain_id: Some(profile.chain_id),
                    nonce,
                    gas_price,
                    gas_limit,
                    to: request.to.map_or(TxKind::Create, TxKind::Call),
                    value: request.value,
                    input: request.input.clone(),
                };
                let signature = signer
                    .sign_hash_sync(&tx.signature_hash())
                    .map_err(|e| RpcError::Signing(e.to_string()))?;
                let signed = tx.into_signed(signature);
                let hash = *signed.hash();
                let raw = TxEnvelope::from(signed).encoded_2718();

                let sent = self
                    .call(
                        &profile.rpc_url,
                        "eth_sendRawTransaction",
                        vec![json!(Bytes::from(raw))],
                    )
                    .await;
                (sent, Some(hash))
            }
            Signer::Unlocked(address) => {
                let mut object = request.as_call_object(*address);
                object["gas"] = json!(format!("0x{:x}", gas_limit));
                object["gasPrice"] = json!(format!("0x{:x}", gas_price));
                object["nonce"] = json!(format!("0x{:x}", nonce));

                let sent = self
                    .call(&profile.rpc_url, "eth_sendTransaction", vec![object])
                    .await;
                (sent, None)
            }
        };

        match broadcast_outcome(sent, local_hash) {
            Ok(hash) => {
                nonces.insert(key, nonce + 1);
                tracing::debug!(%hash, nonce, gas_price, gas_limit, "Transaction sent");
                Ok(hash)
            }
            Err(err) => {
                // The node's view of the nonce may have moved; re-read it next time.
                nonces.remove(&key);
                Err(err)
            }
        }
    }

    /// Wait for `tx_hash` to be mined, bounded by the receipt timeout.
    pub async fn wait(
        &self,
        profile: &NetworkProfile,
        tx_hash: B256,
    ) -> Result<Option<TxReceipt>, RpcError> {
        rpc::wait_for_receipt(
            &self.client,
            profile.rpc_url.as_str(),
            tx_hash,
            self.options.receipt_timeout,
            self.options.poll_interval,
        )
        .await
    }
}

impl ChainProbe for RpcChain {
    async fn chain_id(&self, rpc_url: &Url) -> Result<u64, RpcError> {
        let chain_id: U64 = self.call(rpc_url, "eth_chainId", vec![]).await?;
        Ok(chain_id.to::<u64>())
    }

    async fn receipt(
        &self,
        profile: &NetworkProfile,
        tx_hash: B256,
    ) -> Result<Option<TxReceipt>, RpcError> {
        self.call(
            &profile.rpc_url,
            "eth_getTransactionReceipt",
            vec![json!(tx_hash)],
        )
        .await
    }

    async fn transaction_known(
        &self,
        profile: &NetworkProfile,
        tx_hash: B256,
    ) -> Result<bool, RpcError> {
        let transaction: Option<Value> = self
            .call(
                &profile.rpc_url,
                "eth_getTransactionByHash",
                vec![json!(tx_hash)],
            )
            .await?;
        Ok(transaction.is_some())
    }
}
