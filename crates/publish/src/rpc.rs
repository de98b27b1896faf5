//! Shared RPC utilities for interacting with Ethereum JSON-RPC endpoints.

use std::time::Duration;

use alloy_core::primitives::{Address, B256};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;

use crate::error::RpcError;

/// Default timeout for a single RPC request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default interval between receipt polling attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Create an HTTP client configured for JSON-RPC requests.
pub fn create_client(timeout: Duration) -> Result<reqwest::Client, RpcError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| RpcError::Transport {
            method: "client".to_string(),
            reason: e.to_string(),
        })
}

/// Make a JSON-RPC call and deserialize the result.
///
/// Node-side errors keep their code, message and revert data so callers can tell a
/// revert from an underfunded signer.
pub async fn json_rpc_call<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    params: Vec<Value>,
) -> Result<T, RpcError> {
    let response = client
        .post(url)
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }))
        .send()
        .await
        .map_err(|e| RpcError::Transport {
            method: method.to_string(),
            reason: e.to_string(),
        })?;

    let result: Value = response.json().await.map_err(|e| RpcError::Decode {
        method: method.to_string(),
        reason: e.to_string(),
    })?;

    if let Some(error) = result.get("error") {
        return Err(RpcError::Response {
            method: method.to_string(),
            code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            data: error.get("data").map(|d| match d {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
        });
    }

    let result_value = result.get("result").cloned().ok_or_else(|| RpcError::Decode {
        method: method.to_string(),
        reason: "no result in response".to_string(),
    })?;

    serde_json::from_value(result_value).map_err(|e| RpcError::Decode {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

/// Deserialize a u64 from a hex quantity string (with 0x prefix).
fn deserialize_u64_from_hex<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    u64::from_str_radix(s.trim_start_matches("0x"), 16).map_err(serde::de::Error::custom)
}

/// The subset of a transaction receipt the pipeline relies on.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    pub transaction_hash: B256,
    #[serde(deserialize_with = "deserialize_u64_from_hex")]
    pub block_number: u64,
    #[serde(deserialize_with = "deserialize_u64_from_hex")]
    pub status: u64,
    #[serde(default)]
    pub contract_address: Option<Address>,
}

impl TxReceipt {
    pub fn succeeded(&self) -> bool {
        self.status == 1
    }
}

/// Poll for a transaction receipt until it appears or `timeout` elapses.
///
/// Returns `Ok(None)` on timeout. Transport errors while polling are logged and
/// retried until the deadline, since the transaction may still be mined.
pub async fn wait_for_receipt(
    client: &reqwest::Client,
    url: &str,
    tx_hash: B256,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<Option<TxReceipt>, RpcError> {
    let start = std::time::Instant::now();

    loop {
        match json_rpc_call::<Option<TxReceipt>>(
            client,
            url,
            "eth_getTransactionReceipt",
            vec![serde_json::json!(tx_hash)],
        )
        .await
        {
            Ok(Some(receipt)) => return Ok(Some(receipt)),
            Ok(None) => {
                tracing::trace!(%tx_hash, "Receipt not available yet");
            }
            Err(e @ RpcError::Transport { .. }) => {
                tracing::debug!(error = %e, %tx_hash, "Receipt poll failed, retrying...");
            }
            Err(e) => return Err(e),
        }

        if start.elapsed() >= timeout {
            return Ok(None);
        }

        tokio::time::sleep(poll_interval).await;
    }
}
