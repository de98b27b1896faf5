//! Etherscan-compatible source verification.

use std::time::Duration;

use alloy_core::primitives::Address;
use serde::Deserialize;
use serde_json::Value;

use crate::network::ExplorerProfile;

/// What the explorer needs to reproduce a deployment's bytecode.
#[derive(Debug, Clone)]
pub struct VerificationRequest {
    pub address: Address,
    /// Fully qualified contract name, `path/File.sol:Name`.
    pub contract_name: String,
    /// Full solc version, e.g. `0.8.17+commit.8df45f5f`.
    pub compiler_version: String,
    /// Standard JSON compiler input.
    pub source: Value,
    /// ABI-encoded constructor arguments.
    pub constructor_args: Vec<u8>,
}

impl VerificationRequest {
    fn form(&self, chain_id: u64, api_key: &str) -> Vec<(&'static str, String)> {
        vec![
            ("apikey", api_key.to_string()),
            ("module", "contract".to_string()),
            ("action", "verifysourcecode".to_string()),
            ("chainid", chain_id.to_string()),
            ("contractaddress", self.address.to_string()),
            ("sourceCode", self.source.to_string()),
            ("codeformat", "solidity-standard-json-input".to_string()),
            ("contractname", self.contract_name.clone()),
            ("compilerversion", format!("v{}", self.compiler_version)),
            // Etherscan's field name, misspelling included.
            ("constructorArguements", hex::encode(&self.constructor_args)),
        ]
    }
}

#[derive(Debug, Deserialize)]
struct ExplorerResponse {
    status: String,
    message: String,
    #[serde(default)]
    result: Value,
}

/// Client for explorer verification endpoints.
#[derive(Debug, Clone)]
pub struct ExplorerClient {
    client: reqwest::Client,
}

impl ExplorerClient {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    /// Submit `request` for verification. Returns the explorer's receipt guid, or a
    /// note when the contract was already verified.
    ///
    /// Verification itself completes asynchronously on the explorer side.
    pub async fn submit(
        &self,
        explorer: &ExplorerProfile,
        chain_id: u64,
        request: &VerificationRequest,
    ) -> Result<String, String> {
        let api_key = explorer
            .api_key
            .as_deref()
            .ok_or_else(|| format!("no API key configured for {}", explorer.api_url))?;

        let response = self
            .client
            .post(explorer.api_url.clone())
            .form(&request.form(chain_id, api_key))
            .send()
            .await
            .map_err(|e| format!("explorer request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("explorer returned HTTP {}", status));
        }

        let body: ExplorerResponse = response
            .json()
            .await
            .map_err(|e| format!("failed to parse explorer response: {}", e))?;

        interpret(body)
    }
}

fn interpret(body: ExplorerResponse) -> Result<String, String> {
    let result = match &body.result {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    if body.status == "1" {
        return Ok(result);
    }
    if result.to_ascii_lowercase().contains("already verified") {
        return Ok("already verified".to_string());
    }
    Err(format!("{}: {}", body.message, result))
}
