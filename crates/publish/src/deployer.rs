//! Contract deployment and source verification.

use std::{future::Future, path::PathBuf, sync::Arc};

use alloy_core::primitives::B256;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    abi::{self, AbiArg},
    artifact::Artifact,
    chain::{RpcChain, SendError, TxRequest},
    error::{DeployError, RpcError, VerifyError},
    explorer::{ExplorerClient, VerificationRequest},
    network::{ChainProbe, NetworkProfile},
    record::DeployedContract,
    rpc::TxReceipt,
};

fn default_verify() -> bool {
    true
}

/// A logical contract the pipeline deploys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractSpec {
    /// Logical name, e.g. `votingToken`. Keys the publish record.
    pub name: String,
    /// Path to the Hardhat artifact JSON.
    pub artifact: PathBuf,
    #[serde(default, rename = "args")]
    pub constructor_args: Vec<AbiArg>,
    /// Submit the source to the network's explorer after publishing.
    #[serde(default = "default_verify")]
    pub verify: bool,
}

/// Deploys contracts and submits them for source verification.
///
/// A deployment is two calls: [`send_deployment`](Self::send_deployment) broadcasts the
/// creation transaction and hands back its hash, [`await_deployment`](Self::await_deployment)
/// waits for it to be mined. Callers persist the hash in between.
pub trait ContractDeployer {
    /// Broadcast the creation transaction for `spec`.
    fn send_deployment(
        &self,
        profile: &NetworkProfile,
        spec: &ContractSpec,
    ) -> impl Future<Output = Result<B256, DeployError>> + Send;

    /// Wait for `tx_hash`, the creation transaction of `spec`, to be mined.
    fn await_deployment(
        &self,
        profile: &NetworkProfile,
        spec: &ContractSpec,
        tx_hash: B256,
    ) -> impl Future<Output = Result<DeployedContract, DeployError>> + Send;

    /// Submit the deployed contract's source to the explorer.
    fn verify(
        &self,
        profile: &NetworkProfile,
        spec: &ContractSpec,
        deployed: &DeployedContract,
    ) -> impl Future<Output = Result<(), VerifyError>> + Send;
}

/// Deployer backed by a JSON-RPC node and an Etherscan-compatible explorer.
pub struct RpcDeployer {
    chain: Arc<RpcChain>,
    explorer: ExplorerClient,
}

impl RpcDeployer {
    pub fn new(chain: Arc<RpcChain>, explorer: ExplorerClient) -> Self {
        Self { chain, explorer }
    }
}

fn send_error(contract: &str, err: SendError) -> DeployError {
    let source = match err {
        SendError::NotSent(source) => source,
        SendError::Unacknowledged { source, tx_hash } => {
            return DeployError::Unacknowledged {
                contract: contract.to_string(),
                tx_hash,
                reason: source.to_string(),
            };
        }
    };

    if source.is_insufficient_funds() {
        DeployError::InsufficientFunds {
            contract: contract.to_string(),
            reason: source.message(),
        }
    } else if source.is_revert() {
        DeployError::Reverted {
            contract: contract.to_string(),
            tx_hash: None,
            reason: source.message(),
        }
    } else {
        DeployError::Rpc {
            contract: contract.to_string(),
            source,
        }
    }
}

impl ContractDeployer for RpcDeployer {
    async fn send_deployment(
        &self,
        profile: &NetworkProfile,
        spec: &ContractSpec,
    ) -> Result<B256, DeployError> {
        let invalid = |reason: String| DeployError::Artifact {
            contract: spec.name.clone(),
            reason,
        };

        let artifact = Artifact::load(&spec.artifact).map_err(invalid)?;
        let args = abi::encode_constructor_args(&spec.constructor_args)
            .map_err(|e| invalid(format!("invalid constructor arguments: {}", e)))?;
        let request = TxRequest::create(artifact.creation_code(&args));

        let tx_hash = self
            .chain
            .send(profile, &request)
            .await
            .map_err(|e| send_error(&spec.name, e))?;

        tracing::info!(
            contract = %spec.name,
            artifact = %artifact.qualified_name(),
            %tx_hash,
            "Deployment transaction sent"
        );
        Ok(tx_hash)
    }

    async fn await_deployment(
        &self,
        profile: &NetworkProfile,
        spec: &ContractSpec,
        tx_hash: B256,
    ) -> Result<DeployedContract, DeployError> {
        // The transaction exists; every failure carries its hash.
        let receipt = match self.chain.wait(profile, tx_hash).await {
            Ok(Some(receipt)) => receipt,
            Ok(None) => {
                return Err(DeployError::Timeout {
                    contract: spec.name.clone(),
                    tx_hash: Some(tx_hash),
                });
            }
            Err(err) => {
                tracing::warn!(contract = %spec.name, %tx_hash, error = %err, "Lost track of deployment");
                return Err(DeployError::Timeout {
                    contract: spec.name.clone(),
                    tx_hash: Some(tx_hash),
                });
            }
        };

        deployed_from_receipt(spec, &receipt)
    }

    async fn verify(
        &self,
        profile: &NetworkProfile,
        spec: &ContractSpec,
        deployed: &DeployedContract,
    ) -> Result<(), VerifyError> {
        let fail = |reason: String| VerifyError {
            contract: spec.name.clone(),
            reason,
        };

        let explorer = profile
            .explorer
            .as_ref()
            .ok_or_else(|| fail(format!("no explorer configured for {}", profile.name)))?;

        let artifact = Artifact::load(&spec.artifact).map_err(fail)?;
        let build_info = artifact.build_info().map_err(fail)?;
        let constructor_args = abi::encode_constructor_args(&deployed.constructor_args)
            .map_err(|e| fail(format!("invalid constructor arguments: {}", e)))?;

        let request = VerificationRequest {
            address: deployed.address,
            contract_name: artifact.qualified_name(),
            compiler_version: build_info.solc_long_version,
            source: build_info.input,
            constructor_args,
        };

        let guid = self
            .explorer
            .submit(explorer, profile.chain_id, &request)
            .await
            .map_err(fail)?;

        tracing::info!(contract = %spec.name, address = %deployed.address, %guid, "Verification submitted");
        Ok(())
    }
}

impl ChainProbe for RpcDeployer {
    async fn chain_id(&self, rpc_url: &Url) -> Result<u64, RpcError> {
        self.chain.chain_id(rpc_url).await
    }

    async fn receipt(
        &self,
        profile: &NetworkProfile,
        tx_hash: B256,
    ) -> Result<Option<TxReceipt>, RpcError> {
        self.chain.receipt(profile, tx_hash).await
    }

    async fn transaction_known(
        &self,
        profile: &NetworkProfile,
        tx_hash: B256,
    ) -> Result<bool, RpcError> {
        self.chain.transaction_known(profile, tx_hash).await
    }
}

/// Turn a mined creation receipt into the recorded contract.
pub fn deployed_from_receipt(
    spec: &ContractSpec,
    receipt: &TxReceipt,
) -> Result<DeployedContract, DeployError> {
    if !receipt.succeeded() {
        return Err(DeployError::Reverted {
            contract: spec.name.clone(),
            tx_hash: Some(receipt.transaction_hash),
            reason: format!("creation transaction reverted in block {}", receipt.block_number),
        });
    }

    let address = receipt
        .contract_address
        .ok_or_else(|| DeployError::Reverted {
            contract: spec.name.clone(),
            tx_hash: Some(receipt.transaction_hash),
            reason: "receipt carries no contract address".to_string(),
        })?;

    Ok(DeployedContract {
        logical_name: spec.name.clone(),
        address,
        constructor_args: spec.constructor_args.clone(),
        deploy_tx_hash: receipt.transaction_hash,
    })
}

#[cfg(test)]
mod tests {
    use alloy_core::primitives::Address;

    use super::*;

    fn spec() -> ContractSpec {
        ContractSpec {
            name: "votingToken".to_string(),
            artifact: PathBuf::from("artifacts/contracts/TestVotingToken.sol/TestVotingToken.json"),
            constructor_args: vec![AbiArg::new("uint256", "10000000")],
            verify: true,
        }
    }

    fn receipt(status: u64, contract_address: Option<Address>) -> TxReceipt {
        TxReceipt {
            transaction_hash: B256::repeat_byte(0xaa),
            block_number: 12,
            status,
            contract_address,
        }
    }

    #[test]
    fn test_deployed_from_successful_receipt() {
        let address = Address::repeat_byte(0x42);
        let deployed = deployed_from_receipt(&spec(), &receipt(1, Some(address))).unwrap();

        assert_eq!(deployed.address, address);
        assert_eq!(deployed.logical_name, "votingToken");
        assert_eq!(deployed.deploy_tx_hash, B256::repeat_byte(0xaa));
        assert_eq!(deployed.constructor_args, spec().constructor_args);
    }

    #[test]
    fn test_reverted_receipt_is_reverted() {
        let err = deployed_from_receipt(&spec(), &receipt(0, None)).unwrap_err();

        assert!(matches!(err, DeployError::Reverted { tx_hash: Some(_), .. }));
    }

    #[test]
    fn test_send_error_classification() {
        let funds = RpcError::Response {
            method: "eth_sendRawTransaction".to_string(),
            code: -32000,
            message: "insufficient funds for gas * price + value".to_string(),
            data: None,
        };
        assert!(matches!(
            send_error("votingToken", SendError::NotSent(funds)),
            DeployError::InsufficientFunds { .. }
        ));

        let revert = RpcError::Response {
            method: "eth_estimateGas".to_string(),
            code: 3,
            message: "execution reverted".to_string(),
            data: Some("0x".to_string()),
        };
        assert!(matches!(
            send_error("votingToken", SendError::NotSent(revert)),
            DeployError::Reverted { tx_hash: None, .. }
        ));

        let refused = RpcError::Transport {
            method: "eth_estimateGas".to_string(),
            reason: "connection refused".to_string(),
        };
        assert!(matches!(
            send_error("votingToken", SendError::NotSent(refused)),
            DeployError::Rpc { .. }
        ));
    }

    #[test]
    fn test_unanswered_broadcast_is_not_retried() {
        let hash = B256::repeat_byte(0x5e);
        let err = send_error(
            "votingToken",
            SendError::Unacknowledged {
                source: RpcError::Transport {
                    method: "eth_sendRawTransaction".to_string(),
                    reason: "operation timed out".to_string(),
                },
                tx_hash: Some(hash),
            },
        );

        assert_eq!(err.broadcast_tx(), Some(hash));
        assert!(err.in_doubt());
    }

    #[test]
    fn test_contract_spec_from_toml() {
        let spec: ContractSpec = toml::from_str(
            r#"
            name = "votingToken"
            artifact = "artifacts/contracts/TestVotingToken.sol/TestVotingToken.json"
            args = [{ type = "uint256", value = "10000000" }]
            "#,
        )
        .unwrap();

        assert!(spec.verify);
        assert_eq!(spec.constructor_args[0].ty, "uint256");
    }
}
