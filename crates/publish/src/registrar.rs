//! Plugin repo registration through the factory contract.

use std::{future::Future, sync::Arc};

use alloy_core::primitives::{Address, B256};

use crate::{
    abi,
    chain::{RpcChain, SendError, TxRequest},
    error::{RegisterError, RpcError},
    metadata::ContentRef,
    network::NetworkProfile,
};

/// Custom error the subdomain registrar reverts with when the repo name is taken.
const ALREADY_REGISTERED_SIGNATURE: &str = "AlreadyRegistered(bytes32,address)";

/// Substrings of node messages that identify a taken repo name.
const COLLISION_MARKERS: &[&str] = &["alreadyregistered", "already registered", "already exists"];

/// Everything the factory needs to create a repo with its first version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub repo_name: String,
    pub plugin_setup: Address,
    /// Defaults to the signer's address.
    pub maintainer: Option<Address>,
    pub build: ContentRef,
    pub release: ContentRef,
}

impl Registration {
    /// Check the inputs before anything touches the chain.
    pub fn validate(&self) -> Result<(), RegisterError> {
        if self.repo_name.trim().is_empty() {
            return Err(RegisterError::InvalidInput("repo name is empty".to_string()));
        }
        if self.plugin_setup.is_zero() {
            return Err(RegisterError::InvalidInput(
                "plugin setup address is zero".to_string(),
            ));
        }
        for content in [&self.build, &self.release] {
            if content.uri.trim().is_empty() {
                return Err(RegisterError::InvalidInput(format!(
                    "{} metadata URI is empty",
                    content.kind
                )));
            }
        }
        Ok(())
    }
}

/// Registers a plugin repo with its first version. Not reversible.
///
/// Like deployments, a registration is broadcast first and awaited second, so the caller
/// can persist the transaction hash before waiting on it.
pub trait Registrar {
    /// Check the registration against the factory and broadcast it.
    fn send_registration(
        &self,
        profile: &NetworkProfile,
        registration: &Registration,
    ) -> impl Future<Output = Result<B256, RegisterError>> + Send;

    /// Wait for `tx_hash`, the registration transaction, to be mined successfully.
    fn await_registration(
        &self,
        profile: &NetworkProfile,
        registration: &Registration,
        tx_hash: B256,
    ) -> impl Future<Output = Result<(), RegisterError>> + Send;
}

/// Registrar calling the network's `plugin_repo_factory`.
pub struct FactoryRegistrar {
    chain: Arc<RpcChain>,
}

impl FactoryRegistrar {
    pub fn new(chain: Arc<RpcChain>) -> Self {
        Self { chain }
    }

    /// The factory call for `registration` on `profile`'s network.
    fn request(
        &self,
        profile: &NetworkProfile,
        registration: &Registration,
    ) -> Result<(Address, TxRequest), RegisterError> {
        let factory = profile
            .factory()
            .map_err(|e| RegisterError::InvalidInput(e.to_string()))?;
        let maintainer = registration
            .maintainer
            .unwrap_or_else(|| profile.signer.address());

        let calldata = abi::encode_create_repo_call(
            &registration.repo_name,
            registration.plugin_setup,
            maintainer,
            &registration.release.uri_bytes(),
            &registration.build.uri_bytes(),
        );
        Ok((factory, TxRequest::call(factory, calldata)))
    }
}

/// Whether a node error reports that the repo name is already registered.
pub fn is_name_collision(err: &RpcError) -> bool {
    let RpcError::Response { message, data, .. } = err else {
        return false;
    };

    let selector = hex::encode(abi::selector(ALREADY_REGISTERED_SIGNATURE));
    let data_matches = data
        .as_deref()
        .map(|d| d.trim_start_matches("0x").to_ascii_lowercase().starts_with(&selector))
        .unwrap_or(false);

    let message = message.to_ascii_lowercase();
    data_matches || COLLISION_MARKERS.iter().any(|marker| message.contains(marker))
}

fn call_error(repo_name: &str, err: RpcError, tx_hash: Option<B256>) -> RegisterError {
    if err.is_insufficient_funds() {
        RegisterError::InsufficientFunds(err.message())
    } else if err.is_revert() {
        RegisterError::Reverted {
            repo_name: repo_name.to_string(),
            name_collision: is_name_collision(&err),
            reason: err.message(),
            tx_hash,
        }
    } else {
        RegisterError::Rpc(err)
    }
}

fn send_error(repo_name: &str, err: SendError) -> RegisterError {
    match err {
        SendError::NotSent(source) => call_error(repo_name, source, None),
        SendError::Unacknowledged { source, tx_hash } => RegisterError::Unacknowledged {
            tx_hash,
            reason: source.to_string(),
        },
    }
}

/// The repo address a simulated factory call returns. Anything else means the configured
/// address is not a factory, and sending would register nothing.
fn created_repo(factory: Address, output: &[u8]) -> Result<Address, RegisterError> {
    abi::decode_address(output)
        .filter(|repo| !repo.is_zero())
        .ok_or(RegisterError::NoFactory(factory))
}

impl Registrar for FactoryRegistrar {
    async fn send_registration(
        &self,
        profile: &NetworkProfile,
        registration: &Registration,
    ) -> Result<B256, RegisterError> {
        registration.validate()?;

        let (factory, request) = self.request(profile, registration)?;
        let repo_name = registration.repo_name.as_str();

        // A revert here costs nothing and carries the revert data.
        let output = self
            .chain
            .simulate(profile, &request)
            .await
            .map_err(|e| call_error(repo_name, e, None))?;
        let plugin_repo = created_repo(factory, &output)?;

        let tx_hash = self
            .chain
            .send(profile, &request)
            .await
            .map_err(|e| send_error(repo_name, e))?;

        tracing::info!(
            repo_name,
            %factory,
            %plugin_repo,
            %tx_hash,
            "Registration transaction sent"
        );
        Ok(tx_hash)
    }

    async fn await_registration(
        &self,
        profile: &NetworkProfile,
        registration: &Registration,
        tx_hash: B256,
    ) -> Result<(), RegisterError> {
        let repo_name = registration.repo_name.as_str();

        match self.chain.wait(profile, tx_hash).await {
            Ok(Some(receipt)) if receipt.succeeded() => Ok(()),
            Ok(Some(receipt)) => {
                // Mined but reverted, most likely a concurrent registration of the same
                // name. Replaying the call recovers the reason.
                let (_, request) = self.request(profile, registration)?;
                let err = match self.chain.simulate(profile, &request).await {
                    Err(replayed) if replayed.is_revert() => {
                        call_error(repo_name, replayed, Some(tx_hash))
                    }
                    _ => RegisterError::Reverted {
                        repo_name: repo_name.to_string(),
                        reason: format!(
                            "registration transaction reverted in block {}",
                            receipt.block_number
                        ),
                        name_collision: false,
                        tx_hash: Some(tx_hash),
                    },
                };
                Err(err)
            }
            Ok(None) => Err(RegisterError::Timeout {
                tx_hash: Some(tx_hash),
            }),
            Err(err) => {
                tracing::warn!(%tx_hash, error = %err, "Lost track of registration");
                Err(RegisterError::Timeout {
                    tx_hash: Some(tx_hash),
                })
            }
        }
    }
}
