//! Error types for every pipeline component.
//!
//! Components surface typed failures. Only the orchestrator turns them into a
//! [`Disposition`] and decides whether a run halts, resumes later or carries on.

use std::path::PathBuf;

use alloy_core::primitives::{Address, B256};
use thiserror::Error;

/// How the orchestrator treats a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Disposition {
    /// Re-invoking the same stage may succeed. The record is left at its last good state.
    Retryable,
    /// Operator intervention is required before any retry can succeed.
    Fatal,
    /// Reported only, never blocks the outcome.
    BestEffort,
}

/// Errors raised while talking to a JSON-RPC endpoint.
#[derive(Error, Debug, Clone)]
pub enum RpcError {
    /// The request never produced a response (connection refused, DNS, timeout).
    #[error("transport error calling {method}: {reason}")]
    Transport { method: String, reason: String },

    /// The node answered with a JSON-RPC error object.
    #[error("{method} failed with code {code}: {message}")]
    Response {
        method: String,
        code: i64,
        message: String,
        /// Raw revert data, when the node forwards it.
        data: Option<String>,
    },

    /// The response could not be decoded into the expected type.
    #[error("failed to decode {method} response: {reason}")]
    Decode { method: String, reason: String },

    /// The transaction could not be signed locally.
    #[error("failed to sign transaction: {0}")]
    Signing(String),
}

impl RpcError {
    /// Whether the node refused the transaction because the sender cannot pay for it.
    pub fn is_insufficient_funds(&self) -> bool {
        match self {
            Self::Response { message, .. } => {
                message.to_ascii_lowercase().contains("insufficient funds")
            }
            _ => false,
        }
    }

    /// Whether the node reports that execution reverted.
    pub fn is_revert(&self) -> bool {
        match self {
            Self::Response {
                code,
                message,
                data,
                ..
            } => *code == 3 || data.is_some() || message.to_ascii_lowercase().contains("revert"),
            _ => false,
        }
    }

    /// The revert reason or node message, for reporting.
    pub fn message(&self) -> String {
        match self {
            Self::Response { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Errors raised while resolving a network profile.
#[derive(Error, Debug, Clone)]
pub enum ResolveError {
    #[error("unknown network '{0}': no configuration entry")]
    UnknownNetwork(String),

    #[error("missing credential for network '{network}': environment variable {variable} is not set")]
    MissingCredential { network: String, variable: String },

    #[error("invalid credential for network '{network}': {reason}")]
    InvalidCredential { network: String, reason: String },

    #[error("network '{network}' has no '{role}' address configured")]
    MissingAddress { network: String, role: String },

    #[error("invalid configuration for network '{network}': {reason}")]
    InvalidConfig { network: String, reason: String },

    #[error("network '{network}' is configured for chain {expected} but {rpc_url} serves chain {actual}")]
    ChainIdMismatch {
        network: String,
        rpc_url: String,
        expected: u64,
        actual: u64,
    },

    #[error("could not reach the RPC endpoint of network '{network}': {source}")]
    RpcUnavailable {
        network: String,
        #[source]
        source: RpcError,
    },
}

/// Errors raised by the content-addressed store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("content store unavailable: {0}")]
    Unavailable(String),

    #[error("content store rejected the upload: {0}")]
    Rejected(String),
}

/// Errors raised while deploying a contract.
#[derive(Error, Debug, Clone)]
pub enum DeployError {
    #[error("deployment of {contract} reverted: {reason}")]
    Reverted {
        contract: String,
        tx_hash: Option<B256>,
        reason: String,
    },

    #[error("deployment of {contract} was not included in time")]
    Timeout {
        contract: String,
        /// Set when the transaction was broadcast before the wait expired.
        tx_hash: Option<B256>,
    },

    #[error("signer cannot pay for the deployment of {contract}: {reason}")]
    InsufficientFunds { contract: String, reason: String },

    #[error("RPC failure while deploying {contract}: {source}")]
    Rpc {
        contract: String,
        #[source]
        source: RpcError,
    },

    /// The broadcast got no answer, so the node may have accepted the transaction.
    #[error("no answer to the deployment of {contract}, the transaction may have been sent: {reason}")]
    Unacknowledged {
        contract: String,
        /// Known when the transaction was signed locally.
        tx_hash: Option<B256>,
        reason: String,
    },

    #[error("invalid artifact for {contract}: {reason}")]
    Artifact { contract: String, reason: String },
}

impl DeployError {
    /// The hash of a transaction already broadcast for this deployment, if any.
    pub fn broadcast_tx(&self) -> Option<B256> {
        match self {
            Self::Reverted { tx_hash, .. }
            | Self::Timeout { tx_hash, .. }
            | Self::Unacknowledged { tx_hash, .. } => *tx_hash,
            _ => None,
        }
    }

    /// Whether a transaction for this deployment may exist on chain.
    pub fn in_doubt(&self) -> bool {
        self.broadcast_tx().is_some() || matches!(self, Self::Unacknowledged { .. })
    }
}

/// Source verification failed. Never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("verification of {contract} failed: {reason}")]
pub struct VerifyError {
    pub contract: String,
    pub reason: String,
}

/// Errors raised while registering the plugin repo.
#[derive(Error, Debug, Clone)]
pub enum RegisterError {
    #[error("registration of '{repo_name}' reverted: {reason}")]
    Reverted {
        repo_name: String,
        reason: String,
        /// The factory refused because the name is already registered.
        name_collision: bool,
        tx_hash: Option<B256>,
    },

    #[error("registration was not included in time")]
    Timeout {
        /// Set when the transaction was broadcast before the wait expired.
        tx_hash: Option<B256>,
    },

    #[error("signer cannot pay for the registration: {0}")]
    InsufficientFunds(String),

    #[error("RPC failure while registering: {0}")]
    Rpc(#[source] RpcError),

    /// The broadcast got no answer, so the node may have accepted the transaction.
    #[error("no answer to the registration, the transaction may have been sent: {reason}")]
    Unacknowledged {
        /// Known when the transaction was signed locally.
        tx_hash: Option<B256>,
        reason: String,
    },

    #[error("invalid registration input: {0}")]
    InvalidInput(String),

    /// The configured factory address did not answer the call with a repo address.
    #[error("no plugin repo factory answers at {0}")]
    NoFactory(Address),
}

impl RegisterError {
    /// The hash of a registration transaction already broadcast, if any.
    pub fn broadcast_tx(&self) -> Option<B256> {
        match self {
            Self::Reverted { tx_hash, .. }
            | Self::Timeout { tx_hash }
            | Self::Unacknowledged { tx_hash, .. } => *tx_hash,
            _ => None,
        }
    }

    /// Whether a registration transaction may exist on chain.
    pub fn in_doubt(&self) -> bool {
        self.broadcast_tx().is_some() || matches!(self, Self::Unacknowledged { .. })
    }

    pub fn is_name_collision(&self) -> bool {
        matches!(
            self,
            Self::Reverted {
                name_collision: true,
                ..
            }
        )
    }
}

/// Errors raised while persisting the publish record.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("record I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("record at {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("another run holds the lock at {0}")]
    Locked(PathBuf),

    #[error("record is for {found}, expected {expected}")]
    Mismatch { expected: String, found: String },

    #[error("'{0}' cannot be used in a record file name")]
    InvalidName(String),
}

/// Errors raised while loading the static configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(Box::new(err))
    }
}

/// Umbrella error the orchestrator classifies.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Register(#[from] RegisterError),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    Record(#[from] RecordError),

    /// A stage was entered without its inputs. Indicates a bug, never retried.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A broadcast transaction has neither been confirmed nor dropped yet.
    #[error("transaction {tx_hash} for {item} is still pending")]
    StillPending { item: String, tx_hash: B256 },

    /// A collaborator call exceeded the orchestrator's outer bound.
    #[error("{item} did not complete within {secs}s")]
    CallTimeout { item: String, secs: u64 },
}

impl PublishError {
    /// Classify the failure. This is the single place that decides halt versus resume.
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Resolve(err) => match err {
                ResolveError::RpcUnavailable { .. } => Disposition::Retryable,
                _ => Disposition::Fatal,
            },
            Self::Deploy(err) => match err {
                DeployError::Timeout { .. } | DeployError::Rpc { .. } => Disposition::Retryable,
                // Without a hash nothing can be reconciled: an operator has to look.
                DeployError::Unacknowledged { tx_hash, .. } => match tx_hash {
                    Some(_) => Disposition::Retryable,
                    None => Disposition::Fatal,
                },
                DeployError::Reverted { .. }
                | DeployError::InsufficientFunds { .. }
                | DeployError::Artifact { .. } => Disposition::Fatal,
            },
            Self::Store(err) => match err {
                StoreError::Unavailable(_) => Disposition::Retryable,
                StoreError::Rejected(_) => Disposition::Fatal,
            },
            Self::Register(err) => match err {
                RegisterError::Timeout { .. } | RegisterError::Rpc(_) => Disposition::Retryable,
                RegisterError::Unacknowledged { tx_hash, .. } => match tx_hash {
                    Some(_) => Disposition::Retryable,
                    None => Disposition::Fatal,
                },
                RegisterError::Reverted { .. }
                | RegisterError::InsufficientFunds(_)
                | RegisterError::InvalidInput(_)
                | RegisterError::NoFactory(_) => Disposition::Fatal,
            },
            Self::Verify(_) => Disposition::BestEffort,
            Self::Record(_) | Self::Precondition(_) => Disposition::Fatal,
            Self::StillPending { .. } | Self::CallTimeout { .. } => Disposition::Retryable,
        }
    }

    /// A transaction that was broadcast but not seen mined. The orchestrator records it
    /// and reconciles it on the next run instead of sending a new one.
    pub fn pending_tx(&self) -> Option<B256> {
        match self {
            Self::Deploy(
                DeployError::Timeout { tx_hash, .. } | DeployError::Unacknowledged { tx_hash, .. },
            ) => *tx_hash,
            Self::Register(
                RegisterError::Timeout { tx_hash } | RegisterError::Unacknowledged { tx_hash, .. },
            ) => *tx_hash,
            _ => None,
        }
    }

    /// Whether a transaction may already exist for this failure, so repeating the call
    /// could duplicate an on-chain side effect.
    pub fn in_doubt(&self) -> bool {
        match self {
            Self::Deploy(err) => err.in_doubt(),
            Self::Register(err) => err.in_doubt(),
            Self::StillPending { .. } | Self::CallTimeout { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_errors_are_fatal() {
        let unknown = PublishError::from(ResolveError::UnknownNetwork("nowhere".to_string()));
        let missing = PublishError::from(ResolveError::MissingCredential {
            network: "goerli".to_string(),
            variable: "PRIVATE_KEY".to_string(),
        });

        assert_eq!(unknown.disposition(), Disposition::Fatal);
        assert_eq!(missing.disposition(), Disposition::Fatal);
    }

    #[test]
    fn test_transient_errors_are_retryable() {
        let store = PublishError::from(StoreError::Unavailable("503".to_string()));
        let deploy = PublishError::from(DeployError::Timeout {
            contract: "votingToken".to_string(),
            tx_hash: None,
        });
        let register = PublishError::from(RegisterError::Timeout { tx_hash: None });

        assert_eq!(store.disposition(), Disposition::Retryable);
        assert_eq!(deploy.disposition(), Disposition::Retryable);
        assert_eq!(register.disposition(), Disposition::Retryable);
    }

    #[test]
    fn test_terminal_errors_are_fatal() {
        let collision = PublishError::from(RegisterError::Reverted {
            repo_name: "veto".to_string(),
            reason: "AlreadyRegistered".to_string(),
            name_collision: true,
            tx_hash: None,
        });
        let rejected = PublishError::from(StoreError::Rejected("401".to_string()));
        let funds = PublishError::from(DeployError::InsufficientFunds {
            contract: "pluginSetup".to_string(),
            reason: "insufficient funds for gas * price + value".to_string(),
        });

        assert_eq!(collision.disposition(), Disposition::Fatal);
        assert_eq!(rejected.disposition(), Disposition::Fatal);
        assert_eq!(funds.disposition(), Disposition::Fatal);
    }

    #[test]
    fn test_verification_is_best_effort() {
        let err = PublishError::from(VerifyError {
            contract: "votingToken".to_string(),
            reason: "explorer down".to_string(),
        });
        assert_eq!(err.disposition(), Disposition::BestEffort);
    }

    #[test]
    fn test_rpc_error_recognises_insufficient_funds() {
        let err = RpcError::Response {
            method: "eth_sendRawTransaction".to_string(),
            code: -32000,
            message: "Insufficient funds for gas * price + value".to_string(),
            data: None,
        };
        assert!(err.is_insufficient_funds());
        assert!(!err.is_revert());
    }

    #[test]
    fn test_broadcast_tx_is_reported() {
        let hash = B256::repeat_byte(0x11);
        let err = DeployError::Timeout {
            contract: "votingToken".to_string(),
            tx_hash: Some(hash),
        };
        assert_eq!(err.broadcast_tx(), Some(hash));

        let err = RegisterError::Rpc(RpcError::Transport {
            method: "eth_call".to_string(),
            reason: "connection refused".to_string(),
        });
        assert_eq!(err.broadcast_tx(), None);
    }

    #[test]
    fn test_pending_tx_only_for_unconfirmed_broadcasts() {
        let hash = B256::repeat_byte(0x22);

        let timeout = PublishError::from(RegisterError::Timeout { tx_hash: Some(hash) });
        assert_eq!(timeout.pending_tx(), Some(hash));
        assert!(timeout.in_doubt());

        let reverted = PublishError::from(DeployError::Reverted {
            contract: "pluginSetup".to_string(),
            tx_hash: Some(hash),
            reason: "out of gas".to_string(),
        });
        assert_eq!(reverted.pending_tx(), None);
        assert!(reverted.in_doubt());

        let unavailable = PublishError::from(StoreError::Unavailable("503".to_string()));
        assert!(!unavailable.in_doubt());
    }

    #[test]
    fn test_unanswered_broadcast_is_in_doubt() {
        let hash = B256::repeat_byte(0x33);

        let signed = PublishError::from(DeployError::Unacknowledged {
            contract: "votingToken".to_string(),
            tx_hash: Some(hash),
            reason: "operation timed out".to_string(),
        });
        assert!(signed.in_doubt());
        assert_eq!(signed.pending_tx(), Some(hash));
        assert_eq!(signed.disposition(), Disposition::Retryable);

        // Node-signed: no hash to reconcile, so it is never retried blindly.
        let unsigned = PublishError::from(RegisterError::Unacknowledged {
            tx_hash: None,
            reason: "connection reset".to_string(),
        });
        assert!(unsigned.in_doubt());
        assert_eq!(unsigned.pending_tx(), None);
        assert_eq!(unsigned.disposition(), Disposition::Fatal);
    }
}
