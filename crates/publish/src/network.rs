//! Network profiles: per-network RPC endpoint, chain id, signer, gas policy and address book.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    future::Future,
};

use alloy_core::primitives::{Address, B256};
use alloy_signer_local::{MnemonicBuilder, PrivateKeySigner, coins_bip39::English};
use derive_more::{Deref, DerefMut, From};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    error::{ResolveError, RpcError},
    rpc::TxReceipt,
};

/// Address book role of the plugin repo factory contract.
pub const FACTORY_ROLE: &str = "plugin_repo_factory";

/// Default gas multiplier applied to estimates in `auto` mode, in percent.
const DEFAULT_GAS_MULTIPLIER_PERCENT: u64 = 120;

fn default_gas_multiplier() -> u64 {
    DEFAULT_GAS_MULTIPLIER_PERCENT
}

/// How transaction gas is priced and limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum GasPolicy {
    /// Scale the node's gas estimate by `multiplier_percent`. The gas price is `gas_price`
    /// (wei) when set, else whatever the node suggests.
    Auto {
        #[serde(default = "default_gas_multiplier")]
        multiplier_percent: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gas_price: Option<u64>,
    },
    /// Use a fixed gas price (wei) and gas limit.
    Fixed { gas_price: u64, gas_limit: u64 },
}

impl Default for GasPolicy {
    fn default() -> Self {
        Self::Auto {
            multiplier_percent: DEFAULT_GAS_MULTIPLIER_PERCENT,
            gas_price: None,
        }
    }
}

/// Where a network's signer comes from. Key material is only ever read from the environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SignerConfig {
    /// A hex private key held in the named environment variable.
    PrivateKey { env: String },
    /// A BIP-39 phrase held in the named environment variable, derived at `index`.
    Mnemonic {
        env: String,
        #[serde(default)]
        index: u32,
    },
    /// An account managed by the node itself (`eth_sendTransaction`).
    Unlocked { address: Address },
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self::PrivateKey {
            env: "PRIVATE_KEY".to_string(),
        }
    }
}

/// Block explorer used for source verification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExplorerConfig {
    /// Etherscan-compatible API endpoint.
    pub api_url: String,
    /// Environment variable holding the explorer API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

/// Static configuration entry for one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// JSON-RPC endpoint.
    pub rpc_url: String,
    /// Chain id the endpoint must serve.
    pub chain_id: u64,
    #[serde(default)]
    pub signer: SignerConfig,
    #[serde(default)]
    pub gas: GasPolicy,
    /// Role → address. Scoped to this network only.
    #[serde(default)]
    pub addresses: BTreeMap<String, Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explorer: Option<ExplorerConfig>,
}

/// Network configurations keyed by network name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Deref, DerefMut, From)]
#[serde(transparent)]
pub struct NetworkBook(BTreeMap<String, NetworkConfig>);

impl NetworkBook {
    /// Networks known out of the box. Factory addresses are deliberately absent:
    /// they must come from the user's configuration.
    pub fn builtin() -> Self {
        let mut networks = BTreeMap::new();

        networks.insert(
            "localhost".to_string(),
            NetworkConfig {
                rpc_url: "http://127.0.0.1:8545".to_string(),
                chain_id: 31337,
                signer: SignerConfig::default(),
                gas: GasPolicy::default(),
                addresses: BTreeMap::new(),
                explorer: None,
            },
        );
        networks.insert(
            "bsc".to_string(),
            NetworkConfig {
                rpc_url: "https://bsc-dataseed.binance.org".to_string(),
                chain_id: 56,
                signer: SignerConfig::default(),
                gas: GasPolicy::default(),
                addresses: BTreeMap::new(),
                explorer: Some(ExplorerConfig {
                    api_url: "https://api.bscscan.com/api".to_string(),
                    api_key_env: Some("BSCSCAN_API_KEY".to_string()),
                }),
            },
        );
        networks.insert(
            "bsctestnet".to_string(),
            NetworkConfig {
                rpc_url: "https://data-seed-prebsc-1-s1.binance.org:8545".to_string(),
                chain_id: 97,
                signer: SignerConfig::default(),
                gas: GasPolicy::default(),
                addresses: BTreeMap::new(),
                explorer: Some(ExplorerConfig {
                    api_url: "https://api-testnet.bscscan.com/api".to_string(),
                    api_key_env: Some("BSC_TESTNET_API_KEY".to_string()),
                }),
            },
        );
        networks.insert(
            "goerli".to_string(),
            NetworkConfig {
                rpc_url: "https://goerli.blockpi.network/v1/rpc/public".to_string(),
                chain_id: 5,
                signer: SignerConfig::default(),
                gas: GasPolicy::Auto {
                    multiplier_percent: 150,
                    gas_price: Some(1_000_000_000),
                },
                addresses: BTreeMap::new(),
                explorer: Some(ExplorerConfig {
                    api_url: "https://api-goerli.etherscan.io/api".to_string(),
                    api_key_env: Some("ETHERSCAN_API_KEY".to_string()),
                }),
            },
        );

        Self(networks)
    }
}

/// The key material a profile signs with.
#[derive(Clone)]
pub enum Signer {
    /// Transactions are signed locally and sent raw.
    Local(PrivateKeySigner),
    /// Transactions are handed to the node, which signs them.
    Unlocked(Address),
}

impl Signer {
    pub fn address(&self) -> Address {
        match self {
            Signer::Local(signer) => signer.address(),
            Signer::Unlocked(address) => *address,
        }
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signer::Local(signer) => f.debug_tuple("Local").field(&signer.address()).finish(),
            Signer::Unlocked(address) => f.debug_tuple("Unlocked").field(address).finish(),
        }
    }
}

/// Explorer endpoint with its resolved API key.
#[derive(Clone)]
pub struct ExplorerProfile {
    pub api_url: Url,
    pub api_key: Option<String>,
}

impl fmt::Debug for ExplorerProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExplorerProfile")
            .field("api_url", &self.api_url.as_str())
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A fully resolved network. Immutable for the duration of a run.
#[derive(Debug, Clone)]
pub struct NetworkProfile {
    pub name: String,
    pub rpc_url: Url,
    pub chain_id: u64,
    pub signer: Signer,
    pub gas: GasPolicy,
    pub addresses: BTreeMap<String, Address>,
    pub explorer: Option<ExplorerProfile>,
}

impl NetworkProfile {
    /// Look up an address by role in this network's own address book.
    pub fn address(&self, role: &str) -> Option<Address> {
        self.addresses.get(role).copied()
    }

    /// The plugin repo factory address.
    pub fn factory(&self) -> Result<Address, ResolveError> {
        self.address(FACTORY_ROLE)
            .ok_or_else(|| ResolveError::MissingAddress {
                network: self.name.clone(),
                role: FACTORY_ROLE.to_string(),
            })
    }
}

/// Read-only view of the chain used to validate profiles and reconcile broadcast transactions.
pub trait ChainProbe {
    /// The chain id served at `rpc_url`.
    fn chain_id(&self, rpc_url: &Url) -> impl Future<Output = Result<u64, RpcError>> + Send;

    /// The receipt of `tx_hash`, or `None` if the chain does not know it (yet).
    fn receipt(
        &self,
        profile: &NetworkProfile,
        tx_hash: B256,
    ) -> impl Future<Output = Result<Option<TxReceipt>, RpcError>> + Send;

    /// Whether the node knows `tx_hash` at all, mined or waiting in its pool.
    fn transaction_known(
        &self,
        profile: &NetworkProfile,
        tx_hash: B256,
    ) -> impl Future<Output = Result<bool, RpcError>> + Send;
}

/// Source of credentials.
#[derive(Debug, Clone, Default)]
pub enum Environment {
    /// The process environment.
    #[default]
    Process,
    /// A fixed set of variables.
    Fixed(HashMap<String, String>),
}

impl Environment {
    /// Read a variable. Empty values count as absent.
    pub fn var(&self, key: &str) -> Option<String> {
        let value = match self {
            Environment::Process => std::env::var(key).ok(),
            Environment::Fixed(vars) => vars.get(key).cloned(),
        };
        value.filter(|v| !v.trim().is_empty())
    }
}

/// Resolves network names into [`NetworkProfile`]s.
#[derive(Debug, Clone)]
pub struct NetworkResolver {
    networks: NetworkBook,
    env: Environment,
}

impl NetworkResolver {
    /// Create a resolver over `networks`, reading credentials from the process environment.
    pub fn new(networks: NetworkBook) -> Self {
        Self {
            networks,
            env: Environment::Process,
        }
    }

    /// Read credentials from `env` instead of the process environment.
    pub fn with_env(mut self, env: Environment) -> Self {
        self.env = env;
        self
    }

    pub fn networks(&self) -> &NetworkBook {
        &self.networks
    }

    /// Build the profile for `name` from configuration and environment alone.
    ///
    /// No implicit fallback: a role missing from this network's address book is missing,
    /// whatever other networks declare.
    pub fn lookup(&self, name: &str) -> Result<NetworkProfile, ResolveError> {
        let config = self
            .networks
            .get(name)
            .ok_or_else(|| ResolveError::UnknownNetwork(name.to_string()))?;

        let rpc_url = Url::parse(&config.rpc_url).map_err(|e| ResolveError::InvalidConfig {
            network: name.to_string(),
            reason: format!("invalid rpc_url '{}': {}", config.rpc_url, e),
        })?;

        match config.gas {
            GasPolicy::Fixed { gas_price, gas_limit } if gas_price == 0 || gas_limit == 0 => {
                return Err(ResolveError::InvalidConfig {
                    network: name.to_string(),
                    reason: "fixed gas policy needs a non-zero gas_price and gas_limit".to_string(),
                });
            }
            GasPolicy::Auto {
                gas_price: Some(0), ..
            } => {
                return Err(ResolveError::InvalidConfig {
                    network: name.to_string(),
                    reason: "gas_price must be non-zero when set".to_string(),
                });
            }
            _ => {}
        }

        let signer = self.signer(name, &config.signer)?;

        match config.addresses.get(FACTORY_ROLE) {
            None => {
                return Err(ResolveError::MissingAddress {
                    network: name.to_string(),
                    role: FACTORY_ROLE.to_string(),
                });
            }
            Some(factory) if factory.is_zero() => {
                return Err(ResolveError::InvalidConfig {
                    network: name.to_string(),
                    reason: format!("{} is the zero address", FACTORY_ROLE),
                });
            }
            Some(_) => {}
        }

        let explorer = match &config.explorer {
            Some(explorer) => Some(ExplorerProfile {
                api_url: Url::parse(&explorer.api_url).map_err(|e| {
                    ResolveError::InvalidConfig {
                        network: name.to_string(),
                        reason: format!("invalid explorer api_url '{}': {}", explorer.api_url, e),
                    }
                })?,
                api_key: explorer.api_key_env.as_deref().and_then(|key| self.env.var(key)),
            }),
            None => None,
        };

        Ok(NetworkProfile {
            name: name.to_string(),
            rpc_url,
            chain_id: config.chain_id,
            signer,
            gas: config.gas,
            addresses: config.addresses.clone(),
            explorer,
        })
    }

    /// Build the profile for `name` and check that its endpoint serves the configured chain.
    pub async fn resolve<P: ChainProbe>(
        &self,
        name: &str,
        probe: &P,
    ) -> Result<NetworkProfile, ResolveError> {
        let profile = self.lookup(name)?;

        let actual = probe
            .chain_id(&profile.rpc_url)
            .await
            .map_err(|source| ResolveError::RpcUnavailable {
                network: name.to_string(),
                source,
            })?;

        if actual != profile.chain_id {
            return Err(ResolveError::ChainIdMismatch {
                network: name.to_string(),
                rpc_url: profile.rpc_url.to_string(),
                expected: profile.chain_id,
                actual,
            });
        }

        tracing::debug!(
            network = %profile.name,
            chain_id = profile.chain_id,
            signer = %profile.signer.address(),
            "Network profile resolved"
        );

        Ok(profile)
    }

    fn signer(&self, network: &str, config: &SignerConfig) -> Result<Signer, ResolveError> {
        let read = |variable: &str| {
            self.env
                .var(variable)
                .ok_or_else(|| ResolveError::MissingCredential {
                    network: network.to_string(),
                    variable: variable.to_string(),
                })
        };
        let invalid = |reason: String| ResolveError::InvalidCredential {
            network: network.to_string(),
            reason,
        };

        match config {
            SignerConfig::PrivateKey { env } => {
                let key = read(env)?;
                let signer = key
                    .trim()
                    .parse::<PrivateKeySigner>()
                    .map_err(|e| invalid(format!("{} is not a valid private key: {}", env, e)))?;
                Ok(Signer::Local(signer))
            }
            SignerConfig::Mnemonic { env, index } => {
                let phrase = read(env)?;
                let signer = MnemonicBuilder::<English>::default()
                    .phrase(phrase.trim())
                    .index(*index)
                    .map_err(|e| invalid(format!("invalid derivation index {}: {}", index, e)))?
                    .build()
                    .map_err(|e| invalid(format!("{} is not a valid mnemonic: {}", env, e)))?;
                Ok(Signer::Local(signer))
            }
            SignerConfig::Unlocked { address } => {
                if address.is_zero() {
                    return Err(invalid("unlocked signer address is zero".to_string()));
                }
                Ok(Signer::Unlocked(*address))
            }
        }
    }
}
