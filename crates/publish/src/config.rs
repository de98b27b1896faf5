//! Static configuration: `Publish.toml` layered over built-in networks and environment overrides.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use alloy_core::primitives::Address;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    chain::{ChainOptions, REQUESTS_PER_SEND},
    deployer::ContractSpec,
    error::ConfigError,
    metadata::{MetadataDocument, MetadataKind},
    network::{Environment, NetworkBook},
    orchestrator::{PipelineOptions, PublishPlan},
    store::IpfsStore,
};

/// Default configuration file name, looked up when a directory is given.
pub const CONFIG_FILENAME: &str = "Publish.toml";

/// Prefix of environment variables overriding configuration keys.
pub const ENV_PREFIX: &str = "PLUGREPO_";

/// File under the user's config directory holding networks shared across projects.
const GLOBAL_NETWORKS_FILE: &str = "plugrepo/networks.toml";

fn default_records_dir() -> PathBuf {
    PathBuf::from(".plugrepo")
}

/// Paths of the two metadata documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataPaths {
    pub release: PathBuf,
    pub build: PathBuf,
}

/// The content store endpoint. The API key itself only ever lives in the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentStoreConfig {
    pub api_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default = "ContentStoreConfig::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl ContentStoreConfig {
    fn default_timeout_secs() -> u64 {
        60
    }
}

/// Pipeline tuning, all optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub verify: bool,
    pub concurrency: usize,
    pub max_retries: usize,
    pub retry_min_delay_ms: u64,
    pub call_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub receipt_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let pipeline = PipelineOptions::default();
        let chain = ChainOptions::default();
        Self {
            verify: pipeline.verify,
            concurrency: pipeline.concurrency,
            max_retries: pipeline.max_retries,
            retry_min_delay_ms: pipeline.retry_min_delay.as_millis() as u64,
            call_timeout_secs: pipeline.call_timeout.as_secs(),
            request_timeout_secs: chain.request_timeout.as_secs(),
            receipt_timeout_secs: chain.receipt_timeout.as_secs(),
            poll_interval_ms: chain.poll_interval.as_millis() as u64,
        }
    }
}

impl PipelineConfig {
    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            verify: self.verify,
            concurrency: self.concurrency,
            max_retries: self.max_retries,
            retry_min_delay: Duration::from_millis(self.retry_min_delay_ms),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
        }
    }

    /// The outer call bound must outlast the chain client's own timeouts. Otherwise it
    /// cancels a send or a wait midway and the transaction hash is lost.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let inner = self
            .receipt_timeout_secs
            .saturating_add(self.request_timeout_secs.saturating_mul(REQUESTS_PER_SEND));
        if self.call_timeout_secs <= inner {
            return Err(ConfigError::Invalid(format!(
                "pipeline.call_timeout_secs ({}) must exceed receipt_timeout_secs plus {} request timeouts ({})",
                self.call_timeout_secs, REQUESTS_PER_SEND, inner
            )));
        }
        Ok(())
    }

    pub fn chain_options(&self) -> ChainOptions {
        ChainOptions {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            receipt_timeout: Duration::from_secs(self.receipt_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

/// The whole configuration of a publish project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Name the plugin repo is registered under.
    pub repo_name: String,
    /// Logical name of the contract registered as the plugin setup.
    pub setup_contract: String,
    /// Maintainer of the repo. Defaults to the signer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintainer: Option<Address>,
    /// Where publish records are kept.
    #[serde(default = "default_records_dir")]
    pub records_dir: PathBuf,
    pub contracts: Vec<ContractSpec>,
    pub metadata: MetadataPaths,
    pub content_store: ContentStoreConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub networks: NetworkBook,

    /// Directory relative paths are resolved against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// `<config dir>/plugrepo/networks.toml`, if the platform has a config directory.
pub fn global_networks_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(GLOBAL_NETWORKS_FILE))
}

impl PublishConfig {
    /// Load the configuration at `path` (a file, or a directory holding `Publish.toml`),
    /// layered over the built-in networks, the user's global networks file and
    /// `PLUGREPO_*` environment overrides.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::load_layered(path, global_networks_path().as_deref(), true)
    }

    /// Load with explicit layers. `global` is skipped when it does not exist.
    pub fn load_layered(
        path: &Path,
        global: Option<&Path>,
        env_overrides: bool,
    ) -> Result<Self, ConfigError> {
        let config_path = if path.is_dir() {
            path.join(CONFIG_FILENAME)
        } else {
            path.to_path_buf()
        };
        if !config_path.exists() {
            return Err(ConfigError::Invalid(format!(
                "configuration file not found: {}",
                config_path.display()
            )));
        }

        let mut figment =
            Figment::from(Serialized::default("networks", NetworkBook::builtin()));
        if let Some(global) = global.filter(|p| p.exists()) {
            tracing::debug!(path = %global.display(), "Merging global networks file");
            figment = figment.merge(Toml::file(global));
        }
        figment = figment.merge(Toml::file(&config_path));
        if env_overrides {
            figment = figment.merge(
                Env::prefixed(ENV_PREFIX)
                    .split("__")
                    .ignore(&["config", "verbosity", "no_verify", "network"]),
            );
        }

        let mut config: Self = figment.extract()?;
        config.base_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        config.validate()?;

        tracing::info!(path = %config_path.display(), "Configuration loaded");
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.contracts.is_empty() {
            return Err(ConfigError::Invalid("no contracts configured".to_string()));
        }
        self.pipeline.validate()?;
        Url::parse(&self.content_store.api_url).map_err(|e| {
            ConfigError::Invalid(format!(
                "invalid content_store.api_url '{}': {}",
                self.content_store.api_url, e
            ))
        })?;
        Ok(())
    }

    /// Resolve `path` against the configuration file's directory.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn records_dir(&self) -> PathBuf {
        self.resolve_path(&self.records_dir)
    }

    /// Read the metadata documents and assemble the publish plan.
    pub fn plan(&self) -> Result<PublishPlan, ConfigError> {
        let contracts = self
            .contracts
            .iter()
            .map(|contract| ContractSpec {
                artifact: self.resolve_path(&contract.artifact),
                ..contract.clone()
            })
            .collect();

        let documents = vec![
            MetadataDocument::load(
                MetadataKind::Release,
                &self.resolve_path(&self.metadata.release),
            )?,
            MetadataDocument::load(MetadataKind::Build, &self.resolve_path(&self.metadata.build))?,
        ];

        let plan = PublishPlan {
            repo_name: self.repo_name.clone(),
            contracts,
            setup_contract: self.setup_contract.clone(),
            documents,
            maintainer: self.maintainer,
        };
        plan.validate().map_err(ConfigError::Invalid)?;
        Ok(plan)
    }

    /// Build the content store client, reading its API key from `env`.
    pub fn content_store(&self, env: &Environment) -> Result<IpfsStore, ConfigError> {
        let api_url = Url::parse(&self.content_store.api_url)
            .map_err(|e| ConfigError::Invalid(format!("invalid content_store.api_url: {}", e)))?;

        let api_key = match &self.content_store.api_key_env {
            Some(variable) => Some(env.var(variable).ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "content store API key variable {} is not set",
                    variable
                ))
            })?),
            None => None,
        };

        IpfsStore::new(
            api_url,
            api_key,
            Duration::from_secs(self.content_store.timeout_secs),
        )
        .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// The effective configuration as TOML. Holds variable names, never their values.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Invalid(format!("failed to serialize configuration: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::network::{FACTORY_ROLE, GasPolicy};

    const PUBLISH_TOML: &str = r#"
repo_name = "veto-plugin"
setup_contract = "pluginSetup"

[[contracts]]
name = "votingToken"
artifact = "artifacts/contracts/TestVotingToken.sol/TestVotingToken.json"
args = [{ type = "uint256", value = "10000000" }]

[[contracts]]
name = "pluginSetup"
artifact = "artifacts/contracts/VetoPluginSetup.sol/VetoPluginSetup.json"

[metadata]
release = "metadata/release-metadata.json"
build = "metadata/build-metadata.json"

[content_store]
api_url = "https://ipfs.example/api/v0/add"
api_key_env = "IPFS_API_KEY"

[pipeline]
max_retries = 5

[networks.bsctestnet.addresses]
plugin_repo_factory = "0x0000000000000000000000000000000000000fac"

[networks.testnetX]
rpc_url = "http://127.0.0.1:8545"
chain_id = 1337
"#;

    fn write_project(dir: &Path) -> PathBuf {
        std::fs::create_dir_all(dir.join("metadata")).unwrap();
        std::fs::write(
            dir.join("metadata/release-metadata.json"),
            r#"{"name":"Veto","description":"Veto plugin","images":{}}"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("metadata/build-metadata.json"),
            r#"{"ui":"","change":"initial","pluginSetup":{}}"#,
        )
        .unwrap();
        let path = dir.join(CONFIG_FILENAME);
        std::fs::write(&path, PUBLISH_TOML).unwrap();
        path
    }

    #[test]
    fn test_project_file_merges_over_builtin_networks() {
        let dir = tempdir::TempDir::new("plugrepo-config").unwrap();
        write_project(dir.path());

        let config = PublishConfig::load_layered(dir.path(), None, false).unwrap();

        let bsctestnet = &config.networks["bsctestnet"];
        assert_eq!(bsctestnet.chain_id, 97);
        assert!(bsctestnet.explorer.is_some());
        assert!(bsctestnet.addresses.contains_key(FACTORY_ROLE));

        assert_eq!(config.networks["testnetX"].chain_id, 1337);
        assert_eq!(config.networks["testnetX"].gas, GasPolicy::default());
        assert_eq!(config.pipeline.max_retries, 5);
        assert_eq!(config.pipeline.concurrency, PipelineConfig::default().concurrency);
    }

    #[test]
    fn test_global_networks_file_sits_under_project_file() {
        let dir = tempdir::TempDir::new("plugrepo-config").unwrap();
        write_project(dir.path());
        let global = dir.path().join("global-networks.toml");
        std::fs::write(
            &global,
            r#"
[networks.testnetX]
rpc_url = "http://10.0.0.1:8545"
chain_id = 1

[networks.sepolia]
rpc_url = "https://rpc.sepolia.example"
chain_id = 11155111
"#,
        )
        .unwrap();

        let config = PublishConfig::load_layered(dir.path(), Some(&global), false).unwrap();

        assert_eq!(config.networks["testnetX"].chain_id, 1337);
        assert_eq!(config.networks["sepolia"].chain_id, 11155111);
    }

    #[test]
    fn test_plan_resolves_paths_and_reads_metadata() {
        let dir = tempdir::TempDir::new("plugrepo-config").unwrap();
        write_project(dir.path());

        let config = PublishConfig::load_layered(dir.path(), None, false).unwrap();
        let plan = config.plan().unwrap();

        assert_eq!(plan.contracts.len(), 2);
        assert!(plan.contracts[0].artifact.starts_with(dir.path()));
        assert_eq!(plan.documents[0].content["name"], "Veto");
        assert_eq!(config.records_dir(), dir.path().join(".plugrepo"));
    }

    #[test]
    fn test_call_timeout_must_outlast_chain_timeouts() {
        assert!(PipelineConfig::default().validate().is_ok());

        let dir = tempdir::TempDir::new("plugrepo-config").unwrap();
        let path = write_project(dir.path());
        let mut content = std::fs::read_to_string(&path).unwrap();
        content = content.replace(
            "max_retries = 5",
            "max_retries = 5\ncall_timeout_secs = 120\nreceipt_timeout_secs = 300",
        );
        std::fs::write(&path, content).unwrap();

        let err = PublishConfig::load_layered(dir.path(), None, false).unwrap_err();
        assert!(err.to_string().contains("call_timeout_secs"), "{}", err);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir::TempDir::new("plugrepo-config").unwrap();

        assert!(matches!(
            PublishConfig::load_layered(dir.path(), None, false),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_content_store_needs_its_key() {
        let dir = tempdir::TempDir::new("plugrepo-config").unwrap();
        write_project(dir.path());
        let config = PublishConfig::load_layered(dir.path(), None, false).unwrap();

        assert!(config.content_store(&Environment::Fixed(HashMap::new())).is_err());

        let env = Environment::Fixed(HashMap::from([(
            "IPFS_API_KEY".to_string(),
            "key".to_string(),
        )]));
        assert!(config.content_store(&env).is_ok());
    }

    #[test]
    fn test_toml_output_holds_no_secret_values() {
        let dir = tempdir::TempDir::new("plugrepo-config").unwrap();
        write_project(dir.path());
        let config = PublishConfig::load_layered(dir.path(), None, false).unwrap();

        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("api_key_env = \"IPFS_API_KEY\""));
        assert!(rendered.contains("[networks.bsctestnet]"));
    }
}
