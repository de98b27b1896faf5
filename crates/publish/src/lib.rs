//! plugrepo-publish - Publish pipeline for governance plugin repos.
//!
//! Deploys a plugin's contracts, uploads its release and build metadata to
//! content-addressed storage, and registers the first version with a network's
//! plugin repo factory. Runs are resumable: every completed step is recorded, and a
//! later run picks up where an interrupted or failed one stopped.

pub mod abi;
pub mod artifact;
mod chain;
pub mod config;
mod deployer;
mod error;
mod explorer;
pub mod fakes;
mod metadata;
mod network;
mod orchestrator;
mod record;
mod registrar;
pub mod report;
mod rpc;
mod store;

pub use chain::{ChainOptions, RpcChain, SendError, TxRequest};
pub use config::{CONFIG_FILENAME, PublishConfig};
pub use deployer::{ContractDeployer, ContractSpec, RpcDeployer};
pub use error::{
    ConfigError, DeployError, Disposition, PublishError, RecordError, RegisterError,
    ResolveError, RpcError, StoreError, VerifyError,
};
pub use explorer::ExplorerClient;
pub use metadata::{ContentRef, MetadataDocument, MetadataKind};
pub use network::{
    ChainProbe, Environment, FACTORY_ROLE, GasPolicy, NetworkBook, NetworkConfig,
    NetworkProfile, NetworkResolver, Signer, SignerConfig,
};
pub use orchestrator::{
    EXIT_FATAL, EXIT_PUBLISHED, EXIT_RETRYABLE, Orchestrator, PipelineOptions, PublishPlan,
    PublishSummary, RunOutcome, RunReport, Stage, StageFailure,
};
pub use record::{DeployedContract, FileRecordStore, PublishRecord, RecordSink, StoredRecord};
pub use registrar::{FactoryRegistrar, Registrar, Registration};
pub use rpc::TxReceipt;
pub use store::{ContentStore, IpfsStore};
