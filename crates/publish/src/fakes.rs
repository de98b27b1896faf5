//! In-memory collaborators for driving the orchestrator in tests.
//!
//! Provides `FakeDeployer`, `MemoryContentStore`, `FakeRegistrar` and
//! `MemoryRecordSink`. Each is a cheap handle over shared state, so a test keeps a
//! clone to script failures and inspect calls after the run.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use alloy_core::primitives::{Address, B256};
use sha2::{Digest, Sha256};
use url::Url;

use crate::{
    deployer::{ContractDeployer, ContractSpec, deployed_from_receipt},
    error::{DeployError, RecordError, RegisterError, RpcError, StoreError, VerifyError},
    metadata::{ContentRef, MetadataKind},
    network::{
        ChainProbe, Environment, FACTORY_ROLE, GasPolicy, NetworkBook, NetworkConfig,
        NetworkProfile, NetworkResolver, SignerConfig,
    },
    record::{DeployedContract, PublishRecord, RecordSink},
    registrar::{Registrar, Registration},
    rpc::TxReceipt,
    store::{ContentStore, IPFS_SCHEME},
};

/// Address of the factory in [`network_book`].
pub const FAKE_FACTORY: Address = Address::repeat_byte(0xfa);

/// Address of the unlocked signer in [`network_book`].
pub const FAKE_SIGNER: Address = Address::repeat_byte(0x5e);

/// A one-network book with a factory and an unlocked signer, so no credential is needed.
pub fn network_book(name: &str, chain_id: u64) -> NetworkBook {
    NetworkBook::from(BTreeMap::from([(
        name.to_string(),
        NetworkConfig {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            chain_id,
            signer: SignerConfig::Unlocked {
                address: FAKE_SIGNER,
            },
            gas: GasPolicy::default(),
            addresses: BTreeMap::from([(FACTORY_ROLE.to_string(), FAKE_FACTORY)]),
            explorer: None,
        },
    )]))
}

/// A resolver over [`network_book`] with an empty environment.
pub fn resolver(name: &str, chain_id: u64) -> NetworkResolver {
    NetworkResolver::new(network_book(name, chain_id)).with_env(Environment::Fixed(HashMap::new()))
}

fn tx_hash(tag: u8, n: u64) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[0] = tag;
    bytes[24..].copy_from_slice(&n.to_be_bytes());
    B256::from(bytes)
}

// ---------------------------------------------------------------------------
// FakeDeployer
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct DeployerState {
    deploys: Vec<String>,
    verifies: Vec<String>,
    deploy_failures: HashMap<String, VecDeque<DeployError>>,
    stalled: HashSet<String>,
    verify_failures: HashSet<String>,
    receipts: HashMap<B256, TxReceipt>,
    /// Transactions the node has heard of, mined or not.
    known: HashSet<B256>,
    chain_id_failures: VecDeque<RpcError>,
}

/// A chain that mines every deployment instantly unless told otherwise.
#[derive(Debug, Clone)]
pub struct FakeDeployer {
    chain_id: u64,
    latency: Duration,
    state: Arc<Mutex<DeployerState>>,
    next: Arc<AtomicU64>,
    in_flight: Arc<AtomicUsize>,
}

impl FakeDeployer {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            latency: Duration::ZERO,
            state: Arc::default(),
            next: Arc::new(AtomicU64::new(1)),
            in_flight: Arc::default(),
        }
    }

    /// Every wait for a deployment takes `latency` before completing.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// The next broadcast for `contract` fails with `err`. Queued failures are consumed in order.
    pub fn fail_deploy(&self, contract: &str, err: DeployError) {
        self.state
            .lock()
            .unwrap()
            .deploy_failures
            .entry(contract.to_string())
            .or_default()
            .push_back(err);
    }

    /// The next deployment of `contract` reaches the pool but is not mined.
    pub fn stall_deploy(&self, contract: &str) {
        self.state
            .lock()
            .unwrap()
            .stalled
            .insert(contract.to_string());
    }

    /// Every verification of `contract` fails.
    pub fn fail_verify(&self, contract: &str) {
        self.state
            .lock()
            .unwrap()
            .verify_failures
            .insert(contract.to_string());
    }

    /// The next chain id query fails with `err`.
    pub fn fail_chain_id(&self, err: RpcError) {
        self.state.lock().unwrap().chain_id_failures.push_back(err);
    }

    /// Make `receipt` visible to receipt queries.
    pub fn set_receipt(&self, receipt: TxReceipt) {
        let mut state = self.state.lock().unwrap();
        state.known.insert(receipt.transaction_hash);
        state.receipts.insert(receipt.transaction_hash, receipt);
    }

    /// Put `tx_hash` in the node's pool without mining it.
    pub fn set_known(&self, tx_hash: B256) {
        self.state.lock().unwrap().known.insert(tx_hash);
    }

    /// Logical names broadcast so far, in call order (including failed attempts).
    pub fn deploys(&self) -> Vec<String> {
        self.state.lock().unwrap().deploys.clone()
    }

    pub fn verifies(&self) -> Vec<String> {
        self.state.lock().unwrap().verifies.clone()
    }

    /// Deployments currently being waited on.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

impl ContractDeployer for FakeDeployer {
    async fn send_deployment(
        &self,
        _profile: &NetworkProfile,
        spec: &ContractSpec,
    ) -> Result<B256, DeployError> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        state.deploys.push(spec.name.clone());
        if let Some(err) = state
            .deploy_failures
            .get_mut(&spec.name)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }

        let hash = tx_hash(0xd0, n);
        state.known.insert(hash);
        if !state.stalled.remove(&spec.name) {
            let mut address = [0u8; 20];
            address[0] = 0xc0;
            address[12..].copy_from_slice(&n.to_be_bytes());
            state.receipts.insert(
                hash,
                TxReceipt {
                    transaction_hash: hash,
                    block_number: n,
                    status: 1,
                    contract_address: Some(Address::from(address)),
                },
            );
        }
        Ok(hash)
    }

    async fn await_deployment(
        &self,
        _profile: &NetworkProfile,
        spec: &ContractSpec,
        tx_hash: B256,
    ) -> Result<DeployedContract, DeployError> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let receipt = self.state.lock().unwrap().receipts.get(&tx_hash).cloned();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match receipt {
            Some(receipt) => deployed_from_receipt(spec, &receipt),
            None => Err(DeployError::Timeout {
                contract: spec.name.clone(),
                tx_hash: Some(tx_hash),
            }),
        }
    }

    async fn verify(
        &self,
        _profile: &NetworkProfile,
        spec: &ContractSpec,
        _deployed: &DeployedContract,
    ) -> Result<(), VerifyError> {
        let mut state = self.state.lock().unwrap();
        state.verifies.push(spec.name.clone());
        if state.verify_failures.contains(&spec.name) {
            return Err(VerifyError {
                contract: spec.name.clone(),
                reason: "explorer unavailable".to_string(),
            });
        }
        Ok(())
    }
}

impl ChainProbe for FakeDeployer {
    async fn chain_id(&self, _rpc_url: &Url) -> Result<u64, RpcError> {
        match self.state.lock().unwrap().chain_id_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(self.chain_id),
        }
    }

    async fn receipt(
        &self,
        _profile: &NetworkProfile,
        tx_hash: B256,
    ) -> Result<Option<TxReceipt>, RpcError> {
        Ok(self.state.lock().unwrap().receipts.get(&tx_hash).cloned())
    }

    async fn transaction_known(
        &self,
        _profile: &NetworkProfile,
        tx_hash: B256,
    ) -> Result<bool, RpcError> {
        Ok(self.state.lock().unwrap().known.contains(&tx_hash))
    }
}

// ---------------------------------------------------------------------------
// MemoryContentStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct StoreState {
    objects: HashMap<String, Vec<u8>>,
    uploads: Vec<MetadataKind>,
    failures: HashMap<MetadataKind, VecDeque<StoreError>>,
}

/// Content-addressed store keyed by the SHA-256 of the payload.
#[derive(Debug, Clone, Default)]
pub struct MemoryContentStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The URI a payload is stored under.
    pub fn uri_for(payload: &[u8]) -> String {
        format!("{}{}", IPFS_SCHEME, hex::encode(Sha256::digest(payload)))
    }

    /// The next upload of a `kind` document fails with `err`.
    pub fn fail_upload(&self, kind: MetadataKind, err: StoreError) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(kind)
            .or_default()
            .push_back(err);
    }

    /// Kinds uploaded so far, in call order (including failed attempts).
    pub fn uploads(&self) -> Vec<MetadataKind> {
        self.state.lock().unwrap().uploads.clone()
    }

    pub fn get(&self, uri: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().objects.get(uri).cloned()
    }
}

impl ContentStore for MemoryContentStore {
    async fn upload(&self, kind: MetadataKind, payload: Vec<u8>) -> Result<ContentRef, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.uploads.push(kind);
        if let Some(err) = state.failures.get_mut(&kind).and_then(VecDeque::pop_front) {
            return Err(err);
        }

        let uri = Self::uri_for(&payload);
        state.objects.insert(uri.clone(), payload);
        Ok(ContentRef { kind, uri })
    }
}

// ---------------------------------------------------------------------------
// FakeRegistrar
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RegistrarState {
    calls: Vec<Registration>,
    deploys_in_flight: Vec<usize>,
    failures: VecDeque<RegisterError>,
    stall_next: bool,
}

/// A factory that registers each name once.
///
/// Clones share the set of registered names, so two orchestrators built over clones
/// race for names the way two runs against one chain would. Registrations are mined
/// into the chain of the [`FakeDeployer`] given to [`FakeRegistrar::on_chain`], where
/// the orchestrator's receipt queries find them.
#[derive(Debug, Clone, Default)]
pub struct FakeRegistrar {
    names: Arc<Mutex<HashSet<String>>>,
    state: Arc<Mutex<RegistrarState>>,
    next: Arc<AtomicU64>,
    chain: Option<FakeDeployer>,
    latency: Duration,
}

impl FakeRegistrar {
    /// A registrar on no chain: every registration is mined at once.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registrar on `deployer`'s chain. It also notes how many deployments were being
    /// waited on at each call.
    pub fn on_chain(deployer: &FakeDeployer) -> Self {
        Self {
            chain: Some(deployer.clone()),
            ..Self::default()
        }
    }

    /// A registrar over the same registered names and chain, with its own call log.
    pub fn on_same_chain(&self) -> Self {
        Self {
            names: self.names.clone(),
            chain: self.chain.clone(),
            ..Self::default()
        }
    }

    /// Every wait for a registration takes `latency` before completing.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Mark `name` as taken.
    pub fn preregister(&self, name: &str) {
        self.names.lock().unwrap().insert(name.to_string());
    }

    /// The next broadcast fails with `err` without registering.
    pub fn fail_next(&self, err: RegisterError) {
        self.state.lock().unwrap().failures.push_back(err);
    }

    /// The next registration reaches the pool but is not mined.
    pub fn stall_next(&self) {
        self.state.lock().unwrap().stall_next = true;
    }

    /// Broadcast registrations, in call order (including refused ones).
    pub fn calls(&self) -> Vec<Registration> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Deployments being waited on at each call.
    pub fn deploys_in_flight(&self) -> Vec<usize> {
        self.state.lock().unwrap().deploys_in_flight.clone()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.names.lock().unwrap().contains(name)
    }

    fn receipt(&self, tx_hash: B256) -> Option<TxReceipt> {
        let chain = self.chain.as_ref()?;
        chain.state.lock().unwrap().receipts.get(&tx_hash).cloned()
    }
}

impl Registrar for FakeRegistrar {
    async fn send_registration(
        &self,
        _profile: &NetworkProfile,
        registration: &Registration,
    ) -> Result<B256, RegisterError> {
        let stalled = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(registration.clone());
            if let Some(chain) = &self.chain {
                state.deploys_in_flight.push(chain.in_flight());
            }
            if let Some(err) = state.failures.pop_front() {
                return Err(err);
            }
            std::mem::take(&mut state.stall_next)
        };

        registration.validate()?;

        if !self
            .names
            .lock()
            .unwrap()
            .insert(registration.repo_name.clone())
        {
            return Err(RegisterError::Reverted {
                repo_name: registration.repo_name.clone(),
                reason: "AlreadyRegistered".to_string(),
                name_collision: true,
                tx_hash: None,
            });
        }

        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        let hash = tx_hash(0xe0, n);
        if let Some(chain) = &self.chain {
            if stalled {
                chain.set_known(hash);
            } else {
                chain.set_receipt(TxReceipt {
                    transaction_hash: hash,
                    block_number: n,
                    status: 1,
                    contract_address: None,
                });
            }
        }
        Ok(hash)
    }

    async fn await_registration(
        &self,
        _profile: &NetworkProfile,
        _registration: &Registration,
        tx_hash: B256,
    ) -> Result<(), RegisterError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match self.receipt(tx_hash) {
            Some(receipt) if receipt.succeeded() => Ok(()),
            Some(_) => Err(RegisterError::Reverted {
                repo_name: String::new(),
                reason: "registration reverted".to_string(),
                name_collision: false,
                tx_hash: Some(tx_hash),
            }),
            // Without a chain every registration is mined at once.
            None if self.chain.is_none() => Ok(()),
            None => Err(RegisterError::Timeout {
                tx_hash: Some(tx_hash),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryRecordSink
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SinkState {
    saves: Vec<PublishRecord>,
    completed: Option<PublishRecord>,
    fail_saves: bool,
}

/// Keeps every saved snapshot.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordSink {
    state: Arc<Mutex<SinkState>>,
}

impl MemoryRecordSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent save fail.
    pub fn fail_saves(&self) {
        self.state.lock().unwrap().fail_saves = true;
    }

    pub fn saves(&self) -> Vec<PublishRecord> {
        self.state.lock().unwrap().saves.clone()
    }

    pub fn last_saved(&self) -> Option<PublishRecord> {
        self.state.lock().unwrap().saves.last().cloned()
    }

    pub fn completed(&self) -> Option<PublishRecord> {
        self.state.lock().unwrap().completed.clone()
    }
}

impl RecordSink for MemoryRecordSink {
    fn save(&self, record: &PublishRecord) -> Result<(), RecordError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_saves {
            return Err(RecordError::Io {
                path: "memory".into(),
                source: std::io::Error::other("disk full"),
            });
        }
        state.saves.push(record.clone());
        Ok(())
    }

    fn complete(&self, record: &PublishRecord) -> Result<(), RecordError> {
        let mut completed = record.clone();
        completed.mark_completed();
        self.state.lock().unwrap().completed = Some(completed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_is_content_addressed() {
        let store = MemoryContentStore::new();

        let a = store.upload(MetadataKind::Release, b"{}".to_vec()).await.unwrap();
        let b = store.upload(MetadataKind::Build, b"{}".to_vec()).await.unwrap();
        let c = store.upload(MetadataKind::Build, b"[]".to_vec()).await.unwrap();

        assert_eq!(a.uri, b.uri);
        assert_ne!(a.uri, c.uri);
        assert_eq!(store.get(&a.uri).unwrap(), b"{}".to_vec());
    }

    #[tokio::test]
    async fn test_registrar_clones_share_names() {
        let profile = resolver("testnetX", 1337).lookup("testnetX").unwrap();
        let registration = Registration {
            repo_name: "veto-plugin".to_string(),
            plugin_setup: Address::repeat_byte(0x11),
            maintainer: None,
            build: ContentRef {
                kind: MetadataKind::Build,
                uri: "ipfs://build".to_string(),
            },
            release: ContentRef {
                kind: MetadataKind::Release,
                uri: "ipfs://release".to_string(),
            },
        };

        let first = FakeRegistrar::new();
        let second = first.on_same_chain();

        let tx_hash = first.send_registration(&profile, &registration).await.unwrap();
        assert!(first.await_registration(&profile, &registration, tx_hash).await.is_ok());
        let err = second
            .send_registration(&profile, &registration)
            .await
            .unwrap_err();

        assert!(err.is_name_collision());
        assert_eq!(second.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_stalled_registration_is_pending_on_chain() {
        let profile = resolver("testnetX", 1337).lookup("testnetX").unwrap();
        let deployer = FakeDeployer::new(1337);
        let registrar = FakeRegistrar::on_chain(&deployer);
        registrar.stall_next();
        let registration = Registration {
            repo_name: "veto-plugin".to_string(),
            plugin_setup: Address::repeat_byte(0x11),
            maintainer: None,
            build: ContentRef {
                kind: MetadataKind::Build,
                uri: "ipfs://build".to_string(),
            },
            release: ContentRef {
                kind: MetadataKind::Release,
                uri: "ipfs://release".to_string(),
            },
        };

        let tx_hash = registrar.send_registration(&profile, &registration).await.unwrap();

        assert!(matches!(
            registrar.await_registration(&profile, &registration, tx_hash).await,
            Err(RegisterError::Timeout { tx_hash: Some(h) }) if h == tx_hash
        ));
        assert!(deployer.receipt(&profile, tx_hash).await.unwrap().is_none());
        assert!(deployer.transaction_known(&profile, tx_hash).await.unwrap());
    }
}
