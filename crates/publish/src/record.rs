//! The publish record: what a run lineage has already achieved, persisted after every fact.

use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use alloy_core::primitives::{Address, B256};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::{
    abi::AbiArg,
    error::RecordError,
    metadata::{ContentRef, MetadataKind},
};

/// A contract deployed for a logical name. The address never changes once observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployedContract {
    pub logical_name: String,
    pub address: Address,
    #[serde(default)]
    pub constructor_args: Vec<AbiArg>,
    pub deploy_tx_hash: B256,
}

/// Working state of one run lineage for a (network, repo name) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRecord {
    pub network: String,
    pub repo_name: String,
    #[serde(default)]
    pub deployed_contracts: BTreeMap<String, DeployedContract>,
    #[serde(default)]
    pub content_refs: BTreeMap<MetadataKind, ContentRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_tx_hash: Option<B256>,
    /// Deployment transactions broadcast but not yet seen mined, by logical name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pending_deploys: BTreeMap<String, B256>,
    /// Registration transaction broadcast but not yet seen mined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_registration: Option<B256>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl PublishRecord {
    pub fn new(network: impl Into<String>, repo_name: impl Into<String>) -> Self {
        let created_at = now();
        Self {
            network: network.into(),
            repo_name: repo_name.into(),
            deployed_contracts: BTreeMap::new(),
            content_refs: BTreeMap::new(),
            registration_tx_hash: None,
            pending_deploys: BTreeMap::new(),
            pending_registration: None,
            updated_at: created_at.clone(),
            created_at,
            completed_at: None,
        }
    }

    /// `network/repo_name`, used to tell records apart.
    pub fn key(&self) -> String {
        format!("{}/{}", self.network, self.repo_name)
    }

    pub fn record_contract(&mut self, contract: DeployedContract) {
        self.pending_deploys.remove(&contract.logical_name);
        self.deployed_contracts
            .insert(contract.logical_name.clone(), contract);
        self.updated_at = now();
    }

    pub fn record_pending_deploy(&mut self, logical_name: &str, tx_hash: B256) {
        self.pending_deploys.insert(logical_name.to_string(), tx_hash);
        self.updated_at = now();
    }

    pub fn clear_pending_deploy(&mut self, logical_name: &str) {
        self.pending_deploys.remove(logical_name);
        self.updated_at = now();
    }

    pub fn record_content(&mut self, content: ContentRef) {
        self.content_refs.insert(content.kind, content);
        self.updated_at = now();
    }

    pub fn record_registration(&mut self, tx_hash: B256) {
        self.registration_tx_hash = Some(tx_hash);
        self.pending_registration = None;
        self.updated_at = now();
    }

    pub fn record_pending_registration(&mut self, tx_hash: B256) {
        self.pending_registration = Some(tx_hash);
        self.updated_at = now();
    }

    pub fn clear_pending_registration(&mut self) {
        self.pending_registration = None;
        self.updated_at = now();
    }

    pub fn is_registered(&self) -> bool {
        self.registration_tx_hash.is_some()
    }

    pub fn mark_completed(&mut self) {
        let at = now();
        self.updated_at = at.clone();
        self.completed_at = Some(at);
    }

    /// Human-readable list of the facts this record holds.
    pub fn completed_items(&self) -> Vec<String> {
        let mut items: Vec<String> = self
            .deployed_contracts
            .keys()
            .map(|name| format!("deploy:{}", name))
            .collect();
        items.extend(
            self.content_refs
                .keys()
                .map(|kind| format!("upload:{}", kind)),
        );
        if self.is_registered() {
            items.push("register".to_string());
        }
        items
    }
}

/// Where the orchestrator persists the record after each recorded fact.
pub trait RecordSink {
    /// Persist the current state. Must be durable before returning.
    fn save(&self, record: &PublishRecord) -> Result<(), RecordError>;

    /// The run published: keep a receipt and discard the working state.
    fn complete(&self, record: &PublishRecord) -> Result<(), RecordError>;
}

/// A record as found on disk.
#[derive(Debug, Clone)]
pub enum StoredRecord {
    InProgress(PublishRecord),
    Published(PublishRecord),
}

/// JSON files under `<records_dir>/<network>/`, guarded by an exclusive advisory lock.
#[derive(Debug)]
pub struct FileRecordStore {
    network: String,
    repo_name: String,
    record_path: PathBuf,
    receipt_path: PathBuf,
    // Held for the lifetime of the store; closing the file releases the lock.
    _lock: File,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> RecordError + '_ {
    move |source| RecordError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Network and repo names become path components and must stay inside `records_dir`.
fn check_name(name: &str) -> Result<(), RecordError> {
    let invalid = name.trim().is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
        || Path::new(name).is_absolute();
    if invalid {
        return Err(RecordError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn paths(
    records_dir: &Path,
    network: &str,
    repo_name: &str,
) -> Result<(PathBuf, PathBuf, PathBuf), RecordError> {
    check_name(network)?;
    check_name(repo_name)?;

    let dir = records_dir.join(network);
    Ok((
        dir.join(format!("{}.record.json", repo_name)),
        dir.join(format!("{}.published.json", repo_name)),
        dir.join(format!("{}.lock", repo_name)),
    ))
}

impl FileRecordStore {
    /// Open the store for (network, repo name), taking its lock.
    ///
    /// Fails with [`RecordError::Locked`] when another process holds it.
    pub fn open(records_dir: &Path, network: &str, repo_name: &str) -> Result<Self, RecordError> {
        let (record_path, receipt_path, lock_path) = paths(records_dir, network, repo_name)?;
        let dir = records_dir.join(network);
        std::fs::create_dir_all(&dir).map_err(io_error(&dir))?;

        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(io_error(&lock_path))?;
        lock.try_lock_exclusive()
            .map_err(|_| RecordError::Locked(lock_path.clone()))?;

        tracing::debug!(path = %record_path.display(), "Record store opened");

        Ok(Self {
            network: network.to_string(),
            repo_name: repo_name.to_string(),
            record_path,
            receipt_path,
            _lock: lock,
        })
    }

    pub fn record_path(&self) -> &Path {
        &self.record_path
    }

    pub fn receipt_path(&self) -> &Path {
        &self.receipt_path
    }

    /// The record to resume from: the working record if any, else the published
    /// receipt, else a fresh record.
    pub fn load(&self) -> Result<PublishRecord, RecordError> {
        let found = match read_record(&self.record_path)? {
            Some(record) => Some(record),
            None => read_record(&self.receipt_path)?,
        };

        let Some(record) = found else {
            return Ok(PublishRecord::new(&self.network, &self.repo_name));
        };

        if record.network != self.network || record.repo_name != self.repo_name {
            return Err(RecordError::Mismatch {
                expected: format!("{}/{}", self.network, self.repo_name),
                found: record.key(),
            });
        }

        tracing::info!(
            path = %self.record_path.display(),
            completed = ?record.completed_items(),
            "Resuming from existing record"
        );
        Ok(record)
    }

    /// Read whatever is on disk without taking the lock.
    pub fn inspect(
        records_dir: &Path,
        network: &str,
        repo_name: &str,
    ) -> Result<Option<StoredRecord>, RecordError> {
        let (record_path, receipt_path, _) = paths(records_dir, network, repo_name)?;
        if let Some(record) = read_record(&record_path)? {
            return Ok(Some(StoredRecord::InProgress(record)));
        }
        Ok(read_record(&receipt_path)?.map(StoredRecord::Published))
    }
}

impl RecordSink for FileRecordStore {
    fn save(&self, record: &PublishRecord) -> Result<(), RecordError> {
        write_atomic(&self.record_path, record)
    }

    fn complete(&self, record: &PublishRecord) -> Result<(), RecordError> {
        let mut receipt = record.clone();
        receipt.mark_completed();
        write_atomic(&self.receipt_path, &receipt)?;

        match std::fs::remove_file(&self.record_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(&self.record_path)(e)),
        }

        tracing::info!(path = %self.receipt_path.display(), "Publish receipt written");
        Ok(())
    }
}

fn read_record(path: &Path) -> Result<Option<PublishRecord>, RecordError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(path)(e)),
    };

    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| RecordError::Json {
            path: path.to_path_buf(),
            source,
        })
}

/// Write to a sibling temp file then rename over `path`.
fn write_atomic(path: &Path, record: &PublishRecord) -> Result<(), RecordError> {
    let content = serde_json::to_vec_pretty(record).map_err(|source| RecordError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let tmp_path = path.with_extension("json.tmp");
    let mut file = File::create(&tmp_path).map_err(io_error(&tmp_path))?;
    file.write_all(&content).map_err(io_error(&tmp_path))?;
    file.sync_all().map_err(io_error(&tmp_path))?;
    drop(file);

    std::fs::rename(&tmp_path, path).map_err(io_error(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract(name: &str) -> DeployedContract {
        DeployedContract {
            logical_name: name.to_string(),
            address: Address::repeat_byte(0x11),
            constructor_args: vec![AbiArg::new("uint256", "10000000")],
            deploy_tx_hash: B256::repeat_byte(0x22),
        }
    }

    #[test]
    fn test_record_contract_clears_pending() {
        let mut record = PublishRecord::new("testnetX", "veto");
        record.record_pending_deploy("votingToken", B256::repeat_byte(0x01));

        record.record_contract(contract("votingToken"));

        assert!(record.pending_deploys.is_empty());
        assert_eq!(record.completed_items(), vec!["deploy:votingToken"]);
    }

    #[test]
    fn test_json_uses_camel_case_keys() {
        let mut record = PublishRecord::new("testnetX", "veto");
        record.record_contract(contract("pluginSetup"));
        record.record_content(ContentRef {
            kind: MetadataKind::Release,
            uri: "ipfs://QmRelease".to_string(),
        });

        let json = serde_json::to_value(&record).unwrap();
        assert!(json["deployedContracts"]["pluginSetup"]["deployTxHash"].is_string());
        assert_eq!(json["contentRefs"]["release"]["uri"], "ipfs://QmRelease");
        assert!(json.get("registrationTxHash").is_none());

        let back: PublishRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_store_persists_and_resumes() {
        let dir = tempdir::TempDir::new("plugrepo-record").unwrap();

        {
            let store = FileRecordStore::open(dir.path(), "testnetX", "veto").unwrap();
            let mut record = store.load().unwrap();
            assert!(record.deployed_contracts.is_empty());

            record.record_contract(contract("pluginSetup"));
            store.save(&record).unwrap();
        }

        let store = FileRecordStore::open(dir.path(), "testnetX", "veto").unwrap();
        let record = store.load().unwrap();
        assert!(record.deployed_contracts.contains_key("pluginSetup"));
    }

    #[test]
    fn test_second_open_is_locked() {
        let dir = tempdir::TempDir::new("plugrepo-record").unwrap();

        let _first = FileRecordStore::open(dir.path(), "testnetX", "veto").unwrap();
        let second = FileRecordStore::open(dir.path(), "testnetX", "veto");

        assert!(matches!(second, Err(RecordError::Locked(_))));
        // Other repos and networks are independent.
        assert!(FileRecordStore::open(dir.path(), "goerli", "veto").is_ok());
    }

    #[test]
    fn test_complete_replaces_record_with_receipt() {
        let dir = tempdir::TempDir::new("plugrepo-record").unwrap();
        let store = FileRecordStore::open(dir.path(), "testnetX", "veto").unwrap();

        let mut record = store.load().unwrap();
        record.record_registration(B256::repeat_byte(0x33));
        store.save(&record).unwrap();
        store.complete(&record).unwrap();

        assert!(!store.record_path().exists());
        let Some(StoredRecord::Published(receipt)) =
            FileRecordStore::inspect(dir.path(), "testnetX", "veto").unwrap()
        else {
            panic!("expected a published receipt");
        };
        assert!(receipt.completed_at.is_some());

        // A later run resumes from the receipt rather than starting over.
        assert!(store.load().unwrap().is_registered());
    }

    #[test]
    fn test_names_cannot_leave_records_dir() {
        let dir = tempdir::TempDir::new("plugrepo-record").unwrap();
        let records = dir.path().join("records");

        for (network, repo) in [
            ("../elsewhere", "veto"),
            ("testnetX", "../../veto"),
            ("..", "veto"),
            ("testnetX", "nested/veto"),
            ("", "veto"),
        ] {
            assert!(
                matches!(
                    FileRecordStore::open(&records, network, repo),
                    Err(RecordError::InvalidName(_))
                ),
                "{}/{} was accepted",
                network,
                repo
            );
        }
        assert!(matches!(
            FileRecordStore::inspect(&records, "testnetX", "../veto"),
            Err(RecordError::InvalidName(_))
        ));
        assert!(!dir.path().join("elsewhere").exists());
    }

    #[test]
    fn test_load_rejects_foreign_record() {
        let dir = tempdir::TempDir::new("plugrepo-record").unwrap();
        let store = FileRecordStore::open(dir.path(), "testnetX", "veto").unwrap();

        let foreign = PublishRecord::new("goerli", "veto");
        std::fs::write(
            store.record_path(),
            serde_json::to_vec(&foreign).unwrap(),
        )
        .unwrap();

        assert!(matches!(store.load(), Err(RecordError::Mismatch { .. })));
    }
}
