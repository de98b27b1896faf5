//! The publish pipeline.
//!
//! A run walks a fixed sequence of stages over a [`PublishRecord`]:
//! Resolve -> DeployAll -> UploadAll -> Register -> VerifyAll.
//!
//! Every stage skips the items the record already holds, and every fact is persisted
//! as soon as it is observed, so an interrupted or failed run resumes where it stopped.
//! Components report typed errors; this module alone classifies them through
//! [`PublishError::disposition`] and decides whether the run halts.

use std::{collections::BTreeSet, future::Future, time::Duration};

use alloy_core::primitives::{Address, B256};
use backon::{ExponentialBuilder, Retryable};
use futures::{StreamExt, stream};
use strum::IntoEnumIterator;

use crate::{
    deployer::{self, ContractDeployer, ContractSpec},
    error::{
        DeployError, Disposition, PublishError, RecordError, RegisterError, RpcError,
        VerifyError,
    },
    metadata::{ContentRef, MetadataDocument, MetadataKind},
    network::{ChainProbe, NetworkProfile, NetworkResolver},
    record::{DeployedContract, PublishRecord, RecordSink},
    registrar::{Registrar, Registration},
    rpc::TxReceipt,
    store::ContentStore,
};

/// Exit code of a run that published.
pub const EXIT_PUBLISHED: u8 = 0;
/// Exit code of a run that needs operator intervention.
pub const EXIT_FATAL: u8 = 1;
/// Exit code of a run that may succeed if started again (`EX_TEMPFAIL`).
pub const EXIT_RETRYABLE: u8 = 75;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum Stage {
    Resolve,
    DeployAll,
    UploadAll,
    Register,
    VerifyAll,
}

/// Knobs for one run.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Run the best-effort verification stage.
    pub verify: bool,
    /// Items dispatched at once within a stage.
    pub concurrency: usize,
    /// In-run retries of a retryable failure. Zero disables them.
    pub max_retries: usize,
    /// First backoff delay between retries.
    pub retry_min_delay: Duration,
    /// Outer bound on any single collaborator call.
    pub call_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            verify: true,
            concurrency: 4,
            max_retries: 3,
            retry_min_delay: Duration::from_secs(2),
            call_timeout: Duration::from_secs(600),
        }
    }
}

/// What to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPlan {
    pub repo_name: String,
    pub contracts: Vec<ContractSpec>,
    /// Logical name of the contract registered as the plugin setup.
    pub setup_contract: String,
    pub documents: Vec<MetadataDocument>,
    pub maintainer: Option<Address>,
}

impl PublishPlan {
    /// Check the plan is internally consistent.
    pub fn validate(&self) -> Result<(), String> {
        if self.repo_name.trim().is_empty() {
            return Err("repo name is empty".to_string());
        }

        let mut names = BTreeSet::new();
        for contract in &self.contracts {
            if contract.name.trim().is_empty() {
                return Err("a contract has an empty logical name".to_string());
            }
            if !names.insert(contract.name.as_str()) {
                return Err(format!("contract '{}' is listed twice", contract.name));
            }
        }
        if !names.contains(self.setup_contract.as_str()) {
            return Err(format!(
                "setup contract '{}' is not among the contracts to deploy",
                self.setup_contract
            ));
        }

        for kind in MetadataKind::iter() {
            match self.documents.iter().filter(|d| d.kind == kind).count() {
                0 => return Err(format!("no {} metadata document", kind)),
                1 => {}
                _ => return Err(format!("more than one {} metadata document", kind)),
            }
        }

        Ok(())
    }

    pub fn contract(&self, name: &str) -> Option<&ContractSpec> {
        self.contracts.iter().find(|c| c.name == name)
    }
}

/// Why a run stopped.
#[derive(Debug)]
pub struct StageFailure {
    pub stage: Stage,
    /// The failing item within the stage, when there is one.
    pub item: Option<String>,
    pub error: PublishError,
    /// Items the record holds at the time of failure.
    pub completed: Vec<String>,
}

impl StageFailure {
    fn new(
        stage: Stage,
        item: Option<String>,
        error: impl Into<PublishError>,
        record: &PublishRecord,
    ) -> Self {
        Self {
            stage,
            item,
            error: error.into(),
            completed: record.completed_items(),
        }
    }

    pub fn disposition(&self) -> Disposition {
        self.error.disposition()
    }
}

/// A published plugin repo.
#[derive(Debug, Clone)]
pub struct PublishSummary {
    pub network: String,
    pub chain_id: u64,
    pub repo_name: String,
    pub contracts: Vec<DeployedContract>,
    pub content_refs: Vec<ContentRef>,
    pub registration_tx_hash: B256,
    pub verification_failures: Vec<VerifyError>,
}

#[derive(Debug)]
pub enum RunOutcome {
    Published(PublishSummary),
    /// Terminal for the run lineage until an operator intervenes.
    Failed(StageFailure),
    /// Re-running may succeed; the record is at its last good state.
    Retryable(StageFailure),
}

/// Outcome of a run together with the record it left behind.
#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub record: PublishRecord,
}

impl RunReport {
    pub fn is_published(&self) -> bool {
        matches!(self.outcome, RunOutcome::Published(_))
    }

    pub fn exit_code(&self) -> u8 {
        match self.outcome {
            RunOutcome::Published(_) => EXIT_PUBLISHED,
            RunOutcome::Failed(_) => EXIT_FATAL,
            RunOutcome::Retryable(_) => EXIT_RETRYABLE,
        }
    }
}

/// What became of a transaction broadcast by an earlier run.
#[derive(Debug)]
enum Settled {
    Mined(TxReceipt),
    /// The node does not know the transaction.
    Dropped,
}

/// Which failures a call may be repeated for within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retry {
    /// Repeating the call has no side effect.
    Always,
    /// Repeat only when no transaction can have been broadcast.
    UnlessInDoubt,
    Never,
}

/// Drives one pipeline run over injected collaborators.
pub struct Orchestrator<D, S, R, K> {
    resolver: NetworkResolver,
    deployer: D,
    store: S,
    registrar: R,
    sink: K,
    options: PipelineOptions,
}

impl<D, S, R, K> Orchestrator<D, S, R, K>
where
    D: ContractDeployer + ChainProbe + Sync,
    S: ContentStore + Sync,
    R: Registrar + Sync,
    K: RecordSink + Sync,
{
    pub fn new(resolver: NetworkResolver, deployer: D, store: S, registrar: R, sink: K) -> Self {
        Self {
            resolver,
            deployer,
            store,
            registrar,
            sink,
            options: PipelineOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Run the pipeline for `plan` on `network`, resuming from `record`.
    pub async fn run(
        &self,
        network: &str,
        plan: &PublishPlan,
        mut record: PublishRecord,
    ) -> RunReport {
        tracing::info!(
            network,
            repo_name = %plan.repo_name,
            completed = ?record.completed_items(),
            "Starting publish run"
        );

        let outcome = match self.run_stages(network, plan, &mut record).await {
            Ok(summary) => {
                if let Err(err) = self.sink.complete(&record) {
                    // The registration is on chain whatever happens to the receipt.
                    tracing::warn!(error = %err, "Failed to write publish receipt");
                }
                tracing::info!(
                    network,
                    repo_name = %plan.repo_name,
                    tx_hash = %summary.registration_tx_hash,
                    "Plugin repo published"
                );
                RunOutcome::Published(summary)
            }
            Err(failure) => {
                tracing::error!(
                    stage = %failure.stage,
                    item = ?failure.item,
                    disposition = %failure.disposition(),
                    error = %failure.error,
                    "Publish run stopped"
                );
                match failure.disposition() {
                    Disposition::Retryable => RunOutcome::Retryable(failure),
                    Disposition::Fatal | Disposition::BestEffort => RunOutcome::Failed(failure),
                }
            }
        };

        RunReport { outcome, record }
    }

    async fn run_stages(
        &self,
        network: &str,
        plan: &PublishPlan,
        record: &mut PublishRecord,
    ) -> Result<PublishSummary, StageFailure> {
        plan.validate().map_err(|reason| {
            StageFailure::new(Stage::Resolve, None, PublishError::Precondition(reason), record)
        })?;
        if record.network != network || record.repo_name != plan.repo_name {
            let mismatch = RecordError::Mismatch {
                expected: format!("{}/{}", network, plan.repo_name),
                found: record.key(),
            };
            return Err(StageFailure::new(Stage::Resolve, None, mismatch, record));
        }

        // Stage 1: Resolve, always re-run.
        tracing::info!(stage = %Stage::Resolve, network, "Resolving network profile...");
        let resolver = &self.resolver;
        let probe = &self.deployer;
        let profile = self
            .attempt("resolve", Retry::Always, move || async move {
                resolver
                    .resolve(network, probe)
                    .await
                    .map_err(PublishError::from)
            })
            .await
            .map_err(|e| StageFailure::new(Stage::Resolve, None, e, record))?;

        // Stage 2
        self.deploy_all(&profile, plan, record).await?;

        // Stage 3
        self.upload_all(plan, record).await?;

        // Stage 4
        let registration_tx_hash = self.register(&profile, plan, record).await?;

        // Stage 5
        let verification_failures = if !self.options.verify {
            tracing::info!(stage = %Stage::VerifyAll, "Verification disabled, skipping");
            Vec::new()
        } else if record.completed_at.is_some() {
            tracing::info!(stage = %Stage::VerifyAll, "Already published, skipping");
            Vec::new()
        } else {
            self.verify_all(&profile, plan, record).await
        };

        Ok(PublishSummary {
            network: profile.name.clone(),
            chain_id: profile.chain_id,
            repo_name: plan.repo_name.clone(),
            contracts: record.deployed_contracts.values().cloned().collect(),
            content_refs: record.content_refs.values().cloned().collect(),
            registration_tx_hash,
            verification_failures,
        })
    }

    /// Find out what became of `tx_hash`, broadcast by an earlier run.
    ///
    /// Not mined but known to the node is [`PublishError::StillPending`]: nothing new may
    /// be sent for the item. A hash the node has never heard of was dropped or never
    /// left this machine.
    async fn settle<E>(
        &self,
        profile: &NetworkProfile,
        item: &str,
        tx_hash: B256,
        rpc_error: E,
    ) -> Result<Settled, PublishError>
    where
        E: Fn(RpcError) -> PublishError + Copy,
    {
        let chain = &self.deployer;
        let receipt = self
            .attempt(item, Retry::Always, move || async move {
                chain.receipt(profile, tx_hash).await.map_err(rpc_error)
            })
            .await?;
        if let Some(receipt) = receipt {
            return Ok(Settled::Mined(receipt));
        }

        let known = self
            .attempt(item, Retry::Always, move || async move {
                chain
                    .transaction_known(profile, tx_hash)
                    .await
                    .map_err(rpc_error)
            })
            .await?;
        if known {
            Err(PublishError::StillPending {
                item: item.to_string(),
                tx_hash,
            })
        } else {
            Ok(Settled::Dropped)
        }
    }

    async fn deploy_all(
        &self,
        profile: &NetworkProfile,
        plan: &PublishPlan,
        record: &mut PublishRecord,
    ) -> Result<(), StageFailure> {
        let stage = Stage::DeployAll;
        let fail = |item: &str, error: PublishError, record: &PublishRecord| {
            StageFailure::new(stage, Some(item.to_string()), error, record)
        };

        // Settle transactions a previous run broadcast before deciding what is missing.
        for (name, tx_hash) in record.pending_deploys.clone() {
            let Some(spec) = plan.contract(&name) else {
                tracing::warn!(
                    contract = %name,
                    %tx_hash,
                    "Pending deployment is no longer in the plan, forgetting it"
                );
                record.clear_pending_deploy(&name);
                self.sink.save(record).map_err(|e| fail(&name, e.into(), record))?;
                continue;
            };

            let item = name.as_str();
            let settled = self
                .settle(profile, item, tx_hash, move |source| {
                    PublishError::from(DeployError::Rpc {
                        contract: item.to_string(),
                        source,
                    })
                })
                .await
                .map_err(|e| fail(&name, e, record))?;

            match settled {
                Settled::Mined(receipt) => match deployer::deployed_from_receipt(spec, &receipt) {
                    Ok(contract) => {
                        tracing::info!(contract = %name, address = %contract.address, %tx_hash, "Pending deployment confirmed");
                        record.record_contract(contract);
                    }
                    Err(err) => {
                        tracing::warn!(contract = %name, %tx_hash, error = %err, "Pending deployment reverted, deploying again");
                        record.clear_pending_deploy(&name);
                    }
                },
                Settled::Dropped => {
                    tracing::warn!(contract = %name, %tx_hash, "Pending deployment is unknown to the node, deploying again");
                    record.clear_pending_deploy(&name);
                }
            }
            self.sink.save(record).map_err(|e| fail(&name, e.into(), record))?;
        }

        let missing: Vec<&ContractSpec> = plan
            .contracts
            .iter()
            .filter(|c| !record.deployed_contracts.contains_key(&c.name))
            .collect();

        if missing.is_empty() {
            tracing::info!(%stage, "All contracts already deployed, skipping");
            return Ok(());
        }
        tracing::info!(
            %stage,
            contracts = ?missing.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            "Deploying contracts..."
        );

        // Broadcast first and record every hash as pending, then wait for the receipts.
        // An interrupted wait leaves the hashes for the next run to settle.
        let contract_deployer = &self.deployer;
        let mut sends = stream::iter(missing)
            .map(move |spec| async move {
                let result = self
                    .attempt(&spec.name, Retry::UnlessInDoubt, move || async move {
                        contract_deployer
                            .send_deployment(profile, spec)
                            .await
                            .map_err(PublishError::from)
                    })
                    .await;
                (spec, result)
            })
            .buffer_unordered(self.options.concurrency.max(1));

        let mut failures = Vec::new();
        let mut sent = Vec::new();
        while let Some((spec, result)) = sends.next().await {
            match result {
                Ok(tx_hash) => {
                    record.record_pending_deploy(&spec.name, tx_hash);
                    sent.push((spec, tx_hash));
                }
                Err(err) => {
                    tracing::warn!(contract = %spec.name, error = %err, "Deployment failed");
                    if let Some(tx_hash) = err.pending_tx() {
                        record.record_pending_deploy(&spec.name, tx_hash);
                    }
                    failures.push((spec.name.clone(), err));
                }
            }
            if let Err(err) = self.sink.save(record) {
                failures.push((spec.name.clone(), err.into()));
            }
        }

        // Drain every wait before failing: each confirmation must be recorded.
        let mut confirmations = stream::iter(sent)
            .map(move |(spec, tx_hash)| async move {
                let result = self
                    .attempt(&spec.name, Retry::Never, move || async move {
                        contract_deployer
                            .await_deployment(profile, spec, tx_hash)
                            .await
                            .map_err(PublishError::from)
                    })
                    .await;
                (spec, result)
            })
            .buffer_unordered(self.options.concurrency.max(1));

        while let Some((spec, result)) = confirmations.next().await {
            match result {
                Ok(contract) => {
                    tracing::info!(
                        contract = %spec.name,
                        address = %contract.address,
                        tx_hash = %contract.deploy_tx_hash,
                        "Contract deployed"
                    );
                    record.record_contract(contract);
                }
                Err(err) => {
                    tracing::warn!(contract = %spec.name, error = %err, "Deployment failed");
                    // A mined revert settles the transaction. Anything else stays pending.
                    if matches!(err, PublishError::Deploy(DeployError::Reverted { .. })) {
                        record.clear_pending_deploy(&spec.name);
                    }
                    failures.push((spec.name.clone(), err));
                }
            }
            if let Err(err) = self.sink.save(record) {
                failures.push((spec.name.clone(), err.into()));
            }
        }

        match most_severe(failures) {
            Some((item, error)) => Err(fail(&item, error, record)),
            None => Ok(()),
        }
    }

    async fn upload_all(
        &self,
        plan: &PublishPlan,
        record: &mut PublishRecord,
    ) -> Result<(), StageFailure> {
        let stage = Stage::UploadAll;

        let missing: Vec<&MetadataDocument> = plan
            .documents
            .iter()
            .filter(|d| !record.content_refs.contains_key(&d.kind))
            .collect();

        if missing.is_empty() {
            tracing::info!(%stage, "All metadata already uploaded, skipping");
            return Ok(());
        }
        tracing::info!(
            %stage,
            documents = ?missing.iter().map(|d| d.kind).collect::<Vec<_>>(),
            "Uploading metadata..."
        );

        let store = &self.store;
        let mut results = stream::iter(missing)
            .map(move |document| async move {
                let item = document.kind.to_string();
                let result = self
                    .attempt(&item, Retry::Always, move || async move {
                        store
                            .upload(document.kind, document.to_bytes())
                            .await
                            .map_err(PublishError::from)
                    })
                    .await;
                (item, result)
            })
            .buffer_unordered(self.options.concurrency.max(1));

        let mut failures = Vec::new();
        while let Some((item, result)) = results.next().await {
            match result {
                Ok(content) => {
                    tracing::info!(kind = %content.kind, uri = %content.uri, "Metadata uploaded");
                    record.record_content(content);
                }
                Err(err) => {
                    tracing::warn!(kind = %item, error = %err, "Metadata upload failed");
                    failures.push((item.clone(), err));
                }
            }
            if let Err(err) = self.sink.save(record) {
                failures.push((item, err.into()));
            }
        }

        match most_severe(failures) {
            Some((item, error)) => Err(StageFailure::new(stage, Some(item), error, record)),
            None => Ok(()),
        }
    }

    async fn register(
        &self,
        profile: &NetworkProfile,
        plan: &PublishPlan,
        record: &mut PublishRecord,
    ) -> Result<B256, StageFailure> {
        let stage = Stage::Register;
        let fail = |error: PublishError, record: &PublishRecord| {
            StageFailure::new(stage, Some(plan.repo_name.clone()), error, record)
        };

        if let Some(tx_hash) = record.registration_tx_hash {
            tracing::info!(%stage, %tx_hash, "Already registered, skipping");
            return Ok(tx_hash);
        }

        if let Some(tx_hash) = record.pending_registration {
            let settled = self
                .settle(profile, "register", tx_hash, |source| {
                    PublishError::from(RegisterError::Rpc(source))
                })
                .await
                .map_err(|e| fail(e, record))?;

            match settled {
                Settled::Mined(receipt) if receipt.succeeded() => {
                    tracing::info!(%tx_hash, "Pending registration confirmed");
                    record.record_registration(tx_hash);
                    self.sink.save(record).map_err(|e| fail(e.into(), record))?;
                    return Ok(tx_hash);
                }
                Settled::Mined(_) => {
                    tracing::warn!(%tx_hash, "Pending registration reverted, registering again");
                }
                Settled::Dropped => {
                    tracing::warn!(%tx_hash, "Pending registration is unknown to the node, registering again");
                }
            }
            record.clear_pending_registration();
            self.sink.save(record).map_err(|e| fail(e.into(), record))?;
        }

        let registration = self
            .registration(plan, record)
            .map_err(|reason| fail(PublishError::Precondition(reason), record))?;

        tracing::info!(
            %stage,
            repo_name = %registration.repo_name,
            plugin_setup = %registration.plugin_setup,
            release = %registration.release.uri,
            build = %registration.build.uri,
            "Registering plugin repo..."
        );

        let registrar = &self.registrar;
        let registration = &registration;
        let sent = self
            .attempt("register", Retry::UnlessInDoubt, move || async move {
                registrar
                    .send_registration(profile, registration)
                    .await
                    .map_err(PublishError::from)
            })
            .await;

        let tx_hash = match sent {
            Ok(tx_hash) => tx_hash,
            Err(err) => {
                if let Some(tx_hash) = err.pending_tx() {
                    record.record_pending_registration(tx_hash);
                    if let Err(save_err) = self.sink.save(record) {
                        tracing::error!(%tx_hash, error = %save_err, "Failed to persist pending registration");
                    }
                }
                return Err(fail(err, record));
            }
        };

        // Durable before the wait, so an interrupted run never registers twice.
        record.record_pending_registration(tx_hash);
        if let Err(err) = self.sink.save(record) {
            tracing::error!(%tx_hash, error = %err, "Registration sent but not recorded");
            return Err(fail(err.into(), record));
        }

        let confirmed = self
            .attempt("register", Retry::Never, move || async move {
                registrar
                    .await_registration(profile, registration, tx_hash)
                    .await
                    .map_err(PublishError::from)
            })
            .await;

        match confirmed {
            Ok(()) => {
                record.record_registration(tx_hash);
                self.sink.save(record).map_err(|e| fail(e.into(), record))?;
                Ok(tx_hash)
            }
            Err(err) => {
                if matches!(err, PublishError::Register(RegisterError::Reverted { .. })) {
                    record.clear_pending_registration();
                    if let Err(save_err) = self.sink.save(record) {
                        tracing::warn!(%tx_hash, error = %save_err, "Failed to clear reverted registration");
                    }
                }
                Err(fail(err, record))
            }
        }
    }

    /// Build the registration from the record, refusing if anything is missing.
    fn registration(&self, plan: &PublishPlan, record: &PublishRecord) -> Result<Registration, String> {
        if !record.pending_deploys.is_empty() {
            return Err(format!(
                "deployments still pending: {:?}",
                record.pending_deploys.keys().collect::<Vec<_>>()
            ));
        }

        let missing: Vec<&str> = plan
            .contracts
            .iter()
            .filter(|c| !record.deployed_contracts.contains_key(&c.name))
            .map(|c| c.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(format!("contracts not deployed: {:?}", missing));
        }

        let content = |kind: MetadataKind| {
            record
                .content_refs
                .get(&kind)
                .cloned()
                .ok_or_else(|| format!("{} metadata not uploaded", kind))
        };

        let plugin_setup = record
            .deployed_contracts
            .get(&plan.setup_contract)
            .map(|c| c.address)
            .ok_or_else(|| format!("setup contract '{}' not deployed", plan.setup_contract))?;

        Ok(Registration {
            repo_name: plan.repo_name.clone(),
            plugin_setup,
            maintainer: plan.maintainer,
            build: content(MetadataKind::Build)?,
            release: content(MetadataKind::Release)?,
        })
    }

    async fn verify_all(
        &self,
        profile: &NetworkProfile,
        plan: &PublishPlan,
        record: &PublishRecord,
    ) -> Vec<VerifyError> {
        let targets: Vec<(&ContractSpec, &DeployedContract)> = plan
            .contracts
            .iter()
            .filter(|spec| spec.verify)
            .filter_map(|spec| {
                record
                    .deployed_contracts
                    .get(&spec.name)
                    .map(|deployed| (spec, deployed))
            })
            .collect();

        if targets.is_empty() {
            tracing::info!(stage = %Stage::VerifyAll, "Nothing to verify");
            return Vec::new();
        }
        tracing::info!(stage = %Stage::VerifyAll, count = targets.len(), "Verifying contracts...");

        let call_timeout = self.options.call_timeout;
        let failures: Vec<VerifyError> = stream::iter(targets)
            .map(move |(spec, deployed)| async move {
                match tokio::time::timeout(call_timeout, self.deployer.verify(profile, spec, deployed))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(VerifyError {
                        contract: spec.name.clone(),
                        reason: format!("timed out after {}s", call_timeout.as_secs()),
                    }),
                }
            })
            .buffer_unordered(self.options.concurrency.max(1))
            .filter_map(|result| async move { result.err() })
            .collect()
            .await;

        for failure in &failures {
            tracing::warn!(contract = %failure.contract, reason = %failure.reason, "Verification failed");
        }

        failures
    }

    /// Call `op` bounded by the call timeout, retrying retryable failures with backoff.
    async fn attempt<T, F, Fut>(&self, item: &str, retry: Retry, mut op: F) -> Result<T, PublishError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PublishError>>,
    {
        let call_timeout = self.options.call_timeout;
        let bounded = move || {
            let call = op();
            async move {
                tokio::time::timeout(call_timeout, call)
                    .await
                    .unwrap_or_else(|_| {
                        Err(PublishError::CallTimeout {
                            item: item.to_string(),
                            secs: call_timeout.as_secs(),
                        })
                    })
            }
        };

        let max_times = match retry {
            Retry::Never => 0,
            Retry::Always | Retry::UnlessInDoubt => self.options.max_retries,
        };
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.options.retry_min_delay)
            .with_max_times(max_times);

        bounded
            .retry(backoff)
            .when(|err: &PublishError| {
                err.disposition() == Disposition::Retryable
                    && (retry == Retry::Always || !err.in_doubt())
            })
            .notify(|err: &PublishError, delay: Duration| {
                tracing::warn!(item, error = %err, ?delay, "Transient failure, retrying");
            })
            .await
    }
}

/// The failure that decides the run: the first fatal one, else the first.
fn most_severe(failures: Vec<(String, PublishError)>) -> Option<(String, PublishError)> {
    let fatal = failures
        .iter()
        .position(|(_, err)| err.disposition() == Disposition::Fatal);
    let mut failures = failures;
    match fatal {
        Some(index) => Some(failures.swap_remove(index)),
        None => failures.into_iter().next(),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use serde_json::json;

    use super::*;
    use crate::error::StoreError;

    fn plan() -> PublishPlan {
        let contract = |name: &str| ContractSpec {
            name: name.to_string(),
            artifact: PathBuf::from(format!("artifacts/{}.json", name)),
            constructor_args: Vec::new(),
            verify: true,
        };
        PublishPlan {
            repo_name: "veto-plugin".to_string(),
            contracts: vec![contract("votingToken"), contract("pluginSetup")],
            setup_contract: "pluginSetup".to_string(),
            documents: vec![
                MetadataDocument::new(MetadataKind::Release, json!({ "name": "Veto" })),
                MetadataDocument::new(MetadataKind::Build, json!({ "ui": "" })),
            ],
            maintainer: None,
        }
    }

    #[test]
    fn test_plan_validation() {
        assert!(plan().validate().is_ok());

        let mut missing_setup = plan();
        missing_setup.setup_contract = "nope".to_string();
        assert!(missing_setup.validate().is_err());

        let mut duplicate = plan();
        duplicate.contracts.push(duplicate.contracts[0].clone());
        assert!(duplicate.validate().unwrap_err().contains("twice"));

        let mut no_build = plan();
        no_build.documents.retain(|d| d.kind != MetadataKind::Build);
        assert_eq!(no_build.validate().unwrap_err(), "no build metadata document");
    }

    #[test]
    fn test_most_severe_prefers_fatal() {
        let failures = vec![
            (
                "release".to_string(),
                PublishError::from(StoreError::Unavailable("503".to_string())),
            ),
            (
                "build".to_string(),
                PublishError::from(StoreError::Rejected("401".to_string())),
            ),
        ];

        let (item, err) = most_severe(failures).unwrap();
        assert_eq!(item, "build");
        assert_eq!(err.disposition(), Disposition::Fatal);
        assert!(most_severe(Vec::new()).is_none());
    }

    #[test]
    fn test_stage_names() {
        let names: Vec<String> = Stage::iter().map(|s| s.to_string()).collect();
        assert_eq!(
            names,
            ["resolve", "deploy-all", "upload-all", "register", "verify-all"]
        );
    }
}
