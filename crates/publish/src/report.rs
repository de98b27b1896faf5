//! Tables printed at the end of a run and by the inspection commands.

use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL};

use crate::{
    network::{FACTORY_ROLE, NetworkBook},
    orchestrator::{PublishSummary, RunOutcome, RunReport, StageFailure},
    record::PublishRecord,
};

fn table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

/// Contracts, content references and the registration of a published repo.
pub fn summary_table(summary: &PublishSummary) -> Table {
    let mut table = table(vec!["Item", "Value"]);
    table.add_row(vec![
        "network".to_string(),
        format!("{} (chain {})", summary.network, summary.chain_id),
    ]);
    table.add_row(vec!["repo".to_string(), summary.repo_name.clone()]);

    for contract in &summary.contracts {
        table.add_row(vec![
            contract.logical_name.clone(),
            contract.address.to_string(),
        ]);
    }
    for content in &summary.content_refs {
        table.add_row(vec![format!("{} metadata", content.kind), content.uri.clone()]);
    }
    table.add_row(vec![
        "registration tx".to_string(),
        summary.registration_tx_hash.to_string(),
    ]);
    for failure in &summary.verification_failures {
        table.add_row(vec![
            format!("verify {}", failure.contract),
            format!("failed: {}", failure.reason),
        ]);
    }

    table
}

/// The failing stage, item and cause, and what was already done.
pub fn failure_table(failure: &StageFailure) -> Table {
    let mut table = table(vec!["Item", "Value"]);
    table.add_row(vec!["stage".to_string(), failure.stage.to_string()]);
    if let Some(item) = &failure.item {
        table.add_row(vec!["item".to_string(), item.clone()]);
    }
    table.add_row(vec!["error".to_string(), failure.error.to_string()]);
    table.add_row(vec![
        "disposition".to_string(),
        failure.disposition().to_string(),
    ]);
    table.add_row(vec![
        "completed".to_string(),
        if failure.completed.is_empty() {
            "nothing".to_string()
        } else {
            failure.completed.join(", ")
        },
    ]);
    table
}

/// Everything a persisted record holds.
pub fn record_table(record: &PublishRecord) -> Table {
    let mut table = table(vec!["Item", "State", "Value"]);

    for contract in record.deployed_contracts.values() {
        table.add_row(vec![
            format!("deploy {}", contract.logical_name),
            "done".to_string(),
            contract.address.to_string(),
        ]);
    }
    for (name, tx_hash) in &record.pending_deploys {
        table.add_row(vec![
            format!("deploy {}", name),
            "pending".to_string(),
            tx_hash.to_string(),
        ]);
    }
    for content in record.content_refs.values() {
        table.add_row(vec![
            format!("upload {}", content.kind),
            "done".to_string(),
            content.uri.clone(),
        ]);
    }
    match (record.registration_tx_hash, record.pending_registration) {
        (Some(tx_hash), _) => {
            table.add_row(vec!["register".to_string(), "done".to_string(), tx_hash.to_string()]);
        }
        (None, Some(tx_hash)) => {
            table.add_row(vec![
                "register".to_string(),
                "pending".to_string(),
                tx_hash.to_string(),
            ]);
        }
        (None, None) => {
            table.add_row(vec!["register".to_string(), "missing".to_string(), String::new()]);
        }
    }

    table
}

/// Configured networks and whether they can publish.
pub fn networks_table(networks: &NetworkBook) -> Table {
    let mut table = table(vec!["Network", "Chain ID", "RPC URL", "Factory", "Explorer"]);
    for (name, network) in networks.iter() {
        table.add_row(vec![
            name.clone(),
            network.chain_id.to_string(),
            network.rpc_url.clone(),
            network
                .addresses
                .get(FACTORY_ROLE)
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string()),
            network
                .explorer
                .as_ref()
                .map(|e| e.api_url.clone())
                .unwrap_or_else(|| "-".to_string()),
        ]);
    }
    table
}

/// Human-readable rendering of a run's outcome.
pub fn render(report: &RunReport) -> String {
    match &report.outcome {
        RunOutcome::Published(summary) => {
            format!("Published {}\n{}", summary.repo_name, summary_table(summary))
        }
        RunOutcome::Failed(failure) => format!(
            "Publish failed, operator action required\n{}",
            failure_table(failure)
        ),
        RunOutcome::Retryable(failure) => format!(
            "Publish interrupted, run again to resume\n{}",
            failure_table(failure)
        ),
    }
}

#[cfg(test)]
mod tests {
    use alloy_core::primitives::{Address, B256};

    use super::*;
    use crate::{
        error::{PublishError, StoreError},
        metadata::{ContentRef, MetadataKind},
        orchestrator::Stage,
        record::DeployedContract,
    };

    #[test]
    fn test_record_table_shows_pending_items() {
        let mut record = PublishRecord::new("testnetX", "veto-plugin");
        record.record_contract(DeployedContract {
            logical_name: "pluginSetup".to_string(),
            address: Address::repeat_byte(0x11),
            constructor_args: Vec::new(),
            deploy_tx_hash: B256::repeat_byte(0x01),
        });
        record.record_pending_deploy("votingToken", B256::repeat_byte(0x02));
        record.record_content(ContentRef {
            kind: MetadataKind::Release,
            uri: "ipfs://QmRelease".to_string(),
        });

        let rendered = record_table(&record).to_string();
        assert!(rendered.contains("deploy votingToken"));
        assert!(rendered.contains("pending"));
        assert!(rendered.contains("ipfs://QmRelease"));
        assert!(rendered.contains("missing"));
    }

    #[test]
    fn test_retryable_report_invites_rerun() {
        let record = PublishRecord::new("testnetX", "veto-plugin");
        let failure = StageFailure {
            stage: Stage::UploadAll,
            item: Some("build".to_string()),
            error: PublishError::from(StoreError::Unavailable("503".to_string())),
            completed: vec!["upload:release".to_string()],
        };
        let report = RunReport {
            outcome: RunOutcome::Retryable(failure),
            record,
        };

        let rendered = render(&report);
        assert!(rendered.contains("run again"));
        assert!(rendered.contains("upload-all"));
        assert!(rendered.contains("upload:release"));
    }

    #[test]
    fn test_networks_table_lists_builtin_networks() {
        let rendered = networks_table(&NetworkBook::builtin()).to_string();

        assert!(rendered.contains("bsctestnet"));
        assert!(rendered.contains("97"));
    }
}
