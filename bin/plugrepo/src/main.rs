//! plugrepo publishes governance plugin repos: it deploys the plugin's contracts,
//! uploads its metadata and registers the first version with the network's factory.

mod cli;

use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};

use cli::{Cli, Command};
use plugrepo_publish::{
    EXIT_PUBLISHED, EXIT_RETRYABLE, Environment, ExplorerClient, FactoryRegistrar,
    FileRecordStore, NetworkResolver, Orchestrator, PublishConfig, RpcChain, RpcDeployer,
    StoredRecord, report,
};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize the logger. Reports go to stdout, logs to stderr.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .with_writer(std::io::stderr)
        .init();

    if let Command::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "plugrepo", &mut std::io::stdout());
        return Ok(ExitCode::from(EXIT_PUBLISHED));
    }

    let config = PublishConfig::load_from_file(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    match cli.command {
        Command::Publish {
            network,
            no_verify,
            records_dir,
        } => publish(&config, &network, no_verify, records_dir).await,
        Command::Status {
            network,
            records_dir,
        } => {
            let records_dir = records_dir.unwrap_or_else(|| config.records_dir());
            status(&config, &network, &records_dir)?;
            Ok(ExitCode::from(EXIT_PUBLISHED))
        }
        Command::Networks => {
            println!("{}", report::networks_table(&config.networks));
            Ok(ExitCode::from(EXIT_PUBLISHED))
        }
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(ExitCode::from(EXIT_PUBLISHED))
        }
        Command::Completions { .. } => Ok(ExitCode::from(EXIT_PUBLISHED)),
    }
}

async fn publish(
    config: &PublishConfig,
    network: &str,
    no_verify: bool,
    records_dir: Option<PathBuf>,
) -> Result<ExitCode> {
    let plan = config.plan()?;

    let mut options = config.pipeline.pipeline_options();
    if no_verify {
        options.verify = false;
    }

    let records_dir = records_dir.unwrap_or_else(|| config.records_dir());
    let records = FileRecordStore::open(&records_dir, network, &plan.repo_name)?;
    let record = records.load()?;

    let chain = Arc::new(RpcChain::new(config.pipeline.chain_options())?);
    let explorer = ExplorerClient::new(Duration::from_secs(config.pipeline.request_timeout_secs))
        .context("Failed to build the explorer client")?;
    let deployer = RpcDeployer::new(chain.clone(), explorer);
    let store = config.content_store(&Environment::Process)?;
    let registrar = FactoryRegistrar::new(chain);
    let resolver = NetworkResolver::new(config.networks.clone());

    tracing::info!(
        network,
        repo_name = %plan.repo_name,
        records_dir = %records_dir.display(),
        contracts = plan.contracts.len(),
        verify = options.verify,
        "Publishing plugin repo..."
    );

    let orchestrator =
        Orchestrator::new(resolver, deployer, store, registrar, records).with_options(options);

    let report = tokio::select! {
        report = orchestrator.run(network, &plan, record) => report,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, completed steps are recorded and the next run resumes from them");
            return Ok(ExitCode::from(EXIT_RETRYABLE));
        }
    };

    println!("{}", report::render(&report));
    Ok(ExitCode::from(report.exit_code()))
}

fn status(config: &PublishConfig, network: &str, records_dir: &Path) -> Result<()> {
    match FileRecordStore::inspect(records_dir, network, &config.repo_name)? {
        None => println!("{} has no publish record on {}", config.repo_name, network),
        Some(StoredRecord::InProgress(record)) => println!(
            "{} on {}: in progress, last updated {}\n{}",
            record.repo_name,
            record.network,
            record.updated_at,
            report::record_table(&record)
        ),
        Some(StoredRecord::Published(record)) => println!(
            "{} on {}: published at {}\n{}",
            record.repo_name,
            record.network,
            record.completed_at.as_deref().unwrap_or("unknown time"),
            report::record_table(&record)
        ),
    }
    Ok(())
}
