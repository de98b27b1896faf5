use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use tracing::level_filters::LevelFilter;

/// Network used when none is given.
const DEFAULT_NETWORK: &str = "localhost";

#[derive(Parser)]
#[command(name = "plugrepo")]
#[command(
    author,
    version,
    about = "Deploy, upload and register governance plugin repos"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, global = true, env = "PLUGREPO_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to a Publish.toml file, or to the directory holding it.
    #[arg(short, long, global = true, alias = "conf", env = "PLUGREPO_CONFIG", default_value = ".")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Publish the plugin repo on a network, resuming any interrupted run.
    ///
    /// Exits with 0 when published, 75 when running again may succeed, and 1 when
    /// the failure needs operator action.
    Publish {
        /// The network to publish on.
        #[arg(short, long, env = "PLUGREPO_NETWORK", default_value = DEFAULT_NETWORK)]
        network: String,

        /// Skip source verification on block explorers.
        #[arg(long, env = "PLUGREPO_NO_VERIFY")]
        no_verify: bool,

        /// Directory holding publish records. Overrides `records_dir` from the configuration.
        #[arg(long, env = "PLUGREPO_RECORDS_DIR")]
        records_dir: Option<PathBuf>,
    },

    /// Show what has been published on a network so far.
    Status {
        /// The network to inspect.
        #[arg(short, long, env = "PLUGREPO_NETWORK", default_value = DEFAULT_NETWORK)]
        network: String,

        /// Directory holding publish records.
        #[arg(long, env = "PLUGREPO_RECORDS_DIR")]
        records_dir: Option<PathBuf>,
    },

    /// List the configured networks.
    Networks,

    /// Print the effective configuration.
    Config,

    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_publish_flags() {
        let cli = Cli::try_parse_from([
            "plugrepo",
            "--config",
            "demos/veto",
            "publish",
            "--network",
            "bsctestnet",
            "--no-verify",
        ])
        .unwrap();

        assert_eq!(cli.config, PathBuf::from("demos/veto"));
        match cli.command {
            Command::Publish {
                network,
                no_verify,
                records_dir,
            } => {
                assert_eq!(network, "bsctestnet");
                assert!(no_verify);
                assert!(records_dir.is_none());
            }
            _ => panic!("expected the publish command"),
        }
    }
}
