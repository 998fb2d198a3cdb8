use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "mqlab",
    about = "Ephemeral distributed-messaging clusters for reproducible load tests",
    version
)]
pub struct Cli {
    /// Experiment store root. Defaults to ~/.mqlab/experiments.
    #[arg(long, env = "MQLAB_ROOT", global = true)]
    pub root: Option<PathBuf>,

    /// Cloud region for commands that run without an infrastructure config.
    #[arg(long, env = "MQLAB_REGION", global = true)]
    pub region: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the complete lifecycle: provision, converge, matrix, report, teardown.
    Full {
        /// Infrastructure config file.
        #[arg(long)]
        config: PathBuf,

        /// Test plan file.
        #[arg(long)]
        test_plan: PathBuf,

        /// Reuse an explicit experiment id instead of minting one.
        #[arg(long)]
        experiment_id: Option<String>,

        /// Extra cloud tags as k=v; repeatable. CLI tags override config tags.
        #[arg(long = "tag", value_parser = parse_tag)]
        tags: Vec<(String, String)>,
    },

    /// Init + Provision + Converge; leave the cluster running.
    Setup {
        /// Infrastructure config file.
        #[arg(long)]
        config: PathBuf,

        /// Reuse an explicit experiment id instead of minting one.
        #[arg(long)]
        experiment_id: Option<String>,

        /// Extra cloud tags as k=v; repeatable.
        #[arg(long = "tag", value_parser = parse_tag)]
        tags: Vec<(String, String)>,
    },

    /// Run a test matrix (plus report) on an existing cluster.
    Run {
        /// Test plan file.
        #[arg(long)]
        test_plan: PathBuf,

        /// Experiment id, or `latest`.
        #[arg(long)]
        experiment_id: String,
    },

    /// Rebuild the report from stored artefacts.
    Report {
        /// Experiment id, or `latest`.
        #[arg(long)]
        experiment_id: String,
    },

    /// Destroy every cloud resource tagged with the experiment id.
    Teardown {
        /// Experiment id, or `latest`.
        #[arg(long)]
        experiment_id: String,

        /// Show the reclaim plan without destroying anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Enumerate stored experiments.
    List,
}

fn parse_tag(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("tag '{}' is not of the form key=value", s)),
    }
}
