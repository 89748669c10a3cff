//! CLI argument definitions for the `rebuilder` binary.
//!
//! Kept apart from the entrypoint so that parsing can be tested without
//! running anything.

use crate::message::Stage;
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use rebuilder_common::dist::Project;

/// Rebuild distribution packages and attest whether they are reproducible.
#[derive(Parser, Debug)]
#[command(name = "rebuilder")]
#[command(version, about)]
#[command(after_help = concat!(
    "EXAMPLES:\n",
    "  Run every stage with two workers each:\n",
    "    $ rebuilder worker --jobs 2\n\n",
    "  Queue a discovery of the essential set of bullseye:\n",
    "    $ rebuilder discover bullseye+essential.amd64\n\n",
    "  Show the aggregated status as JSON:\n",
    "    $ rebuilder status --json\n",
))]
pub struct Cli {
    /// Configuration file [default: $PACKAGE_REBUILDER_CONF or ./rebuilder.toml].
    #[arg(short, long, value_name = "PATH", global = true)]
    pub config: Option<Utf8PathBuf>,

    /// Increase log verbosity (repeatable: -v, -vv).
    #[arg(short, long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbosity: u8,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run stage workers and the periodic scheduler until interrupted.
    Worker(WorkerArgs),
    /// Queue a discovery of a dist string.
    Discover(DiscoverArgs),
    /// Queue a publication of a project.
    Publish(PublishArgs),
    /// Print record counts per distribution and status.
    Status(StatusArgs),
    /// Print the stored build records as JSON.
    Dump(DumpArgs),
}

/// Arguments for the worker command.
#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    /// Stage to serve (repeatable) [default: all stages].
    #[arg(long = "stage", value_enum, value_name = "STAGE")]
    pub stages: Vec<Stage>,

    /// Workers per stage.
    #[arg(short, long, value_name = "N", default_value_t = 1)]
    pub jobs: usize,

    /// Idle polling interval in milliseconds.
    #[arg(long, value_name = "MS", default_value_t = 1000)]
    pub poll_ms: u64,

    /// Do not submit periodic discoveries and publications.
    #[arg(long)]
    pub no_schedule: bool,
}

impl WorkerArgs {
    /// Requested stages in pipeline order, or every stage when none was
    /// given.
    #[must_use]
    pub fn selected_stages(&self) -> Vec<Stage> {
        if self.stages.is_empty() {
            return Stage::ALL.to_vec();
        }
        let mut stages = self.stages.clone();
        stages.sort();
        stages.dedup();
        stages
    }
}

/// Arguments for the discover command.
#[derive(Args, Debug, Clone)]
pub struct DiscoverArgs {
    /// Dist string, e.g. `bullseye+essential.amd64`.
    #[arg(value_name = "DIST")]
    pub dist: String,

    /// Resubmit packages whose last rebuild failed.
    #[arg(long)]
    pub force_retry: bool,
}

/// Arguments for the publish command.
#[derive(Args, Debug, Clone)]
pub struct PublishArgs {
    /// Project to publish.
    #[arg(short, long, value_name = "PROJECT", value_parser = parse_project)]
    pub project: Project,

    /// Also upload rendered results.
    #[arg(long)]
    pub upload_results: bool,
}

/// Arguments for the status command.
#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    /// Print JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the dump command.
#[derive(Args, Debug, Clone)]
pub struct DumpArgs {
    /// Print at most this many records.
    #[arg(long, value_name = "N")]
    pub limit: Option<usize>,
}

fn parse_project(value: &str) -> Result<Project, String> {
    value.parse().map_err(|err| format!("{err}"))
}

#[cfg(test)]
#[path = "cli_tests.rs"]
mod tests;
