// CLI argument parsing and definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "fixture")]
#[command(about = "Provision disposable test dependencies and run tests against them")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Enable debug output
    #[arg(short, long, global = true)]
    pub debug: bool,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Check a fixture file without starting anything
    Validate {
        /// Fixture configuration file
        file: PathBuf,
    },
    /// Start the fixture, wait until it is ready, then tear it down
    Check {
        /// Fixture configuration file
        file: PathBuf,
    },
    /// Start the fixture, run a command against it, then tear it down
    ///
    /// The command sees FIXTURE_HOST, FIXTURE_PORT, FIXTURE_ENDPOINT and one
    /// FIXTURE_PORT_<container port> per published port. Exits 0 when the
    /// command succeeds, 1 when it fails and 2 when the fixture could not be
    /// made ready.
    Run {
        /// Fixture configuration file
        file: PathBuf,
        /// Overall deadline in seconds (overrides run.deadline_secs)
        #[arg(long)]
        deadline: Option<u64>,
        /// Write the run report as JSON to this path
        #[arg(long)]
        report: Option<PathBuf>,
        /// Command to run against the fixture
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Remove fixture containers left behind by interrupted runs
    Prune {
        /// Only remove containers labelled with this run id
        #[arg(long)]
        run: Option<String>,
    },
}
