use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Command line of the `testflow` binary.
#[derive(Debug, Parser)]
#[command(name = "testflow")]
#[command(about = "Sets up and runs suites of test cases", version)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Timestamps, targets and debug logs")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Emit logs as JSON")]
    pub log_json: bool,

    #[arg(long, global = true, requires = "log_json", help = "Pretty-print JSON logs")]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Write the persisted state of a suite definition into a work directory.
    Setup(SetupArgs),
    /// Run a suite, a test case, a step or a substep from its work directory.
    Run(RunArgs),
    /// List recent runs or show one of them.
    Status(StatusArgs),
}

#[derive(Debug, Args, Clone)]
pub struct SetupArgs {
    #[arg(long, help = "YAML suite definition")]
    pub definition: PathBuf,

    #[arg(long, default_value = ".", help = "Directory the suite is set up in")]
    pub work_dir: PathBuf,

    #[arg(long, help = "Runner configuration file (defaults apply otherwise)")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Args, Clone)]
pub struct RunArgs {
    #[arg(help = "Suite name or state file; detected from the work directory when omitted")]
    pub suite: Option<String>,

    #[arg(long, default_value = ".", help = "Directory to run from")]
    pub work_dir: PathBuf,

    #[arg(long, help = "Override the configuration stored at setup time")]
    pub config: Option<PathBuf>,

    #[arg(long, num_args = 1.., help = "Steps to run, in order (test case mode)")]
    pub steps: Vec<String>,

    #[arg(long, num_args = 1.., help = "Steps to skip (test case mode)")]
    pub no_steps: Vec<String>,

    #[arg(long, help = "Run one substep of the step in the work directory")]
    pub substep: Option<String>,

    #[arg(short, long, help = "Keep step progress in the case logs")]
    pub quiet: bool,

    #[arg(long, help = "Announce each substep as it starts")]
    pub print_substeps: bool,

    #[arg(long, help = "Do not record this run in the history database")]
    pub no_history: bool,
}

#[derive(Debug, Args, Clone)]
pub struct StatusArgs {
    #[arg(long, help = "Run identifier to inspect")]
    pub run_id: Option<String>,

    #[arg(long, help = "Print JSON instead of text")]
    pub json: bool,

    #[arg(long, default_value_t = 10, help = "Number of recent runs to list")]
    pub limit: usize,
}
