//! Command-line interface definitions using clap.

use crate::output::OutputFormat;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

/// Spread work over a pool of worker processes and collect the results.
#[derive(Parser, Debug)]
#[command(name = "procbroker")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors and results.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Feed items through worker roles and print the results.
    Run(RunArgs),

    /// List the built-in worker roles.
    Roles,

    /// Generate shell completions.
    Completions(CompletionsArgs),

    /// Run as a worker process (spawned by `run`).
    #[command(hide = true)]
    InternalWorker,
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate and print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "procbroker",
            &mut std::io::stdout(),
        );
    }
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Worker role to run; repeat to host several roles per process.
    #[arg(short, long = "role", default_value = "echo")]
    pub roles: Vec<String>,

    /// Feed the integers 1..=COUNT.
    #[arg(short = 'n', long, default_value_t = 100, conflicts_with = "input")]
    pub count: u64,

    /// Feed the lines of this file instead of integers.
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Name of the input queue.
    #[arg(long, default_value = "input")]
    pub queue: String,

    /// JSON file shipped read-only to every worker as tools data.
    #[arg(long)]
    pub tools: Option<PathBuf>,

    /// JSON file with per-role settings, e.g. {"echo": {"delay_ms": 5}}.
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Number of worker processes (default: available parallelism).
    #[arg(short, long, env = "PROCBROKER_PROCESSES")]
    pub processes: Option<usize>,

    /// Items per chunk.
    #[arg(short, long, env = "PROCBROKER_BATCH_SIZE", default_value_t = procbroker::config::DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Input queue capacity in chunks (default: 2 per process).
    #[arg(long, env = "PROCBROKER_QUEUE_CAPACITY")]
    pub queue_capacity: Option<usize>,

    /// Seconds to wait for workers to drain before stopping them.
    #[arg(long, env = "PROCBROKER_DRAIN_TIMEOUT", default_value_t = 30)]
    pub drain_timeout: u64,

    /// Pin each worker process to one CPU.
    #[arg(long)]
    pub pin: bool,

    /// Do not collect progress telemetry.
    #[arg(long)]
    pub no_telemetry: bool,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = OutputFormatArg::Table)]
    pub format: OutputFormatArg,

    /// Limit number of result rows (0 for unlimited).
    #[arg(short, long, default_value_t = 50)]
    pub limit: usize,

    /// Use ASCII table borders instead of Unicode.
    #[arg(long)]
    pub ascii: bool,

    /// Exit non-zero unless every worker finished and every item was handled.
    #[arg(long)]
    pub strict: bool,
}

/// Output format argument.
#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum OutputFormatArg {
    /// Colored table output.
    #[default]
    Table,
    /// JSON output.
    Json,
    /// Plain text output (tab-separated).
    Plain,
}

impl From<OutputFormatArg> for OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Table => OutputFormat::Table,
            OutputFormatArg::Json => OutputFormat::Json,
            OutputFormatArg::Plain => OutputFormat::Plain,
        }
    }
}

/// Verbosity level for output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// Errors, warnings and results only.
    Normal,
    /// -v: include pool lifecycle info.
    Info,
    /// -vv: include per-worker debug info.
    Debug,
    /// -vvv: include every dispatched chunk.
    Trace,
}

impl From<u8> for Verbosity {
    fn from(count: u8) -> Self {
        match count {
            0 => Verbosity::Normal,
            1 => Verbosity::Info,
            2 => Verbosity::Debug,
            _ => Verbosity::Trace,
        }
    }
}

impl Cli {
    /// Get the verbosity level based on -v flags.
    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from(self.verbose)
    }
}
