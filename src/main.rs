//! procbroker - multi-process work broker

mod cli;
mod output;
mod theme;

use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind, Lines};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::{OwoColorize, Stream::Stderr};
use serde_json::Value;
use tracing::{Level, warn};

use cli::{Cli, Commands, RunArgs, Verbosity};
use procbroker::logging::{self, LogConfig, LogFormat};
use procbroker::roles::builtin_registry;
use procbroker::{BrokerConfig, CpuPinning, WorkerCommand, WorkerGroup};
use theme::Themed;

fn main() {
    let cli = Cli::parse();

    // Affects both owo_colors and comfy_table
    if cli.no_color {
        theme::disable_colors();
    }

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(&cli, args),
        Commands::Roles => cmd_roles(),
        Commands::Completions(args) => {
            args.generate();
            Ok(())
        }
        Commands::InternalWorker => {
            logging::init(LogConfig::for_worker().with_env_overrides());
            procbroker::run_worker_main(&builtin_registry())
        }
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Map -v/-q onto the tracing level. Worker print lines stay visible
/// unless `--quiet` is given or a filter comes from the environment.
fn init_logging(cli: &Cli) {
    let level = if cli.quiet {
        Level::ERROR
    } else {
        match cli.verbosity() {
            Verbosity::Normal => Level::WARN,
            Verbosity::Info => Level::INFO,
            Verbosity::Debug => Level::DEBUG,
            Verbosity::Trace => Level::TRACE,
        }
    };

    let mut config = LogConfig::for_cli()
        .with_level(level)
        .with_format(LogFormat::Compact)
        .with_env_overrides();
    if config.filter.is_none() && !cli.quiet {
        let filter = format!(
            "{},procbroker::print=info",
            level.to_string().to_lowercase()
        );
        config = config.with_filter(filter);
    }
    logging::init(config);
}

fn read_json(path: &Path) -> Result<Value> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse JSON from {}", path.display()))
}

fn progress_bar(cli: &Cli, expected: Option<u64>) -> Result<ProgressBar> {
    if cli.quiet {
        return Ok(ProgressBar::hidden());
    }
    let pb = match expected {
        Some(total) => {
            let pb = ProgressBar::new(total);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                    .progress_chars("█▓▒░  "),
            );
            pb
        }
        None => {
            let pb = ProgressBar::new_spinner();
            pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {pos} items {msg}")?);
            pb
        }
    };
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

/// Build the broker configuration from `run` flags.
fn build_config(args: &RunArgs) -> Result<BrokerConfig> {
    let tools = match &args.tools {
        Some(path) => read_json(path)?,
        None => Value::Null,
    };
    let settings = match &args.settings {
        Some(path) => read_json(path)?,
        None => Value::Null,
    };

    let mut group = WorkerGroup::new(&args.queue, args.roles.clone());
    if let Some(processes) = args.processes {
        group = group.with_processes(processes);
    }

    let mut config = BrokerConfig::default()
        .with_group(group)
        .with_batch_size(args.batch_size)
        .with_drain_timeout(Duration::from_secs(args.drain_timeout))
        .with_telemetry(!args.no_telemetry)
        .with_tools(tools)
        .with_settings(settings)
        .with_worker_command(WorkerCommand::current_exe()?);
    if let Some(capacity) = args.queue_capacity {
        config = config.with_queue_capacity(capacity);
    }
    if args.pin {
        config = config.with_pinning(CpuPinning::PerCore);
    }
    if args.input.is_none() {
        config = config.with_expected_items(args.count);
    }
    config.validate()?;
    Ok(config)
}

/// Lines of an input file as JSON strings.
///
/// Lines that are not valid UTF-8 are skipped and counted. Any other read
/// error is counted once and ends the input.
struct InputLines<R> {
    lines: Lines<R>,
    line_no: u64,
    unreadable: Arc<AtomicU64>,
    done: bool,
}

impl<R: BufRead> InputLines<R> {
    fn new(reader: R, unreadable: Arc<AtomicU64>) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
            unreadable,
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for InputLines<R> {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        while !self.done {
            self.line_no += 1;
            match self.lines.next() {
                Some(Ok(line)) => return Some(Value::String(line)),
                Some(Err(e)) if e.kind() == ErrorKind::InvalidData => {
                    warn!(line = self.line_no, error = %e, "Skipping unreadable input line");
                    self.unreadable.fetch_add(1, Ordering::Relaxed);
                }
                Some(Err(e)) => {
                    warn!(line = self.line_no, error = %e, "Input read failed, ending input early");
                    self.unreadable.fetch_add(1, Ordering::Relaxed);
                    self.done = true;
                }
                None => self.done = true,
            }
        }
        None
    }
}

/// Items to feed, plus a count of input lines that could not be read.
struct Source {
    items: Box<dyn Iterator<Item = Value> + Send>,
    unreadable: Arc<AtomicU64>,
}

/// Integers 1..=count, or the lines of the input file as strings.
fn open_source(args: &RunArgs) -> Result<Source> {
    let unreadable = Arc::new(AtomicU64::new(0));
    let items: Box<dyn Iterator<Item = Value> + Send> = match &args.input {
        Some(path) => {
            let file =
                File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
            Box::new(InputLines::new(BufReader::new(file), unreadable.clone()))
        }
        None => Box::new((1..=args.count).map(Value::from)),
    };
    Ok(Source { items, unreadable })
}

fn cmd_run(cli: &Cli, args: &RunArgs) -> Result<()> {
    init_logging(cli);

    let registry = builtin_registry();
    for role in &args.roles {
        if !registry.contains(role) {
            bail!("Unknown role '{}' (see `procbroker roles`)", role);
        }
    }

    let config = build_config(args)?;
    let source = open_source(args)?;
    let expected = config.expected_items;
    let mut pool = procbroker::start(config).context("Failed to start worker pool")?;

    let stop = pool.stop_handle();
    ctrlc::set_handler(move || {
        eprintln!("\nReceived Ctrl+C, stopping workers...");
        stop.begin_hard_shutdown();
    })
    .context("Failed to set Ctrl+C handler")?;

    if let Err(e) = pool.run_feeder(source.items, &args.queue) {
        pool.abort()?;
        return Err(e.into());
    }

    let pb = progress_bar(cli, expected)?;
    while !pool.workers_done() {
        let progress = pool.progress();
        pb.set_position(progress.done);
        if progress.eta.is_some() {
            pb.set_message(format!("ETA {}", progress.eta_string()));
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    pb.finish_and_clear();

    let report = pool.join()?;
    output::print_report(
        &report,
        &args.queue,
        args.format.into(),
        output::TableOptions {
            limit: args.limit,
            ascii: args.ascii,
        },
    );

    for worker in report.crashed() {
        eprintln!(
            "{} {} ({})",
            "warning:".failure(),
            worker.name,
            output::state_text(&worker.state)
        );
    }
    let unreadable = source.unreadable.load(Ordering::Relaxed);
    if unreadable > 0 {
        eprintln!(
            "{} skipped {} unreadable input line(s)",
            "warning:".failure(),
            unreadable
        );
    }
    if args.strict && (!report.is_complete() || unreadable > 0) {
        bail!(
            "Job incomplete: {} crashed workers, {} undrained queues, {} unreadable input lines",
            report.crashed().count(),
            report.undrained.len(),
            unreadable
        );
    }
    Ok(())
}

fn cmd_roles() -> Result<()> {
    let registry = builtin_registry();
    for (name, description) in registry.roles() {
        println!("{} {}", format!("{:<12}", name).success(), description);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_input_lines_skip_invalid_utf8() {
        let unreadable = Arc::new(AtomicU64::new(0));
        let reader = Cursor::new(b"a\nb\n\xff\xfe\nc\n".to_vec());
        let items: Vec<Value> = InputLines::new(reader, unreadable.clone()).collect();

        assert_eq!(items, vec![Value::from("a"), Value::from("b"), Value::from("c")]);
        assert_eq!(unreadable.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_input_lines_stay_done() {
        let unreadable = Arc::new(AtomicU64::new(0));
        let mut lines = InputLines::new(Cursor::new(b"x\n".to_vec()), unreadable.clone());
        assert_eq!(lines.next(), Some(Value::from("x")));
        assert_eq!(lines.next(), None);
        assert_eq!(lines.next(), None);
        assert_eq!(unreadable.load(Ordering::Relaxed), 0);
    }
}
