//! Colored table output for job reports.

use crate::output::{TableOptions, state_text, value_text};
use crate::theme::{Semantic, Themed, ThemedCell};
use comfy_table::{
    Cell, ContentArrangement, Table,
    presets::{ASCII_FULL, UTF8_FULL},
};
use procbroker::telemetry::format_duration;
use procbroker::{JobReport, WorkerState};

fn new_table(options: TableOptions) -> Table {
    let mut table = Table::new();
    if options.ascii {
        table.load_preset(ASCII_FULL);
    } else {
        table.load_preset(UTF8_FULL);
    }
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn results_table(report: &JobReport, queue: &str, options: TableOptions) -> Table {
    let mut table = new_table(options);
    table.set_header(vec!["Ticket", "Items", "Results"]);

    let rows: Vec<_> = report.results.ordered(queue).collect();
    for (seq, values) in rows.iter().take(options.take(rows.len())) {
        let text = values.iter().map(value_text).collect::<Vec<_>>().join(", ");
        table.add_row(vec![
            Cell::new(seq).themed(Semantic::Ticket),
            Cell::new(values.len()),
            Cell::new(text).themed(Semantic::Value),
        ]);
    }
    table
}

fn workers_table(report: &JobReport, options: TableOptions) -> Table {
    let mut table = new_table(options);
    table.set_header(vec!["Worker", "PID", "CPUs", "Chunks", "State"]);

    for worker in &report.workers {
        let cpus = worker
            .cpus
            .as_ref()
            .map(|cpus| {
                cpus.iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_else(|| "-".to_string());
        let semantic = match worker.state {
            WorkerState::Finished => Semantic::Success,
            WorkerState::Crashed { .. } => Semantic::Failure,
            _ => Semantic::Muted,
        };
        table.add_row(vec![
            Cell::new(&worker.name).themed(Semantic::Worker),
            Cell::new(worker.pid),
            Cell::new(cpus),
            Cell::new(worker.chunks),
            Cell::new(state_text(&worker.state)).themed(semantic),
        ]);
    }
    table
}

/// Print results, then per-worker state, then a one-line summary.
pub fn print_table(report: &JobReport, queue: &str, options: TableOptions) {
    let tickets = report.results.tickets(queue).len();
    if tickets == 0 {
        println!("No results.");
    } else {
        println!("{}", results_table(report, queue, options));
        if options.take(tickets) < tickets {
            println!(
                "{}",
                format!("... {} more tickets", tickets - options.take(tickets)).muted()
            );
        }
    }

    if !report.workers.is_empty() {
        println!("{}", workers_table(report, options));
    }

    let crashed = report.crashed().count();
    let summary = format!(
        "{} results in {} tickets from {} workers in {}",
        report.results.flatten(queue).len(),
        tickets,
        report.workers.len(),
        format_duration(report.elapsed)
    );
    if crashed > 0 || report.timed_out {
        println!("{} ({} crashed)", summary.failure(), crashed);
    } else {
        println!("{}", summary.success());
    }
}
