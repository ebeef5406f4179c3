//! JSON output for job reports.

use procbroker::JobReport;
use serde::Serialize;
use serde_json::Value;

/// The queue's results flattened in ticket order, followed by the full report.
#[derive(Serialize)]
struct JsonOutput<'a> {
    queue: &'a str,
    values: Vec<Value>,
    report: &'a JobReport,
}

fn render(report: &JobReport, queue: &str) -> String {
    let output = JsonOutput {
        queue,
        values: report.results.flatten(queue),
        report,
    };
    serde_json::to_string_pretty(&output).unwrap_or_else(|_| "{}".to_string())
}

/// Print a job report as JSON.
pub fn print_json(report: &JobReport, queue: &str) {
    println!("{}", render(report, queue));
}
