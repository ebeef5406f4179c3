//! Plain text output for job reports.

use crate::output::{TableOptions, value_text};
use procbroker::JobReport;

fn lines(report: &JobReport, queue: &str, options: TableOptions) -> Vec<String> {
    let rows: Vec<String> = report
        .results
        .ordered(queue)
        .flat_map(|(seq, values)| {
            values
                .iter()
                .map(move |value| format!("{}\t{}", seq, value_text(value)))
        })
        .collect();
    let keep = options.take(rows.len());
    rows.into_iter().take(keep).collect()
}

/// Print one `TICKET<TAB>VALUE` line per result value, no colors.
pub fn print_plain(report: &JobReport, queue: &str, options: TableOptions) {
    for line in lines(report, queue, options) {
        println!("{}", line);
    }
}
