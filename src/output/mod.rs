//! Output formatting for job reports.

pub mod json;
pub mod plain;
pub mod table;

use procbroker::{JobReport, WorkerState};
use serde_json::Value;

/// Output format options.
#[derive(Debug, Clone, Copy, Default)]
pub enum OutputFormat {
    /// Colored table output (default).
    #[default]
    Table,
    /// JSON output.
    Json,
    /// Plain text output (no colors).
    Plain,
}

/// Display options shared by the table and plain formats.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableOptions {
    /// Maximum result rows, 0 for unlimited.
    pub limit: usize,
    /// Use ASCII borders instead of Unicode.
    pub ascii: bool,
}

impl TableOptions {
    fn take(&self, total: usize) -> usize {
        if self.limit == 0 {
            total
        } else {
            total.min(self.limit)
        }
    }
}

/// Format and print a job report for one queue.
pub fn print_report(report: &JobReport, queue: &str, format: OutputFormat, options: TableOptions) {
    match format {
        OutputFormat::Table => table::print_table(report, queue, options),
        OutputFormat::Json => json::print_json(report, queue),
        OutputFormat::Plain => plain::print_plain(report, queue, options),
    }
}

/// Strings print bare, everything else as JSON.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn state_text(state: &WorkerState) -> String {
    match state {
        WorkerState::Starting => "starting".to_string(),
        WorkerState::Running => "running".to_string(),
        WorkerState::Finished => "finished".to_string(),
        WorkerState::Crashed {
            reason,
            lost_ticket: Some(ticket),
        } => format!("crashed: {}, lost {}", reason, ticket),
        WorkerState::Crashed { reason, .. } => format!("crashed: {}", reason),
        WorkerState::Stopped { reason } => format!("stopped: {}", reason),
    }
}

#[cfg(test)]
pub(crate) fn sample_report() -> JobReport {
    use procbroker::signals::TerminationReason;
    use procbroker::{ProgressSnapshot, ResultChunk, ResultStore, Ticket, WorkerReport};
    use serde_json::json;

    let mut results = ResultStore::new();
    results.insert(ResultChunk::new(Ticket::new("input", 2), vec![json!(9)]));
    results.insert(ResultChunk::new(
        Ticket::new("input", 1),
        vec![json!(1), json!("four")],
    ));
    let worker = |id: usize, state| WorkerReport {
        id,
        name: format!("input-{}", id),
        pid: 4000 + id as u32,
        cpus: Some(vec![id]),
        input_queue: "input".into(),
        state,
        chunks: 1,
    };
    JobReport {
        results,
        progress: ProgressSnapshot::default(),
        workers: vec![
            worker(0, WorkerState::Finished),
            worker(
                1,
                WorkerState::Crashed {
                    reason: TerminationReason::Exited(1),
                    lost_ticket: Some(Ticket::new("input", 3)),
                },
            ),
        ],
        feeders: Vec::new(),
        undrained: Vec::new(),
        prints: 0,
        timed_out: false,
        errors: Vec::new(),
        elapsed: std::time::Duration::from_millis(1500),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procbroker::Ticket;
    use procbroker::signals::TerminationReason;
    use serde_json::json;

    #[test]
    fn test_value_text() {
        assert_eq!(value_text(&json!("plain")), "plain");
        assert_eq!(value_text(&json!(4)), "4");
        assert_eq!(value_text(&json!({"a": 1})), "{\"a\":1}");
    }

    #[test]
    fn test_state_text_names_lost_ticket() {
        let state = WorkerState::Crashed {
            reason: TerminationReason::Exited(3),
            lost_ticket: Some(Ticket::new("input", 7)),
        };
        let text = state_text(&state);
        assert!(text.starts_with("crashed: "));
        assert!(text.ends_with("lost input;_TID_7;"));
        assert_eq!(state_text(&WorkerState::Finished), "finished");
    }

    #[test]
    fn test_limit() {
        assert_eq!(TableOptions { limit: 0, ascii: false }.take(9), 9);
        assert_eq!(TableOptions { limit: 5, ascii: false }.take(9), 5);
        assert_eq!(TableOptions { limit: 50, ascii: false }.take(9), 9);
    }
}
