//! Wire protocol between the manager and worker processes.
//!
//! Messages are JSON-serialized and newline-delimited. The parent writes
//! [`ParentMessage`]s to the worker's stdin; the worker answers with
//! [`WorkerMessage`]s on its stdout. Stderr is left for logs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chunk::{Chunk, ResultChunk};
use crate::error::Result;
use crate::telemetry::TelemetrySample;

/// Message from the manager to a worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentMessage {
    /// First message after `ready`: who the worker is and what it runs.
    Init {
        worker_id: usize,
        name: String,
        /// Role names, run in this order every round.
        roles: Vec<String>,
        input_queue: String,
        process_count: usize,
        /// Shared read-only data, shipped once.
        #[serde(default)]
        tools: Value,
        #[serde(default)]
        settings: Value,
        telemetry: bool,
    },

    /// Answer to `pull`: the next chunk.
    Chunk { chunk: Chunk<Value> },

    /// Answer to `pull`: the stream on that queue is over.
    EndOfStream,

    /// Answer to a request the manager could not serve.
    Error { message: String },

    /// Stop after the current round.
    Exit,
}

/// Message from a worker process to the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Process is up and waiting for `init`.
    Ready,

    /// Request the next chunk. `queue` overrides the assigned input queue.
    Pull {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        queue: Option<String>,
    },

    Result { result: ResultChunk },

    Telemetry { sample: TelemetrySample },

    Print { line: String },

    /// End of one round over every active role.
    Round { busy: bool },

    /// A role failed; the worker keeps running its other roles.
    Error { message: String },
}

impl ParentMessage {
    pub fn chunk(chunk: Chunk<Value>) -> Self {
        Self::Chunk { chunk }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

impl WorkerMessage {
    pub fn pull(queue: Option<&str>) -> Self {
        Self::Pull {
            queue: queue.map(str::to_string),
        }
    }

    pub fn print(line: impl Into<String>) -> Self {
        Self::Print { line: line.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{Ticket, WorkItem};
    use serde_json::json;

    #[test]
    fn test_init_serialization() {
        let msg = ParentMessage::Init {
            worker_id: 3,
            name: "blue-3".into(),
            roles: vec!["square".into()],
            input_queue: "blue".into(),
            process_count: 4,
            tools: json!({"words": ["a"]}),
            settings: Value::Null,
            telemetry: true,
        };
        let line = msg.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert!(line.contains(r#""type":"init""#));
        assert_eq!(ParentMessage::from_line(&line).unwrap(), msg);
    }

    #[test]
    fn test_chunk_message_carries_ticket_struct() {
        let chunk = Chunk {
            ticket: Ticket::new("blue", 9),
            items: vec![WorkItem::Payload(json!(1)), WorkItem::EndOfStream],
        };
        let line = ParentMessage::chunk(chunk.clone()).to_line().unwrap();
        assert!(line.contains(r#""queue_name":"blue""#));
        match ParentMessage::from_line(&line).unwrap() {
            ParentMessage::Chunk { chunk: parsed } => assert_eq!(parsed, chunk),
            other => panic!("expected chunk, got {other:?}"),
        }
    }

    #[test]
    fn test_unit_variants() {
        assert_eq!(
            ParentMessage::EndOfStream.to_line().unwrap(),
            "{\"type\":\"end_of_stream\"}\n"
        );
        assert_eq!(
            WorkerMessage::Ready.to_line().unwrap(),
            "{\"type\":\"ready\"}\n"
        );
    }

    #[test]
    fn test_pull_queue_is_optional() {
        assert_eq!(
            WorkerMessage::from_line(r#"{"type":"pull"}"#).unwrap(),
            WorkerMessage::Pull { queue: None }
        );
        let line = WorkerMessage::pull(Some("yellow")).to_line().unwrap();
        assert_eq!(
            WorkerMessage::from_line(&line).unwrap(),
            WorkerMessage::Pull {
                queue: Some("yellow".into())
            }
        );
    }

    #[test]
    fn test_result_and_telemetry_messages() {
        let msg = WorkerMessage::Result {
            result: ResultChunk::new(Ticket::new("q", 2), vec![json!(4)]),
        };
        let back = WorkerMessage::from_line(&msg.to_line().unwrap()).unwrap();
        assert_eq!(back, msg);

        let msg = WorkerMessage::Telemetry {
            sample: TelemetrySample::done("w0", 2),
        };
        let back = WorkerMessage::from_line(&msg.to_line().unwrap()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_invalid_line_is_an_error() {
        assert!(WorkerMessage::from_line("not json").is_err());
        assert!(WorkerMessage::from_line(r#"{"type":"unknown"}"#).is_err());
        assert!(ParentMessage::from_line(r#"{"type":"chunk"}"#).is_err());
    }
}
