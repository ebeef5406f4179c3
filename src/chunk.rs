//! Chunks, tickets and the work item framer.
//!
//! A [`Chunk`] is one transport unit: a [`Ticket`] naming its destination
//! queue and sequence number, followed by up to `batch_size` work items.
//! End of stream is a distinct [`WorkItem::EndOfStream`] variant, so no
//! payload value can be mistaken for it.

use std::fmt;
use std::iter::Peekable;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BrokerError, Result};

/// Prefix in front of the sequence number in the textual header form.
pub const TICKET_PREFIX: &str = "_TID_";

/// Identifies one chunk: the queue it was framed for and its sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ticket {
    pub queue_name: String,
    pub seq: u64,
}

impl Ticket {
    pub fn new(queue_name: impl Into<String>, seq: u64) -> Self {
        Self {
            queue_name: queue_name.into(),
            seq,
        }
    }
}

/// Renders the header as `"{queue_name};_TID_{seq};"`.
impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{}{};", self.queue_name, TICKET_PREFIX, self.seq)
    }
}

impl FromStr for Ticket {
    type Err = BrokerError;

    fn from_str(header: &str) -> Result<Self> {
        let mut parts = header.split(';');
        let (Some(queue), Some(ticket), Some(""), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(BrokerError::malformed(
                header,
                "expected '<queue>;<prefix><seq>;'",
            ));
        };
        if queue.is_empty() {
            return Err(BrokerError::malformed(header, "empty queue name"));
        }
        let digits = ticket
            .strip_prefix(TICKET_PREFIX)
            .ok_or_else(|| BrokerError::malformed(header, "missing ticket prefix"))?;
        let seq = digits
            .parse::<u64>()
            .map_err(|e| BrokerError::malformed(header, format!("bad sequence number: {}", e)))?;
        Ok(Self::new(queue, seq))
    }
}

/// One element of a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum WorkItem<T> {
    Payload(T),
    EndOfStream,
}

impl<T> WorkItem<T> {
    pub fn is_end(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }

    pub fn payload(&self) -> Option<&T> {
        match self {
            Self::Payload(value) => Some(value),
            Self::EndOfStream => None,
        }
    }
}

/// A ticketed batch of work items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk<T = Value> {
    pub ticket: Ticket,
    pub items: Vec<WorkItem<T>>,
}

impl<T> Chunk<T> {
    /// True if the end-of-stream marker appears anywhere in the chunk.
    pub fn is_terminal(&self) -> bool {
        self.items.iter().any(WorkItem::is_end)
    }

    pub fn payloads(&self) -> impl Iterator<Item = &T> {
        self.items.iter().filter_map(WorkItem::payload)
    }

    pub fn payload_count(&self) -> usize {
        self.payloads().count()
    }

    /// Convert every payload, keeping ticket and marker positions.
    pub fn try_map<U, E, F>(self, mut f: F) -> std::result::Result<Chunk<U>, E>
    where
        F: FnMut(T) -> std::result::Result<U, E>,
    {
        let items = self
            .items
            .into_iter()
            .map(|item| match item {
                WorkItem::Payload(value) => f(value).map(WorkItem::Payload),
                WorkItem::EndOfStream => Ok(WorkItem::EndOfStream),
            })
            .collect::<std::result::Result<Vec<_>, E>>()?;
        Ok(Chunk {
            ticket: self.ticket,
            items,
        })
    }
}

/// Output of a worker for one input ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultChunk {
    pub ticket: Ticket,
    pub payload: Vec<Value>,
}

impl ResultChunk {
    pub fn new(ticket: Ticket, payload: Vec<Value>) -> Self {
        Self { ticket, payload }
    }
}

/// Frames items pulled from a source into ticketed chunks.
///
/// Sequence numbers start at 1 and are never reused by one framer.
#[derive(Debug)]
pub struct Framer {
    queue_name: String,
    next_seq: u64,
}

impl Framer {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            next_seq: 1,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Sequence number the next chunk will carry.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    fn issue_ticket(&mut self) -> Ticket {
        let ticket = Ticket::new(self.queue_name.clone(), self.next_seq);
        self.next_seq += 1;
        ticket
    }

    /// Frame up to `batch_size` items from `source`.
    ///
    /// The source is peeked one element ahead: when the chunk takes the last
    /// element (or the source was already empty) the end-of-stream marker is
    /// appended to this chunk instead of producing a separate one.
    pub fn frame<I>(&mut self, source: &mut Peekable<I>, batch_size: usize) -> Chunk<I::Item>
    where
        I: Iterator,
    {
        let mut items = Vec::with_capacity(batch_size + 1);
        while items.len() < batch_size {
            match source.next() {
                Some(item) => items.push(WorkItem::Payload(item)),
                None => break,
            }
        }
        if source.peek().is_none() {
            items.push(WorkItem::EndOfStream);
        }
        Chunk {
            ticket: self.issue_ticket(),
            items,
        }
    }

    /// A marker-only chunk, used when a source is cut short.
    pub fn terminal<T>(&mut self) -> Chunk<T> {
        Chunk {
            ticket: self.issue_ticket(),
            items: vec![WorkItem::EndOfStream],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frame_all(source: Vec<i64>, batch_size: usize) -> Vec<Chunk<i64>> {
        let mut framer = Framer::new("q");
        let mut source = source.into_iter().peekable();
        let mut chunks = Vec::new();
        loop {
            let chunk = framer.frame(&mut source, batch_size);
            let done = chunk.is_terminal();
            chunks.push(chunk);
            if done {
                return chunks;
            }
        }
    }

    #[test]
    fn test_ticket_header_format() {
        let ticket = Ticket::new("blue", 7);
        assert_eq!(ticket.to_string(), "blue;_TID_7;");
        assert_eq!("blue;_TID_7;".parse::<Ticket>().unwrap(), ticket);
    }

    #[test]
    fn test_ticket_parse_rejects_malformed() {
        for header in ["", "blue", "blue;_TID_7", ";_TID_7;", "blue;7;", "blue;_TID_x;", "a;_TID_1;b;"] {
            let err = header.parse::<Ticket>().unwrap_err();
            assert!(
                matches!(err, BrokerError::MalformedHeader { .. }),
                "{header:?} should be malformed"
            );
        }
    }

    #[test]
    fn test_scenario_five_items_batch_two() {
        let chunks = frame_all(vec![1, 2, 3, 4, 5], 2);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].ticket, Ticket::new("q", 1));
        assert_eq!(
            chunks[0].items,
            vec![WorkItem::Payload(1), WorkItem::Payload(2)]
        );
        assert_eq!(
            chunks[1].items,
            vec![WorkItem::Payload(3), WorkItem::Payload(4)]
        );
        assert_eq!(chunks[2].ticket.seq, 3);
        assert_eq!(
            chunks[2].items,
            vec![WorkItem::Payload(5), WorkItem::EndOfStream]
        );
    }

    #[test]
    fn test_empty_source_yields_single_marker_chunk() {
        let chunks = frame_all(vec![], 4);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].items, vec![WorkItem::EndOfStream]);
        assert_eq!(chunks[0].payload_count(), 0);
    }

    #[test]
    fn test_exact_multiple_marks_last_full_chunk() {
        let chunks = frame_all(vec![1, 2, 3, 4], 2);
        assert_eq!(chunks.len(), 2);
        assert!(!chunks[0].is_terminal());
        assert_eq!(chunks[1].payload_count(), 2);
        assert!(chunks[1].is_terminal());
    }

    #[test]
    fn test_terminal_continues_sequence() {
        let mut framer = Framer::new("q");
        let mut source = (0..10).peekable();
        let first = framer.frame(&mut source, 3);
        let cut: Chunk<i32> = framer.terminal();
        assert_eq!(first.ticket.seq, 1);
        assert_eq!(cut.ticket.seq, 2);
        assert!(cut.is_terminal());
        assert_eq!(framer.next_seq(), 3);
    }

    #[test]
    fn test_infinite_source_is_framed_lazily() {
        let mut framer = Framer::new("ports");
        let mut source = (1u64..).peekable();
        let chunk = framer.frame(&mut source, 4);
        assert_eq!(chunk.payloads().copied().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert!(!chunk.is_terminal());
        assert_eq!(source.next(), Some(5));
    }

    #[test]
    fn test_try_map_keeps_marker() {
        let chunk = Chunk {
            ticket: Ticket::new("q", 1),
            items: vec![WorkItem::Payload(2), WorkItem::EndOfStream],
        };
        let mapped: Chunk<Value> = chunk.try_map(serde_json::to_value).unwrap();
        assert_eq!(mapped.items[0], WorkItem::Payload(Value::from(2)));
        assert!(mapped.is_terminal());
    }

    #[test]
    fn test_work_item_wire_shape() {
        let item: WorkItem<Value> = WorkItem::EndOfStream;
        let json = serde_json::to_string(&item).unwrap();
        assert_eq!(json, r#"{"kind":"end_of_stream"}"#);

        // A payload that looks like a sentinel string stays a payload.
        let item = WorkItem::Payload(Value::from("None"));
        let back: WorkItem<Value> =
            serde_json::from_str(&serde_json::to_string(&item).unwrap()).unwrap();
        assert!(!back.is_end());
    }

    proptest! {
        #[test]
        fn prop_tickets_strictly_increase(len in 0usize..200, batch in 1usize..17) {
            let chunks = frame_all((0..len as i64).collect(), batch);
            for pair in chunks.windows(2) {
                prop_assert!(pair[0].ticket.seq < pair[1].ticket.seq);
            }
        }

        #[test]
        fn prop_chunk_count_and_single_marker(len in 1usize..200, batch in 1usize..17) {
            let chunks = frame_all((0..len as i64).collect(), batch);
            prop_assert_eq!(chunks.len(), len.div_ceil(batch));

            let markers: usize = chunks
                .iter()
                .map(|c| c.items.iter().filter(|i| i.is_end()).count())
                .sum();
            prop_assert_eq!(markers, 1);
            prop_assert!(chunks.last().unwrap().is_terminal());

            let payloads: Vec<i64> = chunks.iter().flat_map(|c| c.payloads().copied()).collect();
            prop_assert_eq!(payloads, (0..len as i64).collect::<Vec<_>>());
        }
    }
}
