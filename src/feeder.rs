//! The feeder: the single producer for one input queue.
//!
//! Pulls a lazy, possibly infinite, non-restartable source, frames it into
//! ticketed chunks and pushes them onto the queue, waiting (with stop
//! checks) while the queue is full.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::chunk::{Chunk, Framer};
use crate::error::{BrokerError, Result};
use crate::queue::InputQueue;
use crate::shutdown::ShutdownCoordinator;

/// How a feeder run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeederOutcome {
    /// The source ran dry; the last chunk carried the end-of-stream marker.
    Exhausted,
    /// Soft shutdown cut the source; a marker-only chunk was pushed.
    Drained,
    /// Hard stop; the chunk being pushed was abandoned.
    Cancelled,
}

/// Summary of one feeder run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeederReport {
    pub queue: String,
    pub chunks_sent: u64,
    pub items_sent: u64,
    /// Sequence number of the last chunk actually enqueued.
    pub last_ticket: Option<u64>,
    pub outcome: FeederOutcome,
}

/// Frames a source onto one input queue.
#[derive(Debug)]
pub struct Feeder {
    queue: InputQueue,
    batch_size: usize,
    framer: Framer,
}

impl Feeder {
    pub fn new(queue: InputQueue, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(BrokerError::InvalidConfig(
                "batch_size must be greater than 0".to_string(),
            ));
        }
        let framer = Framer::new(queue.name());
        Ok(Self {
            queue,
            batch_size,
            framer,
        })
    }

    /// Run until the source is exhausted, soft shutdown cuts it, or hard stop.
    #[instrument(level = "debug", skip_all, fields(queue = %self.queue.name(), batch_size = self.batch_size))]
    pub fn run<I, T>(mut self, source: I, shutdown: &ShutdownCoordinator) -> Result<FeederReport>
    where
        I: IntoIterator<Item = T>,
        T: Serialize,
    {
        let mut source = source.into_iter().peekable();
        let mut report = FeederReport {
            queue: self.queue.name().to_string(),
            chunks_sent: 0,
            items_sent: 0,
            last_ticket: None,
            outcome: FeederOutcome::Cancelled,
        };

        loop {
            if shutdown.is_stopped() {
                break;
            }

            let draining = shutdown.is_draining();
            let chunk = if draining {
                self.framer.terminal()
            } else {
                self.framer.frame(&mut source, self.batch_size)
            };
            let terminal = chunk.is_terminal();
            let items = chunk.payload_count() as u64;
            let seq = chunk.ticket.seq;
            let chunk = match chunk.try_map(serde_json::to_value) {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.close(shutdown);
                    return Err(e.into());
                }
            };

            match self.queue.put(chunk, shutdown.stop_token()) {
                Ok(()) => {}
                Err(BrokerError::Cancelled) => {
                    debug!(ticket = seq, "Hard stop while waiting for queue space");
                    break;
                }
                Err(e) => {
                    self.close(shutdown);
                    return Err(e);
                }
            }

            report.chunks_sent += 1;
            report.items_sent += items;
            report.last_ticket = Some(seq);

            if terminal {
                report.outcome = if draining {
                    FeederOutcome::Drained
                } else {
                    FeederOutcome::Exhausted
                };
                break;
            }
        }

        info!(
            queue = %report.queue,
            chunks = report.chunks_sent,
            items = report.items_sent,
            outcome = ?report.outcome,
            "Feeder finished"
        );
        Ok(report)
    }

    /// Push a marker-only chunk after a failure so the workers on this
    /// queue still see the end of the stream.
    fn close(&mut self, shutdown: &ShutdownCoordinator) {
        let terminal: Chunk<Value> = self.framer.terminal();
        let seq = terminal.ticket.seq;
        match self.queue.put(terminal, shutdown.stop_token()) {
            Ok(()) => warn!(
                queue = self.queue.name(),
                ticket = seq,
                "Feeder failed, queue closed early"
            ),
            Err(e) => debug!(queue = self.queue.name(), error = %e, "Could not close queue"),
        }
    }
}
