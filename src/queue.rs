//! Bounded transport queues shared between the manager's threads.
//!
//! Every blocking operation is a bounded wait (`send_timeout` /
//! `recv_timeout` of one poll interval) followed by a check of the
//! caller's [`CancellationToken`], so no loop can block past a stop request.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{
    Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError, bounded,
};
use serde_json::Value;

use crate::chunk::{Chunk, ResultChunk};
use crate::error::{BrokerError, Result};
use crate::shutdown::CancellationToken;
use crate::telemetry::TelemetrySample;

/// A bounded multi-producer, multi-consumer FIFO.
#[derive(Debug)]
pub struct TransportQueue<T> {
    name: String,
    tx: Sender<T>,
    rx: Receiver<T>,
    poll_interval: Duration,
}

impl<T> Clone for TransportQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            poll_interval: self.poll_interval,
        }
    }
}

impl<T> TransportQueue<T> {
    pub fn new(name: impl Into<String>, capacity: usize, poll_interval: Duration) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            name: name.into(),
            tx,
            rx,
            poll_interval,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Push an item, waiting for room. Never drops the item silently:
    /// it is either enqueued or the call returns `Cancelled`.
    pub fn put(&self, item: T, token: &CancellationToken) -> Result<()> {
        let mut item = item;
        loop {
            if token.is_cancelled() {
                return Err(BrokerError::Cancelled);
            }
            match self.tx.send_timeout(item, self.poll_interval) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(returned)) => item = returned,
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(BrokerError::Disconnected(self.name.clone()));
                }
            }
        }
    }

    /// Pop an item, waiting until one arrives or the token is cancelled.
    pub fn get(&self, token: &CancellationToken) -> Result<T> {
        loop {
            if token.is_cancelled() {
                return Err(BrokerError::Cancelled);
            }
            match self.rx.recv_timeout(self.poll_interval) {
                Ok(item) => return Ok(item),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(BrokerError::Disconnected(self.name.clone()));
                }
            }
        }
    }

    /// Pop an item without waiting.
    pub fn try_get(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Best effort; only a hint for whether a pop is worth attempting.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.rx.capacity()
    }
}

/// What a worker link got when asking an input queue for work.
#[derive(Debug)]
pub enum Pulled {
    Chunk(Chunk<Value>),
    /// The terminal chunk has already been handed out and nothing is left.
    EndOfStream,
    Cancelled,
}

/// An input queue: a transport queue of chunks plus end-of-stream tracking.
///
/// A single feeder writes to it, so the terminal chunk is the last one ever
/// enqueued. Once a link has taken it, later pulls on the empty queue are
/// answered with [`Pulled::EndOfStream`] so every sibling worker learns
/// that the stream is over.
#[derive(Debug, Clone)]
pub struct InputQueue {
    queue: TransportQueue<Chunk<Value>>,
    end_seen: Arc<AtomicBool>,
    feeder_attached: Arc<AtomicBool>,
}

impl InputQueue {
    pub fn new(name: impl Into<String>, capacity: usize, poll_interval: Duration) -> Self {
        Self {
            queue: TransportQueue::new(name, capacity, poll_interval),
            end_seen: Arc::new(AtomicBool::new(false)),
            feeder_attached: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        self.queue.name()
    }

    pub fn transport(&self) -> &TransportQueue<Chunk<Value>> {
        &self.queue
    }

    pub fn put(&self, chunk: Chunk<Value>, token: &CancellationToken) -> Result<()> {
        self.queue.put(chunk, token)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// True once the terminal chunk has been taken off this queue.
    pub fn end_seen(&self) -> bool {
        self.end_seen.load(Ordering::SeqCst)
    }

    /// Claim the single feeder slot for this queue.
    pub(crate) fn attach_feeder(&self) -> Result<()> {
        if self.feeder_attached.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::FeederAttached(self.name().to_string()));
        }
        Ok(())
    }

    /// Take the next chunk for a worker.
    pub fn next_for_worker(&self, token: &CancellationToken) -> Pulled {
        loop {
            if token.is_cancelled() {
                return Pulled::Cancelled;
            }
            if let Some(chunk) = self.queue.try_get() {
                return self.hand_out(chunk);
            }
            if self.end_seen() {
                return Pulled::EndOfStream;
            }
            match self.queue.rx.recv_timeout(self.queue.poll_interval) {
                Ok(chunk) => return self.hand_out(chunk),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Pulled::Cancelled,
            }
        }
    }

    fn hand_out(&self, chunk: Chunk<Value>) -> Pulled {
        if chunk.is_terminal() {
            self.end_seen.store(true, Ordering::SeqCst);
        }
        Pulled::Chunk(chunk)
    }
}

/// The full set of queues a job uses.
#[derive(Debug, Clone)]
pub struct QueueSet {
    inputs: HashMap<String, InputQueue>,
    pub output: TransportQueue<ResultChunk>,
    pub info: TransportQueue<TelemetrySample>,
    pub print: TransportQueue<String>,
}

impl QueueSet {
    /// Create one input queue per name plus the shared output, info and print queues.
    pub fn new<'a>(
        input_names: impl IntoIterator<Item = &'a str>,
        capacity: usize,
        poll_interval: Duration,
    ) -> Self {
        let inputs = input_names
            .into_iter()
            .map(|name| {
                (
                    name.to_string(),
                    InputQueue::new(name, capacity, poll_interval),
                )
            })
            .collect();
        // Results and telemetry fan in from every worker; give them more room.
        let fan_in = capacity.saturating_mul(4).max(1);
        Self {
            inputs,
            output: TransportQueue::new("output", fan_in, poll_interval),
            info: TransportQueue::new("info", fan_in, poll_interval),
            print: TransportQueue::new("print", fan_in, poll_interval),
        }
    }

    pub fn input(&self, name: &str) -> Result<&InputQueue> {
        self.inputs
            .get(name)
            .ok_or_else(|| BrokerError::UnknownQueue(name.to_string()))
    }

    pub fn inputs(&self) -> impl Iterator<Item = &InputQueue> {
        self.inputs.values()
    }

    /// Names and lengths of every non-empty queue.
    pub fn undrained(&self) -> Vec<(String, usize)> {
        let mut pending: Vec<(String, usize)> = self
            .inputs
            .values()
            .map(|q| (q.name().to_string(), q.len()))
            .chain([
                (self.output.name().to_string(), self.output.len()),
                (self.info.name().to_string(), self.info.len()),
                (self.print.name().to_string(), self.print.len()),
            ])
            .filter(|(_, len)| *len > 0)
            .collect();
        pending.sort();
        pending
    }
}
