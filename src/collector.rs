//! Result, telemetry and print collectors.
//!
//! One background thread per fan-in queue. Each owns its aggregate
//! exclusively and hands it back on [`Collectors::join`]; the only value
//! shared while the job runs is the live progress snapshot.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::chunk::ResultChunk;
use crate::error::{BrokerError, Result};
use crate::queue::{QueueSet, TransportQueue};
use crate::shutdown::CancellationToken;
use crate::spawn::spawn_thread;
use crate::telemetry::{ProgressSnapshot, ProgressTracker, TelemetrySample};

/// Results keyed by queue name, then ticket sequence number.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultStore {
    entries: HashMap<String, BTreeMap<u64, Vec<Value>>>,
    overwritten: u64,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a result. A second result for the same ticket replaces the
    /// first; returns `true` when that happened.
    pub fn insert(&mut self, result: ResultChunk) -> bool {
        let ResultChunk { ticket, payload } = result;
        let replaced = self
            .entries
            .entry(ticket.queue_name.clone())
            .or_default()
            .insert(ticket.seq, payload)
            .is_some();
        if replaced {
            self.overwritten += 1;
            warn!(ticket = %ticket, "Duplicate result for ticket, keeping the latest");
        }
        replaced
    }

    pub fn get(&self, queue: &str, seq: u64) -> Option<&[Value]> {
        self.entries
            .get(queue)
            .and_then(|tickets| tickets.get(&seq))
            .map(Vec::as_slice)
    }

    /// Results for one queue in ticket order.
    pub fn ordered(&self, queue: &str) -> impl Iterator<Item = (u64, &[Value])> {
        self.entries
            .get(queue)
            .into_iter()
            .flat_map(|tickets| tickets.iter().map(|(seq, v)| (*seq, v.as_slice())))
    }

    /// Every payload value for one queue, in ticket order.
    pub fn flatten(&self, queue: &str) -> Vec<Value> {
        self.ordered(queue)
            .flat_map(|(_, values)| values.iter().cloned())
            .collect()
    }

    pub fn tickets(&self, queue: &str) -> Vec<u64> {
        self.ordered(queue).map(|(seq, _)| seq).collect()
    }

    /// Queue names with at least one result, sorted.
    pub fn queues(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of stored tickets across all queues.
    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many results replaced an earlier one.
    pub fn overwritten(&self) -> u64 {
        self.overwritten
    }
}

/// What the collectors hand back after the job.
#[derive(Debug, Clone)]
pub struct CollectorReport {
    pub results: ResultStore,
    pub progress: ProgressSnapshot,
    pub prints: u64,
}

/// Drain `queue` into `state` until `stop` fires, then take whatever is
/// still queued without waiting.
fn collect<T, S>(
    queue: TransportQueue<T>,
    stop: CancellationToken,
    mut state: S,
    mut fold: impl FnMut(&mut S, T),
) -> S {
    loop {
        match queue.get(&stop) {
            Ok(item) => fold(&mut state, item),
            Err(BrokerError::Cancelled) => break,
            Err(e) => {
                warn!(queue = queue.name(), error = %e, "Collector queue failed");
                break;
            }
        }
    }
    let mut late = 0usize;
    while let Some(item) = queue.try_get() {
        fold(&mut state, item);
        late += 1;
    }
    debug!(queue = queue.name(), late, "Collector stopped");
    state
}

/// Cancel `stop` when a later collector fails to start, so the ones
/// already running exit.
fn cancel_on_err<T>(stop: &CancellationToken, result: Result<T>) -> Result<T> {
    if result.is_err() {
        stop.cancel();
    }
    result
}

/// The three collector threads of one job.
pub struct Collectors {
    output: JoinHandle<ResultStore>,
    info: JoinHandle<ProgressTracker>,
    print: JoinHandle<u64>,
    live: Arc<Mutex<ProgressSnapshot>>,
    started: Instant,
}

impl Collectors {
    /// Start collecting from the queue set's output, info and print queues.
    ///
    /// Collectors run until `stop` is cancelled.
    pub fn start(
        queues: &QueueSet,
        stop: &CancellationToken,
        expected_total: Option<u64>,
        started: Instant,
    ) -> Result<Self> {
        let tracker = ProgressTracker::new(expected_total);
        let live = Arc::new(Mutex::new(tracker.snapshot_at(started.elapsed())));

        let output = {
            let (queue, stop) = (queues.output.clone(), stop.clone());
            spawn_thread("collector-output", move || {
                collect(queue, stop, ResultStore::new(), |store, result| {
                    store.insert(result);
                })
            })?
        };

        let info = {
            let (queue, info_stop, live) = (queues.info.clone(), stop.clone(), live.clone());
            let handle = spawn_thread("collector-info", move || {
                collect(queue, info_stop, tracker, |tracker, sample: TelemetrySample| {
                    let elapsed = started.elapsed();
                    tracker.record(&sample, elapsed);
                    let snapshot = tracker.snapshot_at(elapsed);
                    *live.lock().unwrap_or_else(PoisonError::into_inner) = snapshot;
                })
            });
            cancel_on_err(stop, handle)?
        };

        let print = {
            let (queue, print_stop) = (queues.print.clone(), stop.clone());
            let handle = spawn_thread("collector-print", move || {
                collect(queue, print_stop, 0u64, |count, line: String| {
                    info!(target: "procbroker::print", "{}", line);
                    *count += 1;
                })
            });
            cancel_on_err(stop, handle)?
        };

        Ok(Self {
            output,
            info,
            print,
            live,
            started,
        })
    }

    /// Latest progress estimate.
    pub fn progress(&self) -> ProgressSnapshot {
        let mut snapshot = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        snapshot.elapsed = self.started.elapsed();
        snapshot
    }

    /// Wait for every collector to stop and return their aggregates.
    ///
    /// The stop token passed to [`Collectors::start`] must be cancelled first.
    pub fn join(self) -> Result<CollectorReport> {
        let panicked = |name: &str| BrokerError::Worker(format!("{} collector panicked", name));
        let results = self.output.join().map_err(|_| panicked("output"))?;
        let tracker = self.info.join().map_err(|_| panicked("info"))?;
        let prints = self.print.join().map_err(|_| panicked("print"))?;
        Ok(CollectorReport {
            results,
            progress: tracker.snapshot_at(self.started.elapsed()),
            prints,
        })
    }
}
