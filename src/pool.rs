//! Process pool manager.
//!
//! Spawns the worker processes of every [`WorkerGroup`], wires each one to
//! the shared queues through a link thread, and owns the job lifecycle
//! through [`PoolHandle`].
//!
//! # Architecture
//!
//! ```text
//!   feeder threads ──► input queues ◄── link threads ◄──► worker processes
//!                                            │              (stdin/stdout)
//!                                            ▼
//!                            output / info / print queues
//!                                            │
//!                                            ▼
//!                                   collector threads
//! ```
//!
//! A worker that dies is not restarted. Its link records the termination
//! reason and the ticket that was in flight, which is lost.
//!
//! [`WorkerGroup`]: crate::config::WorkerGroup

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::chunk::{Chunk, Framer, Ticket};
use crate::collector::{Collectors, ResultStore};
use crate::config::{BrokerConfig, WorkerCommand};
use crate::error::{BrokerError, Result};
use crate::feeder::{Feeder, FeederOutcome, FeederReport};
use crate::ipc::{LineReader, PipeFd};
use crate::proc::Proc;
use crate::protocol::{ParentMessage, WorkerMessage};
use crate::queue::{Pulled, QueueSet, TransportQueue};
use crate::shutdown::{CancellationToken, ShutdownCoordinator, ShutdownPhase};
use crate::signals::TerminationReason;
use crate::spawn::{pin_to_cpus, spawn_thread, spawn_worker};
use crate::telemetry::ProgressSnapshot;

/// Lifecycle of one worker process as seen by the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkerState {
    /// Spawned, `ready` not seen yet.
    Starting,
    Running,
    /// Reported that every role is done.
    Finished,
    /// Died without finishing. The chunk it held, if any, is lost.
    Crashed {
        reason: TerminationReason,
        lost_ticket: Option<Ticket>,
    },
    /// Stopped by hard shutdown.
    Stopped { reason: TerminationReason },
}

impl WorkerState {
    pub fn is_crashed(&self) -> bool {
        matches!(self, Self::Crashed { .. })
    }
}

#[derive(Debug)]
struct LinkShared {
    state: Mutex<WorkerState>,
    chunks: AtomicU64,
}

impl LinkShared {
    fn set_state(&self, state: WorkerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// One spawned worker process. Its identity and queue never change.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub id: usize,
    pub name: String,
    pub pid: u32,
    /// CPUs the process was pinned to.
    pub cpus: Option<Vec<usize>>,
    pub input_queue: String,
    shared: Arc<LinkShared>,
}

impl WorkerHandle {
    pub fn state(&self) -> WorkerState {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Chunks handed to this worker so far.
    pub fn chunks_dispatched(&self) -> u64 {
        self.shared.chunks.load(Ordering::Relaxed)
    }

    fn report(&self) -> WorkerReport {
        WorkerReport {
            id: self.id,
            name: self.name.clone(),
            pid: self.pid,
            cpus: self.cpus.clone(),
            input_queue: self.input_queue.clone(),
            state: self.state(),
            chunks: self.chunks_dispatched(),
        }
    }
}

/// Final state of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub id: usize,
    pub name: String,
    pub pid: u32,
    pub cpus: Option<Vec<usize>>,
    pub input_queue: String,
    pub state: WorkerState,
    pub chunks: u64,
}

/// Everything a job produced, readable once every process and thread is joined.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub results: ResultStore,
    pub progress: ProgressSnapshot,
    pub workers: Vec<WorkerReport>,
    pub feeders: Vec<FeederReport>,
    /// Queues that still held items when the job ended.
    pub undrained: Vec<(String, usize)>,
    pub prints: u64,
    /// Workers did not drain within the drain timeout.
    pub timed_out: bool,
    /// Feeder failures and thread panics.
    pub errors: Vec<String>,
    pub elapsed: Duration,
}

impl JobReport {
    pub fn crashed(&self) -> impl Iterator<Item = &WorkerReport> {
        self.workers.iter().filter(|w| w.state.is_crashed())
    }

    /// True when every source was exhausted, every worker finished and
    /// nothing was left behind.
    pub fn is_complete(&self) -> bool {
        !self.timed_out
            && self.errors.is_empty()
            && self.undrained.is_empty()
            && self.workers.iter().all(|w| w.state == WorkerState::Finished)
            && self
                .feeders
                .iter()
                .all(|f| f.outcome == FeederOutcome::Exhausted)
    }
}

/// Reads worker messages off the pipe and forwards them to the link.
fn read_messages(worker: &str, mut reader: LineReader<PipeFd>, tx: Sender<WorkerMessage>) {
    loop {
        let parsed = match reader.read_line() {
            Ok(Some(line)) => WorkerMessage::from_line(line),
            Ok(None) => break,
            Err(e) => {
                warn!(worker, error = %e, "Failed to read from worker");
                break;
            }
        };
        match parsed {
            Ok(message) => {
                if tx.send(message).is_err() {
                    break;
                }
            }
            Err(e) => warn!(worker, error = %e, "Dropping invalid line from worker"),
        }
    }
}

/// Manager-side connection to one worker process.
struct Link {
    name: String,
    proc: Proc,
    init: ParentMessage,
    input_queue: String,
    queues: QueueSet,
    stop: CancellationToken,
    shared: Arc<LinkShared>,
    poll_interval: Duration,
    stop_grace: Duration,
    /// Last chunk handed out and not yet acknowledged by a pull or round.
    in_flight: Option<Ticket>,
    finished: bool,
    /// Writing to the worker failed; only drain what it already sent.
    broken: bool,
}

impl Link {
    #[instrument(level = "debug", skip_all, fields(worker = %self.name))]
    fn run(mut self) {
        let reader_thread = match self.proc.take_reader() {
            Some(reader) => {
                let (tx, rx) = crossbeam_channel::unbounded();
                let worker = self.name.clone();
                match spawn_thread(format!("{}-reader", self.name), move || {
                    read_messages(&worker, reader, tx)
                }) {
                    Ok(handle) => Some((handle, rx)),
                    Err(e) => {
                        error!(error = %e, "Failed to start reader thread");
                        None
                    }
                }
            }
            None => None,
        };
        let Some((reader_thread, rx)) = reader_thread else {
            let reason = self
                .proc
                .stop(self.stop_grace)
                .unwrap_or(TerminationReason::Unknown);
            self.shared.set_state(WorkerState::Crashed {
                reason,
                lost_ticket: None,
            });
            return;
        };

        let stopped = loop {
            if self.stop.is_cancelled() {
                break true;
            }
            let message = match rx.recv_timeout(self.poll_interval) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break false,
            };
            if let Err(e) = self.handle(message) {
                warn!(error = %e, "Lost connection to worker");
                self.broken = true;
            }
        };

        let reason = if stopped {
            self.proc.stop(self.stop_grace)
        } else {
            match self.proc.wait_timeout(self.stop_grace) {
                Ok(Some(reason)) => Ok(reason),
                Ok(None) => self.proc.stop(self.stop_grace),
                Err(e) => Err(e),
            }
        };
        let reason = reason.unwrap_or_else(|e| {
            warn!(error = %e, "Could not reap worker");
            TerminationReason::Unknown
        });
        if reader_thread.join().is_err() {
            error!("Reader thread panicked");
        }

        let state = if self.finished {
            debug!(%reason, "Worker finished");
            WorkerState::Finished
        } else if stopped {
            debug!(%reason, "Worker stopped");
            WorkerState::Stopped { reason }
        } else {
            warn!(
                %reason,
                lost_ticket = ?self.in_flight.as_ref().map(ToString::to_string),
                "Worker died; its in-flight chunk is lost and it will not be restarted"
            );
            WorkerState::Crashed {
                reason,
                lost_ticket: self.in_flight.take(),
            }
        };
        self.shared.set_state(state);
    }

    fn send(&mut self, message: &ParentMessage) -> Result<()> {
        if self.broken {
            return Ok(());
        }
        self.proc.send(message)
    }

    fn handle(&mut self, message: WorkerMessage) -> Result<()> {
        match message {
            WorkerMessage::Ready => {
                let init = self.init.clone();
                self.send(&init)?;
                self.shared.set_state(WorkerState::Running);
                debug!("Worker ready");
            }
            WorkerMessage::Pull { queue } => {
                self.in_flight = None;
                let name = queue.as_deref().unwrap_or(&self.input_queue);
                let input = match self.queues.input(name) {
                    Ok(input) => input.clone(),
                    Err(e) => return self.send(&ParentMessage::error(e.to_string())),
                };
                match input.next_for_worker(&self.stop) {
                    Pulled::Chunk(chunk) => {
                        trace!(ticket = %chunk.ticket, items = chunk.items.len(), "Dispatching chunk");
                        self.in_flight = Some(chunk.ticket.clone());
                        self.shared.chunks.fetch_add(1, Ordering::Relaxed);
                        self.send(&ParentMessage::chunk(chunk))?;
                    }
                    Pulled::EndOfStream => self.send(&ParentMessage::EndOfStream)?,
                    Pulled::Cancelled => self.send(&ParentMessage::Exit)?,
                }
            }
            WorkerMessage::Result { result } => route(&self.queues.output, result, &self.stop),
            WorkerMessage::Telemetry { sample } => route(&self.queues.info, sample, &self.stop),
            WorkerMessage::Print { line } => {
                let line = format!("[{}] {}", self.name, line);
                route(&self.queues.print, line, &self.stop);
            }
            WorkerMessage::Round { busy } => {
                self.in_flight = None;
                if !busy {
                    self.finished = true;
                }
            }
            WorkerMessage::Error { message } => {
                warn!(%message, "Worker reported an error");
            }
        }
        Ok(())
    }
}

fn route<T>(queue: &TransportQueue<T>, item: T, stop: &CancellationToken) {
    match queue.put(item, stop) {
        Ok(()) => {}
        Err(BrokerError::Cancelled) => debug!(queue = queue.name(), "Dropped item at hard stop"),
        Err(e) => warn!(queue = queue.name(), error = %e, "Failed to route worker message"),
    }
}

/// Start a job: spawn every worker and the collectors.
pub fn start(config: BrokerConfig) -> Result<PoolHandle> {
    PoolHandle::start(config)
}

/// Handle to a running job.
pub struct PoolHandle {
    config: BrokerConfig,
    queues: QueueSet,
    shutdown: ShutdownCoordinator,
    workers: Vec<WorkerHandle>,
    links: Vec<JoinHandle<()>>,
    feeders: Vec<(String, JoinHandle<Result<FeederReport>>)>,
    collectors: Option<Collectors>,
    started: Instant,
}

impl PoolHandle {
    pub fn start(config: BrokerConfig) -> Result<Self> {
        config.validate()?;
        let command = config.worker_command()?;
        let started = Instant::now();
        let shutdown = ShutdownCoordinator::new();
        let queues = QueueSet::new(
            config.groups.iter().map(|g| g.input_queue.as_str()),
            config.queue_capacity(),
            config.poll_interval,
        );
        let collectors = Collectors::start(
            &queues,
            shutdown.stop_token(),
            config.expected_items,
            started,
        )?;

        info!(
            groups = config.groups.len(),
            processes = config.total_processes(),
            batch_size = config.batch_size,
            queue_capacity = config.queue_capacity(),
            "Starting worker pool"
        );

        let mut pool = Self {
            config,
            queues,
            shutdown,
            workers: Vec::new(),
            links: Vec::new(),
            feeders: Vec::new(),
            collectors: Some(collectors),
            started,
        };
        if let Err(e) = pool.spawn_workers(&command) {
            error!(error = %e, "Failed to start worker pool");
            if let Err(cleanup) = pool.abort() {
                warn!(error = %cleanup, "Cleanup after failed start also failed");
            }
            return Err(e);
        }
        info!(workers = pool.workers.len(), "All workers spawned");
        Ok(pool)
    }

    fn spawn_workers(&mut self, command: &WorkerCommand) -> Result<()> {
        let mut id = 0;
        for group in self.config.groups.clone() {
            for index in 0..group.processes {
                let name = format!("{}-{}", group.input_queue, index);
                let proc = spawn_worker(command, id)?;
                let pid = proc.pid();

                let cpus = self.config.pinning.cpus_for(id).and_then(|cpus| {
                    match pin_to_cpus(pid, &cpus) {
                        Ok(()) => Some(cpus),
                        Err(e) => {
                            warn!(worker = %name, error = %e, "CPU pinning failed, running unpinned");
                            None
                        }
                    }
                });

                let shared = Arc::new(LinkShared {
                    state: Mutex::new(WorkerState::Starting),
                    chunks: AtomicU64::new(0),
                });
                let link = Link {
                    name: name.clone(),
                    proc,
                    init: ParentMessage::Init {
                        worker_id: id,
                        name: name.clone(),
                        roles: group.roles.clone(),
                        input_queue: group.input_queue.clone(),
                        process_count: group.processes,
                        tools: self.config.tools.clone(),
                        settings: self.config.settings.clone(),
                        telemetry: self.config.telemetry,
                    },
                    input_queue: group.input_queue.clone(),
                    queues: self.queues.clone(),
                    stop: self.shutdown.stop_token().clone(),
                    shared: shared.clone(),
                    poll_interval: self.config.poll_interval,
                    stop_grace: self.config.stop_grace,
                    in_flight: None,
                    finished: false,
                    broken: false,
                };
                let handle = spawn_thread(format!("link-{}", name), move || link.run())?;

                debug!(worker = %name, id, pid = pid.as_raw(), ?cpus, "Spawned worker");
                self.links.push(handle);
                self.workers.push(WorkerHandle {
                    id,
                    name,
                    pid: pid.as_raw() as u32,
                    cpus,
                    input_queue: group.input_queue.clone(),
                    shared,
                });
                id += 1;
            }
        }
        Ok(())
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    pub fn queues(&self) -> &QueueSet {
        &self.queues
    }

    pub fn phase(&self) -> ShutdownPhase {
        self.shutdown.phase()
    }

    /// Coordinator for signal handlers and other threads.
    pub fn stop_handle(&self) -> ShutdownCoordinator {
        self.shutdown.clone()
    }

    /// Latest progress estimate from worker telemetry.
    pub fn progress(&self) -> ProgressSnapshot {
        match &self.collectors {
            Some(collectors) => collectors.progress(),
            None => ProgressSnapshot::default(),
        }
    }

    /// Feed `source` into `queue` on a background thread, using the
    /// configured batch size.
    pub fn run_feeder<I, T>(&mut self, source: I, queue: &str) -> Result<()>
    where
        I: IntoIterator<Item = T> + Send + 'static,
        T: Serialize,
    {
        let batch_size = self.config.batch_size;
        self.run_feeder_with_batch(source, queue, batch_size)
    }

    /// Feed `source` into `queue` in chunks of `batch_size`.
    ///
    /// At most one feeder per queue; none once shutdown has begun.
    pub fn run_feeder_with_batch<I, T>(
        &mut self,
        source: I,
        queue: &str,
        batch_size: usize,
    ) -> Result<()>
    where
        I: IntoIterator<Item = T> + Send + 'static,
        T: Serialize,
    {
        if self.shutdown.is_draining() {
            return Err(BrokerError::ShutdownStarted);
        }
        let input = self.queues.input(queue)?.clone();
        let feeder = Feeder::new(input.clone(), batch_size)?;
        input.attach_feeder()?;

        let shutdown = self.shutdown.clone();
        let handle = spawn_thread(format!("feeder-{}", queue), move || {
            feeder.run(source, &shutdown)
        })?;
        self.feeders.push((queue.to_string(), handle));
        Ok(())
    }

    /// Wait for every feeder to exhaust its source, let the workers drain,
    /// then stop and join everything.
    pub fn join(self) -> Result<JobReport> {
        self.finish()
    }

    /// Cut every source now, let queued chunks drain, then stop and join.
    pub fn shutdown(self) -> Result<JobReport> {
        self.begin_drain();
        self.finish()
    }

    /// Stop everything at the next poll and join.
    pub fn abort(self) -> Result<JobReport> {
        self.shutdown.begin_hard_shutdown();
        self.finish()
    }

    fn all_links_finished(&self) -> bool {
        self.links.iter().all(JoinHandle::is_finished)
    }

    /// True once no worker is left to take chunks: every one finished,
    /// crashed or was stopped.
    pub fn workers_done(&self) -> bool {
        self.all_links_finished()
    }

    /// Enter soft shutdown. Queues that never got a feeder get a
    /// marker-only chunk so their workers can finish.
    fn begin_drain(&self) {
        if self.shutdown.begin_soft_shutdown() {
            info!("Soft shutdown: feeders stop pulling from their sources");
        }
        for input in self.queues.inputs() {
            if input.attach_feeder().is_ok() {
                let terminal: Chunk<Value> = Framer::new(input.name()).terminal();
                if let Err(e) = input.put(terminal, self.shutdown.stop_token()) {
                    debug!(queue = input.name(), error = %e, "Could not close unfed queue");
                }
            }
        }
    }

    fn finish(mut self) -> Result<JobReport> {
        let poll = self.config.poll_interval;

        // Feeders run until their sources are exhausted, unless nobody is
        // left to consume what they push.
        while !self.shutdown.is_stopped()
            && !self.feeders.iter().all(|(_, h)| h.is_finished())
            && !self.all_links_finished()
        {
            std::thread::sleep(poll);
        }
        self.begin_drain();

        let deadline = Instant::now() + self.config.drain_timeout;
        while !self.shutdown.is_stopped() && !self.all_links_finished() && Instant::now() < deadline
        {
            std::thread::sleep(poll);
        }
        let timed_out = !self.shutdown.is_stopped() && !self.all_links_finished();
        if timed_out {
            warn!(
                timeout = ?self.config.drain_timeout,
                undrained = ?self.queues.undrained(),
                "Workers did not drain in time, escalating to hard shutdown"
            );
        }
        self.shutdown.begin_hard_shutdown();

        let mut errors = Vec::new();
        for link in self.links.drain(..) {
            if link.join().is_err() {
                error!("Link thread panicked");
                errors.push("link thread panicked".to_string());
            }
        }

        let mut feeders = Vec::new();
        for (queue, handle) in self.feeders.drain(..) {
            match handle.join() {
                Ok(Ok(report)) => feeders.push(report),
                Ok(Err(e)) => {
                    error!(queue = %queue, error = %e, "Feeder failed");
                    errors.push(format!("feeder '{}': {}", queue, e));
                }
                Err(_) => {
                    error!(queue = %queue, "Feeder thread panicked");
                    errors.push(format!("feeder '{}' panicked", queue));
                }
            }
        }

        let collected = self
            .collectors
            .take()
            .ok_or_else(|| BrokerError::Worker("collectors already joined".into()))?
            .join()?;

        let undrained = self.queues.undrained();
        if !undrained.is_empty() {
            warn!(?undrained, "Queues still held items at shutdown");
        }
        self.shutdown.mark_joined();

        let report = JobReport {
            results: collected.results,
            progress: collected.progress,
            workers: self.workers.iter().map(WorkerHandle::report).collect(),
            feeders,
            undrained,
            prints: collected.prints,
            timed_out,
            errors,
            elapsed: self.started.elapsed(),
        };
        info!(
            results = report.results.len(),
            crashed = report.crashed().count(),
            elapsed = ?report.elapsed,
            "Job finished"
        );
        Ok(report)
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        // Dropped without join: stop every thread; links stop their processes.
        if self.collectors.is_some() {
            self.shutdown.begin_hard_shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerGroup;
    use nix::sys::signal::Signal;

    #[test]
    fn test_start_rejects_invalid_config() {
        let err = PoolHandle::start(BrokerConfig::default()).err().unwrap();
        assert!(matches!(err, BrokerError::InvalidConfig(_)));
    }

    #[test]
    fn test_start_fails_when_worker_cannot_spawn() {
        let config = BrokerConfig::default()
            .with_group(WorkerGroup::new("q", ["echo"]).with_processes(1))
            .with_worker_command(WorkerCommand::new("/nonexistent/procbroker"));
        let err = PoolHandle::start(config).err().unwrap();
        assert!(matches!(err, BrokerError::Worker(_)));
    }

    #[test]
    fn test_worker_that_exits_without_protocol_is_a_crash() {
        let config = BrokerConfig::default()
            .with_group(WorkerGroup::new("q", ["echo"]).with_processes(1))
            .with_worker_command(WorkerCommand::new("sh").arg("-c").arg("exit 3"))
            .with_poll_interval(Duration::from_millis(5));
        let pool = PoolHandle::start(config).unwrap();
        let report = pool.join().unwrap();

        assert_eq!(report.crashed().count(), 1);
        assert_eq!(
            report.workers[0].state,
            WorkerState::Crashed {
                reason: TerminationReason::Exited(3),
                lost_ticket: None
            }
        );
        assert!(!report.is_complete());
        assert!(report.results.is_empty());
    }

    #[test]
    fn test_abort_stops_unresponsive_worker() {
        // `cat` never answers, so only the stop escalation can end it.
        let config = BrokerConfig::default()
            .with_group(WorkerGroup::new("q", ["echo"]).with_processes(1))
            .with_worker_command(WorkerCommand::new("cat"))
            .with_poll_interval(Duration::from_millis(5))
            .with_stop_grace(Duration::from_millis(20));
        let pool = PoolHandle::start(config).unwrap();
        assert_eq!(pool.workers()[0].state(), WorkerState::Starting);

        let report = pool.abort().unwrap();
        assert_eq!(
            report.workers[0].state,
            WorkerState::Stopped {
                reason: TerminationReason::Signaled(Signal::SIGTERM)
            }
        );
    }

    #[test]
    fn test_feeder_guards() {
        let config = BrokerConfig::default()
            .with_group(WorkerGroup::new("q", ["echo"]).with_processes(1))
            .with_worker_command(WorkerCommand::new("cat"))
            .with_poll_interval(Duration::from_millis(5))
            .with_stop_grace(Duration::from_millis(20));
        let mut pool = PoolHandle::start(config).unwrap();

        assert!(matches!(
            pool.run_feeder(vec![1], "missing"),
            Err(BrokerError::UnknownQueue(_))
        ));
        assert!(matches!(
            pool.run_feeder_with_batch(vec![1], "q", 0),
            Err(BrokerError::InvalidConfig(_))
        ));
        pool.run_feeder(Vec::<u8>::new(), "q").unwrap();
        assert!(matches!(
            pool.run_feeder(vec![1], "q"),
            Err(BrokerError::FeederAttached(_))
        ));

        pool.stop_handle().begin_soft_shutdown();
        assert!(matches!(
            pool.run_feeder(vec![1], "q"),
            Err(BrokerError::ShutdownStarted)
        ));
        pool.abort().unwrap();
    }
}
