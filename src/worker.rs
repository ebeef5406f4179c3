//! The contract every worker role implements, and what it gets to work with.
//!
//! A role is a [`Worker`]: each call to [`Worker::process_one_round`] pulls
//! at most one chunk through [`WorkerContext::input`], handles its items,
//! and reports whether more work may arrive. The context's handles talk to
//! the manager over the process's stdin/stdout, so a role never sees the
//! wire protocol.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde_json::Value;

use crate::chunk::{Chunk, ResultChunk, Ticket, WorkItem};
use crate::error::{BrokerError, Result};
use crate::ipc::{LineReader, LineWriter};
use crate::protocol::{ParentMessage, WorkerMessage};
use crate::telemetry::{SampleCount, TelemetrySample};

/// A worker role.
pub trait Worker {
    fn name(&self) -> &str;

    /// Run one round: pull at most one chunk and process it.
    ///
    /// Returns `Ok(true)` while more work may arrive and `Ok(false)` once the
    /// end of the stream has been seen. Every role reports completion the
    /// same way.
    fn process_one_round(&mut self, ctx: &mut WorkerContext) -> Result<bool>;
}

/// Who a worker process is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    /// Numeric id, unique across the pool. Useful for modulo role splits.
    pub worker_id: usize,
    pub name: String,
    pub pid: u32,
    pub input_queue: String,
    /// Processes in this worker's group.
    pub process_count: usize,
}

/// Line channel to the manager.
pub(crate) struct Channel {
    reader: LineReader<Box<dyn Read>>,
    writer: LineWriter<Box<dyn Write>>,
    exit_requested: bool,
}

impl Channel {
    pub(crate) fn new(reader: impl Read + 'static, writer: impl Write + 'static) -> Self {
        let reader: Box<dyn Read> = Box::new(reader);
        let writer: Box<dyn Write> = Box::new(writer);
        Self {
            reader: LineReader::new(reader),
            writer: LineWriter::new(writer),
            exit_requested: false,
        }
    }

    pub(crate) fn send(&mut self, message: &WorkerMessage) -> Result<()> {
        self.writer.write_line(&message.to_line()?)?;
        Ok(())
    }

    /// Next message from the manager; `None` once stdin is closed.
    ///
    /// Lines that do not parse are reported on the print channel and skipped.
    pub(crate) fn recv(&mut self) -> Result<Option<ParentMessage>> {
        loop {
            let parsed = match self.reader.read_line()? {
                Some(line) => ParentMessage::from_line(line),
                None => return Ok(None),
            };
            match parsed {
                Ok(message) => return Ok(Some(message)),
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping malformed message from manager");
                    self.send(&WorkerMessage::print(format!(
                        "dropped malformed message: {}",
                        e
                    )))?;
                }
            }
        }
    }
}

/// Everything a role needs: identity, shared data and queue handles.
pub struct WorkerContext {
    identity: WorkerIdentity,
    tools: Value,
    settings: Value,
    telemetry: bool,
    channel: Channel,
}

impl WorkerContext {
    /// Context over arbitrary byte streams. `reader` carries manager
    /// messages, `writer` receives worker messages.
    pub fn new(
        identity: WorkerIdentity,
        tools: Value,
        settings: Value,
        telemetry: bool,
        reader: impl Read + 'static,
        writer: impl Write + 'static,
    ) -> Self {
        Self::with_channel(identity, tools, settings, telemetry, Channel::new(reader, writer))
    }

    pub(crate) fn with_channel(
        identity: WorkerIdentity,
        tools: Value,
        settings: Value,
        telemetry: bool,
        channel: Channel,
    ) -> Self {
        Self {
            identity,
            tools,
            settings,
            telemetry,
            channel,
        }
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    /// Shared read-only data from the manager.
    pub fn tools(&self) -> &Value {
        &self.tools
    }

    pub fn settings(&self) -> &Value {
        &self.settings
    }

    /// `settings[role][key]`, falling back to `settings[key]`.
    pub fn setting(&self, role: &str, key: &str) -> Option<&Value> {
        self.settings
            .get(role)
            .and_then(|scoped| scoped.get(key))
            .or_else(|| self.settings.get(key))
    }

    /// True once the manager asked this process to exit or closed stdin.
    pub fn exit_requested(&self) -> bool {
        self.channel.exit_requested
    }

    pub fn input(&mut self) -> InputHandle<'_> {
        InputHandle {
            channel: &mut self.channel,
            queue: &self.identity.input_queue,
        }
    }

    pub fn output(&mut self) -> OutputHandle<'_> {
        OutputHandle {
            channel: &mut self.channel,
        }
    }

    pub fn info(&mut self) -> InfoHandle<'_> {
        InfoHandle {
            channel: &mut self.channel,
            enabled: self.telemetry,
            source: &self.identity.name,
        }
    }

    pub fn print(&mut self) -> PrintHandle<'_> {
        PrintHandle {
            channel: &mut self.channel,
        }
    }

    pub(crate) fn send(&mut self, message: &WorkerMessage) -> Result<()> {
        self.channel.send(message)
    }
}

/// Pulls chunks from an input queue.
pub struct InputHandle<'a> {
    channel: &'a mut Channel,
    queue: &'a str,
}

impl InputHandle<'_> {
    /// The queue this worker was assigned.
    pub fn name(&self) -> &str {
        self.queue
    }

    /// Next chunk from the assigned queue.
    ///
    /// `None` means there is nothing more to do: the stream on this queue is
    /// over, or the manager asked the process to exit.
    pub fn get(&mut self) -> Result<Option<Chunk>> {
        self.pull(None)
    }

    /// Next chunk from another input queue.
    pub fn get_from(&mut self, queue: &str) -> Result<Option<Chunk>> {
        self.pull(Some(queue))
    }

    fn pull(&mut self, queue: Option<&str>) -> Result<Option<Chunk>> {
        if self.channel.exit_requested {
            return Ok(None);
        }
        self.channel.send(&WorkerMessage::pull(queue))?;
        match self.channel.recv()? {
            Some(ParentMessage::Chunk { chunk }) => Ok(Some(chunk)),
            Some(ParentMessage::EndOfStream) => Ok(None),
            Some(ParentMessage::Exit) | None => {
                self.channel.exit_requested = true;
                Ok(None)
            }
            Some(ParentMessage::Error { message }) => Err(BrokerError::Protocol(message)),
            Some(ParentMessage::Init { .. }) => {
                Err(BrokerError::Protocol("unexpected init after start".into()))
            }
        }
    }
}

/// Pushes result chunks.
pub struct OutputHandle<'a> {
    channel: &'a mut Channel,
}

impl OutputHandle<'_> {
    pub fn put(&mut self, result: ResultChunk) -> Result<()> {
        self.channel.send(&WorkerMessage::Result { result })
    }

    pub fn emit(&mut self, ticket: Ticket, payload: Vec<Value>) -> Result<()> {
        self.put(ResultChunk::new(ticket, payload))
    }
}

/// Pushes telemetry samples. A no-op when telemetry is disabled.
pub struct InfoHandle<'a> {
    channel: &'a mut Channel,
    enabled: bool,
    source: &'a str,
}

impl InfoHandle<'_> {
    pub fn put(&mut self, count: SampleCount) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let sample = TelemetrySample {
            source: self.source.to_string(),
            count,
        };
        self.channel.send(&WorkerMessage::Telemetry { sample })
    }

    pub fn done(&mut self, items: u64) -> Result<()> {
        self.put(SampleCount::Done(items))
    }

    pub fn remaining(&mut self, items: u64) -> Result<()> {
        self.put(SampleCount::Remaining(items))
    }
}

/// Sends lines to the manager's log.
pub struct PrintHandle<'a> {
    channel: &'a mut Channel,
}

impl PrintHandle<'_> {
    pub fn put(&mut self, line: impl Into<String>) -> Result<()> {
        self.channel.send(&WorkerMessage::print(line))
    }
}

/// One standard round: pull a chunk, map each payload, emit the results
/// under the input ticket and report the items done.
///
/// `f` returning `None` drops that item from the result. Marker-only
/// chunks produce no result. Returns `false` once the stream is over.
pub fn map_round<F>(ctx: &mut WorkerContext, mut f: F) -> Result<bool>
where
    F: FnMut(&mut WorkerContext, Value) -> Result<Option<Value>>,
{
    let Some(chunk) = ctx.input().get()? else {
        return Ok(false);
    };
    let terminal = chunk.is_terminal();
    let count = chunk.payload_count();

    let Chunk { ticket, items } = chunk;
    let mut results = Vec::with_capacity(count);
    for item in items {
        if let WorkItem::Payload(value) = item
            && let Some(result) = f(ctx, value)?
        {
            results.push(result);
        }
    }

    if count > 0 {
        ctx.output().emit(ticket, results)?;
        ctx.info().done(count as u64)?;
    }
    Ok(!terminal)
}

type Factory = Box<dyn Fn(&WorkerIdentity) -> Box<dyn Worker> + Send + Sync>;

struct RoleEntry {
    description: String,
    factory: Factory,
}

/// Maps role names to constructors.
#[derive(Default)]
pub struct WorkerRegistry {
    roles: BTreeMap<String, RoleEntry>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a role. A later registration under the same name replaces it.
    pub fn with_role<F>(mut self, name: &str, description: &str, factory: F) -> Self
    where
        F: Fn(&WorkerIdentity) -> Box<dyn Worker> + Send + Sync + 'static,
    {
        self.roles.insert(
            name.to_string(),
            RoleEntry {
                description: description.to_string(),
                factory: Box::new(factory),
            },
        );
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.roles.contains_key(name)
    }

    pub fn create(&self, name: &str, identity: &WorkerIdentity) -> Result<Box<dyn Worker>> {
        self.roles
            .get(name)
            .map(|entry| (entry.factory)(identity))
            .ok_or_else(|| BrokerError::UnknownRole(name.to_string()))
    }

    /// `(name, description)` pairs in name order.
    pub fn roles(&self) -> impl Iterator<Item = (&str, &str)> {
        self.roles
            .iter()
            .map(|(name, entry)| (name.as_str(), entry.description.as_str()))
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.roles.keys()).finish()
    }
}
