//! Broker configuration.
//!
//! A [`BrokerConfig`] is built once, validated, and shared read-only by the
//! manager. Every worker process gets a copy of the parts it needs (tools,
//! settings, telemetry flag) in its `init` message.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;

use crate::error::{BrokerError, Result};
use crate::spawn::allowed_cpus;

/// Default number of items per chunk.
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Default poll interval for every bounded wait.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Default wait for workers to drain after soft shutdown.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default grace period between `exit` and SIGTERM when stopping a worker.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Number of available CPU cores, used as the default process count.
pub fn default_processes() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// A set of worker processes draining one input queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerGroup {
    pub input_queue: String,
    /// Roles each process runs, in order, every round.
    pub roles: Vec<String>,
    pub processes: usize,
}

impl WorkerGroup {
    pub fn new(
        input_queue: impl Into<String>,
        roles: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            input_queue: input_queue.into(),
            roles: roles.into_iter().map(Into::into).collect(),
            processes: default_processes(),
        }
    }

    pub fn with_processes(mut self, processes: usize) -> Self {
        self.processes = processes;
        self
    }
}

/// CPU affinity for worker processes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CpuPinning {
    #[default]
    None,
    /// Worker `n` runs on the `n % len`-th CPU this process may use.
    PerCore,
    /// Worker id to the CPUs it may run on. Unlisted workers are not pinned.
    Explicit(HashMap<usize, Vec<usize>>),
}

impl CpuPinning {
    /// CPUs for a worker, if it is to be pinned.
    pub fn cpus_for(&self, worker_id: usize) -> Option<Vec<usize>> {
        match self {
            Self::None => None,
            Self::PerCore => {
                let allowed = allowed_cpus();
                allowed
                    .get(worker_id % allowed.len().max(1))
                    .map(|&cpu| vec![cpu])
            }
            Self::Explicit(map) => map.get(&worker_id).cloned(),
        }
    }
}

/// How to start a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// The current executable in `internal-worker` mode.
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe().map_err(|e| {
            BrokerError::Worker(format!("Failed to get current executable: {}", e))
        })?;
        Ok(Self::new(exe).arg("internal-worker"))
    }
}

/// Configuration for one broker job.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub groups: Vec<WorkerGroup>,
    pub batch_size: usize,
    /// Input queue capacity in chunks. `None` means twice the process count.
    pub queue_capacity: Option<usize>,
    pub poll_interval: Duration,
    pub drain_timeout: Duration,
    pub stop_grace: Duration,
    pub telemetry: bool,
    /// Items the job is expected to process, for percent and ETA.
    pub expected_items: Option<u64>,
    /// Read-only data shipped to every worker once.
    pub tools: Value,
    /// Free-form per-role settings.
    pub settings: Value,
    pub pinning: CpuPinning,
    /// `None` runs the current executable in `internal-worker` mode.
    pub worker_command: Option<WorkerCommand>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            groups: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            queue_capacity: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            stop_grace: DEFAULT_STOP_GRACE,
            telemetry: true,
            expected_items: None,
            tools: Value::Null,
            settings: Value::Null,
            pinning: CpuPinning::None,
            worker_command: None,
        }
    }
}

impl BrokerConfig {
    /// One group draining `input_queue` with the given roles on every core.
    pub fn for_roles(
        input_queue: impl Into<String>,
        roles: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self::default().with_group(WorkerGroup::new(input_queue, roles))
    }

    pub fn with_group(mut self, group: WorkerGroup) -> Self {
        self.groups.push(group);
        self
    }

    /// Set the process count of every group.
    pub fn with_processes(mut self, processes: usize) -> Self {
        for group in &mut self.groups {
            group.processes = processes;
        }
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_telemetry(mut self, enabled: bool) -> Self {
        self.telemetry = enabled;
        self
    }

    pub fn with_expected_items(mut self, items: u64) -> Self {
        self.expected_items = Some(items);
        self
    }

    pub fn with_tools(mut self, tools: Value) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_settings(mut self, settings: Value) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_pinning(mut self, pinning: CpuPinning) -> Self {
        self.pinning = pinning;
        self
    }

    pub fn with_worker_command(mut self, command: WorkerCommand) -> Self {
        self.worker_command = Some(command);
        self
    }

    pub fn total_processes(&self) -> usize {
        self.groups.iter().map(|g| g.processes).sum()
    }

    /// Capacity of every input queue, in chunks.
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
            .unwrap_or_else(|| self.total_processes().saturating_mul(2))
            .max(1)
    }

    /// The command used to start workers.
    pub fn worker_command(&self) -> Result<WorkerCommand> {
        match &self.worker_command {
            Some(command) => Ok(command.clone()),
            None => WorkerCommand::current_exe(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(BrokerError::InvalidConfig(msg));

        if self.groups.is_empty() {
            return invalid("at least one worker group is required".into());
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be greater than 0".into());
        }
        if self.queue_capacity == Some(0) {
            return invalid("queue_capacity must be greater than 0".into());
        }
        if self.poll_interval.is_zero() {
            return invalid("poll_interval must be greater than 0".into());
        }

        let mut names = HashSet::new();
        for group in &self.groups {
            if group.input_queue.is_empty() || group.input_queue.contains(';') {
                return invalid(format!(
                    "invalid queue name '{}': must be non-empty and contain no ';'",
                    group.input_queue
                ));
            }
            if !names.insert(group.input_queue.as_str()) {
                return invalid(format!("duplicate queue name '{}'", group.input_queue));
            }
            if group.processes == 0 {
                return invalid(format!(
                    "group '{}' needs at least one process",
                    group.input_queue
                ));
            }
            if group.roles.is_empty() {
                return invalid(format!(
                    "group '{}' needs at least one role",
                    group.input_queue
                ));
            }
        }

        if let CpuPinning::Explicit(map) = &self.pinning
            && let Some((id, _)) = map.iter().find(|(_, cpus)| cpus.is_empty())
        {
            return invalid(format!("empty CPU set for worker {}", id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BrokerConfig {
        BrokerConfig::for_roles("q", ["echo"]).with_processes(2)
    }

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.poll_interval, Duration::from_millis(25));
        assert_eq!(config.drain_timeout, Duration::from_secs(30));
        assert!(config.telemetry);
        assert!(config.groups.is_empty());
        assert_eq!(config.pinning, CpuPinning::None);
    }

    #[test]
    fn test_for_roles_uses_every_core() {
        let config = BrokerConfig::for_roles("q", ["echo", "square"]);
        assert_eq!(config.groups.len(), 1);
        assert_eq!(config.groups[0].processes, default_processes());
        assert_eq!(config.groups[0].roles, vec!["echo", "square"]);
    }

    #[test]
    fn test_queue_capacity_defaults_to_twice_processes() {
        let config = config().with_group(WorkerGroup::new("r", ["echo"]).with_processes(3));
        assert_eq!(config.total_processes(), 5);
        assert_eq!(config.queue_capacity(), 10);
        assert_eq!(config.with_queue_capacity(4).queue_capacity(), 4);
    }

    #[test]
    fn test_validate_accepts_good_config() {
        config().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cases = [
            BrokerConfig::default(),
            config().with_batch_size(0),
            config().with_queue_capacity(0),
            config().with_poll_interval(Duration::ZERO),
            config().with_processes(0),
            config().with_group(WorkerGroup::new("q", ["echo"])),
            BrokerConfig::for_roles("a;b", ["echo"]),
            BrokerConfig::for_roles("q", Vec::<String>::new()),
            config().with_pinning(CpuPinning::Explicit(HashMap::from([(0, vec![])]))),
        ];
        for case in cases {
            assert!(
                matches!(case.validate(), Err(BrokerError::InvalidConfig(_))),
                "{case:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_cpu_pinning() {
        assert_eq!(CpuPinning::None.cpus_for(0), None);
        let allowed = allowed_cpus();
        let len = allowed.len();
        assert_eq!(
            CpuPinning::PerCore.cpus_for(len + 1),
            Some(vec![allowed[1 % len]])
        );
        for worker_id in 0..2 * len {
            let cpus = CpuPinning::PerCore.cpus_for(worker_id).unwrap();
            assert!(allowed.contains(&cpus[0]));
        }

        let explicit = CpuPinning::Explicit(HashMap::from([(2, vec![0, 1])]));
        assert_eq!(explicit.cpus_for(2), Some(vec![0, 1]));
        assert_eq!(explicit.cpus_for(3), None);
    }

    #[test]
    fn test_worker_command() {
        let cmd = WorkerCommand::new("/bin/worker").arg("internal-worker");
        assert_eq!(cmd.args, vec!["internal-worker"]);
        let config = config().with_worker_command(cmd.clone());
        assert_eq!(config.worker_command().unwrap(), cmd);

        let default = BrokerConfig::default().worker_command().unwrap();
        assert_eq!(default.args, vec!["internal-worker"]);
    }
}
