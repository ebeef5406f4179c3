//! Worker subprocess spawning.
//!
//! Uses `std::process::Command` (posix_spawn where available) rather than a
//! bare fork, so the manager's threads are never duplicated into a child.

use std::process::{Command, Stdio};
use std::thread::JoinHandle;

use nix::unistd::Pid;

use crate::config::{WorkerCommand, default_processes};
use crate::error::{BrokerError, Result};
use crate::proc::Proc;

/// Environment variable carrying the worker id into the child, which tags
/// its log lines with it.
pub const WORKER_ID_ENV: &str = "PROCBROKER_WORKER_ID";

/// Spawn one worker process.
///
/// Stdin and stdout carry the wire protocol; stderr is inherited so worker
/// logs land next to the manager's.
pub fn spawn_worker(command: &WorkerCommand, worker_id: usize) -> Result<Proc> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args);
    cmd.env(WORKER_ID_ENV, worker_id.to_string());

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit());

    let child = cmd.spawn().map_err(|e| {
        BrokerError::Worker(format!(
            "Failed to spawn worker {} ({}): {}",
            worker_id,
            command.program.display(),
            e
        ))
    })?;

    Proc::from_child(child)
}

/// Restrict a process to the given CPUs.
#[cfg(target_os = "linux")]
pub fn pin_to_cpus(pid: Pid, cpus: &[usize]) -> Result<()> {
    use nix::sched::{CpuSet, sched_setaffinity};

    let mut set = CpuSet::new();
    for &cpu in cpus {
        set.set(cpu)
            .map_err(|e| BrokerError::Worker(format!("Invalid CPU {}: {}", cpu, e)))?;
    }
    sched_setaffinity(pid, &set).map_err(|e| {
        BrokerError::Worker(format!(
            "Failed to pin pid {} to {:?}: {}",
            pid.as_raw(),
            cpus,
            e
        ))
    })
}

/// CPU affinity is only supported on Linux; elsewhere this only logs.
#[cfg(not(target_os = "linux"))]
pub fn pin_to_cpus(pid: Pid, cpus: &[usize]) -> Result<()> {
    tracing::debug!(
        pid = pid.as_raw(),
        ?cpus,
        "CPU pinning not supported on this platform, ignoring"
    );
    Ok(())
}

/// CPUs this process may run on, in ascending order.
///
/// Reads the affinity mask, so a cpuset-restricted container reports only
/// its own CPUs. Falls back to `0..available_parallelism` if the mask
/// cannot be read.
#[cfg(target_os = "linux")]
pub fn allowed_cpus() -> Vec<usize> {
    use nix::sched::{CpuSet, sched_getaffinity};

    match sched_getaffinity(Pid::from_raw(0)) {
        Ok(set) => (0..CpuSet::count())
            .filter(|&cpu| set.is_set(cpu).unwrap_or(false))
            .collect(),
        Err(e) => {
            tracing::debug!(error = %e, "Could not read CPU affinity");
            (0..default_processes()).collect()
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn allowed_cpus() -> Vec<usize> {
    (0..default_processes()).collect()
}

/// Spawn a named manager thread.
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let name = name.into();
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|e| BrokerError::Worker(format!("Failed to spawn thread '{}': {}", name, e)))
}
