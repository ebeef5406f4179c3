//! Process handle for worker subprocesses.
//!
//! Wraps a child process with its IPC channels. The reader half can be
//! taken out so a dedicated thread can block on it while the owner keeps
//! writing and polling the process.

use std::process::Child;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use crate::error::{BrokerError, Result};
use crate::ipc::{LineReader, LineWriter, PipeFd};
use crate::protocol::ParentMessage;
use crate::signals::{TerminationReason, analyze_wait_status};

/// Poll step while waiting for a process to exit.
const WAIT_STEP: Duration = Duration::from_millis(10);

/// Handle to a worker subprocess with IPC channels.
pub struct Proc {
    pid: Pid,
    writer: LineWriter<PipeFd>,
    reader: Option<LineReader<PipeFd>>,
    /// Set once the process has been waited on.
    exit: Option<TerminationReason>,
}

impl Proc {
    /// Create from a spawned `std::process::Child`.
    ///
    /// Takes ownership of the child's stdin and stdout. The process is reaped
    /// through its pid, not through `Child`.
    pub fn from_child(mut child: Child) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BrokerError::Worker("Child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BrokerError::Worker("Child stdout not captured".into()))?;

        Ok(Self {
            pid,
            writer: LineWriter::new(PipeFd::new(stdin.into())),
            reader: Some(LineReader::new(PipeFd::new(stdout.into()))),
            exit: None,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Hand the stdout reader to another thread. Returns `None` the second time.
    pub fn take_reader(&mut self) -> Option<LineReader<PipeFd>> {
        self.reader.take()
    }

    pub fn send(&mut self, message: &ParentMessage) -> Result<()> {
        let line = message.to_line()?;
        self.writer
            .write_line(&line)
            .map_err(|e| BrokerError::Worker(format!("Failed to send to worker: {}", e)))
    }

    /// Try to reap the process (non-blocking).
    pub fn try_wait(&mut self) -> Result<Option<TerminationReason>> {
        if let Some(reason) = &self.exit {
            return Ok(Some(reason.clone()));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                let reason = analyze_wait_status(status);
                self.exit = Some(reason.clone());
                Ok(Some(reason))
            }
            Err(e) => Err(BrokerError::Worker(format!("waitpid failed: {}", e))),
        }
    }

    /// Poll for exit for up to `timeout`.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<TerminationReason>> {
        let start = Instant::now();
        loop {
            if let Some(reason) = self.try_wait()? {
                return Ok(Some(reason));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }
            std::thread::sleep(WAIT_STEP);
        }
    }

    /// Send SIGTERM to the process.
    pub fn terminate(&self) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGTERM)
            .map_err(|e| BrokerError::Worker(format!("Failed to send SIGTERM: {}", e)))
    }

    /// Send SIGKILL to the process and reap it.
    pub fn kill(&mut self) -> Result<TerminationReason> {
        if let Some(reason) = &self.exit {
            return Ok(reason.clone());
        }
        signal::kill(self.pid, Signal::SIGKILL)
            .map_err(|e| BrokerError::Worker(format!("Failed to send SIGKILL: {}", e)))?;
        let status = waitpid(self.pid, None)
            .map_err(|e| BrokerError::Worker(format!("waitpid failed: {}", e)))?;
        let reason = analyze_wait_status(status);
        self.exit = Some(reason.clone());
        Ok(reason)
    }

    /// Stop the worker: send `exit`, wait `grace`, then SIGTERM, then SIGKILL.
    pub fn stop(&mut self, grace: Duration) -> Result<TerminationReason> {
        if let Some(reason) = &self.exit {
            return Ok(reason.clone());
        }

        // The pipe may already be closed if the worker is gone.
        let _ = self.send(&ParentMessage::Exit);
        if let Some(reason) = self.wait_timeout(grace)? {
            return Ok(reason);
        }

        tracing::debug!(pid = self.pid.as_raw(), "Worker ignored exit, sending SIGTERM");
        let _ = self.terminate();
        if let Some(reason) = self.wait_timeout(Duration::from_millis(100))? {
            return Ok(reason);
        }

        tracing::debug!(pid = self.pid.as_raw(), "Worker ignored SIGTERM, sending SIGKILL");
        self.kill()
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if self.exit.is_none() {
            let _ = self.terminate();
            std::thread::sleep(WAIT_STEP);
            if let Ok(Some(_)) = self.try_wait() {
                return;
            }
            let _ = self.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    fn spawn(program: &str, args: &[&str]) -> Proc {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn");
        Proc::from_child(child).expect("Failed to create Proc")
    }

    #[test]
    fn test_send_and_read_back_through_cat() {
        let mut proc = spawn("cat", &[]);
        let mut reader = proc.take_reader().unwrap();
        assert!(proc.take_reader().is_none());

        proc.send(&ParentMessage::EndOfStream).unwrap();
        let line = reader.read_line().unwrap().unwrap().to_string();
        assert_eq!(
            ParentMessage::from_line(&line).unwrap(),
            ParentMessage::EndOfStream
        );

        // cat ignores the exit message; stop escalates to SIGTERM.
        let reason = proc.stop(Duration::from_millis(50)).unwrap();
        assert_eq!(reason, TerminationReason::Signaled(Signal::SIGTERM));
        assert_eq!(proc.try_wait().unwrap(), Some(reason));
    }

    #[test]
    fn test_exit_code_is_reported() {
        let mut proc = spawn("sh", &["-c", "exit 3"]);
        let reason = proc.wait_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(reason, Some(TerminationReason::Exited(3)));
    }

    #[test]
    fn test_terminate() {
        let mut proc = spawn("sleep", &["60"]);
        assert_eq!(proc.try_wait().unwrap(), None);

        proc.terminate().unwrap();
        let reason = proc.wait_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(reason, Some(TerminationReason::Signaled(Signal::SIGTERM)));
    }
}
