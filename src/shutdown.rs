//! Cooperative shutdown coordination.
//!
//! Every feeder, collector and worker link polls a [`CancellationToken`]
//! between bounded waits, so a stop request takes effect within one poll
//! interval. The [`ShutdownCoordinator`] owns two tokens:
//!
//! - `drain` (soft stop): feeders stop pulling from their sources and push a
//!   terminal chunk so workers can finish what is already queued.
//! - `stop` (hard stop): every loop exits at its next poll.
//!
//! Phases only move forward: `Running -> SoftShutdown -> HardShutdown -> Joined`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// A clonable cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Lifecycle phase of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ShutdownPhase {
    Running = 0,
    SoftShutdown = 1,
    HardShutdown = 2,
    Joined = 3,
}

impl ShutdownPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::SoftShutdown,
            2 => Self::HardShutdown,
            _ => Self::Joined,
        }
    }
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::SoftShutdown => "soft-shutdown",
            Self::HardShutdown => "hard-shutdown",
            Self::Joined => "joined",
        };
        f.write_str(name)
    }
}

/// Owns the soft and hard stop tokens and the job phase.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    drain: CancellationToken,
    stop: CancellationToken,
    phase: Arc<AtomicU8>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            drain: CancellationToken::new(),
            stop: CancellationToken::new(),
            phase: Arc::new(AtomicU8::new(ShutdownPhase::Running as u8)),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> ShutdownPhase {
        ShutdownPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Token polled by loops that must exit on hard stop.
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    /// True once soft shutdown (or anything later) has begun.
    pub fn is_draining(&self) -> bool {
        self.drain.is_cancelled()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Advance to `target` if it is later than the current phase.
    ///
    /// Returns `true` if this call performed the transition.
    fn advance(&self, target: ShutdownPhase) -> bool {
        let previous = self.phase.fetch_max(target as u8, Ordering::SeqCst);
        let moved = previous < target as u8;
        if moved {
            tracing::debug!(
                from = %ShutdownPhase::from_u8(previous),
                to = %target,
                "Shutdown phase transition"
            );
        }
        moved
    }

    /// Enter soft shutdown: feeders stop consuming their sources.
    pub fn begin_soft_shutdown(&self) -> bool {
        self.drain.cancel();
        self.advance(ShutdownPhase::SoftShutdown)
    }

    /// Enter hard shutdown: every loop exits at its next poll.
    ///
    /// Implies the soft stop as well.
    pub fn begin_hard_shutdown(&self) -> bool {
        self.drain.cancel();
        self.stop.cancel();
        self.advance(ShutdownPhase::HardShutdown)
    }

    /// Mark every process and thread as joined.
    pub(crate) fn mark_joined(&self) -> bool {
        self.begin_hard_shutdown();
        self.advance(ShutdownPhase::Joined)
    }
}
