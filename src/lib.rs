//! procbroker - multi-process work distribution and result collection.
//!
//! A manager process spawns a pool of worker processes, splits an input
//! stream into ticketed chunks, hands those chunks to whichever worker asks
//! first, and gathers results, progress telemetry and print lines back into
//! one place.
//!
//! ```no_run
//! use procbroker::{BrokerConfig, WorkerCommand};
//!
//! let config = BrokerConfig::for_roles("numbers", ["square"])
//!     .with_processes(4)
//!     .with_worker_command(WorkerCommand::new("procbroker").arg("internal-worker"));
//! let mut pool = procbroker::start(config)?;
//! pool.run_feeder(1..=1000, "numbers")?;
//! let report = pool.join()?;
//! println!("{} results", report.results.flatten("numbers").len());
//! # Ok::<(), procbroker::BrokerError>(())
//! ```

pub mod chunk;
pub mod collector;
pub mod config;
pub mod error;
pub mod feeder;
pub mod ipc;
pub mod logging;
pub mod pool;
pub mod proc;
pub mod protocol;
pub mod queue;
pub mod roles;
pub mod shutdown;
pub mod signals;
pub mod spawn;
pub mod telemetry;
pub mod worker;
pub mod worker_main;

pub use chunk::{Chunk, Framer, ResultChunk, Ticket, WorkItem};
pub use collector::ResultStore;
pub use config::{BrokerConfig, CpuPinning, WorkerCommand, WorkerGroup};
pub use error::{BrokerError, Result};
pub use pool::{JobReport, PoolHandle, WorkerHandle, WorkerReport, WorkerState, start};
pub use shutdown::{CancellationToken, ShutdownCoordinator, ShutdownPhase};
pub use telemetry::{ProgressSnapshot, SampleCount, TelemetrySample};
pub use worker::{Worker, WorkerContext, WorkerRegistry, map_round};
pub use worker_main::run_worker_main;
