//! Worker process main entry point.
//!
//! Runs when the binary is invoked as `procbroker internal-worker`. Talks
//! to the manager over stdin/stdout; logs go to the inherited stderr.

use std::io::{Read, Write};

use tracing::{debug, error, info_span, warn};

use crate::error::{BrokerError, Result};
use crate::ipc::PipeFd;
use crate::protocol::{ParentMessage, WorkerMessage};
use crate::spawn::WORKER_ID_ENV;
use crate::worker::{Channel, Worker, WorkerContext, WorkerIdentity, WorkerRegistry};

/// Run the worker loop over arbitrary streams.
///
/// Handshake: send `ready`, wait for `init`, build the requested roles.
/// Then run every still-active role once per round, in order, and report
/// `round` after each pass. Returns once no role is busy or the manager
/// asked the process to exit.
pub fn worker_loop<R, W>(registry: &WorkerRegistry, reader: R, writer: W) -> Result<()>
where
    R: Read + 'static,
    W: Write + 'static,
{
    let mut channel = Channel::new(reader, writer);
    channel.send(&WorkerMessage::Ready)?;

    let (identity, role_names, tools, settings, telemetry) = match channel.recv()? {
        Some(ParentMessage::Init {
            worker_id,
            name,
            roles,
            input_queue,
            process_count,
            tools,
            settings,
            telemetry,
        }) => (
            WorkerIdentity {
                worker_id,
                name,
                pid: std::process::id(),
                input_queue,
                process_count,
            },
            roles,
            tools,
            settings,
            telemetry,
        ),
        Some(ParentMessage::Exit) | None => return Ok(()),
        Some(other) => {
            return Err(BrokerError::Protocol(format!(
                "expected init, got {:?}",
                other
            )));
        }
    };

    let mut roles = Vec::with_capacity(role_names.len());
    for role in &role_names {
        match registry.create(role, &identity) {
            Ok(worker) => roles.push(worker),
            Err(e) => {
                channel.send(&WorkerMessage::error(e.to_string()))?;
                return Err(e);
            }
        }
    }

    debug!(worker = %identity.name, roles = ?role_names, "Worker initialized");
    let mut ctx = WorkerContext::with_channel(identity, tools, settings, telemetry, channel);
    run_rounds(&mut roles, &mut ctx)
}

fn run_rounds(roles: &mut [Box<dyn Worker>], ctx: &mut WorkerContext) -> Result<()> {
    let mut active = vec![true; roles.len()];
    let mut rounds = 0u64;

    loop {
        for (worker, active) in roles.iter_mut().zip(active.iter_mut()) {
            if !*active || ctx.exit_requested() {
                continue;
            }
            match worker.process_one_round(ctx) {
                Ok(busy) => *active = busy,
                Err(e) => {
                    warn!(role = worker.name(), error = %e, "Role failed, retiring it");
                    ctx.send(&WorkerMessage::error(format!("{}: {}", worker.name(), e)))?;
                    *active = false;
                }
            }
        }
        rounds += 1;

        if ctx.exit_requested() {
            debug!(rounds, "Exit requested by manager");
            return Ok(());
        }

        let busy = active.iter().any(|a| *a);
        ctx.send(&WorkerMessage::Round { busy })?;
        if !busy {
            debug!(rounds, "All roles finished");
            return Ok(());
        }
    }
}

/// Run the worker process main function.
///
/// Never returns: exits 0 after a clean finish and 1 on error.
pub fn run_worker_main(registry: &WorkerRegistry) -> ! {
    // Pipe errors are handled through io::Error.
    // Safety: installing SIG_IGN has no handler code to race with.
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    // Tags every log line, including failures before the init handshake.
    let worker_id = std::env::var(WORKER_ID_ENV).ok();
    let _span = info_span!("worker", id = worker_id.as_deref().unwrap_or("?")).entered();

    let result = PipeFd::stdin()
        .and_then(|stdin| Ok((stdin, PipeFd::stdout()?)))
        .map_err(BrokerError::from)
        .and_then(|(stdin, stdout)| worker_loop(registry, stdin, stdout));

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!(error = %e, "Worker failed");
            eprintln!("Worker error: {}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ResultChunk;
    use crate::roles::builtin_registry;
    use crate::worker::testing::{SharedBuf, chunk, script};
    use serde_json::{Value, json};

    fn init(roles: &[&str]) -> ParentMessage {
        ParentMessage::Init {
            worker_id: 1,
            name: "q-1".into(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            input_queue: "q".into(),
            process_count: 2,
            tools: Value::Null,
            settings: Value::Null,
            telemetry: false,
        }
    }

    fn run(messages: &[ParentMessage]) -> (Result<()>, Vec<WorkerMessage>) {
        let out = SharedBuf::default();
        let result = worker_loop(&builtin_registry(), script(messages), out.clone());
        (result, out.messages())
    }

    #[test]
    fn test_full_session() {
        let (result, messages) = run(&[
            init(&["square"]),
            chunk(1, &[json!(2), json!(3)], false),
            chunk(2, &[json!(4)], true),
        ]);
        result.unwrap();
        assert_eq!(
            messages,
            vec![
                WorkerMessage::Ready,
                WorkerMessage::Pull { queue: None },
                WorkerMessage::Result {
                    result: ResultChunk::new(
                        crate::chunk::Ticket::new("q", 1),
                        vec![json!(4), json!(9)]
                    )
                },
                WorkerMessage::Round { busy: true },
                WorkerMessage::Pull { queue: None },
                WorkerMessage::Result {
                    result: ResultChunk::new(crate::chunk::Ticket::new("q", 2), vec![json!(16)])
                },
                WorkerMessage::Round { busy: false },
            ]
        );
    }

    #[test]
    fn test_sibling_end_of_stream_finishes_worker() {
        let (result, messages) = run(&[init(&["echo"]), ParentMessage::EndOfStream]);
        result.unwrap();
        assert_eq!(messages.last(), Some(&WorkerMessage::Round { busy: false }));
    }

    #[test]
    fn test_two_roles_share_rounds_until_both_finish() {
        let (result, messages) = run(&[
            init(&["echo", "square"]),
            // round 1: echo takes ticket 1, square takes the terminal ticket 2
            chunk(1, &[json!(5)], false),
            chunk(2, &[json!(6)], true),
            // round 2: echo sees the end of stream
            ParentMessage::EndOfStream,
        ]);
        result.unwrap();
        let rounds: Vec<_> = messages
            .iter()
            .filter_map(|m| match m {
                WorkerMessage::Round { busy } => Some(*busy),
                _ => None,
            })
            .collect();
        assert_eq!(rounds, vec![true, false]);
    }

    #[test]
    fn test_exit_before_init() {
        let (result, messages) = run(&[ParentMessage::Exit]);
        result.unwrap();
        assert_eq!(messages, vec![WorkerMessage::Ready]);
    }

    #[test]
    fn test_exit_mid_stream_sends_no_round() {
        let (result, messages) = run(&[init(&["echo"]), ParentMessage::Exit]);
        result.unwrap();
        assert_eq!(
            messages,
            vec![WorkerMessage::Ready, WorkerMessage::Pull { queue: None }]
        );
    }

    #[test]
    fn test_unknown_role_is_reported() {
        let (result, messages) = run(&[init(&["nope"])]);
        assert!(matches!(result, Err(BrokerError::UnknownRole(_))));
        assert!(matches!(
            messages.last(),
            Some(WorkerMessage::Error { message }) if message.contains("nope")
        ));
    }

    #[test]
    fn test_chunk_before_init_is_a_protocol_error() {
        let (result, _) = run(&[chunk(1, &[json!(1)], true)]);
        assert!(matches!(result, Err(BrokerError::Protocol(_))));
    }

    #[test]
    fn test_failing_role_is_retired() {
        let (result, messages) = run(&[init(&["echo"]), ParentMessage::error("Unknown queue")]);
        result.unwrap();
        assert!(messages.iter().any(
            |m| matches!(m, WorkerMessage::Error { message } if message.starts_with("echo:"))
        ));
        assert_eq!(messages.last(), Some(&WorkerMessage::Round { busy: false }));
    }
}
