//! End-to-end pool tests running real worker processes.
//!
//! Workers are the crate's own binary started as `procbroker internal-worker`.

use std::time::Duration;

use nix::sys::signal::Signal;
use procbroker::feeder::FeederOutcome;
use procbroker::signals::TerminationReason;
use procbroker::{BrokerConfig, JobReport, Ticket, WorkerCommand, WorkerGroup, WorkerState};
use serde_json::{Value, json};

fn worker_command() -> WorkerCommand {
    WorkerCommand::new(env!("CARGO_BIN_EXE_procbroker")).arg("internal-worker")
}

fn config() -> BrokerConfig {
    BrokerConfig::default()
        .with_worker_command(worker_command())
        .with_poll_interval(Duration::from_millis(5))
        .with_stop_grace(Duration::from_secs(2))
        .with_drain_timeout(Duration::from_secs(30))
}

fn group(queue: &str, roles: &[&str], processes: usize) -> WorkerGroup {
    WorkerGroup::new(queue, roles.iter().copied()).with_processes(processes)
}

fn squares(config: BrokerConfig, n: i64) -> JobReport {
    let mut pool = procbroker::start(config).unwrap();
    pool.run_feeder(1..=n, "numbers").unwrap();
    pool.join().unwrap()
}

#[test]
fn test_results_cover_every_ticket_in_order() {
    let report = squares(
        config()
            .with_group(group("numbers", &["square"], 4))
            .with_batch_size(7)
            .with_expected_items(200),
        200,
    );

    let expected: Vec<Value> = (1..=200i64).map(|n| json!(n * n)).collect();
    assert_eq!(report.results.flatten("numbers"), expected);
    assert_eq!(report.results.tickets("numbers"), (1..=29).collect::<Vec<_>>());
    assert_eq!(report.results.overwritten(), 0);

    assert!(report.is_complete(), "{:?}", report);
    assert_eq!(report.workers.len(), 4);
    assert_eq!(report.workers.iter().map(|w| w.chunks).sum::<u64>(), 29);
    assert_eq!(report.feeders[0].items_sent, 200);
    assert_eq!(report.feeders[0].outcome, FeederOutcome::Exhausted);

    assert_eq!(report.progress.done, 200);
    assert_eq!(report.progress.percent, Some(100.0));
}

#[test]
fn test_worker_count_does_not_change_results() {
    let single = squares(config().with_group(group("numbers", &["square"], 1)), 50);
    let many = squares(
        config()
            .with_group(group("numbers", &["square"], 3))
            .with_batch_size(3),
        50,
    );
    assert_eq!(
        single.results.flatten("numbers"),
        many.results.flatten("numbers")
    );
    assert!(single.is_complete());
    assert!(many.is_complete());
}

#[test]
fn test_empty_source_finishes_every_worker() {
    let mut pool = procbroker::start(config().with_group(group("numbers", &["echo"], 3))).unwrap();
    pool.run_feeder(Vec::<i64>::new(), "numbers").unwrap();
    let report = pool.join().unwrap();

    assert!(report.results.is_empty());
    assert_eq!(report.feeders[0].chunks_sent, 1);
    assert_eq!(report.feeders[0].items_sent, 0);
    assert!(
        report
            .workers
            .iter()
            .all(|w| w.state == WorkerState::Finished)
    );
}

#[test]
fn test_queue_without_feeder_is_closed_at_join() {
    let pool = procbroker::start(config().with_group(group("idle", &["echo"], 2))).unwrap();
    let report = pool.join().unwrap();

    assert!(report.results.is_empty());
    assert!(report.feeders.is_empty());
    assert!(report.undrained.is_empty());
    assert!(
        report
            .workers
            .iter()
            .all(|w| w.state == WorkerState::Finished)
    );
}

#[test]
fn test_crash_loses_in_flight_chunk_without_restart() {
    let mut pool = procbroker::start(
        config()
            .with_group(group("words", &["crash"], 2))
            .with_batch_size(1),
    )
    .unwrap();
    pool.run_feeder(["a", "b", "crash", "c", "d"], "words")
        .unwrap();
    let report = pool.join().unwrap();

    let crashed: Vec<_> = report.crashed().collect();
    assert_eq!(crashed.len(), 1);
    match &crashed[0].state {
        WorkerState::Crashed {
            reason,
            lost_ticket,
        } => {
            assert_eq!(*reason, TerminationReason::Signaled(Signal::SIGABRT));
            assert_eq!(lost_ticket.as_ref(), Some(&Ticket::new("words", 3)));
        }
        other => panic!("expected a crash, got {:?}", other),
    }

    // The survivor handles everything else; nobody replaces the dead worker.
    assert_eq!(report.workers.len(), 2);
    assert_eq!(report.results.tickets("words"), vec![1, 2, 4, 5]);
    assert_eq!(
        report.results.flatten("words"),
        vec![json!("a"), json!("b"), json!("c"), json!("d")]
    );
    assert!(!report.is_complete());
}

#[test]
fn test_groups_drain_disjoint_queues() {
    let mut pool = procbroker::start(
        config()
            .with_group(group("numbers", &["square"], 2))
            .with_group(group("words", &["wordmatch"], 1))
            .with_tools(json!({"words": ["apple", "plum"]}))
            .with_batch_size(2),
    )
    .unwrap();
    pool.run_feeder(1..=5, "numbers").unwrap();
    pool.run_feeder(["apple", "kiwi", "plum"], "words").unwrap();
    let report = pool.join().unwrap();

    assert_eq!(
        report.results.flatten("numbers"),
        vec![json!(1), json!(4), json!(9), json!(16), json!(25)]
    );
    assert_eq!(
        report.results.flatten("words"),
        vec![json!("apple"), json!("plum")]
    );
    assert_eq!(report.results.queues(), vec!["numbers", "words"]);
    let words_worker = report
        .workers
        .iter()
        .find(|w| w.input_queue == "words")
        .unwrap();
    assert_eq!(words_worker.name, "words-0");
    assert!(report.is_complete());
}

#[test]
fn test_roles_share_a_process() {
    let mut pool = procbroker::start(
        config()
            .with_group(group("numbers", &["echo", "square"], 2))
            .with_batch_size(1),
    )
    .unwrap();
    pool.run_feeder(1..=20, "numbers").unwrap();
    let report = pool.join().unwrap();

    // Each ticket is handled by exactly one role, so every ticket shows up once.
    assert_eq!(report.results.tickets("numbers"), (1..=20).collect::<Vec<_>>());
    assert!(report.is_complete());
}

#[test]
fn test_soft_shutdown_cuts_infinite_source() {
    let mut pool = procbroker::start(
        config()
            .with_group(group("numbers", &["echo"], 2))
            .with_batch_size(4),
    )
    .unwrap();
    pool.run_feeder(0u64.., "numbers").unwrap();
    std::thread::sleep(Duration::from_millis(200));
    let report = pool.shutdown().unwrap();

    let feeder = &report.feeders[0];
    assert_eq!(feeder.outcome, FeederOutcome::Drained);
    let last = feeder.last_ticket.unwrap();

    // Everything queued before the marker was processed, nothing after it exists.
    assert_eq!(
        report.results.tickets("numbers"),
        (1..last).collect::<Vec<_>>()
    );
    assert!(report.undrained.is_empty());
    assert!(
        report
            .workers
            .iter()
            .all(|w| w.state == WorkerState::Finished)
    );
}

#[test]
fn test_drain_timeout_escalates_to_hard_stop() {
    let mut pool = procbroker::start(
        config()
            .with_group(group("numbers", &["echo"], 1))
            .with_settings(json!({"echo": {"delay_ms": 200}}))
            .with_batch_size(1)
            .with_queue_capacity(32)
            .with_drain_timeout(Duration::from_millis(300)),
    )
    .unwrap();
    pool.run_feeder(1..=20i64, "numbers").unwrap();
    let report = pool.join().unwrap();

    assert!(report.timed_out);
    assert!(
        report
            .undrained
            .iter()
            .any(|(queue, len)| queue == "numbers" && *len > 0),
        "{:?}",
        report.undrained
    );
    assert!(matches!(
        report.workers[0].state,
        WorkerState::Stopped { .. }
    ));
    assert_eq!(report.feeders[0].outcome, FeederOutcome::Exhausted);
    assert!(report.results.len() < 20);
    assert!(!report.is_complete());
    assert!(report.elapsed < Duration::from_secs(4));
}

#[test]
fn test_unserializable_item_does_not_stall_workers() {
    use std::collections::HashMap;

    let mut pool = procbroker::start(
        config()
            .with_group(group("q", &["echo"], 2))
            .with_drain_timeout(Duration::from_secs(10)),
    )
    .unwrap();
    pool.run_feeder(vec![HashMap::from([((1, 2), 3)])], "q")
        .unwrap();
    let report = pool.join().unwrap();

    assert!(!report.timed_out);
    assert!(report.elapsed < Duration::from_secs(5));
    assert_eq!(report.errors.len(), 1, "{:?}", report.errors);
    assert!(report.errors[0].contains("key must be a string"));
    assert!(report.results.is_empty());
    assert!(
        report
            .workers
            .iter()
            .all(|w| w.state == WorkerState::Finished)
    );
}

#[test]
fn test_abort_stops_busy_workers() {
    let mut pool = procbroker::start(
        config()
            .with_group(group("numbers", &["echo"], 2))
            .with_settings(json!({"echo": {"delay_ms": 50}}))
            .with_batch_size(1),
    )
    .unwrap();
    pool.run_feeder(0u64.., "numbers").unwrap();
    std::thread::sleep(Duration::from_millis(300));

    let report = pool.abort().unwrap();
    assert_eq!(report.feeders[0].outcome, FeederOutcome::Cancelled);
    assert!(
        report
            .workers
            .iter()
            .all(|w| matches!(w.state, WorkerState::Stopped { .. }))
    );
    assert!(report.elapsed < Duration::from_secs(10));
}

#[test]
fn test_ctrl_c_style_stop_from_another_thread() {
    let mut pool = procbroker::start(
        config()
            .with_group(group("numbers", &["echo"], 1))
            .with_settings(json!({"delay_ms": 20})),
    )
    .unwrap();
    pool.run_feeder(0u64.., "numbers").unwrap();

    let stop = pool.stop_handle();
    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        stop.begin_hard_shutdown();
    });
    let report = pool.join().unwrap();
    stopper.join().unwrap();

    assert_eq!(report.feeders[0].outcome, FeederOutcome::Cancelled);
    assert!(!report.timed_out);
    assert!(!report.is_complete());
}
