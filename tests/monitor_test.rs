mod common;

use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fanlink::config::{MonitorKind, MonitorOptions};
use fanlink::error::Error;
use fanlink::monitor::{LinkState, Monitor};

use common::test_log;

fn monitor_options(interval_ms: u64, failure_threshold: u32) -> MonitorOptions {
    MonitorOptions {
        interval_ms,
        kind: MonitorKind::Ping,
        failure_threshold,
    }
}

fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn link_flips_to_not_ok_after_threshold_failures() {
    let log = test_log();
    let mut monitor = Monitor::start(
        monitor_options(20, 3),
        0,
        |_kind: MonitorKind| -> Result<(), Error> {
            Err(Error::NetworkError(String::from("probe refused")))
        },
        &log,
    )
    .unwrap();

    // Below the threshold the link is indeterminate, not failed.
    assert!(wait_until(Duration::from_secs(2), || {
        monitor.status().consecutive_failures >= 1
    }));
    let early = monitor.status();
    if early.consecutive_failures < 3 {
        assert_eq!(early.state, LinkState::Indeterminate);
    }

    assert!(wait_until(Duration::from_secs(2), || {
        monitor.status().state == LinkState::NotOk
    }));
    let status = monitor.status();
    assert!(status.consecutive_failures >= 3);

    monitor.stop();
}

#[test]
fn link_recovers_when_probes_succeed_again() {
    let log = test_log();
    let failures = Arc::new(AtomicU32::new(0));
    let failures_clone = Arc::clone(&failures);
    let mut monitor = Monitor::start(
        monitor_options(20, 2),
        1,
        move |_kind: MonitorKind| -> Result<(), Error> {
            // Fail the first four probes, then recover.
            if failures_clone.fetch_add(1, AtomicOrdering::SeqCst) < 4 {
                Err(Error::ServerLost(String::from("gone")))
            } else {
                Ok(())
            }
        },
        &log,
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        monitor.status().state == LinkState::NotOk
    }));
    assert!(wait_until(Duration::from_secs(2), || {
        monitor.status().state == LinkState::Ok
    }));
    let status = monitor.status();
    assert_eq!(status.consecutive_failures, 0);
    assert!(!status.just_failed);

    monitor.stop();
}

#[test]
fn stop_joins_the_thread_and_probing_ceases() {
    let log = test_log();
    let probes = Arc::new(AtomicU32::new(0));
    let probes_clone = Arc::clone(&probes);
    let mut monitor = Monitor::start(
        monitor_options(10, 1),
        2,
        move |_kind: MonitorKind| -> Result<(), Error> {
            probes_clone.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        },
        &log,
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        probes.load(AtomicOrdering::SeqCst) >= 3
    }));
    monitor.stop();
    let after_stop = probes.load(AtomicOrdering::SeqCst);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(probes.load(AtomicOrdering::SeqCst), after_stop);

    // A second stop is a no-op.
    monitor.stop();
}

#[test]
fn registry_shutdown_joins_adopted_monitors() {
    let log = test_log();
    let hub = common::FakeHub::new();
    let registry = common::registry_with(
        fanlink::config::PoolConfig::default(),
        &hub,
    );
    let probes = Arc::new(AtomicU32::new(0));
    let probes_clone = Arc::clone(&probes);
    let monitor = Monitor::start(
        monitor_options(10, 1),
        0,
        move |_kind: MonitorKind| -> Result<(), Error> {
            probes_clone.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        },
        &log,
    )
    .unwrap();
    registry.adopt_monitor(monitor);

    assert!(wait_until(Duration::from_secs(2), || {
        probes.load(AtomicOrdering::SeqCst) >= 1
    }));
    registry.shutdown();
    let after = probes.load(AtomicOrdering::SeqCst);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(probes.load(AtomicOrdering::SeqCst), after);
}

#[test]
fn status_handle_is_readable_without_the_monitor() {
    let log = test_log();
    let mut monitor = Monitor::start(
        monitor_options(10, 1),
        3,
        |_kind: MonitorKind| -> Result<(), Error> { Ok(()) },
        &log,
    )
    .unwrap();
    let handle = monitor.status_handle();

    assert!(wait_until(Duration::from_secs(2), || {
        handle.lock().unwrap().probes >= 1
    }));
    assert_eq!(handle.lock().unwrap().state, LinkState::Ok);
    monitor.stop();
    // The handle outlives the monitor thread.
    assert!(handle.lock().unwrap().probes >= 1);
}
