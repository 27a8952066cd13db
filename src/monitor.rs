/*
 * Copyright 2020 Joyent, Inc.
 */

//! Per-link health monitoring.
//!
//! Each monitored link gets a dedicated thread that sleeps on a timed
//! condvar wait for the configured interval (waking early only on kill),
//! runs an opaque health probe, and folds the outcome into a shared
//! status value. The monitor is purely a status producer: routing and
//! admission layers read `LinkStatus` asynchronously and the monitor
//! never blocks anyone.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use slog::{debug, warn, Logger};

use crate::config::{MonitorKind, MonitorOptions};
use crate::error::Error;

/// Shared verdict on one link's health.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Ok,
    NotOk,
    /// Probes are failing but the threshold has not been reached.
    Indeterminate,
}

#[derive(Clone, Debug)]
pub struct LinkStatus {
    pub state: LinkState,
    /// Set on the probe that flipped the link to `NotOk`, cleared on the
    /// next probe; lets a reader distinguish a fresh failure from a
    /// long-dead link.
    pub just_failed: bool,
    pub consecutive_failures: u32,
    pub probes: u64,
}

impl LinkStatus {
    fn new() -> Self {
        LinkStatus {
            state: LinkState::Ok,
            just_failed: false,
            consecutive_failures: 0,
            probes: 0,
        }
    }
}

/// The opaque probe a monitor invokes on every wake. Implementations
/// typically ping the link's endpoint or ask a sibling server for the
/// link's table state, depending on `MonitorKind`.
pub trait HealthProbe: Send + 'static {
    fn probe(&mut self, kind: MonitorKind) -> Result<(), Error>;
}

impl<F> HealthProbe for F
where
    F: FnMut(MonitorKind) -> Result<(), Error> + Send + 'static,
{
    fn probe(&mut self, kind: MonitorKind) -> Result<(), Error> {
        self(kind)
    }
}

/// Handle to one link's monitor thread. Dropping the handle without
/// calling `stop` leaves the thread running; hand it to
/// `Registry::adopt_monitor` to have shutdown join it.
pub struct Monitor {
    link_idx: usize,
    kill: Arc<(Mutex<bool>, Condvar)>,
    status: Arc<Mutex<LinkStatus>>,
    thread: Option<JoinHandle<()>>,
}

impl Monitor {
    pub fn start<P>(
        options: MonitorOptions,
        link_idx: usize,
        probe: P,
        log: &Logger,
    ) -> Result<Monitor, Error>
    where
        P: HealthProbe,
    {
        let kill = Arc::new((Mutex::new(false), Condvar::new()));
        let status = Arc::new(Mutex::new(LinkStatus::new()));
        let thread_kill = Arc::clone(&kill);
        let thread_status = Arc::clone(&status);
        let thread_log = log.new(slog::o!("link_idx" => link_idx));
        let thread = thread::Builder::new()
            .name(format!("fanlink-mon-{}", link_idx))
            .spawn(move || {
                monitor_main(
                    options,
                    probe,
                    thread_kill,
                    thread_status,
                    thread_log,
                )
            })
            .map_err(|_| Error::OutOfMemory)?;
        Ok(Monitor {
            link_idx,
            kill,
            status,
            thread: Some(thread),
        })
    }

    pub fn link_idx(&self) -> usize {
        self.link_idx
    }

    /// Snapshot of the link's health as of the last probe.
    pub fn status(&self) -> LinkStatus {
        self.status.lock().unwrap().clone()
    }

    /// A clonable handle routing layers can read without holding the
    /// monitor itself.
    pub fn status_handle(&self) -> Arc<Mutex<LinkStatus>> {
        Arc::clone(&self.status)
    }

    /// Wake the monitor early, tell it to exit, and join it.
    pub fn stop(&mut self) {
        let thread = match self.thread.take() {
            Some(t) => t,
            None => return,
        };
        let (lock, cond) = &*self.kill;
        let mut killed = lock.lock().unwrap();
        *killed = true;
        cond.notify_one();
        drop(killed);
        let _ = thread.join();
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn monitor_main<P>(
    options: MonitorOptions,
    mut probe: P,
    kill: Arc<(Mutex<bool>, Condvar)>,
    status: Arc<Mutex<LinkStatus>>,
    log: Logger,
) where
    P: HealthProbe,
{
    let interval = Duration::from_millis(options.interval_ms);
    let (lock, cond) = &*kill;
    let mut killed = lock.lock().unwrap();
    loop {
        let (guard, _) = cond.wait_timeout(killed, interval).unwrap();
        killed = guard;
        if *killed {
            break;
        }
        // Run the probe with the kill lock released; a stop request
        // during a slow probe is honored right after it returns.
        drop(killed);
        let outcome = probe.probe(options.kind);
        record_probe(&status, &options, &outcome, &log);
        killed = lock.lock().unwrap();
        if *killed {
            break;
        }
    }
    debug!(log, "monitor thread exiting");
}

fn record_probe(
    status: &Arc<Mutex<LinkStatus>>,
    options: &MonitorOptions,
    outcome: &Result<(), Error>,
    log: &Logger,
) {
    let mut status = status.lock().unwrap();
    status.probes += 1;
    match outcome {
        Ok(()) => {
            status.state = LinkState::Ok;
            status.just_failed = false;
            status.consecutive_failures = 0;
        }
        Err(err) => {
            status.consecutive_failures += 1;
            let was_ok = status.state != LinkState::NotOk;
            if status.consecutive_failures >= options.failure_threshold {
                status.state = LinkState::NotOk;
                status.just_failed = was_ok;
                if was_ok {
                    warn!(log, "link marked not-ok";
                        "failures" => status.consecutive_failures,
                        "error" => %err);
                }
            } else {
                status.state = LinkState::Indeterminate;
                status.just_failed = false;
                debug!(log, "probe failed";
                    "failures" => status.consecutive_failures,
                    "error" => %err);
            }
        }
    }
}
