/*
 * Copyright 2020 Joyent, Inc.
 */

//! One background worker thread per connection.
//!
//! The worker owns its connection's job mutex for the whole life of a job
//! and parks in a condvar wait while idle, so callers that touch the
//! connection serialize behind the running job without any extra
//! bookkeeping. Jobs hand off through a single-slot mailbox; completion
//! and receipt travel back through a per-job sync state, never across the
//! thread boundary as a panic or return value.

use std::collections::VecDeque;
use std::sync::{Arc, Barrier, Condvar, Mutex};
use std::thread;

use slog::{debug, warn, Logger};

use crate::conn::{apply_pending, Conn};
use crate::driver::{RowBuffer, SqlKind, Statement};
use crate::error::Error;

/// Fire-and-forget actions executed within the synchronous contract.
#[derive(Clone, Debug)]
pub enum SimpleAction {
    Connect,
    Disconnect,
    Ping,
    RecordCount { out: Arc<Mutex<u64>> },
}

/// The kinds of work a connection's worker accepts. Exactly one job
/// occupies the mailbox at a time.
#[derive(Clone, Debug)]
pub enum Job {
    Connect,
    Disconnect,
    Search {
        statement: Statement,
        target: Arc<Mutex<RowBuffer>>,
        discard_result: bool,
    },
    /// Independent statements drained until empty or the first error;
    /// on error the remainder is discarded, not silently skipped.
    SqlBatch(VecDeque<(Statement, SqlKind)>),
    ExecSql {
        statement: Statement,
        kind: SqlKind,
    },
    Simple(SimpleAction),
}

/// How the dispatching caller synchronizes with the worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchMode {
    /// The caller observes full completion at the ticket rendezvous.
    CallerWait,
    /// The caller is released as soon as the worker acknowledges receipt;
    /// used when chaining a gate hand-off to a sibling during fan-out.
    CallerSyncWait,
}

/// Serializes sibling dispatches during fan-out. The dispatching caller
/// acquires the gate of the fan-out's first connection before each
/// chained dispatch; the receiving worker releases it right after
/// acknowledging, before any blocking I/O, so no two connections' locks
/// are ever held together.
pub struct ChainGate {
    held: Mutex<bool>,
    cond: Condvar,
}

impl ChainGate {
    pub fn new() -> Self {
        ChainGate {
            held: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn acquire(&self) {
        let mut held = self.held.lock().unwrap();
        while *held {
            held = self.cond.wait(held).unwrap();
        }
        *held = true;
    }

    pub fn release(&self) {
        let mut held = self.held.lock().unwrap();
        *held = false;
        self.cond.notify_one();
    }
}

impl Default for ChainGate {
    fn default() -> Self {
        ChainGate::new()
    }
}

struct JobPhase {
    acked: bool,
    done: bool,
    result: Option<Result<(), Error>>,
}

/// Per-job rendezvous state: the caller-owned slot the worker writes the
/// outcome into. Allocated fresh for every dispatch, so a slow `wait`
/// can never observe a later job's state.
pub(crate) struct JobState {
    phase: Mutex<JobPhase>,
    cond: Condvar,
}

impl JobState {
    fn new() -> Self {
        JobState {
            phase: Mutex::new(JobPhase {
                acked: false,
                done: false,
                result: None,
            }),
            cond: Condvar::new(),
        }
    }

    fn ack(&self) {
        let mut phase = self.phase.lock().unwrap();
        phase.acked = true;
        self.cond.notify_all();
    }

    fn complete(&self, result: Result<(), Error>) {
        let mut phase = self.phase.lock().unwrap();
        phase.acked = true;
        phase.done = true;
        phase.result = Some(result);
        self.cond.notify_all();
    }

    fn wait_acked(&self) {
        let mut phase = self.phase.lock().unwrap();
        while !phase.acked {
            phase = self.cond.wait(phase).unwrap();
        }
    }

    fn wait_done(&self) -> Result<(), Error> {
        let mut phase = self.phase.lock().unwrap();
        while !phase.done {
            phase = self.cond.wait(phase).unwrap();
        }
        phase
            .result
            .clone()
            .unwrap_or_else(|| Err(Error::Internal(String::from(
                "job completed without a recorded result",
            ))))
    }
}

/// What actually sits in the mailbox: the job plus its rendezvous state
/// and an optional foreign chain gate to release after acknowledgment.
pub(crate) struct JobEnvelope {
    job: Job,
    state: Arc<JobState>,
    mode: DispatchMode,
    chain: Option<Arc<ChainGate>>,
}

/// Handle to one dispatched job. `wait` blocks until the worker records
/// the job's final state and returns it; it is the only rendezvous point
/// at which errors cross the thread boundary.
pub struct JobTicket {
    state: Arc<JobState>,
}

impl JobTicket {
    pub fn wait(self) -> Result<(), Error> {
        self.state.wait_done()
    }
}

/// Hand a job to the connection's worker, starting the worker thread on
/// first use. With `CallerSyncWait` the call returns once the worker has
/// acknowledged receipt; with `CallerWait` it returns immediately and the
/// caller observes completion via `JobTicket::wait`.
pub fn dispatch(
    conn: &Arc<Conn>,
    job: Job,
    mode: DispatchMode,
) -> Result<JobTicket, Error> {
    dispatch_inner(conn, job, mode, None)
}

/// Chained dispatch for fan-out: acquires `gate` (normally the fan-out's
/// first connection's gate), hands the job off with `CallerSyncWait`, and
/// leaves the release to the receiving worker.
pub fn dispatch_chained(
    conn: &Arc<Conn>,
    job: Job,
    gate: &Arc<ChainGate>,
) -> Result<JobTicket, Error> {
    gate.acquire();
    dispatch_inner(
        conn,
        job,
        DispatchMode::CallerSyncWait,
        Some(Arc::clone(gate)),
    )
}

fn dispatch_inner(
    conn: &Arc<Conn>,
    job: Job,
    mode: DispatchMode,
    chain: Option<Arc<ChainGate>>,
) -> Result<JobTicket, Error> {
    ensure_worker(conn)?;
    let state = Arc::new(JobState::new());
    {
        let mut mailbox = conn.mailbox().lock().unwrap();
        while mailbox.job.is_some() && !mailbox.kill {
            mailbox = conn.job_cond().wait(mailbox).unwrap();
        }
        if mailbox.kill {
            if let Some(gate) = &chain {
                gate.release();
            }
            return Err(Error::Shutdown);
        }
        mailbox.job = Some(JobEnvelope {
            job,
            state: Arc::clone(&state),
            mode,
            chain,
        });
        conn.job_cond().notify_all();
    }
    if mode == DispatchMode::CallerSyncWait {
        state.wait_acked();
    }
    Ok(JobTicket { state })
}

/// Start the connection's worker thread if it is not already running.
pub(crate) fn ensure_worker(conn: &Arc<Conn>) -> Result<(), Error> {
    let mut slot = conn.worker_slot().lock().unwrap();
    if slot.initialized {
        return Ok(());
    }
    let ready = Arc::new(Barrier::new(2));
    let thread_conn = Arc::clone(conn);
    let thread_ready = Arc::clone(&ready);
    let handle = thread::Builder::new()
        .name(format!("fanlink-conn-{}", conn.id()))
        .spawn(move || worker_main(thread_conn, thread_ready))
        .map_err(|_| Error::OutOfMemory)?;
    // Wait for the worker to come up before publishing the handle.
    ready.wait();
    slot.handle = Some(handle);
    slot.initialized = true;
    debug!(conn.log(), "background worker started");
    Ok(())
}

/// Cooperative teardown: requested only between jobs, completed with a
/// join, never a forced stop mid-I/O. Blocks until the running job, if
/// any, finishes.
pub(crate) fn kill_worker(conn: &Conn) {
    let mut slot = conn.worker_slot().lock().unwrap();
    let handle = match slot.handle.take() {
        Some(h) => h,
        None => return,
    };
    // The atomic request is visible to a worker mid-batch; the mailbox
    // flag and signal cover a worker parked on its condvar.
    conn.request_kill(true);
    {
        let mut mailbox = conn.mailbox().lock().unwrap();
        mailbox.kill = true;
        conn.job_cond().notify_all();
    }
    let _ = handle.join();
    let mut mailbox = conn.mailbox().lock().unwrap();
    mailbox.kill = false;
    conn.request_kill(false);
    slot.initialized = false;
    debug!(conn.log(), "background worker joined");
}

fn worker_main(conn: Arc<Conn>, ready: Arc<Barrier>) {
    let log = conn.log().clone();
    ready.wait();
    let mut mailbox = conn.mailbox().lock().unwrap();
    loop {
        while mailbox.job.is_none() && !mailbox.kill {
            mailbox = conn.job_cond().wait(mailbox).unwrap();
        }
        if mailbox.kill {
            if let Some(envelope) = mailbox.job.take() {
                envelope.state.complete(Err(Error::Shutdown));
                if let Some(gate) = &envelope.chain {
                    gate.release();
                }
            }
            break;
        }
        let envelope = mailbox.job.take().unwrap();
        // The slot is free again; wake any caller parked on it.
        conn.job_cond().notify_all();
        // Receipt is acknowledged, and any foreign chain gate released,
        // strictly before blocking I/O can start.
        if envelope.mode == DispatchMode::CallerSyncWait {
            envelope.state.ack();
        }
        if let Some(gate) = &envelope.chain {
            gate.release();
        }
        let result = run_job(&conn, &mut mailbox, &log, envelope.job);
        if let Err(err) = &result {
            if err.marks_unusable() {
                mailbox.unusable = true;
            }
        }
        envelope.state.complete(result);
    }
}

fn run_job(
    conn: &Conn,
    mailbox: &mut std::sync::MutexGuard<crate::conn::Mailbox>,
    log: &Logger,
    job: Job,
) -> Result<(), Error> {
    apply_pending(mailbox, log)?;
    match job {
        Job::Connect => mailbox.driver.connect(),
        Job::Disconnect => mailbox.driver.disconnect(),
        Job::Search {
            statement,
            target,
            discard_result,
        } => {
            debug!(log, "bg search"; "discard" => discard_result);
            mailbox.driver.execute(&statement, SqlKind::Select)?;
            if discard_result {
                mailbox.driver.discard_result()
            } else {
                let mut buf = target.lock().unwrap();
                mailbox.driver.store_result(&mut buf)?;
                buf.finish();
                Ok(())
            }
        }
        Job::SqlBatch(mut statements) => {
            let mut executed = 0usize;
            while let Some((statement, kind)) = statements.pop_front() {
                if conn.kill_requested() {
                    warn!(log, "batch interrupted by kill";
                        "executed" => executed,
                        "discarded" => statements.len());
                    return Err(Error::Shutdown);
                }
                if let Err(err) = mailbox.driver.execute(&statement, kind) {
                    warn!(log, "batch aborted";
                        "executed" => executed,
                        "discarded" => statements.len(),
                        "error" => %err);
                    statements.clear();
                    return Err(err);
                }
                executed += 1;
            }
            Ok(())
        }
        Job::ExecSql { statement, kind } => {
            mailbox.driver.execute(&statement, kind)
        }
        Job::Simple(action) => match action {
            SimpleAction::Connect => mailbox.driver.connect(),
            SimpleAction::Disconnect => mailbox.driver.disconnect(),
            SimpleAction::Ping => mailbox.driver.ping(),
            SimpleAction::RecordCount { out } => {
                let n = mailbox.driver.record_count()?;
                *out.lock().unwrap() = n;
                Ok(())
            }
        },
    }
}
