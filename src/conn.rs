/*
 * Copyright 2020 Joyent, Inc.
 */

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use slog::{debug, Logger};

use crate::driver::RemoteDriver;
use crate::endpoint::{ConnKey, Endpoint, LinkTarget};
use crate::error::Error;
use crate::loop_check::LoopCheckState;
use crate::registry::types::EndpointCounter;
use crate::worker::{ChainGate, JobEnvelope};

/// Stable handle naming a connection in logs and in the connection tree.
pub type ConnId = u64;

/// Remote transaction isolation level, applied by a queued mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// A session-state change queued against a connection and applied, in
/// queue order, immediately before the next job executes on it. This is
/// the ordered-list rendition of the original's per-flag "queued_*"
/// booleans: one list, applied atomically, nothing to keep consistent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PendingMutation {
    Connect,
    Ping,
    SetIsolationLevel(IsolationLevel),
    SetAutocommit(bool),
    SetSqlLogOff(bool),
    SetTimeZone(String),
    StartTransaction,
    XaStart(String),
}

impl PendingMutation {
    /// Mutations that survive a return to the idle pool. Everything else
    /// is per-session state and is scrubbed on release.
    fn survives_scrub(&self) -> bool {
        match self {
            PendingMutation::Connect | PendingMutation::Ping => true,
            _ => false,
        }
    }
}

/// State guarded by the connection's job mutex: the driver, the queued
/// mutations and the single-slot job mailbox. The worker thread holds this
/// lock for a job's whole duration, so a second dispatch blocks until the
/// first completes.
pub(crate) struct Mailbox {
    pub(crate) driver: Box<dyn RemoteDriver>,
    pub(crate) pending: Vec<PendingMutation>,
    pub(crate) job: Option<JobEnvelope>,
    pub(crate) kill: bool,
    pub(crate) unusable: bool,
}

pub(crate) struct WorkerSlot {
    pub(crate) handle: Option<JoinHandle<()>>,
    pub(crate) initialized: bool,
}

/// The unit of pooled state: one live connection to one remote endpoint.
///
/// A `Conn` is referenced by exactly one of the registry's idle pool or
/// one session's active set at any time; the registry enforces the
/// hand-offs. All interior state is synchronized, so holders share it as
/// `Arc<Conn>`.
pub struct Conn {
    id: ConnId,
    key: ConnKey,
    endpoint: Endpoint,
    wrapper: String,
    link_idx: AtomicI64,
    priority: AtomicI64,
    instance_token: String,
    counter: Arc<EndpointCounter>,
    log: Logger,
    mailbox: Mutex<Mailbox>,
    job_cond: Condvar,
    chain: Arc<ChainGate>,
    worker: Mutex<WorkerSlot>,
    loop_check: Mutex<LoopCheckState>,
    in_idle_pool: AtomicBool,
    kill_requested: AtomicBool,
}

impl Conn {
    pub(crate) fn new(
        id: ConnId,
        target: &LinkTarget,
        driver: Box<dyn RemoteDriver>,
        counter: Arc<EndpointCounter>,
        instance_token: String,
        log: Logger,
    ) -> Conn {
        let key = ConnKey::for_link(target);
        let log = log.new(slog::o!(
            "conn_id" => id,
            "endpoint" => target.endpoint().name()
        ));
        Conn {
            id,
            key,
            endpoint: target.endpoint(),
            wrapper: target.wrapper.clone(),
            link_idx: AtomicI64::new(target.link_idx as i64),
            priority: AtomicI64::new(target.priority),
            instance_token,
            counter,
            log,
            mailbox: Mutex::new(Mailbox {
                driver,
                // The wire connect itself is deferred to first use.
                pending: vec![PendingMutation::Connect],
                job: None,
                kill: false,
                unusable: false,
            }),
            job_cond: Condvar::new(),
            chain: Arc::new(ChainGate::new()),
            worker: Mutex::new(WorkerSlot {
                handle: None,
                initialized: false,
            }),
            loop_check: Mutex::new(LoopCheckState::new()),
            in_idle_pool: AtomicBool::new(false),
            kill_requested: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn key(&self) -> &ConnKey {
        &self.key
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn wrapper(&self) -> &str {
        &self.wrapper
    }

    pub fn link_idx(&self) -> usize {
        self.link_idx.load(AtomicOrdering::Relaxed) as usize
    }

    pub fn priority(&self) -> i64 {
        self.priority.load(AtomicOrdering::Relaxed)
    }

    /// Called on acquire when a pooled connection is handed to a link with
    /// a different base index or weight.
    pub(crate) fn rebind(&self, target: &LinkTarget) {
        self.link_idx
            .store(target.link_idx as i64, AtomicOrdering::Relaxed);
        self.priority.store(target.priority, AtomicOrdering::Relaxed);
    }

    pub(crate) fn instance_token(&self) -> &str {
        &self.instance_token
    }

    pub(crate) fn counter(&self) -> &Arc<EndpointCounter> {
        &self.counter
    }

    pub(crate) fn log(&self) -> &Logger {
        &self.log
    }

    pub(crate) fn mailbox(&self) -> &Mutex<Mailbox> {
        &self.mailbox
    }

    pub(crate) fn job_cond(&self) -> &Condvar {
        &self.job_cond
    }

    pub(crate) fn worker_slot(&self) -> &Mutex<WorkerSlot> {
        &self.worker
    }

    pub(crate) fn loop_check_state(&self) -> &Mutex<LoopCheckState> {
        &self.loop_check
    }

    /// This connection's own chain gate, held by a dispatching caller
    /// across sibling dispatches during fan-out.
    pub fn chain_gate(&self) -> &Arc<ChainGate> {
        &self.chain
    }

    /// Cooperative cancellation request, visible to the worker between
    /// batch items while it still holds the job mutex.
    pub(crate) fn request_kill(&self, v: bool) {
        self.kill_requested.store(v, AtomicOrdering::SeqCst);
    }

    pub(crate) fn kill_requested(&self) -> bool {
        self.kill_requested.load(AtomicOrdering::SeqCst)
    }

    pub(crate) fn set_in_idle_pool(&self, v: bool) {
        self.in_idle_pool.store(v, AtomicOrdering::SeqCst);
    }

    pub(crate) fn in_idle_pool(&self) -> bool {
        self.in_idle_pool.load(AtomicOrdering::SeqCst)
    }

    /// Queue a session-state change to be applied before the next job.
    pub fn queue_mutation(&self, mutation: PendingMutation) {
        let mut mailbox = self.mailbox.lock().unwrap();
        mailbox.pending.push(mutation);
    }

    /// Number of queued mutations; mostly useful to tests and stats.
    pub fn pending_mutations(&self) -> usize {
        self.mailbox.lock().unwrap().pending.len()
    }

    /// Drop per-session queued state ahead of a return to the idle pool.
    pub(crate) fn scrub(&self) {
        let mut mailbox = self.mailbox.lock().unwrap();
        mailbox.pending.retain(|m| m.survives_scrub());
    }

    /// A connection that saw a network or protocol error is excluded from
    /// pooling and torn down on release.
    pub fn is_usable(&self) -> bool {
        !self.mailbox.lock().unwrap().unusable
    }

    /// Use the connection synchronously from the calling thread. Queued
    /// mutations are applied first; if the worker is busy or a job is
    /// pending, this blocks until the mailbox drains, preserving
    /// per-connection job ordering.
    pub fn with_driver<T, F>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut dyn RemoteDriver) -> Result<T, Error>,
    {
        let mut mailbox = self.mailbox.lock().unwrap();
        while mailbox.job.is_some() && !mailbox.kill {
            mailbox = self.job_cond.wait(mailbox).unwrap();
        }
        if mailbox.kill {
            return Err(Error::Shutdown);
        }
        apply_pending(&mut mailbox, &self.log)?;
        let result = f(&mut *mailbox.driver);
        if let Err(err) = &result {
            if err.marks_unusable() {
                mailbox.unusable = true;
            }
        }
        result
    }

    /// Close the wire connection; the registry calls this after the
    /// worker is joined. Errors are logged, not propagated: teardown must
    /// finish.
    pub(crate) fn close_driver(&self) {
        let mut mailbox = self.mailbox.lock().unwrap();
        if let Err(err) = mailbox.driver.disconnect() {
            debug!(self.log, "ignoring disconnect error on teardown";
                "error" => %err);
        }
    }
}

/// Apply every queued mutation in order. On the first failure the
/// remaining mutations stay queued and the error is recorded against the
/// job that triggered the drain.
pub(crate) fn apply_pending(
    mailbox: &mut MutexGuard<Mailbox>,
    log: &Logger,
) -> Result<(), Error> {
    while !mailbox.pending.is_empty() {
        let mutation = mailbox.pending.remove(0);
        debug!(log, "applying queued mutation"; "mutation" => ?mutation);
        let result = match &mutation {
            PendingMutation::Connect => mailbox.driver.connect(),
            PendingMutation::Ping => mailbox.driver.ping(),
            other => mailbox.driver.apply(other),
        };
        if let Err(err) = result {
            if err.marks_unusable() {
                mailbox.unusable = true;
            }
            mailbox.pending.insert(0, mutation);
            return Err(err);
        }
    }
    Ok(())
}
