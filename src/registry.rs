/*
 * Copyright 2020 Joyent, Inc.
 */

pub mod types;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use slog::{debug, info, warn, Logger};
use uuid::Uuid;

use crate::config::{PoolConfig, RecyclePolicy, RegistryOptions};
use crate::conn::{Conn, ConnId};
use crate::driver::DriverFactory;
use crate::endpoint::{ConnKey, Endpoint, LinkTarget};
use crate::error::Error;
use crate::loop_check;
use crate::monitor::Monitor;
use crate::registry::types::{
    ConnCount, EndpointCounter, RegistryInner, RegistryStats,
};
use crate::tree::ConnTree;
use crate::worker;

/// Caller's advice to `release`: pool the connection if policy allows, or
/// tear it down regardless of policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecycleHint {
    Pool,
    Discard,
}

/// One transaction's (or query context's) private view of the registry:
/// the connections it currently owns, keyed two ways, plus the priority
/// tree ordering them for fan-out. Same-transaction reuse hits this map
/// and never contends on the registry mutex.
pub struct Session {
    id: u64,
    conns: HashMap<ConnKey, Arc<Conn>>,
    by_id: HashMap<ConnId, Arc<Conn>>,
    tree: ConnTree,
}

impl Session {
    fn new(id: u64) -> Self {
        Session {
            id,
            conns: HashMap::new(),
            by_id: HashMap::new(),
            tree: ConnTree::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    pub fn get(&self, key: &ConnKey) -> Option<&Arc<Conn>> {
        self.conns.get(key)
    }

    pub fn conn_by_id(&self, id: ConnId) -> Option<&Arc<Conn>> {
        self.by_id.get(&id)
    }

    fn insert(&mut self, conn: Arc<Conn>) {
        self.by_id.insert(conn.id(), Arc::clone(&conn));
        self.conns.insert(conn.key().clone(), conn);
    }

    fn remove(&mut self, key: &ConnKey) -> Option<Arc<Conn>> {
        let conn = self.conns.remove(key)?;
        self.by_id.remove(&conn.id());
        self.tree.remove(conn.id());
        Some(conn)
    }

    /// Enter the session's connection into the fan-out ordering.
    pub fn tree_insert(&mut self, conn: &Arc<Conn>) {
        if !self.tree.contains(conn.id()) {
            self.tree.insert(conn.id(), conn.priority());
        }
    }

    pub fn tree_remove(&mut self, conn: &Arc<Conn>) {
        self.tree.remove(conn.id());
    }

    pub fn tree_first(&self) -> Option<&Arc<Conn>> {
        self.tree.first().and_then(|id| self.by_id.get(&id))
    }

    pub fn tree_last(&self) -> Option<&Arc<Conn>> {
        self.tree.last().and_then(|id| self.by_id.get(&id))
    }

    pub fn tree_next(&self, conn: &Arc<Conn>) -> Option<&Arc<Conn>> {
        self.tree.next(conn.id()).and_then(|id| self.by_id.get(&id))
    }

    /// Open a new query context on every owned connection; loop-check
    /// state carried over from the previous context is re-queued.
    pub fn begin_query_context(&self) {
        for conn in self.conns.values() {
            loop_check::begin_context(conn);
        }
    }

    /// Close the query context; loop-check entries it created are
    /// dropped, ignored repeats survive for the next context.
    pub fn end_query_context(&self) {
        for conn in self.conns.values() {
            loop_check::end_context(conn);
        }
    }

    fn drain(&mut self) -> Vec<Arc<Conn>> {
        self.by_id.clear();
        self.tree = ConnTree::new();
        self.conns.drain().map(|(_, c)| c).collect()
    }
}

/// The process-wide connection registry: the keyed idle pool, the
/// per-endpoint admission counters, and explicit startup/shutdown. One
/// `Registry` is constructed by the host at startup and passed through
/// context; nothing here is file-scope mutable state.
pub struct Registry {
    log: Logger,
    config: PoolConfig,
    instance_token: String,
    create_driver: Mutex<DriverFactory>,
    next_conn_id: AtomicU64,
    next_session_id: AtomicU64,
    shutting_down: AtomicBool,
    inner: Mutex<RegistryInner>,
    endpoints: Mutex<HashMap<Endpoint, Arc<EndpointCounter>>>,
    monitors: Mutex<Vec<Monitor>>,
}

impl Registry {
    pub fn new(options: RegistryOptions) -> Self {
        let instance_token =
            Uuid::new_v4().to_simple().to_string();
        info!(options.log, "connection registry initialized";
            "instance" => %instance_token,
            "max_per_endpoint" => options.config.max_connections_per_endpoint);
        Registry {
            log: options.log,
            config: options.config,
            instance_token,
            create_driver: Mutex::new(options.create_driver),
            next_conn_id: AtomicU64::new(1),
            next_session_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            inner: Mutex::new(RegistryInner::new()),
            endpoints: Mutex::new(HashMap::new()),
            monitors: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The process-unique token loop-check fingerprints embed.
    pub fn instance_token(&self) -> &str {
        &self.instance_token
    }

    pub fn open_session(&self) -> Session {
        Session::new(self.next_session_id.fetch_add(1, AtomicOrdering::SeqCst))
    }

    /// Look up or lazily create the admission counter for an endpoint.
    /// Counters are never destroyed once created.
    fn counter_for(&self, endpoint: Endpoint) -> Arc<EndpointCounter> {
        let mut endpoints = self.endpoints.lock().unwrap();
        let max = self.config.max_connections_per_endpoint;
        Arc::clone(
            endpoints
                .entry(endpoint.clone())
                .or_insert_with(|| {
                    Arc::new(EndpointCounter::new(endpoint, max))
                }),
        )
    }

    /// Get a connection for `target`, in order of preference: the
    /// session's own set, the global idle pool, a freshly built
    /// connection admitted under the endpoint's cap. Blocks up to the
    /// configured admission timeout when the endpoint is at capacity.
    pub fn acquire(
        &self,
        target: &LinkTarget,
        session: &mut Session,
    ) -> Result<Arc<Conn>, Error> {
        if self.shutting_down.load(AtomicOrdering::SeqCst) {
            return Err(Error::Shutdown);
        }
        let key = ConnKey::for_link(target);
        if let Some(conn) = session.get(&key) {
            let conn = Arc::clone(conn);
            conn.rebind(target);
            return Ok(conn);
        }
        if let Some(conn) = self.pop_idle(&key) {
            debug!(self.log, "reusing pooled connection";
                "conn_id" => conn.id(), "session" => session.id);
            conn.rebind(target);
            session.insert(Arc::clone(&conn));
            return Ok(conn);
        }
        let counter = self.counter_for(target.endpoint());
        let conn = match self.admit(&key, &counter)? {
            Some(pooled) => {
                pooled.rebind(target);
                pooled
            }
            None => self.build_conn(target, &counter)?,
        };
        session.insert(Arc::clone(&conn));
        Ok(conn)
    }

    /// Admission control for one endpoint. Returns `Ok(Some(conn))` when
    /// a pooled connection for this key appeared while waiting (ownership
    /// transfer; the live count is unchanged), `Ok(None)` when a unit of
    /// capacity was claimed for a new connection, and
    /// `Err(CapacityExceeded)` when the deadline passed first.
    fn admit(
        &self,
        key: &ConnKey,
        counter: &Arc<EndpointCounter>,
    ) -> Result<Option<Arc<Conn>>, Error> {
        let max = counter.max();
        loop {
            {
                let mut state = counter.lock();
                if max == 0 || state.live < max {
                    state.live += 1;
                    return Ok(None);
                }
            }
            // At capacity. An idle connection on this endpoint holds a
            // unit of capacity nobody is using; evict it and retry.
            match self.evict_idle_on_endpoint(counter.endpoint()) {
                Some(victim) => {
                    info!(self.log, "evicting idle connection under \
                          capacity pressure";
                        "conn_id" => victim.id(),
                        "endpoint" => %counter.endpoint());
                    self.teardown(&victim);
                }
                None => break,
            }
        }

        let timeout =
            Duration::from_millis(self.config.admission_wait_timeout_ms);
        let deadline = Instant::now() + timeout;
        let mut state = counter.lock();
        state.waiters += 1;
        loop {
            // Re-evaluated on every wake, spurious or signaled; no wake
            // is assumed to target this specific waiter.
            if max == 0 || state.live < max {
                state.live += 1;
                state.waiters -= 1;
                return Ok(None);
            }
            let now = Instant::now();
            if now >= deadline {
                state.waiters -= 1;
                return Err(Error::CapacityExceeded {
                    endpoint: counter.endpoint().name(),
                    waited_ms: timeout.as_millis() as u64,
                });
            }
            state = counter.wait_timeout(state, deadline - now);

            // A release may have pooled a connection for this very key;
            // claiming it transfers ownership without touching the live
            // count. The registry lock is taken with the counter lock
            // released to respect the registry -> counter lock order.
            drop(state);
            if let Some(conn) = self.pop_idle(key) {
                let mut state = counter.lock();
                state.waiters -= 1;
                drop(state);
                return Ok(Some(conn));
            }
            // A release may instead have pooled a different key's
            // connection on this endpoint; evict it to free its unit of
            // capacity.
            if let Some(victim) = self.evict_idle_on_endpoint(counter.endpoint())
            {
                self.teardown(&victim);
            }
            state = counter.lock();
        }
    }

    /// Build a connection for a claimed unit of endpoint capacity. On any
    /// failure the claim is returned and a waiter signaled; a half-built
    /// connection is never registered anywhere.
    fn build_conn(
        &self,
        target: &LinkTarget,
        counter: &Arc<EndpointCounter>,
    ) -> Result<Arc<Conn>, Error> {
        let driver_result = {
            let mut create = self.create_driver.lock().unwrap();
            (*create)(target)
        };
        let driver = match driver_result {
            Ok(driver) => driver,
            Err(err) => {
                let mut state = counter.lock();
                state.live -= 1;
                drop(state);
                counter.notify_one();
                warn!(self.log, "driver construction failed";
                    "endpoint" => %counter.endpoint(), "error" => %err);
                return Err(err);
            }
        };
        let id = self.next_conn_id.fetch_add(1, AtomicOrdering::SeqCst);
        let conn = Arc::new(Conn::new(
            id,
            target,
            driver,
            Arc::clone(counter),
            self.instance_token.clone(),
            self.log.clone(),
        ));
        let mut inner = self.inner.lock().unwrap();
        inner.total += ConnCount::from(1);
        drop(inner);
        debug!(self.log, "created connection";
            "conn_id" => id, "endpoint" => %counter.endpoint());
        Ok(conn)
    }

    fn pop_idle(&self, key: &ConnKey) -> Option<Arc<Conn>> {
        let mut inner = self.inner.lock().unwrap();
        let conn = {
            let queue = inner.idle.get_mut(key)?;
            queue.pop_front()
        };
        if let Some(conn) = &conn {
            if inner.idle.get(key).map(|q| q.is_empty()).unwrap_or(false) {
                inner.idle.remove(key);
            }
            inner.idle_count -= ConnCount::from(1);
            conn.set_in_idle_pool(false);
        }
        conn
    }

    fn evict_idle_on_endpoint(&self, endpoint: &Endpoint) -> Option<Arc<Conn>> {
        let mut inner = self.inner.lock().unwrap();
        let key = inner
            .idle
            .iter()
            .find(|(_, queue)| {
                queue
                    .front()
                    .map(|c| c.endpoint() == endpoint)
                    .unwrap_or(false)
            })
            .map(|(key, _)| key.clone())?;
        let conn = inner.idle.get_mut(&key).and_then(|q| q.pop_front());
        if let Some(conn) = &conn {
            if inner.idle.get(&key).map(|q| q.is_empty()).unwrap_or(false) {
                inner.idle.remove(&key);
            }
            inner.idle_count -= ConnCount::from(1);
            conn.set_in_idle_pool(false);
        }
        conn
    }

    /// Give a connection back. Per policy and hint it is scrubbed and
    /// pooled (signaling one admission waiter) or torn down. Connections
    /// that saw a network or protocol error are always torn down.
    pub fn release(
        &self,
        conn: Arc<Conn>,
        session: &mut Session,
        hint: RecycleHint,
    ) {
        session.remove(conn.key());
        self.give_back(conn, hint);
    }

    /// Release every connection a session still owns, in unspecified
    /// order. Hosts call this at transaction end.
    pub fn release_all(&self, session: &mut Session, hint: RecycleHint) {
        for conn in session.drain() {
            self.give_back(conn, hint);
        }
    }

    fn give_back(&self, conn: Arc<Conn>, hint: RecycleHint) {
        let policy_allows = match self.config.recycle {
            RecyclePolicy::PoolByKey => hint == RecycleHint::Pool,
            RecyclePolicy::DestroyAlways
            | RecyclePolicy::PoolWithinTransaction => false,
        };
        let pool_it = policy_allows
            && conn.is_usable()
            && !self.shutting_down.load(AtomicOrdering::SeqCst);
        if !pool_it {
            self.teardown(&conn);
            return;
        }
        // A connection is owned by the idle pool or by one session,
        // never both.
        debug_assert!(!conn.in_idle_pool());
        conn.scrub();
        let mut inner = self.inner.lock().unwrap();
        inner
            .idle
            .entry(conn.key().clone())
            .or_insert_with(Default::default)
            .push_back(Arc::clone(&conn));
        inner.idle_count += ConnCount::from(1);
        conn.set_in_idle_pool(true);
        drop(inner);
        debug!(self.log, "pooled connection"; "conn_id" => conn.id());
        // One blocked acquirer may now claim the pooled connection.
        conn.counter().notify_one();
    }

    /// Kill and join the worker, close the driver, return the unit of
    /// endpoint capacity and wake one waiter. Strictly reverse
    /// construction order.
    fn teardown(&self, conn: &Arc<Conn>) {
        worker::kill_worker(conn);
        conn.close_driver();
        let mut inner = self.inner.lock().unwrap();
        inner.total -= ConnCount::from(1);
        drop(inner);
        let counter = conn.counter();
        let mut state = counter.lock();
        state.live -= 1;
        drop(state);
        counter.notify_one();
        debug!(self.log, "connection torn down"; "conn_id" => conn.id());
    }

    /// Adopt a link monitor so `shutdown` joins it with everything else.
    pub fn adopt_monitor(&self, monitor: Monitor) {
        self.monitors.lock().unwrap().push(monitor);
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.lock().unwrap();
        let mut stats = RegistryStats::new();
        stats.total_connections = inner.total;
        stats.idle_connections = inner.idle_count;
        drop(inner);
        let endpoints = self.endpoints.lock().unwrap();
        for (endpoint, counter) in endpoints.iter() {
            stats.endpoint_live.insert(endpoint.name(), counter.live());
        }
        stats
    }

    /// Drain the registry: close every idle connection and join every
    /// worker and adopted monitor thread. Sessions must have released
    /// their connections first; anything still outstanding is logged and
    /// left to its owner.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, AtomicOrdering::SeqCst);
        info!(self.log, "registry shutting down");
        loop {
            let conn = {
                let mut inner = self.inner.lock().unwrap();
                let key = inner.idle.keys().next().cloned();
                match key {
                    Some(key) => {
                        let conn =
                            inner.idle.get_mut(&key).and_then(|q| q.pop_front());
                        if inner
                            .idle
                            .get(&key)
                            .map(|q| q.is_empty())
                            .unwrap_or(false)
                        {
                            inner.idle.remove(&key);
                        }
                        if conn.is_some() {
                            inner.idle_count -= ConnCount::from(1);
                        }
                        conn
                    }
                    None => None,
                }
            };
            match conn {
                Some(conn) => {
                    conn.set_in_idle_pool(false);
                    self.teardown(&conn);
                }
                None => break,
            }
        }
        let mut monitors = self.monitors.lock().unwrap();
        for mut monitor in monitors.drain(..) {
            monitor.stop();
        }
        drop(monitors);
        let inner = self.inner.lock().unwrap();
        if inner.total > ConnCount::from(0) {
            warn!(self.log, "sessions still hold connections at shutdown";
                "outstanding" => %inner.total);
        }
    }
}
