/*
 * Copyright 2020 Joyent, Inc.
 */

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use derive_more::{Add, AddAssign, Display, From, Into, Sub, SubAssign};

use crate::conn::Conn;
use crate::endpoint::{ConnKey, Endpoint};

#[derive(
    Add, AddAssign, Clone, Copy, Debug, Display, Eq, From, Into, Ord,
    PartialOrd, PartialEq, Sub, SubAssign,
)]
pub struct ConnCount(u32);

/// Live/idle accounting for the whole registry, snapshotted under the
/// registry mutex.
#[derive(Clone, Debug)]
pub struct RegistryStats {
    pub total_connections: ConnCount,
    pub idle_connections: ConnCount,
    /// Live count per endpoint, as the admission counters see it.
    pub endpoint_live: HashMap<String, u32>,
}

impl RegistryStats {
    pub fn new() -> Self {
        RegistryStats {
            total_connections: ConnCount::from(0),
            idle_connections: ConnCount::from(0),
            endpoint_live: HashMap::new(),
        }
    }
}

pub(crate) struct CounterState {
    pub(crate) live: u32,
    pub(crate) waiters: u32,
}

/// Admission state for one endpoint: the live-connection count, the
/// number of blocked acquirers and the condvar they wait on. Created
/// lazily on first connection to the endpoint and retained for process
/// life; the registry map only ever grows, which is acceptable at the
/// scale of configured endpoints.
pub struct EndpointCounter {
    endpoint: Endpoint,
    max: u32,
    state: Mutex<CounterState>,
    cond: Condvar,
}

impl EndpointCounter {
    pub(crate) fn new(endpoint: Endpoint, max: u32) -> Self {
        EndpointCounter {
            endpoint,
            max,
            state: Mutex::new(CounterState {
                live: 0,
                waiters: 0,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The configured cap; 0 means unbounded.
    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn live(&self) -> u32 {
        self.state.lock().unwrap().live
    }

    pub fn waiters(&self) -> u32 {
        self.state.lock().unwrap().waiters
    }

    pub(crate) fn lock(&self) -> MutexGuard<CounterState> {
        self.state.lock().unwrap()
    }

    /// Bounded wait for a release signal. Returns the reacquired guard;
    /// the caller re-evaluates its predicate on every wake, spurious or
    /// not.
    pub(crate) fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, CounterState>,
        timeout: Duration,
    ) -> MutexGuard<'a, CounterState> {
        self.cond.wait_timeout(guard, timeout).unwrap().0
    }

    /// Wake one admission waiter after a release or teardown freed
    /// capacity (or returned a pooled connection they may claim).
    pub(crate) fn notify_one(&self) {
        self.cond.notify_one();
    }
}

/// Map state guarded by the registry mutex: the keyed idle pool plus
/// counts. Held only for O(1) map operations, never across I/O.
pub(crate) struct RegistryInner {
    pub(crate) idle: HashMap<ConnKey, VecDeque<Arc<Conn>>>,
    pub(crate) idle_count: ConnCount,
    pub(crate) total: ConnCount,
}

impl RegistryInner {
    pub(crate) fn new() -> Self {
        RegistryInner {
            idle: HashMap::new(),
            idle_count: ConnCount::from(0),
            total: ConnCount::from(0),
        }
    }
}
