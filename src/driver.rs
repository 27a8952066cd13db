/*
 * Copyright 2020 Joyent, Inc.
 */

use crate::conn::PendingMutation;
use crate::error::Error;

/// What kind of statement is being shipped to the remote, for drivers that
/// route DDL or admin traffic differently.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SqlKind {
    Select,
    Dml,
    Ddl,
    Admin,
}

/// An already-rendered remote statement. This crate never builds SQL; the
/// handler layer above renders statements in the remote dialect and hands
/// them down opaque.
#[derive(Clone, Debug)]
pub struct Statement(pub String);

pub type Row = Vec<String>;

/// Caller-owned buffer a `Search` job stores its result set into.
#[derive(Debug, Default)]
pub struct RowBuffer {
    rows: Vec<Row>,
    complete: bool,
}

impl RowBuffer {
    pub fn new() -> Self {
        RowBuffer {
            rows: Vec::new(),
            complete: false,
        }
    }

    pub fn push(&mut self, row: Row) {
        self.rows.push(row);
    }

    pub fn finish(&mut self) {
        self.complete = true;
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.complete = false;
    }
}

/// Remote driver for one protocol family.
///
/// The `RemoteDriver` trait is the seam between this connection core and
/// the wire protocol of a specific remote database. Implementations are
/// created by the factory closure supplied in `RegistryOptions` and are
/// driven only from the owning connection's worker thread or from a caller
/// holding the connection, never concurrently. Failures are reported in
/// this crate's error taxonomy; the driver decides whether a failure is
/// `NetworkError`, `ServerLost` or `MalformedProtocol` and the core reacts
/// (an unusable connection is never pooled again) without interpreting the
/// failure further.
pub trait RemoteDriver: Send + 'static {
    /// Establish the wire connection. Called lazily, before the first job
    /// on a connection, never from the registry's locks.
    fn connect(&mut self) -> Result<(), Error>;
    /// Close the wire connection. Must be idempotent.
    fn disconnect(&mut self) -> Result<(), Error>;
    /// Liveness probe over the existing wire connection.
    fn ping(&mut self) -> Result<(), Error>;
    /// Ship one statement.
    fn execute(&mut self, stmt: &Statement, kind: SqlKind)
        -> Result<(), Error>;
    /// Fetch the pending result set of the last `execute` into `buf`.
    fn store_result(&mut self, buf: &mut RowBuffer) -> Result<(), Error>;
    /// Drain and drop the pending result set of the last `execute`.
    fn discard_result(&mut self) -> Result<(), Error>;
    /// Count rows of the link's remote table without fetching them.
    fn record_count(&mut self) -> Result<u64, Error>;

    /// Apply one queued session mutation. `Connect` and `Ping` are routed
    /// to `connect`/`ping` by the worker and never reach this method.
    fn apply(&mut self, mutation: &PendingMutation) -> Result<(), Error>;
}

/// Factory closure building a driver for a link, in the mold of the pool's
/// `create_connection` parameter. Construction allocates only; no I/O
/// happens until `connect`.
pub type DriverFactory = Box<
    dyn FnMut(&crate::endpoint::LinkTarget) -> Result<Box<dyn RemoteDriver>, Error>
        + Send,
>;
