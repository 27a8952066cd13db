#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use slog::{o, Drain, Logger};

use fanlink::config::{PoolConfig, RegistryOptions};
use fanlink::conn::PendingMutation;
use fanlink::driver::{
    DriverFactory, RemoteDriver, RowBuffer, SqlKind, Statement,
};
use fanlink::endpoint::LinkTarget;
use fanlink::error::Error;
use fanlink::registry::Registry;

pub fn test_log() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    )
}

pub fn link_target(
    host: &str,
    port: u16,
    link_idx: usize,
    priority: i64,
) -> LinkTarget {
    LinkTarget {
        host: String::from(host),
        port,
        username: String::from("fed"),
        password: String::from("fedpass"),
        wrapper: String::from("mysql"),
        remote_db: String::from("remote"),
        remote_table: format!("t{}", link_idx),
        link_idx,
        priority,
        monitoring: None,
    }
}

/// Shared control block for every fake driver a test's factory builds:
/// injected failures, canned rows, and per-driver operation logs.
pub struct FakeHub {
    pub created: AtomicUsize,
    op_logs: Mutex<Vec<Arc<Mutex<Vec<String>>>>>,
    pub rows: Mutex<Vec<Vec<String>>>,
    pub fail_execute_containing: Mutex<Option<String>>,
    pub execute_delay_ms: AtomicU64,
}

impl FakeHub {
    pub fn new() -> Arc<FakeHub> {
        Arc::new(FakeHub {
            created: AtomicUsize::new(0),
            op_logs: Mutex::new(Vec::new()),
            rows: Mutex::new(Vec::new()),
            fail_execute_containing: Mutex::new(None),
            execute_delay_ms: AtomicU64::new(0),
        })
    }

    pub fn factory(hub: &Arc<FakeHub>) -> DriverFactory {
        let hub = Arc::clone(hub);
        Box::new(move |_target: &LinkTarget| {
            hub.created.fetch_add(1, AtomicOrdering::SeqCst);
            let ops = Arc::new(Mutex::new(Vec::new()));
            hub.op_logs.lock().unwrap().push(Arc::clone(&ops));
            Ok(Box::new(FakeDriver {
                hub: Arc::clone(&hub),
                ops,
            }) as Box<dyn RemoteDriver>)
        })
    }

    /// Operation log of the n-th driver the factory built.
    pub fn ops_of(&self, n: usize) -> Vec<String> {
        self.op_logs.lock().unwrap()[n].lock().unwrap().clone()
    }

    pub fn set_rows(&self, rows: Vec<Vec<String>>) {
        *self.rows.lock().unwrap() = rows;
    }

    pub fn fail_execute_containing(&self, pattern: &str) {
        *self.fail_execute_containing.lock().unwrap() =
            Some(String::from(pattern));
    }

    pub fn set_execute_delay_ms(&self, ms: u64) {
        self.execute_delay_ms.store(ms, AtomicOrdering::SeqCst);
    }
}

pub struct FakeDriver {
    hub: Arc<FakeHub>,
    ops: Arc<Mutex<Vec<String>>>,
}

impl FakeDriver {
    fn log_op(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }
}

impl RemoteDriver for FakeDriver {
    fn connect(&mut self) -> Result<(), Error> {
        self.log_op(String::from("connect"));
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), Error> {
        self.log_op(String::from("disconnect"));
        Ok(())
    }

    fn ping(&mut self) -> Result<(), Error> {
        self.log_op(String::from("ping"));
        Ok(())
    }

    fn execute(
        &mut self,
        stmt: &Statement,
        _kind: SqlKind,
    ) -> Result<(), Error> {
        let delay = self.hub.execute_delay_ms.load(AtomicOrdering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay));
        }
        self.log_op(format!("execute:{}", stmt.0));
        if let Some(pattern) =
            self.hub.fail_execute_containing.lock().unwrap().as_ref()
        {
            if stmt.0.contains(pattern.as_str()) {
                return Err(Error::NetworkError(String::from(
                    "injected failure",
                )));
            }
        }
        Ok(())
    }

    fn store_result(&mut self, buf: &mut RowBuffer) -> Result<(), Error> {
        self.log_op(String::from("store_result"));
        for row in self.hub.rows.lock().unwrap().iter() {
            buf.push(row.clone());
        }
        Ok(())
    }

    fn discard_result(&mut self) -> Result<(), Error> {
        self.log_op(String::from("discard_result"));
        Ok(())
    }

    fn record_count(&mut self) -> Result<u64, Error> {
        self.log_op(String::from("record_count"));
        Ok(self.hub.rows.lock().unwrap().len() as u64)
    }

    fn apply(&mut self, mutation: &PendingMutation) -> Result<(), Error> {
        self.log_op(format!("apply:{:?}", mutation));
        Ok(())
    }
}

pub fn registry_with(config: PoolConfig, hub: &Arc<FakeHub>) -> Registry {
    Registry::new(RegistryOptions {
        config,
        create_driver: FakeHub::factory(hub),
        log: test_log(),
    })
}
