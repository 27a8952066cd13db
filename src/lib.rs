//
// Copyright 2020 Joyent, Inc.
//

//! Remote-connection management for a federated storage engine
//!
//! Fanlink keeps a bounded, reusable, concurrently-accessed set of live
//! connections to remote backend database nodes on behalf of a local query
//! execution context. It pairs a process-wide [`Registry`]:
//! registry/struct.Registry.html (keyed idle pool plus per-endpoint
//! admission control) with a background worker thread per connection, so
//! remote work runs asynchronously without blocking the whole query, and a
//! per-connection loop check that refuses cyclic query forwarding across a
//! mesh of federated servers.
//!
//! Use of fanlink requires an implementation of the [`RemoteDriver`]:
//! driver/trait.RemoteDriver.html trait for the remote database's wire
//! protocol; the core never builds SQL and never interprets driver
//! failures beyond its own error taxonomy.
//!
//! # Example
//!
//! Acquire a connection for a configured link and run a background read.
//!
//! ```rust,ignore
//! use std::sync::{Arc, Mutex};
//!
//! use slog::{o, Drain, Logger};
//!
//! use fanlink::config::{PoolConfig, RegistryOptions};
//! use fanlink::driver::{RowBuffer, Statement};
//! use fanlink::registry::{RecycleHint, Registry};
//! use fanlink::worker::{self, DispatchMode, Job};
//!
//! fn main() {
//!     let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
//!     let log = Logger::root(
//!         Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
//!         o!("build-id" => "0.1.0")
//!     );
//!
//!     let registry = Registry::new(RegistryOptions {
//!         config: PoolConfig::default(),
//!         create_driver: Box::new(|target| Ok(my_driver_for(target))),
//!         log,
//!     });
//!
//!     let mut session = registry.open_session();
//!     let conn = registry.acquire(&link_target, &mut session)?;
//!
//!     let buf = Arc::new(Mutex::new(RowBuffer::new()));
//!     let ticket = worker::dispatch(
//!         &conn,
//!         Job::Search {
//!             statement: Statement("SELECT ...".into()),
//!             target: Arc::clone(&buf),
//!             discard_result: false,
//!         },
//!         DispatchMode::CallerWait,
//!     )?;
//!     ticket.wait()?;
//!
//!     registry.release(conn, &mut session, RecycleHint::Pool);
//! }
//! ```

#![allow(missing_docs)]

pub mod config;
pub mod conn;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod loop_check;
pub mod monitor;
pub mod registry;
pub mod tree;
pub mod worker;
