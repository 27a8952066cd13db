mod common;

use std::sync::mpsc::channel;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use fanlink::config::{PoolConfig, RecyclePolicy};
use fanlink::conn::PendingMutation;
use fanlink::endpoint::ConnKey;
use fanlink::error::Error;
use fanlink::registry::RecycleHint;

use common::{link_target, registry_with, FakeHub};

fn pool_config(
    max: u32,
    wait_ms: u64,
    recycle: RecyclePolicy,
) -> PoolConfig {
    PoolConfig {
        max_connections_per_endpoint: max,
        admission_wait_timeout_ms: wait_ms,
        recycle,
        ..PoolConfig::default()
    }
}

#[test]
fn endpoint_cap_blocks_third_acquire() {
    let hub = FakeHub::new();
    let registry = Arc::new(registry_with(
        pool_config(2, 5000, RecyclePolicy::PoolByKey),
        &hub,
    ));
    let target = link_target("10.0.0.1", 3306, 0, 0);

    let mut session1 = registry.open_session();
    let mut session2 = registry.open_session();
    let conn1 = registry.acquire(&target, &mut session1).unwrap();
    let _conn2 = registry.acquire(&target, &mut session2).unwrap();

    // The third acquire must block until a connection is released.
    let (tx, rx) = channel();
    let started = Arc::new(Barrier::new(2));
    let started_clone = Arc::clone(&started);
    let registry_clone = Arc::clone(&registry);
    let target_clone = target.clone();
    let waiter = thread::spawn(move || {
        let mut session3 = registry_clone.open_session();
        started_clone.wait();
        let result = registry_clone.acquire(&target_clone, &mut session3);
        tx.send(result.is_ok()).unwrap();
    });
    started.wait();

    // Still blocked after a generous grace period.
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    registry.release(conn1, &mut session1, RecycleHint::Pool);

    let unblocked = rx
        .recv_timeout(Duration::from_millis(2000))
        .expect("third acquire never completed");
    assert!(unblocked);
    let _ = waiter.join();

    // The cap was respected throughout: two live connections, not three.
    let stats = registry.stats();
    assert_eq!(stats.endpoint_live.get("10.0.0.1:3306"), Some(&2));
}

#[test]
fn capacity_timeout_is_bounded() {
    let hub = FakeHub::new();
    let registry = registry_with(
        pool_config(1, 300, RecyclePolicy::PoolByKey),
        &hub,
    );
    let target = link_target("10.0.0.2", 3306, 0, 0);

    let mut session1 = registry.open_session();
    let _held = registry.acquire(&target, &mut session1).unwrap();

    // A second session cannot reuse the held connection and must wait
    // out the admission timeout.
    let mut session2 = registry.open_session();
    let start = Instant::now();
    let result = registry.acquire(&target, &mut session2);
    let elapsed = start.elapsed();

    match result {
        Err(Error::CapacityExceeded { waited_ms, .. }) => {
            assert_eq!(waited_ms, 300);
        }
        other => panic!("expected CapacityExceeded, got {:?}", other.is_ok()),
    }
    assert!(elapsed >= Duration::from_millis(250), "returned too early");
    assert!(elapsed < Duration::from_millis(3000), "returned too late");
}

#[test]
fn recycle_by_key_returns_scrubbed_connection() {
    let hub = FakeHub::new();
    let registry = registry_with(
        pool_config(0, 1000, RecyclePolicy::PoolByKey),
        &hub,
    );
    let target = link_target("10.0.0.3", 3306, 0, 0);

    let mut session = registry.open_session();
    let conn = registry.acquire(&target, &mut session).unwrap();
    let first_id = conn.id();
    // The deferred wire connect is the only queued mutation on a fresh
    // connection.
    assert_eq!(conn.pending_mutations(), 1);
    conn.queue_mutation(PendingMutation::SetAutocommit(false));
    conn.queue_mutation(PendingMutation::StartTransaction);
    assert_eq!(conn.pending_mutations(), 3);
    registry.release(conn, &mut session, RecycleHint::Pool);

    let mut session2 = registry.open_session();
    let conn = registry.acquire(&target, &mut session2).unwrap();
    // Same pooled connection, identical key payload, session state
    // scrubbed down to the surviving connect.
    assert_eq!(conn.id(), first_id);
    assert_eq!(*conn.key(), ConnKey::for_link(&target));
    assert_eq!(conn.pending_mutations(), 1);
    assert_eq!(hub.created.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[test]
fn destroy_always_builds_fresh_connections() {
    let hub = FakeHub::new();
    let registry = registry_with(
        pool_config(0, 1000, RecyclePolicy::DestroyAlways),
        &hub,
    );
    let target = link_target("10.0.0.4", 3306, 0, 0);

    let mut session = registry.open_session();
    let conn = registry.acquire(&target, &mut session).unwrap();
    let first_id = conn.id();
    registry.release(conn, &mut session, RecycleHint::Pool);

    let conn = registry.acquire(&target, &mut session).unwrap();
    assert_ne!(conn.id(), first_id);
    assert_eq!(hub.created.load(std::sync::atomic::Ordering::SeqCst), 2);
    registry.release(conn, &mut session, RecycleHint::Discard);
}

#[test]
fn same_session_reacquire_is_same_connection() {
    let hub = FakeHub::new();
    let registry = registry_with(
        pool_config(1, 200, RecyclePolicy::PoolByKey),
        &hub,
    );
    let target = link_target("10.0.0.5", 3306, 0, 0);

    let mut session = registry.open_session();
    let conn1 = registry.acquire(&target, &mut session).unwrap();
    // Same-session reuse never consults admission control, so the cap of
    // one does not block this.
    let conn2 = registry.acquire(&target, &mut session).unwrap();
    assert_eq!(conn1.id(), conn2.id());
    assert_eq!(session.conn_count(), 1);
}

#[test]
fn live_count_never_exceeds_cap() {
    let cap = 3u32;
    let hub = FakeHub::new();
    let registry = Arc::new(registry_with(
        pool_config(cap, 2000, RecyclePolicy::PoolByKey),
        &hub,
    ));

    let mut workers = Vec::new();
    for worker_idx in 0..6usize {
        let registry = Arc::clone(&registry);
        workers.push(thread::spawn(move || {
            // Several distinct keys on one endpoint.
            let target =
                link_target("10.0.0.6", 3306, worker_idx % 4, 0);
            let mut session = registry.open_session();
            for _ in 0..10 {
                match registry.acquire(&target, &mut session) {
                    Ok(conn) => {
                        let live = registry
                            .stats()
                            .endpoint_live
                            .get("10.0.0.6:3306")
                            .cloned()
                            .unwrap_or(0);
                        assert!(
                            live <= cap,
                            "endpoint live count {} exceeded cap {}",
                            live,
                            cap
                        );
                        registry.release(
                            conn,
                            &mut session,
                            RecycleHint::Pool,
                        );
                    }
                    Err(Error::CapacityExceeded { .. }) => {}
                    Err(other) => panic!("unexpected error: {}", other),
                }
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    let live = registry
        .stats()
        .endpoint_live
        .get("10.0.0.6:3306")
        .cloned()
        .unwrap_or(0);
    assert!(live <= cap);
}

#[test]
fn shutdown_drains_pool_and_refuses_acquires() {
    let hub = FakeHub::new();
    let registry = registry_with(
        pool_config(0, 500, RecyclePolicy::PoolByKey),
        &hub,
    );
    let target = link_target("10.0.0.7", 3306, 0, 0);

    let mut session = registry.open_session();
    let conn = registry.acquire(&target, &mut session).unwrap();
    registry.release(conn, &mut session, RecycleHint::Pool);
    assert_eq!(
        registry.stats().idle_connections,
        fanlink::registry::types::ConnCount::from(1)
    );

    registry.shutdown();
    let stats = registry.stats();
    assert_eq!(
        stats.total_connections,
        fanlink::registry::types::ConnCount::from(0)
    );
    assert_eq!(
        stats.idle_connections,
        fanlink::registry::types::ConnCount::from(0)
    );

    match registry.acquire(&target, &mut session) {
        Err(Error::Shutdown) => {}
        other => panic!("expected Shutdown, got ok={}", other.is_ok()),
    }
}

#[test]
fn session_tree_iterates_links_in_priority_order() {
    let hub = FakeHub::new();
    let registry = registry_with(
        pool_config(0, 500, RecyclePolicy::PoolByKey),
        &hub,
    );
    let mut session = registry.open_session();

    // Three links to the same backend with distinct scheduling weights.
    for (link_idx, priority) in [(0usize, 30i64), (1, 10), (2, 20)].iter() {
        let target = link_target("10.0.0.9", 3306, *link_idx, *priority);
        let conn = registry.acquire(&target, &mut session).unwrap();
        session.tree_insert(&conn);
    }

    let mut priorities = Vec::new();
    let mut cursor = session.tree_first().cloned();
    while let Some(conn) = cursor {
        priorities.push(conn.priority());
        cursor = session.tree_next(&conn).cloned();
    }
    assert_eq!(priorities, vec![10, 20, 30]);
    assert_eq!(session.tree_last().unwrap().priority(), 30);

    // Releasing a connection drops it from the fan-out ordering too.
    let middle = Arc::clone(session.tree_next(
        session.tree_first().unwrap()
    ).unwrap());
    registry.release(middle, &mut session, RecycleHint::Discard);

    let mut remaining = Vec::new();
    let mut cursor = session.tree_first().cloned();
    while let Some(conn) = cursor {
        remaining.push(conn.priority());
        cursor = session.tree_next(&conn).cloned();
    }
    assert_eq!(remaining, vec![10, 30]);
    registry.release_all(&mut session, RecycleHint::Discard);
    registry.shutdown();
}

#[test]
fn unusable_connection_is_never_pooled() {
    let hub = FakeHub::new();
    let registry = registry_with(
        pool_config(0, 500, RecyclePolicy::PoolByKey),
        &hub,
    );
    let target = link_target("10.0.0.8", 3306, 0, 0);

    let mut session = registry.open_session();
    let conn = registry.acquire(&target, &mut session).unwrap();
    let first_id = conn.id();

    hub.fail_execute_containing("SELECT");
    let result = conn.with_driver(|driver| {
        driver.execute(
            &fanlink::driver::Statement(String::from("SELECT 1")),
            fanlink::driver::SqlKind::Select,
        )
    });
    assert!(result.is_err());
    assert!(!conn.is_usable());

    registry.release(conn, &mut session, RecycleHint::Pool);
    // The poisoned connection was torn down, not pooled; re-acquiring
    // builds a new one.
    let conn = registry.acquire(&target, &mut session).unwrap();
    assert_ne!(conn.id(), first_id);
}
