/*
 * Copyright 2020 Joyent, Inc.
 */

//! Detection of forwarding cycles across chained federated hops.
//!
//! A federated table whose rows map to another federated table can form a
//! forwarding cycle across several servers; undetected, a query forwards
//! itself forever. Every hop stamps the outgoing query with a chain value
//! accumulating (instance, hop-path) contributions; before forwarding, the
//! hop records the (destination, chain) pair against the connection and
//! refuses destinations the chain has already routed through.

use std::collections::HashMap;

use slog::debug;

use crate::conn::Conn;
use crate::error::Error;

/// One hop of a forwarding chain: where the query came from, the path of
/// the table executing here, and the remote path it is about to forward to.
#[derive(Clone, Debug)]
pub struct ChainFingerprint {
    pub from_hop: String,
    pub cur_hop: String,
    pub to_hop: String,
}

#[derive(Clone, Debug)]
struct LoopCheckEntry {
    /// The hop that first recorded this destination.
    from_hop: String,
    /// The caller-supplied chain value as received.
    from_value: String,
    /// Accumulated contributor values, `--`-joined; merged, never
    /// replaced, when a second distinct contributor targets the same
    /// destination.
    merged_value: String,
    /// The query context this entry is queued for, if any.
    queued_ctx: Option<u64>,
    /// A safe repeat was observed; the entry is re-queued into the next
    /// context instead of being cleared with it.
    ignored: bool,
    merged: bool,
}

/// Per-connection loop-check table, keyed by destination path.
pub struct LoopCheckState {
    current_ctx: u64,
    entries: HashMap<String, LoopCheckEntry>,
}

impl LoopCheckState {
    pub(crate) fn new() -> Self {
        LoopCheckState {
            current_ctx: 0,
            entries: HashMap::new(),
        }
    }

    fn contribution(instance: &str, hop: &str, value: &str) -> String {
        [instance, "-", hop, "-", value].concat()
    }

    /// The marker any chain value carries once `hop` (on this process
    /// instance) has contributed to it.
    fn hop_marker(instance: &str, hop: &str) -> String {
        [instance, "-", hop, "-"].concat()
    }

    fn try_forward(
        &mut self,
        instance: &str,
        chain: &ChainFingerprint,
        value: &str,
    ) -> Result<(), Error> {
        let ctx = self.current_ctx;
        let mine = Self::contribution(instance, &chain.cur_hop, value);
        // The chain value records every hop it already routed through on
        // this instance; re-entering one of them is a cycle no matter
        // what the entry table says.
        if value.contains(&Self::hop_marker(instance, &chain.to_hop)) {
            return Err(Error::CycleDetected(chain.to_hop.clone()));
        }
        if let Some(entry) = self.entries.get_mut(&chain.to_hop) {
            if entry.queued_ctx == Some(ctx) && entry.from_value == value {
                if entry.from_hop == chain.from_hop {
                    // The same edge replayed with the same chain value
                    // contributes nothing new; remember it so the entry
                    // survives into the next context.
                    entry.ignored = true;
                    return Ok(());
                }
                return Err(Error::CycleDetected(chain.to_hop.clone()));
            }
            entry.merged_value.push_str("--");
            entry.merged_value.push_str(&mine);
            entry.queued_ctx = Some(ctx);
            entry.merged = true;
            return Ok(());
        }
        self.entries.insert(
            chain.to_hop.clone(),
            LoopCheckEntry {
                from_hop: chain.from_hop.clone(),
                from_value: String::from(value),
                merged_value: mine,
                queued_ctx: Some(ctx),
                ignored: false,
                merged: false,
            },
        );
        Ok(())
    }

    /// The accumulated chain value to stamp on the outgoing query for
    /// `destination`, once `try_forward` has accepted it.
    fn outgoing_value(&self, destination: &str) -> Option<String> {
        self.entries
            .get(destination)
            .map(|e| e.merged_value.clone())
    }

    fn begin_context(&mut self) {
        self.current_ctx += 1;
        let ctx = self.current_ctx;
        // Ignored survivors are re-queued so a long-lived connection's
        // loop state stays bounded across many queries.
        for entry in self.entries.values_mut() {
            entry.queued_ctx = Some(ctx);
            entry.ignored = false;
        }
    }

    fn end_context(&mut self) {
        let ctx = self.current_ctx;
        self.entries
            .retain(|_, e| e.ignored || e.queued_ctx != Some(ctx));
        for entry in self.entries.values_mut() {
            entry.queued_ctx = None;
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn merged_len(&self) -> usize {
        self.entries.values().filter(|e| e.merged).count()
    }
}

/// Record the intent to forward along `chain` and refuse it if the chain
/// has already routed through the destination. A refusal means the caller
/// must not retry the same hop.
pub fn try_forward(
    conn: &Conn,
    chain: &ChainFingerprint,
    value: &str,
) -> Result<(), Error> {
    let mut state = conn.loop_check_state().lock().unwrap();
    let result = state.try_forward(conn.instance_token(), chain, value);
    if result.is_err() {
        debug!(conn.log(), "refusing cyclic forward";
            "from" => %chain.from_hop,
            "to" => %chain.to_hop);
    }
    result
}

/// The chain value to attach to the outgoing query for `destination`.
pub fn outgoing_value(conn: &Conn, destination: &str) -> Option<String> {
    conn.loop_check_state()
        .lock()
        .unwrap()
        .outgoing_value(destination)
}

/// Open a new query context on the connection: previously ignored entries
/// are re-queued, everything else starts fresh for cycle accounting.
pub fn begin_context(conn: &Conn) {
    conn.loop_check_state().lock().unwrap().begin_context();
}

/// Close the current query context: entries it created are cleared except
/// ignored ones, which stay for re-queueing by the next context.
pub fn end_context(conn: &Conn) {
    conn.loop_check_state().lock().unwrap().end_context();
}

/// Number of live entries, exposed for stats and boundedness tests.
pub fn entry_count(conn: &Conn) -> usize {
    conn.loop_check_state().lock().unwrap().len()
}

/// Number of entries that absorbed a second contributor.
pub fn merged_count(conn: &Conn) -> usize {
    conn.loop_check_state().lock().unwrap().merged_len()
}
