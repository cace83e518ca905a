//! Connection identity.
//!
//! A connection is assigned a local id the moment it's constructed, purely
//! so logs and telemetry can refer to it before a server round-trip has
//! happened. The initializer may learn a server-assigned number during the
//! handshake; [`ConnectionIdCell::assign_server`] latches that in exactly
//! once, the same one-shot-CAS shape as [`crate::connection`]'s lifecycle
//! state.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

const UNASSIGNED: i64 = i64::MIN;

static NEXT_LOCAL_ID: AtomicU64 = AtomicU64::new(1);

/// A point-in-time snapshot of a connection's identity. Cheap to copy and
/// safe to stash in an error or event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    local: u64,
    server: Option<i64>,
}

impl ConnectionId {
    /// A sentinel used where no real connection is in scope yet (e.g. an
    /// internal-error variant constructed before a connection exists).
    pub(crate) fn unknown() -> Self {
        Self {
            local: 0,
            server: None,
        }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.server {
            Some(server) => write!(f, "conn-{}[server={server}]", self.local),
            None => write!(f, "conn-{}", self.local),
        }
    }
}

/// The live, shareable cell a [`crate::connection::Connection`] owns. Reads
/// and writes happen from multiple callers concurrently (telemetry, error
/// construction, the initializer), so the server half is an atomic rather
/// than requiring `&mut self`.
#[derive(Debug)]
pub(crate) struct ConnectionIdCell {
    local: u64,
    server: AtomicI64,
}

impl ConnectionIdCell {
    pub(crate) fn new() -> Self {
        Self {
            local: NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed),
            server: AtomicI64::new(UNASSIGNED),
        }
    }

    pub(crate) fn snapshot(&self) -> ConnectionId {
        let server = self.server.load(Ordering::SeqCst);
        ConnectionId {
            local: self.local,
            server: (server != UNASSIGNED).then_some(server),
        }
    }

    /// Records the server-assigned number the first time it's called; later
    /// calls are no-ops, matching the handshake's "updated once" contract.
    pub(crate) fn assign_server(&self, server: i64) {
        let _ = self
            .server
            .compare_exchange(UNASSIGNED, server, Ordering::SeqCst, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unassigned_id_displays_without_server_suffix() {
        let cell = ConnectionIdCell::new();
        let id = cell.snapshot();
        assert!(id.server.is_none());
        assert!(!id.to_string().contains("server="));
    }

    #[test]
    fn assign_server_is_one_shot() {
        let cell = ConnectionIdCell::new();
        cell.assign_server(42);
        cell.assign_server(99);
        assert_eq!(cell.snapshot().server, Some(42));
    }

    #[test]
    fn each_cell_gets_a_distinct_local_id() {
        let a = ConnectionIdCell::new();
        let b = ConnectionIdCell::new();
        assert_ne!(a.snapshot().local, b.snapshot().local);
    }
}
