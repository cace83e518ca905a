//! Error taxonomy.
//!
//! Mirrors the shape of the mux crate's `Error` enum this was grounded on:
//! a flat `thiserror` enum, one variant per failure class, transport errors
//! wrapped with enough context to act on without downcasting.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::id::ConnectionId;

/// A shareable `io::Error`. `ConnectionError` needs to be `Clone` (the
/// `open()` single-flight cell and telemetry events both hand the same
/// error to more than one place), but `io::Error` itself isn't `Clone`,
/// and `Arc<io::Error>` doesn't implement `std::error::Error` on its own
/// for `#[source]` to pick up. This wraps it so both work.
#[derive(Debug, Clone)]
pub struct SharedIoError(Arc<io::Error>);

impl From<io::Error> for SharedIoError {
    fn from(source: io::Error) -> Self {
        Self(Arc::new(source))
    }
}

impl fmt::Display for SharedIoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for SharedIoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// Everything that can go wrong talking to a server over a [`Connection`].
///
/// [`Connection`]: crate::connection::Connection
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    /// The connection is past `Open` (failed or disposed) and can no longer
    /// be used for application traffic.
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    /// The caller invoked an operation the connection's current lifecycle
    /// state doesn't allow (e.g. `send` before `open` has completed).
    #[error("invalid operation on connection {0}")]
    InvalidOperation(ConnectionId),

    /// `dispose` has already run; the connection is gone for good.
    #[error("connection {0} has been disposed")]
    ObjectDisposed(ConnectionId),

    /// A read or write against the underlying stream failed. `action`
    /// names what was being attempted, for logs that don't have the call
    /// site handy.
    #[error("{action} on connection {connection_id}: {source}")]
    WrappedTransportError {
        connection_id: ConnectionId,
        action: &'static str,
        #[source]
        source: SharedIoError,
    },

    /// The receive coordinator or frame reader observed something that
    /// should be impossible given the invariants it's built on. Seeing this
    /// means a bug, not a bad server or a flaky network.
    #[error("internal error: {0}")]
    InternalError(&'static str),

    /// The operation's own cancellation token fired before it could
    /// complete. Distinct from a transport failure: the connection itself
    /// may still be perfectly healthy.
    #[error("operation on connection {0} was cancelled")]
    Cancelled(ConnectionId),
}

impl ConnectionError {
    pub(crate) fn wrap_io(connection_id: ConnectionId, action: &'static str, source: io::Error) -> Self {
        Self::WrappedTransportError {
            connection_id,
            action,
            source: SharedIoError::from(source),
        }
    }

    /// The connection id this error is about, for callers that want to log
    /// or correlate without matching on every variant.
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            Self::ConnectionClosed(id)
            | Self::InvalidOperation(id)
            | Self::ObjectDisposed(id)
            | Self::Cancelled(id) => *id,
            Self::WrappedTransportError { connection_id, .. } => *connection_id,
            Self::InternalError(_) => ConnectionId::unknown(),
        }
    }
}
