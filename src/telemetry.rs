//! Telemetry hooks.
//!
//! One data record per event kind, one trait for sinks. No generic
//! `try_get_handler::<T>()` registry: a connection has at most one
//! subscriber, and `match`ing on an enum is cheaper and easier to read than
//! threading a type-keyed dispatch table through async code.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::time::Duration;

use crate::error::ConnectionError;
use crate::id::ConnectionId;

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Opening {
        connection_id: ConnectionId,
    },
    Opened {
        connection_id: ConnectionId,
        elapsed: Duration,
    },
    OpeningFailed {
        connection_id: ConnectionId,
        error: ConnectionError,
    },
    Closing {
        connection_id: ConnectionId,
    },
    Closed {
        connection_id: ConnectionId,
        elapsed: Duration,
    },
    Failed {
        connection_id: ConnectionId,
        error: ConnectionError,
    },
    SendingMessages {
        connection_id: ConnectionId,
        request_ids: Vec<i32>,
    },
    SentMessages {
        connection_id: ConnectionId,
        request_ids: Vec<i32>,
        bytes: usize,
        elapsed: Duration,
    },
    SendingMessagesFailed {
        connection_id: ConnectionId,
        error: ConnectionError,
    },
    ReceivingMessage {
        connection_id: ConnectionId,
        response_to: i32,
    },
    ReceivedMessage {
        connection_id: ConnectionId,
        response_to: i32,
        bytes: usize,
        elapsed: Duration,
    },
    ReceivingMessageFailed {
        connection_id: ConnectionId,
        response_to: i32,
        error: ConnectionError,
    },
}

/// A sink for [`ConnectionEvent`]s. Implementations should be quick and
/// non-blocking; `on_event` is called inline on the connection's own task.
pub trait EventSubscriber: Send + Sync {
    fn on_event(&self, event: &ConnectionEvent);
}

impl<F> EventSubscriber for F
where
    F: Fn(&ConnectionEvent) + Send + Sync,
{
    fn on_event(&self, event: &ConnectionEvent) {
        self(event)
    }
}
