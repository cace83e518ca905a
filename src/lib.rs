//! A duplex, binary-framed connection core.
//!
//! One socket, many requests in flight at once: callers write whenever
//! they like and each waits for the response carrying its own id, while at
//! most one of them is ever actually pulling bytes off the wire at a time.
//! Everything about the messages themselves -- their schema, their wire
//! format beyond the length/response-to header, how a server is chosen,
//! how dead connections get recycled -- is out of scope; this crate only
//! owns the duplex multiplexing and the connection lifecycle around it.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

#![forbid(unsafe_code)]
#![warn(missing_debug_implementations)]

pub mod buffer;
pub mod cancel;
pub mod connection;
mod coordinator;
pub mod error;
pub mod external;
mod frame;
mod id;
pub mod settings;
pub mod stream;
pub mod telemetry;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use buffer::{InputBuffer, OutputBuffer};
pub use cancel::CancelToken;
pub use connection::{Connection, ConnectionHandle, ConnectionId, InitializationHandle, LifecycleState};
pub use error::ConnectionError;
pub use external::{
    ConnectionDescription, ConnectionInitializer, Endpoint, MessageEncoder, OutboundMessage, StreamFactory, WireStream,
};
pub use settings::ConnectionSettings;
pub use stream::{AnyStream, TcpStreamFactory};
pub use telemetry::{ConnectionEvent, EventSubscriber};
