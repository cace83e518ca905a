//! External interfaces: the seams the host application implements.
//!
//! This crate never resolves a hostname, never speaks a wire protocol
//! beyond the frame header, and never knows what a message looks like. All
//! of that lives on the other side of these traits, supplied by whoever
//! embeds the connection core.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::io;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::cancel::CancelToken;
use crate::connection::InitializationHandle;
use crate::error::ConnectionError;

/// Where a [`StreamFactory`] dials. Kept as a host/port pair; anything
/// fancier (SRV lookups, connection strings) is topology discovery, which
/// lives above this crate.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// Anything a frame can be read from and written to. Blanket-implemented
/// for every type that already satisfies it; implementors never need to
/// name this trait themselves.
pub trait WireStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> WireStream for T {}

/// Dials a fresh transport for a connection to use.
#[async_trait]
pub trait StreamFactory: Send + Sync {
    type Stream: WireStream;

    async fn create_stream(&self, endpoint: &Endpoint, cancel: &CancelToken) -> io::Result<Self::Stream>;
}

/// What an initializer learns about the server during the handshake and
/// hands back to the connection. `server_connection_id`, if present, is
/// latched into the connection's id exactly once.
#[derive(Debug, Clone, Default)]
pub struct ConnectionDescription {
    pub server_connection_id: Option<i64>,
    pub server_version: Option<String>,
}

/// Runs the handshake on a freshly-dialed, not-yet-`Open` connection. The
/// initializer is handed an [`InitializationHandle`] rather than the
/// connection itself: `send`/`receive` on a plain `&Connection<S>` reject
/// everyone while the connection is `Initializing`, and the handle is the
/// one way through that during the handshake.
#[async_trait]
pub trait ConnectionInitializer<S: WireStream>: Send + Sync {
    async fn initialize(
        &self,
        connection: &InitializationHandle<'_, S>,
        cancel: &CancelToken,
    ) -> Result<ConnectionDescription, ConnectionError>;
}

/// A message a caller wants to send. `should_send` lets a caller gate a
/// message out of a batch without the connection needing to know why;
/// `mark_sent` is called on exactly the messages that actually made it into
/// the outgoing buffer.
pub trait OutboundMessage {
    fn request_id(&self) -> i32;

    fn should_send(&self) -> bool {
        true
    }

    fn mark_sent(&mut self) {}
}

/// Encodes one message of type `M` into a fresh output buffer, using
/// caller-supplied, otherwise-opaque settings. The core never inspects
/// `Settings`; it only threads it from the caller to this trait.
pub trait MessageEncoder<M: ?Sized>: Send + Sync {
    type Settings: Send + Sync;

    fn encode(&self, buf: &mut BytesMut, message: &M, settings: &Self::Settings) -> Result<(), ConnectionError>;
}

/// Decodes a complete frame into a caller-chosen response type. Receiving
/// takes this as a plain closure rather than a trait object: the "encoder
/// selector" the design calls for is exactly "pick the right decode
/// function for this response_to", which a closure expresses directly.
pub type Decode<T> = Box<dyn FnOnce(Bytes) -> Result<T, ConnectionError> + Send>;
