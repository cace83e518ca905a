//! Test doubles: an in-memory stream and stream factories/initializers
//! built on it. Exposed outside `#[cfg(test)]` behind the `test-util`
//! feature so integration tests under `tests/` can use the same doubles as
//! the unit tests.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::io;

use async_trait::async_trait;
use tokio::io::DuplexStream;

use crate::cancel::CancelToken;
use crate::connection::InitializationHandle;
use crate::error::ConnectionError;
use crate::external::{ConnectionDescription, ConnectionInitializer, Endpoint, StreamFactory, WireStream};

/// An in-memory duplex stream, standing in for a real socket.
pub type MockStream = DuplexStream;

/// The buffer size used for the in-memory streams this module hands out.
/// Generous enough that tests don't need to think about backpressure.
const MOCK_BUFFER_SIZE: usize = 64 * 1024;

/// Creates a connected pair: `(local, remote)`. `local` is handed to a
/// [`Connection`] (directly, or via [`MockStreamFactory`]); `remote` is
/// driven by the test to play the part of the server.
pub fn mock_stream_pair() -> (MockStream, MockStream) {
    tokio::io::duplex(MOCK_BUFFER_SIZE)
}

/// Dials a fresh in-memory stream pair, or fails outright, depending on how
/// it was constructed. The remote half of an accepted pair is drained in
/// the background so writes never block on a full buffer unless the test
/// wants to hold onto the remote half itself (use [`mock_stream_pair`]
/// directly for that).
pub struct MockStreamFactory {
    refuse: bool,
}

impl MockStreamFactory {
    pub fn accepting() -> Self {
        Self { refuse: false }
    }

    pub fn refusing() -> Self {
        Self { refuse: true }
    }
}

#[async_trait]
impl StreamFactory for MockStreamFactory {
    type Stream = MockStream;

    async fn create_stream(&self, _endpoint: &Endpoint, _cancel: &CancelToken) -> io::Result<MockStream> {
        if self.refuse {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "mock refusal"));
        }
        let (local, mut remote) = mock_stream_pair();
        tokio::spawn(async move {
            let mut sink = tokio::io::sink();
            let _ = tokio::io::copy(&mut remote, &mut sink).await;
        });
        Ok(local)
    }
}

/// Hands back a fixed [`ConnectionDescription`], or fails, without doing
/// any actual handshake traffic.
pub struct MockInitializer {
    description: ConnectionDescription,
    fail: bool,
}

impl MockInitializer {
    pub fn succeeding() -> Self {
        Self {
            description: ConnectionDescription::default(),
            fail: false,
        }
    }

    pub fn with_description(description: ConnectionDescription) -> Self {
        Self { description, fail: false }
    }

    pub fn failing() -> Self {
        Self {
            description: ConnectionDescription::default(),
            fail: true,
        }
    }
}

#[async_trait]
impl<S: WireStream> ConnectionInitializer<S> for MockInitializer {
    async fn initialize(
        &self,
        _connection: &InitializationHandle<'_, S>,
        _cancel: &CancelToken,
    ) -> Result<ConnectionDescription, ConnectionError> {
        if self.fail {
            return Err(ConnectionError::InternalError("mock initializer failure"));
        }
        Ok(self.description.clone())
    }
}
