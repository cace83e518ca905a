//! The connection itself: lifecycle, send, receive, disposal.
//!
//! The lifecycle is a single `AtomicU8`, CAS'd between states the way
//! `RefcountAndFlags` packs a refcount and flags into one atomic byte --
//! no lock needed just to ask or change what state a connection is in.
//! Reads and writes run over independently-lockable halves of the stream
//! (`tokio::io::split`), so a send in progress never blocks a receive and
//! vice versa; only two sends, or two receives, ever contend.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use bytes::BytesMut;
use parking_lot::Mutex as SyncMutex;
use tokio::io::{split, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex as AsyncMutex, OnceCell, Semaphore};
use tracing::{error, info, instrument, trace, warn};

use crate::cancel::CancelToken;
use crate::coordinator::{CoordinatorError, Instruction, ReceiveCoordinator};
use crate::error::ConnectionError;
use crate::external::{ConnectionDescription, ConnectionInitializer, Endpoint, MessageEncoder, OutboundMessage, StreamFactory, WireStream};
use crate::frame;
use crate::id::ConnectionIdCell;
pub use crate::id::ConnectionId;
use crate::settings::ConnectionSettings;
use crate::telemetry::{ConnectionEvent, EventSubscriber};

/// Where a connection is in its life. Numeric order matters: every
/// transition moves strictly forward except the explicit jump to `Failed`,
/// and `current_state() as u8 >= Failed as u8` is the "no longer usable"
/// check used throughout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Initial = 0,
    Connecting = 1,
    Initializing = 2,
    Open = 3,
    Failed = 4,
    Disposed = 5,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Initial,
            1 => Self::Connecting,
            2 => Self::Initializing,
            3 => Self::Open,
            4 => Self::Failed,
            _ => Self::Disposed,
        }
    }
}

struct StreamHalves<S> {
    read_half: AsyncMutex<ReadHalf<S>>,
    write_half: AsyncMutex<WriteHalf<S>>,
}

/// A single duplex, multiplexed connection to a server.
///
/// Generic over the transport (`S`) only; the stream factory and
/// initializer are type-erased behind `Arc<dyn _>` so that generic
/// parameter doesn't have to propagate through every caller that just
/// wants to hold a `Connection<S>`.
pub struct Connection<S: WireStream> {
    id: ConnectionIdCell,
    endpoint: Endpoint,
    settings: ConnectionSettings,
    factory: Arc<dyn StreamFactory<Stream = S> + Send + Sync>,
    initializer: Arc<dyn ConnectionInitializer<S> + Send + Sync>,
    subscriber: Option<Arc<dyn EventSubscriber + Send + Sync>>,

    state: AtomicU8,
    open_cell: OnceCell<Result<(), ConnectionError>>,
    stream: OnceCell<StreamHalves<S>>,
    description: ArcSwapOption<ConnectionDescription>,

    opened_at: SyncMutex<Option<Instant>>,
    last_used_at: SyncMutex<Instant>,

    send_permit: Semaphore,
    background_cancel: CancelToken,
    coordinator: ReceiveCoordinator,
}

impl<S: WireStream> Connection<S> {
    pub fn new(
        endpoint: Endpoint,
        settings: ConnectionSettings,
        factory: Arc<dyn StreamFactory<Stream = S> + Send + Sync>,
        initializer: Arc<dyn ConnectionInitializer<S> + Send + Sync>,
        subscriber: Option<Arc<dyn EventSubscriber + Send + Sync>>,
    ) -> Self {
        Self {
            id: ConnectionIdCell::new(),
            endpoint,
            settings,
            factory,
            initializer,
            subscriber,
            state: AtomicU8::new(LifecycleState::Initial as u8),
            open_cell: OnceCell::new(),
            stream: OnceCell::new(),
            description: ArcSwapOption::from(None),
            opened_at: SyncMutex::new(None),
            last_used_at: SyncMutex::new(Instant::now()),
            send_permit: Semaphore::new(1),
            background_cancel: CancelToken::new(),
            coordinator: ReceiveCoordinator::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id.snapshot()
    }

    pub fn description(&self) -> Option<Arc<ConnectionDescription>> {
        self.description.load_full()
    }

    pub fn current_state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Dials the transport and runs the handshake. Safe to call
    /// concurrently: every caller shares the same in-flight attempt and
    /// sees the same result; a connection that failed to open stays
    /// `Failed` rather than silently retrying on a later call.
    #[instrument(skip_all, fields(connection_id = %self.id.snapshot()))]
    pub async fn open(&self, cancel: &CancelToken) -> Result<(), ConnectionError> {
        self.open_cell
            .get_or_init(|| self.open_once(cancel))
            .await
            .clone()
    }

    async fn open_once(&self, cancel: &CancelToken) -> Result<(), ConnectionError> {
        let started = Instant::now();
        let connection_id = self.id.snapshot();
        info!(%connection_id, endpoint = %self.endpoint.host, "opening connection");
        self.emit(ConnectionEvent::Opening { connection_id });
        self.state.store(LifecycleState::Connecting as u8, Ordering::SeqCst);

        let stream = match self.factory.create_stream(&self.endpoint, cancel).await {
            Ok(stream) => stream,
            Err(source) => return self.fail_open(self.wrap_io(source, "opening a connection to the server")),
        };
        let (read_half, write_half) = split(stream);
        let _ = self.stream.set(StreamHalves {
            read_half: AsyncMutex::new(read_half),
            write_half: AsyncMutex::new(write_half),
        });
        self.state.store(LifecycleState::Initializing as u8, Ordering::SeqCst);

        let handle = InitializationHandle(self);
        match self.initializer.initialize(&handle, cancel).await {
            Ok(description) => {
                if let Some(server_id) = description.server_connection_id {
                    self.id.assign_server(server_id);
                }
                self.description.store(Some(Arc::new(description)));
                *self.opened_at.lock() = Some(Instant::now());
                self.touch_last_used();
                self.state.store(LifecycleState::Open as u8, Ordering::SeqCst);
                let connection_id = self.id.snapshot();
                info!(%connection_id, elapsed = ?started.elapsed(), "connection opened");
                self.emit(ConnectionEvent::Opened {
                    connection_id,
                    elapsed: started.elapsed(),
                });
                Ok(())
            }
            Err(e) => self.fail_open(e),
        }
    }

    fn fail_open(&self, cause: ConnectionError) -> Result<(), ConnectionError> {
        self.mark_failed();
        let connection_id = self.id.snapshot();
        error!(%connection_id, error = %cause, "connection failed to open");
        self.emit(ConnectionEvent::OpeningFailed {
            connection_id,
            error: cause.clone(),
        });
        Err(cause)
    }

    /// Moves the connection to `Failed` unless it's already terminal.
    /// Returns whether this call actually performed the transition, so
    /// callers can emit a `failed` event exactly once.
    fn mark_failed(&self) -> bool {
        loop {
            let current = self.state.load(Ordering::SeqCst);
            if current >= LifecycleState::Failed as u8 {
                return false;
            }
            if self
                .state
                .compare_exchange_weak(current, LifecycleState::Failed as u8, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn fail_connection(&self, cause: ConnectionError) -> ConnectionError {
        if self.mark_failed() {
            let connection_id = self.id.snapshot();
            error!(%connection_id, error = %cause, "connection failed");
            self.emit(ConnectionEvent::Failed {
                connection_id,
                error: cause.clone(),
            });
        }
        cause
    }

    /// Encodes and writes a batch of messages. Messages whose
    /// `should_send` returns `false` are skipped and left unmarked;
    /// everything else is marked sent only once its bytes are in the
    /// outgoing buffer, before the write is attempted.
    #[instrument(skip_all, fields(connection_id = %self.id.snapshot()))]
    pub async fn send<M, Enc>(
        &self,
        messages: &mut [M],
        encoder: &Enc,
        settings: &Enc::Settings,
        cancel: &CancelToken,
    ) -> Result<(), ConnectionError>
    where
        M: OutboundMessage,
        Enc: MessageEncoder<M>,
    {
        self.ensure_usable()?;
        self.send_impl(messages, encoder, settings, cancel).await
    }

    async fn send_impl<M, Enc>(
        &self,
        messages: &mut [M],
        encoder: &Enc,
        settings: &Enc::Settings,
        cancel: &CancelToken,
    ) -> Result<(), ConnectionError>
    where
        M: OutboundMessage,
        Enc: MessageEncoder<M>,
    {
        let started = Instant::now();
        let request_ids: Vec<i32> = messages.iter().map(OutboundMessage::request_id).collect();
        trace!(connection_id = %self.id.snapshot(), ?request_ids, "sending messages");
        self.emit(ConnectionEvent::SendingMessages {
            connection_id: self.id.snapshot(),
            request_ids,
        });

        let encoded = self.encode_all(messages, encoder, settings, cancel);
        let (buf, sent_ids) = match encoded {
            Ok(v) => v,
            Err(e) => {
                warn!(connection_id = %self.id.snapshot(), error = %e, "failed to encode outgoing messages");
                self.emit(ConnectionEvent::SendingMessagesFailed {
                    connection_id: self.id.snapshot(),
                    error: e.clone(),
                });
                return Err(e);
            }
        };

        if buf.is_empty() {
            return Ok(());
        }

        let permit = match self.send_permit.acquire().await {
            Ok(permit) => permit,
            Err(_) => return Err(ConnectionError::ObjectDisposed(self.id.snapshot())),
        };
        let write_result = self.write_frame(&buf).await;
        drop(permit);

        match write_result {
            Ok(()) => {
                self.touch_last_used();
                trace!(connection_id = %self.id.snapshot(), bytes = buf.len(), "sent messages");
                self.emit(ConnectionEvent::SentMessages {
                    connection_id: self.id.snapshot(),
                    request_ids: sent_ids,
                    bytes: buf.len(),
                    elapsed: started.elapsed(),
                });
                Ok(())
            }
            Err(source) => {
                let wrapped = self.fail_connection(self.wrap_io(source, "sending a message to the server"));
                self.emit(ConnectionEvent::SendingMessagesFailed {
                    connection_id: self.id.snapshot(),
                    error: wrapped.clone(),
                });
                Err(wrapped)
            }
        }
    }

    fn encode_all<M, Enc>(
        &self,
        messages: &mut [M],
        encoder: &Enc,
        settings: &Enc::Settings,
        cancel: &CancelToken,
    ) -> Result<(bytes::Bytes, Vec<i32>), ConnectionError>
    where
        M: OutboundMessage,
        Enc: MessageEncoder<M>,
    {
        let mut buf = BytesMut::new();
        let mut sent_ids = Vec::new();
        for message in messages.iter_mut() {
            if cancel.is_cancelled() {
                return Err(ConnectionError::Cancelled(self.id.snapshot()));
            }
            if !message.should_send() {
                continue;
            }
            encoder.encode(&mut buf, message, settings)?;
            message.mark_sent();
            sent_ids.push(message.request_id());
        }
        Ok((crate::buffer::make_read_only(buf), sent_ids))
    }

    /// Writes under the background cancellation token, not the caller's --
    /// once a frame starts going out, only the connection giving up on the
    /// socket (via `dispose`) can abandon it mid-write.
    async fn write_frame(&self, bytes: &[u8]) -> io::Result<()> {
        let halves = self.halves()?;
        let mut write_half = halves.write_half.lock().await;
        frame::write_frame(&mut *write_half, bytes, &self.background_cancel).await
    }

    /// Waits for the frame whose response-to id is `response_to`. If no one
    /// else is already reading, this call itself becomes the reader: it
    /// reads frames off the wire, handing off anything that isn't its own
    /// to whoever is waiting for it, until it finds its own or is
    /// cancelled.
    #[instrument(skip_all, fields(connection_id = %self.id.snapshot(), response_to))]
    pub async fn receive<T>(
        &self,
        response_to: i32,
        decode: impl FnOnce(bytes::Bytes) -> Result<T, ConnectionError> + Send,
        cancel: &CancelToken,
    ) -> Result<T, ConnectionError> {
        self.ensure_usable()?;
        self.receive_impl(response_to, decode, cancel).await
    }

    async fn receive_impl<T>(
        &self,
        response_to: i32,
        decode: impl FnOnce(bytes::Bytes) -> Result<T, ConnectionError> + Send,
        cancel: &CancelToken,
    ) -> Result<T, ConnectionError> {
        let started = Instant::now();
        trace!(connection_id = %self.id.snapshot(), response_to, "waiting for a message");
        self.emit(ConnectionEvent::ReceivingMessage {
            connection_id: self.id.snapshot(),
            response_to,
        });

        let frame = match self.obtain_frame(response_to, cancel).await {
            Ok(frame) => frame,
            Err(e) => {
                warn!(connection_id = %self.id.snapshot(), response_to, error = %e, "failed to receive a message");
                self.emit(ConnectionEvent::ReceivingMessageFailed {
                    connection_id: self.id.snapshot(),
                    response_to,
                    error: e.clone(),
                });
                return Err(e);
            }
        };

        self.touch_last_used();
        let bytes_len = frame.len();
        match decode(frame) {
            Ok(value) => {
                trace!(connection_id = %self.id.snapshot(), response_to, bytes = bytes_len, "received a message");
                self.emit(ConnectionEvent::ReceivedMessage {
                    connection_id: self.id.snapshot(),
                    response_to,
                    bytes: bytes_len,
                    elapsed: started.elapsed(),
                });
                Ok(value)
            }
            Err(e) => {
                warn!(connection_id = %self.id.snapshot(), response_to, error = %e, "failed to decode a received message");
                self.emit(ConnectionEvent::ReceivingMessageFailed {
                    connection_id: self.id.snapshot(),
                    response_to,
                    error: e.clone(),
                });
                Err(e)
            }
        }
    }

    async fn obtain_frame(&self, response_to: i32, cancel: &CancelToken) -> Result<bytes::Bytes, ConnectionError> {
        let instruction = self
            .coordinator
            .get_instructions(response_to, cancel)
            .await
            .map_err(|e| self.coordinator_error(e))?;
        match instruction {
            Instruction::ReturnBuffer(buf) => Ok(buf),
            Instruction::AssumeReceiverRole => self.assume_receiver_role(response_to, cancel).await,
        }
    }

    fn coordinator_error(&self, error: CoordinatorError) -> ConnectionError {
        match error {
            CoordinatorError::Cancelled => ConnectionError::Cancelled(self.id.snapshot()),
            CoordinatorError::Internal(msg) => ConnectionError::InternalError(msg),
        }
    }

    /// Reads frames until this caller's own arrives, dispatching every
    /// other frame to its waiter. The reader role is always relinquished on
    /// the way out, even if this future is dropped mid-read rather than
    /// returning normally.
    async fn assume_receiver_role(&self, response_to: i32, cancel: &CancelToken) -> Result<bytes::Bytes, ConnectionError> {
        struct RelinquishOnDrop<'a, S: WireStream>(&'a Connection<S>);
        impl<S: WireStream> Drop for RelinquishOnDrop<'_, S> {
            fn drop(&mut self) {
                self.0.coordinator.relinquish();
            }
        }
        let _guard = RelinquishOnDrop(self);

        loop {
            if cancel.is_cancelled() {
                return Err(ConnectionError::Cancelled(self.id.snapshot()));
            }

            let raw = match self.read_one_frame().await {
                Ok(raw) => raw,
                Err(source) => {
                    return Err(self.fail_connection(self.wrap_io(source, "receiving a message from the server")));
                }
            };
            let received_id = frame::response_to(&raw)?;
            self.touch_last_used();
            if received_id == response_to {
                return Ok(raw);
            }
            self.coordinator.dispatch(received_id, raw);
        }
    }

    /// Reads under the background cancellation token, not whichever
    /// caller happens to be holding the reader role right now -- that
    /// caller's own cancellation is handled by the loop above, between
    /// frames; this only needs to unblock a read stuck on a dead socket
    /// when `dispose` gives up on it.
    async fn read_one_frame(&self) -> io::Result<bytes::Bytes> {
        let halves = self.halves()?;
        let mut read_half = halves.read_half.lock().await;
        frame::read_frame(&mut *read_half, &self.background_cancel).await
    }

    fn halves(&self) -> io::Result<&StreamHalves<S>> {
        self.stream
            .get()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection has no stream installed yet"))
    }

    /// Gate for the public `send`/`receive` entry points. Only `Open`
    /// passes: `Initializing` is reserved for the initializer, which
    /// reaches the same underlying logic through [`InitializationHandle`]
    /// instead of going through this check.
    fn ensure_usable(&self) -> Result<(), ConnectionError> {
        match self.current_state() {
            LifecycleState::Open => Ok(()),
            LifecycleState::Disposed => Err(ConnectionError::ObjectDisposed(self.id.snapshot())),
            LifecycleState::Failed => Err(ConnectionError::ConnectionClosed(self.id.snapshot())),
            LifecycleState::Initial | LifecycleState::Connecting | LifecycleState::Initializing => {
                Err(ConnectionError::InvalidOperation(self.id.snapshot()))
            }
        }
    }

    fn wrap_io(&self, source: io::Error, action: &'static str) -> ConnectionError {
        ConnectionError::wrap_io(self.id.snapshot(), action, source)
    }

    fn touch_last_used(&self) {
        *self.last_used_at.lock() = Instant::now();
    }

    /// Whether this connection is past `Open`, or has outlived the
    /// lifetime/idle bounds in its settings. Pooling decisions live above
    /// this crate; this only answers the yes/no question.
    pub fn is_expired(&self) -> bool {
        if self.current_state() as u8 >= LifecycleState::Failed as u8 {
            return true;
        }
        if let Some(max_lifetime) = self.settings.max_lifetime {
            if let Some(opened_at) = *self.opened_at.lock() {
                if opened_at.elapsed() > max_lifetime {
                    return true;
                }
            }
        }
        if let Some(max_idle_time) = self.settings.max_idle_time {
            if self.last_used_at.lock().elapsed() > max_idle_time {
                return true;
            }
        }
        false
    }

    /// Closes the connection. Idempotent: only the first call actually
    /// shuts down the transport and emits `closing`/`closed`.
    #[instrument(skip_all, fields(connection_id = %self.id.snapshot()))]
    pub async fn dispose(&self) {
        let previous = self.state.swap(LifecycleState::Disposed as u8, Ordering::SeqCst);
        if previous == LifecycleState::Disposed as u8 {
            return;
        }

        let started = Instant::now();
        let connection_id = self.id.snapshot();
        info!(%connection_id, "closing connection");
        self.emit(ConnectionEvent::Closing { connection_id });
        // Trip the background token first: any write or read currently
        // blocked on the stream halves races against it and gives up its
        // lock, so the mutex acquisitions below are never left waiting on
        // a stuck socket.
        self.background_cancel.cancel();
        self.send_permit.close();
        if let Some(halves) = self.stream.get() {
            let mut write_half = halves.write_half.lock().await;
            let _ = write_half.shutdown().await;
        }
        let connection_id = self.id.snapshot();
        info!(%connection_id, elapsed = ?started.elapsed(), "connection closed");
        self.emit(ConnectionEvent::Closed {
            connection_id,
            elapsed: started.elapsed(),
        });
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Some(subscriber) = &self.subscriber {
            subscriber.on_event(&event);
        }
    }

    /// Jumps straight to `Open` with a caller-provided stream, bypassing
    /// `open()`'s dial/handshake dance. Exists only so integration tests can
    /// drive both ends of a duplex stream themselves.
    #[cfg(any(test, feature = "test-util"))]
    pub fn install_test_stream(&self, stream: S) {
        let (read_half, write_half) = split(stream);
        let _ = self.stream.set(StreamHalves {
            read_half: AsyncMutex::new(read_half),
            write_half: AsyncMutex::new(write_half),
        });
        *self.opened_at.lock() = Some(Instant::now());
        self.state.store(LifecycleState::Open as u8, Ordering::SeqCst);
    }
}

/// What a [`ConnectionInitializer`] gets instead of `&Connection<S>`.
///
/// The handshake runs while the connection is still `Initializing`, a
/// state `send`/`receive` reject for everyone else (see
/// [`Connection::ensure_usable`]). The initializer needs to send and
/// receive anyway, so it's handed this wrapper: a capability that only
/// `open_once` ever constructs, and only for the duration of the
/// `initialize` call, proving the caller is the one party allowed to
/// talk on the wire before the connection is `Open`.
pub struct InitializationHandle<'a, S: WireStream>(&'a Connection<S>);

impl<S: WireStream> InitializationHandle<'_, S> {
    pub fn id(&self) -> ConnectionId {
        self.0.id()
    }

    pub async fn send<M, Enc>(
        &self,
        messages: &mut [M],
        encoder: &Enc,
        settings: &Enc::Settings,
        cancel: &CancelToken,
    ) -> Result<(), ConnectionError>
    where
        M: OutboundMessage,
        Enc: MessageEncoder<M>,
    {
        self.0.send_impl(messages, encoder, settings, cancel).await
    }

    pub async fn receive<T>(
        &self,
        response_to: i32,
        decode: impl FnOnce(bytes::Bytes) -> Result<T, ConnectionError> + Send,
        cancel: &CancelToken,
    ) -> Result<T, ConnectionError> {
        self.0.receive_impl(response_to, decode, cancel).await
    }
}

impl<S: WireStream> std::fmt::Debug for InitializationHandle<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("InitializationHandle").field(self.0).finish()
    }
}

impl<S: WireStream> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id.snapshot())
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}

/// A cheaply cloneable, shared handle to a connection. Pooling policy is
/// explicitly out of scope here; this only makes the connection safe to
/// hand to more than one caller at a time.
#[derive(Clone)]
pub struct ConnectionHandle<S: WireStream>(Arc<Connection<S>>);

impl<S: WireStream> ConnectionHandle<S> {
    pub fn new(connection: Connection<S>) -> Self {
        Self(Arc::new(connection))
    }
}

impl<S: WireStream> std::ops::Deref for ConnectionHandle<S> {
    type Target = Connection<S>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::ConnectionDescription;
    use crate::testing::{MockInitializer, MockStreamFactory};

    fn connection(factory: MockStreamFactory, initializer: MockInitializer) -> Connection<crate::testing::MockStream> {
        Connection::new(
            Endpoint::new("localhost", 0),
            ConnectionSettings::default(),
            Arc::new(factory),
            Arc::new(initializer),
            None,
        )
    }

    #[tokio::test]
    async fn open_transitions_initial_to_open_on_success() {
        let conn = connection(MockStreamFactory::accepting(), MockInitializer::succeeding());
        let cancel = CancelToken::new();
        conn.open(&cancel).await.unwrap();
        assert_eq!(conn.current_state(), LifecycleState::Open);
    }

    #[tokio::test]
    async fn open_is_single_flight_across_concurrent_callers() {
        let conn = Arc::new(connection(MockStreamFactory::accepting(), MockInitializer::succeeding()));
        let cancel = CancelToken::new();
        let a = tokio::spawn({
            let conn = Arc::clone(&conn);
            let cancel = cancel.clone();
            async move { conn.open(&cancel).await }
        });
        let b = tokio::spawn({
            let conn = Arc::clone(&conn);
            let cancel = cancel.clone();
            async move { conn.open(&cancel).await }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(conn.current_state(), LifecycleState::Open);
    }

    #[tokio::test]
    async fn failed_open_moves_to_failed_and_stays_there() {
        let conn = connection(MockStreamFactory::refusing(), MockInitializer::succeeding());
        let cancel = CancelToken::new();
        assert!(conn.open(&cancel).await.is_err());
        assert_eq!(conn.current_state(), LifecycleState::Failed);

        // A second call must not try to redial; it returns the same error.
        assert!(conn.open(&cancel).await.is_err());
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let conn = connection(MockStreamFactory::accepting(), MockInitializer::succeeding());
        let cancel = CancelToken::new();
        conn.open(&cancel).await.unwrap();
        conn.dispose().await;
        conn.dispose().await;
        assert_eq!(conn.current_state(), LifecycleState::Disposed);
    }

    #[tokio::test]
    async fn operations_fail_fast_before_open() {
        let conn = connection(MockStreamFactory::accepting(), MockInitializer::succeeding());
        let cancel = CancelToken::new();
        let result = conn
            .receive(1, |b| Ok(b), &cancel)
            .await;
        assert!(matches!(result, Err(ConnectionError::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn expiry_respects_max_idle_time() {
        let mut settings = ConnectionSettings::default();
        settings.max_idle_time = Some(Duration::from_millis(1));
        let conn = Connection::new(
            Endpoint::new("localhost", 0),
            settings,
            Arc::new(MockStreamFactory::accepting()),
            Arc::new(MockInitializer::succeeding()),
            None,
        );
        let cancel = CancelToken::new();
        conn.open(&cancel).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(conn.is_expired());
    }

    #[tokio::test]
    async fn description_is_populated_by_the_initializer() {
        let conn = connection(
            MockStreamFactory::accepting(),
            MockInitializer::with_description(ConnectionDescription {
                server_connection_id: Some(7),
                server_version: Some("1.0".into()),
            }),
        );
        let cancel = CancelToken::new();
        conn.open(&cancel).await.unwrap();
        let description = conn.description().unwrap();
        assert_eq!(description.server_connection_id, Some(7));
        assert!(conn.id().to_string().contains("server=7"));
    }
}
