//! Scenario-level tests driving both ends of an in-memory duplex stream:
//! the connection under test, and a hand-written "server" pushing frames
//! back in whatever order the scenario calls for.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use duplex_wire::{
    CancelToken, Connection, ConnectionError, ConnectionSettings, Endpoint, MessageEncoder, OutboundMessage,
};

fn build_frame(response_to: i32, payload: &[u8]) -> Vec<u8> {
    let total_len = 12 + payload.len();
    let mut out = Vec::with_capacity(total_len);
    out.extend_from_slice(&(total_len as u32).to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&response_to.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

struct TestMessage {
    request_id: i32,
    payload: &'static [u8],
    gate: bool,
    sent: bool,
}

impl TestMessage {
    fn new(request_id: i32, payload: &'static [u8]) -> Self {
        Self {
            request_id,
            payload,
            gate: true,
            sent: false,
        }
    }

    fn gated_off(mut self) -> Self {
        self.gate = false;
        self
    }
}

impl OutboundMessage for TestMessage {
    fn request_id(&self) -> i32 {
        self.request_id
    }

    fn should_send(&self) -> bool {
        self.gate
    }

    fn mark_sent(&mut self) {
        self.sent = true;
    }
}

struct TestEncoder;

impl MessageEncoder<TestMessage> for TestEncoder {
    type Settings = ();

    fn encode(&self, buf: &mut BytesMut, message: &TestMessage, _settings: &()) -> Result<(), ConnectionError> {
        let total_len = 12 + message.payload.len();
        buf.extend_from_slice(&(total_len as u32).to_le_bytes());
        buf.extend_from_slice(&message.request_id.to_le_bytes());
        buf.extend_from_slice(&0i32.to_le_bytes()); // no response expected to this frame
        buf.extend_from_slice(message.payload);
        Ok(())
    }
}

fn decode_identity(frame: Bytes) -> Result<Bytes, ConnectionError> {
    Ok(frame.slice(12..))
}

fn new_test_connection() -> (Connection<duplex_wire::testing::MockStream>, duplex_wire::testing::MockStream) {
    let (local, remote) = duplex_wire::testing::mock_stream_pair();
    let conn = Connection::new(
        Endpoint::new("localhost", 0),
        ConnectionSettings::default(),
        Arc::new(duplex_wire::testing::MockStreamFactory::refusing()),
        Arc::new(duplex_wire::testing::MockInitializer::failing()),
        None,
    );
    conn.install_test_stream(local);
    (conn, remote)
}

#[tokio::test]
async fn single_threaded_send_then_receive_round_trips_a_frame() {
    let (conn, mut remote) = new_test_connection();
    let cancel = CancelToken::new();

    let mut messages = vec![TestMessage::new(1, b"ping")];
    conn.send(&mut messages, &TestEncoder, &(), &cancel).await.unwrap();
    assert!(messages[0].sent);

    // Drain what the connection wrote and play server: echo a response
    // carrying response_to = 1.
    let mut sent = [0u8; 16];
    remote.read_exact(&mut sent).await.unwrap();
    remote.write_all(&build_frame(1, b"pong")).await.unwrap();

    let reply = conn.receive(1, decode_identity, &cancel).await.unwrap();
    assert_eq!(&reply[..], b"pong");
}

#[tokio::test]
async fn gated_messages_are_skipped_and_never_marked_sent() {
    let (conn, mut remote) = new_test_connection();
    let cancel = CancelToken::new();

    let mut messages = vec![TestMessage::new(1, b"go").gated_off(), TestMessage::new(2, b"go")];
    conn.send(&mut messages, &TestEncoder, &(), &cancel).await.unwrap();
    assert!(!messages[0].sent);
    assert!(messages[1].sent);

    let mut sent = vec![0u8; 12 + 2];
    remote.read_exact(&mut sent).await.unwrap();
    let request_id = i32::from_le_bytes(sent[4..8].try_into().unwrap());
    assert_eq!(request_id, 2);
}

#[tokio::test]
async fn out_of_order_frames_are_routed_to_the_right_waiter() {
    let (conn, mut remote) = new_test_connection();
    let conn = Arc::new(conn);
    let cancel = CancelToken::new();

    let waiter_a = tokio::spawn({
        let conn = Arc::clone(&conn);
        let cancel = cancel.clone();
        async move { conn.receive(1, decode_identity, &cancel).await }
    });
    let waiter_b = tokio::spawn({
        let conn = Arc::clone(&conn);
        let cancel = cancel.clone();
        async move { conn.receive(2, decode_identity, &cancel).await }
    });
    tokio::task::yield_now().await;

    // Server answers out of order: id 2 first, then id 1.
    remote.write_all(&build_frame(2, b"two")).await.unwrap();
    remote.write_all(&build_frame(1, b"one")).await.unwrap();

    let a = waiter_a.await.unwrap().unwrap();
    let b = waiter_b.await.unwrap().unwrap();
    assert_eq!(&a[..], b"one");
    assert_eq!(&b[..], b"two");
}

#[tokio::test]
async fn reader_role_is_handed_off_after_the_first_reader_finds_its_frame() {
    let (conn, mut remote) = new_test_connection();
    let conn = Arc::new(conn);
    let cancel = CancelToken::new();

    // id 2's waiter registers first and would become the reader if it
    // asked before id 1 arrives; here id 1 asks first so it is the reader,
    // finds its own frame immediately, and must relinquish so whoever
    // reads id 3 next can take over without a frame ever going missing.
    remote.write_all(&build_frame(1, b"first")).await.unwrap();
    let first = conn.receive(1, decode_identity, &cancel).await.unwrap();
    assert_eq!(&first[..], b"first");

    let waiter = tokio::spawn({
        let conn = Arc::clone(&conn);
        let cancel = cancel.clone();
        async move { conn.receive(3, decode_identity, &cancel).await }
    });
    tokio::task::yield_now().await;
    remote.write_all(&build_frame(3, b"second")).await.unwrap();

    let second = waiter.await.unwrap().unwrap();
    assert_eq!(&second[..], b"second");
}

#[tokio::test]
async fn cancelling_a_waiter_disposes_the_frame_dispatched_to_it() {
    let (conn, mut remote) = new_test_connection();
    let conn = Arc::new(conn);
    let reader_cancel = CancelToken::new();

    // The reader is after id 99, which arrives last, so it keeps reading
    // (and dispatching) other frames in the meantime instead of returning
    // immediately.
    let reader = tokio::spawn({
        let conn = Arc::clone(&conn);
        let reader_cancel = reader_cancel.clone();
        async move { conn.receive(99, decode_identity, &reader_cancel).await }
    });
    tokio::task::yield_now().await;

    let waiter_cancel = CancelToken::new();
    let waiter = tokio::spawn({
        let conn = Arc::clone(&conn);
        let waiter_cancel = waiter_cancel.clone();
        async move { conn.receive(2, decode_identity, &waiter_cancel).await }
    });
    tokio::task::yield_now().await;

    waiter_cancel.cancel();
    // The reader picks this up, sees it isn't for id 99, and dispatches it
    // to id 2's waiter -- who has already cancelled, so the coordinator
    // must dispose of it instead of handing it back.
    remote.write_all(&build_frame(2, b"for-the-cancelled-waiter")).await.unwrap();
    tokio::task::yield_now().await;
    remote.write_all(&build_frame(99, b"keep-open")).await.unwrap();

    assert_eq!(&reader.await.unwrap().unwrap()[..], b"keep-open");
    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(ConnectionError::Cancelled(_))));
}

#[tokio::test]
async fn connection_reports_expired_once_idle_time_is_exceeded() {
    let mut settings = ConnectionSettings::default();
    settings.max_idle_time = Some(Duration::from_millis(5));
    let (local, _remote) = duplex_wire::testing::mock_stream_pair();
    let conn = Connection::new(
        Endpoint::new("localhost", 0),
        settings,
        Arc::new(duplex_wire::testing::MockStreamFactory::refusing()),
        Arc::new(duplex_wire::testing::MockInitializer::failing()),
        None,
    );
    conn.install_test_stream(local);
    assert!(!conn.is_expired());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(conn.is_expired());
}

#[tokio::test]
async fn dispose_shuts_down_the_transport_and_later_operations_fail() {
    let (conn, mut remote) = new_test_connection();
    conn.dispose().await;

    let cancel = CancelToken::new();
    let result = conn.receive(1, decode_identity, &cancel).await;
    assert!(matches!(result, Err(ConnectionError::ObjectDisposed(_))));

    // The remote side should observe EOF once the connection shuts its
    // write half down.
    let mut buf = [0u8; 1];
    let n = remote.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
}
