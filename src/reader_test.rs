use std::time::Duration;

use futures::SinkExt;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::*;
use crate::connection::Connection;
use crate::connection::test_helpers::{WAIT, connected_pair, next_event, recv_frame, test_config};
use crate::config::Endpoint;

fn offline_connection() -> Connection {
    Connection::new(test_config(&Endpoint::new("127.0.0.1", 1113))).expect("connection")
}

#[tokio::test]
async fn heartbeat_request_is_answered_with_same_correlation_id() {
    let (_connection, mut peer, _server) = connected_pair().await;

    let first = Frame::new(Command::HeartbeatRequest, Vec::new());
    let second = Frame::new(Command::HeartbeatRequest, Vec::new());
    peer.send(first.clone()).await.expect("send heartbeat");
    peer.send(second.clone()).await.expect("send heartbeat");

    let mut answered = vec![recv_frame(&mut peer).await, recv_frame(&mut peer).await];
    answered.sort_by_key(|frame| frame.correlation_id != first.correlation_id);

    assert_eq!(answered[0].command, Command::HeartbeatResponse);
    assert_eq!(answered[0].correlation_id, first.correlation_id);
    assert_eq!(answered[1].command, Command::HeartbeatResponse);
    assert_eq!(answered[1].correlation_id, second.correlation_id);
}

#[tokio::test]
async fn blocked_heartbeat_reply_does_not_stall_dispatch() {
    let (connection, mut peer, _server) = connected_pair().await;
    let request = Frame::new(Command::ReadEvent, vec![1]);
    let id = request.correlation_id;
    let pending = connection.send(request).await.expect("send");
    let _ = recv_frame(&mut peer).await;

    let writer = connection.inner.writer.lock().await;
    let heartbeat = Frame::new(Command::HeartbeatRequest, Vec::new());
    peer.send(heartbeat.clone()).await.expect("send heartbeat");
    peer.send(Frame::new(Command::ReadEventCompleted, vec![2]).with_correlation_id(id))
        .await
        .expect("send response");

    let frame = tokio::time::timeout(WAIT, pending.recv())
        .await
        .expect("response routed while the writer is held")
        .expect("response");
    assert_eq!(frame.command, Command::ReadEventCompleted);

    drop(writer);
    let reply = recv_frame(&mut peer).await;
    assert_eq!(reply.command, Command::HeartbeatResponse);
    assert_eq!(reply.correlation_id, heartbeat.correlation_id);
}

#[tokio::test]
async fn pong_triggers_exactly_one_fresh_ping() {
    let (_connection, mut peer, _server) = connected_pair().await;

    let pong = Frame::new(Command::Pong, Vec::new());
    peer.send(pong.clone()).await.expect("send pong");

    let ping = recv_frame(&mut peer).await;
    assert_eq!(ping.command, Command::Ping);
    assert_ne!(ping.correlation_id, pong.correlation_id);

    let extra = tokio::time::timeout(Duration::from_millis(150), peer.next()).await;
    assert!(extra.is_err(), "only one ping should follow a pong");
}

#[tokio::test]
async fn response_dispatched_right_after_send_reaches_waiter() {
    let (connection, _peer, _server) = connected_pair().await;

    let request = Frame::new(Command::ReadEvent, vec![1]);
    let id = request.correlation_id;
    let pending = connection.send(request).await.expect("send");

    let response = Frame::new(Command::ReadEventCompleted, vec![2]).with_correlation_id(id);
    assert_eq!(dispatch(&connection.inner, response), Dispatch::Handled);

    let frame = pending.recv().await.expect("response");
    assert_eq!(frame.payload.as_ref(), &[2]);
    assert_eq!(connection.inner.requests.len(), 0);
}

#[tokio::test]
async fn unmatched_response_is_dropped() {
    let connection = offline_connection();
    let stray = Frame::new(Command::WriteEventsCompleted, vec![1]).with_correlation_id(Uuid::new_v4());

    assert_eq!(dispatch(&connection.inner, stray), Dispatch::Handled);
    assert_eq!(connection.inner.requests.len(), 0);
    assert_eq!(connection.inner.subscriptions.len(), 0);
}

#[tokio::test]
async fn unrouted_commands_are_ignored() {
    let connection = offline_connection();
    let id = Uuid::new_v4();
    let (_, mut rx) = connection.inner.subscriptions.register(id).expect("register");

    // A request-class command never reaches a subscriber.
    let frame = Frame::new(Command::ReadEvent, Vec::new()).with_correlation_id(id);
    assert_eq!(dispatch(&connection.inner, frame), Dispatch::Handled);
    let unknown = Frame::new(Command::Unknown(0x7E), Vec::new()).with_correlation_id(id);
    assert_eq!(dispatch(&connection.inner, unknown), Dispatch::Handled);

    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn pushed_events_reach_subscription_and_keep_it_alive() {
    let connection = offline_connection();
    let id = Uuid::new_v4();
    let (_, mut rx) = connection.inner.subscriptions.register(id).expect("register");

    for command in [Command::SubscriptionConfirmation, Command::StreamEventAppeared] {
        let frame = Frame::new(command, Vec::new()).with_correlation_id(id);
        assert_eq!(dispatch(&connection.inner, frame), Dispatch::Handled);
    }

    assert_eq!(rx.recv().await.map(|f| f.command), Some(Command::SubscriptionConfirmation));
    assert_eq!(rx.recv().await.map(|f| f.command), Some(Command::StreamEventAppeared));
    assert!(connection.inner.subscriptions.contains(&id));
}

#[tokio::test]
async fn bad_request_is_fatal() {
    let connection = offline_connection();
    let frame = Frame::new(Command::BadRequest, b"malformed".to_vec());
    assert_eq!(dispatch(&connection.inner, frame), Dispatch::Fatal);
}

#[tokio::test]
async fn bad_request_tears_connection_down_and_reports_failure() {
    let (connection, mut peer, _server) = connected_pair().await;
    let mut events = connection.events();
    let pending = connection.send(Frame::new(Command::ReadEvent, Vec::new())).await.expect("send");

    peer.send(Frame::new(Command::BadRequest, Vec::new())).await.expect("send bad request");

    assert!(matches!(
        next_event(&mut events).await,
        ConnectionEvent::Disconnected { reason: DisconnectReason::BadRequest }
    ));
    match next_event(&mut events).await {
        ConnectionEvent::Failed { error } => assert!(matches!(*error, ConnectionError::BadRequest)),
        other => panic!("expected failure event, got {other:?}"),
    }
    assert!(matches!(pending.recv().await, Err(ConnectionError::ConnectionClosed)));
    assert!(!connection.is_connected());
}

#[tokio::test]
async fn undecodable_frame_reports_failure() {
    let (connection, mut peer, _server) = connected_pair().await;
    let mut events = connection.events();

    // Declares a two-byte body, shorter than any frame header.
    peer.get_mut().write_all(&[2, 0, 0, 0, 0x01, 0x00]).await.expect("write raw bytes");

    assert!(matches!(
        next_event(&mut events).await,
        ConnectionEvent::Disconnected { reason: DisconnectReason::DecodeError }
    ));
    match next_event(&mut events).await {
        ConnectionEvent::Failed { error } => assert!(matches!(*error, ConnectionError::Codec(_))),
        other => panic!("expected failure event, got {other:?}"),
    }
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn reader_stops_when_connection_closes() {
    let (connection, _peer, _server) = connected_pair().await;
    let token = connection.inner.lock_socket().token.clone();

    connection.close().await.expect("close");

    tokio::time::timeout(WAIT, token.cancelled()).await.expect("socket token cancelled");
    assert!(connection.inner.lock_socket().reader.is_none());
}

#[tokio::test]
async fn recovery_for_replaced_socket_leaves_new_socket_alone() {
    let (connection, _peer, server) = connected_pair().await;
    let replaced = connection.inner.lock_socket().generation;

    connection.close().await.expect("close");
    connection.connect().await.expect("reconnect");
    let mut peer = server.accept().await;
    let mut events = connection.events();

    reconnect(Arc::clone(&connection.inner), replaced).await;
    fail(Arc::clone(&connection.inner), replaced, DisconnectReason::ReadError, ConnectionError::BadRequest).await;

    assert!(connection.is_connected());
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert!(events.try_recv().is_err());
    assert!(
        socket::disconnect_live(&connection.inner, replaced, DisconnectReason::EndOfStream)
            .await
            .is_none()
    );

    let pending = connection.send(Frame::new(Command::ReadEvent, Vec::new())).await.expect("send");
    let request = recv_frame(&mut peer).await;
    peer.send(Frame::new(Command::ReadEventCompleted, Vec::new()).with_correlation_id(request.correlation_id))
        .await
        .expect("respond");
    assert!(pending.recv().await.is_ok());
}
