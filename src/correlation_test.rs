use super::*;

fn response(correlation_id: Uuid) -> Frame {
    Frame::new(Command::WriteEventsCompleted, vec![0x08, 0x00]).with_correlation_id(correlation_id)
}

#[tokio::test]
async fn response_is_delivered_to_registered_waiter() {
    let table = Arc::new(CorrelationTable::default());
    let id = Uuid::new_v4();
    let pending = PendingResponse::register(&table, id).expect("register");

    assert!(table.complete(response(id)).is_ok());
    let frame = pending.recv().await.expect("response");
    assert_eq!(frame.correlation_id, id);
    assert_eq!(table.len(), 0);
}

#[tokio::test]
async fn second_response_for_same_id_is_not_delivered() {
    let table = Arc::new(CorrelationTable::default());
    let id = Uuid::new_v4();
    let pending = PendingResponse::register(&table, id).expect("register");

    assert!(table.complete(response(id)).is_ok());
    let duplicate = table.complete(response(id)).expect_err("entry already consumed");
    assert_eq!(duplicate.correlation_id, id);
    assert!(pending.recv().await.is_ok());
}

#[test]
fn unmatched_response_is_returned_to_caller() {
    let table = CorrelationTable::default();
    let frame = response(Uuid::new_v4());
    let returned = table.complete(frame.clone()).expect_err("no waiter");
    assert_eq!(returned, frame);
}

#[test]
fn duplicate_registration_is_rejected() {
    let table = CorrelationTable::default();
    let id = Uuid::new_v4();
    let _rx = table.register(id).expect("first registration");
    let err = table.register(id).expect_err("second registration");
    assert!(matches!(err, ConnectionError::DuplicateCorrelationId(dup) if dup == id));
}

#[test]
fn dropping_pending_response_releases_entry() {
    let table = Arc::new(CorrelationTable::default());
    let id = Uuid::new_v4();
    let pending = PendingResponse::register(&table, id).expect("register");
    assert!(table.contains(&id));

    drop(pending);
    assert!(!table.contains(&id));
}

#[tokio::test]
async fn completed_handle_does_not_evict_reused_id() {
    let table = Arc::new(CorrelationTable::default());
    let id = Uuid::new_v4();
    let first = PendingResponse::register(&table, id).expect("register");
    assert!(table.complete(response(id)).is_ok());

    let second = PendingResponse::register(&table, id).expect("id is free again");
    drop(first);
    assert!(table.contains(&id));

    assert!(table.complete(response(id)).is_ok());
    assert!(second.recv().await.is_ok());
}

#[tokio::test]
async fn fail_all_fails_waiters_with_connection_closed() {
    let table = Arc::new(CorrelationTable::default());
    let first = PendingResponse::register(&table, Uuid::new_v4()).expect("register");
    let second = PendingResponse::register(&table, Uuid::new_v4()).expect("register");

    assert_eq!(table.fail_all(), 2);
    assert_eq!(table.len(), 0);
    assert!(matches!(first.recv().await, Err(ConnectionError::ConnectionClosed)));
    assert!(matches!(second.recv().await, Err(ConnectionError::ConnectionClosed)));
}

#[tokio::test(start_paused = true)]
async fn recv_timeout_reports_timeout_and_releases_entry() {
    let table = Arc::new(CorrelationTable::default());
    let id = Uuid::new_v4();
    let pending = PendingResponse::register(&table, id).expect("register");

    let err = pending.recv_timeout(Duration::from_millis(250)).await.expect_err("no response");
    assert!(matches!(err, ConnectionError::Timeout(d) if d == Duration::from_millis(250)));
    assert!(!table.contains(&id));
}

#[tokio::test]
async fn subscription_receives_every_pushed_frame() {
    let table = SubscriptionTable::default();
    let id = Uuid::new_v4();
    let (_, mut rx) = table.register(id).expect("register");

    for _ in 0..3 {
        let event = Frame::new(Command::StreamEventAppeared, vec![1]).with_correlation_id(id);
        assert!(table.deliver(event).is_ok());
    }

    for _ in 0..3 {
        let frame = rx.recv().await.expect("event");
        assert_eq!(frame.command, Command::StreamEventAppeared);
    }
    assert!(table.contains(&id));
}

#[tokio::test]
async fn server_drop_ends_subscription() {
    let table = SubscriptionTable::default();
    let id = Uuid::new_v4();
    let (_, mut rx) = table.register(id).expect("register");

    let dropped = Frame::subscription_dropped(id, SubscriptionDropReason::AccessDenied, None);
    assert!(table.deliver(dropped).is_ok());

    assert!(!table.contains(&id));
    let frame = rx.recv().await.expect("drop notice");
    assert_eq!(frame.drop_reason(), Some(SubscriptionDropReason::AccessDenied));
    assert!(rx.recv().await.is_none());
}

#[test]
fn release_with_stale_serial_keeps_newer_subscription() {
    let table = SubscriptionTable::default();
    let id = Uuid::new_v4();
    let (stale, _rx) = table.register(id).expect("register");
    assert!(table.deliver(Frame::subscription_dropped(id, SubscriptionDropReason::NotFound, None)).is_ok());

    let (current, _rx) = table.register(id).expect("re-register");
    assert_ne!(stale, current);
    assert!(!table.release(&id, stale));
    assert!(table.contains(&id));

    assert!(table.release(&id, current));
    assert!(!table.contains(&id));
}

#[test]
fn closed_receiver_removes_subscription_on_delivery() {
    let table = SubscriptionTable::default();
    let id = Uuid::new_v4();
    drop(table.register(id).expect("register"));

    let event = Frame::new(Command::StreamEventAppeared, Vec::new()).with_correlation_id(id);
    assert!(table.deliver(event).is_ok());
    assert_eq!(table.len(), 0);
}

#[tokio::test]
async fn drop_all_notifies_each_subscriber_once_with_its_own_id() {
    let table = SubscriptionTable::default();
    let credentials = Credentials::new("admin", "changeit").expect("credentials");
    let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
    let mut receivers: Vec<_> = ids.iter().map(|id| table.register(*id).expect("register").1).collect();

    assert_eq!(table.drop_all(Some(&credentials)), 3);
    assert_eq!(table.len(), 0);

    for (id, rx) in ids.iter().zip(receivers.iter_mut()) {
        let notice = rx.recv().await.expect("drop notice");
        assert_eq!(notice.command, Command::SubscriptionDropped);
        assert_eq!(notice.correlation_id, *id);
        assert_eq!(notice.credentials.as_ref(), Some(&credentials));
        assert_eq!(notice.drop_reason(), Some(SubscriptionDropReason::Unsubscribed));
        assert!(rx.recv().await.is_none());
    }
}
