//! Integration tests for listener-scoped new-connection events

mod common;

use std::time::Duration;

use common::*;

#[tokio::test]
async fn test_accept_notifies_only_its_listener() {
    let manager = new_manager();
    let everyone = IdentityLog::default();
    let first_log = IdentityLog::default();
    let second_log = IdentityLog::default();
    manager.events().new_connection.connect(everyone.recorder());

    let first = manager
        .open_listen_socket_with("127.0.0.1", 0, first_log.recorder())
        .await
        .unwrap();
    let second = manager
        .open_listen_socket_with("127.0.0.1", 0, second_log.recorder())
        .await
        .unwrap();
    assert_ne!(first.peer_port(), second.peer_port());

    manager
        .open_connection("127.0.0.1", first.peer_port())
        .await
        .unwrap();
    assert!(wait_until(|| first_log.len() == 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(second_log.len(), 0);

    manager
        .open_connection("127.0.0.1", second.peer_port())
        .await
        .unwrap();
    assert!(wait_until(|| second_log.len() == 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(first_log.len(), 1);

    assert_eq!(everyone.len(), 2);
    assert!(everyone.snapshot().contains(&first_log.snapshot()[0]));
    assert!(everyone.snapshot().contains(&second_log.snapshot()[0]));

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_subscribers_attached_later_are_scoped_too() {
    let manager = new_manager();
    let listener_a = manager.open_listen_socket("127.0.0.1", 0).await.unwrap();
    let listener_b = manager.open_listen_socket("127.0.0.1", 0).await.unwrap();

    let log_a = IdentityLog::default();
    let log_b = IdentityLog::default();
    let targeted = &manager.events().new_connection_on_listener;
    targeted.connect(listener_a.handle(), log_a.recorder());
    targeted.connect(listener_b.handle(), log_b.recorder());

    for _ in 0..2 {
        manager
            .open_connection("127.0.0.1", listener_b.peer_port())
            .await
            .unwrap();
    }

    assert!(wait_until(|| log_b.len() == 2).await);
    assert_eq!(log_a.len(), 0);

    // Closing a listener drops only its own subscriptions.
    assert!(manager.close_conn(&listener_a));
    assert_eq!(targeted.len(), 1);

    manager.stop().await.unwrap();
    assert!(targeted.is_empty());
}
