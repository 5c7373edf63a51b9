//! Integration tests for connection registration and teardown

mod common;

use std::time::Duration;

use common::*;
use tcpmgr::net::IpVersion;
use tcpmgr::{ConnectionIdentity, ConnectionManager, ConnectionRole};

/// Reserve a free local port and release it again
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_listen_then_connect_fires_one_new_connection() {
    let manager = new_manager();
    let accepted = IdentityLog::default();
    manager.events().new_connection.connect(accepted.recorder());

    let listener = manager.open_listen_socket("127.0.0.1", 0).await.unwrap();
    let client = manager
        .open_connection("127.0.0.1", listener.peer_port())
        .await
        .unwrap();

    assert!(wait_until(|| accepted.len() == 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(accepted.len(), 1);

    let peer = accepted.snapshot()[0].clone();
    assert!(manager.contains(&peer));
    assert_eq!(peer.peer_ip(), "127.0.0.1");
    assert_ne!(peer.handle(), client.handle());
    assert_ne!(peer.handle(), listener.handle());
    assert_eq!(
        manager.role(&peer),
        Some(ConnectionRole::Accepted {
            listener: listener.handle()
        })
    );
    assert_eq!(manager.role(&client), Some(ConnectionRole::Outbound));
    assert!(wait_until(|| manager.is_reading(&peer)).await);
    assert_eq!(manager.connection_count(), 3);

    let metrics = manager.metrics().snapshot();
    assert_eq!(metrics.connections_accepted, 1);
    assert_eq!(metrics.active_connections, 3);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_close_conn_is_idempotent() {
    let manager = new_manager();
    let closed = IdentityLog::default();
    manager.events().connection_closed.connect(closed.recorder());

    let listener = manager.open_listen_socket("127.0.0.1", 0).await.unwrap();
    let client = manager
        .open_connection("127.0.0.1", listener.peer_port())
        .await
        .unwrap();

    assert!(manager.close_conn(&client));
    assert!(!manager.close_conn(&client));
    assert!(!manager.contains(&client));
    assert_eq!(closed.count_of(&client), 1);

    // The accepted side observes EOF and closes itself exactly once too.
    assert!(wait_until(|| closed.len() == 2).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(closed.len(), 2);
    assert_eq!(closed.count_of(&client), 1);

    manager.stop().await.unwrap();
    assert_eq!(closed.count_of(&listener), 1);
    assert_eq!(closed.len(), 3);
}

#[tokio::test]
async fn test_registry_empty_after_stop() {
    let manager = new_manager();
    let closed = IdentityLog::default();
    manager.events().connection_closed.connect(closed.recorder());

    let listener = manager.open_listen_socket("127.0.0.1", 0).await.unwrap();
    for _ in 0..3 {
        manager
            .open_connection("127.0.0.1", listener.peer_port())
            .await
            .unwrap();
    }
    assert!(wait_until(|| manager.connection_count() == 7).await);

    let registered = manager.connections();
    within(manager.stop()).await.unwrap();

    assert_eq!(manager.connection_count(), 0);
    assert_eq!(manager.active_tasks(), 0);
    assert!(manager.is_finishing());
    for identity in &registered {
        assert_eq!(closed.count_of(identity), 1, "{}", identity);
    }

    // Stopping again is harmless.
    within(manager.stop()).await.unwrap();
}

#[tokio::test]
async fn test_finished_loops_are_reclaimed() {
    let manager = new_manager();
    let listener = manager.open_listen_socket("127.0.0.1", 0).await.unwrap();
    let client = manager
        .open_connection("127.0.0.1", listener.peer_port())
        .await
        .unwrap();
    assert!(wait_until(|| manager.active_tasks() == 3).await);

    manager.close_conn(&client);

    // Client loop and the accepted peer's loop both finish and are joined.
    assert!(wait_until(|| manager.active_tasks() == 1).await);
    assert_eq!(manager.connections(), vec![listener]);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_start_reading_twice_is_noop() {
    let manager = new_manager();
    let listener = manager.open_listen_socket("127.0.0.1", 0).await.unwrap();
    let client = manager
        .open_connection("127.0.0.1", listener.peer_port())
        .await
        .unwrap();

    assert!(manager.is_reading(&client));
    assert!(!manager.start_reading(&client));
    assert!(!manager.start_reading(&listener));

    let ghost = ConnectionIdentity::unassigned("127.0.0.1", 1);
    assert!(!manager.start_reading(&ghost));

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_write_to_unknown_identity_fails() {
    let manager = new_manager();
    let listener = manager.open_listen_socket("127.0.0.1", 0).await.unwrap();
    let client = manager
        .open_connection("127.0.0.1", listener.peer_port())
        .await
        .unwrap();

    let ghost = ConnectionIdentity::unassigned("127.0.0.1", 1);
    assert!(!manager.write(&ghost, b"lost").await);
    assert!(!manager.write(&listener, b"lost").await);

    assert!(manager.write(&client, b"ok").await);
    manager.close_conn(&client);
    assert!(!manager.write(&client, b"lost").await);
    assert_eq!(manager.metrics().snapshot().write_failures, 3);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_invalid_addresses_fail_without_registration() {
    let manager = new_manager();

    assert!(manager.open_connection("999.999.999.999", 80).await.is_err());
    assert!(manager.open_connection("not.an.ip.address", 80).await.is_err());
    assert!(manager.open_connection("", 80).await.is_err());
    assert!(manager.open_listen_socket("localhost", 0).await.is_err());
    assert!(manager
        .open_connection_from("127.0.0.1", 80, "bad.source", 0)
        .await
        .is_err());

    assert_eq!(manager.connection_count(), 0);
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_refused_connect_fails_without_registration() {
    let manager = new_manager();
    let port = free_port();

    assert!(manager.open_connection("127.0.0.1", port).await.is_err());
    assert_eq!(manager.connection_count(), 0);
    assert_eq!(manager.active_tasks(), 0);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_outbound_from_fixed_source() {
    let manager = new_manager();
    let accepted = IdentityLog::default();
    manager.events().new_connection.connect(accepted.recorder());

    let listener = manager.open_listen_socket("127.0.0.1", 0).await.unwrap();
    let source_port = free_port();

    let client = manager
        .open_connection_from("127.0.0.1", listener.peer_port(), "127.0.0.1", source_port)
        .await
        .unwrap();
    assert_eq!(client.peer_port(), listener.peer_port());

    assert!(wait_until(|| accepted.len() == 1).await);
    assert_eq!(accepted.snapshot()[0].peer_port(), source_port);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_open_after_stop_fails() {
    let manager = new_manager();
    let listener = manager.open_listen_socket("127.0.0.1", 0).await.unwrap();
    let port = listener.peer_port();

    manager.stop().await.unwrap();

    assert!(manager.open_listen_socket("127.0.0.1", 0).await.is_err());
    assert!(manager.open_connection("127.0.0.1", port).await.is_err());
    assert_eq!(manager.connection_count(), 0);
}

#[tokio::test]
async fn test_weak_manager_does_not_keep_it_alive() {
    let manager = new_manager();
    let weak = manager.downgrade();
    assert!(weak.upgrade().is_some());

    drop(manager);
    assert!(weak.upgrade().is_none());
}

#[tokio::test]
async fn test_dns_lookup_by_family() {
    assert_eq!(
        ConnectionManager::dns_lookup("127.0.0.1", IpVersion::V4).await,
        Some("127.0.0.1".to_string())
    );
    assert_eq!(
        ConnectionManager::dns_lookup("127.0.0.1", IpVersion::from(6)).await,
        None
    );
    assert_eq!(ConnectionManager::dns_lookup("", IpVersion::V4).await, None);
}
