//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients, verifying
//! the join protocol, broadcast fan-out, and chat replay over the wire.

use std::collections::HashSet;

use easel_collab::client::{CollabClient, CollabEvent, ConnectionState};
use easel_collab::protocol::AckStatus;
use easel_collab::server::{CollabServer, ServerConfig};
use easel_core::{decode_batch, reconcile, Element, Scene};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return its URL.
async fn start_test_server() -> String {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        session_buffer: 64,
        max_message_bytes: 1_000_000,
    };
    let server = CollabServer::new(config);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("ws://127.0.0.1:{port}")
}

/// Pull events until one matches, skipping the rest.
async fn wait_for(
    rx: &mut mpsc::Receiver<CollabEvent>,
    mut matches: impl FnMut(&CollabEvent) -> bool,
) -> CollabEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await {
                Some(event) if matches(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Connect a client and wait for its session assignment.
async fn connect_client(url: &str) -> (CollabClient, mpsc::Receiver<CollabEvent>, Uuid) {
    let mut client = CollabClient::new(url);
    let mut rx = client.take_event_rx().unwrap();
    client.connect().await.expect("client should connect");

    let event = wait_for(&mut rx, |e| matches!(e, CollabEvent::SessionAssigned(_))).await;
    let session_id = match event {
        CollabEvent::SessionAssigned(id) => id,
        _ => unreachable!(),
    };
    (client, rx, session_id)
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let url = start_test_server().await;
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_receives_session_id() {
    let url = start_test_server().await;
    let (client, _rx, session_id) = connect_client(&url).await;

    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    assert_eq!(client.session_id().await, Some(session_id));
}

#[tokio::test]
async fn test_sessions_get_distinct_ids() {
    let url = start_test_server().await;
    let (_c1, _rx1, id1) = connect_client(&url).await;
    let (_c2, _rx2, id2) = connect_client(&url).await;
    assert_ne!(id1, id2);
}

#[tokio::test]
async fn test_first_joiner_owns_initial_state() {
    let url = start_test_server().await;
    let (client, mut rx, _) = connect_client(&url).await;

    client.join_room("sketch-1").await.unwrap();

    let event = wait_for(&mut rx, |e| matches!(e, CollabEvent::FirstInRoom { .. })).await;
    match event {
        CollabEvent::FirstInRoom { room_id } => assert_eq!(room_id, "sketch-1"),
        _ => unreachable!(),
    }

    let event = wait_for(&mut rx, |e| matches!(e, CollabEvent::Ack(_))).await;
    match event {
        CollabEvent::Ack(ack) => {
            assert_eq!(ack.status, AckStatus::Ok);
            assert_eq!(ack.member_count, Some(1));
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_second_joiner_triggers_presence_events() {
    let url = start_test_server().await;
    let (c1, mut rx1, _id1) = connect_client(&url).await;
    let (c2, mut rx2, id2) = connect_client(&url).await;

    c1.join_room("sketch-1").await.unwrap();
    wait_for(&mut rx1, |e| matches!(e, CollabEvent::FirstInRoom { .. })).await;

    c2.join_room("sketch-1").await.unwrap();

    // Existing member learns of the newcomer, then gets the member list.
    let event = wait_for(&mut rx1, |e| matches!(e, CollabEvent::NewUser { .. })).await;
    match event {
        CollabEvent::NewUser { room_id, session_id } => {
            assert_eq!(room_id, "sketch-1");
            assert_eq!(session_id, id2);
        }
        _ => unreachable!(),
    }
    let event = wait_for(&mut rx1, |e| matches!(e, CollabEvent::RoomUserChange { .. })).await;
    match event {
        CollabEvent::RoomUserChange { members, .. } => assert_eq!(members.len(), 2),
        _ => unreachable!(),
    }

    // The newcomer gets the member list but no first-in-room claim.
    let event = wait_for(&mut rx2, |e| matches!(e, CollabEvent::RoomUserChange { .. })).await;
    match event {
        CollabEvent::RoomUserChange { members, .. } => assert_eq!(members.len(), 2),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_scene_broadcast_reaches_peer_and_reconciles() {
    let url = start_test_server().await;
    let (c1, mut rx1, _) = connect_client(&url).await;
    let (c2, mut rx2, _) = connect_client(&url).await;

    c1.join_room("sketch-1").await.unwrap();
    c2.join_room("sketch-1").await.unwrap();
    wait_for(&mut rx2, |e| matches!(e, CollabEvent::RoomUserChange { .. })).await;

    let scene = Scene::from_elements(vec![
        Element::new("rect-1", json!({"kind": "rect", "x": 10, "y": 20})),
        Element::new("line-1", json!({"kind": "line", "x2": 99})),
    ]);
    let message_id = c1.broadcast_scene("sketch-1", &scene.to_batch()).await.unwrap();

    // Sender gets an ack carrying its correlation id.
    let event = wait_for(
        &mut rx1,
        |e| matches!(e, CollabEvent::Ack(a) if a.message_id.is_some()),
    )
    .await;
    match event {
        CollabEvent::Ack(ack) => {
            assert_eq!(ack.status, AckStatus::Ok);
            assert_eq!(ack.message_id, Some(message_id));
        }
        _ => unreachable!(),
    }

    // Peer receives the batch and reconciles it into an empty scene.
    let event = wait_for(&mut rx2, |e| matches!(e, CollabEvent::RemoteUpdate { .. })).await;
    match event {
        CollabEvent::RemoteUpdate { room_id, payload, .. } => {
            assert_eq!(room_id, "sketch-1");
            let batch = decode_batch(&payload);
            let merged = reconcile(&Scene::new(), &batch, &HashSet::new());
            assert_eq!(merged, scene);
        }
        _ => unreachable!(),
    }

    // The sender never hears its own broadcast back.
    let echo = timeout(Duration::from_millis(200), async {
        loop {
            match rx1.recv().await {
                Some(CollabEvent::RemoteUpdate { .. }) => return true,
                Some(_) => continue,
                None => return false,
            }
        }
    })
    .await;
    assert!(echo.is_err(), "sender must not receive its own broadcast");
}

#[tokio::test]
async fn test_chat_history_replayed_to_late_joiner() {
    let url = start_test_server().await;
    let (c1, mut rx1, id1) = connect_client(&url).await;

    c1.join_room("sketch-1").await.unwrap();
    wait_for(&mut rx1, |e| matches!(e, CollabEvent::FirstInRoom { .. })).await;

    let message_id = c1.send_chat("sketch-1", "first!").await.unwrap();

    // Chat comes back to the sender too.
    let event = wait_for(&mut rx1, |e| matches!(e, CollabEvent::Chat(_))).await;
    match event {
        CollabEvent::Chat(msg) => {
            assert_eq!(msg.id, message_id);
            assert_eq!(msg.sender, id1);
            assert_eq!(msg.content, "first!");
        }
        _ => unreachable!(),
    }

    // A later joiner gets the buffered history.
    let (c2, mut rx2, _) = connect_client(&url).await;
    c2.join_room("sketch-1").await.unwrap();
    let event = wait_for(&mut rx2, |e| matches!(e, CollabEvent::ChatHistory { .. })).await;
    match event {
        CollabEvent::ChatHistory { room_id, messages } => {
            assert_eq!(room_id, "sketch-1");
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].content, "first!");
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_leave_notifies_remaining_members() {
    let url = start_test_server().await;
    let (c1, mut rx1, id1) = connect_client(&url).await;
    let (c2, mut rx2, _) = connect_client(&url).await;

    c1.join_room("sketch-1").await.unwrap();
    c2.join_room("sketch-1").await.unwrap();
    wait_for(&mut rx1, |e| matches!(e, CollabEvent::NewUser { .. })).await;
    wait_for(&mut rx2, |e| matches!(e, CollabEvent::RoomUserChange { .. })).await;

    c2.leave_room("sketch-1").await.unwrap();

    let event = wait_for(
        &mut rx1,
        |e| matches!(e, CollabEvent::RoomUserChange { members, .. } if members.len() == 1),
    )
    .await;
    match event {
        CollabEvent::RoomUserChange { members, .. } => assert_eq!(members, vec![id1]),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_invalid_room_join_is_rejected() {
    let url = start_test_server().await;
    let (client, mut rx, _) = connect_client(&url).await;

    client.join_room("").await.unwrap();

    let event = wait_for(&mut rx, |e| matches!(e, CollabEvent::Ack(_))).await;
    match event {
        CollabEvent::Ack(ack) => {
            assert_eq!(ack.status, AckStatus::Error);
            assert!(ack.error.as_deref().unwrap().contains("invalid room id"));
        }
        _ => unreachable!(),
    }
    // The connection survives a rejected request.
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_disconnect_updates_membership() {
    let url = start_test_server().await;
    let (c1, mut rx1, id1) = connect_client(&url).await;
    let (c2, mut rx2, _) = connect_client(&url).await;

    c1.join_room("sketch-1").await.unwrap();
    c2.join_room("sketch-1").await.unwrap();
    wait_for(&mut rx1, |e| matches!(e, CollabEvent::NewUser { .. })).await;
    wait_for(&mut rx2, |e| matches!(e, CollabEvent::RoomUserChange { .. })).await;

    // Drop the second client entirely; the socket closes once its
    // reader observes the dead event channel.
    drop(c2);
    drop(rx2);
    let scene = Scene::from_elements(vec![Element::new("nudge", json!({"kind": "rect"}))]);
    c1.broadcast_scene("sketch-1", &scene.to_batch()).await.unwrap();

    let event = wait_for(
        &mut rx1,
        |e| matches!(e, CollabEvent::RoomUserChange { members, .. } if members.len() == 1),
    )
    .await;
    match event {
        CollabEvent::RoomUserChange { members, .. } => assert_eq!(members, vec![id1]),
        _ => unreachable!(),
    }
}
