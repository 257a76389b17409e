//! Message delivery and room lifecycle integration tests

use crate::fixtures::{
    acked_ids, connect, drain, local_relay, matched_pair, next_message, send, FlakyStore,
};
use chattr_relay::connection::{ConnectionHandle, Outbound};
use chattr_relay::error::ChatError;
use chattr_relay::protocol::{ClientAction, ServerEvent, CLOSE_CODE_SUPERSEDED};
use chattr_relay::relay::CLOSE_CODE_GOING_AWAY;
use chattr_relay::room::CloseOutcome;
use chattr_relay::storage::{ChatStore, InMemoryChatStore};
use chattr_relay::types::{CloseReason, RoomState};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_messages_arrive_in_event_id_order() {
    let relay = local_relay(Arc::new(InMemoryChatStore::new()));
    let (room, alice, mut bob) = matched_pair(&relay, "alice", "bob").await;

    send(&relay, &alice, room.room_id, "hi", "a-1").await;
    send(&relay, &alice, room.room_id, "how are you", "a-2").await;

    let first = next_message(&mut bob.1).await;
    let second = next_message(&mut bob.1).await;
    assert_eq!((first.event_id, first.payload.as_str()), (1, "hi"));
    assert_eq!((second.event_id, second.payload.as_str()), (2, "how are you"));
}

#[tokio::test]
async fn test_n_messages_with_retries_yield_n_ordered_events() {
    let store = Arc::new(FlakyStore::new());
    let relay = local_relay(store.clone());
    let (room, mut alice, _bob) = matched_pair(&relay, "alice", "bob").await;

    const N: usize = 20;
    for i in 0..N {
        if i % 5 == 0 {
            // Two transient failures are within the three-attempt budget.
            store.fail_persists(2);
        }
        send(&relay, &alice, room.room_id, &format!("message {}", i), &format!("t-{}", i)).await;
        if i % 7 == 0 {
            // Client retry of the same message after a lost ack.
            send(&relay, &alice, room.room_id, &format!("message {}", i), &format!("t-{}", i)).await;
        }
    }

    let events = store.load_backlog(room.room_id, 0).await.unwrap();
    assert_eq!(events.len(), N);
    let ids: Vec<u64> = events.iter().map(|event| event.event_id).collect();
    assert_eq!(ids, (1..=N as u64).collect::<Vec<_>>());
    assert!(store.persist_calls() > N);

    let acks = acked_ids(&drain(&mut alice.1));
    assert_eq!(acks.len(), N + 3);
    assert!(acks.windows(2).all(|pair| pair[0] <= pair[1]));

    println!("✅ {} messages with retries stored exactly once each", N);
}

#[tokio::test]
async fn test_delivery_failure_then_resend_with_same_token() {
    let store = Arc::new(FlakyStore::new());
    let relay = local_relay(store.clone());
    let (room, mut alice, mut bob) = matched_pair(&relay, "alice", "bob").await;

    store.fail_persists(10);
    send(&relay, &alice, room.room_id, "lost?", "t-1").await;
    assert_eq!(
        drain(&mut alice.1),
        vec![ServerEvent::DeliveryFailed {
            room_id: room.room_id,
            client_token: "t-1".to_string(),
        }]
    );
    assert!(drain(&mut bob.1).is_empty());

    store.fail_persists(0);
    send(&relay, &alice, room.room_id, "lost?", "t-1").await;
    assert_eq!(acked_ids(&drain(&mut alice.1)), vec![1]);
    assert_eq!(next_message(&mut bob.1).await.payload, "lost?");
    assert_eq!(store.inner().event_count(room.room_id), 1);
}

#[tokio::test]
async fn test_typing_and_read_receipts_reach_partner() {
    let relay = local_relay(Arc::new(InMemoryChatStore::new()));
    let (room, mut alice, mut bob) = matched_pair(&relay, "alice", "bob").await;

    send(&relay, &alice, room.room_id, "hi", "a-1").await;
    relay
        .handle_action(&bob.0, ClientAction::Typing { room_id: room.room_id })
        .await
        .unwrap();
    relay
        .handle_action(
            &bob.0,
            ClientAction::MarkRead {
                room_id: room.room_id,
                up_to_event_id: 1,
            },
        )
        .await
        .unwrap();

    let events = drain(&mut alice.1);
    assert!(events.contains(&ServerEvent::Typing {
        room_id: room.room_id,
        user_id: "bob".to_string(),
    }));
    assert!(events.contains(&ServerEvent::ReadReceipt {
        room_id: room.room_id,
        user_id: "bob".to_string(),
        up_to_event_id: 1,
    }));
    drain(&mut bob.1);
}

#[tokio::test]
async fn test_closing_twice_matches_closing_once() {
    let store = Arc::new(InMemoryChatStore::new());
    let relay = local_relay(store.clone());
    let (room, mut alice, mut bob) = matched_pair(&relay, "alice", "bob").await;
    send(&relay, &alice, room.room_id, "bye", "a-1").await;
    drain(&mut alice.1);
    drain(&mut bob.1);

    relay
        .handle_action(&alice.0, ClientAction::Skip { room_id: room.room_id })
        .await
        .unwrap();
    let first_view = relay.rooms().get(room.room_id).unwrap().unwrap();
    let archived = store.archived(room.room_id).expect("archived on close");

    let again = relay
        .rooms()
        .close(room.room_id, CloseReason::BothDisconnected)
        .await
        .unwrap();
    assert_eq!(again, CloseOutcome::AlreadyClosed);
    assert_eq!(
        relay.admin_close(room.room_id).await.unwrap(),
        CloseOutcome::AlreadyClosed
    );

    let second_view = relay.rooms().get(room.room_id).unwrap().unwrap();
    assert_eq!(first_view, second_view);
    assert_eq!(second_view.state, RoomState::Closed);
    assert_eq!(second_view.close_reason, Some(CloseReason::Skip));
    assert_eq!(store.archived(room.room_id), Some(archived));

    let closed = ServerEvent::RoomClosed {
        room_id: room.room_id,
        reason: CloseReason::Skip,
    };
    assert_eq!(drain(&mut alice.1), vec![closed.clone()]);
    assert_eq!(drain(&mut bob.1), vec![closed]);
    assert_eq!(relay.rooms().get_stats().unwrap().rooms_closed, 1);
}

#[tokio::test]
async fn test_actions_on_closed_room_are_rejected() {
    let relay = local_relay(Arc::new(InMemoryChatStore::new()));
    let (room, alice, bob) = matched_pair(&relay, "alice", "bob").await;
    relay
        .handle_action(&alice.0, ClientAction::Block { room_id: room.room_id })
        .await
        .unwrap();

    let err = relay
        .handle_action(&bob.0, ClientAction::Typing { room_id: room.room_id })
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ChatError>(),
        Some(ChatError::RoomClosed { .. })
    ));
    assert_eq!(ServerEvent::from_error(&err).name(), "error");
}

#[tokio::test]
async fn test_new_connection_supersedes_old_one() {
    let relay = local_relay(Arc::new(InMemoryChatStore::new()));
    let (room, mut alice, mut bob) = matched_pair(&relay, "alice", "bob").await;
    send(&relay, &bob, room.room_id, "ping", "b-1").await;
    drain(&mut alice.1);

    let (replacement, mut replacement_rx) = ConnectionHandle::new("alice");
    relay.connect(replacement.clone()).await.unwrap();

    match alice.1.try_recv() {
        Ok(Outbound::Close { code, .. }) => assert_eq!(code, CLOSE_CODE_SUPERSEDED),
        other => panic!("old handle got {:?}", other),
    }
    assert_eq!(relay.registry().connection_count(), 2);
    assert_eq!(
        relay.registry().current("alice").map(|handle| handle.id()),
        Some(replacement.id())
    );

    // The late disconnect of the superseded socket changes nothing.
    relay.disconnect(&alice.0).await.unwrap();
    assert!(relay.registry().is_connected("alice"));
    assert!(!relay.rooms().has_pending_close(room.room_id));

    let history = drain(&mut replacement_rx);
    assert!(matches!(history.as_slice(), [ServerEvent::History { events, .. }] if events.len() == 1));
    send(&relay, &bob, room.room_id, "still here?", "b-2").await;
    assert_eq!(next_message(&mut replacement_rx).await.event_id, 2);
    drain(&mut bob.1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_within_grace_keeps_room_and_replays_backlog() {
    let relay = local_relay(Arc::new(InMemoryChatStore::new()));
    let (room, alice, bob) = matched_pair(&relay, "alice", "bob").await;
    send(&relay, &alice, room.room_id, "brb", "a-1").await;

    relay.disconnect(&alice.0).await.unwrap();
    send(&relay, &bob, room.room_id, "while you were away", "b-1").await;
    relay.disconnect(&bob.0).await.unwrap();
    assert!(relay.rooms().has_pending_close(room.room_id));

    tokio::time::sleep(Duration::from_secs(10)).await;
    let mut back = connect(&relay, "alice").await;
    assert!(!relay.rooms().has_pending_close(room.room_id));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(relay.rooms().get(room.room_id).unwrap().unwrap().is_active());

    match drain(&mut back.1).as_slice() {
        [ServerEvent::History { room_id, events }] => {
            assert_eq!(*room_id, room.room_id);
            let payloads: Vec<&str> = events.iter().map(|e| e.payload.as_str()).collect();
            assert_eq!(payloads, vec!["brb", "while you were away"]);
        }
        other => panic!("unexpected events {:?}", other),
    }

    let backlog = relay.backlog("alice", room.room_id, 1).await.unwrap();
    assert_eq!(backlog.len(), 1);
    assert_eq!(backlog[0].sender_id, "bob");
}

#[tokio::test(start_paused = true)]
async fn test_grace_period_expiry_closes_room() {
    let store = Arc::new(InMemoryChatStore::new());
    let relay = local_relay(store.clone());
    let (room, alice, bob) = matched_pair(&relay, "alice", "bob").await;
    send(&relay, &alice, room.room_id, "hello", "a-1").await;

    relay.disconnect(&alice.0).await.unwrap();
    relay.disconnect(&bob.0).await.unwrap();

    tokio::time::sleep(Duration::from_secs(31)).await;

    let closed = relay.rooms().get(room.room_id).unwrap().unwrap();
    assert_eq!(closed.state, RoomState::Closed);
    assert_eq!(closed.close_reason, Some(CloseReason::BothDisconnected));
    assert_eq!(store.archived(room.room_id).map(|events| events.len()), Some(1));
    assert!(relay.rooms().active_room_of("alice").unwrap().is_none());
}

#[tokio::test]
async fn test_shutdown_closes_every_connection() {
    let relay = local_relay(Arc::new(InMemoryChatStore::new()));
    let mut alice = connect(&relay, "alice").await;
    let mut bob = connect(&relay, "bob").await;

    assert_eq!(relay.shutdown().unwrap(), 2);
    for rx in [&mut alice.1, &mut bob.1] {
        assert!(matches!(
            rx.try_recv(),
            Ok(Outbound::Close { code, .. }) if code == CLOSE_CODE_GOING_AWAY
        ));
    }
}

#[tokio::test]
async fn test_read_receipt_cannot_run_ahead_of_the_room() {
    let relay = local_relay(Arc::new(InMemoryChatStore::new()));
    let (room, mut alice, bob) = matched_pair(&relay, "alice", "bob").await;
    send(&relay, &alice, room.room_id, "hi", "a-1").await;
    drain(&mut alice.1);

    let err = relay
        .handle_action(
            &bob.0,
            ClientAction::MarkRead {
                room_id: room.room_id,
                up_to_event_id: 2,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ChatError>(),
        Some(ChatError::InvalidRequest { .. })
    ));
    assert!(drain(&mut alice.1).is_empty());

    // A later message makes the same mark valid.
    send(&relay, &alice, room.room_id, "still there?", "a-2").await;
    drain(&mut alice.1);
    relay
        .handle_action(
            &bob.0,
            ClientAction::MarkRead {
                room_id: room.room_id,
                up_to_event_id: 2,
            },
        )
        .await
        .unwrap();
    assert_eq!(
        drain(&mut alice.1),
        vec![ServerEvent::ReadReceipt {
            room_id: room.room_id,
            user_id: "bob".to_string(),
            up_to_event_id: 2,
        }]
    );
}
