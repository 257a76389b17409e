//! Two relay instances sharing a store and an in-process bus
//!
//! Alice is connected to the first instance, which coordinates matchmaking,
//! and Bob to the second; everything Bob sees about Alice travels over the bus.

use crate::fixtures::{
    acked_ids, connect, drain, eventually, follower_config, friends, next_matching, next_message,
    relay_on, relay_with_config, search, send, Client,
};
use chattr_relay::bus::{InMemoryBusHub, MessageBus};
use chattr_relay::connection::Outbound;
use chattr_relay::protocol::{ClientAction, ServerEvent};
use chattr_relay::relay::Relay;
use chattr_relay::storage::{ChatStore, InMemoryChatStore};
use chattr_relay::types::{CloseReason, EventId, Room, RoomId, SearchStatus};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

struct Cluster {
    store: Arc<InMemoryChatStore>,
    first: Arc<Relay>,
    second: Arc<Relay>,
}

async fn cluster() -> Cluster {
    let hub = InMemoryBusHub::default();
    let store = Arc::new(InMemoryChatStore::new());

    let first_bus: Arc<dyn MessageBus> = Arc::new(hub.connect());
    let second_bus: Arc<dyn MessageBus> = Arc::new(hub.connect());
    let first = relay_on(store.clone(), first_bus.clone());
    let second = relay_with_config(&follower_config(), store.clone(), second_bus.clone());
    first_bus.subscribe(first.clone()).await.unwrap();
    second_bus.subscribe(second.clone()).await.unwrap();

    Cluster {
        store,
        first,
        second,
    }
}

/// Match Alice (first instance) with Bob (second instance)
async fn cross_pair(cluster: &Cluster) -> (Room, Client, Client) {
    let mut alice = connect(&cluster.first, "alice").await;
    let mut bob = connect(&cluster.second, "bob").await;

    search(&cluster.second, &bob, friends(18, 99)).await.unwrap();
    let first = cluster.first.clone();
    eventually("bob waiting in the coordinator's pool", || {
        first.matcher().pool().contains("bob")
    })
    .await;
    search(&cluster.first, &alice, friends(18, 99)).await.unwrap();

    let room = cluster
        .first
        .rooms()
        .active_room_of("alice")
        .unwrap()
        .expect("alice matched");
    let bob_room = next_matching(&mut bob.1, |event| match event {
        ServerEvent::MatchFound {
            room_id,
            other_user,
        } => Some((*room_id, other_user.user_id.clone())),
        _ => None,
    })
    .await;
    assert_eq!(bob_room, (room.room_id, "alice".to_string()));

    let second = cluster.second.clone();
    eventually("room mirrored on the second instance", || {
        second.registry().room_of("bob") == Some(room.room_id)
    })
    .await;

    drain(&mut alice.1);
    drain(&mut bob.1);
    (room, alice, bob)
}

#[tokio::test]
async fn test_match_found_reaches_user_on_other_instance() {
    let cluster = cluster().await;
    let (room, _alice, _bob) = cross_pair(&cluster).await;

    let mirrored = cluster
        .second
        .rooms()
        .get(room.room_id)
        .unwrap()
        .expect("mirrored room");
    assert!(mirrored.is_active());
    assert_eq!(cluster.second.rooms().get_stats().unwrap().rooms_mirrored, 1);
    assert_eq!(cluster.store.room(room.room_id), Some(room));
}

#[tokio::test]
async fn test_cross_instance_messages_keep_event_id_order() {
    let cluster = cluster().await;
    let (room, alice, mut bob) = cross_pair(&cluster).await;

    for i in 1..=10 {
        send(&cluster.first, &alice, room.room_id, &format!("m{}", i), &format!("a-{}", i)).await;
    }

    for expected in 1..=10u64 {
        let event = next_message(&mut bob.1).await;
        assert_eq!(event.event_id, expected);
        assert_eq!(event.payload, format!("m{}", expected));
        assert_eq!(event.sender_id, "alice");
    }

    println!("✅ Ten messages crossed instances in event id order");
}

#[tokio::test]
async fn test_reply_from_other_instance_continues_sequence() {
    let cluster = cluster().await;
    let (room, mut alice, mut bob) = cross_pair(&cluster).await;

    send(&cluster.first, &alice, room.room_id, "hi", "a-1").await;
    assert_eq!(next_message(&mut bob.1).await.event_id, 1);

    send(&cluster.second, &bob, room.room_id, "hello!", "b-1").await;
    let reply = next_message(&mut alice.1).await;
    assert_eq!(reply.event_id, 2);
    assert_eq!(reply.payload, "hello!");

    let backlog = cluster.store.load_backlog(room.room_id, 0).await.unwrap();
    let ids: Vec<u64> = backlog.iter().map(|event| event.event_id).collect();
    assert_eq!(ids, vec![1, 2]);
}

#[tokio::test]
async fn test_typing_and_receipts_cross_instances() {
    let cluster = cluster().await;
    let (room, mut alice, bob) = cross_pair(&cluster).await;

    cluster
        .second
        .handle_action(&bob.0, ClientAction::Typing { room_id: room.room_id })
        .await
        .unwrap();

    let typist = next_matching(&mut alice.1, |event| match event {
        ServerEvent::Typing { user_id, .. } => Some(user_id.clone()),
        _ => None,
    })
    .await;
    assert_eq!(typist, "bob");
}

#[tokio::test]
async fn test_skip_on_one_instance_closes_room_everywhere() {
    let cluster = cluster().await;
    let (room, mut alice, bob) = cross_pair(&cluster).await;

    cluster
        .second
        .handle_action(&bob.0, ClientAction::Skip { room_id: room.room_id })
        .await
        .unwrap();

    let reason = next_matching(&mut alice.1, |event| match event {
        ServerEvent::RoomClosed { room_id, reason } if *room_id == room.room_id => Some(*reason),
        _ => None,
    })
    .await;
    assert_eq!(reason, CloseReason::Skip);

    let first = cluster.first.clone();
    eventually("room closed on the first instance", || {
        first
            .rooms()
            .active_room_of("alice")
            .map(|room| room.is_none())
            .unwrap_or(false)
    })
    .await;
    assert!(cluster.store.archived(room.room_id).is_some());
}

#[tokio::test]
async fn test_presence_of_remote_partner() {
    let cluster = cluster().await;
    let (_room, mut alice, bob) = cross_pair(&cluster).await;

    cluster.second.disconnect(&bob.0).await.unwrap();

    let change = next_matching(&mut alice.1, |event| match event {
        ServerEvent::Presence { user_id, online } => Some((user_id.clone(), *online)),
        _ => None,
    })
    .await;
    assert_eq!(change, ("bob".to_string(), false));
}

/// Acks and delivered message ids seen by one connection, until `messages` arrived
async fn collect(
    rx: &mut UnboundedReceiver<Outbound>,
    messages: usize,
) -> (Vec<EventId>, Vec<EventId>) {
    let mut events = Vec::new();
    let mut delivered = Vec::new();
    while delivered.len() < messages {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for messages")
            .expect("connection channel closed");
        if let Outbound::Event(event) = event {
            if let ServerEvent::Message { event, .. } = &event {
                delivered.push(event.event_id);
            }
            events.push(event);
        }
    }
    events.extend(drain(rx));
    (acked_ids(&events), delivered)
}

#[tokio::test]
async fn test_search_on_follower_is_matched_by_coordinator() {
    let cluster = cluster().await;
    let mut bob = connect(&cluster.second, "bob").await;

    search(&cluster.second, &bob, friends(18, 99)).await.unwrap();
    let status = next_matching(&mut bob.1, |event| match event {
        ServerEvent::SearchStatus { status } => Some(status.clone()),
        _ => None,
    })
    .await;
    assert!(matches!(status, SearchStatus::Searching { .. }));
    assert!(cluster.second.matcher().pool().is_empty());
    assert!(cluster.first.matcher().pool().contains("bob"));

    cluster
        .second
        .handle_action(&bob.0, ClientAction::CancelSearch)
        .await
        .unwrap();
    let first = cluster.first.clone();
    eventually("bob left the coordinator's pool", || {
        !first.matcher().pool().contains("bob")
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sends_from_both_instances_are_all_kept() {
    let cluster = cluster().await;
    let (room, mut alice, mut bob) = cross_pair(&cluster).await;

    const PER_SIDE: usize = 20;
    let spawn_sends = |relay: Arc<Relay>, client: &Client, prefix: &'static str, room_id: RoomId| {
        let handle = client.0.clone();
        tokio::spawn(async move {
            for i in 0..PER_SIDE {
                relay
                    .handle_action(
                        &handle,
                        ClientAction::SendMessage {
                            room_id,
                            content: format!("{} {}", prefix, i),
                            client_token: format!("{}-{}", prefix, i),
                        },
                    )
                    .await
                    .expect("send message");
            }
        })
    };
    let from_alice = spawn_sends(cluster.first.clone(), &alice, "alice", room.room_id);
    let from_bob = spawn_sends(cluster.second.clone(), &bob, "bob", room.room_id);
    from_alice.await.unwrap();
    from_bob.await.unwrap();

    let backlog = cluster.store.load_backlog(room.room_id, 0).await.unwrap();
    assert_eq!(backlog.len(), 2 * PER_SIDE);
    let ids: Vec<EventId> = backlog.iter().map(|event| event.event_id).collect();
    assert_eq!(ids, (1..=(2 * PER_SIDE) as u64).collect::<Vec<_>>());

    let (alice_acks, alice_received) = collect(&mut alice.1, PER_SIDE).await;
    let (bob_acks, bob_received) = collect(&mut bob.1, PER_SIDE).await;
    assert_eq!(alice_acks.len(), PER_SIDE);
    assert_eq!(bob_acks.len(), PER_SIDE);

    // Every id went to exactly one sender and reached the other side.
    let alice_acks: HashSet<EventId> = alice_acks.into_iter().collect();
    let bob_acks: HashSet<EventId> = bob_acks.into_iter().collect();
    assert!(alice_acks.is_disjoint(&bob_acks));
    assert_eq!(alice_acks, bob_received.into_iter().collect::<HashSet<_>>());
    assert_eq!(bob_acks, alice_received.into_iter().collect::<HashSet<_>>());
}

#[tokio::test]
async fn test_resend_through_other_instance_acks_original_event() {
    let cluster = cluster().await;
    let (room, alice, mut bob) = cross_pair(&cluster).await;

    send(&cluster.first, &alice, room.room_id, "hi", "a-1").await;
    assert_eq!(next_message(&mut bob.1).await.event_id, 1);

    // The ack was lost and alice comes back through the other instance.
    cluster.first.disconnect(&alice.0).await.unwrap();
    let mut alice = connect(&cluster.second, "alice").await;
    drain(&mut alice.1);

    send(&cluster.second, &alice, room.room_id, "hi", "a-1").await;
    assert_eq!(acked_ids(&drain(&mut alice.1)), vec![1]);
    assert_eq!(cluster.store.event_count(room.room_id), 1);

    send(&cluster.second, &alice, room.room_id, "still here", "a-2").await;
    assert_eq!(acked_ids(&drain(&mut alice.1)), vec![2]);
    let ids: Vec<EventId> = cluster
        .store
        .load_backlog(room.room_id, 0)
        .await
        .unwrap()
        .iter()
        .map(|event| event.event_id)
        .collect();
    assert_eq!(ids, vec![1, 2]);
}
