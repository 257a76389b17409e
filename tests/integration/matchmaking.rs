//! Matchmaking integration tests
//!
//! Searches go through the relay exactly as a WebSocket client's actions would.

use crate::fixtures::{
    connect, drain, friends, local_relay, matched_pair, next_matching, relay_with_config, search,
    test_config, FlakyStore,
};
use chattr_relay::bus::LocalBus;
use chattr_relay::error::{error_code, ChatError};
use chattr_relay::matcher::MatchOutcome;
use chattr_relay::protocol::{ClientAction, ServerEvent};
use chattr_relay::storage::InMemoryChatStore;
use chattr_relay::types::{ChatMode, Gender, GenderFilter, SearchPreferences, SearchStatus};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn match_found_room(events: &[ServerEvent]) -> Option<(chattr_relay::types::RoomId, String)> {
    events.iter().find_map(|event| match event {
        ServerEvent::MatchFound {
            room_id,
            other_user,
        } => Some((*room_id, other_user.user_id.clone())),
        _ => None,
    })
}

#[tokio::test]
async fn test_compatible_pair_matched_and_other_mode_left_waiting() {
    let relay = local_relay(Arc::new(InMemoryChatStore::new()));
    let mut a = connect(&relay, "user_a").await;
    let mut b = connect(&relay, "user_b").await;
    let mut c = connect(&relay, "user_c").await;

    let dating = SearchPreferences::new(ChatMode::Dating);
    let (ra, rc, rb) = tokio::join!(
        search(&relay, &a, friends(20, 30)),
        search(&relay, &c, dating),
        search(&relay, &b, friends(25, 35)),
    );
    ra.unwrap();
    rb.unwrap();
    rc.unwrap();

    let (room_a, partner_a) = match_found_room(&drain(&mut a.1)).expect("A matched");
    let (room_b, partner_b) = match_found_room(&drain(&mut b.1)).expect("B matched");
    assert_eq!(room_a, room_b);
    assert_eq!(partner_a, "user_b");
    assert_eq!(partner_b, "user_a");

    let c_events = drain(&mut c.1);
    assert!(match_found_room(&c_events).is_none());
    assert!(c_events.iter().any(|event| matches!(
        event,
        ServerEvent::SearchStatus {
            status: SearchStatus::Searching { .. }
        }
    )));
    assert!(relay.matcher().pool().contains("user_c"));
    assert_eq!(relay.rooms().active_room_count(), 1);

    println!("✅ Compatible pair matched, other mode left waiting");
}

#[tokio::test]
async fn test_earliest_compatible_candidate_wins() {
    let relay = local_relay(Arc::new(InMemoryChatStore::new()));
    let seeking_women = SearchPreferences::new(ChatMode::Dating)
        .with_gender(Gender::Male, GenderFilter::Female);

    let first = connect(&relay, "first").await;
    let second = connect(&relay, "second").await;
    search(&relay, &first, seeking_women.clone()).await.unwrap();
    search(&relay, &second, seeking_women).await.unwrap();
    assert_eq!(relay.matcher().pool().len(), 2);

    let mut picker = connect(&relay, "picker").await;
    search(
        &relay,
        &picker,
        SearchPreferences::new(ChatMode::Dating).with_gender(Gender::Female, GenderFilter::Any),
    )
    .await
    .unwrap();

    let (_, partner) = match_found_room(&drain(&mut picker.1)).expect("picker matched");
    assert_eq!(partner, "first");
    assert!(relay.matcher().pool().contains("second"));
}

#[tokio::test]
async fn test_incompatible_preferences_never_pair() {
    let relay = local_relay(Arc::new(InMemoryChatStore::new()));
    let young = connect(&relay, "young").await;
    let older = connect(&relay, "older").await;

    search(&relay, &young, friends(18, 22)).await.unwrap();
    search(&relay, &older, friends(40, 60)).await.unwrap();

    assert_eq!(relay.rooms().active_room_count(), 0);
    assert_eq!(relay.matcher().pool().len(), 2);
}

#[tokio::test]
async fn test_repeated_search_is_not_an_error() {
    let relay = local_relay(Arc::new(InMemoryChatStore::new()));
    let mut alice = connect(&relay, "alice").await;

    search(&relay, &alice, friends(18, 99)).await.unwrap();
    search(&relay, &alice, friends(18, 99)).await.unwrap();

    assert_eq!(relay.matcher().pool().len(), 1);
    let statuses = drain(&mut alice.1)
        .into_iter()
        .filter(|event| matches!(event, ServerEvent::SearchStatus { .. }))
        .count();
    assert_eq!(statuses, 2);
}

#[tokio::test]
async fn test_cancel_search_reports_idle() {
    let relay = local_relay(Arc::new(InMemoryChatStore::new()));
    let mut alice = connect(&relay, "alice").await;
    search(&relay, &alice, friends(18, 99)).await.unwrap();
    drain(&mut alice.1);

    relay
        .handle_action(&alice.0, ClientAction::CancelSearch)
        .await
        .unwrap();
    // Cancelling twice is still fine.
    relay
        .handle_action(&alice.0, ClientAction::CancelSearch)
        .await
        .unwrap();

    let events = drain(&mut alice.1);
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|event| matches!(
        event,
        ServerEvent::SearchStatus {
            status: SearchStatus::Idle
        }
    )));
    assert!(relay.matcher().pool().is_empty());
}

#[tokio::test]
async fn test_search_while_in_room_returns_existing_room() {
    let relay = local_relay(Arc::new(InMemoryChatStore::new()));
    let (room, mut alice, _bob) = matched_pair(&relay, "alice", "bob").await;

    search(&relay, &alice, friends(18, 99)).await.unwrap();

    let (room_id, partner) = match_found_room(&drain(&mut alice.1)).expect("existing room");
    assert_eq!(room_id, room.room_id);
    assert_eq!(partner, "bob");
    assert!(relay.matcher().pool().is_empty());
}

#[tokio::test]
async fn test_disconnect_drops_search() {
    let relay = local_relay(Arc::new(InMemoryChatStore::new()));
    let alice = connect(&relay, "alice").await;
    search(&relay, &alice, friends(18, 99)).await.unwrap();

    relay.disconnect(&alice.0).await.unwrap();
    assert!(relay.matcher().pool().is_empty());

    // A later searcher does not get paired with the departed user.
    let bob = connect(&relay, "bob").await;
    search(&relay, &bob, friends(18, 99)).await.unwrap();
    assert_eq!(relay.rooms().active_room_count(), 0);
}

#[tokio::test]
async fn test_failed_room_creation_requeues_both_users() {
    let store = Arc::new(FlakyStore::new());
    store.fail_room_records(1);
    let relay = local_relay(store.clone());

    let mut alice = connect(&relay, "alice").await;
    let mut bob = connect(&relay, "bob").await;
    search(&relay, &alice, friends(18, 99)).await.unwrap();
    drain(&mut alice.1);

    let err = search(&relay, &bob, friends(18, 99)).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ChatError>(),
        Some(ChatError::MatchCreationFailed { .. })
    ));
    let notice = next_matching(&mut alice.1, |event| match event {
        ServerEvent::Error { code, .. } => Some(code.clone()),
        _ => None,
    })
    .await;
    assert_eq!(notice, "MATCH_CREATION_FAILED");

    // Both records are back in the pool and nobody holds a room.
    assert!(relay.matcher().pool().contains("alice"));
    assert!(relay.matcher().pool().contains("bob"));
    assert_eq!(relay.rooms().active_room_count(), 0);

    // Retrying the search succeeds once storage recovers.
    search(&relay, &bob, friends(18, 99)).await.unwrap();
    let (room_id, partner) = match_found_room(&drain(&mut bob.1)).expect("bob matched");
    assert_eq!(partner, "alice");
    assert_eq!(
        relay.rooms().active_room_of("alice").unwrap().map(|r| r.room_id),
        Some(room_id)
    );
    assert!(relay.matcher().pool().is_empty());

    println!("✅ Failed room creation re-enqueued both users");
}

#[tokio::test]
async fn test_skipped_partner_not_rematched_during_cooldown() {
    let relay = local_relay(Arc::new(InMemoryChatStore::new()));
    let (room, alice, bob) = matched_pair(&relay, "alice", "bob").await;

    relay
        .handle_action(&alice.0, ClientAction::Skip { room_id: room.room_id })
        .await
        .unwrap();

    search(&relay, &alice, friends(18, 99)).await.unwrap();
    search(&relay, &bob, friends(18, 99)).await.unwrap();
    assert_eq!(relay.rooms().active_room_count(), 0);

    // A fresh user is still matched right away.
    let carol = connect(&relay, "carol").await;
    search(&relay, &carol, friends(18, 99)).await.unwrap();
    let room = relay.rooms().active_room_of("carol").unwrap().expect("carol matched");
    assert_eq!(room.other_participant("carol").map(String::as_str), Some("alice"));
}

#[tokio::test]
async fn test_blocked_partner_never_rematched() {
    let relay = local_relay(Arc::new(InMemoryChatStore::new()));
    let (room, _alice, bob) = matched_pair(&relay, "alice", "bob").await;

    relay
        .handle_action(&bob.0, ClientAction::Block { room_id: room.room_id })
        .await
        .unwrap();

    let outcome = relay
        .matcher()
        .start_search("alice", &friends(18, 99))
        .await
        .unwrap();
    assert!(matches!(outcome, MatchOutcome::Pending(_)));
    let outcome = relay
        .matcher()
        .start_search("bob", &friends(18, 99))
        .await
        .unwrap();
    assert!(matches!(outcome, MatchOutcome::Pending(_)));
}

#[tokio::test]
async fn test_stale_searches_expire() {
    let relay = local_relay(Arc::new(InMemoryChatStore::new()));
    let mut alice = connect(&relay, "alice").await;
    search(&relay, &alice, friends(18, 22)).await.unwrap();
    drain(&mut alice.1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let expired = relay
        .matcher()
        .expire_stale(Duration::from_millis(10))
        .await
        .unwrap();

    assert_eq!(expired, vec!["alice".to_string()]);
    assert_eq!(drain(&mut alice.1), vec![ServerEvent::SearchExpired]);
    assert!(relay.matcher().pool().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_searches_pair_everyone_exactly_once() {
    let relay = local_relay(Arc::new(InMemoryChatStore::new()));
    let users: Vec<String> = (0..50).map(|i| format!("user-{}", i)).collect();

    let searches = users.iter().cloned().map(|user| {
        let relay = relay.clone();
        tokio::spawn(async move {
            relay
                .matcher()
                .start_search(&user, &SearchPreferences::new(ChatMode::Random))
                .await
        })
    });
    for result in join_all(searches).await {
        result.expect("task panicked").expect("search failed");
    }

    assert!(relay.matcher().pool().is_empty());
    assert_eq!(relay.rooms().active_room_count(), 25);

    let mut seen = HashSet::new();
    for user in &users {
        let room = relay
            .rooms()
            .active_room_of(user)
            .unwrap()
            .expect("every user is in a room");
        let partner = room.other_participant(user).expect("participant").clone();
        assert_ne!(&partner, user);
        assert_eq!(
            relay.rooms().active_room_of(&partner).unwrap().map(|r| r.room_id),
            Some(room.room_id)
        );
        seen.insert(room.room_id);
    }
    assert_eq!(seen.len(), 25);

    println!("✅ 50 concurrent searches produced 25 disjoint rooms");
}

#[tokio::test]
async fn test_search_actions_over_the_limit_are_refused() {
    let mut config = test_config();
    config.relay.search_requests_per_minute = 3;
    let relay = relay_with_config(
        &config,
        Arc::new(InMemoryChatStore::new()),
        Arc::new(LocalBus),
    );
    let alice = connect(&relay, "alice").await;
    let bob = connect(&relay, "bob").await;

    search(&relay, &alice, friends(18, 99)).await.unwrap();
    relay
        .handle_action(&alice.0, ClientAction::CancelSearch)
        .await
        .unwrap();
    search(&relay, &alice, friends(18, 99)).await.unwrap();

    let err = relay
        .handle_action(&alice.0, ClientAction::CancelSearch)
        .await
        .unwrap_err();
    assert_eq!(error_code(&err), "RATE_LIMITED");
    assert!(matches!(
        ServerEvent::from_error(&err),
        ServerEvent::Error { ref code, .. } if code == "RATE_LIMITED"
    ));
    assert!(relay.matcher().pool().contains("alice"));

    // The limit is per user.
    search(&relay, &bob, friends(18, 99)).await.unwrap();
    assert!(relay.rooms().active_room_of("alice").unwrap().is_some());
}
