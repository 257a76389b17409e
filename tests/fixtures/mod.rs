//! Test fixtures and helpers for integration testing

#![allow(dead_code)]

use async_trait::async_trait;
use chattr_relay::bus::{LocalBus, MessageBus};
use chattr_relay::config::{AppConfig, BusKind};
use chattr_relay::connection::{ConnectionHandle, Outbound};
use chattr_relay::error::Result;
use chattr_relay::metrics::MetricsCollector;
use chattr_relay::protocol::{ClientAction, ServerEvent};
use chattr_relay::relay::Relay;
use chattr_relay::service::build_relay;
use chattr_relay::storage::{ChatStore, InMemoryChatStore, PersistOutcome};
use chattr_relay::types::{ChatEvent, ChatMode, EventId, Room, RoomId, SearchPreferences};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

pub type Client = (ConnectionHandle, UnboundedReceiver<Outbound>);

/// Configuration with short retry backoffs and no rate limits
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.relay.persist_initial_backoff_ms = 5;
    config.relay.persist_max_backoff_ms = 20;
    config.relay.archive_initial_backoff_ms = 5;
    config.relay.archive_max_backoff_ms = 20;
    config.relay.grace_period_seconds = 30;
    config.relay.search_requests_per_minute = 0;
    config.relay.messages_per_minute = 0;
    config
}

/// An instance that forwards matchmaking to the coordinator
pub fn follower_config() -> AppConfig {
    let mut config = test_config();
    config.bus.kind = BusKind::Amqp;
    config.matchmaking.coordinator = false;
    config
}

/// A single-instance relay on the local bus
pub fn local_relay(store: Arc<dyn ChatStore>) -> Arc<Relay> {
    relay_on(store, Arc::new(LocalBus))
}

/// A relay attached to `bus` with a fresh instance id
pub fn relay_on(store: Arc<dyn ChatStore>, bus: Arc<dyn MessageBus>) -> Arc<Relay> {
    relay_with_config(&test_config(), store, bus)
}

pub fn relay_with_config(
    config: &AppConfig,
    store: Arc<dyn ChatStore>,
    bus: Arc<dyn MessageBus>,
) -> Arc<Relay> {
    let metrics = Arc::new(MetricsCollector::new().expect("metrics collector"));
    build_relay(config, uuid::Uuid::new_v4(), store, bus, metrics)
}

/// Open a connection for `user_id`
pub async fn connect(relay: &Relay, user_id: &str) -> Client {
    let (handle, rx) = ConnectionHandle::new(user_id);
    relay.connect(handle.clone()).await.expect("connect");
    (handle, rx)
}

/// Everything queued on the receiver so far, events only
pub fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        if let Outbound::Event(event) = frame {
            events.push(event);
        }
    }
    events
}

/// Wait for the next event matching `pick`, skipping everything else
pub async fn next_matching<T>(
    rx: &mut UnboundedReceiver<Outbound>,
    mut pick: impl FnMut(&ServerEvent) -> Option<T>,
) -> T {
    let wait = async {
        loop {
            match rx.recv().await {
                Some(Outbound::Event(event)) => {
                    if let Some(found) = pick(&event) {
                        return found;
                    }
                }
                Some(Outbound::Close { .. }) => continue,
                None => panic!("connection channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("timed out waiting for event")
}

/// Next chat message delivered to this connection
pub async fn next_message(rx: &mut UnboundedReceiver<Outbound>) -> ChatEvent {
    next_matching(rx, |event| match event {
        ServerEvent::Message { event, .. } => Some(event.clone()),
        _ => None,
    })
    .await
}

/// Poll `check` until it holds
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {}", what);
}

pub fn friends(min_age: u8, max_age: u8) -> SearchPreferences {
    SearchPreferences::new(ChatMode::Friends).with_ages(min_age, max_age)
}

pub async fn search(relay: &Relay, client: &Client, preferences: SearchPreferences) -> Result<()> {
    relay
        .handle_action(&client.0, ClientAction::StartSearch { preferences })
        .await
}

/// Connect two users and match them with each other
pub async fn matched_pair(relay: &Relay, a: &str, b: &str) -> (Room, Client, Client) {
    let mut first = connect(relay, a).await;
    let mut second = connect(relay, b).await;
    search(relay, &first, friends(18, 99)).await.expect("search");
    search(relay, &second, friends(18, 99)).await.expect("search");

    let room = relay
        .rooms()
        .active_room_of(a)
        .expect("room lookup")
        .expect("pair should be matched");
    drain(&mut first.1);
    drain(&mut second.1);
    (room, first, second)
}

pub async fn send(relay: &Relay, client: &Client, room_id: RoomId, content: &str, token: &str) {
    relay
        .handle_action(
            &client.0,
            ClientAction::SendMessage {
                room_id,
                content: content.to_string(),
                client_token: token.to_string(),
            },
        )
        .await
        .expect("send message");
}

/// Event ids acknowledged to this connection, in arrival order
pub fn acked_ids(events: &[ServerEvent]) -> Vec<EventId> {
    events
        .iter()
        .filter_map(|event| match event {
            ServerEvent::MessageAck { event_id, .. } => Some(*event_id),
            _ => None,
        })
        .collect()
}

/// Store whose writes fail a configurable number of times before succeeding
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemoryChatStore,
    persist_failures: AtomicUsize,
    record_failures: AtomicUsize,
    persist_calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` persist calls
    pub fn fail_persists(&self, n: usize) {
        self.persist_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` room registrations
    pub fn fail_room_records(&self, n: usize) {
        self.record_failures.store(n, Ordering::SeqCst);
    }

    pub fn persist_calls(&self) -> usize {
        self.persist_calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &InMemoryChatStore {
        &self.inner
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ChatStore for FlakyStore {
    async fn record_room(&self, room: &Room) -> Result<()> {
        if Self::take_failure(&self.record_failures) {
            return Err(anyhow::anyhow!("room registry unavailable"));
        }
        self.inner.record_room(room).await
    }

    async fn persist(&self, event: &ChatEvent) -> Result<PersistOutcome> {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.persist_failures) {
            return Err(anyhow::anyhow!("write timed out"));
        }
        self.inner.persist(event).await
    }

    async fn last_event_id(&self, room_id: RoomId) -> Result<EventId> {
        self.inner.last_event_id(room_id).await
    }

    async fn archive_room(&self, room_id: RoomId, events: &[ChatEvent]) -> Result<()> {
        self.inner.archive_room(room_id, events).await
    }

    async fn load_backlog(&self, room_id: RoomId, since_event_id: EventId) -> Result<Vec<ChatEvent>> {
        self.inner.load_backlog(room_id, since_event_id).await
    }
}
