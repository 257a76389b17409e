//! Connection registry
//!
//! Maps each user to its single authoritative handle on this instance and each
//! room to the users whose handle is currently bound to it. Every handle owns an
//! unbounded channel drained by the socket writer task, so sends never block.

use crate::error::{ChatError, Result};
use crate::protocol::{ServerEvent, CLOSE_CODE_SUPERSEDED};
use crate::types::{ConnectionId, RoomId, UserId};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Frame queued for a connection's writer task
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(ServerEvent),
    Close { code: u16, reason: String },
}

/// One live persistent connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: UserId,
    sender: mpsc::UnboundedSender<Outbound>,
    connected_at: DateTime<Utc>,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end its writer task drains
    pub fn new(user_id: impl Into<UserId>) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            sender,
            connected_at: Utc::now(),
        };
        (handle, receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Queue an event; false once the writer task is gone
    pub fn send(&self, event: ServerEvent) -> bool {
        self.sender.send(Outbound::Event(event)).is_ok()
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.sender.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

#[derive(Debug)]
struct Bound {
    handle: ConnectionHandle,
    room: Option<RoomId>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    by_user: HashMap<UserId, Bound>,
    rooms: HashMap<RoomId, HashSet<UserId>>,
}

impl RegistryInner {
    fn detach_room(&mut self, user_id: &str, room: Option<RoomId>) {
        let Some(room_id) = room else { return };
        if let Some(members) = self.rooms.get_mut(&room_id) {
            members.remove(user_id);
            if members.is_empty() {
                self.rooms.remove(&room_id);
            }
        }
    }
}

/// Registry of live handles on this instance
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, RegistryInner>> {
        self.inner
            .read()
            .map_err(|_| ChatError::lock("connection registry").into())
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, RegistryInner>> {
        self.inner
            .write()
            .map_err(|_| ChatError::lock("connection registry").into())
    }

    /// Make `handle` the user's authoritative handle
    ///
    /// A previous handle is replaced in the same critical section, loses its room
    /// binding, and is told to close with the superseded code. It is returned so
    /// the caller can account for it.
    pub fn register(&self, handle: ConnectionHandle) -> Result<Option<ConnectionHandle>> {
        let user_id = handle.user_id().clone();
        let mut inner = self.write()?;

        let previous = inner.by_user.insert(
            user_id.clone(),
            Bound {
                handle,
                room: None,
            },
        );

        let Some(previous) = previous else {
            debug!("Registered first connection for {}", user_id);
            return Ok(None);
        };

        inner.detach_room(&user_id, previous.room);
        drop(inner);

        info!(
            "Connection {} for {} superseded by a newer connection",
            previous.handle.id(),
            user_id
        );
        previous
            .handle
            .close(CLOSE_CODE_SUPERSEDED, "connection superseded");
        Ok(Some(previous.handle))
    }

    /// Remove a handle if it is still the user's authoritative one
    pub fn unregister(&self, handle: &ConnectionHandle) -> Result<bool> {
        let mut inner = self.write()?;
        let is_current = inner
            .by_user
            .get(handle.user_id())
            .is_some_and(|bound| bound.handle.id() == handle.id());
        if !is_current {
            return Ok(false);
        }

        if let Some(bound) = inner.by_user.remove(handle.user_id()) {
            inner.detach_room(handle.user_id(), bound.room);
        }
        Ok(true)
    }

    /// Bind the user's current handle to a room, replacing any previous binding
    pub fn bind_room(&self, user_id: &str, room_id: RoomId) -> Result<bool> {
        let mut inner = self.write()?;
        let previous = match inner.by_user.get_mut(user_id) {
            Some(bound) => bound.room.replace(room_id),
            None => return Ok(false),
        };
        if previous != Some(room_id) {
            inner.detach_room(user_id, previous);
        }
        inner
            .rooms
            .entry(room_id)
            .or_default()
            .insert(user_id.to_string());
        Ok(true)
    }

    /// Unsubscribe every handle bound to a room, returning the affected users
    pub fn unbind_room(&self, room_id: RoomId) -> Result<Vec<UserId>> {
        let mut inner = self.write()?;
        let members = inner.rooms.remove(&room_id).unwrap_or_default();
        for user_id in &members {
            if let Some(bound) = inner.by_user.get_mut(user_id) {
                if bound.room == Some(room_id) {
                    bound.room = None;
                }
            }
        }
        Ok(members.into_iter().collect())
    }

    /// Deliver to one user's handle; false if the user has no live handle here
    pub fn send(&self, user_id: &str, event: ServerEvent) -> Result<bool> {
        let inner = self.read()?;
        Ok(inner
            .by_user
            .get(user_id)
            .is_some_and(|bound| bound.handle.send(event)))
    }

    /// Deliver to every handle bound to the room, returning how many accepted it
    pub fn broadcast_to_room(
        &self,
        room_id: RoomId,
        event: &ServerEvent,
        exclude: Option<&str>,
    ) -> Result<usize> {
        let inner = self.read()?;
        let Some(members) = inner.rooms.get(&room_id) else {
            return Ok(0);
        };

        let delivered = members
            .iter()
            .filter(|user_id| Some(user_id.as_str()) != exclude)
            .filter_map(|user_id| inner.by_user.get(user_id))
            .filter(|bound| bound.handle.send(event.clone()))
            .count();
        Ok(delivered)
    }

    pub fn current(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.read()
            .ok()
            .and_then(|inner| inner.by_user.get(user_id).map(|b| b.handle.clone()))
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.read()
            .map(|inner| inner.by_user.contains_key(user_id))
            .unwrap_or(false)
    }

    pub fn room_of(&self, user_id: &str) -> Option<RoomId> {
        self.read()
            .ok()
            .and_then(|inner| inner.by_user.get(user_id).and_then(|b| b.room))
    }

    /// Users whose handle is bound to the room
    pub fn room_members(&self, room_id: RoomId) -> Vec<UserId> {
        self.read()
            .map(|inner| {
                inner
                    .rooms
                    .get(&room_id)
                    .map(|m| m.iter().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.read().map(|inner| inner.by_user.len()).unwrap_or(0)
    }

    /// Close every handle, used on shutdown
    pub fn close_all(&self, code: u16, reason: &str) -> Result<usize> {
        let mut inner = self.write()?;
        let count = inner.by_user.len();
        for bound in inner.by_user.values() {
            bound.handle.close(code, reason);
        }
        inner.by_user.clear();
        inner.rooms.clear();
        Ok(count)
    }
}
