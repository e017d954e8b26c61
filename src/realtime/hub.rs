//! Room registry and broadcast fan-out.
//!
//! One hub belongs to one module instance. Rooms are created on first join
//! and evicted as soon as their last member leaves; a member that closes is
//! removed from every room by a callback it runs on close.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::lifecycle::{CloseObserver, ConnectionId};

/// A connection that can sit in a room.
#[async_trait]
pub trait HubMember: Send + Sync + 'static {
    type Message: Send + Sync + ?Sized;
    type Error: std::error::Error + Send + Sync + 'static;

    fn id(&self) -> ConnectionId;

    fn is_closed(&self) -> bool;

    /// Runs `observer` once when the connection closes, or right away if it
    /// already has.
    fn on_closed(&self, observer: CloseObserver);

    async fn deliver(&self, message: &Self::Message) -> Result<(), Self::Error>;
}

/// Outcome of one broadcast. Failures are counted, never raised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

impl std::ops::AddAssign for BroadcastReport {
    fn add_assign(&mut self, other: Self) {
        self.delivered += other.delivered;
        self.failed += other.failed;
    }
}

struct State<C> {
    rooms: HashMap<String, HashMap<ConnectionId, Arc<C>>>,
    memberships: HashMap<ConnectionId, HashSet<String>>,
    // Connections whose close callback is already registered.
    watched: HashSet<ConnectionId>,
}

impl<C> Default for State<C> {
    fn default() -> Self {
        Self {
            rooms: HashMap::new(),
            memberships: HashMap::new(),
            watched: HashSet::new(),
        }
    }
}

impl<C> State<C> {
    fn remove(&mut self, room: &str, id: &ConnectionId) -> bool {
        let Some(members) = self.rooms.get_mut(room) else {
            return false;
        };
        let removed = members.remove(id).is_some();
        if members.is_empty() {
            self.rooms.remove(room);
        }
        if let Some(joined) = self.memberships.get_mut(id) {
            joined.remove(room);
            if joined.is_empty() {
                self.memberships.remove(id);
            }
        }
        removed
    }
}

/// Rooms of connections of one kind.
pub struct Hub<C: HubMember> {
    state: Arc<RwLock<State<C>>>,
}

impl<C: HubMember> Clone for Hub<C> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<C: HubMember> Default for Hub<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: HubMember> std::fmt::Debug for Hub<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("rooms", &self.room_count())
            .finish()
    }
}

impl<C: HubMember> Hub<C> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
        }
    }

    /// Adds `connection` to `room`, creating the room if needed.
    ///
    /// Returns `false` if it was already a member or is already closed.
    pub fn join(&self, room: &str, connection: &Arc<C>) -> bool {
        if connection.is_closed() {
            return false;
        }
        let id = connection.id();

        let (joined, watch) = {
            let mut state = self.state.write();
            let joined = state
                .rooms
                .entry(room.to_owned())
                .or_default()
                .insert(id, Arc::clone(connection))
                .is_none();
            state
                .memberships
                .entry(id)
                .or_default()
                .insert(room.to_owned());
            (joined, state.watched.insert(id))
        };

        if watch {
            let state: Weak<RwLock<State<C>>> = Arc::downgrade(&self.state);
            connection.on_closed(Box::new(move |id| {
                if let Some(state) = state.upgrade() {
                    let mut state = state.write();
                    state.watched.remove(id);
                    let rooms: Vec<String> = state
                        .memberships
                        .get(id)
                        .map(|r| r.iter().cloned().collect())
                        .unwrap_or_default();
                    for room in rooms {
                        state.remove(&room, id);
                    }
                }
            }));
        }

        if joined {
            debug!(connection = %id, room, "joined room");
        }
        joined
    }

    /// Returns `false` if the connection was not in the room.
    pub fn leave(&self, room: &str, id: &ConnectionId) -> bool {
        let removed = self.state.write().remove(room, id);
        if removed {
            debug!(connection = %id, room, "left room");
        }
        removed
    }

    /// Removes the connection from every room; returns how many it left.
    pub fn leave_all(&self, id: &ConnectionId) -> usize {
        let mut state = self.state.write();
        let rooms: Vec<String> = state
            .memberships
            .get(id)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default();
        rooms.iter().filter(|room| state.remove(room, id)).count()
    }

    /// Sends to every member of `room` except `except`, one at a time.
    ///
    /// Members are snapshotted first, so joins and leaves during the
    /// broadcast do not affect it. A failed send is counted and skipped.
    pub async fn broadcast(
        &self,
        room: &str,
        message: &C::Message,
        except: Option<&ConnectionId>,
    ) -> BroadcastReport {
        let members: Vec<Arc<C>> = self
            .state
            .read()
            .rooms
            .get(room)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();

        let mut report = BroadcastReport::default();
        for member in members {
            let id = member.id();
            if except == Some(&id) {
                continue;
            }
            match member.deliver(message).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    debug!(connection = %id, room, error = %e, "broadcast delivery failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Broadcasts to each room in turn. A connection in several of the rooms
    /// receives the message once per room.
    pub async fn broadcast_many<I, S>(
        &self,
        rooms: I,
        message: &C::Message,
        except: Option<&ConnectionId>,
    ) -> BroadcastReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut report = BroadcastReport::default();
        for room in rooms {
            report += self.broadcast(room.as_ref(), message, except).await;
        }
        report
    }

    pub fn rooms(&self) -> Vec<String> {
        self.state.read().rooms.keys().cloned().collect()
    }

    pub fn rooms_of(&self, id: &ConnectionId) -> Vec<String> {
        self.state
            .read()
            .memberships
            .get(id)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn members(&self, room: &str) -> Vec<ConnectionId> {
        self.state
            .read()
            .rooms
            .get(room)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn contains_room(&self, room: &str) -> bool {
        self.state.read().rooms.contains_key(room)
    }

    pub fn is_member(&self, room: &str, id: &ConnectionId) -> bool {
        self.state
            .read()
            .rooms
            .get(room)
            .is_some_and(|m| m.contains_key(id))
    }

    pub fn room_count(&self) -> usize {
        self.state.read().rooms.len()
    }
}
