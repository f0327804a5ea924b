//! Room registry: membership bookkeeping and room-scoped fan-out.
//!
//! ```text
//!            join / leave / set_status
//!                      │ (write lock)
//!                      ▼
//! ┌──────────────────────────────────────┐     PresenceJob      ┌──────────────────────┐
//! │ rooms: room_id → { conn_id → handle }│ ───────────────────► │ presence broadcaster │
//! │ memberships: conn_id → room_id       │   (unbounded FIFO)   │ (one task, in order) │
//! └──────────────────┬───────────────────┘                      └──────────┬───────────┘
//!                    │ snapshot (read lock)                                │
//!                    ▼                                                     │
//!              broadcast(room, frame) ◄────────────────────────────────────┘
//!                    │ try_enqueue per member, lock released
//!                    ▼
//!        full queue → leave + close (slow consumer eviction)
//! ```
//!
//! No lock is held while enqueueing, and enqueueing never waits: a member
//! that cannot absorb a frame is dropped rather than stalling the room.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::connection::{ConnectionHandle, Frame};
use crate::error::HubError;
use crate::protocol::{Envelope, MemberInfo, UserStatus};

/// Statistics for monitoring hub health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub messages_broadcast: u64,
    pub frames_delivered: u64,
    pub evictions: u64,
    pub presence_broadcasts: u64,
    pub active_rooms: usize,
    pub active_connections: usize,
}

/// Counters updated on the broadcast path without taking the room lock.
#[derive(Default)]
struct AtomicRegistryStats {
    messages_broadcast: AtomicU64,
    frames_delivered: AtomicU64,
    evictions: AtomicU64,
    presence_broadcasts: AtomicU64,
}

enum PresenceJob {
    Broadcast(Arc<str>),
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct Rooms {
    /// Invariant: no entry maps to an empty member set.
    rooms: HashMap<Arc<str>, HashMap<Uuid, Arc<ConnectionHandle>>>,
    /// Invariant: a connection id appears here iff it is in exactly one
    /// member set, the one named by the value.
    memberships: HashMap<Uuid, Arc<str>>,
}

impl Rooms {
    fn remove_member(&mut self, room_id: &str, conn_id: &Uuid) {
        if let Some(members) = self.rooms.get_mut(room_id) {
            members.remove(conn_id);
            if members.is_empty() {
                self.rooms.remove(room_id);
                log::debug!("Room {room_id} removed (empty)");
            }
        }
    }
}

/// Shared hub mapping rooms to their member connections.
pub struct RoomRegistry {
    rooms: RwLock<Rooms>,
    presence_tx: mpsc::UnboundedSender<PresenceJob>,
    stats: AtomicRegistryStats,
}

impl RoomRegistry {
    /// Create a registry and start its presence broadcaster.
    ///
    /// Must be called from within a Tokio runtime. The broadcaster stops
    /// once the last `Arc` to the registry is dropped.
    pub fn new() -> Arc<Self> {
        let (presence_tx, presence_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            rooms: RwLock::new(Rooms::default()),
            presence_tx,
            stats: AtomicRegistryStats::default(),
        });
        tokio::spawn(run_presence_broadcaster(
            Arc::downgrade(&registry),
            presence_rx,
        ));
        registry
    }

    /// Add `handle` to the room named by its `room_id` and mark it online.
    ///
    /// A handle already joined elsewhere is moved: it leaves its previous
    /// room first. Closing handles are ignored. Presence broadcasts for the
    /// affected rooms are scheduled, not awaited.
    pub fn join(&self, handle: &Arc<ConnectionHandle>) {
        let room_id = handle.room_id();
        let previous = {
            let mut rooms = self.rooms.write();
            if !handle.mark_joined() {
                log::debug!(
                    "Ignoring join for closing connection {} ({})",
                    handle.id(),
                    handle.user_id()
                );
                return;
            }
            handle.set_status(UserStatus::Online);

            let previous = rooms.memberships.insert(handle.id(), room_id.clone());
            if let Some(prev) = previous.as_deref() {
                if prev != &*room_id {
                    rooms.remove_member(prev, &handle.id());
                }
            }
            rooms
                .rooms
                .entry(room_id.clone())
                .or_default()
                .insert(handle.id(), handle.clone());
            previous
        };

        match previous {
            Some(prev) if prev != room_id => {
                log::info!(
                    "Client userID={} moved from room={} to room={}",
                    handle.user_id(),
                    prev,
                    room_id
                );
                self.schedule_presence(prev);
            }
            _ => {
                log::info!(
                    "Client userID={} joined room={}",
                    handle.user_id(),
                    room_id
                );
            }
        }
        self.schedule_presence(room_id);
    }

    /// Remove `handle` from its room, deleting the room if it empties.
    ///
    /// Returns `false` (and does nothing else) when the handle is not a
    /// member, so repeated calls are harmless.
    pub fn leave(&self, handle: &ConnectionHandle) -> bool {
        let room_id = {
            let mut rooms = self.rooms.write();
            let Some(room_id) = rooms.memberships.remove(&handle.id()) else {
                return false;
            };
            rooms.remove_member(&room_id, &handle.id());
            handle.set_status(UserStatus::Offline);
            room_id
        };

        log::info!(
            "Client userID={} left room={}",
            handle.user_id(),
            room_id
        );
        self.schedule_presence(room_id);
        true
    }

    /// Move a handle to another room.
    pub fn switch_room(
        &self,
        handle: &Arc<ConnectionHandle>,
        room_id: impl AsRef<str>,
    ) -> Result<(), HubError> {
        let room_id = room_id.as_ref().trim();
        if room_id.is_empty() {
            return Err(HubError::MissingIdentifier("roomId"));
        }
        handle.set_room_id(Arc::from(room_id));
        self.join(handle);
        Ok(())
    }

    /// Record a presence status change and announce it to the room.
    ///
    /// Returns `false` if the handle is not currently a member.
    pub fn set_status(&self, handle: &ConnectionHandle, status: UserStatus) -> bool {
        let room_id = {
            let rooms = self.rooms.read();
            let Some(room_id) = rooms.memberships.get(&handle.id()) else {
                return false;
            };
            handle.set_status(status);
            room_id.clone()
        };
        log::debug!(
            "Client userID={} status={:?} in room={}",
            handle.user_id(),
            status,
            room_id
        );
        self.schedule_presence(room_id);
        true
    }

    /// Deliver `payload` to every current member of `room_id`.
    ///
    /// Members whose queue is full are evicted. Returns the number of
    /// members the payload was enqueued for; an unknown room yields 0.
    pub fn broadcast(&self, room_id: &str, payload: Frame) -> usize {
        let members: Vec<Arc<ConnectionHandle>> = {
            let rooms = self.rooms.read();
            match rooms.rooms.get(room_id) {
                Some(members) => members.values().cloned().collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for member in &members {
            match member.try_enqueue(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(HubError::QueueFull) => {
                    log::warn!(
                        "Send buffer full for client {}, disconnecting",
                        member.user_id()
                    );
                    self.evict(member);
                }
                Err(e) => {
                    log::debug!("Skipping client {} in room {room_id}: {e}", member.user_id());
                }
            }
        }

        self.stats.messages_broadcast.fetch_add(1, Ordering::Relaxed);
        self.stats
            .frames_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Build the room's presence snapshot and broadcast it.
    ///
    /// A room that no longer exists is a silent no-op. Returns the number
    /// of members reached.
    pub fn broadcast_presence(&self, room_id: &str) -> usize {
        let Some(members) = self.snapshot(room_id) else {
            return 0;
        };
        let payload = match Envelope::presence(members).encode() {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("Failed to encode presence update for room {room_id}: {e}");
                return 0;
            }
        };
        self.stats.presence_broadcasts.fetch_add(1, Ordering::Relaxed);
        self.broadcast(room_id, Arc::new(payload))
    }

    /// Current roster of a room, ordered by user id.
    pub fn snapshot(&self, room_id: &str) -> Option<Vec<MemberInfo>> {
        let rooms = self.rooms.read();
        let members = rooms.rooms.get(room_id)?;
        let mut snapshot: Vec<MemberInfo> = members.values().map(|h| h.member_info()).collect();
        snapshot.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.username.cmp(&b.username)));
        Some(snapshot)
    }

    /// Resolves once every presence broadcast scheduled before this call
    /// has been delivered to member queues.
    pub async fn flush_presence(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.presence_tx.send(PresenceJob::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    fn evict(&self, member: &ConnectionHandle) {
        self.leave(member);
        member.close();
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
    }

    fn schedule_presence(&self, room_id: Arc<str>) {
        if self.presence_tx.send(PresenceJob::Broadcast(room_id)).is_err() {
            log::debug!("Presence broadcaster stopped; update dropped");
        }
    }

    pub fn is_member(&self, handle: &ConnectionHandle) -> bool {
        self.rooms.read().memberships.contains_key(&handle.id())
    }

    /// Room the handle is currently a member of.
    pub fn room_of(&self, handle: &ConnectionHandle) -> Option<Arc<str>> {
        self.rooms.read().memberships.get(&handle.id()).cloned()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().rooms.len()
    }

    pub fn member_count(&self, room_id: &str) -> usize {
        self.rooms
            .read()
            .rooms
            .get(room_id)
            .map_or(0, HashMap::len)
    }

    /// All room ids with at least one member.
    pub fn rooms(&self) -> Vec<String> {
        self.rooms
            .read()
            .rooms
            .keys()
            .map(|k| k.to_string())
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let (active_rooms, active_connections) = {
            let rooms = self.rooms.read();
            (rooms.rooms.len(), rooms.memberships.len())
        };
        RegistryStats {
            messages_broadcast: self.stats.messages_broadcast.load(Ordering::Relaxed),
            frames_delivered: self.stats.frames_delivered.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            presence_broadcasts: self.stats.presence_broadcasts.load(Ordering::Relaxed),
            active_rooms,
            active_connections,
        }
    }
}

/// Processes presence requests one at a time, in the order they were made.
/// Each snapshot is taken when the request is processed, so it is never
/// older than the mutation that triggered it.
async fn run_presence_broadcaster(
    registry: Weak<RoomRegistry>,
    mut jobs: mpsc::UnboundedReceiver<PresenceJob>,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            PresenceJob::Broadcast(room_id) => {
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.broadcast_presence(&room_id);
            }
            PresenceJob::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    log::debug!("Presence broadcaster exiting");
}
