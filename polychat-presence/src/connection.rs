//! Per-connection state shared between the registry and the two loops.
//!
//! ```text
//!            RoomRegistry::broadcast
//!                    │ try_enqueue (never blocks)
//!                    ▼
//! ConnectionHandle ──[ bounded queue ]──► Outbound ──► send loop ──► wire
//!        │
//!        └── state: Connecting → Joined → Closing → Closed
//! ```
//!
//! The registry holds the handle only while it is a member of a room.
//! The outbound receiver is owned by the send loop alone.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::error::HubError;
use crate::protocol::{MemberInfo, UserStatus, RECORD_DELIMITER};

/// An encoded message waiting in an outbound queue. Shared between all
/// recipients of one broadcast.
pub type Frame = Arc<Vec<u8>>;

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    /// Created, not yet a room member
    Connecting = 0,
    /// Member of a room, loops running
    Joined = 1,
    /// A terminal condition was observed; loops are winding down
    Closing = 2,
    /// Loops exited and membership released
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Joined,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// One participant's live session.
pub struct ConnectionHandle {
    id: Uuid,
    user_id: String,
    display_name: String,
    room_id: RwLock<Arc<str>>,
    status: AtomicU8,
    state: AtomicU8,
    /// `None` once the queue has been closed.
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    closed: Notify,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end of its outbound queue.
    ///
    /// Both identifiers are trimmed and must be non-empty.
    pub fn new(
        room_id: impl AsRef<str>,
        user_id: impl AsRef<str>,
        capacity: usize,
    ) -> Result<(Self, Outbound), HubError> {
        let room_id = room_id.as_ref().trim();
        let user_id = user_id.as_ref().trim();
        if room_id.is_empty() {
            return Err(HubError::MissingIdentifier("roomId"));
        }
        if user_id.is_empty() {
            return Err(HubError::MissingIdentifier("userId"));
        }

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            display_name: user_id.to_string(),
            room_id: RwLock::new(Arc::from(room_id)),
            status: AtomicU8::new(UserStatus::Offline.as_u8()),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            outbound: Mutex::new(Some(tx)),
            closed: Notify::new(),
        };
        Ok((handle, Outbound { rx }))
    }

    /// Override the display name shown in presence snapshots.
    pub fn with_display_name(mut self, name: impl AsRef<str>) -> Self {
        let name = name.as_ref().trim();
        if !name.is_empty() {
            self.display_name = name.to_string();
        }
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Room this handle belongs to (or will join).
    pub fn room_id(&self) -> Arc<str> {
        self.room_id.read().clone()
    }

    pub(crate) fn set_room_id(&self, room_id: Arc<str>) {
        *self.room_id.write() = room_id;
    }

    pub fn status(&self) -> UserStatus {
        UserStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: UserStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
    }

    pub fn member_info(&self) -> MemberInfo {
        MemberInfo::new(self.user_id.clone(), self.display_name.clone(), self.status())
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether a terminal condition has been observed.
    pub fn is_closing(&self) -> bool {
        self.state() >= ConnectionState::Closing
    }

    /// Connecting → Joined. Fails once the handle is closing.
    pub(crate) fn mark_joined(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= ConnectionState::Closing as u8 {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                ConnectionState::Joined as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Both loops are gone.
    pub(crate) fn mark_closed(&self) {
        self.close();
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
    }

    /// Enqueue without waiting.
    pub fn try_enqueue(&self, frame: Frame) -> Result<(), HubError> {
        let guard = self.outbound.lock();
        let tx = guard.as_ref().ok_or(HubError::QueueClosed)?;
        tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => HubError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => HubError::QueueClosed,
        })
    }

    /// Close the outbound queue and wake both loops.
    ///
    /// Returns `true` for the call that performed the transition; later
    /// calls are no-ops.
    pub fn close(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= ConnectionState::Closing as u8 {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        self.outbound.lock().take();
        self.closed.notify_waiters();
        true
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let notified = self.closed.notified();
        if self.is_closing() {
            return;
        }
        notified.await;
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("room_id", &self.room_id())
            .field("status", &self.status())
            .field("state", &self.state())
            .finish()
    }
}

/// Receiving end of a connection's outbound queue.
pub struct Outbound {
    rx: mpsc::Receiver<Frame>,
}

impl Outbound {
    /// Wait for the next frame. `None` once the queue is closed and empty.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    /// Frames currently buffered.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Join `first` with every frame already queued at this instant.
    ///
    /// Frames arriving while draining are left for the next batch.
    pub fn collect_batch(&mut self, first: Frame) -> Vec<u8> {
        let pending = self.rx.len();
        let mut batch = Vec::with_capacity(first.len() * (pending + 1));
        batch.extend_from_slice(&first);

        for _ in 0..pending {
            match self.rx.try_recv() {
                Ok(frame) => {
                    batch.push(RECORD_DELIMITER);
                    batch.extend_from_slice(&frame);
                }
                Err(_) => break,
            }
        }
        batch
    }
}
