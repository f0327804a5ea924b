//! # polychat-presence
//!
//! Room presence and broadcast hub for chat clients.
//!
//! Clients connect over WebSocket, join exactly one room, and everything a
//! member sends is fanned out to every member of that room. Whenever a
//! room's membership changes, all remaining members receive the current
//! roster as a presence update.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  frames   ┌──────────────┐  broadcast  ┌──────────────┐
//! │ Client A │ ────────► │ receive loop │ ──────────► │ RoomRegistry │
//! └──────────┘           └──────────────┘             │ room → members│
//!      ▲                                              └──────┬───────┘
//!      │                 ┌──────────────┐   try_enqueue      │
//!      └──────────────── │  send loop   │ ◄──────────────────┘
//!         batch + ping   │ (per client) │   bounded queue; full = evicted
//!                        └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`] : Tunables and environment overrides
//! - [`protocol`] : Presence envelope and inbound normalization
//! - [`connection`] : Per-connection handle and outbound queue
//! - [`registry`] : Room membership, fan-out, presence
//! - [`session`] : Receive/send loops with heartbeat
//! - [`server`] : WebSocket handshake and accept loop

pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use config::HubConfig;
pub use connection::{ConnectionHandle, ConnectionState, Frame, Outbound};
pub use error::HubError;
pub use protocol::{Envelope, MemberInfo, UserStatus, RECORD_DELIMITER};
pub use registry::{RegistryStats, RoomRegistry};
pub use server::{ConnectParams, PresenceServer, ServerStats};
