//! # ClassCast Signaling
//!
//! Session registry, participant connection lifecycle, floor control and the
//! WebSocket signaling relay for ClassCast live classes.
//!
//! The [`SessionRegistry`] is the single owner of session and connection
//! state. The [`SignalingRelay`] routes inbound messages to it, and the
//! [`SignalingServer`] carries those messages over WebSockets.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod discovery;
pub mod floor;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;

// Re-export main types
pub use connection::{ConnectionEvent, ConnectionState, ParticipantConnection, Transition};
pub use discovery::{RosterEntry, RosterSnapshot, SessionDirectory};
pub use floor::{FloorController, FloorEvent, FloorRevokeReason};
pub use hub::{Delivery, DeliveryHub, DeliveryStats, DropReason, Outlet};
pub use protocol::{
    ClientMessage, Directive, Envelope, LeaveReason, MessageKind, Notice, PeerSummary,
    ServerEnvelope, ServerMessage, Target,
};
pub use registry::{QualityOutcome, RegistryStats, SessionRegistry, SweepReport};
pub use relay::{DiscardReason, RelayOutcome, SignalingRelay};
pub use server::SignalingServer;
pub use session::{Session, SessionState};
