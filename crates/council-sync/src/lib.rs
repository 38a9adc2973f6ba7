//! Real-time synchronization for council session clients.
//!
//! Channel clients keep one STOMP subscription per purpose alive across
//! drops and hidden periods, queue publishes while offline, and feed tally
//! snapshots into a [`VoteBoard`] that always converges on the server's
//! latest broadcast. [`SessionView`] wires all of it to a REST backend.

pub mod backend;
pub mod channel;
pub mod config;
pub mod lifecycle;
pub mod message;
pub mod model;
pub mod reconcile;
pub mod view;

pub use backend::{BackendCall, BackendError, CouncilBackend, HttpBackend, InMemoryBackend};
pub use channel::{
    ChannelClient, ChannelError, ChannelPurpose, ChannelSpec, ConnectionState, MessageStream,
    ReconnectPolicy, SendOutcome, Visibility, VisibilitySignal,
};
pub use config::SyncConfig;
pub use lifecycle::{LifecycleError, Transition};
pub use message::{ChannelMessage, Notice};
pub use model::{
    Amendment, EntityId, EntityKey, EntityKind, EntityStatus, SessionId, Tally, TallySnapshot,
    Topic, VoteType,
};
pub use reconcile::{Reconciled, VoteBoard, VoteDecision};
pub use view::{SessionView, ViewError, ViewEvent, VoteOutcome};
