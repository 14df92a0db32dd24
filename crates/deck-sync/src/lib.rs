//! Real-time synchronization layer for the swarm-deck dashboard.
//!
//! One [`SyncClient`] per process keeps a WebSocket connection to the
//! orchestration hub alive (reconnection with capped backoff, heartbeat
//! liveness, terminal handling of authorization failures), fans inbound
//! envelopes out through a [`MessageRouter`], and [`reconcile`] merges
//! entity updates into the collections a UI reads.

pub mod client;
pub mod reconcile;
pub mod router;
pub mod transport;

pub use client::{
    reconnect_delay, AuthRejectedHook, LinkStatus, SyncClient, SyncConfig,
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_BASE_DELAY,
};
pub use reconcile::{
    attach_state, prepend_event, replace_cost_snapshot, upsert_agent, upsert_team, SwarmState,
    DEFAULT_EVENT_CAP,
};
pub use router::{MessageHandler, MessageRouter, Subscription};
pub use transport::{CloseReason, Connector, HubConnector, Socket, SocketEvent, TransportError};
