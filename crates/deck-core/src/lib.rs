//! Wire contracts shared by the swarm-deck sync layer and its consumers.
//!
//! The hub speaks a JSON envelope protocol, one object per WebSocket frame,
//! discriminated by a `type` string. Entity payloads are tolerant of unknown
//! fields so a newer hub never breaks an older client.

mod entity;
mod envelope;

pub use entity::{Agent, AgentEvent, AgentStatus, CostMetrics, EntityStatus, Team};
pub use envelope::{Envelope, MessageKind, SubscribeScope, WILDCARD_KIND};

/// Normal closure, sent by the client on an intentional disconnect.
pub const CLOSE_NORMAL: u16 = 1000;

/// Policy-violation closure; the hub uses it to reject an unauthorized
/// session. Terminal for the client, never retried.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Error codes carried by `type: "error"` envelopes that mean the session
/// is no longer authorized. Matched against the payload `code` field and
/// the top-level `error` string.
pub const AUTH_ERROR_CODES: [&str; 2] = ["unauthorized", "auth_failed"];
