use crate::entity::{Agent, AgentEvent, CostMetrics, Team};
use crate::AUTH_ERROR_CODES;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Reserved subscription key that matches every message kind in addition
/// to, not instead of, the kind-specific handlers.
pub const WILDCARD_KIND: &str = "*";

/// One JSON object per WebSocket frame, discriminated by `type`. At most
/// one typed entity rides along; everything else goes through `payload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    #[serde(default, rename = "clientId", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<AgentEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<Agent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<Team>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<CostMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Message kinds the sync layer itself understands. Anything else is
/// still routable by its raw `type` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Heartbeat,
    Subscribe,
    Unsubscribe,
    Event,
    AgentUpdate,
    TeamUpdate,
    BudgetUpdate,
    Error,
    Connected,
    Disconnected,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Subscribe => "subscribe",
            MessageKind::Unsubscribe => "unsubscribe",
            MessageKind::Event => "event",
            MessageKind::AgentUpdate => "agent_update",
            MessageKind::TeamUpdate => "team_update",
            MessageKind::BudgetUpdate => "budget_update",
            MessageKind::Error => "error",
            MessageKind::Connected => "connected",
            MessageKind::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "heartbeat" => Ok(MessageKind::Heartbeat),
            "subscribe" => Ok(MessageKind::Subscribe),
            "unsubscribe" => Ok(MessageKind::Unsubscribe),
            "event" => Ok(MessageKind::Event),
            "agent_update" => Ok(MessageKind::AgentUpdate),
            "team_update" => Ok(MessageKind::TeamUpdate),
            "budget_update" => Ok(MessageKind::BudgetUpdate),
            "error" => Ok(MessageKind::Error),
            "connected" => Ok(MessageKind::Connected),
            "disconnected" => Ok(MessageKind::Disconnected),
            other => Err(format!("Unknown message kind: {other}")),
        }
    }
}

/// Optional scope filter for subscribe/unsubscribe control frames.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeScope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

impl SubscribeScope {
    pub fn team(id: impl Into<String>) -> Self {
        Self {
            team_id: Some(id.into()),
            agent_id: None,
        }
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            team_id: None,
            agent_id: Some(id.into()),
        }
    }
}

impl Envelope {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            r#type: kind.as_str().to_string(),
            timestamp: Some(Utc::now().timestamp_millis() as f64),
            client_id: None,
            payload: None,
            event: None,
            agent: None,
            team: None,
            budget: None,
            error: None,
        }
    }

    /// Parsed kind, if the `type` string is one the core understands.
    pub fn kind(&self) -> Option<MessageKind> {
        self.r#type.parse().ok()
    }

    /// Outbound liveness frame.
    pub fn heartbeat(client_id: Option<&str>) -> Self {
        let mut envelope = Self::new(MessageKind::Heartbeat);
        envelope.client_id = client_id.map(str::to_string);
        envelope
    }

    /// Fire-and-forget scope subscription. Acks, if the hub sends any,
    /// arrive as ordinary inbound messages.
    pub fn subscribe_scope(scope: &SubscribeScope) -> Self {
        let mut envelope = Self::new(MessageKind::Subscribe);
        envelope.payload = serde_json::to_value(scope).ok();
        envelope
    }

    pub fn unsubscribe_scope(scope: &SubscribeScope) -> Self {
        let mut envelope = Self::new(MessageKind::Unsubscribe);
        envelope.payload = serde_json::to_value(scope).ok();
        envelope
    }

    /// True for `type: "error"` frames whose code means the session is no
    /// longer authorized. These are terminal, equivalent to a 1008 close.
    pub fn is_auth_error(&self) -> bool {
        if self.kind() != Some(MessageKind::Error) {
            return false;
        }
        if let Some(error) = self.error.as_deref() {
            if AUTH_ERROR_CODES.contains(&error) {
                return true;
            }
        }
        self.payload
            .as_ref()
            .and_then(|payload| payload.get("code"))
            .and_then(Value::as_str)
            .map(|code| AUTH_ERROR_CODES.contains(&code))
            .unwrap_or(false)
    }
}
