use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;

/// Runtime status of a single agent as reported by the hub. Statuses this
/// client does not know yet deserialize as `Unknown` instead of failing.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Running,
    Paused,
    Error,
    Offline,
    Unknown,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Running => "running",
            AgentStatus::Paused => "paused",
            AgentStatus::Error => "error",
            AgentStatus::Offline => "offline",
            AgentStatus::Unknown => "unknown",
        }
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "idle" => Ok(AgentStatus::Idle),
            "running" => Ok(AgentStatus::Running),
            "paused" => Ok(AgentStatus::Paused),
            "error" => Ok(AgentStatus::Error),
            "offline" => Ok(AgentStatus::Offline),
            other => Err(format!("Unknown agent status: {other}")),
        }
    }
}

impl<'de> Deserialize<'de> for AgentStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(value.parse().unwrap_or(AgentStatus::Unknown))
    }
}

/// Lifecycle status shared by teams and other grouped entities.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Active,
    Completed,
    Failed,
    Archived,
    Unknown,
}

impl Default for EntityStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

impl FromStr for EntityStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "active" => Ok(EntityStatus::Active),
            "completed" => Ok(EntityStatus::Completed),
            "failed" => Ok(EntityStatus::Failed),
            "archived" => Ok(EntityStatus::Archived),
            other => Err(format!("Unknown team status: {other}")),
        }
    }
}

impl<'de> Deserialize<'de> for EntityStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(value.parse().unwrap_or(EntityStatus::Unknown))
    }
}

/// Full snapshot of one agent. The hub always emits complete records;
/// clients replace, never merge (a partial payload would clobber fields).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub current_task: Option<String>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

/// Full snapshot of one team/swarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: EntityStatus,
    #[serde(default)]
    pub agent_ids: Vec<String>,
    #[serde(default)]
    pub objective: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

/// One entry of the event stream. Events are display data, not a delivery
/// log: the client keeps a bounded, arrival-ordered window of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

/// Latest cost/budget snapshot. Unconditionally replaced on every
/// budget update; history is a chart concern, not a sync concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostMetrics {
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub budget_limit_usd: Option<f64>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}
