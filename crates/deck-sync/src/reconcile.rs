//! Merging streamed updates into the local collections the UI reads.
//!
//! The ops are deliberately simple: upsert-by-id with full replacement for
//! agents and teams (the hub always sends complete snapshots), a bounded
//! newest-first window for events, and a single latest cost snapshot.
//! Linear scans are fine at dashboard scale (hundreds of entities); this
//! is not built for high cardinality.

use crate::router::{MessageRouter, Subscription};
use deck_core::{Agent, AgentEvent, CostMetrics, Envelope, MessageKind, Team};
use std::sync::{Arc, Mutex, PoisonError};

/// Default cap for the event window kept in [`SwarmState`].
pub const DEFAULT_EVENT_CAP: usize = 200;

/// Replace-in-place by id, else append. Full replace: a stale or partial
/// record from the hub overwrites every field.
pub fn upsert_agent(agents: &mut Vec<Agent>, incoming: Agent) {
    match agents.iter_mut().find(|agent| agent.id == incoming.id) {
        Some(slot) => *slot = incoming,
        None => agents.push(incoming),
    }
}

pub fn upsert_team(teams: &mut Vec<Team>, incoming: Team) {
    match teams.iter_mut().find(|team| team.id == incoming.id) {
        Some(slot) => *slot = incoming,
        None => teams.push(incoming),
    }
}

/// Front-insert then truncate. Newest-first, arrival order, no dedup;
/// events past `cap` are silently dropped (this is a display window, not
/// a delivery log).
pub fn prepend_event(events: &mut Vec<AgentEvent>, event: AgentEvent, cap: usize) {
    events.insert(0, event);
    events.truncate(cap);
}

/// Unconditional overwrite. History, if anyone wants it, accumulates
/// outside the sync layer.
pub fn replace_cost_snapshot(slot: &mut Option<CostMetrics>, snapshot: CostMetrics) {
    *slot = Some(snapshot);
}

/// The reconciled collections for one hub connection.
#[derive(Debug, Clone)]
pub struct SwarmState {
    pub agents: Vec<Agent>,
    pub teams: Vec<Team>,
    pub events: Vec<AgentEvent>,
    pub latest_cost: Option<CostMetrics>,
    pub event_cap: usize,
}

impl Default for SwarmState {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAP)
    }
}

impl SwarmState {
    pub fn new(event_cap: usize) -> Self {
        Self {
            agents: Vec::new(),
            teams: Vec::new(),
            events: Vec::new(),
            latest_cost: None,
            event_cap,
        }
    }

    /// Applies one inbound envelope to the collections. Messages of other
    /// kinds, or entity messages missing their entity, are ignored.
    pub fn apply(&mut self, message: &Envelope) {
        match message.kind() {
            Some(MessageKind::AgentUpdate) => {
                if let Some(agent) = &message.agent {
                    upsert_agent(&mut self.agents, agent.clone());
                }
            }
            Some(MessageKind::TeamUpdate) => {
                if let Some(team) = &message.team {
                    upsert_team(&mut self.teams, team.clone());
                }
            }
            Some(MessageKind::Event) => {
                if let Some(event) = &message.event {
                    prepend_event(&mut self.events, event.clone(), self.event_cap);
                }
            }
            Some(MessageKind::BudgetUpdate) => {
                if let Some(budget) = &message.budget {
                    replace_cost_snapshot(&mut self.latest_cost, budget.clone());
                }
            }
            _ => {}
        }
    }
}

/// Wires the four standard entity handlers onto `router`, feeding
/// `state`. Returns the subscriptions so a host can detach again.
pub fn attach_state(
    router: &MessageRouter,
    state: Arc<Mutex<SwarmState>>,
) -> Vec<Subscription> {
    [
        MessageKind::AgentUpdate,
        MessageKind::TeamUpdate,
        MessageKind::Event,
        MessageKind::BudgetUpdate,
    ]
    .iter()
    .map(|kind| {
        let state = state.clone();
        router.subscribe_fn(kind.as_str(), move |message| {
            state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .apply(message);
        })
    })
    .collect()
}
