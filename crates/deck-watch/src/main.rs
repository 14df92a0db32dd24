//! Terminal watcher for a swarm-deck hub: keeps a sync connection alive
//! and logs the reconciled swarm state. Doubles as the reference consumer
//! of the deck-sync API. The hub-side scope filter (--team/--agent) is
//! re-issued on every transition into Open, so reconnects keep streaming
//! the same slice of the swarm.

use anyhow::{bail, Context};
use clap::Parser;
use deck_core::{Envelope, SubscribeScope};
use deck_sync::{attach_state, HubConnector, LinkStatus, SwarmState, SyncClient, SyncConfig};
use std::env;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "deck-watch")]
struct Args {
    /// Hub WebSocket URL; falls back to DECK_HUB_URL.
    #[arg(long, default_value = "")]
    hub_url: String,
    /// Restrict the stream to one team.
    #[arg(long, default_value = "")]
    team: String,
    /// Restrict the stream to one agent.
    #[arg(long, default_value = "")]
    agent: String,
    #[arg(long, default_value = "")]
    client_id: String,
    #[arg(long, default_value_t = 30)]
    heartbeat_interval: u64,
    #[arg(long, default_value_t = 10)]
    max_reconnect_attempts: u32,
    #[arg(long, default_value_t = 5)]
    reconnect_base_delay: u64,
    /// Seconds between state summaries.
    #[arg(long, default_value_t = 15)]
    summary_interval: u64,
    #[arg(long, default_value_t = 200)]
    event_cap: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging();

    let url = resolve_hub_url(&args.hub_url)?;
    let mut config = SyncConfig::new(url);
    config.client_id = resolve_client_id(&args.client_id);
    config.heartbeat_interval = Duration::from_secs(args.heartbeat_interval);
    config.max_reconnect_attempts = args.max_reconnect_attempts;
    config.reconnect_base_delay = Duration::from_secs(args.reconnect_base_delay);

    let client = Arc::new(SyncClient::new(config, Arc::new(HubConnector)));
    let state = Arc::new(Mutex::new(SwarmState::new(args.event_cap)));
    let _subscriptions = attach_state(client.router(), state.clone());

    // Each new session carries its own subscribe frame; a scope sent to a
    // previous socket does not survive a reconnect.
    let scope = resolve_scope(&args);
    let status_task = {
        let client = client.clone();
        let scope = scope.clone();
        tokio::spawn(observe_status(client.status(), move || {
            if let Some(scope) = &scope {
                client.send(&Envelope::subscribe_scope(scope));
            }
        }))
    };

    client.connect();
    wait_until_open(&client).await;

    let mut summary = tokio::time::interval(Duration::from_secs(args.summary_interval.max(1)));
    summary.tick().await;
    loop {
        tokio::select! {
            _ = summary.tick() => log_summary(&state),
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("shutting down");
    client.disconnect();
    let mut status = client.status();
    let _ = tokio::time::timeout(Duration::from_secs(2), async {
        while *status.borrow_and_update() != LinkStatus::Closed {
            if status.changed().await.is_err() {
                break;
            }
        }
    })
    .await;
    status_task.abort();
    Ok(())
}

fn init_logging() {
    let level = env::var("DECK_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn resolve_hub_url(flag_url: &str) -> anyhow::Result<Url> {
    if !flag_url.trim().is_empty() {
        return Url::parse(flag_url).context("invalid --hub-url");
    }
    if let Ok(value) = env::var("DECK_HUB_URL") {
        if !value.trim().is_empty() {
            return Url::parse(&value).context("invalid DECK_HUB_URL");
        }
    }
    bail!("no hub url: pass --hub-url or set DECK_HUB_URL");
}

fn resolve_client_id(flag: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.to_string());
    }
    Some(format!("deck-watch-{}", std::process::id()))
}

fn resolve_scope(args: &Args) -> Option<SubscribeScope> {
    let mut scope = SubscribeScope::default();
    if !args.team.trim().is_empty() {
        scope.team_id = Some(args.team.clone());
    }
    if !args.agent.trim().is_empty() {
        scope.agent_id = Some(args.agent.clone());
    }
    if scope.team_id.is_some() || scope.agent_id.is_some() {
        Some(scope)
    } else {
        None
    }
}

async fn wait_until_open(client: &SyncClient) {
    let mut status = client.status();
    loop {
        let current = *status.borrow_and_update();
        if current == LinkStatus::Open {
            return;
        }
        if current.is_terminal() {
            warn!(?current, "hub connection is not coming up");
            return;
        }
        if status.changed().await.is_err() {
            return;
        }
    }
}

/// Logs status transitions and fires `on_open` every time the link comes
/// up, first connect and reconnects alike.
async fn observe_status<F>(mut status: watch::Receiver<LinkStatus>, on_open: F)
where
    F: Fn(),
{
    loop {
        let current = *status.borrow_and_update();
        match current {
            LinkStatus::Open => {
                info!("link open");
                on_open();
            }
            LinkStatus::Retrying { attempt } => warn!(attempt, "link lost, retrying"),
            LinkStatus::Exhausted => warn!("reconnect attempts exhausted; restart to resume"),
            LinkStatus::AuthRejected => warn!("hub rejected this session; re-authenticate"),
            LinkStatus::Idle | LinkStatus::Connecting | LinkStatus::Closed => {}
        }
        if status.changed().await.is_err() {
            return;
        }
    }
}

fn log_summary(state: &Arc<Mutex<SwarmState>>) {
    let state = state.lock().unwrap_or_else(PoisonError::into_inner);
    let running = state
        .agents
        .iter()
        .filter(|agent| agent.status == deck_core::AgentStatus::Running)
        .count();
    info!(
        agents = state.agents.len(),
        running,
        teams = state.teams.len(),
        events = state.events.len(),
        cost_usd = state
            .latest_cost
            .as_ref()
            .map(|cost| cost.total_cost_usd)
            .unwrap_or(0.0),
        "swarm summary"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn scope_is_resent_on_every_open_transition() {
        let (status_tx, status_rx) = watch::channel(LinkStatus::Idle);
        let sends = Arc::new(AtomicUsize::new(0));
        let counter = sends.clone();
        let observer = tokio::spawn(observe_status(status_rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let settle = || tokio::time::sleep(Duration::from_millis(20));

        status_tx.send_replace(LinkStatus::Connecting);
        status_tx.send_replace(LinkStatus::Open);
        settle().await;
        assert_eq!(sends.load(Ordering::SeqCst), 1);

        // A reconnect cycle ends in another Open; the scope goes out again.
        status_tx.send_replace(LinkStatus::Retrying { attempt: 1 });
        settle().await;
        status_tx.send_replace(LinkStatus::Open);
        settle().await;
        assert_eq!(sends.load(Ordering::SeqCst), 2);

        observer.abort();
    }

    #[test]
    fn scope_is_none_without_team_or_agent_flags() {
        let args = Args::parse_from(["deck-watch"]);
        assert!(resolve_scope(&args).is_none());

        let args = Args::parse_from(["deck-watch", "--team", "t1"]);
        let scope = resolve_scope(&args).expect("scope");
        assert_eq!(scope.team_id.as_deref(), Some("t1"));
        assert!(scope.agent_id.is_none());
    }
}
