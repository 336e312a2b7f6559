//! Per-game cooperative worker ("hub") pattern (spec.md §4.7, C7).
//!
//! Every game gets exactly one `Hub` task owning a bounded mpsc channel;
//! all reads, writes, and broadcasts for that game serialize through it
//! so there's never a write-write race on one game's action log. A
//! `HubManager` lazily spins up hubs on first touch and reaps idle ones,
//! the same per-resource-worker shape the teacher's load generator used
//! for per-scenario workers, just keyed by game id instead of scenario
//! name.

use crate::entities::{game_access_level, AccessLevel, ActionRecord, Game};
use crate::errors::HubError;
use crate::fsm::RaftCommand;
use crate::raft_manager::RaftManager;
use crate::registry::Registry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

const HUB_CHANNEL_CAPACITY: usize = 256;
const BROADCAST_CAPACITY: usize = 64;
/// Grace period after a hub drops to zero broadcast subscribers before
/// it's eligible for reaping — avoids tearing down a hub between one
/// WebSocket client disconnecting and the next one joining.
const HUB_REAP_GRACE: Duration = Duration::from_secs(30);

/// A single request sent to a hub's worker task.
pub enum HubRequest {
    /// A WebSocket client announcing itself; the reply is a broadcast
    /// receiver the caller forwards frames from.
    WsJoin {
        user_id: Option<String>,
        reply: oneshot::Sender<Result<broadcast::Receiver<BroadcastFrame>, HubError>>,
    },
    HttpLoad {
        user_id: Option<String>,
        reply: oneshot::Sender<Result<Arc<Game>, HubError>>,
    },
    HttpAction {
        user_id: Option<String>,
        base_revision: u64,
        actions: Vec<ActionRecord>,
        reply: oneshot::Sender<Result<Arc<Game>, HubError>>,
    },
    HttpSave {
        user_id: Option<String>,
        game: Game,
        reply: oneshot::Sender<Result<Arc<Game>, HubError>>,
    },
}

#[derive(Debug, Clone)]
pub struct BroadcastFrame {
    pub game_id: String,
    pub revision: u64,
    /// Empty when the broadcast is a bare "reload" signal rather than a
    /// diff (Design Note: broadcast payload defaults to appended
    /// actions, or zero actions for a forced reload).
    pub appended_actions: Vec<ActionRecord>,
}

/// True when `actions` is exactly the trailing slice of `game`'s action
/// log already on disk, matched by id in order — i.e. this append was
/// already applied and the caller is retrying after losing the
/// response, not proposing a genuine conflicting change.
fn actions_already_applied(game: &Game, actions: &[ActionRecord]) -> bool {
    if actions.is_empty() {
        return false;
    }
    let log = &game.action_log;
    if log.len() < actions.len() {
        return false;
    }
    let tail = &log[log.len() - actions.len()..];
    tail.iter().zip(actions.iter()).all(|(a, b)| a.id == b.id)
}

struct HubState {
    sender: mpsc::Sender<HubRequest>,
    last_activity: Mutex<Instant>,
    broadcast_tx: broadcast::Sender<BroadcastFrame>,
}

/// One game's serialized request queue plus its broadcast fan-out.
pub struct Hub {
    game_id: String,
    inbox: mpsc::Receiver<HubRequest>,
    broadcast_tx: broadcast::Sender<BroadcastFrame>,
    registry: Arc<Registry>,
    raft: Arc<RaftManager>,
}

impl Hub {
    fn spawn(
        game_id: String,
        registry: Arc<Registry>,
        raft: Arc<RaftManager>,
    ) -> (mpsc::Sender<HubRequest>, broadcast::Sender<BroadcastFrame>) {
        let (tx, rx) = mpsc::channel(HUB_CHANNEL_CAPACITY);
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let hub = Hub {
            game_id,
            inbox: rx,
            broadcast_tx: broadcast_tx.clone(),
            registry,
            raft,
        };
        tokio::spawn(hub.run());
        (tx, broadcast_tx)
    }

    async fn run(mut self) {
        while let Some(req) = self.inbox.recv().await {
            self.handle(req).await;
        }
        debug!(game_id = %self.game_id, "hub worker exiting");
    }

    async fn check_access(
        &self,
        user_id: Option<&str>,
        required: AccessLevel,
    ) -> Result<Arc<Game>, HubError> {
        let game = self
            .registry
            .games_store()
            .load(&self.game_id)
            .await
            .map_err(|e| HubError::Fsm(e.into()))?
            .ok_or_else(|| HubError::Forbidden("game not found".into()))?;

        let level = self
            .registry
            .access_level(&self.game_id, user_id)
            .await
            .map_err(|e| HubError::Fsm(e.into()))?;
        if level < required {
            return Err(HubError::Forbidden("insufficient access".into()));
        }
        let _ = game_access_level(&game, user_id, |_| None);
        Ok(game)
    }

    async fn handle(&mut self, req: HubRequest) {
        match req {
            HubRequest::WsJoin { user_id, reply } => {
                let result = self
                    .check_access(user_id.as_deref(), AccessLevel::Read)
                    .await
                    .map(|_| self.broadcast_tx.subscribe());
                let _ = reply.send(result);
            }
            HubRequest::HttpLoad { user_id, reply } => {
                let result = self.check_access(user_id.as_deref(), AccessLevel::Read).await;
                let _ = reply.send(result);
            }
            HubRequest::HttpAction {
                user_id,
                base_revision,
                actions,
                reply,
            } => {
                let game = match self.check_access(user_id.as_deref(), AccessLevel::Write).await {
                    Ok(g) => g,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };
                // A retried request whose actions already landed (the
                // caller resent after a dropped response, say) is a
                // safe no-op: don't bother Raft with a proposal that
                // would conflict on `base_revision` for no reason.
                if actions_already_applied(&game, &actions) {
                    let _ = reply.send(Ok(game));
                    return;
                }
                if !self.raft.is_leader() {
                    let _ = reply.send(Err(HubError::NotLeader));
                    return;
                }
                let cmd = RaftCommand::AppendActions {
                    game_id: self.game_id.clone(),
                    base_revision,
                    actions: actions.clone(),
                };
                match self.raft.propose(cmd).await {
                    Ok(resp) if resp.ok => {
                        let revision = resp.revision.unwrap_or(base_revision + 1);
                        let frame = BroadcastFrame {
                            game_id: self.game_id.clone(),
                            revision,
                            appended_actions: actions,
                        };
                        if self.broadcast_tx.send(frame).is_err() {
                            crate::metrics_http::BROADCAST_DROPPED_TOTAL.inc();
                        }
                        match self.registry.games_store().load(&self.game_id).await {
                            Ok(Some(game)) => {
                                let _ = reply.send(Ok(game));
                            }
                            _ => {
                                let _ = reply.send(Err(HubError::MalformedAction(
                                    "game disappeared after append".into(),
                                )));
                            }
                        }
                    }
                    Ok(resp) => {
                        let _ = reply.send(Err(HubError::MalformedAction(resp.message)));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(HubError::Fsm(crate::errors::FsmError::Decode(
                            e.to_string(),
                        ))));
                    }
                }
            }
            HubRequest::HttpSave { user_id, game, reply } => {
                let access = self.check_access(user_id.as_deref(), AccessLevel::Write).await;
                if let Err(e) = access {
                    let _ = reply.send(Err(e));
                    return;
                }
                if !self.raft.is_leader() {
                    let _ = reply.send(Err(HubError::NotLeader));
                    return;
                }
                match self.raft.propose(RaftCommand::SaveGame { game }).await {
                    Ok(resp) if resp.ok => {
                        let frame = BroadcastFrame {
                            game_id: self.game_id.clone(),
                            revision: resp.revision.unwrap_or(0),
                            appended_actions: Vec::new(),
                        };
                        let _ = self.broadcast_tx.send(frame);
                        match self.registry.games_store().load(&self.game_id).await {
                            Ok(Some(game)) => {
                                let _ = reply.send(Ok(game));
                            }
                            _ => {
                                let _ = reply.send(Err(HubError::MalformedAction(
                                    "game disappeared after save".into(),
                                )));
                            }
                        }
                    }
                    Ok(resp) => {
                        let _ = reply.send(Err(HubError::MalformedAction(resp.message)));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(HubError::Fsm(crate::errors::FsmError::Decode(
                            e.to_string(),
                        ))));
                    }
                }
            }
        }
    }
}

/// Lazily creates and reaps per-game hubs.
pub struct HubManager {
    hubs: RwLock<HashMap<String, Arc<HubState>>>,
    registry: Arc<Registry>,
    raft: Arc<RaftManager>,
}

impl HubManager {
    pub fn new(registry: Arc<Registry>, raft: Arc<RaftManager>) -> Arc<Self> {
        Arc::new(Self {
            hubs: RwLock::new(HashMap::new()),
            registry,
            raft,
        })
    }

    async fn sender_for(&self, game_id: &str) -> mpsc::Sender<HubRequest> {
        if let Some(state) = self.hubs.read().await.get(game_id) {
            *state.last_activity.lock().await = Instant::now();
            return state.sender.clone();
        }
        let mut hubs = self.hubs.write().await;
        if let Some(state) = hubs.get(game_id) {
            return state.sender.clone();
        }
        let (sender, broadcast_tx) =
            Hub::spawn(game_id.to_string(), self.registry.clone(), self.raft.clone());
        hubs.insert(
            game_id.to_string(),
            Arc::new(HubState {
                sender: sender.clone(),
                last_activity: Mutex::new(Instant::now()),
                broadcast_tx,
            }),
        );
        sender
    }

    pub async fn ws_join(
        &self,
        game_id: &str,
        user_id: Option<String>,
    ) -> Result<broadcast::Receiver<BroadcastFrame>, HubError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender_for(game_id)
            .await
            .send(HubRequest::WsJoin {
                user_id,
                reply: reply_tx,
            })
            .await
            .map_err(|_| HubError::Busy)?;
        reply_rx.await.map_err(|_| HubError::Busy)?
    }

    pub async fn load(&self, game_id: &str, user_id: Option<String>) -> Result<Arc<Game>, HubError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender_for(game_id)
            .await
            .send(HubRequest::HttpLoad {
                user_id,
                reply: reply_tx,
            })
            .await
            .map_err(|_| HubError::Busy)?;
        reply_rx.await.map_err(|_| HubError::Busy)?
    }

    pub async fn append_actions(
        &self,
        game_id: &str,
        user_id: Option<String>,
        base_revision: u64,
        actions: Vec<ActionRecord>,
    ) -> Result<Arc<Game>, HubError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender_for(game_id)
            .await
            .send(HubRequest::HttpAction {
                user_id,
                base_revision,
                actions,
                reply: reply_tx,
            })
            .await
            .map_err(|_| HubError::Busy)?;
        reply_rx.await.map_err(|_| HubError::Busy)?
    }

    pub async fn save(
        &self,
        game_id: &str,
        user_id: Option<String>,
        game: Game,
    ) -> Result<Arc<Game>, HubError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender_for(game_id)
            .await
            .send(HubRequest::HttpSave {
                user_id,
                game,
                reply: reply_tx,
            })
            .await
            .map_err(|_| HubError::Busy)?;
        reply_rx.await.map_err(|_| HubError::Busy)?
    }

    /// Drops hubs with no live broadcast subscribers (no WebSocket
    /// client watching) for at least `HUB_REAP_GRACE`. A hub with
    /// subscribers is never reaped even if idle, since dropping it would
    /// orphan those clients' receivers.
    pub async fn run_reaper_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let mut hubs = self.hubs.write().await;
            let mut to_remove = Vec::new();
            for (id, state) in hubs.iter() {
                if state.broadcast_tx.receiver_count() > 0 {
                    continue;
                }
                if state.last_activity.lock().await.elapsed() > HUB_REAP_GRACE {
                    to_remove.push(id.clone());
                }
            }
            for id in &to_remove {
                hubs.remove(id);
            }
            if !to_remove.is_empty() {
                info!(reaped = to_remove.len(), "reaped idle hubs");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_frame_defaults_to_empty_on_reload() {
        let frame = BroadcastFrame {
            game_id: "g1".into(),
            revision: 3,
            appended_actions: Vec::new(),
        };
        assert!(frame.appended_actions.is_empty());
    }
}
