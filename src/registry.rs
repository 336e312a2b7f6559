//! Access-control registry (spec.md §4.2, C2): the in-memory index that
//! answers "can user X touch entity Y" without re-reading every game and
//! team off disk, plus the periodic tombstone GC.

use crate::entities::{game_access_level, AccessLevel, Game, Team, UserAccessPolicy};
use crate::errors::StoreError;
use crate::store::EntityStore;
use crate::user_index_store::UserIndexStore;
use dashmap::DashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

/// Parsed form of a listing query (spec.md §4.2 "query language"):
/// `owner:<id>`, `team:<id>`, `status:active|deleted`, combined with AND.
#[derive(Debug, Clone, Default)]
pub struct GameQuery {
    pub owner: Option<String>,
    pub team: Option<String>,
    pub include_deleted: bool,
}

impl GameQuery {
    /// Parses a space-separated `key:value` query string.
    pub fn parse(raw: &str) -> Self {
        let mut q = GameQuery::default();
        for token in raw.split_whitespace() {
            if let Some((key, value)) = token.split_once(':') {
                match key {
                    "owner" => q.owner = Some(value.to_string()),
                    "team" => q.team = Some(value.to_string()),
                    "status" if value == "deleted" => q.include_deleted = true,
                    _ => {}
                }
            }
        }
        q
    }

    fn matches(&self, game: &Game) -> bool {
        if !self.include_deleted && game.is_deleted_status() {
            return false;
        }
        if let Some(owner) = &self.owner {
            if &game.owner_id != owner {
                return false;
            }
        }
        if let Some(team) = &self.team {
            if game.away_team_id.as_deref() != Some(team.as_str())
                && game.home_team_id.as_deref() != Some(team.as_str())
            {
                return false;
            }
        }
        true
    }
}

trait DeletedStatus {
    fn is_deleted_status(&self) -> bool;
}

impl DeletedStatus for Game {
    fn is_deleted_status(&self) -> bool {
        matches!(self.status, crate::entities::EntityStatus::Deleted)
    }
}

/// Per-user access-level cache, bounded implicitly by one entry per
/// (user, game) pair actually requested; the reverse indices in
/// [`UserIndexStore`] bound the working set in practice.
pub struct Registry {
    games: Arc<EntityStore<Game>>,
    teams: Arc<EntityStore<Team>>,
    user_index: Arc<UserIndexStore>,
    access_cache: DashMap<(String, String), AccessLevel>,
    policy: RwLock<UserAccessPolicy>,
}

impl Registry {
    pub fn new(
        games: Arc<EntityStore<Game>>,
        teams: Arc<EntityStore<Team>>,
        user_index: Arc<UserIndexStore>,
        policy: UserAccessPolicy,
    ) -> Self {
        Self {
            games,
            teams,
            user_index,
            access_cache: DashMap::new(),
            policy: RwLock::new(policy),
        }
    }

    pub fn games_store(&self) -> &EntityStore<Game> {
        &self.games
    }

    pub fn teams_store(&self) -> &EntityStore<Team> {
        &self.teams
    }

    pub fn set_policy(&self, policy: UserAccessPolicy) {
        *self.policy.write().unwrap() = policy;
        self.access_cache.clear();
    }

    pub fn policy_allows_create(&self, user_id: &str) -> bool {
        self.policy.read().unwrap().allows(user_id)
    }

    /// Resolves the access level `user_id` has on `game_id`, consulting
    /// the cache first and invalidating it whenever the underlying game
    /// or either of its teams changes (`invalidate`).
    pub async fn access_level(
        &self,
        game_id: &str,
        user_id: Option<&str>,
    ) -> Result<AccessLevel, StoreError> {
        let cache_key = (game_id.to_string(), user_id.unwrap_or("").to_string());
        if let Some(hit) = self.access_cache.get(&cache_key) {
            return Ok(*hit);
        }
        let Some(game) = self.games.load(game_id).await? else {
            return Ok(AccessLevel::None);
        };
        let teams = self.teams.clone();
        let mut team_cache = std::collections::HashMap::new();
        for team_id in [&game.away_team_id, &game.home_team_id]
            .into_iter()
            .flatten()
        {
            if let Some(team) = teams.load(team_id).await? {
                if let Some(uid) = user_id {
                    team_cache.insert(team_id.clone(), team.access_level(uid));
                }
            }
        }
        let level = game_access_level(&game, user_id, |id| team_cache.get(id).copied());
        self.access_cache.insert(cache_key, level);
        Ok(level)
    }

    pub fn invalidate(&self, game_id: &str) {
        self.access_cache.retain(|(g, _), _| g != game_id);
    }

    /// Updates the owner/team-member reverse indices after a game is
    /// created or reassigned.
    pub fn index_game(&self, game: &Game) -> Result<(), StoreError> {
        self.user_index.games_owned.add(&game.owner_id, &game.id)?;
        for (user, _) in &game.permissions.users {
            self.user_index.games_accessible.add(user, &game.id)?;
        }
        Ok(())
    }

    pub fn index_team(&self, team: &Team) -> Result<(), StoreError> {
        self.user_index.teams_owned.add(&team.owner_id, &team.id)?;
        for member in team
            .roles
            .admins
            .iter()
            .chain(team.roles.scorekeepers.iter())
            .chain(team.roles.spectators.iter())
        {
            self.user_index.teams_member.add(member, &team.id)?;
        }
        Ok(())
    }

    /// Reverse-image of `index_game`, run on deletion so the owner and
    /// accessible-user indices don't keep pointing at a tombstoned game.
    pub fn delete_game(&self, game: &Game) -> Result<(), StoreError> {
        self.user_index.games_owned.remove(&game.owner_id, &game.id)?;
        for (user, _) in &game.permissions.users {
            self.user_index.games_accessible.remove(user, &game.id)?;
        }
        self.invalidate(&game.id);
        Ok(())
    }

    /// Reverse-image of `index_team`, run on deletion.
    pub fn delete_team(&self, team: &Team) -> Result<(), StoreError> {
        self.user_index.teams_owned.remove(&team.owner_id, &team.id)?;
        for member in team
            .roles
            .admins
            .iter()
            .chain(team.roles.scorekeepers.iter())
            .chain(team.roles.spectators.iter())
        {
            self.user_index.teams_member.remove(member, &team.id)?;
        }
        Ok(())
    }

    /// Rebuilds both reverse indices from scratch by re-reading every
    /// game and team off disk. Used after a Raft snapshot install
    /// replaces the entity stores wholesale, since the indices on disk
    /// at that point may describe state the new snapshot no longer has.
    pub async fn rebuild_index(&self) -> Result<(), StoreError> {
        self.user_index.clear_all()?;
        self.access_cache.clear();

        for meta in self.games.list_all_metadata()? {
            if let Some(game) = self.games.load(&meta.id).await? {
                self.index_game(&game)?;
            }
        }
        for meta in self.teams.list_all_metadata()? {
            if let Some(team) = self.teams.load(&meta.id).await? {
                self.index_team(&team)?;
            }
        }
        Ok(())
    }

    /// Runs a parsed [`GameQuery`] against every game id a user can
    /// reach via the reverse indices (owner or accessible), loading each
    /// candidate and filtering.
    pub async fn query_games(
        &self,
        user_id: &str,
        query: &GameQuery,
    ) -> Result<Vec<Arc<Game>>, StoreError> {
        let mut ids: std::collections::HashSet<String> =
            self.user_index.games_owned.list(user_id)?.into_iter().collect();
        ids.extend(self.user_index.games_accessible.list(user_id)?);

        let mut out = Vec::new();
        for id in ids {
            if let Some(game) = self.games.load(&id).await? {
                if query.matches(&game) {
                    out.push(game);
                }
            }
        }
        Ok(out)
    }

    /// Periodic tombstone purge (spec.md §4.2: 12h cadence). Intended to
    /// be `tokio::spawn`ed once at startup.
    pub async fn run_gc_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(12 * 60 * 60));
        loop {
            interval.tick().await;
            let cutoff = now_unix_ms() - Duration::from_secs(30 * 24 * 60 * 60).as_millis() as i64;
            match self.games.purge_deleted_before(cutoff).await {
                Ok(n) => info!(purged = n, "game tombstone gc complete"),
                Err(e) => warn!(error = %e, "game tombstone gc failed"),
            }
            match self.teams.purge_deleted_before(cutoff).await {
                Ok(n) => info!(purged = n, "team tombstone gc complete"),
                Err(e) => warn!(error = %e, "team tombstone gc failed"),
            }
        }
    }
}

fn now_unix_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::EntityStatus;

    fn registry() -> Registry {
        let base = tempfile::tempdir().unwrap().keep();
        let games = Arc::new(EntityStore::new(base.join("games")));
        let teams = Arc::new(EntityStore::new(base.join("teams")));
        let index = Arc::new(UserIndexStore::new(base.join("index"), 64));
        Registry::new(games, teams, index, UserAccessPolicy::default())
    }

    #[tokio::test]
    async fn owner_has_admin_access() {
        let reg = registry();
        let g = Game::new("g1", "alice");
        reg.games.save(g.clone()).await.unwrap();
        reg.index_game(&g).unwrap();
        assert_eq!(
            reg.access_level("g1", Some("alice")).await.unwrap(),
            AccessLevel::Admin
        );
    }

    #[tokio::test]
    async fn stranger_has_no_access_by_default() {
        let reg = registry();
        let g = Game::new("g1", "alice");
        reg.games.save(g.clone()).await.unwrap();
        assert_eq!(
            reg.access_level("g1", Some("mallory")).await.unwrap(),
            AccessLevel::None
        );
    }

    #[tokio::test]
    async fn query_filters_by_owner() {
        let reg = registry();
        let g1 = Game::new("g1", "alice");
        let mut g2 = Game::new("g2", "alice");
        g2.status = EntityStatus::Deleted;
        reg.games.save(g1.clone()).await.unwrap();
        reg.games.save(g2.clone()).await.unwrap();
        reg.index_game(&g1).unwrap();
        reg.index_game(&g2).unwrap();

        let results = reg
            .query_games("alice", &GameQuery::parse("owner:alice"))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "g1");
    }

    #[test]
    fn query_language_parses_tokens() {
        let q = GameQuery::parse("owner:alice team:t1 status:deleted");
        assert_eq!(q.owner.as_deref(), Some("alice"));
        assert_eq!(q.team.as_deref(), Some("t1"));
        assert!(q.include_deleted);
    }

    #[tokio::test]
    async fn invalidate_clears_cached_level() {
        let reg = registry();
        let g = Game::new("g1", "alice");
        reg.games.save(g.clone()).await.unwrap();
        let _ = reg.access_level("g1", Some("alice")).await.unwrap();
        reg.invalidate("g1");
        assert!(reg.access_cache.is_empty());
    }
}
