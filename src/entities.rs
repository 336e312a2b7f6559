//! Core entity types: games, teams, node metadata, and the access-control
//! rule used to turn an entity plus a user id into an [`AccessLevel`].

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Monotonic access levels (spec.md §3: `none < read < write < admin`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum AccessLevel {
    None = 0,
    Read = 1,
    Write = 2,
    Admin = 3,
}

impl AccessLevel {
    pub fn from_role(role: &str) -> Self {
        match role {
            "admin" | "admins" => AccessLevel::Admin,
            "write" | "scorekeeper" | "scorekeepers" => AccessLevel::Write,
            "read" | "spectator" | "spectators" => AccessLevel::Read,
            _ => AccessLevel::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityStatus {
    Active,
    Deleted,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GamePermissions {
    /// "none" or "read" — anonymous/public visibility.
    pub public: Option<String>,
    /// email -> "read" | "write"
    pub users: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Game {
    pub id: String,
    #[serde(default)]
    pub schema_version: u32,
    pub owner_id: String,
    pub status: EntityStatus,
    pub deleted_at: Option<i64>,
    #[serde(default)]
    pub permissions: GamePermissions,
    pub away_team_id: Option<String>,
    pub home_team_id: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub away: Option<String>,
    #[serde(default)]
    pub home: Option<String>,
    #[serde(default)]
    pub action_log: Vec<ActionRecord>,
    #[serde(default)]
    pub last_action_id: Option<String>,
    /// The Raft index this game was last mutated at (I1).
    #[serde(default)]
    pub last_raft_index: u64,
}

impl Game {
    pub fn new(id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            schema_version: 1,
            owner_id: owner_id.into(),
            status: EntityStatus::Active,
            deleted_at: None,
            permissions: GamePermissions::default(),
            away_team_id: None,
            home_team_id: None,
            date: None,
            location: None,
            event: None,
            away: None,
            home: None,
            action_log: Vec::new(),
            last_action_id: None,
            last_raft_index: 0,
        }
    }

    /// Self-repair rule (spec.md §4.5): if `lastActionId` is empty but the
    /// action log isn't, fill it in from the tail before persisting.
    pub fn repair_last_action_id(&mut self) {
        if self.last_action_id.is_none() {
            if let Some(last) = self.action_log.last() {
                self.last_action_id = Some(last.id.clone());
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeamRoles {
    pub admins: HashSet<String>,
    pub scorekeepers: HashSet<String>,
    pub spectators: HashSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    #[serde(default)]
    pub schema_version: u32,
    pub owner_id: String,
    pub status: EntityStatus,
    pub deleted_at: Option<i64>,
    #[serde(default)]
    pub roles: TeamRoles,
    #[serde(default)]
    pub roster: Vec<String>,
    #[serde(default)]
    pub last_raft_index: u64,
}

impl Team {
    pub fn new(id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            schema_version: 1,
            owner_id: owner_id.into(),
            status: EntityStatus::Active,
            deleted_at: None,
            roles: TeamRoles::default(),
            roster: Vec::new(),
            last_raft_index: 0,
        }
    }

    /// Team access rule (spec.md §6): owner or role membership.
    pub fn access_level(&self, user_id: &str) -> AccessLevel {
        if self.owner_id == user_id {
            return AccessLevel::Admin;
        }
        if self.roles.admins.contains(user_id) {
            AccessLevel::Admin
        } else if self.roles.scorekeepers.contains(user_id) {
            AccessLevel::Write
        } else if self.roles.spectators.contains(user_id) {
            AccessLevel::Read
        } else {
            AccessLevel::None
        }
    }
}

/// Evaluates the game authorization rule from spec.md §6: the max of
/// ownership, direct permission, team-inherited role, and public access.
/// `team_lookup` resolves a team id to its current state, when known
/// locally (the registry passes this in via its metadata cache).
pub fn game_access_level(
    game: &Game,
    user_id: Option<&str>,
    team_lookup: impl Fn(&str) -> Option<AccessLevel>,
) -> AccessLevel {
    let mut level = AccessLevel::None;

    if let Some(uid) = user_id {
        if game.owner_id == uid {
            level = level.max(AccessLevel::Admin);
        }
        if let Some(direct) = game.permissions.users.get(uid) {
            level = level.max(match direct.as_str() {
                "write" => AccessLevel::Write,
                "read" => AccessLevel::Read,
                _ => AccessLevel::None,
            });
        }
        for team_id in [&game.away_team_id, &game.home_team_id]
            .into_iter()
            .flatten()
        {
            if let Some(team_level) = team_lookup(team_id) {
                level = level.max(team_level);
            }
        }
    }

    if game.permissions.public.as_deref() == Some("read") {
        level = level.max(AccessLevel::Read);
    }

    level
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMeta {
    pub node_id: String,
    pub http_addr: String,
    pub raft_addr: String,
    /// Base64-encoded ed25519 public key.
    pub pub_key: String,
    pub app_version: String,
    pub protocol_version: u32,
    pub schema_version: u32,
    #[serde(default)]
    pub non_voter: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DefaultPolicy {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserQuota {
    pub access: AccessLevel,
    pub max_games: Option<u32>,
    pub max_teams: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccessPolicy {
    pub default_policy: DefaultPolicy,
    pub default_max_games: u32,
    pub default_max_teams: u32,
    pub admins: HashSet<String>,
    pub per_user: HashMap<String, UserQuota>,
    pub deny_message: String,
}

impl Default for UserAccessPolicy {
    fn default() -> Self {
        Self {
            default_policy: DefaultPolicy::Allow,
            default_max_games: 100,
            default_max_teams: 20,
            admins: HashSet::new(),
            per_user: HashMap::new(),
            deny_message: "access denied by cluster policy".to_string(),
        }
    }
}

impl UserAccessPolicy {
    /// Whether `user_id` may create new resources at all, per policy.
    pub fn allows(&self, user_id: &str) -> bool {
        if self.admins.contains(user_id) {
            return true;
        }
        if let Some(q) = self.per_user.get(user_id) {
            return q.access > AccessLevel::None;
        }
        self.default_policy == DefaultPolicy::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_levels_are_ordered() {
        assert!(AccessLevel::Admin > AccessLevel::Write);
        assert!(AccessLevel::Write > AccessLevel::Read);
        assert!(AccessLevel::Read > AccessLevel::None);
    }

    #[test]
    fn owner_is_admin() {
        let g = Game::new("g1", "alice");
        assert_eq!(
            game_access_level(&g, Some("alice"), |_| None),
            AccessLevel::Admin
        );
    }

    #[test]
    fn public_read_applies_to_anonymous() {
        let mut g = Game::new("g1", "alice");
        g.permissions.public = Some("read".to_string());
        assert_eq!(game_access_level(&g, None, |_| None), AccessLevel::Read);
    }

    #[test]
    fn direct_permission_grants_write() {
        let mut g = Game::new("g1", "alice");
        g.permissions.users.insert("bob".into(), "write".into());
        assert_eq!(
            game_access_level(&g, Some("bob"), |_| None),
            AccessLevel::Write
        );
    }

    #[test]
    fn team_inherited_access_lifts_level() {
        let mut g = Game::new("g1", "alice");
        g.home_team_id = Some("t1".into());
        assert_eq!(
            game_access_level(&g, Some("carol"), |id| (id == "t1")
                .then_some(AccessLevel::Write)),
            AccessLevel::Write
        );
    }

    #[test]
    fn team_access_levels_by_role() {
        let mut t = Team::new("t1", "alice");
        t.roles.scorekeepers.insert("bob".into());
        t.roles.spectators.insert("carol".into());
        assert_eq!(t.access_level("alice"), AccessLevel::Admin);
        assert_eq!(t.access_level("bob"), AccessLevel::Write);
        assert_eq!(t.access_level("carol"), AccessLevel::Read);
        assert_eq!(t.access_level("dave"), AccessLevel::None);
    }

    #[test]
    fn repair_last_action_id_fills_from_tail() {
        let mut g = Game::new("g1", "alice");
        g.action_log.push(ActionRecord {
            id: "a1".into(),
            kind: "GAME_START".into(),
            payload: serde_json::json!({}),
        });
        g.repair_last_action_id();
        assert_eq!(g.last_action_id.as_deref(), Some("a1"));
    }

    #[test]
    fn policy_default_allow() {
        let p = UserAccessPolicy::default();
        assert!(p.allows("anyone"));
    }

    #[test]
    fn policy_default_deny_blocks_unlisted_users() {
        let mut p = UserAccessPolicy::default();
        p.default_policy = DefaultPolicy::Deny;
        assert!(!p.allows("stranger"));
        p.per_user.insert(
            "vip".into(),
            UserQuota {
                access: AccessLevel::Write,
                max_games: None,
                max_teams: None,
            },
        );
        assert!(p.allows("vip"));
    }
}
