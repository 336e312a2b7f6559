//! Per-user reverse indices, persisted as hashed-filename shards and
//! cached with bounded LRUs (spec.md §4.1, C1).
//!
//! Four independent maps — games owned, games a user can otherwise
//! reach, teams owned, teams a user belongs to — each sharded by
//! `sha256(user_id)[..2]` into a subdirectory so no single directory
//! holds one entry per user cluster-wide (ground: `toshi-search-Toshi`
//! shards its segment directory the same way). Each shard is capped by
//! an `lru::LruCache`; eviction just drops the in-memory copy, the
//! on-disk shard remains the source of truth.

use crate::errors::StoreError;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Mutex;

fn shard_prefix(user_id: &str) -> String {
    let digest = Sha256::digest(user_id.as_bytes());
    hex::encode(&digest[..1])
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct UserEntitySet(HashSet<String>);

/// One of the four reverse indices (games-owned, games-accessible,
/// teams-owned, teams-member).
pub struct UserIndexMap {
    dir: PathBuf,
    cache: Mutex<LruCache<String, UserEntitySet>>,
}

impl UserIndexMap {
    pub fn new(dir: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            dir: dir.into(),
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
        }
    }

    fn shard_path(&self, user_id: &str) -> PathBuf {
        self.dir
            .join(shard_prefix(user_id))
            .join(format!("{}.json", user_id.replace('/', "_")))
    }

    fn load_from_disk(&self, user_id: &str) -> Result<UserEntitySet, StoreError> {
        let path = self.shard_path(user_id);
        if !path.exists() {
            return Ok(UserEntitySet::default());
        }
        let bytes = std::fs::read(&path).map_err(|e| StoreError::Io {
            id: user_id.to_string(),
            source: e,
        })?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Serde {
            id: user_id.to_string(),
            source: e,
        })
    }

    fn write_to_disk(&self, user_id: &str, set: &UserEntitySet) -> Result<(), StoreError> {
        let path = self.shard_path(user_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io {
                id: user_id.to_string(),
                source: e,
            })?;
        }
        let bytes = serde_json::to_vec(set).map_err(|e| StoreError::Serde {
            id: user_id.to_string(),
            source: e,
        })?;
        std::fs::write(&path, bytes).map_err(|e| StoreError::Io {
            id: user_id.to_string(),
            source: e,
        })
    }

    fn get_or_load(&self, user_id: &str) -> Result<UserEntitySet, StoreError> {
        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(hit) = cache.get(user_id) {
                return Ok(hit.clone());
            }
        }
        let loaded = self.load_from_disk(user_id)?;
        self.cache
            .lock()
            .unwrap()
            .put(user_id.to_string(), loaded.clone());
        Ok(loaded)
    }

    pub fn add(&self, user_id: &str, entity_id: &str) -> Result<(), StoreError> {
        let mut set = self.get_or_load(user_id)?;
        set.0.insert(entity_id.to_string());
        self.write_to_disk(user_id, &set)?;
        self.cache.lock().unwrap().put(user_id.to_string(), set);
        Ok(())
    }

    pub fn remove(&self, user_id: &str, entity_id: &str) -> Result<(), StoreError> {
        let mut set = self.get_or_load(user_id)?;
        set.0.remove(entity_id);
        self.write_to_disk(user_id, &set)?;
        self.cache.lock().unwrap().put(user_id.to_string(), set);
        Ok(())
    }

    pub fn list(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .get_or_load(user_id)?
            .0
            .into_iter()
            .collect::<Vec<_>>())
    }

    /// Wipes every shard on disk and drops the in-memory cache. Used
    /// when a Raft snapshot install replaces the game/team set wholesale
    /// and the reverse indices need to be rebuilt from scratch.
    pub fn clear_all(&self) -> Result<(), StoreError> {
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir).map_err(|e| StoreError::Io {
                id: "*".to_string(),
                source: e,
            })?;
        }
        self.cache.lock().unwrap().clear();
        Ok(())
    }
}

/// The four reverse indices a `Registry` consults on every access check
/// and listing request.
pub struct UserIndexStore {
    pub games_owned: UserIndexMap,
    pub games_accessible: UserIndexMap,
    pub teams_owned: UserIndexMap,
    pub teams_member: UserIndexMap,
}

impl UserIndexStore {
    pub fn new(base_dir: impl Into<PathBuf>, per_user_cache_capacity: usize) -> Self {
        let base_dir = base_dir.into();
        Self {
            games_owned: UserIndexMap::new(base_dir.join("games_owned"), per_user_cache_capacity),
            games_accessible: UserIndexMap::new(
                base_dir.join("games_accessible"),
                per_user_cache_capacity,
            ),
            teams_owned: UserIndexMap::new(base_dir.join("teams_owned"), per_user_cache_capacity),
            teams_member: UserIndexMap::new(
                base_dir.join("teams_member"),
                per_user_cache_capacity,
            ),
        }
    }

    pub fn clear_all(&self) -> Result<(), StoreError> {
        self.games_owned.clear_all()?;
        self.games_accessible.clear_all()?;
        self.teams_owned.clear_all()?;
        self.teams_member.clear_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_map() -> UserIndexMap {
        let dir = tempfile::tempdir().unwrap().keep();
        UserIndexMap::new(dir, 8)
    }

    #[test]
    fn add_then_list_round_trips() {
        let map = temp_map();
        map.add("alice", "game:1").unwrap();
        map.add("alice", "game:2").unwrap();
        let mut games = map.list("alice").unwrap();
        games.sort();
        assert_eq!(games, vec!["game:1", "game:2"]);
    }

    #[test]
    fn remove_drops_entry() {
        let map = temp_map();
        map.add("bob", "game:3").unwrap();
        map.remove("bob", "game:3").unwrap();
        assert!(map.list("bob").unwrap().is_empty());
    }

    #[test]
    fn survives_lru_eviction_by_reloading_from_disk() {
        let map = UserIndexMap::new(tempfile::tempdir().unwrap().keep(), 1);
        map.add("carol", "game:4").unwrap();
        map.add("dave", "game:5").unwrap();
        assert_eq!(map.list("carol").unwrap(), vec!["game:4".to_string()]);
    }

    #[test]
    fn shards_split_by_hash_prefix() {
        let a = shard_prefix("alice");
        let b = shard_prefix("bob");
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 2);
    }
}
