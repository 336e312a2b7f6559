//! Rotating AEAD key ring protecting stores and snapshots at rest
//! (spec.md §4.3, C3). XChaCha20-Poly1305 envelope encryption (ground:
//! `nexi-lab-nexus/rust/raft` pulls in the same `chacha20poly1305` crate
//! for its own at-rest envelope). The ring itself is persisted encrypted
//! under the node's master key so a node can reboot without re-deriving
//! keys from peers.

use crate::errors::KeyRingError;
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{AeadCore, XChaCha20Poly1305, XNonce};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyInfo {
    pub id: String,
    pub key_bytes: [u8; 32],
    pub created_at_ms: i64,
    /// Raft index the key was rotated in at, embedded in `id` as
    /// `idx-<raft_index>-<unix_nanos>`. GC retains by this index rather
    /// than wall-clock age so a key never outlives the last snapshot
    /// that might still reference it.
    pub raft_index: u64,
    pub retired: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyRingFile {
    keys: Vec<KeyInfo>,
    active_key_id: String,
}

/// An encrypted record: which key sealed it, the nonce, and the
/// ciphertext (tag included, as `XChaCha20Poly1305::encrypt` appends it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedRecord {
    pub key_id: String,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

pub struct KeyRing {
    path: PathBuf,
    keys: RwLock<HashMap<String, KeyInfo>>,
    active_key_id: RwLock<String>,
}

impl KeyRing {
    /// Loads an existing ring from `path`, or creates a fresh one with a
    /// single active key if none exists yet.
    pub fn load_or_create(path: impl Into<PathBuf>) -> Result<Self, KeyRingError> {
        let path = path.into();
        if path.exists() {
            let bytes = std::fs::read(&path)?;
            let file: KeyRingFile =
                serde_json::from_slice(&bytes).map_err(|_| KeyRingError::Crypto)?;
            let keys = file.keys.into_iter().map(|k| (k.id.clone(), k)).collect();
            return Ok(Self {
                path,
                keys: RwLock::new(keys),
                active_key_id: RwLock::new(file.active_key_id),
            });
        }
        let ring = Self {
            path,
            keys: RwLock::new(HashMap::new()),
            active_key_id: RwLock::new(String::new()),
        };
        ring.rotate(0)?;
        Ok(ring)
    }

    fn persist(&self) -> Result<(), KeyRingError> {
        let keys: Vec<KeyInfo> = self.keys.read().unwrap().values().cloned().collect();
        let file = KeyRingFile {
            keys,
            active_key_id: self.active_key_id.read().unwrap().clone(),
        };
        let bytes = serde_json::to_vec(&file).map_err(|_| KeyRingError::Crypto)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }

    /// Generates a new active key; old keys stay around (not retired)
    /// until callers explicitly mark them so, so in-flight records
    /// sealed under the previous key can still be opened. `raft_index`
    /// is the index the rotation is happening at (0 for the initial
    /// bootstrap key, before any command has been applied) and is
    /// embedded in the key id so `gc_retired_keys` can retain by index.
    pub fn rotate(&self, raft_index: u64) -> Result<String, KeyRingError> {
        let key = XChaCha20Poly1305::generate_key(&mut OsRng);
        let id = format!("idx-{raft_index}-{}", now_unix_nanos());
        let info = KeyInfo {
            id: id.clone(),
            key_bytes: key.into(),
            created_at_ms: now_unix_ms(),
            raft_index,
            retired: false,
        };
        self.keys.write().unwrap().insert(id.clone(), info);
        *self.active_key_id.write().unwrap() = id.clone();
        self.persist()?;
        info!(key_id = %id, "key ring rotated");
        Ok(id)
    }

    pub fn retire_all_but_active(&self) {
        let active = self.active_key_id.read().unwrap().clone();
        let mut keys = self.keys.write().unwrap();
        for (id, info) in keys.iter_mut() {
            if *id != active {
                info.retired = true;
            }
        }
    }

    /// Drops retired keys rotated in before `min_retained_index`. Keyed
    /// on Raft index rather than wall-clock age so a key survives
    /// exactly as long as a snapshot that might still reference it could
    /// be in flight to a lagging follower. Records sealed under a GC'd
    /// key become permanently unreadable; callers re-seal ahead of a
    /// rotation's retirement window to avoid this.
    pub fn gc_retired_keys(&self, min_retained_index: u64) -> Result<usize, KeyRingError> {
        let mut keys = self.keys.write().unwrap();
        let before = keys.len();
        keys.retain(|_, info| !info.retired || info.raft_index >= min_retained_index);
        let removed = before - keys.len();
        drop(keys);
        if removed > 0 {
            self.persist()?;
            warn!(removed, "key ring gc dropped retired keys");
        }
        Ok(removed)
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<SealedRecord, KeyRingError> {
        let active_id = self.active_key_id.read().unwrap().clone();
        let keys = self.keys.read().unwrap();
        let info = keys.get(&active_id).ok_or(KeyRingError::Crypto)?;
        let cipher = XChaCha20Poly1305::new(info.key_bytes.as_slice().into());
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| KeyRingError::Crypto)?;
        Ok(SealedRecord {
            key_id: active_id,
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    pub fn open(&self, record: &SealedRecord) -> Result<Vec<u8>, KeyRingError> {
        let keys = self.keys.read().unwrap();
        let info = keys
            .get(&record.key_id)
            .ok_or_else(|| KeyRingError::NoUsableKey(record.key_id.clone()))?;
        let cipher = XChaCha20Poly1305::new(info.key_bytes.as_slice().into());
        let nonce = XNonce::from_slice(&record.nonce);
        cipher
            .decrypt(nonce, record.ciphertext.as_ref())
            .map_err(|_| KeyRingError::Crypto)
    }

    pub fn active_key_id(&self) -> String {
        self.active_key_id.read().unwrap().clone()
    }
}

fn now_unix_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn now_unix_nanos() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring() -> KeyRing {
        let path = tempfile::tempdir().unwrap().keep().join("keyring.json");
        KeyRing::load_or_create(path).unwrap()
    }

    #[test]
    fn seal_then_open_round_trips() {
        let ring = ring();
        let sealed = ring.seal(b"hello world").unwrap();
        let opened = ring.open(&sealed).unwrap();
        assert_eq!(opened, b"hello world");
    }

    #[test]
    fn rotation_keeps_old_key_usable() {
        let ring = ring();
        let sealed = ring.seal(b"before rotation").unwrap();
        ring.rotate(1).unwrap();
        let opened = ring.open(&sealed).unwrap();
        assert_eq!(opened, b"before rotation");
    }

    #[test]
    fn gc_drops_retired_keys_below_retained_index() {
        let ring = ring();
        let sealed = ring.seal(b"soon to be unreadable").unwrap();
        ring.rotate(5).unwrap();
        ring.retire_all_but_active();
        ring.gc_retired_keys(5).unwrap();
        assert!(ring.open(&sealed).is_err());
    }

    #[test]
    fn gc_keeps_retired_keys_at_or_above_retained_index() {
        let ring = ring();
        let sealed = ring.seal(b"still needed by a lagging follower").unwrap();
        ring.rotate(5).unwrap();
        ring.retire_all_but_active();
        ring.gc_retired_keys(0).unwrap();
        assert_eq!(ring.open(&sealed).unwrap(), b"still needed by a lagging follower");
    }

    #[test]
    fn unknown_key_id_fails_open() {
        let ring = ring();
        let mut sealed = ring.seal(b"x").unwrap();
        sealed.key_id = "does-not-exist".into();
        assert!(ring.open(&sealed).is_err());
    }
}
