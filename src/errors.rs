//! Error categorization for the replicated core, plus the HTTP-status
//! mapping hubs and handlers use to answer clients (spec.md §7).

use thiserror::Error;

/// Errors from the per-entity stores (C1).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("entity {0} not found")]
    NotFound(String),

    #[error("io error persisting {id}: {source}")]
    Io {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialize entity {id}: {source}")]
    Serde {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from the key ring / encrypted stores (C3).
#[derive(Error, Debug)]
pub enum KeyRingError {
    #[error("no usable key could decrypt record sealed with key {0}")]
    NoUsableKey(String),

    #[error("AEAD seal/open failure")]
    Crypto,

    #[error("key ring io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the link snapshot store (C4).
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("manifest missing from snapshot stream")]
    MissingManifest,

    #[error("malformed snapshot manifest: {0}")]
    MalformedManifest(String),
}

/// Errors raised while applying or restoring the replicated state machine (C5).
#[derive(Error, Debug)]
pub enum FsmError {
    #[error("command decode failed: {0}")]
    Decode(String),

    /// The conflict-detector family (spec.md §4.5, §7).
    #[error("conflict: incoming action log diverges from server log at base revision {base_revision}")]
    Conflict { base_revision: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Errors from hub request handling (C7).
#[derive(Error, Debug)]
pub enum HubError {
    #[error(transparent)]
    Fsm(#[from] FsmError),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not the leader")]
    NotLeader,

    #[error("hub is busy, retry later")]
    Busy,

    #[error("malformed action: {0}")]
    MalformedAction(String),

    #[error("no leader known")]
    NoLeaderKnown,
}

/// Errors from the Raft manager / cluster membership surface (C6).
#[derive(Error, Debug)]
pub enum RaftManagerError {
    #[error("bad cluster secret")]
    BadSecret,

    #[error("forwarding loop detected")]
    LoopDetected,

    #[error("peer discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("malformed join request: {0}")]
    MalformedJoin(String),

    #[error("tls identity error: {0}")]
    Tls(String),

    #[error("raft error: {0}")]
    Raft(String),
}

/// Top-level error unifying every subsystem at the HTTP boundary.
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Fsm(#[from] FsmError),
    #[error(transparent)]
    Hub(#[from] HubError),
    #[error(transparent)]
    RaftManager(#[from] RaftManagerError),
    #[error(transparent)]
    KeyRing(#[from] KeyRingError),
}

impl AppError {
    /// HTTP status this error should surface as (spec.md §7's
    /// "user-visible failures" table).
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::Store(StoreError::NotFound(_)) => 404,
            AppError::Store(_) => 500,
            AppError::Fsm(FsmError::Conflict { .. }) => 409,
            AppError::Fsm(_) => 500,
            AppError::Hub(HubError::Forbidden(_)) => 403,
            AppError::Hub(HubError::NotLeader) => 503,
            AppError::Hub(HubError::NoLeaderKnown) => 503,
            AppError::Hub(HubError::Busy) => 429,
            AppError::Hub(HubError::MalformedAction(_)) => 400,
            AppError::Hub(HubError::Fsm(_)) => 500,
            AppError::RaftManager(RaftManagerError::BadSecret) => 403,
            AppError::RaftManager(RaftManagerError::LoopDetected) => 508,
            AppError::RaftManager(RaftManagerError::DiscoveryFailed(_)) => 502,
            AppError::RaftManager(RaftManagerError::MalformedJoin(_)) => 400,
            AppError::RaftManager(_) => 500,
            AppError::KeyRing(_) => 500,
        }
    }

    /// Machine-readable label, mirrors the teacher's `ErrorCategory::label`.
    pub fn label(&self) -> &'static str {
        match self {
            AppError::Store(_) => "store_error",
            AppError::Fsm(FsmError::Conflict { .. }) => "conflict",
            AppError::Fsm(_) => "fsm_error",
            AppError::Hub(HubError::NotLeader) => "not_leader",
            AppError::Hub(HubError::Forbidden(_)) => "forbidden",
            AppError::Hub(HubError::Busy) => "busy",
            AppError::Hub(_) => "hub_error",
            AppError::RaftManager(RaftManagerError::LoopDetected) => "loop_detected",
            AppError::RaftManager(_) => "raft_manager_error",
            AppError::KeyRing(_) => "key_ring_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_maps_to_409() {
        let e = AppError::Fsm(FsmError::Conflict { base_revision: 3 });
        assert_eq!(e.status_code(), 409);
        assert_eq!(e.label(), "conflict");
    }

    #[test]
    fn not_leader_maps_to_503() {
        let e = AppError::Hub(HubError::NotLeader);
        assert_eq!(e.status_code(), 503);
    }

    #[test]
    fn loop_detected_maps_to_508() {
        let e = AppError::RaftManager(RaftManagerError::LoopDetected);
        assert_eq!(e.status_code(), 508);
    }

    #[test]
    fn not_found_maps_to_404() {
        let e = AppError::Store(StoreError::NotFound("game:g1".into()));
        assert_eq!(e.status_code(), 404);
    }

    #[test]
    fn busy_maps_to_429() {
        let e = AppError::Hub(HubError::Busy);
        assert_eq!(e.status_code(), 429);
    }
}
