//! Cluster membership and the node's external HTTP surface (spec.md
//! §4.6, C6): join/remove/status/action endpoints, follower→leader
//! request forwarding with loop detection, and the background loops
//! that keep the peer address book and metrics fresh.
//!
//! Keeps the teacher's `ClusterHandle`/state-tracking shape from
//! `cluster.rs` (a cheaply-cloneable handle wrapping `Arc<Mutex<...>>`,
//! a `NodeState` enum, an HTTP surface built with
//! `hyper::service::{make_service_fn, service_fn}`) but points it at a
//! real `openraft::Raft` instance instead of a placeholder.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Method, Request, Response};
use openraft::BasicNode;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::errors::RaftManagerError;
use crate::fsm::{NodeId, RaftCommand, RaftInstance};
use crate::identity::NodeIdentity;
use crate::metrics_http::{CLUSTER_LEADER_GAP_MS, FORWARDED_REQUESTS_TOTAL, RAFT_APPLIED_INDEX, RAFT_IS_LEADER};
use crate::metrics_store::MetricsStore;
use crate::tls_transport::{PinStore, TofuClientVerifier};

/// Raft-derived role of this node, mirroring the teacher's
/// `NodeState` (`Forming`/`Follower`/`Leader`) but without a
/// `Standalone` variant — every node here always runs openraft, even a
/// single-node bootstrap cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Forming,
    Follower,
    Leader,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Forming => "forming",
            NodeRole::Follower => "follower",
            NodeRole::Leader => "leader",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: String,
    pub http_addr: String,
    pub raft_addr: String,
}

/// Header carrying the chain of node ids a forwarded request has
/// already passed through, so a cycle in peer address books can't loop
/// a request forever (spec.md §7 "forwarding loop detected").
pub const FORWARD_CHAIN_HEADER: &str = "x-raft-forward-chain";
const MAX_FORWARD_HOPS: usize = 4;

pub struct RaftManagerInner {
    pub role: Mutex<NodeRole>,
    pub node_id: String,
    pub numeric_node_id: NodeId,
    pub peers: Mutex<HashMap<String, PeerInfo>>,
    pub cluster_secret: String,
    pub pins: Arc<PinStore>,
    pub last_leader_contact_ms: Mutex<i64>,
}

/// Cheaply-cloneable handle over the cluster membership surface,
/// shared between the HTTP server, the background loops, and `main.rs`.
#[derive(Clone)]
pub struct RaftManager {
    pub raft: Arc<RaftInstance>,
    pub metrics_store: Arc<tokio::sync::RwLock<MetricsStore>>,
    inner: Arc<RaftManagerInner>,
}

impl RaftManager {
    pub fn new(
        raft: Arc<RaftInstance>,
        metrics_store: Arc<tokio::sync::RwLock<MetricsStore>>,
        node_id: String,
        numeric_node_id: NodeId,
        cluster_secret: String,
        pins: Arc<PinStore>,
    ) -> Self {
        Self {
            raft,
            metrics_store,
            inner: Arc::new(RaftManagerInner {
                role: Mutex::new(NodeRole::Forming),
                node_id,
                numeric_node_id,
                peers: Mutex::new(HashMap::new()),
                cluster_secret,
                pins,
                last_leader_contact_ms: Mutex::new(now_unix_ms()),
            }),
        }
    }

    pub fn role(&self) -> NodeRole {
        *self.inner.role.lock().unwrap()
    }

    fn set_role(&self, role: NodeRole) {
        let mut guard = self.inner.role.lock().unwrap();
        if *guard != role {
            info!(node_id = %self.inner.node_id, old = guard.as_str(), new = role.as_str(), "raft role changed");
            *guard = role;
        }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.inner.numeric_node_id)
    }

    pub fn known_peers(&self) -> Vec<PeerInfo> {
        self.inner.peers.lock().unwrap().values().cloned().collect()
    }

    /// Resolves the current Raft leader's app HTTP address from the
    /// peer address book, for forwarding non-leader app requests
    /// (spec.md §7 "not the leader"). `None` when no leader is known yet
    /// or the leader isn't (or is no longer) in the peer book.
    pub fn leader_http_addr(&self) -> Option<String> {
        let leader = self.raft.metrics().borrow().current_leader?;
        self.inner
            .peers
            .lock()
            .unwrap()
            .values()
            .find(|p| crate::fsm::node_id_from_str(&p.node_id) == leader)
            .map(|p| p.http_addr.clone())
    }

    pub fn upsert_peer(&self, peer: PeerInfo) {
        self.inner
            .peers
            .lock()
            .unwrap()
            .insert(peer.node_id.clone(), peer);
    }

    pub fn remove_peer(&self, node_id: &str) {
        self.inner.peers.lock().unwrap().remove(node_id);
    }

    fn check_secret(&self, provided: &str) -> Result<(), RaftManagerError> {
        if provided == self.inner.cluster_secret {
            Ok(())
        } else {
            Err(RaftManagerError::BadSecret)
        }
    }

    /// Adds `peer` as a non-voting learner then promotes it into the
    /// voting membership, the two-step `openraft` join sequence.
    pub async fn join(&self, peer: PeerInfo) -> Result<(), RaftManagerError> {
        let numeric_id = crate::fsm::node_id_from_str(&peer.node_id);
        let node = BasicNode {
            addr: peer.raft_addr.clone(),
        };
        self.raft
            .add_learner(numeric_id, node, true)
            .await
            .map_err(|e| RaftManagerError::Raft(e.to_string()))?;

        let members: std::collections::BTreeSet<NodeId> = self
            .raft
            .metrics()
            .borrow()
            .membership_config
            .voter_ids()
            .chain(std::iter::once(numeric_id))
            .collect();
        self.raft
            .change_membership(members, false)
            .await
            .map_err(|e| RaftManagerError::Raft(e.to_string()))?;

        self.upsert_peer(peer);
        Ok(())
    }

    pub async fn remove(&self, node_id: &str) -> Result<(), RaftManagerError> {
        let numeric_id = crate::fsm::node_id_from_str(node_id);
        let mut members: std::collections::BTreeSet<NodeId> = self
            .raft
            .metrics()
            .borrow()
            .membership_config
            .voter_ids()
            .collect();
        members.remove(&numeric_id);
        self.raft
            .change_membership(members, false)
            .await
            .map_err(|e| RaftManagerError::Raft(e.to_string()))?;
        self.remove_peer(node_id);
        Ok(())
    }

    /// Submits a command to the Raft log if this node is the leader,
    /// otherwise returns an error carrying the known leader's address so
    /// the caller can forward (spec.md §7 "not the leader").
    pub async fn propose(&self, cmd: RaftCommand) -> Result<crate::fsm::RaftResponse, RaftManagerError> {
        self.raft
            .client_write(cmd)
            .await
            .map(|resp| resp.data)
            .map_err(|e| RaftManagerError::Raft(e.to_string()))
    }

    /// Blocks until the local applied index reaches `target_index` or
    /// `timeout` elapses, used by followers that must read-your-writes
    /// right after a forwarded proposal lands on the leader.
    pub async fn wait_for_sync(&self, target_index: u64, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let applied = self
                .raft
                .metrics()
                .borrow()
                .last_applied
                .map(|l| l.index)
                .unwrap_or(0);
            if applied >= target_index {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Appends this node's own id to the forward chain header and
    /// rejects the request outright if it's already present or the
    /// chain has grown suspiciously long (spec.md §7 "loop detected").
    pub fn extend_forward_chain(&self, existing: Option<&str>) -> Result<String, RaftManagerError> {
        let chain = extend_chain(existing, &self.inner.node_id)?;
        FORWARDED_REQUESTS_TOTAL.inc();
        Ok(chain)
    }

    /// Background loop re-syncing `role`/metrics gauges from
    /// `raft.metrics()` every tick, analogous to the teacher's
    /// `rx.changed()`-driven `ClusterHandle` updater in `raft.rs`.
    pub async fn run_role_watch_loop(self: Arc<Self>) {
        let mut rx = self.raft.metrics();
        loop {
            if rx.changed().await.is_err() {
                break;
            }
            let m = rx.borrow().clone();
            let role = match m.state {
                openraft::ServerState::Leader => NodeRole::Leader,
                openraft::ServerState::Follower | openraft::ServerState::Candidate => {
                    NodeRole::Follower
                }
                _ => NodeRole::Forming,
            };
            let was_leader = self.role() == NodeRole::Leader;
            self.set_role(role);
            RAFT_IS_LEADER.set(if role == NodeRole::Leader { 1.0 } else { 0.0 });
            RAFT_APPLIED_INDEX.set(m.last_applied.map(|l| l.index).unwrap_or(0) as f64);

            if role == NodeRole::Leader && !was_leader {
                let gap = now_unix_ms() - *self.inner.last_leader_contact_ms.lock().unwrap();
                CLUSTER_LEADER_GAP_MS.set(gap as f64);
                info!(node_id = %self.inner.node_id, gap_ms = gap, "acquired leadership");
            }
            if role != NodeRole::Forming {
                *self.inner.last_leader_contact_ms.lock().unwrap() = now_unix_ms();
            }
        }
    }

    /// Auto-config loop (spec.md §4.6): every 2s, drop peers this node
    /// can no longer see in the current membership config, keeping the
    /// address book in sync with what Raft actually agreed on.
    pub async fn run_auto_config_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(2));
        loop {
            interval.tick().await;
            let voters: std::collections::HashSet<NodeId> = self
                .raft
                .metrics()
                .borrow()
                .membership_config
                .voter_ids()
                .collect();
            let mut peers = self.inner.peers.lock().unwrap();
            peers.retain(|node_id, _| voters.contains(&crate::fsm::node_id_from_str(node_id)));
        }
    }

    /// Metrics loop (spec.md §4.6): every 60s, aligned to the minute
    /// boundary, the leader records a cluster-wide `appliedIndex`
    /// sample through the replicated log itself so every node's
    /// `MetricsStore` stays in sync.
    pub async fn run_metrics_loop(self: Arc<Self>) {
        loop {
            let now = tokio::time::Instant::now();
            let millis_into_minute = (now_unix_ms() % 60_000) as u64;
            let wait = Duration::from_millis(60_000 - millis_into_minute);
            tokio::time::sleep(wait).await;

            if !self.is_leader() {
                continue;
            }
            let applied = self
                .raft
                .metrics()
                .borrow()
                .last_applied
                .map(|l| l.index)
                .unwrap_or(0) as f64;
            let cmd = RaftCommand::MetricsUpdate {
                node_id: self.inner.node_id.clone(),
                metric: "appliedIndex".to_string(),
                at_unix_ms: now_unix_ms(),
                value: applied,
            };
            if let Err(e) = self.propose(cmd).await {
                warn!(error = %e, "metrics loop proposal failed");
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

fn extend_chain(existing: Option<&str>, self_id: &str) -> Result<String, RaftManagerError> {
    let mut chain: Vec<String> = existing
        .map(|s| s.split(',').map(str::trim).map(String::from).collect())
        .unwrap_or_default();
    if chain.iter().any(|id| id == self_id) || chain.len() >= MAX_FORWARD_HOPS {
        return Err(RaftManagerError::LoopDetected);
    }
    chain.push(self_id.to_string());
    Ok(chain.join(","))
}

// ── Cluster HTTP surface ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct StatusResponse {
    node_id: String,
    role: String,
    is_leader: bool,
    applied_index: u64,
    peers: Vec<PeerInfo>,
}

#[derive(Debug, Deserialize)]
struct JoinRequest {
    peer: PeerInfo,
}

const RAFT_SECRET_HEADER: &str = "x-raft-secret";

fn secret_from_headers(req: &Request<Body>) -> &str {
    req.headers()
        .get(RAFT_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

async fn cluster_handler(
    req: Request<Body>,
    manager: RaftManager,
) -> Result<Response<Body>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    match (method, path.as_str()) {
        (Method::GET, "/cluster/status") => {
            let m = manager.raft.metrics().borrow().clone();
            let body = StatusResponse {
                node_id: manager.node_id().to_string(),
                role: manager.role().as_str().to_string(),
                is_leader: manager.is_leader(),
                applied_index: m.last_applied.map(|l| l.index).unwrap_or(0),
                peers: manager.known_peers(),
            };
            json_response(200, &body)
        }
        (Method::POST, "/cluster/join") => {
            if manager.check_secret(secret_from_headers(&req)).is_err() {
                return Ok(error_response(403, "bad cluster secret"));
            }
            let bytes = hyper::body::to_bytes(req.into_body()).await?;
            let Ok(payload) = serde_json::from_slice::<JoinRequest>(&bytes) else {
                return Ok(error_response(400, "malformed join request"));
            };
            match manager.join(payload.peer).await {
                Ok(()) => Ok(Response::builder().status(200).body(Body::empty()).unwrap()),
                Err(e) => Ok(error_response(e_status(&e), &e.to_string())),
            }
        }
        (Method::POST, "/cluster/remove") => {
            if manager.check_secret(secret_from_headers(&req)).is_err() {
                return Ok(error_response(403, "bad cluster secret"));
            }
            let bytes = hyper::body::to_bytes(req.into_body()).await?;
            #[derive(Deserialize)]
            struct RemoveRequest {
                node_id: String,
            }
            let Ok(payload) = serde_json::from_slice::<RemoveRequest>(&bytes) else {
                return Ok(error_response(400, "malformed remove request"));
            };
            match manager.remove(&payload.node_id).await {
                Ok(()) => Ok(Response::builder().status(200).body(Body::empty()).unwrap()),
                Err(e) => Ok(error_response(e_status(&e), &e.to_string())),
            }
        }
        (Method::POST, "/raft/append-entries") => {
            if manager.check_secret(secret_from_headers(&req)).is_err() {
                return Ok(error_response(403, "bad cluster secret"));
            }
            let bytes = hyper::body::to_bytes(req.into_body()).await?;
            let Ok(rpc) = serde_json::from_slice(&bytes) else {
                return Ok(error_response(400, "malformed append_entries rpc"));
            };
            match manager.raft.append_entries(rpc).await {
                Ok(resp) => json_response(200, &resp),
                Err(e) => Ok(error_response(500, &e.to_string())),
            }
        }
        (Method::POST, "/raft/vote") => {
            if manager.check_secret(secret_from_headers(&req)).is_err() {
                return Ok(error_response(403, "bad cluster secret"));
            }
            let bytes = hyper::body::to_bytes(req.into_body()).await?;
            let Ok(rpc) = serde_json::from_slice(&bytes) else {
                return Ok(error_response(400, "malformed vote rpc"));
            };
            match manager.raft.vote(rpc).await {
                Ok(resp) => json_response(200, &resp),
                Err(e) => Ok(error_response(500, &e.to_string())),
            }
        }
        (Method::POST, "/raft/install-snapshot") => {
            if manager.check_secret(secret_from_headers(&req)).is_err() {
                return Ok(error_response(403, "bad cluster secret"));
            }
            let bytes = hyper::body::to_bytes(req.into_body()).await?;
            let Ok(rpc) = serde_json::from_slice(&bytes) else {
                return Ok(error_response(400, "malformed install_snapshot rpc"));
            };
            match manager.raft.install_snapshot(rpc).await {
                Ok(resp) => json_response(200, &resp),
                Err(e) => Ok(error_response(500, &e.to_string())),
            }
        }
        _ => Ok(error_response(404, "not found")),
    }
}

fn e_status(e: &RaftManagerError) -> u16 {
    crate::errors::AppError::RaftManager(match e {
        RaftManagerError::BadSecret => RaftManagerError::BadSecret,
        RaftManagerError::LoopDetected => RaftManagerError::LoopDetected,
        RaftManagerError::DiscoveryFailed(m) => RaftManagerError::DiscoveryFailed(m.clone()),
        RaftManagerError::MalformedJoin(m) => RaftManagerError::MalformedJoin(m.clone()),
        RaftManagerError::Tls(m) => RaftManagerError::Tls(m.clone()),
        RaftManagerError::Raft(m) => RaftManagerError::Raft(m.clone()),
    })
    .status_code()
}

fn json_response<T: Serialize>(status: u16, body: &T) -> Result<Response<Body>, hyper::Error> {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    Ok(Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(bytes))
        .unwrap())
}

fn error_response(status: u16, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(format!("{{\"error\":\"{message}\"}}")))
        .unwrap()
}

/// Starts the cluster management HTTP surface, mirroring the teacher's
/// `start_health_server` spawn idiom in `cluster.rs`, but over an mTLS
/// listener (TOFU/PKP via `tls_transport`) instead of plaintext: this is
/// also where the `/raft/*` RPC routes openraft's network client dials
/// terminate.
pub async fn start_cluster_server(
    addr: SocketAddr,
    manager: RaftManager,
    identity: Arc<NodeIdentity>,
    pins: Arc<PinStore>,
) {
    let cert_der = match identity.self_signed_cert_der(manager.node_id()) {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "failed to mint cluster TLS certificate");
            return;
        }
    };
    let key_der = identity.private_key_der();

    let server_config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(TofuClientVerifier::new(pins))
        .with_single_cert(
            vec![CertificateDer::from(cert_der)],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der)),
        );
    let server_config = match server_config {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid cluster TLS server config");
            return;
        }
    };
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, %addr, "failed to bind cluster endpoint");
            return;
        }
    };
    info!(%addr, "cluster management endpoint listening");

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "cluster endpoint accept failed");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let manager = manager.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, %peer_addr, "cluster TLS handshake failed");
                    return;
                }
            };
            let service = service_fn(move |req| {
                let manager = manager.clone();
                async move { cluster_handler(req, manager).await }
            });
            if let Err(e) = Http::new().serve_connection(tls_stream, service).await {
                warn!(error = %e, %peer_addr, "cluster connection error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_strings_match() {
        assert_eq!(NodeRole::Forming.as_str(), "forming");
        assert_eq!(NodeRole::Follower.as_str(), "follower");
        assert_eq!(NodeRole::Leader.as_str(), "leader");
    }

    #[test]
    fn forward_chain_grows_on_first_hop() {
        let chain = extend_chain(None, "node-a").unwrap();
        assert_eq!(chain, "node-a");
    }

    #[test]
    fn forward_chain_detects_cycle() {
        let err = extend_chain(Some("node-b,node-a"), "node-a").unwrap_err();
        assert!(matches!(err, RaftManagerError::LoopDetected));
    }

    #[test]
    fn forward_chain_caps_hop_count() {
        let long_chain = "a,b,c,d";
        let err = extend_chain(Some(long_chain), "e").unwrap_err();
        assert!(matches!(err, RaftManagerError::LoopDetected));
    }
}
