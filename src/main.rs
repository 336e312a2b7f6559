//! Node entry point: loads configuration, materializes this node's
//! identity and key ring, starts the embedded Raft instance, and serves
//! the cluster management, Prometheus, and application HTTP surfaces.

use mimalloc::MiMalloc;
use skorekeeper::config::Config;
use skorekeeper::fsm::{self, Fsm, RaftInstance, TypeConfig};
use skorekeeper::http_api::{start_app_server, AppState};
use skorekeeper::hub::HubManager;
use skorekeeper::identity::NodeIdentity;
use skorekeeper::keyring::KeyRing;
use skorekeeper::metrics_http::{register_metrics, start_metrics_server};
use skorekeeper::metrics_store::MetricsStore;
use skorekeeper::raft_manager::{start_cluster_server, PeerInfo, RaftManager};
use skorekeeper::registry::Registry;
use skorekeeper::snapshot::LinkSnapshotStore;
use skorekeeper::store::EntityStore;
use skorekeeper::tls_transport::PinStore;
use skorekeeper::entities::UserAccessPolicy;

use openraft::BasicNode;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use skorekeeper::tls_transport::TofuServerVerifier;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .json()
        .init();

    let config = Config::from_env()?;
    info!(node = %config.node_label, "starting node");

    register_metrics()?;

    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::create_dir_all(&config.raft_dir)?;

    let keyring = Arc::new(KeyRing::load_or_create(
        config.raft_dir.join("keyring.json"),
    )?);
    let identity = Arc::new(NodeIdentity::load_or_create(
        config.raft_dir.join("identity.json"),
        keyring.clone(),
    )?);
    info!(node_id = %identity.node_id, "node identity ready");

    let numeric_node_id = fsm::node_id_from_str(&identity.node_id);

    let games = Arc::new(EntityStore::new(config.data_dir.join("games")));
    let teams = Arc::new(EntityStore::new(config.data_dir.join("teams")));
    let user_index = Arc::new(skorekeeper::user_index_store::UserIndexStore::new(
        config.data_dir.join("user_index"),
        4096,
    ));
    let registry = Arc::new(Registry::new(
        games.clone(),
        teams.clone(),
        user_index,
        UserAccessPolicy::default(),
    ));
    let metrics_store = Arc::new(tokio::sync::RwLock::new(MetricsStore::new()));
    let snapshot_store = Arc::new(LinkSnapshotStore::new(
        config.raft_dir.join("snapshots"),
        Some(keyring.clone()),
        config.snapshot_retain,
    ));

    let (fsm_instance, _applied_rx) = Fsm::new(
        games,
        teams,
        registry.clone(),
        metrics_store.clone(),
        Some(keyring.clone()),
        snapshot_store,
    );
    let (log_store, state_machine) = fsm::split_storage(fsm_instance);

    let raft_config = Arc::new(
        openraft::Config {
            cluster_name: "skorekeeper".to_string(),
            heartbeat_interval: 500,
            election_timeout_min: 1_500,
            election_timeout_max: 3_000,
            ..Default::default()
        }
        .validate()
        .expect("valid openraft config"),
    );

    let network = ClusterNetworkFactory {
        pins: PinStore::new(),
        cluster_secret: config.cluster_secret.clone(),
        identity: identity.clone(),
    };

    let raft: Arc<RaftInstance> = Arc::new(
        openraft::Raft::new(
            numeric_node_id,
            raft_config,
            network.clone(),
            log_store,
            state_machine,
        )
        .await?,
    );

    if config.bootstrap {
        let mut members: BTreeMap<u64, BasicNode> = BTreeMap::new();
        members.insert(
            numeric_node_id,
            BasicNode {
                addr: config.raft_advertise(),
            },
        );
        if let Err(e) = raft.initialize(members).await {
            info!(error = %e, "raft already initialized, ignoring on restart");
        }
    }

    let raft_manager = Arc::new(RaftManager::new(
        raft.clone(),
        metrics_store.clone(),
        identity.node_id.clone(),
        numeric_node_id,
        config.cluster_secret.clone(),
        network.pins.clone(),
    ));

    for peer in &config.seed_peers {
        if let Some((node_id, addr)) = peer.split_once('@') {
            raft_manager.upsert_peer(PeerInfo {
                node_id: node_id.to_string(),
                http_addr: addr.to_string(),
                raft_addr: addr.to_string(),
            });
        }
    }

    tokio::spawn(raft_manager.clone().run_role_watch_loop());
    tokio::spawn(raft_manager.clone().run_auto_config_loop());
    tokio::spawn(raft_manager.clone().run_metrics_loop());
    tokio::spawn(registry.clone().run_gc_loop());

    let hubs = HubManager::new(registry.clone(), raft_manager.clone());
    tokio::spawn(hubs.clone().run_reaper_loop());

    let app_state = Arc::new(AppState {
        hubs,
        registry: registry.clone(),
        raft: raft_manager.clone(),
    });

    let raft_bind: std::net::SocketAddr = config.raft_bind_addr.parse()?;
    let http_bind: std::net::SocketAddr = config.http_bind_addr.parse()?;
    let metrics_bind: std::net::SocketAddr = config.metrics_bind_addr.parse()?;

    tokio::join!(
        start_cluster_server(
            raft_bind,
            raft_manager.as_ref().clone(),
            identity.clone(),
            network.pins.clone(),
        ),
        start_app_server(http_bind, app_state),
        start_metrics_server(metrics_bind),
    );

    Ok(())
}

/// Per-peer network client used by `openraft`. Transport is mTLS with
/// TOFU/PKP pinning (`skorekeeper::tls_transport`); each RPC is a plain
/// HTTP/1.1 POST to the peer's `/raft/*` route (the same listener
/// `raft_manager::start_cluster_server` serves), since this crate has no
/// gRPC/proto surface to compile against.
#[derive(Clone)]
struct ClusterNetworkFactory {
    pins: Arc<PinStore>,
    cluster_secret: String,
    identity: Arc<NodeIdentity>,
}

impl openraft::network::RaftNetworkFactory<TypeConfig> for ClusterNetworkFactory {
    type Network = ClusterNetworkClient;

    async fn new_client(&mut self, _target: u64, node: &BasicNode) -> Self::Network {
        ClusterNetworkClient {
            target_addr: node.addr.clone(),
            cluster_secret: self.cluster_secret.clone(),
            pins: self.pins.clone(),
            identity: self.identity.clone(),
        }
    }
}

struct ClusterNetworkClient {
    target_addr: String,
    cluster_secret: String,
    pins: Arc<PinStore>,
    identity: Arc<NodeIdentity>,
}

impl openraft::network::RaftNetwork<TypeConfig> for ClusterNetworkClient {
    async fn append_entries(
        &mut self,
        rpc: openraft::raft::AppendEntriesRequest<TypeConfig>,
        _option: openraft::network::RPCOption,
    ) -> Result<
        openraft::raft::AppendEntriesResponse<u64>,
        openraft::error::RPCError<u64, BasicNode, openraft::error::RaftError<u64>>,
    > {
        self.send_framed("append-entries", &rpc).await
    }

    async fn vote(
        &mut self,
        rpc: openraft::raft::VoteRequest<u64>,
        _option: openraft::network::RPCOption,
    ) -> Result<
        openraft::raft::VoteResponse<u64>,
        openraft::error::RPCError<u64, BasicNode, openraft::error::RaftError<u64>>,
    > {
        self.send_framed("vote", &rpc).await
    }

    async fn install_snapshot(
        &mut self,
        rpc: openraft::raft::InstallSnapshotRequest<TypeConfig>,
        _option: openraft::network::RPCOption,
    ) -> Result<
        openraft::raft::InstallSnapshotResponse<u64>,
        openraft::error::RPCError<
            u64,
            BasicNode,
            openraft::error::RaftError<u64, openraft::error::InstallSnapshotError>,
        >,
    > {
        self.send_framed("install-snapshot", &rpc).await
    }
}

impl ClusterNetworkClient {
    /// Dials the peer over mTLS and POSTs `rpc` as JSON to
    /// `/raft/{rpc_name}`, reading back a `Connection: close` response
    /// and decoding its body as the expected response type.
    async fn send_framed<Req, Resp, E>(
        &self,
        rpc_name: &str,
        rpc: &Req,
    ) -> Result<Resp, openraft::error::RPCError<u64, BasicNode, E>>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
        E: std::error::Error,
    {
        dial_and_post(
            &self.target_addr,
            &self.cluster_secret,
            rpc_name,
            &self.identity,
            &self.pins,
            rpc,
        )
        .await
        .map_err(|e| {
            openraft::error::RPCError::Unreachable(openraft::error::Unreachable::new(
                &openraft::AnyError::error(e),
            ))
        })
    }
}

fn find_header_body_split(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// One-shot mTLS dial to `target_addr`, POSTing `rpc` as JSON to
/// `/raft/{rpc_name}` and decoding the JSON response body. The
/// connection is TOFU/PKP-verified against `pins` (`tls_transport`) and
/// presents this node's own identity as the client certificate, since
/// the peer's `TofuClientVerifier` mandates client auth.
async fn dial_and_post<Req, Resp>(
    target_addr: &str,
    cluster_secret: &str,
    rpc_name: &str,
    identity: &Arc<NodeIdentity>,
    pins: &Arc<PinStore>,
    rpc: &Req,
) -> Result<Resp, String>
where
    Req: serde::Serialize,
    Resp: serde::de::DeserializeOwned,
{
    let body = serde_json::to_vec(rpc).map_err(|e| e.to_string())?;

    let cert_der = identity
        .self_signed_cert_der("skorekeeper-raft-client")
        .map_err(|e| e.to_string())?;
    let key_der = identity.private_key_der();

    let client_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(TofuServerVerifier::new(pins.clone(), None))
        .with_client_auth_cert(
            vec![CertificateDer::from(cert_der)],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der)),
        )
        .map_err(|e| e.to_string())?;

    let host = target_addr.split(':').next().unwrap_or("raft-peer").to_string();
    let server_name =
        ServerName::try_from(host.clone()).map_err(|_| format!("invalid peer host {host}"))?;

    let stream = TcpStream::connect(target_addr)
        .await
        .map_err(|e| e.to_string())?;
    let connector = TlsConnector::from(Arc::new(client_config));
    let mut tls = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| e.to_string())?;

    let request = format!(
        "POST /raft/{rpc_name} HTTP/1.1\r\n\
         Host: {host}\r\n\
         X-Raft-Secret: {cluster_secret}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n",
        body.len()
    );
    tls.write_all(request.as_bytes())
        .await
        .map_err(|e| e.to_string())?;
    tls.write_all(&body).await.map_err(|e| e.to_string())?;

    let mut raw = Vec::new();
    tls.read_to_end(&mut raw).await.map_err(|e| e.to_string())?;

    let split_at = find_header_body_split(&raw).ok_or_else(|| "malformed http response".to_string())?;
    serde_json::from_slice(&raw[split_at..]).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    #[test]
    fn binary_links() {
        assert!(true);
    }
}
