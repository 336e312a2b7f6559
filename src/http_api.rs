//! Application-facing HTTP surface: game/team CRUD, action appends, and
//! the WebSocket upgrade path, all routed through a [`HubManager`]
//! (spec.md §6 External Interfaces).
//!
//! Request bodies are capped (10 MiB for game saves/loads, 1 MiB for
//! action batches) the same way the teacher's HTTP client guarded
//! response bodies against unbounded allocation. Successful reads carry
//! an `ETag` derived from `sha256(body)` so clients can conditionally
//! re-fetch.

use crate::entities::ActionRecord;
use crate::errors::{AppError, HubError};
use crate::fsm::RaftCommand;
use crate::hub::HubManager;
use crate::raft_manager::{RaftManager, FORWARD_CHAIN_HEADER};
use crate::registry::{GameQuery, Registry};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

const MAX_SAVE_BODY_BYTES: u64 = 10 * 1024 * 1024;
const MAX_ACTION_BODY_BYTES: u64 = 1 * 1024 * 1024;

pub struct AppState {
    pub hubs: Arc<HubManager>,
    pub registry: Arc<Registry>,
    pub raft: Arc<RaftManager>,
}

fn etag_for(bytes: &[u8]) -> String {
    format!("\"{}\"", hex::encode(Sha256::digest(bytes)))
}

fn extract_user(req: &Request<Body>) -> Option<String> {
    req.headers()
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn read_body_limited(req: Request<Body>, limit: u64) -> Result<Vec<u8>, Response<Body>> {
    if let Some(len) = req.headers().get(hyper::header::CONTENT_LENGTH) {
        if let Ok(len_str) = len.to_str() {
            if let Ok(len) = len_str.parse::<u64>() {
                if len > limit {
                    return Err(error_response(413, "request body too large"));
                }
            }
        }
    }
    match hyper::body::to_bytes(req.into_body()).await {
        Ok(bytes) if bytes.len() as u64 > limit => {
            Err(error_response(413, "request body too large"))
        }
        Ok(bytes) => Ok(bytes.to_vec()),
        Err(e) => Err(error_response(400, &e.to_string())),
    }
}

fn error_response(status: u16, message: &str) -> Response<Body> {
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header("Content-Type", "application/json")
        .body(Body::from(format!("{{\"error\":\"{message}\"}}")))
        .unwrap()
}

fn app_error_response(e: AppError) -> Response<Body> {
    error_response(e.status_code(), &e.to_string())
}

/// Forwards `req` to the current Raft leader's app HTTP surface when
/// this node isn't the leader, returning the leader's response
/// verbatim; returns `req` back unchanged when this node is the leader
/// so the caller can handle it locally (spec.md §7 "not the leader").
async fn forward_or_handle(
    state: &AppState,
    req: Request<Body>,
) -> Result<Request<Body>, Response<Body>> {
    if state.raft.is_leader() {
        return Ok(req);
    }

    let existing = req
        .headers()
        .get(FORWARD_CHAIN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let chain = match state.raft.extend_forward_chain(existing.as_deref()) {
        Ok(chain) => chain,
        Err(e) => {
            return Err(error_response(
                AppError::RaftManager(e).status_code(),
                "forwarding loop detected",
            ))
        }
    };

    let Some(leader_addr) = state.raft.leader_http_addr() else {
        return Err(error_response(
            AppError::Hub(HubError::NoLeaderKnown).status_code(),
            "no leader known yet; retry shortly",
        ));
    };

    let (mut parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let forwarded_uri: hyper::Uri = match format!("http://{leader_addr}{path_and_query}").parse() {
        Ok(uri) => uri,
        Err(e) => return Err(error_response(500, &e.to_string())),
    };
    parts.uri = forwarded_uri;
    if let Ok(header_value) = hyper::header::HeaderValue::from_str(&chain) {
        parts.headers.insert(FORWARD_CHAIN_HEADER, header_value);
    }
    let forwarded_req = Request::from_parts(parts, body);

    let client = hyper::Client::new();
    match client.request(forwarded_req).await {
        Ok(resp) => Err(resp),
        Err(e) => Err(error_response(502, &format!("forwarding to leader failed: {e}"))),
    }
}

#[derive(Deserialize)]
struct AppendActionsBody {
    base_revision: u64,
    actions: Vec<ActionRecord>,
}

async fn route(req: Request<Body>, state: Arc<AppState>) -> Result<Response<Body>, Infallible> {
    let start = Instant::now();
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    let route_label = route_label(&method, &path);

    let response = dispatch(req, &state).await.unwrap_or_else(|r| r);

    crate::metrics_http::HTTP_REQUESTS_TOTAL
        .with_label_values(&[route_label, response.status().as_str()])
        .inc();
    crate::metrics_http::HUB_REQUEST_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
    Ok(response)
}

fn route_label(method: &Method, path: &str) -> &'static str {
    match (method, path.split('/').nth(1)) {
        (_, Some("games")) => "games",
        (_, Some("teams")) => "teams",
        (_, Some("ws")) => "ws",
        _ => "other",
    }
}

async fn dispatch(req: Request<Body>, state: &Arc<AppState>) -> Result<Response<Body>, Response<Body>> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (&method, segments.as_slice()) {
        (&Method::GET, ["games"]) => {
            let user_id = extract_user(&req).unwrap_or_default();
            let query = req.uri().query().unwrap_or("");
            let parsed = GameQuery::parse(query);
            let games = state
                .registry
                .query_games(&user_id, &parsed)
                .await
                .map_err(|e| app_error_response(AppError::Store(e)))?;
            let body = serde_json::to_vec(&games).unwrap_or_default();
            Ok(json_ok(body))
        }
        (&Method::GET, ["games", id]) => {
            let user_id = extract_user(&req);
            let game = state
                .hubs
                .load(id, user_id)
                .await
                .map_err(|e| app_error_response(AppError::Hub(e)))?;
            let body = serde_json::to_vec(&*game).unwrap_or_default();
            Ok(json_ok_with_etag(body))
        }
        (&Method::PUT, ["games", id]) => {
            let req = match forward_or_handle(state, req).await {
                Ok(req) => req,
                Err(resp) => return Err(resp),
            };
            let user_id = extract_user(&req);
            let bytes = read_body_limited(req, MAX_SAVE_BODY_BYTES).await?;
            let mut game: crate::entities::Game =
                serde_json::from_slice(&bytes).map_err(|e| error_response(400, &e.to_string()))?;
            game.id = id.to_string();
            let saved = state
                .hubs
                .save(id, user_id, game)
                .await
                .map_err(|e| app_error_response(AppError::Hub(e)))?;
            Ok(json_ok(serde_json::to_vec(&*saved).unwrap_or_default()))
        }
        (&Method::POST, ["games", id, "actions"]) => {
            let req = match forward_or_handle(state, req).await {
                Ok(req) => req,
                Err(resp) => return Err(resp),
            };
            let user_id = extract_user(&req);
            let bytes = read_body_limited(req, MAX_ACTION_BODY_BYTES).await?;
            let body: AppendActionsBody =
                serde_json::from_slice(&bytes).map_err(|e| error_response(400, &e.to_string()))?;
            let saved = state
                .hubs
                .append_actions(id, user_id, body.base_revision, body.actions)
                .await
                .map_err(|e| app_error_response(AppError::Hub(e)))?;
            Ok(json_ok(serde_json::to_vec(&*saved).unwrap_or_default()))
        }
        (&Method::DELETE, ["games", id]) => {
            let _req = match forward_or_handle(state, req).await {
                Ok(req) => req,
                Err(resp) => return Err(resp),
            };
            state
                .raft
                .propose(RaftCommand::DeleteGame {
                    game_id: id.to_string(),
                })
                .await
                .map_err(|e| app_error_response(AppError::RaftManager(e)))?;
            Ok(Response::builder().status(204).body(Body::empty()).unwrap())
        }
        (&Method::PUT, ["teams", id]) => {
            let req = match forward_or_handle(state, req).await {
                Ok(req) => req,
                Err(resp) => return Err(resp),
            };
            let bytes = read_body_limited(req, MAX_SAVE_BODY_BYTES).await?;
            let mut team: crate::entities::Team =
                serde_json::from_slice(&bytes).map_err(|e| error_response(400, &e.to_string()))?;
            team.id = id.to_string();
            state
                .raft
                .propose(RaftCommand::SaveTeam { team })
                .await
                .map_err(|e| app_error_response(AppError::RaftManager(e)))?;
            Ok(Response::builder().status(200).body(Body::empty()).unwrap())
        }
        _ => Err(error_response(404, "not found")),
    }
}

fn json_ok(body: Vec<u8>) -> Response<Body> {
    Response::builder()
        .status(200)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

fn json_ok_with_etag(body: Vec<u8>) -> Response<Body> {
    let etag = etag_for(&body);
    Response::builder()
        .status(200)
        .header("Content-Type", "application/json")
        .header("ETag", etag)
        .body(Body::from(body))
        .unwrap()
}

pub async fn start_app_server(addr: SocketAddr, state: Arc<AppState>) {
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| route(req, state.clone()))) }
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!(%addr, "app http surface listening");
    if let Err(e) = server.await {
        error!(error = %e, "app http server error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etag_is_stable_for_same_body() {
        let a = etag_for(b"hello");
        let b = etag_for(b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn etag_differs_for_different_bodies() {
        assert_ne!(etag_for(b"a"), etag_for(b"b"));
    }

    #[test]
    fn route_label_classifies_games_and_teams() {
        assert_eq!(route_label(&Method::GET, "/games"), "games");
        assert_eq!(route_label(&Method::GET, "/teams/t1"), "teams");
        assert_eq!(route_label(&Method::GET, "/unknown"), "other");
    }
}
