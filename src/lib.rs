//! `skorekeeper`: a replicated, cluster-aware backend for live game
//! scoring. Raft-consensus core plus per-game cooperative workers,
//! built the way the team's earlier load-testing tool structured its
//! own long-running node process.

pub mod codec;
pub mod config;
pub mod entities;
pub mod errors;
pub mod fsm;
pub mod http_api;
pub mod hub;
pub mod identity;
pub mod keyring;
pub mod metrics_http;
pub mod metrics_store;
pub mod raft_manager;
pub mod registry;
pub mod snapshot;
pub mod store;
pub mod tls_transport;
pub mod user_index_store;
