//! Node identity (spec.md §4.6, C6): an ed25519 keypair minted once with
//! `rcgen`, persisted encrypted under the node's master key, and a
//! short-lived self-signed certificate derived from it for each TLS
//! handshake (ground: `nexi-lab-nexus/rust/raft` generates its node
//! certs the same way — `rcgen::KeyPair::generate(&PKCS_ED25519)` plus
//! a self-signed `Certificate`).

use crate::errors::RaftManagerError;
use crate::keyring::KeyRing;
use rcgen::{CertificateParams, DistinguishedName, KeyPair, PKCS_ED25519};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// A node's durable ed25519 identity: the private key (kept in memory
/// only, persisted encrypted), its public key, and the derived
/// `nodeId` used throughout the cluster (spec.md §3 `NodeMeta.nodeId`).
pub struct NodeIdentity {
    pub node_id: String,
    key_pair: KeyPair,
}

impl NodeIdentity {
    /// Derives a `nodeId` as the hex of the first 16 bytes of
    /// `sha256(public_key_der)` — short enough to log, long enough that
    /// collisions across a real cluster are not a practical concern.
    fn derive_node_id(public_key_der: &[u8]) -> String {
        let digest = Sha256::digest(public_key_der);
        hex::encode(&digest[..16])
    }

    fn generate() -> Result<Self, RaftManagerError> {
        let key_pair =
            KeyPair::generate(&PKCS_ED25519).map_err(|e| RaftManagerError::Tls(e.to_string()))?;
        let node_id = Self::derive_node_id(&key_pair.public_key_der());
        Ok(Self { node_id, key_pair })
    }

    /// Loads the identity sealed at `path` under `keyring`, or mints and
    /// persists a fresh one if no identity exists yet.
    pub fn load_or_create(
        path: impl Into<PathBuf>,
        keyring: Arc<KeyRing>,
    ) -> Result<Self, RaftManagerError> {
        let path = path.into();
        if path.exists() {
            let bytes = std::fs::read(&path).map_err(|e| RaftManagerError::Tls(e.to_string()))?;
            let sealed: crate::keyring::SealedRecord = serde_json::from_slice(&bytes)
                .map_err(|e| RaftManagerError::Tls(e.to_string()))?;
            let der = keyring
                .open(&sealed)
                .map_err(|e| RaftManagerError::Tls(e.to_string()))?;
            let key_pair =
                KeyPair::from_der(&der).map_err(|e| RaftManagerError::Tls(e.to_string()))?;
            let node_id = Self::derive_node_id(&key_pair.public_key_der());
            info!(node_id = %node_id, "loaded existing node identity");
            return Ok(Self { node_id, key_pair });
        }

        let identity = Self::generate()?;
        let sealed = keyring
            .seal(&identity.key_pair.serialize_der())
            .map_err(|e| RaftManagerError::Tls(e.to_string()))?;
        let bytes =
            serde_json::to_vec(&sealed).map_err(|e| RaftManagerError::Tls(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RaftManagerError::Tls(e.to_string()))?;
        }
        std::fs::write(&path, bytes).map_err(|e| RaftManagerError::Tls(e.to_string()))?;
        info!(node_id = %identity.node_id, "minted new node identity");
        Ok(identity)
    }

    pub fn public_key_der(&self) -> Vec<u8> {
        self.key_pair.public_key_der()
    }

    pub fn public_key_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(self.public_key_der())
    }

    /// Builds a fresh self-signed certificate bound to this node's
    /// long-lived key. TOFU peers pin on the public key, not the cert,
    /// so minting a new cert per process restart (or even per
    /// connection) doesn't break existing pins (spec.md §4.6).
    pub fn self_signed_cert_der(&self, subject_name: &str) -> Result<Vec<u8>, RaftManagerError> {
        let mut params = CertificateParams::new(vec![subject_name.to_string()]);
        params.distinguished_name = DistinguishedName::new();
        params.alg = &PKCS_ED25519;
        params.key_pair = Some(
            KeyPair::from_der(&self.key_pair.serialize_der())
                .map_err(|e| RaftManagerError::Tls(e.to_string()))?,
        );
        let cert = rcgen::Certificate::from_params(params)
            .map_err(|e| RaftManagerError::Tls(e.to_string()))?;
        cert.serialize_der()
            .map_err(|e| RaftManagerError::Tls(e.to_string()))
    }

    pub fn private_key_der(&self) -> Vec<u8> {
        self.key_pair.serialize_der()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring() -> Arc<KeyRing> {
        let path = tempfile::tempdir().unwrap().keep().join("keyring.json");
        Arc::new(KeyRing::load_or_create(path).unwrap())
    }

    #[test]
    fn node_id_is_stable_across_reload() {
        let dir = tempfile::tempdir().unwrap().keep();
        let path = dir.join("identity.json");
        let ring = ring();

        let first = NodeIdentity::load_or_create(&path, ring.clone()).unwrap();
        let second = NodeIdentity::load_or_create(&path, ring).unwrap();
        assert_eq!(first.node_id, second.node_id);
    }

    #[test]
    fn self_signed_cert_is_generated() {
        let ring = ring();
        let identity =
            NodeIdentity::load_or_create(tempfile::tempdir().unwrap().keep().join("id.json"), ring)
                .unwrap();
        let cert = identity.self_signed_cert_der("node.local").unwrap();
        assert!(!cert.is_empty());
    }

    #[test]
    fn different_nodes_get_different_ids() {
        let ring_a = ring();
        let ring_b = ring();
        let a = NodeIdentity::load_or_create(
            tempfile::tempdir().unwrap().keep().join("a.json"),
            ring_a,
        )
        .unwrap();
        let b = NodeIdentity::load_or_create(
            tempfile::tempdir().unwrap().keep().join("b.json"),
            ring_b,
        )
        .unwrap();
        assert_ne!(a.node_id, b.node_id);
    }
}
