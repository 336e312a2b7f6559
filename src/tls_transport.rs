//! mTLS transport with Trust-On-First-Use + public-key pinning peer
//! authentication (spec.md §4.6).
//!
//! Rather than a CA, every peer connection is authenticated against a
//! pin store: the first time a peer's certificate is seen its public
//! key is recorded (TOFU), and every subsequent handshake from that
//! `nodeId` must present the same key (PKP) or the handshake is
//! rejected. Built on rustls 0.22's "dangerous" custom verifier API,
//! following the same pattern `rustls::client::danger::ServerCertVerifier`
//! examples use for certificate pinning.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{info, warn};

fn pubkey_fingerprint(cert_der: &[u8]) -> String {
    hex::encode(Sha256::digest(cert_der))
}

/// The accepted-peers pin store: `nodeId -> sha256(certDER)`. Shared
/// between the TLS client and server verifiers so a peer only ever
/// needs to be trusted once, regardless of which side dials.
#[derive(Default)]
pub struct PinStore {
    pins: RwLock<HashMap<String, String>>,
}

impl PinStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Accepts `fingerprint` for `node_id` if no pin exists yet (TOFU),
    /// or verifies it matches the existing pin (PKP). Returns `false` on
    /// a pin mismatch — the connection must be rejected.
    pub fn verify_or_pin(&self, node_id: &str, fingerprint: &str) -> bool {
        let mut pins = self.pins.write().unwrap();
        match pins.get(node_id) {
            Some(existing) => existing == fingerprint,
            None => {
                info!(node_id, fingerprint, "pinning new peer (TOFU)");
                pins.insert(node_id.to_string(), fingerprint.to_string());
                true
            }
        }
    }

    pub fn is_known(&self, node_id: &str) -> bool {
        self.pins.read().unwrap().contains_key(node_id)
    }

    pub fn remove(&self, node_id: &str) {
        self.pins.write().unwrap().remove(node_id);
    }
}

/// A `ServerCertVerifier` that skips CA-chain validation entirely and
/// instead checks the presented certificate's fingerprint against the
/// pin store, keyed by the `nodeId` the caller expects to be dialing.
#[derive(Debug)]
pub struct TofuServerVerifier {
    pins: Arc<PinStore>,
    expected_node_id: Mutex<Option<String>>,
}

impl TofuServerVerifier {
    pub fn new(pins: Arc<PinStore>, expected_node_id: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            pins,
            expected_node_id: Mutex::new(expected_node_id),
        })
    }
}

impl ServerCertVerifier for TofuServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let fp = pubkey_fingerprint(end_entity.as_ref());
        let expected = self.expected_node_id.lock().unwrap().clone();
        let node_id = expected.unwrap_or_else(|| fp.clone());
        if self.pins.verify_or_pin(&node_id, &fp) {
            Ok(ServerCertVerified::assertion())
        } else {
            warn!(node_id, "TLS pin mismatch, rejecting peer");
            Err(rustls::Error::General("peer key pin mismatch".into()))
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ED25519,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
        ]
    }
}

/// Server-side mirror of [`TofuServerVerifier`]: accepts any client
/// certificate whose fingerprint is already pinned, or pins it on first
/// contact. Unlike `WebPkiClientVerifier`, this never consults a CA.
#[derive(Debug)]
pub struct TofuClientVerifier {
    pins: Arc<PinStore>,
    root_hint: Arc<rustls::RootCertStore>,
}

impl TofuClientVerifier {
    pub fn new(pins: Arc<PinStore>) -> Arc<Self> {
        Arc::new(Self {
            pins,
            root_hint: Arc::new(rustls::RootCertStore::empty()),
        })
    }
}

impl ClientCertVerifier for TofuClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let fp = pubkey_fingerprint(end_entity.as_ref());
        if self.pins.verify_or_pin(&fp, &fp) {
            Ok(ClientCertVerified::assertion())
        } else {
            Err(rustls::Error::General("client key pin mismatch".into()))
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![SignatureScheme::ED25519]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

/// Gate used by the accept loop: incoming connections are refused until
/// the node has finished loading its identity and pin store from disk,
/// mirroring the teacher's readiness-gated health server startup.
pub struct TlsReadyGate {
    notify: Notify,
    ready: std::sync::atomic::AtomicBool,
}

impl TlsReadyGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            notify: Notify::new(),
            ready: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, std::sync::atomic::Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub async fn wait_ready(&self) {
        if self.ready.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        self.notify.notified().await;
    }

    /// Non-blocking variant used by the stream builders, which would
    /// rather 503 a too-early request than stall it.
    pub fn is_ready(&self) -> bool {
        self.ready.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Uses `WebPkiClientVerifier` only to satisfy rustls's `ServerConfig`
/// builder signature when no client auth is configured; the cluster
/// transport always builds with [`TofuClientVerifier`] instead.
pub fn empty_client_verifier() -> Arc<dyn ClientCertVerifier> {
    WebPkiClientVerifier::no_client_auth()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_contact_pins_the_peer() {
        let store = PinStore::new();
        assert!(store.verify_or_pin("node-a", "fp1"));
        assert!(store.is_known("node-a"));
    }

    #[test]
    fn matching_fingerprint_on_repeat_contact_succeeds() {
        let store = PinStore::new();
        store.verify_or_pin("node-a", "fp1");
        assert!(store.verify_or_pin("node-a", "fp1"));
    }

    #[test]
    fn mismatched_fingerprint_is_rejected() {
        let store = PinStore::new();
        store.verify_or_pin("node-a", "fp1");
        assert!(!store.verify_or_pin("node-a", "fp2"));
    }

    #[test]
    fn removing_a_pin_allows_re_tofu() {
        let store = PinStore::new();
        store.verify_or_pin("node-a", "fp1");
        store.remove("node-a");
        assert!(store.verify_or_pin("node-a", "fp2"));
    }

    #[tokio::test]
    async fn ready_gate_unblocks_waiters() {
        let gate = TlsReadyGate::new();
        assert!(!gate.is_ready());
        gate.mark_ready();
        gate.wait_ready().await;
        assert!(gate.is_ready());
    }
}
