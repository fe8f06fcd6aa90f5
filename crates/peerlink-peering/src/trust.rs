//! Peer trust bundles
//!
//! A bundle is replaced wholesale on every update; it is never patched.
//! During a CA rotation on the exporting side the bundle holds both roots,
//! and a peer certificate is accepted if it chains to either.

use std::sync::Arc;

use dashmap::DashMap;
use peerlink_common::{Error, Result};
use peerlink_pki::{fingerprint_pem, parse_pem, verify_against_any, VerificationResult, MAX_ROOTS};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::record::PeeringRecord;

/// CA roots trusted for one peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustBundle {
    /// Peering the bundle belongs to
    pub peer_id: String,
    /// Roots as PEM, newest last
    pub roots: Vec<String>,
    /// SHA-256 fingerprint of the newest root
    pub active_root_id: String,
}

/// Check that a root set has 1..=2 parseable certificates
pub fn validate_roots(roots: &[String]) -> Result<()> {
    if roots.is_empty() {
        return Err(Error::invalid_trust_bundle("root set is empty"));
    }
    if roots.len() > MAX_ROOTS {
        return Err(Error::invalid_trust_bundle(format!(
            "root set has {} roots, at most {MAX_ROOTS} are allowed",
            roots.len()
        )));
    }
    for (idx, root) in roots.iter().enumerate() {
        parse_pem(root)
            .map_err(|e| Error::invalid_trust_bundle(format!("root {idx}: {e}")))?;
    }
    Ok(())
}

impl TrustBundle {
    /// Build a bundle from a validated root set
    pub fn new(peer_id: impl Into<String>, roots: Vec<String>) -> Result<Self> {
        validate_roots(&roots)?;
        let active_root_id = Self::fingerprint_newest(&roots)?;
        Ok(Self {
            peer_id: peer_id.into(),
            roots,
            active_root_id,
        })
    }

    /// View over a peering record's roots
    pub fn from_record(record: &PeeringRecord) -> Result<Self> {
        Self::new(record.id.clone(), record.peer_ca_roots.clone())
    }

    fn fingerprint_newest(roots: &[String]) -> Result<String> {
        let newest = roots
            .last()
            .ok_or_else(|| Error::invalid_trust_bundle("root set is empty"))?;
        fingerprint_pem(newest).map_err(|e| Error::invalid_trust_bundle(e.to_string()))
    }

    /// Replace the root set wholesale
    ///
    /// On error the bundle is left unchanged.
    pub fn apply_root_update(&mut self, roots: Vec<String>) -> Result<()> {
        validate_roots(&roots)?;
        self.active_root_id = Self::fingerprint_newest(&roots)?;
        self.roots = roots;
        Ok(())
    }

    /// Verify a DER certificate against any root in the bundle
    pub fn verify(&self, cert_der: &[u8]) -> Result<VerificationResult> {
        verify_against_any(cert_der, self.roots.iter().map(String::as_str))
            .map_err(|e| Error::invalid_trust_bundle(e.to_string()))
    }

    /// Verify a PEM certificate against any root in the bundle
    pub fn verify_pem(&self, cert_pem: &str) -> Result<VerificationResult> {
        let der = parse_pem(cert_pem).map_err(|e| Error::protocol(e.to_string()))?;
        self.verify(&der)
    }
}

type BundleSender = watch::Sender<Option<Arc<TrustBundle>>>;

/// Publishes the current bundle of every peer to data-plane consumers
///
/// Consumers subscribe per peering and see `None` once the peering is gone.
#[derive(Default)]
pub struct TrustBundleReconciler {
    bundles: DashMap<String, BundleSender>,
}

impl TrustBundleReconciler {
    /// Create an empty reconciler
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, peering_id: &str) -> BundleSender {
        self.bundles
            .entry(peering_id.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .clone()
    }

    /// Publish a new bundle for a peering
    pub fn publish(&self, peering_id: &str, bundle: TrustBundle) {
        let tx = self.sender(peering_id);
        let changed = tx.send_if_modified(|current| {
            if current.as_deref() == Some(&bundle) {
                return false;
            }
            info!(
                peering_id,
                roots = bundle.roots.len(),
                active_root = %bundle.active_root_id,
                "trust bundle updated"
            );
            *current = Some(Arc::new(bundle));
            true
        });
        if !changed {
            debug!(peering_id, "trust bundle unchanged");
        }
    }

    /// Subscribe to bundle changes for a peering
    pub fn subscribe(&self, peering_id: &str) -> watch::Receiver<Option<Arc<TrustBundle>>> {
        self.sender(peering_id).subscribe()
    }

    /// Current bundle of a peering
    pub fn current(&self, peering_id: &str) -> Option<Arc<TrustBundle>> {
        self.bundles
            .get(peering_id)
            .and_then(|tx| tx.borrow().clone())
    }

    /// Withdraw a peering's bundle
    pub fn remove(&self, peering_id: &str) {
        if let Some((_, tx)) = self.bundles.remove(peering_id) {
            tx.send_replace(None);
        }
    }

    /// Verify a peer certificate for a peering
    pub fn verify(&self, peering_id: &str, cert_der: &[u8]) -> Result<VerificationResult> {
        let bundle = self
            .current(peering_id)
            .ok_or_else(|| Error::not_found(peering_id))?;
        bundle.verify(cert_der)
    }
}
