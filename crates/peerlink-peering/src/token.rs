//! Peering token codec
//!
//! A token is `base64(JSON envelope)`. The envelope carries the JSON payload
//! verbatim plus its SHA-256 digest, so a token that was truncated or edited
//! in transit is rejected as malformed instead of producing a half-valid
//! peering. The dialing side has no key to check a signature against before
//! the first handshake; the establishment secret authenticates it instead.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use peerlink_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Decoded peering token
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeeringToken {
    /// Accepting side's peering ID, presented back when dialing
    pub peer_id: String,
    /// TLS server name of the accepting cluster's servers
    pub server_name: String,
    /// CA roots as PEM at issuance, newest last
    pub ca_roots: Vec<String>,
    /// Server addresses at issuance; a bootstrap hint only
    pub server_addresses: Vec<String>,
    /// Single-use credential for the first stream
    pub establishment_secret: String,
    /// Optional expiry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for PeeringToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeeringToken")
            .field("peer_id", &self.peer_id)
            .field("server_name", &self.server_name)
            .field("ca_roots", &self.ca_roots.len())
            .field("server_addresses", &self.server_addresses)
            .field("establishment_secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    payload: String,
    digest: String,
}

fn digest_hex(payload: &str) -> String {
    Sha256::digest(payload.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

impl PeeringToken {
    /// Build a token for the accepting peering `peering_id`
    pub fn issue(
        peering_id: &str,
        server_name: &str,
        ca_roots: &[String],
        server_addresses: &[String],
        establishment_secret: &str,
    ) -> Self {
        Self {
            peer_id: peering_id.to_string(),
            server_name: server_name.to_string(),
            ca_roots: ca_roots.to_vec(),
            server_addresses: server_addresses.to_vec(),
            establishment_secret: establishment_secret.to_string(),
            expires_at: None,
        }
    }

    /// Set an expiry
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Encode to the opaque string handed to the other cluster's operator
    pub fn encode(&self) -> Result<String> {
        self.validate()?;
        let payload = serde_json::to_string(self)
            .map_err(|e| Error::internal_with_context("token", e.to_string()))?;
        let envelope = Envelope {
            digest: digest_hex(&payload),
            payload,
        };
        let bytes = serde_json::to_vec(&envelope)
            .map_err(|e| Error::internal_with_context("token", e.to_string()))?;
        Ok(STANDARD.encode(bytes))
    }

    /// Decode and check a token against the current time
    pub fn decode(token: &str) -> Result<Self> {
        Self::decode_at(token, Utc::now())
    }

    /// Decode and check a token against `now`
    pub fn decode_at(token: &str, now: DateTime<Utc>) -> Result<Self> {
        let bytes = STANDARD
            .decode(token.trim())
            .map_err(|e| Error::malformed_token(format!("invalid base64: {e}")))?;
        let envelope: Envelope = serde_json::from_slice(&bytes)
            .map_err(|e| Error::malformed_token(format!("invalid envelope: {e}")))?;
        if digest_hex(&envelope.payload) != envelope.digest {
            return Err(Error::malformed_token("integrity digest mismatch"));
        }
        let decoded: PeeringToken = serde_json::from_str(&envelope.payload)
            .map_err(|e| Error::malformed_token(format!("invalid payload: {e}")))?;
        decoded.validate()?;

        if let Some(expires_at) = decoded.expires_at {
            if expires_at <= now {
                return Err(Error::ExpiredToken {
                    expired_at: expires_at,
                });
            }
        }
        Ok(decoded)
    }

    fn validate(&self) -> Result<()> {
        let missing = if self.peer_id.is_empty() {
            Some("peer_id")
        } else if self.server_name.is_empty() {
            Some("server_name")
        } else if self.ca_roots.is_empty() {
            Some("ca_roots")
        } else if self.server_addresses.is_empty() {
            Some("server_addresses")
        } else if self.establishment_secret.is_empty() {
            Some("establishment_secret")
        } else {
            None
        };
        match missing {
            Some(field) => Err(Error::malformed_token(format!("missing {field}"))),
            None => Ok(()),
        }
    }
}
