//! PKI for cluster peering
//!
//! Each cluster runs its own CA. The exporting side ships its CA roots to
//! the importing side (in the peering token, then over the replication
//! stream), and the importing side validates the exporter's mesh-gateway and
//! server certificates against them.
//!
//! # CA Rotation
//!
//! A rotation never swaps one root for another in a single step:
//!
//! 1. `{R1}`: only the old root is trusted
//! 2. `{R1, R2}`: both roots are trusted while leaves are re-issued from R2
//! 3. `{R2}`: the old root is retired
//!
//! [`RootRotation`] drives these steps on the exporting side; verification
//! on the importing side accepts a certificate chaining to ANY root.

#![warn(missing_docs)]

mod ca;
mod verify;

pub use ca::{CertificateAuthority, LeafCertificate, RootRotation};
pub use verify::{verify_against_any, verify_cert, VerificationResult};

use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_parser::prelude::*;

/// Default validity period for CA certificates (10 years)
pub const CA_VALIDITY_YEARS: i64 = 10;

/// Default validity period for leaf certificates (1 year)
pub const CERT_VALIDITY_YEARS: i64 = 1;

/// Maximum number of concurrently trusted roots per peer
pub const MAX_ROOTS: usize = 2;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Rotation requested in a state that does not allow it
    #[error("invalid rotation: {0}")]
    InvalidRotation(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Compute certificate validity period from now
fn compute_validity(years: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let not_after = now + ::time::Duration::days(years * 365);
    (now, not_after)
}

/// Current time as a Unix timestamp
fn unix_now() -> i64 {
    ::time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Hex SHA-256 fingerprint of DER bytes
pub fn fingerprint(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Hex SHA-256 fingerprint of a PEM certificate
pub fn fingerprint_pem(pem_data: &str) -> Result<String> {
    Ok(fingerprint(&parse_pem(pem_data)?))
}

/// Validity and identity of a certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
    /// Subject common name
    pub common_name: String,
    /// Whether the basic constraints mark it as a CA
    pub is_ca: bool,
}

impl CertificateInfo {
    /// Parse certificate info from PEM-encoded certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    /// Parse certificate info from DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        Ok(Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            common_name,
            is_ca: cert.is_ca(),
        })
    }

    /// Check if certificate has expired
    pub fn is_expired(&self) -> bool {
        self.not_after <= unix_now()
    }

    /// Seconds remaining until certificate expires
    pub fn remaining_secs(&self) -> i64 {
        self.not_after - unix_now()
    }
}
