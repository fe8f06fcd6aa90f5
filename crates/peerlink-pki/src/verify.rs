//! Certificate chain verification against peer roots

use x509_parser::prelude::*;

use crate::{parse_pem, unix_now, PkiError, Result};

/// Outcome of verifying a presented certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    /// Whether the certificate is valid
    pub valid: bool,
    /// Subject common name of the presented certificate
    pub common_name: String,
    /// Reason if invalid
    pub reason: Option<String>,
}

impl VerificationResult {
    fn rejected(common_name: String, reason: &str) -> Self {
        Self {
            valid: false,
            common_name,
            reason: Some(reason.to_string()),
        }
    }
}

/// Verify that `cert_der` was signed by `root_pem` and is within its validity window
///
/// Returns `Err` only when either certificate cannot be parsed; a signature
/// or time mismatch is an `Ok` result with `valid: false`.
pub fn verify_cert(cert_der: &[u8], root_pem: &str) -> Result<VerificationResult> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

    let root_der = parse_pem(root_pem)?;
    let (_, root) = X509Certificate::from_der(&root_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse root: {}", e)))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or("")
        .to_string();

    if cert.verify_signature(Some(root.public_key())).is_err() {
        return Ok(VerificationResult::rejected(
            common_name,
            "signature verification failed",
        ));
    }

    let now = unix_now();
    if now < cert.validity().not_before.timestamp() {
        return Ok(VerificationResult::rejected(
            common_name,
            "certificate not yet valid",
        ));
    }
    if now > cert.validity().not_after.timestamp() {
        return Ok(VerificationResult::rejected(common_name, "certificate expired"));
    }

    Ok(VerificationResult {
        valid: true,
        common_name,
        reason: None,
    })
}

/// Verify against a set of roots; valid if ANY root accepts the certificate
pub fn verify_against_any<'a, I>(cert_der: &[u8], roots: I) -> Result<VerificationResult>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut last = None;
    for root in roots {
        let result = verify_cert(cert_der, root)?;
        if result.valid {
            return Ok(result);
        }
        last = Some(result);
    }
    Ok(match last {
        Some(result) => VerificationResult {
            reason: Some("certificate not signed by any trusted root".to_string()),
            ..result
        },
        None => VerificationResult::rejected(String::new(), "no trusted roots"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CertificateAuthority;

    fn ca(name: &str) -> CertificateAuthority {
        CertificateAuthority::new(name, "test.peerlink.local").expect("CA creation should succeed")
    }

    fn leaf_der(ca: &CertificateAuthority) -> Vec<u8> {
        ca.issue_leaf("gateway.east.peering.test", &[])
            .and_then(|leaf| leaf.cert_der())
            .expect("leaf issuance should succeed")
    }

    #[test]
    fn test_signed_leaf_verifies() {
        let ca = ca("east");
        let result = verify_cert(&leaf_der(&ca), ca.cert_pem()).unwrap();
        assert!(result.valid);
        assert_eq!(result.common_name, "gateway.east.peering.test");
        assert!(result.reason.is_none());
    }

    #[test]
    fn test_cross_ca_signature_is_rejected() {
        let ca1 = ca("one");
        let ca2 = ca("two");
        let result = verify_cert(&leaf_der(&ca1), ca2.cert_pem()).unwrap();
        assert!(!result.valid);
        assert_eq!(
            result.reason.as_deref(),
            Some("signature verification failed")
        );
    }

    #[test]
    fn test_expired_leaf_is_rejected() {
        use rcgen::{CertificateParams, Issuer, KeyPair};

        let ca = ca("east");
        let mut params = CertificateParams::new(vec!["old.test".to_string()]).unwrap();
        params.not_before = ::time::OffsetDateTime::now_utc() - ::time::Duration::days(10);
        params.not_after = ::time::OffsetDateTime::now_utc() - ::time::Duration::days(1);

        let key = KeyPair::generate().unwrap();
        let ca_key = KeyPair::from_pem(ca.key_pem()).unwrap();
        let issuer = Issuer::from_ca_cert_pem(ca.cert_pem(), &ca_key).unwrap();
        let cert = params.signed_by(&key, &issuer).unwrap();

        let result = verify_cert(cert.der(), ca.cert_pem()).unwrap();
        assert!(!result.valid);
        assert_eq!(result.reason.as_deref(), Some("certificate expired"));
    }

    #[test]
    fn test_garbage_certificate_is_an_error() {
        let ca = ca("east");
        assert!(verify_cert(b"not der", ca.cert_pem()).is_err());
    }

    #[test]
    fn test_any_root_in_set_accepts() {
        let r1 = ca("r1");
        let r2 = ca("r2");
        let leaf = leaf_der(&r2);

        let both = verify_against_any(&leaf, [r1.cert_pem(), r2.cert_pem()]).unwrap();
        assert!(both.valid);

        let only_r1 = verify_against_any(&leaf, [r1.cert_pem()]).unwrap();
        assert!(!only_r1.valid);
        assert_eq!(
            only_r1.reason.as_deref(),
            Some("certificate not signed by any trusted root")
        );
    }

    #[test]
    fn test_empty_root_set_rejects() {
        let leaf = leaf_der(&ca("east"));
        let result = verify_against_any(&leaf, std::iter::empty()).unwrap();
        assert!(!result.valid);
    }
}
