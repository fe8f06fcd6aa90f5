//! Certificate authority and root rotation

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use zeroize::Zeroizing;

use crate::{compute_validity, parse_pem, PkiError, Result, CA_VALIDITY_YEARS, CERT_VALIDITY_YEARS};

/// A cluster's peering CA
#[derive(Clone)]
pub struct CertificateAuthority {
    /// CA key pair as PEM (KeyPair isn't Clone, so it's re-parsed per signing)
    key_pem: Zeroizing<String>,
    /// PEM-encoded CA certificate for distribution to peers
    cert_pem: String,
    /// Trust domain the CA issues identities in
    trust_domain: String,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("trust_domain", &self.trust_domain)
            .finish_non_exhaustive()
    }
}

/// A signed leaf certificate with its private key
pub struct LeafCertificate {
    /// Certificate PEM
    pub cert_pem: String,
    /// Private key PEM (zeroized on drop)
    pub key_pem: Zeroizing<String>,
}

impl LeafCertificate {
    /// DER bytes of the certificate
    pub fn cert_der(&self) -> Result<Vec<u8>> {
        parse_pem(&self.cert_pem)
    }
}

fn distinguished_name(common_name: String, organization: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name));
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(organization.to_string()),
    );
    dn
}

impl CertificateAuthority {
    /// Create a new self-signed CA for a cluster
    pub fn new(cluster_name: &str, trust_domain: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name =
            distinguished_name(format!("{cluster_name} Peering CA"), trust_domain);

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let (not_before, not_after) = compute_validity(CA_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            key_pem: Zeroizing::new(key_pair.serialize_pem()),
            cert_pem: cert.pem(),
            trust_domain: trust_domain.to_string(),
        })
    }

    /// Load a CA from stored PEM material
    pub fn from_pem(cert_pem: &str, key_pem: &str, trust_domain: &str) -> Result<Self> {
        KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;
        parse_pem(cert_pem)?;

        Ok(Self {
            key_pem: Zeroizing::new(key_pem.to_string()),
            cert_pem: cert_pem.to_string(),
            trust_domain: trust_domain.to_string(),
        })
    }

    /// CA certificate PEM, as shipped to peers
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// CA private key PEM, for persistence
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Trust domain of this CA
    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))
    }

    /// Issue a leaf certificate for `server_name` with extra SANs
    ///
    /// The leaf is valid for both server and client auth, since peering
    /// servers and mesh gateways present it in both directions.
    pub fn issue_leaf(&self, server_name: &str, extra_sans: &[&str]) -> Result<LeafCertificate> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(server_name.to_string(), &self.trust_domain);

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let (not_before, not_after) = compute_validity(CERT_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        params.subject_alt_names = std::iter::once(server_name)
            .chain(extra_sans.iter().copied())
            .map(|san| {
                if let Ok(ip) = san.parse::<std::net::IpAddr>() {
                    Ok(SanType::IpAddress(ip))
                } else {
                    Ia5String::try_from(san.to_string())
                        .map(SanType::DnsName)
                        .map_err(|e| {
                            PkiError::CertificateGenerationFailed(format!(
                                "invalid DNS name '{}': {}",
                                san, e
                            ))
                        })
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let leaf_key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate leaf key: {}", e))
        })?;

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let cert = params.signed_by(&leaf_key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign leaf cert: {}", e))
        })?;

        Ok(LeafCertificate {
            cert_pem: cert.pem(),
            key_pem: Zeroizing::new(leaf_key.serialize_pem()),
        })
    }
}

/// Exporting-side CA rotation: `{R1}` → `{R1, R2}` → `{R2}`
///
/// The newest CA is the signing CA. Roots are reported oldest first, newest
/// last, which is the order peers receive them in.
#[derive(Clone, Debug)]
pub struct RootRotation {
    /// Trusted CAs, oldest first
    cas: Vec<CertificateAuthority>,
}

impl RootRotation {
    /// Start with a single root
    pub fn new(ca: CertificateAuthority) -> Self {
        Self { cas: vec![ca] }
    }

    /// The signing CA (newest)
    pub fn active(&self) -> &CertificateAuthority {
        // cas is never empty: constructed with one CA and finish() keeps the last
        &self.cas[self.cas.len() - 1]
    }

    /// Whether a rotation is in progress
    pub fn is_rotating(&self) -> bool {
        self.cas.len() > 1
    }

    /// Add a new root; both roots stay trusted until [`finish`](Self::finish)
    pub fn begin(&mut self, cluster_name: &str) -> Result<()> {
        if self.is_rotating() {
            return Err(PkiError::InvalidRotation(
                "a rotation is already in progress".to_string(),
            ));
        }
        let next = CertificateAuthority::new(cluster_name, self.active().trust_domain())?;
        self.cas.push(next);
        tracing::info!(roots = self.cas.len(), "CA rotation started");
        Ok(())
    }

    /// Retire every root except the newest
    pub fn finish(&mut self) -> Result<()> {
        if !self.is_rotating() {
            return Err(PkiError::InvalidRotation(
                "no rotation in progress".to_string(),
            ));
        }
        let retired = self.cas.len() - 1;
        self.cas.drain(..retired);
        tracing::info!(retired, "CA rotation finished");
        Ok(())
    }

    /// Current root set as PEM, newest last
    pub fn roots_pem(&self) -> Vec<String> {
        self.cas.iter().map(|ca| ca.cert_pem().to_string()).collect()
    }

    /// Issue a leaf from the signing CA
    pub fn issue_leaf(&self, server_name: &str, extra_sans: &[&str]) -> Result<LeafCertificate> {
        self.active().issue_leaf(server_name, extra_sans)
    }
}
