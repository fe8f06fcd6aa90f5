//! Mesh-gateway routing over imported entries
//!
//! The gateway collaborator routes by TLS SNI. The table is rebuilt from the
//! store rather than maintained incrementally, so it always reflects what
//! has been durably applied.

use std::collections::HashMap;

use peerlink_common::{Error, Result};
use peerlink_pki::VerificationResult;
use peerlink_proto::{EntryKey, ServiceEndpoint};

use crate::record::PeeringRole;
use crate::store::PeeringStore;
use crate::trust::TrustBundleReconciler;

/// SNI under which a service is reachable through the exporting cluster's gateway
pub fn service_sni(key: &EntryKey, datacenter: &str, trust_domain: &str) -> String {
    format!(
        "{}.{}.{}.internal.{}",
        key.service, key.namespace, datacenter, trust_domain
    )
}

/// Where the gateway sends one SNI
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    /// Peering the service was imported through
    pub peering_id: String,
    /// Local name of that peering
    pub peering_name: String,
    /// Service on the exporting side
    pub service: EntryKey,
    /// Upstream instances
    pub endpoints: Vec<ServiceEndpoint>,
}

/// SNI routing table
#[derive(Clone, Debug, Default)]
pub struct RoutingTable {
    routes: HashMap<String, Route>,
}

impl RoutingTable {
    /// Build the table from every live importing peering
    pub async fn build(store: &dyn PeeringStore) -> Result<Self> {
        let mut routes = HashMap::new();
        for record in store.list().await? {
            if record.role != PeeringRole::Dialing || !record.is_live() {
                continue;
            }
            for entry in store.entries(&record.id).await? {
                routes.insert(
                    entry.sni.clone(),
                    Route {
                        peering_id: record.id.clone(),
                        peering_name: record.name.clone(),
                        service: entry.key,
                        endpoints: entry.endpoints,
                    },
                );
            }
        }
        Ok(Self { routes })
    }

    /// Route for an SNI
    pub fn route(&self, sni: &str) -> Option<&Route> {
        self.routes.get(sni)
    }

    /// Number of routable SNIs
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether nothing is routable
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Validate the certificate an upstream presented for `sni`
    ///
    /// The certificate must chain to a root of the peering the route was
    /// imported through.
    pub fn verify_upstream(
        &self,
        sni: &str,
        cert_der: &[u8],
        trust: &TrustBundleReconciler,
    ) -> Result<VerificationResult> {
        let route = self
            .route(sni)
            .ok_or_else(|| Error::protocol(format!("no route for SNI {sni}")))?;
        trust.verify(&route.peering_id, cert_der)
    }
}
