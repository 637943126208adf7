//! Peer resolution: from an observed IP to a policy peer
//!
//! A peer is either a label selector (the IP belongs to a pod or service we
//! can identify) or a fixed `/32` CIDR block (everything else). Resolution
//! never fails - any lookup error degrades to the CIDR form, which is always
//! a safe, if less expressive, description of the observed address.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::identity::{resolve_selector_labels, ClusterLookup, Identity};

/// The other end of a flow, in policy terms
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Peer {
    /// Peer matched by pod labels within a namespace
    Selector {
        /// Labels matching the peer's pods
        labels: BTreeMap<String, String>,
        /// Namespace the labels are scoped to
        namespace: String,
    },
    /// Peer matched by a fixed IP block
    Cidr(String),
}

impl Peer {
    /// Host-sized CIDR block for a single address
    pub fn cidr_of(ip: &str) -> Self {
        Self::Cidr(format!("{ip}/32"))
    }
}

/// Resolves peer IPs for one policy-generation call
///
/// Results are memoized per instance, which both avoids re-querying the
/// broker for recurring peers and guarantees that a given IP resolves the
/// same way everywhere within one generated policy.
pub struct PeerResolver<'a> {
    lookup: &'a dyn ClusterLookup,
    memo: HashMap<String, Peer>,
}

impl<'a> PeerResolver<'a> {
    /// Create a resolver for a single generation call
    pub fn new(lookup: &'a dyn ClusterLookup) -> Self {
        Self {
            lookup,
            memo: HashMap::new(),
        }
    }

    /// Resolve an IP to a peer, falling back to a `/32` CIDR on any failure
    ///
    /// Lookup order is Service first, then Pod: a ClusterIP that fronts pods
    /// is semantically clearer as the service's selector, and the priority
    /// must be fixed because the two lookups can both match. Assumes the
    /// caller already filtered empty and self-referential IPs.
    pub async fn resolve(&mut self, ip: &str) -> Peer {
        if let Some(peer) = self.memo.get(ip) {
            return peer.clone();
        }
        let peer = self.resolve_uncached(ip).await;
        self.memo.insert(ip.to_string(), peer.clone());
        peer
    }

    async fn resolve_uncached(&self, ip: &str) -> Peer {
        match self.lookup.service_by_ip(ip).await {
            Ok(Some(service)) => {
                let identity = Identity::Service(service);
                match resolve_selector_labels(self.lookup, &identity).await {
                    Ok(selector) if !selector.labels.is_empty() => {
                        return Peer::Selector {
                            labels: selector.labels,
                            namespace: selector.namespace,
                        };
                    }
                    Ok(_) => debug!(%ip, "service resolved to empty selector, trying pod"),
                    Err(err) => debug!(%ip, error = %err, "service selector resolution failed, trying pod"),
                }
            }
            Ok(None) => {}
            Err(err) => debug!(%ip, error = %err, "service lookup failed, trying pod"),
        }

        match self.lookup.pod_by_ip(ip).await {
            Ok(Some(pod)) => {
                if pod.host_network {
                    // The recorded IP is a node IP; matching the pod's labels
                    // would scope the rule to every pod on that node.
                    debug!(%ip, pod = %pod.name, "peer pod uses host networking, keeping CIDR");
                    return Peer::cidr_of(ip);
                }
                let identity = Identity::Pod(pod);
                match resolve_selector_labels(self.lookup, &identity).await {
                    Ok(selector) if !selector.labels.is_empty() => {
                        return Peer::Selector {
                            labels: selector.labels,
                            namespace: selector.namespace,
                        };
                    }
                    Ok(_) => debug!(%ip, "pod resolved to empty selector"),
                    Err(err) => debug!(%ip, error = %err, "pod selector resolution failed"),
                }
            }
            Ok(None) => {}
            Err(err) => debug!(%ip, error = %err, "pod lookup failed"),
        }

        debug!(%ip, "no cluster identity found, treating peer as external");
        Peer::cidr_of(ip)
    }
}
