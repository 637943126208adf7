//! Policy rendering
//!
//! Both renderers consume the same resolved rule model and the same target
//! selector, so for a given aggregation they emit structurally parallel
//! policies: the same number of ingress and egress entries with matching
//! port sets. This module holds the shared scaffolding - schema selection,
//! naming, labels, metadata, and the peer-resolution pass that turns
//! aggregated per-IP rules into renderable ones.
//!
//! A pod with no usable rules in either direction still gets a policy: an
//! explicit default-deny with both directions declared and both rule lists
//! present-but-empty. Silence would read as "nothing to secure here".

pub mod cilium;
pub mod standard;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::aggregate::{PortProtocol, TrafficRules};
use crate::identity::{resolve_selector_labels, ClusterLookup, Identity, PodIdentity};
use crate::peer::{Peer, PeerResolver};

/// Namespace-name label every namespace carries since Kubernetes 1.21
pub const NAMESPACE_NAME_LABEL: &str = "kubernetes.io/metadata.name";

/// Target policy schema
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicySchema {
    /// `networking.k8s.io/v1` NetworkPolicy
    Standard,
    /// `cilium.io/v2` CiliumNetworkPolicy
    Cilium,
}

impl PolicySchema {
    /// Short name used in policy names and output files
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Cilium => "cilium",
        }
    }
}

impl std::fmt::Display for PolicySchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PolicySchema {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "standard" | "kubernetes" => Ok(Self::Standard),
            "cilium" => Ok(Self::Cilium),
            other => Err(format!("unknown policy type: {other}")),
        }
    }
}

/// Metadata block shared by both manifest schemas
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PolicyMetadata {
    /// Resource name
    pub name: String,
    /// Resource namespace
    pub namespace: String,
    /// Identifying labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl PolicyMetadata {
    /// Metadata for a generated policy, with the standard identifying labels
    pub fn new(pod_name: &str, namespace: &str, schema: PolicySchema, deny_all: bool) -> Self {
        Self {
            name: policy_name(pod_name, schema, deny_all),
            namespace: namespace.to_string(),
            labels: policy_labels(pod_name, schema),
        }
    }
}

/// Deterministic name for a generated policy
pub fn policy_name(pod_name: &str, schema: PolicySchema, deny_all: bool) -> String {
    if deny_all {
        format!("{pod_name}-{schema}-policy-deny-all")
    } else {
        format!("{pod_name}-{schema}-policy")
    }
}

/// Identifying labels stamped on every generated policy
pub fn policy_labels(pod_name: &str, schema: PolicySchema) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            pod_name.to_string(),
        ),
        (
            "app.kubernetes.io/component".to_string(),
            format!("{schema}-policy"),
        ),
        ("app.kubernetes.io/part-of".to_string(), "palisade".to_string()),
    ])
}

/// A rule whose peer has been resolved to a selector or CIDR
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedRule {
    /// The resolved peer
    pub peer: Peer,
    /// Deduplicated ports for this peer
    pub ports: Vec<PortProtocol>,
}

/// Resolved rules for both directions, ready to render
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedRules {
    /// Ingress rules in peer order of first observation
    pub ingress: Vec<ResolvedRule>,
    /// Egress rules in peer order of first observation
    pub egress: Vec<ResolvedRule>,
}

impl ResolvedRules {
    /// True when no direction has any rule
    pub fn is_empty(&self) -> bool {
        self.ingress.is_empty() && self.egress.is_empty()
    }
}

/// Resolve every peer IP in an aggregated rule set
///
/// Runs only after aggregation has fully completed, and resolves through one
/// memoizing [`PeerResolver`] so a given IP maps to the same peer in every
/// rule of the generated policy.
pub async fn resolve_rules(
    resolver: &mut PeerResolver<'_>,
    rules: &TrafficRules,
) -> ResolvedRules {
    let mut resolved = ResolvedRules::default();
    for rule in &rules.ingress {
        resolved.ingress.push(ResolvedRule {
            peer: resolver.resolve(&rule.peer_ip).await,
            ports: rule.ports.clone(),
        });
    }
    for rule in &rules.egress {
        resolved.egress.push(ResolvedRule {
            peer: resolver.resolve(&rule.peer_ip).await,
            ports: rule.ports.clone(),
        });
    }
    resolved
}

/// Selector for the pod a policy applies to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetSelector {
    /// Pod name (used for policy naming)
    pub name: String,
    /// Namespace the policy lands in
    pub namespace: String,
    /// Labels the policy's pod selector matches
    pub labels: BTreeMap<String, String>,
}

/// Resolve the target pod's own selector, with a safe fallback
///
/// An empty pod selector would match every pod in the namespace, so when
/// resolution fails or yields nothing the selector falls back to
/// `app: <podName>` - narrow, predictable, and visibly synthetic.
pub async fn resolve_target_selector(
    lookup: &dyn ClusterLookup,
    target: &PodIdentity,
) -> TargetSelector {
    let labels = match resolve_selector_labels(lookup, &Identity::Pod(target.clone())).await {
        Ok(selector) if !selector.labels.is_empty() => selector.labels,
        Ok(_) => fallback_selector(&target.name),
        Err(err) => {
            tracing::debug!(
                pod = %target.name,
                error = %err,
                "target selector resolution failed, using app-name fallback"
            );
            fallback_selector(&target.name)
        }
    };
    TargetSelector {
        name: target.name.clone(),
        namespace: target.namespace.clone(),
        labels,
    }
}

fn fallback_selector(pod_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), pod_name.to_string())])
}
