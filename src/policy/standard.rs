//! Standard Kubernetes NetworkPolicy rendering
//!
//! Emits `networking.k8s.io/v1` NetworkPolicy manifests. Selector peers
//! become a pod selector paired with a namespace selector on the
//! `kubernetes.io/metadata.name` label; CIDR peers become `ipBlock` entries.
//!
//! `policyTypes` only declares directions that have at least one rule:
//! "no ingress was observed" and "deny all ingress" are different intents,
//! and the second one is the operator's call. The one exception is the
//! default-deny policy emitted when *neither* direction has rules - that one
//! declares both types with explicitly empty rule lists.

use serde::{Deserialize, Serialize};

use super::{PolicyMetadata, PolicySchema, ResolvedRule, ResolvedRules, TargetSelector};
use crate::peer::Peer;

/// `networking.k8s.io/v1` NetworkPolicy
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicy {
    /// API version
    pub api_version: String,
    /// Kind
    pub kind: String,
    /// Metadata
    pub metadata: PolicyMetadata,
    /// Spec
    pub spec: NetworkPolicySpec,
}

/// NetworkPolicy spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicySpec {
    /// Pods this policy applies to
    pub pod_selector: LabelSelector,
    /// Directions this policy enforces
    pub policy_types: Vec<String>,
    /// Ingress rules; `None` omits the section, `Some(vec![])` is an
    /// explicit empty list (deny-all for the direction)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<Vec<IngressRule>>,
    /// Egress rules; same present-vs-empty distinction as `ingress`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress: Option<Vec<EgressRule>>,
}

/// Label selector
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Match labels
    pub match_labels: std::collections::BTreeMap<String, String>,
}

/// One ingress entry: a single peer and the ports it may reach
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IngressRule {
    /// Peers allowed in
    pub from: Vec<PolicyPeer>,
    /// Ports on the target pod the peers may reach
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PolicyPort>,
}

/// One egress entry: a single peer and the ports reachable on it
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EgressRule {
    /// Peers allowed out to
    pub to: Vec<PolicyPeer>,
    /// Ports on the peer the target pod may reach
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PolicyPort>,
}

/// Peer descriptor: selector-based or an IP block
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyPeer {
    /// Pod label selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<LabelSelector>,
    /// Namespace selector scoping the pod selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,
    /// Fixed IP block for peers without a cluster identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_block: Option<IpBlock>,
}

/// Fixed IP block
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IpBlock {
    /// CIDR notation block
    pub cidr: String,
}

/// Port and protocol pair
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PolicyPort {
    /// Port number
    pub port: u16,
    /// L4 protocol name
    pub protocol: String,
}

/// Render a NetworkPolicy from resolved rules
pub fn render(target: &TargetSelector, rules: &ResolvedRules) -> NetworkPolicy {
    if rules.is_empty() {
        return deny_all(target);
    }

    let mut policy_types = Vec::new();
    let mut ingress = None;
    let mut egress = None;

    if !rules.ingress.is_empty() {
        policy_types.push("Ingress".to_string());
        ingress = Some(rules.ingress.iter().map(ingress_entry).collect());
    }
    if !rules.egress.is_empty() {
        policy_types.push("Egress".to_string());
        egress = Some(rules.egress.iter().map(egress_entry).collect());
    }

    NetworkPolicy {
        api_version: "networking.k8s.io/v1".to_string(),
        kind: "NetworkPolicy".to_string(),
        metadata: PolicyMetadata::new(&target.name, &target.namespace, PolicySchema::Standard, false),
        spec: NetworkPolicySpec {
            pod_selector: LabelSelector {
                match_labels: target.labels.clone(),
            },
            policy_types,
            ingress,
            egress,
        },
    }
}

/// Render the explicit deny-all policy for a pod with no usable rules
///
/// Both policy types declared, both rule lists present and empty. A policy
/// declaring no types would be a no-op, not a deny.
fn deny_all(target: &TargetSelector) -> NetworkPolicy {
    NetworkPolicy {
        api_version: "networking.k8s.io/v1".to_string(),
        kind: "NetworkPolicy".to_string(),
        metadata: PolicyMetadata::new(&target.name, &target.namespace, PolicySchema::Standard, true),
        spec: NetworkPolicySpec {
            pod_selector: LabelSelector {
                match_labels: target.labels.clone(),
            },
            policy_types: vec!["Ingress".to_string(), "Egress".to_string()],
            ingress: Some(Vec::new()),
            egress: Some(Vec::new()),
        },
    }
}

fn ingress_entry(rule: &ResolvedRule) -> IngressRule {
    IngressRule {
        from: vec![peer_descriptor(&rule.peer)],
        ports: ports_of(rule),
    }
}

fn egress_entry(rule: &ResolvedRule) -> EgressRule {
    EgressRule {
        to: vec![peer_descriptor(&rule.peer)],
        ports: ports_of(rule),
    }
}

fn peer_descriptor(peer: &Peer) -> PolicyPeer {
    match peer {
        Peer::Selector { labels, namespace } => PolicyPeer {
            pod_selector: Some(LabelSelector {
                match_labels: labels.clone(),
            }),
            namespace_selector: Some(LabelSelector {
                match_labels: [(super::NAMESPACE_NAME_LABEL.to_string(), namespace.clone())].into(),
            }),
            ip_block: None,
        },
        Peer::Cidr(cidr) => PolicyPeer {
            ip_block: Some(IpBlock { cidr: cidr.clone() }),
            ..PolicyPeer::default()
        },
    }
}

fn ports_of(rule: &ResolvedRule) -> Vec<PolicyPort> {
    rule.ports
        .iter()
        .map(|entry| PolicyPort {
            port: entry.port,
            protocol: entry.protocol.as_str().to_string(),
        })
        .collect()
}
