//! Cilium CiliumNetworkPolicy rendering
//!
//! Emits `cilium.io/v2` CiliumNetworkPolicy manifests, structurally parallel
//! to the standard renderer: one ingress/egress entry per peer with the same
//! port sets. Selector peers become endpoint selectors with the namespace
//! scoped via the `k8s:io.kubernetes.pod.namespace` label inside the same
//! `matchLabels` map - a second namespace-only selector would be an
//! *alternative* match in Cilium and widen the rule to the whole namespace.
//! CIDR peers use `fromCIDR`/`toCIDR` in both directions.

use serde::{Deserialize, Serialize};

use super::{PolicyMetadata, PolicySchema, ResolvedRule, ResolvedRules, TargetSelector};
use crate::peer::Peer;

/// Pod-namespace label as seen by the Cilium datapath
pub const CILIUM_NAMESPACE_LABEL: &str = "k8s:io.kubernetes.pod.namespace";

/// `cilium.io/v2` CiliumNetworkPolicy
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CiliumNetworkPolicy {
    /// API version
    pub api_version: String,
    /// Kind
    pub kind: String,
    /// Metadata
    pub metadata: PolicyMetadata,
    /// Spec
    pub spec: CiliumNetworkPolicySpec,
}

/// CiliumNetworkPolicy spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CiliumNetworkPolicySpec {
    /// Endpoints this policy applies to
    pub endpoint_selector: EndpointSelector,
    /// Ingress rules; `None` omits the section, `Some(vec![])` is an
    /// explicit empty list (deny-all for the direction)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<Vec<CiliumIngressRule>>,
    /// Egress rules; same present-vs-empty distinction as `ingress`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress: Option<Vec<CiliumEgressRule>>,
}

/// Endpoint selector
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSelector {
    /// Match labels
    pub match_labels: std::collections::BTreeMap<String, String>,
}

/// One ingress entry: a single peer and the ports it may reach
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CiliumIngressRule {
    /// Source endpoints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub from_endpoints: Vec<EndpointSelector>,
    /// Source IP blocks for peers without a cluster identity
    #[serde(default, rename = "fromCIDR", skip_serializing_if = "Vec::is_empty")]
    pub from_cidr: Vec<String>,
    /// Ports on the target the sources may reach
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to_ports: Vec<CiliumPortRule>,
}

/// One egress entry: a single peer and the ports reachable on it
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CiliumEgressRule {
    /// Destination endpoints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to_endpoints: Vec<EndpointSelector>,
    /// Destination IP blocks for peers without a cluster identity
    #[serde(default, rename = "toCIDR", skip_serializing_if = "Vec::is_empty")]
    pub to_cidr: Vec<String>,
    /// Ports on the destination the target may reach
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to_ports: Vec<CiliumPortRule>,
}

/// Port rule
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CiliumPortRule {
    /// Ports
    pub ports: Vec<CiliumPort>,
}

/// Port and protocol pair, stringly typed as Cilium expects
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CiliumPort {
    /// Port number
    pub port: String,
    /// L4 protocol name
    pub protocol: String,
}

/// Render a CiliumNetworkPolicy from resolved rules
pub fn render(target: &TargetSelector, rules: &ResolvedRules) -> CiliumNetworkPolicy {
    if rules.is_empty() {
        return deny_all(target);
    }

    let ingress = (!rules.ingress.is_empty())
        .then(|| rules.ingress.iter().map(ingress_entry).collect());
    let egress = (!rules.egress.is_empty())
        .then(|| rules.egress.iter().map(egress_entry).collect());

    CiliumNetworkPolicy {
        api_version: "cilium.io/v2".to_string(),
        kind: "CiliumNetworkPolicy".to_string(),
        metadata: PolicyMetadata::new(&target.name, &target.namespace, PolicySchema::Cilium, false),
        spec: CiliumNetworkPolicySpec {
            endpoint_selector: EndpointSelector {
                match_labels: target.labels.clone(),
            },
            ingress,
            egress,
        },
    }
}

/// Render the explicit deny-all policy for a pod with no usable rules
fn deny_all(target: &TargetSelector) -> CiliumNetworkPolicy {
    CiliumNetworkPolicy {
        api_version: "cilium.io/v2".to_string(),
        kind: "CiliumNetworkPolicy".to_string(),
        metadata: PolicyMetadata::new(&target.name, &target.namespace, PolicySchema::Cilium, true),
        spec: CiliumNetworkPolicySpec {
            endpoint_selector: EndpointSelector {
                match_labels: target.labels.clone(),
            },
            ingress: Some(Vec::new()),
            egress: Some(Vec::new()),
        },
    }
}

fn ingress_entry(rule: &ResolvedRule) -> CiliumIngressRule {
    let mut entry = CiliumIngressRule {
        to_ports: port_rules(rule),
        ..CiliumIngressRule::default()
    };
    match &rule.peer {
        Peer::Selector { labels, namespace } => {
            entry.from_endpoints = vec![endpoint_selector(labels, namespace)];
        }
        Peer::Cidr(cidr) => entry.from_cidr = vec![cidr.clone()],
    }
    entry
}

fn egress_entry(rule: &ResolvedRule) -> CiliumEgressRule {
    let mut entry = CiliumEgressRule {
        to_ports: port_rules(rule),
        ..CiliumEgressRule::default()
    };
    match &rule.peer {
        Peer::Selector { labels, namespace } => {
            entry.to_endpoints = vec![endpoint_selector(labels, namespace)];
        }
        Peer::Cidr(cidr) => entry.to_cidr = vec![cidr.clone()],
    }
    entry
}

fn endpoint_selector(
    labels: &std::collections::BTreeMap<String, String>,
    namespace: &str,
) -> EndpointSelector {
    let mut match_labels = labels.clone();
    match_labels.insert(CILIUM_NAMESPACE_LABEL.to_string(), namespace.to_string());
    EndpointSelector { match_labels }
}

fn port_rules(rule: &ResolvedRule) -> Vec<CiliumPortRule> {
    vec![CiliumPortRule {
        ports: rule
            .ports
            .iter()
            .map(|entry| CiliumPort {
                port: entry.port.to_string(),
                protocol: entry.protocol.as_str().to_string(),
            })
            .collect(),
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::PortProtocol;
    use crate::flow::Protocol;
    use std::collections::BTreeMap;

    fn target() -> TargetSelector {
        TargetSelector {
            name: "web".to_string(),
            namespace: "shop".to_string(),
            labels: BTreeMap::from([("app".to_string(), "web".to_string())]),
        }
    }

    fn ports(list: &[(u16, Protocol)]) -> Vec<PortProtocol> {
        list.iter()
            .map(|(port, protocol)| PortProtocol {
                port: *port,
                protocol: *protocol,
            })
            .collect()
    }

    #[test]
    fn selector_peers_carry_the_namespace_inside_match_labels() {
        let rules = ResolvedRules {
            ingress: vec![ResolvedRule {
                peer: Peer::Selector {
                    labels: BTreeMap::from([("app".to_string(), "client".to_string())]),
                    namespace: "default".to_string(),
                },
                ports: ports(&[(80, Protocol::Tcp)]),
            }],
            egress: Vec::new(),
        };
        let policy = render(&target(), &rules);

        assert_eq!(policy.metadata.name, "web-cilium-policy");
        let ingress = policy.spec.ingress.expect("ingress rules");
        assert_eq!(ingress.len(), 1);
        assert_eq!(ingress[0].from_endpoints.len(), 1);
        assert_eq!(
            ingress[0].from_endpoints[0].match_labels,
            BTreeMap::from([
                ("app".to_string(), "client".to_string()),
                (
                    "k8s:io.kubernetes.pod.namespace".to_string(),
                    "default".to_string()
                ),
            ])
        );
        assert!(ingress[0].from_cidr.is_empty());
        assert!(policy.spec.egress.is_none());
    }

    #[test]
    fn cidr_peers_render_in_both_directions() {
        let cidr_rule = |port| ResolvedRule {
            peer: Peer::Cidr("203.0.113.9/32".to_string()),
            ports: ports(&[(port, Protocol::Tcp)]),
        };
        let rules = ResolvedRules {
            ingress: vec![cidr_rule(8080)],
            egress: vec![cidr_rule(443)],
        };
        let policy = render(&target(), &rules);

        let ingress = policy.spec.ingress.expect("ingress rules");
        assert_eq!(ingress[0].from_cidr, vec!["203.0.113.9/32"]);
        assert!(ingress[0].from_endpoints.is_empty());

        let egress = policy.spec.egress.expect("egress rules");
        assert_eq!(egress[0].to_cidr, vec!["203.0.113.9/32"]);
        assert!(egress[0].to_endpoints.is_empty());
    }

    #[test]
    fn default_deny_declares_both_directions_with_empty_lists() {
        let policy = render(&target(), &ResolvedRules::default());

        assert_eq!(policy.metadata.name, "web-cilium-policy-deny-all");
        assert_eq!(policy.spec.ingress, Some(Vec::new()));
        assert_eq!(policy.spec.egress, Some(Vec::new()));
        assert_eq!(
            policy.spec.endpoint_selector.match_labels,
            BTreeMap::from([("app".to_string(), "web".to_string())])
        );
    }

    #[test]
    fn manifest_yaml_uses_cilium_field_names() {
        let rules = ResolvedRules {
            ingress: vec![ResolvedRule {
                peer: Peer::Cidr("198.51.100.4/32".to_string()),
                ports: ports(&[(53, Protocol::Udp)]),
            }],
            egress: vec![ResolvedRule {
                peer: Peer::Cidr("198.51.100.5/32".to_string()),
                ports: ports(&[(53, Protocol::Udp)]),
            }],
        };
        let yaml = serde_yaml::to_string(&render(&target(), &rules)).expect("yaml");

        assert!(yaml.contains("apiVersion: cilium.io/v2"));
        assert!(yaml.contains("kind: CiliumNetworkPolicy"));
        assert!(yaml.contains("endpointSelector:"));
        assert!(yaml.contains("fromCIDR:"));
        assert!(yaml.contains("toCIDR:"));
        assert!(yaml.contains("toPorts:"));
        assert!(yaml.contains("port: '53'"));
        assert!(yaml.contains("protocol: UDP"));
    }
}
