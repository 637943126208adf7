//! Traffic classification and rule aggregation
//!
//! Folds raw flow records into a minimal per-peer rule set. Each record is
//! classified by direction relative to the target pod, validated, and merged
//! into the rule for its peer IP. Invalid records are dropped individually;
//! a bad row in the broker must never sink the whole pod.

use tracing::{debug, warn};

use crate::flow::{parse_port, Direction, Protocol, TrafficRecord};
use crate::identity::PodIdentity;

/// One deduplicated (port, protocol) pair
///
/// Equality is on the parsed number and protocol, so `"80"` and `80` in the
/// source data can never produce duplicate entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortProtocol {
    /// Port number in `1..=65535`
    pub port: u16,
    /// L4 protocol
    pub protocol: Protocol,
}

/// Allowed traffic between the target pod and one peer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicyRule {
    /// Peer IP as observed; resolved to a selector or CIDR at render time
    pub peer_ip: String,
    /// Deduplicated ports the peer was observed on
    pub ports: Vec<PortProtocol>,
}

/// Aggregated rules for both directions
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrafficRules {
    /// Rules for traffic arriving at the target pod
    pub ingress: Vec<PolicyRule>,
    /// Rules for traffic leaving the target pod
    pub egress: Vec<PolicyRule>,
}

impl TrafficRules {
    /// True when no direction has any rule
    pub fn is_empty(&self) -> bool {
        self.ingress.is_empty() && self.egress.is_empty()
    }
}

/// Fold flow records into deduplicated per-peer rules
///
/// Guarantees on the output: within each direction no two rules share a peer
/// IP, and no rule carries a duplicate (port, protocol) pair. Records are
/// skipped when the direction is unknown (warned), the peer IP is empty or
/// the pod's own (self-traffic, silent), or the port fails to parse
/// (warned). Unknown protocols fall back to TCP instead of dropping the
/// record.
pub fn aggregate(records: &[TrafficRecord], target: &PodIdentity) -> TrafficRules {
    let mut rules = TrafficRules::default();

    for record in records {
        let raw_direction = record.traffic_type.as_deref().unwrap_or("");
        let Some(direction) = Direction::parse(raw_direction) else {
            warn!(
                pod = %target.name,
                traffic_type = %raw_direction,
                "skipping record with unknown traffic direction"
            );
            continue;
        };

        let peer_ip = record.traffic_in_out_ip.as_deref().unwrap_or("");
        if peer_ip.is_empty() {
            continue;
        }
        if peer_ip == target.pod_ip {
            debug!(pod = %target.name, %peer_ip, "skipping self-traffic");
            continue;
        }

        // Ingress allows the peer to reach a port on the target pod; egress
        // allows the target pod to reach a port on the peer.
        let raw_port = match direction {
            Direction::Ingress => record.pod_port.as_deref(),
            Direction::Egress => record.traffic_in_out_port.as_deref(),
        }
        .unwrap_or("");
        let Some(port) = parse_port(raw_port) else {
            warn!(
                pod = %target.name,
                port = %raw_port,
                ?direction,
                "skipping record with invalid port"
            );
            continue;
        };

        let protocol = Protocol::normalize(record.ip_protocol.as_deref().unwrap_or(""));
        let entry = PortProtocol { port, protocol };

        let list = match direction {
            Direction::Ingress => &mut rules.ingress,
            Direction::Egress => &mut rules.egress,
        };
        fold_rule(list, peer_ip, entry);
    }

    debug!(
        pod = %target.name,
        ingress = rules.ingress.len(),
        egress = rules.egress.len(),
        "aggregated traffic rules"
    );
    rules
}

/// Merge a (port, protocol) pair into the rule for a peer, creating the rule
/// if this is the first record for that peer
fn fold_rule(rules: &mut Vec<PolicyRule>, peer_ip: &str, entry: PortProtocol) {
    if let Some(rule) = rules.iter_mut().find(|rule| rule.peer_ip == peer_ip) {
        if !rule.ports.contains(&entry) {
            rule.ports.push(entry);
        }
        return;
    }
    rules.push(PolicyRule {
        peer_ip: peer_ip.to_string(),
        ports: vec![entry],
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> PodIdentity {
        PodIdentity {
            namespace: "default".to_string(),
            name: "web".to_string(),
            pod_ip: "10.1.0.1".to_string(),
            ..PodIdentity::default()
        }
    }

    fn record(direction: &str, peer_ip: &str, pod_port: &str, peer_port: &str, protocol: &str) -> TrafficRecord {
        TrafficRecord {
            pod_name: Some("web".to_string()),
            pod_ip: Some("10.1.0.1".to_string()),
            pod_port: Some(pod_port.to_string()),
            ip_protocol: Some(protocol.to_string()),
            traffic_type: Some(direction.to_string()),
            traffic_in_out_ip: Some(peer_ip.to_string()),
            traffic_in_out_port: Some(peer_port.to_string()),
            ..TrafficRecord::default()
        }
    }

    #[test]
    fn ingress_uses_the_target_pod_port() {
        let rules = aggregate(&[record("INGRESS", "10.0.0.1", "80", "43210", "TCP")], &target());
        assert_eq!(rules.ingress.len(), 1);
        assert!(rules.egress.is_empty());
        assert_eq!(rules.ingress[0].peer_ip, "10.0.0.1");
        assert_eq!(
            rules.ingress[0].ports,
            vec![PortProtocol { port: 80, protocol: Protocol::Tcp }]
        );
    }

    #[test]
    fn egress_uses_the_peer_port() {
        let rules = aggregate(&[record("EGRESS", "10.0.0.2", "43210", "5432", "TCP")], &target());
        assert!(rules.ingress.is_empty());
        assert_eq!(rules.egress.len(), 1);
        assert_eq!(
            rules.egress[0].ports,
            vec![PortProtocol { port: 5432, protocol: Protocol::Tcp }]
        );
    }

    #[test]
    fn aggregation_is_idempotent_for_duplicate_records() {
        let row = record("INGRESS", "10.0.0.1", "80", "", "TCP");
        let once = aggregate(&[row.clone()], &target());
        let twice = aggregate(&[row.clone(), row], &target());
        assert_eq!(once, twice);
        assert_eq!(twice.ingress[0].ports.len(), 1);
    }

    #[test]
    fn same_peer_distinct_ports_share_one_rule() {
        let rules = aggregate(
            &[
                record("INGRESS", "10.0.0.1", "80", "", "TCP"),
                record("INGRESS", "10.0.0.1", "443", "", "TCP"),
                record("INGRESS", "10.0.0.1", "80", "", "UDP"),
            ],
            &target(),
        );
        assert_eq!(rules.ingress.len(), 1);
        assert_eq!(rules.ingress[0].ports.len(), 3);
    }

    #[test]
    fn distinct_peers_never_share_a_rule() {
        let rules = aggregate(
            &[
                record("EGRESS", "10.0.0.1", "", "53", "UDP"),
                record("EGRESS", "10.0.0.2", "", "53", "UDP"),
                record("EGRESS", "10.0.0.1", "", "53", "TCP"),
            ],
            &target(),
        );
        assert_eq!(rules.egress.len(), 2);
        let peers: Vec<_> = rules.egress.iter().map(|r| r.peer_ip.as_str()).collect();
        assert_eq!(peers, vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn self_traffic_never_produces_a_rule() {
        let rules = aggregate(
            &[
                record("INGRESS", "10.1.0.1", "80", "", "TCP"),
                record("EGRESS", "10.1.0.1", "", "80", "TCP"),
            ],
            &target(),
        );
        assert!(rules.is_empty());
    }

    #[test]
    fn empty_peer_ips_are_skipped_silently() {
        let rules = aggregate(&[record("INGRESS", "", "80", "", "TCP")], &target());
        assert!(rules.is_empty());
    }

    #[test]
    fn unknown_directions_are_dropped_not_fatal() {
        let rules = aggregate(
            &[
                record("LATERAL", "10.0.0.1", "80", "", "TCP"),
                record("INGRESS", "10.0.0.2", "443", "", "TCP"),
            ],
            &target(),
        );
        assert_eq!(rules.ingress.len(), 1);
        assert_eq!(rules.ingress[0].peer_ip, "10.0.0.2");
    }

    #[test]
    fn invalid_ports_drop_only_the_offending_record() {
        let rules = aggregate(
            &[
                record("INGRESS", "10.0.0.1", "http", "", "TCP"),
                record("INGRESS", "10.0.0.1", "70000", "", "TCP"),
                record("INGRESS", "10.0.0.1", "8080", "", "TCP"),
            ],
            &target(),
        );
        assert_eq!(rules.ingress.len(), 1);
        assert_eq!(
            rules.ingress[0].ports,
            vec![PortProtocol { port: 8080, protocol: Protocol::Tcp }]
        );
    }

    #[test]
    fn unknown_protocols_keep_the_record_as_tcp() {
        let rules = aggregate(&[record("INGRESS", "10.0.0.1", "80", "", "GRE")], &target());
        assert_eq!(
            rules.ingress[0].ports,
            vec![PortProtocol { port: 80, protocol: Protocol::Tcp }]
        );
    }

    #[test]
    fn string_and_padded_ports_do_not_duplicate() {
        let rules = aggregate(
            &[
                record("INGRESS", "10.0.0.1", "80", "", "TCP"),
                record("INGRESS", "10.0.0.1", " 80 ", "", "tcp"),
            ],
            &target(),
        );
        assert_eq!(rules.ingress[0].ports.len(), 1);
    }
}
