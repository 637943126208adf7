//! Traffic records as recorded by the flow-data broker
//!
//! The broker stores one row per observed connection, keyed by the pod the
//! flow was captured on. Field names mirror the broker's wire format; all
//! per-flow columns are nullable there, so they are optional here and
//! validated during aggregation rather than at decode time.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// One observed network flow involving the target pod
///
/// `pod_*` fields describe the pod being profiled; `traffic_in_out_*` fields
/// describe the peer on the other end. Which port matters depends on the
/// direction: for ingress it is the port on the target pod (`pod_port`), for
/// egress the port on the peer (`traffic_in_out_port`).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrafficRecord {
    /// Row identifier assigned by the broker
    #[serde(default)]
    pub uuid: String,
    /// Name of the pod the flow was recorded for
    #[serde(default)]
    pub pod_name: Option<String>,
    /// Namespace of the pod the flow was recorded for
    #[serde(default)]
    pub pod_namespace: Option<String>,
    /// IP of the pod the flow was recorded for
    #[serde(default)]
    pub pod_ip: Option<String>,
    /// Port on the target pod (meaningful for ingress)
    #[serde(default)]
    pub pod_port: Option<String>,
    /// L4 protocol as recorded (TCP, UDP, SCTP - free text at the source)
    #[serde(default)]
    pub ip_protocol: Option<String>,
    /// Direction relative to the target pod (`INGRESS` or `EGRESS`)
    #[serde(default)]
    pub traffic_type: Option<String>,
    /// IP of the peer on the other end of the flow
    #[serde(default)]
    pub traffic_in_out_ip: Option<String>,
    /// Port on the peer (meaningful for egress)
    #[serde(default)]
    pub traffic_in_out_port: Option<String>,
}

/// Direction of a flow relative to the target pod
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Peer connects to the target pod
    Ingress,
    /// Target pod connects to the peer
    Egress,
}

impl Direction {
    /// Parse the broker's free-text direction label
    ///
    /// Returns `None` for anything other than `INGRESS`/`EGRESS` (case
    /// insensitive); records with unknown directions are dropped upstream.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "INGRESS" => Some(Self::Ingress),
            "EGRESS" => Some(Self::Egress),
            _ => None,
        }
    }
}

/// L4 protocol of a flow
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    /// Transmission Control Protocol
    Tcp,
    /// User Datagram Protocol
    Udp,
    /// Stream Control Transmission Protocol
    Sctp,
}

impl Protocol {
    /// Normalize the broker's free-text protocol label
    ///
    /// Unrecognized values default to TCP rather than dropping the record;
    /// the flow was observed either way and TCP is the overwhelmingly common
    /// case in practice.
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "TCP" => Self::Tcp,
            "UDP" => Self::Udp,
            "SCTP" => Self::Sctp,
            other => {
                warn!(protocol = %other, "unknown protocol, defaulting to TCP");
                Self::Tcp
            }
        }
    }

    /// Canonical uppercase name as used in policy manifests
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::Sctp => "SCTP",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a port string into the valid range `1..=65535`
///
/// Returns `None` on parse failure or out-of-range values; the caller decides
/// whether that skips a record or fails a request.
pub fn parse_port(raw: &str) -> Option<u16> {
    let port: u32 = raw.trim().parse().ok()?;
    if (1..=65535).contains(&port) {
        Some(port as u16)
    } else {
        None
    }
}
