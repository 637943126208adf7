//! Palisade - least-privilege policy synthesis from observed pod traffic
//!
//! Palisade turns network flows recorded by an in-cluster broker into
//! Kubernetes `NetworkPolicy` or Cilium `CiliumNetworkPolicy` manifests that
//! permit exactly the traffic that was observed, plus seccomp profiles from
//! recorded syscalls.
//!
//! # Architecture
//!
//! Policy generation for one pod is a straight pipeline:
//!
//! 1. Fetch the pod's recorded flows from the broker
//! 2. Classify and fold them into deduplicated per-peer rules ([`aggregate`])
//! 3. Resolve each peer IP to a label selector or a `/32` CIDR ([`peer`]),
//!    walking controller ownership where needed ([`identity`])
//! 4. Render the rules into the requested policy schema ([`policy`])
//!
//! Batch modes (namespace-wide, cluster-wide) run the same pipeline per pod
//! with bounded concurrency; one pod's failure never aborts the batch.
//!
//! # Modules
//!
//! - [`flow`] - Traffic records as recorded by the broker
//! - [`identity`] - Pod/Service identities and selector resolution
//! - [`peer`] - Peer resolution (selector vs CIDR)
//! - [`aggregate`] - Traffic classification and rule aggregation
//! - [`policy`] - Policy rendering (standard Kubernetes and Cilium)
//! - [`broker`] - HTTP client for the flow-data broker
//! - [`portforward`] - Tunnel that makes the broker reachable locally
//! - [`k8s`] - Kubernetes client plumbing and cluster lookups
//! - [`engine`] - Single-pod and batch generation entry points
//! - [`output`] - Manifest file output
//! - [`seccomp`] - Seccomp profile generation
//! - [`error`] - Error types

#![cfg_attr(not(test), deny(missing_docs))]

pub mod aggregate;
pub mod broker;
pub mod engine;
pub mod error;
pub mod flow;
pub mod identity;
pub mod k8s;
pub mod output;
pub mod peer;
pub mod policy;
pub mod portforward;
pub mod seccomp;

pub use error::{Error, ResolutionError};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Namespace the broker service is deployed to by default
pub const DEFAULT_BROKER_NAMESPACE: &str = "kube-guardian";

/// Namespace tried when the broker service is absent from the configured one
pub const FALLBACK_BROKER_NAMESPACE: &str = "kube-system";

/// Name of the broker service inside the cluster
pub const BROKER_SERVICE_NAME: &str = "broker";

/// Port the broker listens on
pub const BROKER_PORT: u16 = 9090;

/// Default output directory for generated network policies
pub const DEFAULT_POLICY_OUTPUT_DIR: &str = "network-policies";

/// Default output directory for generated seccomp profiles
pub const DEFAULT_SECCOMP_OUTPUT_DIR: &str = "seccomp-profiles";
