//! Cluster identities and selector resolution
//!
//! An observed IP address is opaque; turning it into a policy rule requires
//! knowing *what* owns it. This module models the two identities an
//! in-cluster IP can resolve to (a Pod or a Service) and resolves either to
//! its canonical label selector.
//!
//! For controller-managed pods the pod's own labels are the wrong answer: a
//! Deployment's pods carry a `pod-template-hash` label that changes on every
//! rollout, so a policy matching those labels dies with the current
//! ReplicaSet. The resolver therefore walks the owner chain and returns the
//! managing controller's selector instead.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
#[cfg(test)]
use mockall::automock;

use crate::error::ResolutionError;

/// Reference to the controller managing a pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerRef {
    /// Kind of the owning controller (e.g. `ReplicaSet`)
    pub kind: String,
    /// Name of the owning controller
    pub name: String,
}

/// Identity of a pod, as needed for selector resolution
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodIdentity {
    /// Namespace the pod runs in
    pub namespace: String,
    /// Pod name
    pub name: String,
    /// Pod IP (a node IP when `host_network` is set)
    pub pod_ip: String,
    /// Raw labels on the pod object
    pub labels: BTreeMap<String, String>,
    /// Nearest owning controller, if any
    pub owner: Option<OwnerRef>,
    /// Whether the pod shares the node's network namespace
    pub host_network: bool,
}

impl PodIdentity {
    /// Extract an identity from a live `Pod` object
    pub fn from_pod(pod: &Pod) -> Self {
        let meta = &pod.metadata;
        Self {
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
            pod_ip: pod
                .status
                .as_ref()
                .and_then(|status| status.pod_ip.clone())
                .unwrap_or_default(),
            labels: meta.labels.clone().unwrap_or_default(),
            owner: meta
                .owner_references
                .as_ref()
                .and_then(|refs| refs.first())
                .map(|owner| OwnerRef {
                    kind: owner.kind.clone(),
                    name: owner.name.clone(),
                }),
            host_network: pod
                .spec
                .as_ref()
                .and_then(|spec| spec.host_network)
                .unwrap_or(false),
        }
    }
}

/// Identity of a service, as needed for selector resolution
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceIdentity {
    /// Namespace the service lives in
    pub namespace: String,
    /// Service name
    pub name: String,
    /// The service's selector; empty for headless/ExternalName services
    pub selector: BTreeMap<String, String>,
}

impl ServiceIdentity {
    /// Extract an identity from a live `Service` object
    pub fn from_service(service: &Service) -> Self {
        Self {
            namespace: service.metadata.namespace.clone().unwrap_or_default(),
            name: service.metadata.name.clone().unwrap_or_default(),
            selector: service
                .spec
                .as_ref()
                .and_then(|spec| spec.selector.clone())
                .unwrap_or_default(),
        }
    }
}

/// What an in-cluster IP resolved to
///
/// Resolved once at the lookup boundary; everything downstream matches on
/// this enum instead of re-discriminating by runtime type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Identity {
    /// The IP belongs to a pod
    Pod(PodIdentity),
    /// The IP belongs to a service (ClusterIP)
    Service(ServiceIdentity),
}

/// Canonical selector for an identity: labels scoped to a namespace
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedSelector {
    /// Label selector matching the identity's pods
    pub labels: BTreeMap<String, String>,
    /// Namespace the selector is scoped to
    pub namespace: String,
}

/// Controller kinds the owner-chain walk understands
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerKind {
    /// `apps/v1` Deployment
    Deployment,
    /// `apps/v1` ReplicaSet
    ReplicaSet,
    /// `apps/v1` StatefulSet
    StatefulSet,
    /// `apps/v1` DaemonSet
    DaemonSet,
    /// `batch/v1` Job
    Job,
}

impl ControllerKind {
    /// Kind name as it appears in owner references
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "Deployment",
            Self::ReplicaSet => "ReplicaSet",
            Self::StatefulSet => "StatefulSet",
            Self::DaemonSet => "DaemonSet",
            Self::Job => "Job",
        }
    }
}

/// Cluster lookups the resolvers depend on
///
/// Implemented against the broker (by-IP lookups) and the Kubernetes API
/// (owner chain) in production; mocked in tests. The by-IP lookups follow a
/// not-found-is-`None` convention - only transport-level problems are errors.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterLookup: Send + Sync {
    /// Look up the pod owning an IP, if any
    async fn pod_by_ip(&self, ip: &str) -> crate::Result<Option<PodIdentity>>;

    /// Look up the service owning a ClusterIP, if any
    async fn service_by_ip(&self, ip: &str) -> crate::Result<Option<ServiceIdentity>>;

    /// Selector `matchLabels` of a controller object
    ///
    /// Fails with [`ResolutionError::StaleReference`] when the object has
    /// been deleted since the flow was recorded.
    async fn controller_selector(
        &self,
        namespace: &str,
        kind: ControllerKind,
        name: &str,
    ) -> Result<BTreeMap<String, String>, ResolutionError>;

    /// Nearest owner of a ReplicaSet (the Deployment in a standard chain)
    async fn replica_set_owner(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<OwnerRef>, ResolutionError>;
}

/// Resolve an identity to its canonical label selector
///
/// - Services resolve to their own selector; an empty selector is a
///   [`ResolutionError::NoSelector`] failure, never a match-everything rule.
/// - Unowned pods resolve to their own labels.
/// - Controller-managed pods resolve to the managing controller's selector:
///   `ReplicaSet` walks one level up to its Deployment, `StatefulSet`,
///   `DaemonSet` and `Job` are used directly, anything else fails with
///   [`ResolutionError::UnsupportedOwnerKind`].
pub async fn resolve_selector_labels(
    lookup: &dyn ClusterLookup,
    identity: &Identity,
) -> Result<ResolvedSelector, ResolutionError> {
    match identity {
        Identity::Service(service) => {
            if service.selector.is_empty() {
                return Err(ResolutionError::NoSelector {
                    namespace: service.namespace.clone(),
                    name: service.name.clone(),
                });
            }
            Ok(ResolvedSelector {
                labels: service.selector.clone(),
                namespace: service.namespace.clone(),
            })
        }
        Identity::Pod(pod) => {
            let Some(owner) = &pod.owner else {
                return Ok(ResolvedSelector {
                    labels: pod.labels.clone(),
                    namespace: pod.namespace.clone(),
                });
            };
            let labels = match owner.kind.as_str() {
                "ReplicaSet" => {
                    resolve_replica_set_chain(lookup, &pod.namespace, &owner.name).await?
                }
                "StatefulSet" => {
                    lookup
                        .controller_selector(&pod.namespace, ControllerKind::StatefulSet, &owner.name)
                        .await?
                }
                "DaemonSet" => {
                    lookup
                        .controller_selector(&pod.namespace, ControllerKind::DaemonSet, &owner.name)
                        .await?
                }
                "Job" => {
                    lookup
                        .controller_selector(&pod.namespace, ControllerKind::Job, &owner.name)
                        .await?
                }
                other => {
                    return Err(ResolutionError::UnsupportedOwnerKind {
                        kind: other.to_string(),
                    })
                }
            };
            Ok(ResolvedSelector {
                labels,
                namespace: pod.namespace.clone(),
            })
        }
    }
}

/// Walk a ReplicaSet up to its Deployment and return that selector
///
/// A bare ReplicaSet (created directly, no owner) resolves to its own
/// selector - it is a stable controller selector in its own right. A
/// ReplicaSet owned by anything other than a Deployment is unsupported.
async fn resolve_replica_set_chain(
    lookup: &dyn ClusterLookup,
    namespace: &str,
    name: &str,
) -> Result<BTreeMap<String, String>, ResolutionError> {
    match lookup.replica_set_owner(namespace, name).await? {
        Some(owner) if owner.kind == "Deployment" => {
            lookup
                .controller_selector(namespace, ControllerKind::Deployment, &owner.name)
                .await
        }
        Some(owner) => Err(ResolutionError::UnsupportedOwnerKind {
            kind: format!("ReplicaSet owned by {}", owner.kind),
        }),
        None => {
            lookup
                .controller_selector(namespace, ControllerKind::ReplicaSet, name)
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn pod_with_owner(kind: &str, name: &str) -> PodIdentity {
        PodIdentity {
            namespace: "default".to_string(),
            name: "web-7f9c5d4b8-x2x9z".to_string(),
            pod_ip: "10.0.0.5".to_string(),
            labels: labels(&[("app", "web"), ("pod-template-hash", "7f9c5d4b8")]),
            owner: Some(OwnerRef {
                kind: kind.to_string(),
                name: name.to_string(),
            }),
            host_network: false,
        }
    }

    #[tokio::test]
    async fn unowned_pod_resolves_to_its_own_labels() {
        let lookup = MockClusterLookup::new();
        let pod = PodIdentity {
            namespace: "default".to_string(),
            name: "client".to_string(),
            pod_ip: "10.0.0.1".to_string(),
            labels: labels(&[("app", "client")]),
            owner: None,
            host_network: false,
        };

        let resolved = resolve_selector_labels(&lookup, &Identity::Pod(pod))
            .await
            .expect("resolution");
        assert_eq!(resolved.labels, labels(&[("app", "client")]));
        assert_eq!(resolved.namespace, "default");
    }

    #[tokio::test]
    async fn replica_set_chain_returns_the_deployment_selector() {
        let mut lookup = MockClusterLookup::new();
        lookup
            .expect_replica_set_owner()
            .with(eq("default"), eq("backend-7f9c5d4b8"))
            .times(1)
            .returning(|_, _| {
                Ok(Some(OwnerRef {
                    kind: "Deployment".to_string(),
                    name: "backend".to_string(),
                }))
            });
        lookup
            .expect_controller_selector()
            .with(eq("default"), eq(ControllerKind::Deployment), eq("backend"))
            .times(1)
            .returning(|_, _, _| Ok([("app".to_string(), "backend".to_string())].into()));

        let pod = pod_with_owner("ReplicaSet", "backend-7f9c5d4b8");
        let resolved = resolve_selector_labels(&lookup, &Identity::Pod(pod))
            .await
            .expect("resolution");

        // The deployment's stable selector, not the pod's hash-suffixed labels.
        assert_eq!(resolved.labels, labels(&[("app", "backend")]));
    }

    #[tokio::test]
    async fn bare_replica_set_falls_back_to_its_own_selector() {
        let mut lookup = MockClusterLookup::new();
        lookup
            .expect_replica_set_owner()
            .returning(|_, _| Ok(None));
        lookup
            .expect_controller_selector()
            .with(eq("default"), eq(ControllerKind::ReplicaSet), eq("standalone"))
            .returning(|_, _, _| Ok([("app".to_string(), "standalone".to_string())].into()));

        let pod = pod_with_owner("ReplicaSet", "standalone");
        let resolved = resolve_selector_labels(&lookup, &Identity::Pod(pod))
            .await
            .expect("resolution");
        assert_eq!(resolved.labels, labels(&[("app", "standalone")]));
    }

    #[tokio::test]
    async fn stateful_set_selector_is_used_directly() {
        let mut lookup = MockClusterLookup::new();
        lookup
            .expect_controller_selector()
            .with(eq("default"), eq(ControllerKind::StatefulSet), eq("db"))
            .times(1)
            .returning(|_, _, _| Ok([("app".to_string(), "db".to_string())].into()));

        let pod = pod_with_owner("StatefulSet", "db");
        let resolved = resolve_selector_labels(&lookup, &Identity::Pod(pod))
            .await
            .expect("resolution");
        assert_eq!(resolved.labels, labels(&[("app", "db")]));
    }

    #[tokio::test]
    async fn unknown_owner_kinds_fail_typed() {
        let lookup = MockClusterLookup::new();
        let pod = pod_with_owner("CloneSet", "web");

        let err = resolve_selector_labels(&lookup, &Identity::Pod(pod))
            .await
            .expect_err("must fail");
        assert!(matches!(
            err,
            ResolutionError::UnsupportedOwnerKind { kind } if kind == "CloneSet"
        ));
    }

    #[tokio::test]
    async fn deleted_controller_surfaces_as_stale_reference() {
        let mut lookup = MockClusterLookup::new();
        lookup.expect_replica_set_owner().returning(|namespace, name| {
            Err(ResolutionError::StaleReference {
                kind: "ReplicaSet".to_string(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
        });

        let pod = pod_with_owner("ReplicaSet", "gone-5c9f");
        let err = resolve_selector_labels(&lookup, &Identity::Pod(pod))
            .await
            .expect_err("must fail");
        assert!(matches!(err, ResolutionError::StaleReference { .. }));
    }

    #[tokio::test]
    async fn service_without_selector_is_not_a_match_everything_rule() {
        let lookup = MockClusterLookup::new();
        let service = ServiceIdentity {
            namespace: "default".to_string(),
            name: "external-db".to_string(),
            selector: BTreeMap::new(),
        };

        let err = resolve_selector_labels(&lookup, &Identity::Service(service))
            .await
            .expect_err("must fail");
        assert!(matches!(err, ResolutionError::NoSelector { .. }));
    }

    #[tokio::test]
    async fn service_selector_passes_through() {
        let lookup = MockClusterLookup::new();
        let service = ServiceIdentity {
            namespace: "shop".to_string(),
            name: "checkout".to_string(),
            selector: labels(&[("app", "checkout")]),
        };

        let resolved = resolve_selector_labels(&lookup, &Identity::Service(service))
            .await
            .expect("resolution");
        assert_eq!(resolved.labels, labels(&[("app", "checkout")]));
        assert_eq!(resolved.namespace, "shop");
    }
}
