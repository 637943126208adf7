//! Kubernetes client plumbing and the production cluster lookups
//!
//! Pods are enumerated straight from the API server (the broker only knows
//! about pods it has seen traffic for). By-IP identity lookups go to the
//! broker, which indexes by address; owner-chain lookups go back to the API
//! server because controller objects are not part of the broker's schema.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client};

use crate::broker::BrokerClient;
use crate::error::ResolutionError;
use crate::identity::{
    ClusterLookup, ControllerKind, OwnerRef, PodIdentity, ServiceIdentity,
};

/// Create a client from the ambient kubeconfig or in-cluster environment
pub async fn client() -> crate::Result<Client> {
    Ok(Client::try_default().await?)
}

/// Namespace of the current kubeconfig context
pub fn current_namespace(client: &Client) -> String {
    client.default_namespace().to_string()
}

/// Fetch a single pod
pub async fn get_pod(client: &Client, namespace: &str, name: &str) -> crate::Result<Pod> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    Ok(pods.get(name).await?)
}

/// All running pods in one namespace
pub async fn pods_in_namespace(client: &Client, namespace: &str) -> crate::Result<Vec<Pod>> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let list = pods.list(&ListParams::default()).await?;
    Ok(list.items.into_iter().filter(is_running).collect())
}

/// All running pods across the cluster
pub async fn pods_in_all_namespaces(client: &Client) -> crate::Result<Vec<Pod>> {
    let pods: Api<Pod> = Api::all(client.clone());
    let list = pods.list(&ListParams::default()).await?;
    Ok(list.items.into_iter().filter(is_running).collect())
}

/// Whether a pod is running and not being torn down
pub(crate) fn is_running(pod: &Pod) -> bool {
    let running = pod
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Running");
    running && pod.metadata.deletion_timestamp.is_none()
}

/// Production [`ClusterLookup`]: broker for by-IP lookups, API server for
/// the owner chain
#[derive(Clone)]
pub struct ApiClusterLookup {
    client: Client,
    broker: BrokerClient,
}

impl ApiClusterLookup {
    /// Combine a kube client and a broker client into one lookup facade
    pub fn new(client: Client, broker: BrokerClient) -> Self {
        Self { client, broker }
    }
}

#[async_trait]
impl ClusterLookup for ApiClusterLookup {
    async fn pod_by_ip(&self, ip: &str) -> crate::Result<Option<PodIdentity>> {
        self.broker.pod_by_ip(ip).await
    }

    async fn service_by_ip(&self, ip: &str) -> crate::Result<Option<ServiceIdentity>> {
        self.broker.service_by_ip(ip).await
    }

    async fn controller_selector(
        &self,
        namespace: &str,
        kind: ControllerKind,
        name: &str,
    ) -> Result<BTreeMap<String, String>, ResolutionError> {
        match kind {
            ControllerKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                let object = api
                    .get(name)
                    .await
                    .map_err(|err| stale_or_api(err, kind, namespace, name))?;
                Ok(object
                    .spec
                    .and_then(|spec| spec.selector.match_labels)
                    .unwrap_or_default())
            }
            ControllerKind::ReplicaSet => {
                let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
                let object = api
                    .get(name)
                    .await
                    .map_err(|err| stale_or_api(err, kind, namespace, name))?;
                Ok(object
                    .spec
                    .and_then(|spec| spec.selector.match_labels)
                    .unwrap_or_default())
            }
            ControllerKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                let object = api
                    .get(name)
                    .await
                    .map_err(|err| stale_or_api(err, kind, namespace, name))?;
                Ok(object
                    .spec
                    .and_then(|spec| spec.selector.match_labels)
                    .unwrap_or_default())
            }
            ControllerKind::DaemonSet => {
                let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
                let object = api
                    .get(name)
                    .await
                    .map_err(|err| stale_or_api(err, kind, namespace, name))?;
                Ok(object
                    .spec
                    .and_then(|spec| spec.selector.match_labels)
                    .unwrap_or_default())
            }
            ControllerKind::Job => {
                let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
                let object = api
                    .get(name)
                    .await
                    .map_err(|err| stale_or_api(err, kind, namespace, name))?;
                Ok(object
                    .spec
                    .and_then(|spec| spec.selector)
                    .and_then(|selector| selector.match_labels)
                    .unwrap_or_default())
            }
        }
    }

    async fn replica_set_owner(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<OwnerRef>, ResolutionError> {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        let replica_set = api
            .get(name)
            .await
            .map_err(|err| stale_or_api(err, ControllerKind::ReplicaSet, namespace, name))?;
        Ok(replica_set
            .metadata
            .owner_references
            .and_then(|refs| refs.into_iter().next())
            .map(|owner| OwnerRef {
                kind: owner.kind,
                name: owner.name,
            }))
    }
}

/// Classify an API error: a 404 mid-walk means the flow outlived its object
fn stale_or_api(
    err: kube::Error,
    kind: ControllerKind,
    namespace: &str,
    name: &str,
) -> ResolutionError {
    match err {
        kube::Error::Api(ref response) if response.code == 404 => ResolutionError::StaleReference {
            kind: kind.as_str().to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        other => ResolutionError::Api(other),
    }
}
