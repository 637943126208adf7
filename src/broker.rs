//! HTTP client for the flow-data broker
//!
//! The broker records flows, pod/service details and syscalls into its
//! database and serves them over a small REST API, normally reachable only
//! inside the cluster (see [`crate::portforward`]). Identity lookups follow
//! a not-found-is-`None` convention: the broker answers 404 for addresses it
//! has never seen, and that is an ordinary outcome, not an error.

use std::time::Duration;

use k8s_openapi::api::core::v1::{Pod, Service};
use serde::Deserialize;
use tracing::debug;

use crate::error::Error;
use crate::flow::TrafficRecord;
use crate::identity::{PodIdentity, ServiceIdentity};
use crate::seccomp::PodSyscalls;

/// Timeout applied to every broker request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Client for the broker REST API
#[derive(Clone, Debug)]
pub struct BrokerClient {
    http: reqwest::Client,
    base_url: String,
}

/// Pod row as stored by the broker, carrying the full pod object
#[derive(Debug, Deserialize)]
struct PodRecord {
    #[serde(default)]
    pod_name: String,
    #[serde(default)]
    pod_ip: String,
    #[serde(default)]
    pod_namespace: Option<String>,
    #[serde(default)]
    pod_obj: Option<Pod>,
}

/// Service row as stored by the broker, carrying the full service object
#[derive(Debug, Deserialize)]
struct SvcRecord {
    #[serde(default)]
    svc_name: Option<String>,
    #[serde(default)]
    svc_namespace: Option<String>,
    #[serde(default)]
    service_spec: Option<Service>,
}

impl BrokerClient {
    /// Create a client against a broker base URL (no trailing slash)
    pub fn new(base_url: impl Into<String>) -> crate::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    /// All recorded flows referencing a pod
    ///
    /// An empty list is a valid answer (the pod was quiet or unknown); the
    /// caller turns that into a default-deny policy rather than an error.
    pub async fn pod_traffic(&self, pod_name: &str) -> crate::Result<Vec<TrafficRecord>> {
        let url = format!("{}/pod/traffic/{}", self.base_url, pod_name);
        let response = self.http.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(pod = %pod_name, "broker has no traffic for pod");
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(Error::BrokerStatus {
                status: response.status().as_u16(),
                url,
            });
        }
        Ok(response.json().await?)
    }

    /// Pod identity for an IP, if the broker knows one
    pub async fn pod_by_ip(&self, ip: &str) -> crate::Result<Option<PodIdentity>> {
        let url = format!("{}/pod/ip/{}", self.base_url, ip);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            debug!(%ip, status = %response.status(), "no pod record for ip");
            return Ok(None);
        }
        let record: PodRecord = response.json().await?;
        Ok(Some(pod_identity_from(record)))
    }

    /// Service identity for a ClusterIP, if the broker knows one
    pub async fn service_by_ip(&self, ip: &str) -> crate::Result<Option<ServiceIdentity>> {
        let url = format!("{}/svc/ip/{}", self.base_url, ip);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            debug!(%ip, status = %response.status(), "no service record for ip");
            return Ok(None);
        }
        let record: SvcRecord = response.json().await?;
        Ok(Some(service_identity_from(record)))
    }

    /// Recorded syscalls for a pod, if any
    pub async fn pod_syscalls(&self, pod_name: &str) -> crate::Result<Option<PodSyscalls>> {
        let url = format!("{}/pod/syscalls/{}", self.base_url, pod_name);
        let response = self.http.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(pod = %pod_name, "broker has no syscalls for pod");
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::BrokerStatus {
                status: response.status().as_u16(),
                url,
            });
        }
        let mut rows: Vec<PodSyscalls> = response.json().await?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.swap_remove(0))
        })
    }
}

/// Build a pod identity from a broker row
///
/// The embedded pod object is authoritative where present; the row's own
/// columns fill the gaps (and the row is keyed by IP, so that always wins).
fn pod_identity_from(record: PodRecord) -> PodIdentity {
    let mut identity = record
        .pod_obj
        .as_ref()
        .map(PodIdentity::from_pod)
        .unwrap_or_default();
    if identity.name.is_empty() {
        identity.name = record.pod_name;
    }
    if identity.namespace.is_empty() {
        identity.namespace = record.pod_namespace.unwrap_or_default();
    }
    if !record.pod_ip.is_empty() {
        identity.pod_ip = record.pod_ip;
    }
    identity
}

fn service_identity_from(record: SvcRecord) -> ServiceIdentity {
    let mut identity = record
        .service_spec
        .as_ref()
        .map(ServiceIdentity::from_service)
        .unwrap_or_default();
    if identity.name.is_empty() {
        identity.name = record.svc_name.unwrap_or_default();
    }
    if identity.namespace.is_empty() {
        identity.namespace = record.svc_namespace.unwrap_or_default();
    }
    identity
}
