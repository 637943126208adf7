//! Port-forward tunnel to the flow-data broker
//!
//! The broker only listens inside the cluster. This module resolves the
//! broker service to a ready backing pod and bridges a local listener to the
//! pod's port over the Kubernetes API, so the rest of the code can talk
//! plain HTTP to `127.0.0.1`. Setup is bounded by a timeout and reports
//! failure instead of hanging; each accepted connection gets its own
//! forwarding stream.

use std::net::Ipv4Addr;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::ListParams;
use kube::{Api, Client};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::{BROKER_PORT, BROKER_SERVICE_NAME, FALLBACK_BROKER_NAMESPACE};

/// Upper bound on tunnel establishment, probe included
const SETUP_TIMEOUT: Duration = Duration::from_secs(30);

/// A live tunnel to the broker
///
/// Dropping the tunnel stops the accept loop; in-flight connections are
/// dropped with it.
pub struct BrokerTunnel {
    base_url: String,
    task: tokio::task::JoinHandle<()>,
}

impl BrokerTunnel {
    /// Local base URL the broker is reachable on while the tunnel lives
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl Drop for BrokerTunnel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Open a tunnel to the broker service in the given namespace
///
/// Falls back to `kube-system` when the service is absent from the
/// configured namespace, matching how the broker is commonly deployed.
pub async fn open(client: &Client, namespace: &str) -> crate::Result<BrokerTunnel> {
    let (service, service_namespace) = find_broker_service(client, namespace).await?;

    let selector = service
        .spec
        .and_then(|spec| spec.selector)
        .unwrap_or_default();
    if selector.is_empty() {
        return Err(Error::port_forward(format!(
            "service {service_namespace}/{BROKER_SERVICE_NAME} has no selector"
        )));
    }
    let label_selector = selector
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",");

    let pods: Api<Pod> = Api::namespaced(client.clone(), &service_namespace);
    let backing = pods
        .list(&ListParams::default().labels(&label_selector))
        .await?
        .items
        .into_iter()
        .find(crate::k8s::is_running)
        .ok_or_else(|| {
            Error::port_forward(format!(
                "no ready pod backs service {service_namespace}/{BROKER_SERVICE_NAME}"
            ))
        })?;
    let pod_name = backing
        .metadata
        .name
        .ok_or_else(|| Error::port_forward("broker pod has no name"))?;

    // Establish one forward up front so configuration problems surface now,
    // not on the first request.
    let probe = tokio::time::timeout(SETUP_TIMEOUT, pods.portforward(&pod_name, &[BROKER_PORT]))
        .await
        .map_err(|_| Error::port_forward("timed out establishing port-forward to broker"))??;
    drop(probe);

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, pod = %pod_name, namespace = %service_namespace, "broker tunnel established");

    let task = tokio::spawn(accept_loop(listener, pods, pod_name));
    Ok(BrokerTunnel {
        base_url: format!("http://{local_addr}"),
        task,
    })
}

/// Locate the broker service, trying the fallback namespace on a miss
async fn find_broker_service(
    client: &Client,
    namespace: &str,
) -> crate::Result<(Service, String)> {
    let services: Api<Service> = Api::namespaced(client.clone(), namespace);
    match services.get(BROKER_SERVICE_NAME).await {
        Ok(service) => Ok((service, namespace.to_string())),
        Err(kube::Error::Api(response))
            if response.code == 404 && namespace != FALLBACK_BROKER_NAMESPACE =>
        {
            warn!(
                %namespace,
                fallback = FALLBACK_BROKER_NAMESPACE,
                "broker service not found, trying fallback namespace"
            );
            let fallback: Api<Service> =
                Api::namespaced(client.clone(), FALLBACK_BROKER_NAMESPACE);
            let service = fallback.get(BROKER_SERVICE_NAME).await.map_err(|_| {
                Error::port_forward(format!(
                    "broker service {BROKER_SERVICE_NAME} found in neither {namespace} nor {FALLBACK_BROKER_NAMESPACE}"
                ))
            })?;
            Ok((service, FALLBACK_BROKER_NAMESPACE.to_string()))
        }
        Err(err) => Err(err.into()),
    }
}

/// Forward every accepted local connection through its own API stream
async fn accept_loop(listener: TcpListener, pods: Api<Pod>, pod_name: String) {
    loop {
        let (mut local, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(error = %err, "broker tunnel listener failed");
                return;
            }
        };
        let pods = pods.clone();
        let pod_name = pod_name.clone();
        tokio::spawn(async move {
            match pods.portforward(&pod_name, &[BROKER_PORT]).await {
                Ok(mut forwarder) => {
                    let Some(mut upstream) = forwarder.take_stream(BROKER_PORT) else {
                        warn!(pod = %pod_name, "port-forward returned no stream");
                        return;
                    };
                    if let Err(err) = tokio::io::copy_bidirectional(&mut local, &mut upstream).await
                    {
                        debug!(error = %err, "broker tunnel connection closed");
                    }
                }
                Err(err) => warn!(error = %err, pod = %pod_name, "port-forward connection failed"),
            }
        });
    }
}
