//! Policy generation entry points
//!
//! [`Engine`] wires the pipeline together for one pod and runs batches of
//! pods with bounded concurrency. All cluster access comes in through the
//! [`FlowSource`] and [`ClusterLookup`] seams, so the engine itself carries
//! no client state and tests run against mocks.

use async_trait::async_trait;
use futures::{stream, StreamExt};
#[cfg(test)]
use mockall::automock;
use tracing::{error, info};

use crate::aggregate::aggregate;
use crate::broker::BrokerClient;
use crate::error::Error;
use crate::flow::TrafficRecord;
use crate::identity::{ClusterLookup, PodIdentity};
use crate::peer::PeerResolver;
use crate::policy::{
    cilium, resolve_rules, resolve_target_selector, standard, PolicySchema,
};

/// Source of recorded flows for a pod
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FlowSource: Send + Sync {
    /// All recorded flows referencing a pod; empty when the pod is unknown
    async fn flow_records(&self, pod_name: &str) -> crate::Result<Vec<TrafficRecord>>;
}

#[async_trait]
impl FlowSource for BrokerClient {
    async fn flow_records(&self, pod_name: &str) -> crate::Result<Vec<TrafficRecord>> {
        self.pod_traffic(pod_name).await
    }
}

/// One generated policy, ready to write or print
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyOutput {
    /// Pod the policy was generated for
    pub pod_name: String,
    /// Namespace the policy belongs in
    pub namespace: String,
    /// Schema the policy was rendered in
    pub schema: PolicySchema,
    /// Name of the policy object
    pub policy_name: String,
    /// Serialized manifest
    pub yaml: String,
}

/// One pod that could not be processed in a batch
#[derive(Debug)]
pub struct PodFailure {
    /// Pod that failed
    pub pod_name: String,
    /// Namespace of that pod
    pub namespace: String,
    /// What went wrong
    pub error: Error,
}

/// Result of a batch run
///
/// A failed pod never aborts the batch; failures are collected alongside
/// the successful outputs, in input order.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Successfully generated policies
    pub policies: Vec<PolicyOutput>,
    /// Pods that were skipped, with their errors
    pub failures: Vec<PodFailure>,
}

impl BatchOutcome {
    /// First error encountered, for reporting and exit status
    pub fn first_error(&self) -> Option<&Error> {
        self.failures.first().map(|failure| &failure.error)
    }
}

/// Traffic-to-policy engine
pub struct Engine<'a> {
    flows: &'a dyn FlowSource,
    lookup: &'a dyn ClusterLookup,
}

impl<'a> Engine<'a> {
    /// Create an engine over the given collaborators
    pub fn new(flows: &'a dyn FlowSource, lookup: &'a dyn ClusterLookup) -> Self {
        Self { flows, lookup }
    }

    /// Generate one pod's policy in the requested schema
    ///
    /// Aggregation runs to completion before any peer is resolved, and all
    /// peers resolve through one memoizing resolver, so a given IP maps to
    /// the same peer everywhere in the output. A pod with no usable rules
    /// yields an explicit default-deny policy, never silence.
    pub async fn generate_policy(
        &self,
        target: &PodIdentity,
        schema: PolicySchema,
    ) -> crate::Result<PolicyOutput> {
        let records = self.flows.flow_records(&target.name).await?;
        let rules = aggregate(&records, target);

        let mut resolver = PeerResolver::new(self.lookup);
        let resolved = resolve_rules(&mut resolver, &rules).await;
        let selector = resolve_target_selector(self.lookup, target).await;

        let (policy_name, yaml) = match schema {
            PolicySchema::Standard => {
                let policy = standard::render(&selector, &resolved);
                (policy.metadata.name.clone(), to_yaml(&policy)?)
            }
            PolicySchema::Cilium => {
                let policy = cilium::render(&selector, &resolved);
                (policy.metadata.name.clone(), to_yaml(&policy)?)
            }
        };

        info!(
            pod = %target.name,
            namespace = %target.namespace,
            %schema,
            policy = %policy_name,
            "generated policy"
        );
        Ok(PolicyOutput {
            pod_name: target.name.clone(),
            namespace: target.namespace.clone(),
            schema,
            policy_name,
            yaml,
        })
    }

    /// Generate policies for many pods with bounded concurrency
    ///
    /// Pods are processed independently; a failure is recorded and the rest
    /// of the batch continues. Results come back in input order.
    pub async fn generate_policies(
        &self,
        targets: &[PodIdentity],
        schema: PolicySchema,
        concurrency: usize,
    ) -> BatchOutcome {
        let results = stream::iter(targets.iter().map(|target| async move {
            (target, self.generate_policy(target, schema).await)
        }))
        .buffered(concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

        let mut outcome = BatchOutcome::default();
        for (target, result) in results {
            match result {
                Ok(policy) => outcome.policies.push(policy),
                Err(err) => {
                    error!(
                        pod = %target.name,
                        namespace = %target.namespace,
                        error = %err,
                        "skipping pod after generation failure"
                    );
                    outcome.failures.push(PodFailure {
                        pod_name: target.name.clone(),
                        namespace: target.namespace.clone(),
                        error: err,
                    });
                }
            }
        }
        outcome
    }
}

fn to_yaml<T: serde::Serialize>(value: &T) -> crate::Result<String> {
    serde_yaml::to_string(value).map_err(|err| Error::serialization(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::TrafficRecord;
    use crate::identity::MockClusterLookup;
    use mockall::predicate::eq;
    use std::collections::BTreeMap;

    fn target(name: &str, ip: &str) -> PodIdentity {
        PodIdentity {
            namespace: "default".to_string(),
            name: name.to_string(),
            pod_ip: ip.to_string(),
            labels: BTreeMap::from([("app".to_string(), name.to_string())]),
            owner: None,
            host_network: false,
        }
    }

    fn ingress_record(peer_ip: &str, pod_port: &str) -> TrafficRecord {
        TrafficRecord {
            pod_name: Some("web".to_string()),
            pod_ip: Some("10.1.0.1".to_string()),
            pod_port: Some(pod_port.to_string()),
            ip_protocol: Some("TCP".to_string()),
            traffic_type: Some("INGRESS".to_string()),
            traffic_in_out_ip: Some(peer_ip.to_string()),
            traffic_in_out_port: Some("43210".to_string()),
            ..TrafficRecord::default()
        }
    }

    fn quiet_lookup() -> MockClusterLookup {
        let mut lookup = MockClusterLookup::new();
        lookup.expect_service_by_ip().returning(|_| Ok(None));
        lookup.expect_pod_by_ip().returning(|_| Ok(None));
        lookup
    }

    #[tokio::test]
    async fn resolvable_peer_becomes_a_selector_rule() {
        let mut flows = MockFlowSource::new();
        flows
            .expect_flow_records()
            .with(eq("web"))
            .returning(|_| Ok(vec![ingress_record("10.0.0.1", "80")]));

        let mut lookup = MockClusterLookup::new();
        lookup.expect_service_by_ip().returning(|_| Ok(None));
        lookup
            .expect_pod_by_ip()
            .with(eq("10.0.0.1"))
            .returning(|ip| Ok(Some(target("client", ip))));

        let engine = Engine::new(&flows, &lookup);
        let output = engine
            .generate_policy(&target("web", "10.1.0.1"), PolicySchema::Standard)
            .await
            .expect("generation");

        assert_eq!(output.policy_name, "web-standard-policy");
        assert!(output.yaml.contains("app: client"));
        assert!(output.yaml.contains("port: 80"));
        assert!(output.yaml.contains("policyTypes:\n- Ingress"));
        assert!(!output.yaml.contains("ipBlock"));
    }

    #[tokio::test]
    async fn unresolvable_peer_becomes_a_cidr_rule() {
        let mut flows = MockFlowSource::new();
        flows
            .expect_flow_records()
            .returning(|_| Ok(vec![ingress_record("10.0.0.1", "80")]));

        let engine_lookup = quiet_lookup();
        let engine = Engine::new(&flows, &engine_lookup);
        let output = engine
            .generate_policy(&target("web", "10.1.0.1"), PolicySchema::Standard)
            .await
            .expect("generation");

        assert!(output.yaml.contains("cidr: 10.0.0.1/32"));
    }

    #[tokio::test]
    async fn empty_traffic_yields_an_explicit_default_deny() {
        let mut flows = MockFlowSource::new();
        flows.expect_flow_records().returning(|_| Ok(Vec::new()));

        let lookup = quiet_lookup();
        let engine = Engine::new(&flows, &lookup);
        let output = engine
            .generate_policy(&target("p", "10.1.0.9"), PolicySchema::Standard)
            .await
            .expect("generation");

        assert_eq!(output.policy_name, "p-standard-policy-deny-all");
        assert!(output.yaml.contains("ingress: []"));
        assert!(output.yaml.contains("egress: []"));
        assert!(output.yaml.contains("app: p"));
    }

    #[tokio::test]
    async fn both_schemas_render_from_the_same_pipeline() {
        let mut flows = MockFlowSource::new();
        flows
            .expect_flow_records()
            .times(2)
            .returning(|_| Ok(vec![ingress_record("10.0.0.1", "80")]));

        let lookup = quiet_lookup();
        let engine = Engine::new(&flows, &lookup);
        let web = target("web", "10.1.0.1");

        let standard = engine
            .generate_policy(&web, PolicySchema::Standard)
            .await
            .expect("standard");
        let cilium = engine
            .generate_policy(&web, PolicySchema::Cilium)
            .await
            .expect("cilium");

        assert!(standard.yaml.contains("kind: NetworkPolicy"));
        assert!(cilium.yaml.contains("kind: CiliumNetworkPolicy"));
        assert!(cilium.yaml.contains("fromCIDR"));
    }

    #[tokio::test]
    async fn a_failing_pod_does_not_abort_the_batch() {
        let mut flows = MockFlowSource::new();
        flows.expect_flow_records().returning(|pod_name| {
            if pod_name == "broken" {
                Err(Error::port_forward("tunnel collapsed"))
            } else {
                Ok(Vec::new())
            }
        });

        let lookup = quiet_lookup();
        let engine = Engine::new(&flows, &lookup);
        let targets = vec![
            target("broken", "10.1.0.1"),
            target("healthy", "10.1.0.2"),
        ];

        let outcome = engine
            .generate_policies(&targets, PolicySchema::Standard, 4)
            .await;

        assert_eq!(outcome.policies.len(), 1);
        assert_eq!(outcome.policies[0].pod_name, "healthy");
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].pod_name, "broken");
        assert!(outcome.first_error().is_some());
    }

    #[tokio::test]
    async fn batch_results_come_back_in_input_order() {
        let mut flows = MockFlowSource::new();
        flows.expect_flow_records().returning(|_| Ok(Vec::new()));

        let lookup = quiet_lookup();
        let engine = Engine::new(&flows, &lookup);
        let targets: Vec<PodIdentity> = (0..8)
            .map(|i| target(&format!("pod-{i}"), &format!("10.1.0.{i}")))
            .collect();

        let outcome = engine
            .generate_policies(&targets, PolicySchema::Cilium, 3)
            .await;

        let names: Vec<_> = outcome
            .policies
            .iter()
            .map(|policy| policy.pod_name.as_str())
            .collect();
        assert_eq!(
            names,
            vec!["pod-0", "pod-1", "pod-2", "pod-3", "pod-4", "pod-5", "pod-6", "pod-7"]
        );
    }
}
