//! Error types for palisade

use thiserror::Error;

/// Main error type for policy generation operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Broker request failed at the transport level
    #[error("broker request error: {0}")]
    Request(#[from] reqwest::Error),

    /// Broker answered with an unexpected HTTP status
    #[error("broker returned status {status} for {url}")]
    BrokerStatus {
        /// HTTP status code the broker answered with
        status: u16,
        /// URL of the failed request
        url: String,
    },

    /// Port-forward tunnel could not be established or broke down
    #[error("port-forward error: {0}")]
    PortForward(String),

    /// Filesystem error while writing generated artifacts
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a port-forward error with the given message
    pub fn port_forward(msg: impl Into<String>) -> Self {
        Self::PortForward(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}

/// Failure modes of identity-to-selector resolution
///
/// These never abort policy generation on their own: peer resolution falls
/// back to a CIDR peer and target-selector resolution falls back to an
/// `app: <pod>` selector. They are typed so callers can tell a missing
/// selector from a deleted controller from a plain API failure.
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// Service has no selector (headless or ExternalName)
    #[error("service {namespace}/{name} has no selector")]
    NoSelector {
        /// Namespace of the service
        namespace: String,
        /// Name of the service
        name: String,
    },

    /// Pod is controlled by a kind the resolver does not understand
    #[error("unsupported owner kind: {kind}")]
    UnsupportedOwnerKind {
        /// Owner kind as recorded in the pod's owner references
        kind: String,
    },

    /// Owner chain references an object that no longer exists
    #[error("{kind} {namespace}/{name} no longer exists")]
    StaleReference {
        /// Kind of the missing object
        kind: String,
        /// Namespace of the missing object
        namespace: String,
        /// Name of the missing object
        name: String,
    },

    /// Kubernetes API failure unrelated to a missing object
    #[error("kubernetes error: {0}")]
    Api(#[source] kube::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_errors_render_their_context() {
        let err = ResolutionError::NoSelector {
            namespace: "default".to_string(),
            name: "headless".to_string(),
        };
        assert_eq!(err.to_string(), "service default/headless has no selector");

        let err = ResolutionError::StaleReference {
            kind: "Deployment".to_string(),
            namespace: "prod".to_string(),
            name: "api".to_string(),
        };
        assert_eq!(err.to_string(), "Deployment prod/api no longer exists");
    }

    #[test]
    fn helper_constructors_build_expected_variants() {
        assert!(matches!(
            Error::port_forward("no ready pod"),
            Error::PortForward(_)
        ));
        assert!(matches!(
            Error::serialization("bad yaml"),
            Error::Serialization(_)
        ));
    }
}
