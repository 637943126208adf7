//! File output for generated artifacts
//!
//! One file per pod and artifact kind, named so that batch runs across
//! namespaces can never collide: the namespace and pod name are both part
//! of the filename. Applying manifests to the live cluster is deliberately
//! not implemented; files are the interface.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::engine::PolicyOutput;

/// Create the output directory if it does not exist yet
pub async fn ensure_dir(dir: &Path) -> crate::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

/// Filename for a generated network policy
pub fn policy_filename(namespace: &str, pod_name: &str, schema: crate::policy::PolicySchema) -> String {
    format!("{namespace}-{pod_name}-{schema}-networkpolicy.yaml")
}

/// Filename for a generated seccomp profile
pub fn seccomp_filename(namespace: &str, pod_name: &str) -> String {
    format!("{namespace}-{pod_name}-seccomp.json")
}

/// Write a generated policy under the output directory
pub async fn write_policy(dir: &Path, output: &PolicyOutput) -> crate::Result<PathBuf> {
    let path = dir.join(policy_filename(&output.namespace, &output.pod_name, output.schema));
    tokio::fs::write(&path, output.yaml.as_bytes()).await?;
    info!(
        pod = %output.pod_name,
        namespace = %output.namespace,
        path = %path.display(),
        "wrote network policy"
    );
    Ok(path)
}

/// Write a seccomp profile under the output directory
pub async fn write_seccomp_profile(
    dir: &Path,
    namespace: &str,
    pod_name: &str,
    json: &str,
) -> crate::Result<PathBuf> {
    let path = dir.join(seccomp_filename(namespace, pod_name));
    tokio::fs::write(&path, json.as_bytes()).await?;
    info!(
        pod = %pod_name,
        %namespace,
        path = %path.display(),
        "wrote seccomp profile"
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicySchema;

    #[test]
    fn policy_filenames_encode_namespace_pod_and_schema() {
        assert_eq!(
            policy_filename("shop", "web", PolicySchema::Standard),
            "shop-web-standard-networkpolicy.yaml"
        );
        assert_eq!(
            policy_filename("shop", "web", PolicySchema::Cilium),
            "shop-web-cilium-networkpolicy.yaml"
        );
        assert_eq!(seccomp_filename("shop", "web"), "shop-web-seccomp.json");
    }

    #[tokio::test]
    async fn policies_land_in_the_output_directory() {
        let dir = std::env::temp_dir().join(format!("palisade-test-{}", std::process::id()));
        ensure_dir(&dir).await.expect("create dir");

        let output = PolicyOutput {
            pod_name: "web".to_string(),
            namespace: "shop".to_string(),
            schema: PolicySchema::Standard,
            policy_name: "web-standard-policy".to_string(),
            yaml: "kind: NetworkPolicy\n".to_string(),
        };
        let path = write_policy(&dir, &output).await.expect("write");
        let written = tokio::fs::read_to_string(&path).await.expect("read back");
        assert_eq!(written, "kind: NetworkPolicy\n");

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
