use crate::crd::{ClusterMetadata, InstallIntent, SecretRef};
use crate::external::DeploymentDescriptor;

use ibiop_operator::error::{Error, Result};

use kube::api::{Api, Patch, PatchParams};
use kube::client::Client;
use kube::ResourceExt;
use rand::Rng;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

const INFRA_ID_PREFIX_MAX: usize = 21;
const INFRA_ID_SUFFIX_LEN: usize = 5;
const SUFFIX_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Lowercase, replace non-alphanumerics with `-`, collapse runs, truncate to
/// 21 characters and strip a trailing `-`. Idempotent.
pub fn sanitize_cluster_name(name: &str) -> String {
    let mut out = String::new();
    let mut previous_dash = false;
    for c in name.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            previous_dash = false;
        } else if !previous_dash {
            out.push('-');
            previous_dash = true;
        }
    }
    out.truncate(INFRA_ID_PREFIX_MAX);
    out.trim_end_matches('-').to_string()
}

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..INFRA_ID_SUFFIX_LEN)
        .map(|_| SUFFIX_CHARS[rng.gen_range(0..SUFFIX_CHARS.len())] as char)
        .collect()
}

pub fn generate_infra_id(cluster_name: &str) -> String {
    format!("{}-{}", sanitize_cluster_name(cluster_name), random_suffix())
}

pub fn admin_kubeconfig_secret_name(deployment_name: &str) -> String {
    format!("{deployment_name}-admin-kubeconfig")
}

pub fn admin_password_secret_name(deployment_name: &str) -> String {
    format!("{deployment_name}-admin-password")
}

/// Ensure `spec.clusterMetadata` is populated. clusterID and infraID are
/// monotonic: existing values are reused verbatim; the secret references are
/// always reset to the canonical names derived from the deployment name.
pub async fn ensure_cluster_identity(
    client: Client,
    intent: &InstallIntent,
    deployment: &DeploymentDescriptor,
) -> Result<ClusterMetadata> {
    let namespace = intent.get_namespace();
    let name = intent.name_any();
    let deployment_name = deployment.name_any();

    let existing = intent.spec.cluster_metadata.as_ref();
    let cluster_id = existing
        .map(|m| m.cluster_id.clone())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let infra_id = existing
        .map(|m| m.infra_id.clone())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| generate_infra_id(&deployment.spec.cluster_name));

    let metadata = ClusterMetadata {
        cluster_id,
        infra_id,
        admin_kubeconfig_secret_ref: SecretRef {
            name: admin_kubeconfig_secret_name(&deployment_name),
        },
        admin_password_secret_ref: SecretRef {
            name: admin_password_secret_name(&deployment_name),
        },
    };

    if existing == Some(&metadata) {
        debug!(msg = "cluster identity already assigned", namespace, name);
        return Ok(metadata);
    }

    info!(
        msg = "assigning cluster identity",
        namespace,
        name,
        infra_id = metadata.infra_id
    );
    let api = Api::<InstallIntent>::namespaced(client, &namespace);
    api.patch(
        &name,
        &PatchParams::default(),
        &Patch::Merge(json!({"spec": {"clusterMetadata": metadata}})),
    )
    .await
    .map_err(|e| {
        Error::KubeError(
            format!("failed to patch InstallIntent {namespace}/{name}"),
            Box::new(e),
        )
    })?;
    Ok(metadata)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sanitize_replaces_and_collapses() {
        assert_eq!(sanitize_cluster_name("my cluster"), "my-cluster");
        assert_eq!(sanitize_cluster_name("My__Cluster!!1"), "my-cluster-1");
        assert_eq!(sanitize_cluster_name("cluster1"), "cluster1");
    }

    #[test]
    fn test_sanitize_truncates_and_strips_trailing_dash() {
        let long = "abcdefghij-abcdefghij-abcdefghij";
        let sanitized = sanitize_cluster_name(long);
        assert!(sanitized.len() <= 21);
        assert!(!sanitized.ends_with('-'));
        assert_eq!(sanitized, "abcdefghij-abcdefghi");
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        for name in ["my cluster", "A!!B", "abcdefghij-abcdefghij-x", "x"] {
            let once = sanitize_cluster_name(name);
            assert_eq!(sanitize_cluster_name(&once), once);
        }
    }

    #[test]
    fn test_infra_id_shape() {
        let infra_id = generate_infra_id("Test Cluster");
        let (prefix, suffix) = infra_id.rsplit_once('-').unwrap();
        assert_eq!(prefix, "test-cluster");
        assert_eq!(suffix.len(), 5);
        assert!(
            suffix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        );
    }

    #[test]
    fn test_canonical_secret_names() {
        assert_eq!(
            admin_kubeconfig_secret_name("cluster1"),
            "cluster1-admin-kubeconfig"
        );
        assert_eq!(
            admin_password_secret_name("cluster1"),
            "cluster1-admin-password"
        );
    }
}
