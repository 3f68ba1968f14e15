use crate::crd::ClusterMetadata;
use crate::external::{
    CLUSTER_DEPLOYMENT_NAME_LABEL, DeploymentDescriptor, SECRET_TYPE_KUBEADMIN_CREDS,
    SECRET_TYPE_KUBECONFIG, SECRET_TYPE_LABEL,
};
use crate::reconcile::workspace::IntentWorkspace;

use ibiop_operator::error::{Error, Result};

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::client::Client;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

pub const KUBECONFIG_KEY: &str = "kubeconfig";
pub const USERNAME_KEY: &str = "username";
pub const PASSWORD_KEY: &str = "password";
pub const KUBEADMIN_USER: &str = "kubeadmin";

fn hive_labels(deployment_name: &str, secret_type: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            CLUSTER_DEPLOYMENT_NAME_LABEL.to_string(),
            deployment_name.to_string(),
        ),
        (SECRET_TYPE_LABEL.to_string(), secret_type.to_string()),
    ])
}

fn credential_secret(
    deployment: &DeploymentDescriptor,
    name: &str,
    secret_type: &str,
    data: BTreeMap<String, ByteString>,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: deployment.namespace(),
            labels: Some(hive_labels(&deployment.name_any(), secret_type)),
            owner_references: deployment.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..ObjectMeta::default()
        },
        data: Some(data),
        ..Secret::default()
    }
}

pub fn kubeconfig_secret(
    deployment: &DeploymentDescriptor,
    name: &str,
    kubeconfig: Vec<u8>,
) -> Secret {
    credential_secret(
        deployment,
        name,
        SECRET_TYPE_KUBECONFIG,
        BTreeMap::from([(KUBECONFIG_KEY.to_string(), ByteString(kubeconfig))]),
    )
}

pub fn kubeadmin_password_secret(
    deployment: &DeploymentDescriptor,
    name: &str,
    password: Vec<u8>,
) -> Secret {
    credential_secret(
        deployment,
        name,
        SECRET_TYPE_KUBEADMIN_CREDS,
        BTreeMap::from([
            (
                USERNAME_KEY.to_string(),
                ByteString(KUBEADMIN_USER.as_bytes().to_vec()),
            ),
            (PASSWORD_KEY.to_string(), ByteString(password)),
        ]),
    )
}

/// All keys the desired secret carries are already byte-equal on the
/// existing one.
pub fn secret_data_matches(existing: &Secret, desired: &Secret) -> bool {
    let Some(desired_data) = desired.data.as_ref() else {
        return true;
    };
    let existing_data = existing.data.as_ref();
    desired_data.iter().all(|(key, value)| {
        existing_data.and_then(|data| data.get(key)) == Some(value)
    })
}

async fn ensure_secret(client: Client, desired: Secret) -> Result<()> {
    // safe unwrap: credential secrets are always namespaced
    let namespace = desired.namespace().unwrap();
    let name = desired.name_any();
    let api = Api::<Secret>::namespaced(client, &namespace);
    let existing = api.get_opt(&name).await.map_err(|e| {
        Error::KubeError(format!("failed to get Secret {namespace}/{name}"), Box::new(e))
    })?;
    match existing {
        Some(existing) if secret_data_matches(&existing, &desired) => {
            debug!(msg = "credential secret up to date", namespace, name);
            Ok(())
        }
        Some(_) => {
            info!(msg = "updating credential secret", namespace, name);
            api.patch(&name, &PatchParams::default(), &Patch::Merge(&desired))
                .await
                .map_err(|e| {
                    Error::KubeError(
                        format!("failed to patch Secret {namespace}/{name}"),
                        Box::new(e),
                    )
                })?;
            Ok(())
        }
        None => {
            info!(msg = "creating credential secret", namespace, name);
            api.create(&PostParams::default(), &desired)
                .await
                .map_err(|e| {
                    Error::KubeError(
                        format!("failed to create Secret {namespace}/{name}"),
                        Box::new(e),
                    )
                })?;
            Ok(())
        }
    }
}

/// Reconcile the admin kubeconfig and kubeadmin password secrets from the
/// credential files the image build left in the workspace.
pub async fn ensure_credential_secrets(
    client: Client,
    deployment: &DeploymentDescriptor,
    metadata: &ClusterMetadata,
    workspace: &IntentWorkspace,
) -> Result<()> {
    let kubeconfig = tokio::fs::read(workspace.kubeconfig_path())
        .await
        .map_err(|e| {
            Error::IoError(
                format!(
                    "failed to read {}",
                    workspace.kubeconfig_path().display()
                ),
                e,
            )
        })?;
    let password = tokio::fs::read(workspace.kubeadmin_password_path())
        .await
        .map_err(|e| {
            Error::IoError(
                format!(
                    "failed to read {}",
                    workspace.kubeadmin_password_path().display()
                ),
                e,
            )
        })?;

    ensure_secret(
        client.clone(),
        kubeconfig_secret(
            deployment,
            &metadata.admin_kubeconfig_secret_ref.name,
            kubeconfig,
        ),
    )
    .await?;
    ensure_secret(
        client,
        kubeadmin_password_secret(
            deployment,
            &metadata.admin_password_secret_ref.name,
            password,
        ),
    )
    .await
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::external::DeploymentDescriptorSpec;

    fn deployment() -> DeploymentDescriptor {
        let mut deployment = DeploymentDescriptor::new(
            "cluster1",
            DeploymentDescriptorSpec::default(),
        );
        deployment.metadata.namespace = Some("ns".to_string());
        deployment.metadata.uid = Some("uid-1".to_string());
        deployment
    }

    #[test]
    fn test_kubeconfig_secret_shape() {
        let secret = kubeconfig_secret(&deployment(), "cluster1-admin-kubeconfig", b"kc".to_vec());
        assert_eq!(secret.metadata.namespace.as_deref(), Some("ns"));
        let labels = secret.metadata.labels.as_ref().unwrap();
        assert_eq!(
            labels.get(CLUSTER_DEPLOYMENT_NAME_LABEL).unwrap(),
            "cluster1"
        );
        assert_eq!(labels.get(SECRET_TYPE_LABEL).unwrap(), SECRET_TYPE_KUBECONFIG);
        assert_eq!(
            secret.data.as_ref().unwrap().get(KUBECONFIG_KEY).unwrap(),
            &ByteString(b"kc".to_vec())
        );
        let owner = &secret.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "DeploymentDescriptor");
        assert_eq!(owner.name, "cluster1");
    }

    #[test]
    fn test_password_secret_carries_kubeadmin_user() {
        let secret =
            kubeadmin_password_secret(&deployment(), "cluster1-admin-password", b"pw".to_vec());
        let data = secret.data.as_ref().unwrap();
        assert_eq!(data.get(USERNAME_KEY).unwrap(), &ByteString(b"kubeadmin".to_vec()));
        assert_eq!(data.get(PASSWORD_KEY).unwrap(), &ByteString(b"pw".to_vec()));
    }

    #[test]
    fn test_secret_data_matches_is_byte_exact() {
        let desired = kubeconfig_secret(&deployment(), "s", b"kc".to_vec());
        let mut existing = desired.clone();
        assert!(secret_data_matches(&existing, &desired));

        existing
            .data
            .as_mut()
            .unwrap()
            .insert(KUBECONFIG_KEY.to_string(), ByteString(b"other".to_vec()));
        assert!(!secret_data_matches(&existing, &desired));

        existing.data = None;
        assert!(!secret_data_matches(&existing, &desired));
    }
}
