use crate::context::Context;
use crate::crd::{ClusterMetadata, InstallIntent};
use crate::external::{DeploymentDescriptor, HostDescriptor, ReleaseImageSet};
use crate::reconcile::configs::{
    self, CA_BUNDLE_KEY, IMAGE_BASED_CONFIG_FILE, INSTALL_CONFIG_FILE, INVOKER_MANIFEST_FILE,
    NMSTATE_KEY, START_TIME_MANIFEST_FILE,
};
use crate::reconcile::credentials::ensure_credential_secrets;
use crate::reconcile::workspace::IntentWorkspace;

use ibiop_operator::error::{Error, Result};

use std::path::Path;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::Api;
use kube::client::Client;
use kube::ResourceExt;
use tracing::{debug, info};

const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";

/// Inputs gathered from the declarative store before any file is written.
pub struct MaterializeInputs {
    pub pull_secret: String,
    pub ca_bundle: Option<String>,
    pub release_registry: String,
    pub network_config: Option<serde_yaml::Value>,
    /// filename -> validated YAML content, in user-provided order
    pub extra_manifests: Vec<(String, String)>,
}

async fn read_secret_key(client: Client, namespace: &str, name: &str, key: &str) -> Result<String> {
    let api = Api::<Secret>::namespaced(client, namespace);
    let secret = api.get(name).await.map_err(|e| {
        Error::KubeError(format!("failed to get Secret {namespace}/{name}"), Box::new(e))
    })?;
    let data = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .ok_or_else(|| {
            Error::MissingData(format!("Secret {namespace}/{name} has no '{key}' key"))
        })?;
    String::from_utf8(data.0.clone()).map_err(|_| {
        Error::ValidationError(format!("Secret {namespace}/{name} key '{key}' is not UTF-8"))
    })
}

async fn read_config_map(client: Client, namespace: &str, name: &str) -> Result<ConfigMap> {
    let api = Api::<ConfigMap>::namespaced(client, namespace);
    api.get(name).await.map_err(|e| {
        Error::KubeError(
            format!("failed to get ConfigMap {namespace}/{name}"),
            Box::new(e),
        )
    })
}

pub async fn fetch_inputs(
    client: Client,
    intent: &InstallIntent,
    deployment: &DeploymentDescriptor,
    host: &HostDescriptor,
) -> Result<MaterializeInputs> {
    let namespace = intent.get_namespace();

    let pull_secret_name = intent
        .spec
        .pull_secret_ref
        .as_ref()
        .or(deployment.spec.pull_secret_ref.as_ref())
        .map(|r| r.name.clone())
        .ok_or_else(|| {
            Error::MissingData(format!(
                "neither InstallIntent {namespace}/{} nor its deployment reference a pull secret",
                intent.name_any()
            ))
        })?;
    let pull_secret =
        read_secret_key(client.clone(), &namespace, &pull_secret_name, DOCKER_CONFIG_JSON_KEY)
            .await?;
    configs::validate_pull_secret(&pull_secret)?;

    let ca_bundle = match intent.spec.ca_bundle_ref.as_ref() {
        Some(ca_ref) => {
            let config_map = read_config_map(client.clone(), &namespace, &ca_ref.name).await?;
            let bundle = config_map
                .data
                .as_ref()
                .and_then(|data| data.get(CA_BUNDLE_KEY))
                .ok_or_else(|| {
                    Error::ValidationError(format!(
                        "ConfigMap {namespace}/{} has no '{CA_BUNDLE_KEY}' key",
                        ca_ref.name
                    ))
                })?;
            Some(bundle.clone())
        }
        None => None,
    };

    let image_set_api = Api::<ReleaseImageSet>::all(client.clone());
    let image_set = image_set_api
        .get(&intent.spec.image_set_ref.name)
        .await
        .map_err(|e| {
            Error::KubeError(
                format!(
                    "failed to get ReleaseImageSet {}",
                    intent.spec.image_set_ref.name
                ),
                Box::new(e),
            )
        })?;
    let release_registry = image_set.registry_host().to_string();

    let network_config = match host.spec.preprovisioning_network_data_name.as_ref() {
        Some(secret_name) => {
            let raw =
                read_secret_key(client.clone(), &host.get_namespace(), secret_name, NMSTATE_KEY)
                    .await?;
            Some(configs::parse_nmstate(&raw)?)
        }
        None => None,
    };

    let mut extra_manifests = Vec::new();
    for manifests_ref in intent.spec.extra_manifests_refs.iter().flatten() {
        let config_map = read_config_map(client.clone(), &namespace, &manifests_ref.name).await?;
        for (file_name, content) in config_map.data.iter().flatten() {
            configs::validate_manifest_yaml(file_name, content)?;
            extra_manifests.push((file_name.clone(), content.clone()));
        }
    }

    Ok(MaterializeInputs {
        pull_secret,
        ca_bundle,
        release_registry,
        network_config,
        extra_manifests,
    })
}

async fn write_file(path: &Path, content: &str) -> Result<()> {
    tokio::fs::write(path, content)
        .await
        .map_err(|e| Error::IoError(format!("failed to write {}", path.display()), e))
}

/// Lay down the `cluster-configuration` tree the image builder consumes.
pub async fn write_workspace_files(
    workspace: &IntentWorkspace,
    intent: &InstallIntent,
    deployment: &DeploymentDescriptor,
    inputs: &MaterializeInputs,
) -> Result<()> {
    let manifests_dir = workspace.extra_manifests_dir();
    tokio::fs::create_dir_all(&manifests_dir)
        .await
        .map_err(|e| Error::IoError(format!("failed to create {}", manifests_dir.display()), e))?;

    let invoker = configs::to_yaml(&configs::invoker_manifest(), INVOKER_MANIFEST_FILE)?;
    write_file(&manifests_dir.join(INVOKER_MANIFEST_FILE), &invoker).await?;
    let start_time = configs::to_yaml(&configs::start_time_manifest(), START_TIME_MANIFEST_FILE)?;
    write_file(&manifests_dir.join(START_TIME_MANIFEST_FILE), &start_time).await?;
    for (file_name, content) in &inputs.extra_manifests {
        write_file(&manifests_dir.join(file_name), content).await?;
    }

    let install_config = configs::build_install_config(
        intent,
        &deployment.spec.cluster_name,
        &deployment.spec.base_domain,
        inputs.pull_secret.clone(),
        inputs.ca_bundle.clone(),
    );
    write_file(
        &workspace.install_config_path(),
        &configs::to_yaml(&install_config, INSTALL_CONFIG_FILE)?,
    )
    .await?;

    let image_based_config = configs::build_image_based_config(
        intent,
        &inputs.release_registry,
        inputs.network_config.clone(),
    );
    write_file(
        &workspace.image_based_config_path(),
        &configs::to_yaml(&image_based_config, IMAGE_BASED_CONFIG_FILE)?,
    )
    .await
}

/// Materialize the workspace. Runs under the per-intent write lock.
///
/// When the ISO and credential files already exist only the credential
/// secrets are reconciled; otherwise the full tree is rebuilt from the
/// declarative inputs and the image builder is invoked.
pub async fn materialize(
    ctx: &Context,
    intent: &InstallIntent,
    deployment: &DeploymentDescriptor,
    host: &HostDescriptor,
    metadata: &ClusterMetadata,
    workspace: &IntentWorkspace,
) -> Result<()> {
    let client = ctx.ibiop_ctx.client.clone();
    if workspace.artifacts_present() {
        debug!(
            msg = "configuration image already present, skipping generation",
            dir = %workspace.dir().display()
        );
        return ensure_credential_secrets(client, deployment, metadata, workspace).await;
    }

    let inputs = fetch_inputs(client.clone(), intent, deployment, host).await?;
    write_workspace_files(workspace, intent, deployment, &inputs).await?;
    ctx.image_builder
        .build(&workspace.cluster_config_dir())
        .await?;
    info!(
        msg = "workspace materialized",
        dir = %workspace.dir().display()
    );
    ensure_credential_secrets(client, deployment, metadata, workspace).await
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::InstallIntentSpec;
    use crate::external::DeploymentDescriptorSpec;

    fn intent() -> InstallIntent {
        InstallIntent::new(
            "cluster1",
            InstallIntentSpec {
                machine_network: Some("192.168.1.0/24".to_string()),
                hostname: Some("node0".to_string()),
                ..InstallIntentSpec::default()
            },
        )
    }

    fn deployment() -> DeploymentDescriptor {
        DeploymentDescriptor::new(
            "cluster1",
            DeploymentDescriptorSpec {
                cluster_name: "cluster1".to_string(),
                base_domain: "example.com".to_string(),
                ..DeploymentDescriptorSpec::default()
            },
        )
    }

    fn inputs() -> MaterializeInputs {
        MaterializeInputs {
            pull_secret: r#"{"auths":{"quay.io":{"auth":"dXNlcjpwYXNz"}}}"#.to_string(),
            ca_bundle: None,
            release_registry: "quay.io".to_string(),
            network_config: None,
            extra_manifests: vec![(
                "user-cm.yaml".to_string(),
                "apiVersion: v1\nkind: ConfigMap\n".to_string(),
            )],
        }
    }

    #[tokio::test]
    async fn test_write_workspace_files_lays_down_the_tree() {
        let root = tempfile::tempdir().unwrap();
        let workspace = IntentWorkspace::new(root.path(), "ns", "uid");

        write_workspace_files(&workspace, &intent(), &deployment(), &inputs())
            .await
            .unwrap();

        assert!(workspace.install_config_path().exists());
        assert!(workspace.image_based_config_path().exists());
        assert!(workspace.extra_manifests_dir().join(INVOKER_MANIFEST_FILE).exists());
        assert!(workspace.extra_manifests_dir().join(START_TIME_MANIFEST_FILE).exists());
        assert!(workspace.extra_manifests_dir().join("user-cm.yaml").exists());

        let install_config = tokio::fs::read_to_string(workspace.install_config_path())
            .await
            .unwrap();
        assert!(install_config.contains("baseDomain: example.com"));
        assert!(install_config.contains("cidr: 192.168.1.0/24"));

        let image_config = tokio::fs::read_to_string(workspace.image_based_config_path())
            .await
            .unwrap();
        assert!(image_config.contains("releaseRegistry: quay.io"));
        assert!(image_config.contains("hostname: node0"));
    }

    #[tokio::test]
    async fn test_written_configs_parse_back() {
        let root = tempfile::tempdir().unwrap();
        let workspace = IntentWorkspace::new(root.path(), "ns", "uid");
        write_workspace_files(&workspace, &intent(), &deployment(), &inputs())
            .await
            .unwrap();

        let raw = tokio::fs::read_to_string(workspace.install_config_path())
            .await
            .unwrap();
        let parsed: configs::InstallConfig = serde_yaml::from_str(&raw).unwrap();
        assert_eq!(parsed.metadata.name, "cluster1");
        assert_eq!(
            parsed.networking.unwrap().machine_network[0].cidr,
            "192.168.1.0/24"
        );
    }
}
