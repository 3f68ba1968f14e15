//! Declarative records owned by external controllers. Only the fields the
//! operator reads or patches are modeled; host and data-image mutations go
//! through merge patches so everything else survives.

use crate::crd::SecretRef;

use kube::{CustomResource, ResourceExt};
#[cfg(feature = "schemars")]
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Set by the monitor on successful install so the host controller stops
/// managing the host; removed again during deprovisioning.
pub static DETACHED_ANNOTATION: &str = "baremetalhost.metal3.io/detached";

/// Empty valued; requests a reboot from the host controller. Used to boot
/// the attached image and later to unmount it.
pub static REBOOT_ANNOTATION: &str = "reboot.metal3.io";

/// Read only; the value `disabled` opts a host out of hardware validation.
pub static INSPECT_ANNOTATION: &str = "inspect.metal3.io";
pub static INSPECT_DISABLED: &str = "disabled";

/// Sentinel marker: its presence means the host entered our managed state.
pub static MANAGED_ANNOTATION: &str = "installintent.ibiop.rs/managed";

pub static CLUSTER_DEPLOYMENT_NAME_LABEL: &str = "hive.openshift.io/cluster-deployment-name";
pub static SECRET_TYPE_LABEL: &str = "hive.openshift.io/secret-type";
pub static SECRET_TYPE_KUBECONFIG: &str = "kubeconfig";
pub static SECRET_TYPE_KUBEADMIN_CREDS: &str = "kubeadmincreds";

/// A bare metal machine and its provisioning lifecycle.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[kube(
    group = "metal3.io",
    version = "v1alpha1",
    kind = "HostDescriptor",
    plural = "hostdescriptors",
    singular = "hostdescriptor",
    namespaced,
    status = "HostDescriptorStatus",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct HostDescriptorSpec {
    #[serde(default)]
    pub online: bool,

    #[serde(default)]
    pub externally_provisioned: bool,

    /// Must be `disabled` before any other host mutation so the host
    /// controller never formats the disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automated_cleaning_mode: Option<CleaningMode>,

    /// Secret with an `nmstate` key carrying static network configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preprovisioning_network_data_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "lowercase")]
pub enum CleaningMode {
    Disabled,
    Metadata,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct HostDescriptorStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning: Option<Provisioning>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<HardwareDetails>,

    #[serde(default)]
    pub powered_on: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct Provisioning {
    pub state: ProvisioningState,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
pub enum ProvisioningState {
    Available,
    Provisioning,
    Provisioned,
    ExternallyProvisioned,
    Inspecting,
    Deprovisioning,
    #[serde(other)]
    Other,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct HardwareDetails {
    #[serde(default)]
    pub nics: Vec<Nic>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct Nic {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

impl HostDescriptor {
    #[inline]
    pub fn get_namespace(&self) -> String {
        // safe unwrap: HostDescriptor is namespace scoped
        self.namespace().unwrap()
    }

    pub fn provisioning_state(&self) -> Option<ProvisioningState> {
        self.status.as_ref()?.provisioning.as_ref().map(|p| p.state)
    }

    pub fn powered_on(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.powered_on)
    }

    pub fn has_annotation(&self, key: &str) -> bool {
        self.annotations().contains_key(key)
    }

    /// Hosts annotated `inspect.metal3.io: disabled` skip hardware validation.
    pub fn inspection_disabled(&self) -> bool {
        self.annotations()
            .get(INSPECT_ANNOTATION)
            .is_some_and(|v| v == INSPECT_DISABLED)
    }

    pub fn cleaning_disabled(&self) -> bool {
        self.spec.automated_cleaning_mode == Some(CleaningMode::Disabled)
    }
}

/// Instructs the host controller to attach a virtual media image at a URL.
/// 1:1 named after its HostDescriptor.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[kube(
    group = "metal3.io",
    version = "v1alpha1",
    kind = "DataImage",
    plural = "dataimages",
    singular = "dataimage",
    namespaced,
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct DataImageSpec {
    pub url: String,
}

/// Cluster identity inputs: name, base domain, pull secret.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[kube(
    group = "hive.openshift.io",
    version = "v1",
    kind = "DeploymentDescriptor",
    plural = "deploymentdescriptors",
    singular = "deploymentdescriptor",
    namespaced,
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentDescriptorSpec {
    pub cluster_name: String,

    pub base_domain: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_secret_ref: Option<SecretRef>,

    /// Delegates installation to the referenced cluster install kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_install_ref: Option<ClusterInstallRef>,

    #[serde(default)]
    pub installed: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct ClusterInstallRef {
    pub group: String,
    pub kind: String,
    pub name: String,
}

/// Names a release image; only the registry host is derived from it.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[kube(
    group = "hive.openshift.io",
    version = "v1",
    kind = "ReleaseImageSet",
    plural = "releaseimagesets",
    singular = "releaseimageset",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseImageSetSpec {
    pub release_image: String,
}

impl ReleaseImageSet {
    /// Registry host of the release image, e.g.
    /// `quay.io/release-dev/release@sha256:...` -> `quay.io`.
    pub fn registry_host(&self) -> &str {
        self.spec
            .release_image
            .split_once('/')
            .map(|(host, _)| host)
            .unwrap_or(&self.spec.release_image)
    }
}

/// Spoke-side cluster version resource, read through the admin kubeconfig.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[kube(
    group = "config.openshift.io",
    version = "v1",
    kind = "ClusterVersion",
    plural = "clusterversions",
    singular = "clusterversion",
    status = "ClusterVersionStatus",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVersionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct ClusterVersionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<OperatorCondition>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct OperatorCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
