use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{CustomResource, ResourceExt};
#[cfg(feature = "schemars")]
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer blocking removal of an intent until its workspace, attached
/// image and data-image object have been released.
pub static INTENT_FINALIZER: &str = "installintent.ibiop.rs/deprovision";

/// Annotation overriding the default one hour install timeout, parsed as a
/// Go-style duration string (e.g. "90m").
pub static INSTALL_TIMEOUT_ANNOTATION: &str = "installintent.ibiop.rs/install-timeout";

// Condition reasons are part of the reported API and must stay stable.
pub const REASON_PENDING: &str = "Pending";
pub const REASON_HOST_PENDING: &str = "HostPending";
pub const REASON_IMAGE_READY: &str = "ImageReady";
pub const REASON_NOT_READY: &str = "NotReady";
pub const REASON_HOST_CONFIGURATION_SUCCEEDED: &str = "HostConfigurationSucceeded";
pub const REASON_HOST_CONFIGURATION_FAILED: &str = "HostConfigurationFailed";
pub const REASON_HOST_VALIDATION_PENDING: &str = "HostValidationPending";
pub const REASON_HOST_VALIDATION_SUCCEEDED: &str = "HostValidationSucceeded";
pub const REASON_HOST_VALIDATION_FAILED: &str = "HostValidationFailed";
pub const REASON_INSTALL_IN_PROGRESS: &str = "InstallInProgress";
pub const REASON_INSTALL_SUCCEEDED: &str = "InstallSucceeded";
pub const REASON_INSTALL_TIMED_OUT: &str = "InstallTimedOut";

/// An InstallIntent expresses the desire to install a cluster on a specific
/// bare metal host from a generated configuration ISO.
///
/// More info:
/// https://github.com/kubernetes/community/blob/master/contributors/devel/sig-architecture/api-conventions.md#spec-and-status
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[kube(
    category = "ibiop",
    group = "ibiop.rs",
    version = "v1alpha1",
    kind = "InstallIntent",
    plural = "installintents",
    singular = "installintent",
    shortname = "ii",
    namespaced,
    status = "InstallIntentStatus",
    doc = r#"The InstallIntent custom resource definition (CRD) drives an image based cluster installation on a referenced bare metal host."#,
    printcolumn = r#"{"name":"Requirements","type":"string","jsonPath":".status.conditions[?(@.type=='Requirements')].reason"}"#,
    printcolumn = r#"{"name":"Completed","type":"string","jsonPath":".status.conditions[?(@.type=='Completed')].reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#,
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct InstallIntentSpec {
    /// Reference to the DeploymentDescriptor carrying cluster identity inputs
    /// (cluster name, base domain, pull secret). Same namespace as the intent.
    pub deployment_ref: DeploymentRef,

    /// Reference to the HostDescriptor the cluster is installed on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ref: Option<HostRef>,

    /// Reference to the ReleaseImageSet naming the release image. Only its
    /// registry host is consumed.
    pub image_set_ref: ImageSetRef,

    /// Optional pull secret override; falls back to the deployment's pull
    /// secret when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_secret_ref: Option<SecretRef>,

    /// Optional config map with an additional trust bundle under the
    /// `tls-ca-bundle.pem` key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle_ref: Option<ConfigMapRef>,

    /// Ordered list of config maps whose entries are shipped as extra
    /// manifests in the configuration ISO.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_manifests_refs: Option<Vec<ConfigMapRef>>,

    /// CIDR the host must have a NIC in. Empty disables NIC validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_network: Option<String>,

    /// Desired hostname of the installed node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// SSH public key injected into the installed cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<String>,

    /// Proxy settings for the installed cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<Proxy>,

    /// Identity of the installed cluster. Populated by the operator and
    /// monotonic: once set, clusterID and infraID are never rewritten.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_metadata: Option<ClusterMetadata>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRef {
    /// Name of the DeploymentDescriptor in the intent's namespace
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct HostRef {
    /// Name of the HostDescriptor
    pub name: String,
    /// Namespace of the HostDescriptor
    pub namespace: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct ImageSetRef {
    /// Name of the cluster scoped ReleaseImageSet
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapRef {
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct Proxy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_proxy: Option<String>,
}

/// Identity of the installed cluster and the canonical names of its
/// credential secrets.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct ClusterMetadata {
    pub cluster_id: String,
    pub infra_id: String,
    pub admin_kubeconfig_secret_ref: SecretRef,
    pub admin_password_secret_ref: SecretRef,
}

/// Most recent observed status of the InstallIntent. Read-only.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct InstallIntentStatus {
    /// Host the intent was observed to boot on. Set together with bootTime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ref: Option<HostRef>,

    /// Time the host was handed the configuration image and told to reboot.
    /// Once set the pre-boot flow is never re-entered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<IntentCondition>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
pub enum ConditionType {
    Requirements,
    Completed,
    Failed,
    Stopped,
}

impl ConditionType {
    pub const ALL: [ConditionType; 4] = [
        ConditionType::Requirements,
        ConditionType::Completed,
        ConditionType::Failed,
        ConditionType::Stopped,
    ];
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionType::Requirements => write!(f, "Requirements"),
            ConditionType::Completed => write!(f, "Completed"),
            ConditionType::Failed => write!(f, "Failed"),
            ConditionType::Stopped => write!(f, "Stopped"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct IntentCondition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    /// Stamped on every condition update
    pub last_probe_time: Time,
    /// Stamped only when `status` actually changes
    pub last_transition_time: Time,
}

impl InstallIntent {
    #[inline]
    pub fn get_namespace(&self) -> String {
        // safe unwrap: InstallIntent is namespace scoped
        self.namespace().unwrap()
    }

    pub fn condition(&self, condition_type: ConditionType) -> Option<&IntentCondition> {
        self.status
            .as_ref()?
            .conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    pub fn condition_status(&self, condition_type: ConditionType) -> ConditionStatus {
        self.condition(condition_type)
            .map(|c| c.status)
            .unwrap_or(ConditionStatus::Unknown)
    }

    /// The monitor owns the intent from the moment boot is recorded.
    pub fn boot_recorded(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.boot_time.is_some())
    }

    /// Successfully installed; the only terminal state without a way out.
    pub fn install_succeeded(&self) -> bool {
        self.condition_status(ConditionType::Completed) == ConditionStatus::True
    }
}
