use crate::crd::{InstallIntent, Proxy};

use ibiop_operator::error::{Error, Result};

use std::collections::{BTreeMap, HashMap};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

/// Key the CA bundle config map must carry.
pub const CA_BUNDLE_KEY: &str = "tls-ca-bundle.pem";
/// Key the pre-provisioning network data secret must carry.
pub const NMSTATE_KEY: &str = "nmstate";

pub const INSTALL_CONFIG_FILE: &str = "install-config.yaml";
pub const IMAGE_BASED_CONFIG_FILE: &str = "image-based-config.yaml";
pub const INVOKER_MANIFEST_FILE: &str = "invoker-cm.yaml";
pub const START_TIME_MANIFEST_FILE: &str = "ibio-start-time-cm.yaml";

const INVOKER_VALUE: &str = "image-based-install";

#[derive(Deserialize)]
struct PullSecret {
    #[serde(default)]
    auths: HashMap<String, PullSecretAuth>,
}

#[derive(Deserialize)]
struct PullSecretAuth {
    #[serde(default)]
    auth: Option<String>,
}

/// Validate the dockerconfigjson shape of a pull secret: a non-empty `auths`
/// map whose entries carry an `auth` field base64-decoding to
/// `user:password`.
pub fn validate_pull_secret(raw: &str) -> Result<()> {
    let parsed: PullSecret = serde_json::from_str(raw)
        .map_err(|e| Error::ValidationError(format!("pull secret is not valid JSON: {e}")))?;
    if parsed.auths.is_empty() {
        return Err(Error::ValidationError(
            "pull secret must contain at least one registry under 'auths'".to_string(),
        ));
    }
    for (registry, entry) in &parsed.auths {
        let auth = entry.auth.as_deref().filter(|a| !a.is_empty()).ok_or_else(|| {
            Error::ValidationError(format!(
                "pull secret entry for {registry} is missing the 'auth' field"
            ))
        })?;
        let decoded = STANDARD.decode(auth).map_err(|e| {
            Error::ValidationError(format!(
                "pull secret 'auth' field for {registry} is not valid base64: {e}"
            ))
        })?;
        let decoded = String::from_utf8(decoded).map_err(|_| {
            Error::ValidationError(format!(
                "pull secret 'auth' field for {registry} does not decode to text"
            ))
        })?;
        if !decoded.contains(':') {
            return Err(Error::ValidationError(format!(
                "pull secret 'auth' field for {registry} must decode to user:password"
            )));
        }
    }
    Ok(())
}

/// Each user-supplied extra manifest must be parseable YAML before it is
/// shipped into the configuration image.
pub fn validate_manifest_yaml(name: &str, content: &str) -> Result<()> {
    serde_yaml::from_str::<serde_yaml::Value>(content)
        .map(|_| ())
        .map_err(|e| Error::ValidationError(format!("extra manifest {name} is not valid YAML: {e}")))
}

pub fn parse_nmstate(raw: &str) -> Result<serde_yaml::Value> {
    serde_yaml::from_str(raw).map_err(|e| {
        Error::ValidationError(format!("network data '{NMSTATE_KEY}' is not valid YAML: {e}"))
    })
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMetadata {
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineNetworkEntry {
    pub cidr: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Networking {
    pub machine_network: Vec<MachineNetworkEntry>,
}

/// The subset of install-config.yaml consumed by the image assembly library.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstallConfig {
    pub api_version: String,
    pub metadata: ConfigMetadata,
    pub base_domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networking: Option<Networking>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<Proxy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_trust_bundle: Option<String>,
    pub pull_secret: String,
}

/// The subset of image-based-config.yaml consumed by the image assembly
/// library.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageBasedConfig {
    pub api_version: String,
    pub metadata: ConfigMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub release_registry: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_config: Option<serde_yaml::Value>,
}

pub fn build_install_config(
    intent: &InstallIntent,
    cluster_name: &str,
    base_domain: &str,
    pull_secret: String,
    ca_bundle: Option<String>,
) -> InstallConfig {
    InstallConfig {
        api_version: "v1".to_string(),
        metadata: ConfigMetadata {
            name: cluster_name.to_string(),
        },
        base_domain: base_domain.to_string(),
        networking: intent
            .spec
            .machine_network
            .as_ref()
            .filter(|cidr| !cidr.is_empty())
            .map(|cidr| Networking {
                machine_network: vec![MachineNetworkEntry { cidr: cidr.clone() }],
            }),
        proxy: intent.spec.proxy.clone(),
        ssh_key: intent.spec.ssh_key.clone(),
        additional_trust_bundle: ca_bundle,
        pull_secret,
    }
}

pub fn build_image_based_config(
    intent: &InstallIntent,
    release_registry: &str,
    network_config: Option<serde_yaml::Value>,
) -> ImageBasedConfig {
    ImageBasedConfig {
        api_version: "v1beta1".to_string(),
        metadata: ConfigMetadata {
            name: "image-based-config".to_string(),
        },
        hostname: intent.spec.hostname.clone(),
        release_registry: release_registry.to_string(),
        network_config,
    }
}

/// Marks who drove the installation; read by the installed cluster's
/// manifests config map.
pub fn invoker_manifest() -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some("openshift-install-manifests".to_string()),
            namespace: Some("openshift-config".to_string()),
            ..ObjectMeta::default()
        },
        data: Some(BTreeMap::from([(
            "invoker".to_string(),
            INVOKER_VALUE.to_string(),
        )])),
        ..ConfigMap::default()
    }
}

/// Empty config map whose creation time on the spoke anchors timeout
/// interpretation after the image boots.
pub fn start_time_manifest() -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some("ibio-start-time".to_string()),
            namespace: Some("openshift-config".to_string()),
            ..ObjectMeta::default()
        },
        ..ConfigMap::default()
    }
}

pub fn to_yaml<T: Serialize>(value: &T, what: &str) -> Result<String> {
    serde_yaml::to_string(value)
        .map_err(|e| Error::YamlError(format!("failed to render {what}"), e))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::InstallIntentSpec;

    fn valid_auth() -> String {
        STANDARD.encode("user:password")
    }

    #[test]
    fn test_valid_pull_secret() {
        let raw = format!(r#"{{"auths":{{"quay.io":{{"auth":"{}"}}}}}}"#, valid_auth());
        assert!(validate_pull_secret(&raw).is_ok());
    }

    #[test]
    fn test_pull_secret_missing_auth_field() {
        let err = validate_pull_secret(r#"{"auths":{"quay.io":{}}}"#).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("'auth' field"), "unexpected message: {msg}");
        assert!(msg.contains("quay.io"));
    }

    #[test]
    fn test_pull_secret_empty_auths() {
        assert!(validate_pull_secret(r#"{"auths":{}}"#).is_err());
        assert!(validate_pull_secret(r#"{}"#).is_err());
    }

    #[test]
    fn test_pull_secret_rejects_bad_base64_and_shape() {
        let err =
            validate_pull_secret(r#"{"auths":{"quay.io":{"auth":"%%%"}}}"#).unwrap_err();
        assert!(err.to_string().contains("base64"));

        let no_colon = STANDARD.encode("token-without-separator");
        let raw = format!(r#"{{"auths":{{"quay.io":{{"auth":"{no_colon}"}}}}}}"#);
        let err = validate_pull_secret(&raw).unwrap_err();
        assert!(err.to_string().contains("user:password"));
    }

    #[test]
    fn test_pull_secret_rejects_invalid_json() {
        assert!(validate_pull_secret("not json").is_err());
    }

    #[test]
    fn test_manifest_yaml_validation() {
        assert!(validate_manifest_yaml("cm.yaml", "apiVersion: v1\nkind: ConfigMap\n").is_ok());
        assert!(validate_manifest_yaml("cm.yaml", "a: [unclosed").is_err());
    }

    fn intent() -> InstallIntent {
        InstallIntent::new(
            "cluster1",
            InstallIntentSpec {
                machine_network: Some("192.168.1.0/24".to_string()),
                hostname: Some("node0".to_string()),
                ssh_key: Some("ssh-ed25519 AAAA".to_string()),
                proxy: Some(Proxy {
                    http_proxy: Some("http://proxy:3128".to_string()),
                    https_proxy: None,
                    no_proxy: Some(".cluster.local".to_string()),
                }),
                ..InstallIntentSpec::default()
            },
        )
    }

    #[test]
    fn test_install_config_round_trips() {
        let config = build_install_config(
            &intent(),
            "cluster1",
            "example.com",
            r#"{"auths":{}}"#.to_string(),
            Some("-----BEGIN CERTIFICATE-----".to_string()),
        );
        let yaml = to_yaml(&config, INSTALL_CONFIG_FILE).unwrap();
        assert!(yaml.contains("baseDomain: example.com"));
        assert!(yaml.contains("machineNetwork"));
        assert!(yaml.contains("sshKey"));

        let parsed: InstallConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_install_config_omits_empty_sections() {
        let mut bare = intent();
        bare.spec.machine_network = None;
        bare.spec.proxy = None;
        bare.spec.ssh_key = None;
        let config =
            build_install_config(&bare, "cluster1", "example.com", "{}".to_string(), None);
        let yaml = to_yaml(&config, INSTALL_CONFIG_FILE).unwrap();
        assert!(!yaml.contains("networking"));
        assert!(!yaml.contains("proxy"));
        assert!(!yaml.contains("additionalTrustBundle"));
    }

    #[test]
    fn test_image_based_config_round_trips() {
        let nmstate = parse_nmstate("interfaces:\n- name: eth0\n  type: ethernet\n").unwrap();
        let config = build_image_based_config(&intent(), "quay.io", Some(nmstate));
        let yaml = to_yaml(&config, IMAGE_BASED_CONFIG_FILE).unwrap();
        assert!(yaml.contains("releaseRegistry: quay.io"));
        assert!(yaml.contains("hostname: node0"));
        assert!(yaml.contains("networkConfig"));

        let parsed: ImageBasedConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_emitted_manifests() {
        let invoker = invoker_manifest();
        assert_eq!(
            invoker.data.as_ref().unwrap().get("invoker").unwrap(),
            "image-based-install"
        );
        let yaml = to_yaml(&invoker, INVOKER_MANIFEST_FILE).unwrap();
        assert!(yaml.contains("openshift-install-manifests"));

        let start_time = start_time_manifest();
        assert!(start_time.data.is_none());
    }

    #[test]
    fn test_parse_nmstate_rejects_bad_yaml() {
        assert!(parse_nmstate("interfaces: [unclosed").is_err());
    }
}
