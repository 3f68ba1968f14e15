use crate::crd::{HostRef, InstallIntent};
use crate::external::{
    CleaningMode, DETACHED_ANNOTATION, HostDescriptor, MANAGED_ANNOTATION, ProvisioningState,
    REBOOT_ANNOTATION,
};

use ibiop_operator::error::{Error, Result};

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use kube::api::{Api, Patch, PatchParams};
use kube::client::Client;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info};

/// Outcome of pre-boot host validation.
#[derive(Debug, PartialEq, Eq)]
pub enum HostValidation {
    Ready,
    /// Not ready yet; retry once the host changes
    Pending(String),
    /// Wrong configuration; will not resolve without user input
    Failed(String),
}

pub async fn get_host(client: Client, host_ref: &HostRef) -> Result<Option<HostDescriptor>> {
    let api = Api::<HostDescriptor>::namespaced(client, &host_ref.namespace);
    api.get_opt(&host_ref.name).await.map_err(|e| {
        Error::KubeError(
            format!(
                "failed to get HostDescriptor {}/{}",
                host_ref.namespace, host_ref.name
            ),
            Box::new(e),
        )
    })
}

/// Validate the host is ready to receive the configuration image.
///
/// Hosts that are already externally provisioned or opted out of inspection
/// skip the provisioning-state and hardware checks. An empty machine network
/// disables NIC validation; hosts exempt from inspection are not failed for
/// missing hardware details.
pub fn validate_host(intent: &InstallIntent, host: &HostDescriptor) -> HostValidation {
    let namespace = host.get_namespace();
    let name = host.name_any();
    let exempt = host.spec.externally_provisioned || host.inspection_disabled();

    if !exempt {
        if host.provisioning_state() != Some(ProvisioningState::Available) {
            return HostValidation::Pending(format!(
                "host {namespace}/{name} is not available (state: {:?})",
                host.provisioning_state()
            ));
        }
        if host.status.as_ref().and_then(|s| s.hardware.as_ref()).is_none() {
            return HostValidation::Pending(format!(
                "host {namespace}/{name} has no hardware details yet"
            ));
        }
    }

    let machine_network = match intent.spec.machine_network.as_deref() {
        Some(cidr) if !cidr.is_empty() => cidr,
        _ => return HostValidation::Ready,
    };
    let network: IpNetwork = match machine_network.parse() {
        Ok(network) => network,
        Err(e) => {
            return HostValidation::Failed(format!(
                "invalid machineNetwork {machine_network}: {e}"
            ));
        }
    };

    let hardware = host.status.as_ref().and_then(|s| s.hardware.as_ref());
    let Some(hardware) = hardware else {
        // exempt host without inventory; nothing to match against
        return HostValidation::Ready;
    };
    let matched = hardware
        .nics
        .iter()
        .filter_map(|nic| nic.ip.as_deref())
        .filter_map(|ip| ip.parse::<IpAddr>().ok())
        .any(|ip| network.contains(ip));
    if matched {
        HostValidation::Ready
    } else {
        HostValidation::Failed(format!(
            "host {namespace}/{name} doesn't have any nic with ip in provided machineNetwork {machine_network}"
        ))
    }
}

/// Force `automatedCleaningMode: disabled`. Ordered before any other host
/// mutation; the host controller must never format the disk.
pub async fn disable_automated_cleaning(client: Client, host: &HostDescriptor) -> Result<()> {
    if host.cleaning_disabled() {
        return Ok(());
    }
    let namespace = host.get_namespace();
    let name = host.name_any();
    info!(msg = "disabling automated cleaning", namespace, name);
    let api = Api::<HostDescriptor>::namespaced(client, &namespace);
    api.patch(
        &name,
        &PatchParams::default(),
        &Patch::Merge(json!({"spec": {"automatedCleaningMode": CleaningMode::Disabled}})),
    )
    .await
    .map_err(|e| {
        Error::KubeError(
            format!("failed to patch HostDescriptor {namespace}/{name}"),
            Box::new(e),
        )
    })?;
    Ok(())
}

/// Flip the host into our managed provisioning state with a single patch:
/// externally provisioned, online, reboot requested and the managed marker.
///
/// Returns the patched host, or None when the host is in a state that must
/// be waited out.
pub async fn update_provisioning(
    client: Client,
    host: &HostDescriptor,
) -> Result<Option<HostDescriptor>> {
    let namespace = host.get_namespace();
    let name = host.name_any();

    let state = host.provisioning_state();
    let available = state == Some(ProvisioningState::Available);
    let externally_provisioned = state == Some(ProvisioningState::ExternallyProvisioned)
        || host.spec.externally_provisioned;
    if !available && !externally_provisioned {
        debug!(
            msg = "host not ready for provisioning handoff",
            namespace,
            name,
            state = format!("{state:?}")
        );
        return Ok(None);
    }

    let mut spec = json!({"online": true});
    if available {
        spec["externallyProvisioned"] = json!(true);
    }
    let patch = json!({
        "metadata": {
            "annotations": {
                REBOOT_ANNOTATION: "",
                MANAGED_ANNOTATION: "",
            }
        },
        "spec": spec,
    });

    info!(msg = "handing host over to image boot", namespace, name);
    let api = Api::<HostDescriptor>::namespaced(client, &namespace);
    let patched = api
        .patch(&name, &PatchParams::default(), &Patch::Merge(patch))
        .await
        .map_err(|e| {
            Error::KubeError(
                format!("failed to patch HostDescriptor {namespace}/{name}"),
                Box::new(e),
            )
        })?;
    Ok(Some(patched))
}

/// Detach the host so the host controller stops reconciling it.
pub async fn set_detached(client: Client, host_ref: &HostRef) -> Result<()> {
    let api = Api::<HostDescriptor>::namespaced(client, &host_ref.namespace);
    api.patch(
        &host_ref.name,
        &PatchParams::default(),
        &Patch::Merge(json!({
            "metadata": {"annotations": {DETACHED_ANNOTATION: ""}}
        })),
    )
    .await
    .map_err(|e| {
        Error::KubeError(
            format!(
                "failed to patch HostDescriptor {}/{}",
                host_ref.namespace, host_ref.name
            ),
            Box::new(e),
        )
    })?;
    Ok(())
}

/// Deprovisioning: re-attach the host and request a reboot in one patch so
/// the host controller unmounts the configuration image.
pub async fn request_unmount(client: Client, host_ref: &HostRef) -> Result<()> {
    let api = Api::<HostDescriptor>::namespaced(client, &host_ref.namespace);
    api.patch(
        &host_ref.name,
        &PatchParams::default(),
        &Patch::Merge(json!({
            "metadata": {"annotations": {
                DETACHED_ANNOTATION: serde_json::Value::Null,
                REBOOT_ANNOTATION: "",
            }}
        })),
    )
    .await
    .map_err(|e| {
        Error::KubeError(
            format!(
                "failed to patch HostDescriptor {}/{}",
                host_ref.namespace, host_ref.name
            ),
            Box::new(e),
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::InstallIntentSpec;
    use crate::external::{
        HardwareDetails, HostDescriptorStatus, INSPECT_ANNOTATION, INSPECT_DISABLED, Nic,
        Provisioning,
    };
    use kube::api::ObjectMeta;

    fn intent(machine_network: Option<&str>) -> InstallIntent {
        InstallIntent::new(
            "cluster1",
            InstallIntentSpec {
                machine_network: machine_network.map(str::to_string),
                ..InstallIntentSpec::default()
            },
        )
    }

    fn host(state: ProvisioningState, nic_ips: &[&str]) -> HostDescriptor {
        let mut host = HostDescriptor::default();
        host.metadata = ObjectMeta {
            name: Some("h1".to_string()),
            namespace: Some("hns".to_string()),
            ..ObjectMeta::default()
        };
        host.status = Some(HostDescriptorStatus {
            provisioning: Some(Provisioning { state }),
            hardware: Some(HardwareDetails {
                nics: nic_ips
                    .iter()
                    .map(|ip| Nic {
                        name: Some("eth0".to_string()),
                        ip: Some(ip.to_string()),
                    })
                    .collect(),
            }),
            powered_on: false,
        });
        host
    }

    #[test]
    fn test_available_host_with_matching_nic_is_ready() {
        let result = validate_host(
            &intent(Some("192.168.1.0/24")),
            &host(ProvisioningState::Available, &["192.168.1.5"]),
        );
        assert_eq!(result, HostValidation::Ready);
    }

    #[test]
    fn test_nic_outside_machine_network_fails() {
        let result = validate_host(
            &intent(Some("192.168.1.0/24")),
            &host(ProvisioningState::Available, &["10.0.0.5"]),
        );
        match result {
            HostValidation::Failed(msg) => assert!(msg.contains(
                "doesn't have any nic with ip in provided machineNetwork 192.168.1.0/24"
            )),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_machine_network_skips_nic_validation() {
        let result = validate_host(
            &intent(None),
            &host(ProvisioningState::Available, &["10.0.0.5"]),
        );
        assert_eq!(result, HostValidation::Ready);

        let result = validate_host(
            &intent(Some("")),
            &host(ProvisioningState::Available, &["10.0.0.5"]),
        );
        assert_eq!(result, HostValidation::Ready);
    }

    #[test]
    fn test_unavailable_host_is_pending() {
        let result = validate_host(
            &intent(None),
            &host(ProvisioningState::Provisioning, &["192.168.1.5"]),
        );
        assert!(matches!(result, HostValidation::Pending(_)));
    }

    #[test]
    fn test_missing_hardware_is_pending() {
        let mut h = host(ProvisioningState::Available, &[]);
        h.status.as_mut().unwrap().hardware = None;
        let result = validate_host(&intent(None), &h);
        assert!(matches!(result, HostValidation::Pending(_)));
    }

    #[test]
    fn test_inspection_disabled_skips_hardware_validation() {
        let mut h = host(ProvisioningState::Inspecting, &[]);
        h.status.as_mut().unwrap().hardware = None;
        h.metadata
            .annotations
            .get_or_insert_default()
            .insert(INSPECT_ANNOTATION.to_string(), INSPECT_DISABLED.to_string());
        assert_eq!(validate_host(&intent(None), &h), HostValidation::Ready);
        // no inventory to match against; progression proceeds
        assert_eq!(
            validate_host(&intent(Some("192.168.1.0/24")), &h),
            HostValidation::Ready
        );
    }

    #[test]
    fn test_invalid_machine_network_fails() {
        let result = validate_host(
            &intent(Some("not-a-cidr")),
            &host(ProvisioningState::Available, &["192.168.1.5"]),
        );
        assert!(matches!(result, HostValidation::Failed(_)));
    }
}
