use crate::external::{DataImage, DataImageSpec, HostDescriptor};

use ibiop_operator::error::{Error, Result};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::jiff::Timestamp;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::client::Client;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, info};

/// Remaining share of the post-creation cool-down, if any. The host
/// controller needs a moment to observe a fresh DataImage before the host is
/// told to reboot.
pub fn remaining_cooldown(created: &Time, now: Timestamp, cooldown: Duration) -> Option<Duration> {
    let elapsed_ms = now.as_millisecond() - created.0.as_millisecond();
    let remaining_ms = cooldown.as_millis() as i64 - elapsed_ms;
    if remaining_ms > 0 {
        Some(Duration::from_millis(remaining_ms as u64))
    } else {
        None
    }
}

/// Ensure a DataImage named after the host points at the ISO URL.
///
/// Returns `Some(delay)` when the caller must requeue before mutating the
/// host: either the object was just created, or it is still inside the
/// cool-down window.
pub async fn ensure_data_image(
    client: Client,
    host: &HostDescriptor,
    url: &str,
    cooldown: Duration,
) -> Result<Option<Duration>> {
    let namespace = host.get_namespace();
    let name = host.name_any();
    let api = Api::<DataImage>::namespaced(client, &namespace);

    let existing = api.get_opt(&name).await.map_err(|e| {
        Error::KubeError(
            format!("failed to get DataImage {namespace}/{name}"),
            Box::new(e),
        )
    })?;

    match existing {
        Some(existing) => {
            if existing.spec.url != url {
                info!(msg = "updating data image url", namespace, name, url);
                api.patch(
                    &name,
                    &PatchParams::default(),
                    &Patch::Merge(json!({"spec": {"url": url}})),
                )
                .await
                .map_err(|e| {
                    Error::KubeError(
                        format!("failed to patch DataImage {namespace}/{name}"),
                        Box::new(e),
                    )
                })?;
            }
            let remaining = existing
                .metadata
                .creation_timestamp
                .as_ref()
                .and_then(|created| remaining_cooldown(created, Timestamp::now(), cooldown));
            if remaining.is_some() {
                debug!(msg = "data image still cooling down", namespace, name);
            }
            Ok(remaining)
        }
        None => {
            info!(msg = "creating data image", namespace, name, url);
            let data_image = DataImage {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    namespace: Some(namespace.clone()),
                    owner_references: host.controller_owner_ref(&()).map(|oref| vec![oref]),
                    ..ObjectMeta::default()
                },
                spec: DataImageSpec {
                    url: url.to_string(),
                },
            };
            api.create(&PostParams::default(), &data_image)
                .await
                .map_err(|e| {
                    Error::KubeError(
                        format!("failed to create DataImage {namespace}/{name}"),
                        Box::new(e),
                    )
                })?;
            Ok(Some(cooldown))
        }
    }
}

pub async fn get_data_image(client: Client, namespace: &str, name: &str) -> Result<Option<DataImage>> {
    let api = Api::<DataImage>::namespaced(client, namespace);
    api.get_opt(name).await.map_err(|e| {
        Error::KubeError(
            format!("failed to get DataImage {namespace}/{name}"),
            Box::new(e),
        )
    })
}

/// Delete the paired DataImage, tolerating a vanished object.
pub async fn delete_data_image(client: Client, namespace: &str, name: &str) -> Result<()> {
    let api = Api::<DataImage>::namespaced(client, namespace);
    match api.delete(name, &Default::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(Error::KubeError(
            format!("failed to delete DataImage {namespace}/{name}"),
            Box::new(e),
        )),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn time(second: i64) -> Time {
        Time(Timestamp::from_second(second).unwrap())
    }

    #[test]
    fn test_cooldown_window_yields_remaining_share() {
        let created = time(1_000);
        let now = Timestamp::from_second(1_000).unwrap();
        let remaining = remaining_cooldown(&created, now, Duration::from_secs(1));
        assert_eq!(remaining, Some(Duration::from_secs(1)));

        let now = Timestamp::new(1_000, 600_000_000).unwrap();
        let remaining = remaining_cooldown(&created, now, Duration::from_secs(1));
        assert_eq!(remaining, Some(Duration::from_millis(400)));
    }

    #[test]
    fn test_cooldown_elapsed() {
        let created = time(1_000);
        let now = Timestamp::from_second(1_002).unwrap();
        assert_eq!(
            remaining_cooldown(&created, now, Duration::from_secs(1)),
            None
        );
    }
}
