pub mod conditions;
pub mod configs;
pub mod credentials;
pub mod dataimage;
pub mod host;
pub mod identity;
pub mod materialize;
pub mod monitor;
pub mod workspace;

use crate::context::Context;
use crate::crd::{
    ConditionStatus, HostRef, INTENT_FINALIZER, InstallIntent, REASON_HOST_CONFIGURATION_FAILED,
    REASON_HOST_CONFIGURATION_SUCCEEDED, REASON_HOST_PENDING, REASON_HOST_VALIDATION_FAILED,
    REASON_HOST_VALIDATION_PENDING, REASON_HOST_VALIDATION_SUCCEEDED, REASON_IMAGE_READY,
    REASON_NOT_READY, REASON_PENDING,
};
use crate::external::{DeploymentDescriptor, MANAGED_ANNOTATION};
use crate::reconcile::conditions::{initialize_conditions, set_requirements};
use crate::reconcile::dataimage::{delete_data_image, ensure_data_image, get_data_image};
use crate::reconcile::host::{
    HostValidation, disable_automated_cleaning, get_host, request_unmount, update_provisioning,
    validate_host,
};
use crate::reconcile::identity::ensure_cluster_identity;
use crate::reconcile::materialize::materialize;
use crate::reconcile::workspace::{IntentWorkspace, LockOutcome, remove_workspace, with_write_lock};

use ibiop_operator::error::{Error, Result};
use ibiop_operator::telemetry;

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::jiff::Timestamp;
use kube::api::{Api, Patch, PatchParams};
use kube::client::Client;
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType};
use kube::{Resource, ResourceExt};
use serde_json::json;
use tokio::time::Duration;
use tracing::{Span, debug, field, info, instrument};

const VALIDATION_REQUEUE: Duration = Duration::from_secs(30);
const LOCK_CONTENTION_REQUEUE: Duration = Duration::from_secs(5);
const DEPROVISION_REQUEUE: Duration = Duration::from_secs(60);

/// Converge an InstallIntent toward a booted host: validate the referenced
/// descriptors, materialize the workspace, attach the generated image and
/// hand the host over to the monitor by recording the boot time.
#[instrument(skip(ctx, intent), fields(trace_id))]
pub async fn reconcile_intent(intent: Arc<InstallIntent>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.ibiop_ctx.metrics.reconcile_count_and_measure(&trace_id);

    let namespace = intent.get_namespace();
    let name = intent.name_any();
    let client = ctx.ibiop_ctx.client.clone();

    if intent.metadata.deletion_timestamp.is_some() {
        return cleanup(&intent, &ctx).await;
    }
    if ensure_finalizer(client.clone(), &intent).await? {
        return Ok(Action::requeue(Duration::ZERO));
    }
    if intent.boot_recorded() {
        debug!(msg = "boot already recorded, monitor owns progress", namespace, name);
        return Ok(Action::await_change());
    }
    if initialize_conditions(client.clone(), &intent).await? {
        return Ok(Action::requeue(Duration::ZERO));
    }

    info!(msg = "reconciling install intent", namespace, name);

    let deployment_api = Api::<DeploymentDescriptor>::namespaced(client.clone(), &namespace);
    let deployment = deployment_api
        .get_opt(&intent.spec.deployment_ref.name)
        .await
        .map_err(|e| {
            Error::KubeError(
                format!(
                    "failed to get DeploymentDescriptor {namespace}/{}",
                    intent.spec.deployment_ref.name
                ),
                Box::new(e),
            )
        })?;
    let Some(deployment) = deployment else {
        set_requirements(
            client,
            &intent,
            ConditionStatus::False,
            REASON_PENDING,
            format!(
                "DeploymentDescriptor {namespace}/{} not found",
                intent.spec.deployment_ref.name
            ),
        )
        .await?;
        return Ok(Action::requeue(VALIDATION_REQUEUE));
    };

    let Some(host_ref) = intent.spec.host_ref.clone() else {
        set_requirements(
            client,
            &intent,
            ConditionStatus::False,
            REASON_HOST_PENDING,
            "no host referenced yet".to_string(),
        )
        .await?;
        return Ok(Action::await_change());
    };
    let Some(host) = get_host(client.clone(), &host_ref).await? else {
        set_requirements(
            client,
            &intent,
            ConditionStatus::False,
            REASON_HOST_PENDING,
            format!(
                "HostDescriptor {}/{} not found",
                host_ref.namespace, host_ref.name
            ),
        )
        .await?;
        return Ok(Action::await_change());
    };

    // ordered before any other host mutation
    disable_automated_cleaning(client.clone(), &host).await?;

    match validate_host(&intent, &host) {
        HostValidation::Ready => {
            set_requirements(
                client.clone(),
                &intent,
                ConditionStatus::True,
                REASON_HOST_VALIDATION_SUCCEEDED,
                "host validation succeeded".to_string(),
            )
            .await?;
        }
        HostValidation::Pending(message) => {
            set_requirements(
                client,
                &intent,
                ConditionStatus::False,
                REASON_HOST_VALIDATION_PENDING,
                message,
            )
            .await?;
            return Ok(Action::requeue(VALIDATION_REQUEUE));
        }
        HostValidation::Failed(message) => {
            set_requirements(
                client,
                &intent,
                ConditionStatus::False,
                REASON_HOST_VALIDATION_FAILED,
                message.clone(),
            )
            .await?;
            publish_event(
                &ctx,
                &intent,
                EventType::Warning,
                REASON_HOST_VALIDATION_FAILED,
                message.clone(),
            )
            .await;
            return Err(Error::ValidationError(message));
        }
    }

    let metadata = ensure_cluster_identity(client.clone(), &intent, &deployment).await?;

    let uid = intent
        .uid()
        .ok_or_else(|| Error::MissingData(format!("InstallIntent {namespace}/{name} has no UID")))?;
    let workspace =
        IntentWorkspace::new(ctx.ibiop_ctx.config.data_dir(), &namespace, &uid);
    let materialized = with_write_lock(
        workspace.dir(),
        materialize(&ctx, &intent, &deployment, &host, &metadata, &workspace),
    )
    .await;
    match materialized {
        Ok(LockOutcome::Acquired(())) => {}
        Ok(LockOutcome::Contended) => {
            debug!(msg = "workspace locked by another holder", namespace, name);
            return Ok(Action::requeue(LOCK_CONTENTION_REQUEUE));
        }
        Err(e) => {
            set_requirements(
                client,
                &intent,
                ConditionStatus::False,
                REASON_NOT_READY,
                e.to_string(),
            )
            .await?;
            return Err(e);
        }
    }
    set_requirements(
        client.clone(),
        &intent,
        ConditionStatus::True,
        REASON_IMAGE_READY,
        "configuration image is ready".to_string(),
    )
    .await?;

    let url = ctx.ibiop_ctx.config.image_url(&namespace, &uid);
    if let Some(delay) = ensure_data_image(
        client.clone(),
        &host,
        &url,
        ctx.ibiop_ctx.config.data_image_cooldown,
    )
    .await?
    {
        return Ok(Action::requeue(delay));
    }

    let patched_host = match update_provisioning(client.clone(), &host).await {
        Ok(Some(patched)) => patched,
        Ok(None) => return Ok(Action::await_change()),
        Err(e) => {
            set_requirements(
                client,
                &intent,
                ConditionStatus::False,
                REASON_HOST_CONFIGURATION_FAILED,
                e.to_string(),
            )
            .await?;
            return Err(e);
        }
    };

    if patched_host.has_annotation(MANAGED_ANNOTATION) {
        record_boot(client.clone(), &intent, &host_ref).await?;
        set_requirements(
            client,
            &intent,
            ConditionStatus::True,
            REASON_HOST_CONFIGURATION_SUCCEEDED,
            "host configured, waiting for installation to start".to_string(),
        )
        .await?;
        publish_event(
            &ctx,
            &intent,
            EventType::Normal,
            REASON_HOST_CONFIGURATION_SUCCEEDED,
            format!(
                "host {}/{} booting from configuration image",
                host_ref.namespace, host_ref.name
            ),
        )
        .await;
    }
    Ok(Action::await_change())
}

/// Handoff point to the monitor: only after the managed marker is observed
/// on the host does the intent record where and when it booted.
async fn record_boot(client: Client, intent: &InstallIntent, host_ref: &HostRef) -> Result<()> {
    let namespace = intent.get_namespace();
    let name = intent.name_any();
    info!(msg = "recording boot time", namespace, name);
    let api = Api::<InstallIntent>::namespaced(client, &namespace);
    api.patch_status(
        &name,
        &PatchParams::default(),
        &Patch::Merge(json!({
            "status": {
                "hostRef": host_ref,
                "bootTime": Time(Timestamp::now()),
            }
        })),
    )
    .await
    .map_err(|e| {
        Error::KubeError(
            format!("failed to patch InstallIntent/status {namespace}/{name}"),
            Box::new(e),
        )
    })?;
    Ok(())
}

async fn ensure_finalizer(client: Client, intent: &InstallIntent) -> Result<bool> {
    if intent.finalizers().iter().any(|f| f == INTENT_FINALIZER) {
        return Ok(false);
    }
    let namespace = intent.get_namespace();
    let name = intent.name_any();
    debug!(msg = "adding finalizer", namespace, name);
    let mut finalizers = intent.finalizers().to_vec();
    finalizers.push(INTENT_FINALIZER.to_string());
    patch_finalizers(client, &namespace, &name, finalizers).await?;
    Ok(true)
}

async fn remove_finalizer(client: Client, intent: &InstallIntent) -> Result<()> {
    let namespace = intent.get_namespace();
    let name = intent.name_any();
    info!(msg = "removing finalizer", namespace, name);
    let finalizers = intent
        .finalizers()
        .iter()
        .filter(|f| *f != INTENT_FINALIZER)
        .cloned()
        .collect();
    patch_finalizers(client, &namespace, &name, finalizers).await
}

async fn patch_finalizers(
    client: Client,
    namespace: &str,
    name: &str,
    finalizers: Vec<String>,
) -> Result<()> {
    let api = Api::<InstallIntent>::namespaced(client, namespace);
    api.patch(
        name,
        &PatchParams::default(),
        &Patch::Merge(json!({"metadata": {"finalizers": finalizers}})),
    )
    .await
    .map_err(|e| {
        Error::KubeError(
            format!("failed to patch InstallIntent {namespace}/{name}"),
            Box::new(e),
        )
    })?;
    Ok(())
}

/// Deprovision a deleted intent: tear down the workspace, release the
/// attached image, and only then clear the finalizer.
async fn cleanup(intent: &InstallIntent, ctx: &Context) -> Result<Action> {
    let namespace = intent.get_namespace();
    let name = intent.name_any();
    let client = ctx.ibiop_ctx.client.clone();

    if !intent.finalizers().iter().any(|f| f == INTENT_FINALIZER) {
        return Ok(Action::await_change());
    }
    info!(msg = "deprovisioning install intent", namespace, name);

    if let Some(uid) = intent.uid() {
        let workspace =
            IntentWorkspace::new(ctx.ibiop_ctx.config.data_dir(), &namespace, &uid);
        match remove_workspace(&workspace).await? {
            LockOutcome::Acquired(()) => {}
            LockOutcome::Contended => {
                debug!(msg = "workspace locked, retrying removal", namespace, name);
                return Ok(Action::requeue(LOCK_CONTENTION_REQUEUE));
            }
        }
    }

    let host_ref = intent
        .spec
        .host_ref
        .clone()
        .or_else(|| intent.status.as_ref().and_then(|s| s.host_ref.clone()));
    if let Some(host_ref) = host_ref {
        if get_data_image(client.clone(), &host_ref.namespace, &host_ref.name)
            .await?
            .is_some()
        {
            delete_data_image(client.clone(), &host_ref.namespace, &host_ref.name).await?;
            // the host controller only releases the mount on reboot
            if get_host(client.clone(), &host_ref).await?.is_some() {
                request_unmount(client.clone(), &host_ref).await?;
            }
            debug!(
                msg = "waiting for data image release",
                namespace,
                name,
                host = format!("{}/{}", host_ref.namespace, host_ref.name)
            );
            return Ok(Action::requeue(DEPROVISION_REQUEUE));
        }
    }

    remove_finalizer(client, intent).await?;
    Ok(Action::await_change())
}

async fn publish_event(
    ctx: &Context,
    intent: &InstallIntent,
    type_: EventType,
    reason: &str,
    note: String,
) {
    if let Err(e) = ctx
        .ibiop_ctx
        .recorder
        .publish(
            &Event {
                type_,
                reason: reason.to_string(),
                note: Some(note),
                action: "Reconcile".to_string(),
                secondary: None,
            },
            &intent.object_ref(&()),
        )
        .await
    {
        tracing::warn!(msg = "failed to publish event", %e);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::InstallIntentSpec;
    use ibiop_operator::controller::DEFAULT_RECONCILE_INTERVAL;

    #[test]
    fn test_requeue_intervals_are_short_for_contention() {
        assert!(LOCK_CONTENTION_REQUEUE < VALIDATION_REQUEUE);
        assert!(VALIDATION_REQUEUE < DEPROVISION_REQUEUE);
        assert!(DEPROVISION_REQUEUE < DEFAULT_RECONCILE_INTERVAL);
    }

    #[test]
    fn test_boot_recorded_short_circuit_predicate() {
        let mut intent = InstallIntent::new("cluster1", InstallIntentSpec::default());
        assert!(!intent.boot_recorded());
        intent.status = Some(crate::crd::InstallIntentStatus {
            boot_time: Some(Time(Timestamp::from_second(1_000).unwrap())),
            ..Default::default()
        });
        assert!(intent.boot_recorded());
    }
}
