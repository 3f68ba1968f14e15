use crate::crd::{
    ConditionStatus, ConditionType, InstallIntent, IntentCondition, REASON_INSTALL_IN_PROGRESS,
    REASON_INSTALL_SUCCEEDED, REASON_INSTALL_TIMED_OUT,
};

use ibiop_operator::error::{Error, Result};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::jiff::Timestamp;
use kube::api::{Api, Patch, PatchParams};
use kube::client::Client;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, trace};

/// Reason used when the condition set is first initialized to Unknown.
pub const REASON_INITIALIZED: &str = "Initialized";

pub struct ConditionUpdate {
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    pub reason: &'static str,
    pub message: String,
}

fn now() -> Time {
    Time(Timestamp::now())
}

/// Upsert a condition by type.
///
/// Returns false and leaves the set untouched when `{status, reason,
/// message}` already match, so callers can skip the API write entirely.
/// `lastTransitionTime` moves only when `status` changes;
/// `lastProbeTime` moves on every effective update.
pub fn upsert_condition(
    conditions: &mut Vec<IntentCondition>,
    update: &ConditionUpdate,
    probe_time: Time,
) -> bool {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == update.condition_type)
    {
        Some(existing) => {
            if existing.status == update.status
                && existing.reason == update.reason
                && existing.message == update.message
            {
                return false;
            }
            if existing.status != update.status {
                existing.last_transition_time = probe_time.clone();
            }
            existing.status = update.status;
            existing.reason = update.reason.to_string();
            existing.message = update.message.clone();
            existing.last_probe_time = probe_time;
            true
        }
        None => {
            conditions.push(IntentCondition {
                condition_type: update.condition_type,
                status: update.status,
                reason: update.reason.to_string(),
                message: update.message.clone(),
                last_probe_time: probe_time.clone(),
                last_transition_time: probe_time,
            });
            true
        }
    }
}

/// Apply a batch of condition upserts under a single merge-from status
/// patch: the latest object is read back, the upserts are computed against
/// it, and the write carries its resourceVersion so a concurrent writer
/// surfaces as a conflict instead of a clobber. The patch is skipped
/// entirely when every upsert reports "no change" — required to avoid a
/// feedback loop with the monitor's own watch.
pub async fn patch_conditions(
    client: Client,
    intent: &InstallIntent,
    updates: Vec<ConditionUpdate>,
) -> Result<bool> {
    let namespace = intent.get_namespace();
    let name = intent.name_any();
    let api = Api::<InstallIntent>::namespaced(client, &namespace);

    let latest = api.get(&name).await.map_err(|e| {
        Error::KubeError(
            format!("failed to get InstallIntent {namespace}/{name}"),
            Box::new(e),
        )
    })?;
    let mut conditions = latest
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    let probe_time = now();
    let changed = updates.iter().fold(false, |changed, update| {
        upsert_condition(&mut conditions, update, probe_time.clone()) || changed
    });
    if !changed {
        trace!(msg = "conditions unchanged, skipping patch", namespace, name);
        return Ok(false);
    }

    debug!(msg = "patching conditions", namespace, name);
    api.patch_status(
        &name,
        &PatchParams::default(),
        &Patch::Merge(json!({
            "metadata": {"resourceVersion": latest.resource_version()},
            "status": {"conditions": conditions},
        })),
    )
    .await
    .map_err(|e| {
        Error::KubeError(
            format!("failed to patch InstallIntent/status {namespace}/{name}"),
            Box::new(e),
        )
    })?;
    Ok(true)
}

/// Patch in every absent condition type as Unknown. Types already present
/// on the latest object are left untouched.
pub async fn initialize_conditions(client: Client, intent: &InstallIntent) -> Result<bool> {
    if ConditionType::ALL
        .iter()
        .all(|t| intent.condition(*t).is_some())
    {
        return Ok(false);
    }
    let namespace = intent.get_namespace();
    let name = intent.name_any();
    let api = Api::<InstallIntent>::namespaced(client, &namespace);

    let latest = api.get(&name).await.map_err(|e| {
        Error::KubeError(
            format!("failed to get InstallIntent {namespace}/{name}"),
            Box::new(e),
        )
    })?;
    let mut conditions = latest
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    let probe_time = now();
    let mut changed = false;
    for condition_type in ConditionType::ALL {
        if !conditions
            .iter()
            .any(|c| c.condition_type == condition_type)
        {
            conditions.push(IntentCondition {
                condition_type,
                status: ConditionStatus::Unknown,
                reason: REASON_INITIALIZED.to_string(),
                message: String::new(),
                last_probe_time: probe_time.clone(),
                last_transition_time: probe_time.clone(),
            });
            changed = true;
        }
    }
    if !changed {
        return Ok(false);
    }

    debug!(msg = "initializing conditions", namespace, name);
    api.patch_status(
        &name,
        &PatchParams::default(),
        &Patch::Merge(json!({
            "metadata": {"resourceVersion": latest.resource_version()},
            "status": {"conditions": conditions},
        })),
    )
    .await
    .map_err(|e| {
        Error::KubeError(
            format!("failed to patch InstallIntent/status {namespace}/{name}"),
            Box::new(e),
        )
    })?;
    Ok(true)
}

pub async fn set_requirements(
    client: Client,
    intent: &InstallIntent,
    status: ConditionStatus,
    reason: &'static str,
    message: String,
) -> Result<bool> {
    patch_conditions(
        client,
        intent,
        vec![ConditionUpdate {
            condition_type: ConditionType::Requirements,
            status,
            reason,
            message,
        }],
    )
    .await
}

fn terminal_updates(
    statuses: [(ConditionType, ConditionStatus); 3],
    reason: &'static str,
    message: &str,
) -> Vec<ConditionUpdate> {
    statuses
        .into_iter()
        .map(|(condition_type, status)| ConditionUpdate {
            condition_type,
            status,
            reason,
            message: message.to_string(),
        })
        .collect()
}

pub fn installing_updates(message: &str) -> Vec<ConditionUpdate> {
    terminal_updates(
        [
            (ConditionType::Completed, ConditionStatus::False),
            (ConditionType::Failed, ConditionStatus::False),
            (ConditionType::Stopped, ConditionStatus::False),
        ],
        REASON_INSTALL_IN_PROGRESS,
        message,
    )
}

pub fn installed_updates(message: &str) -> Vec<ConditionUpdate> {
    terminal_updates(
        [
            (ConditionType::Completed, ConditionStatus::True),
            (ConditionType::Failed, ConditionStatus::False),
            (ConditionType::Stopped, ConditionStatus::True),
        ],
        REASON_INSTALL_SUCCEEDED,
        message,
    )
}

pub fn timed_out_updates(message: &str) -> Vec<ConditionUpdate> {
    terminal_updates(
        [
            (ConditionType::Completed, ConditionStatus::False),
            (ConditionType::Failed, ConditionStatus::True),
            (ConditionType::Stopped, ConditionStatus::True),
        ],
        REASON_INSTALL_TIMED_OUT,
        message,
    )
}

pub async fn set_installing(
    client: Client,
    intent: &InstallIntent,
    message: String,
) -> Result<bool> {
    patch_conditions(client, intent, installing_updates(&message)).await
}

pub async fn set_installed(
    client: Client,
    intent: &InstallIntent,
    message: String,
) -> Result<bool> {
    patch_conditions(client, intent, installed_updates(&message)).await
}

pub async fn set_timed_out(
    client: Client,
    intent: &InstallIntent,
    message: String,
) -> Result<bool> {
    patch_conditions(client, intent, timed_out_updates(&message)).await
}
