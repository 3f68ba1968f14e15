use crate::context::Context;
use crate::crd::{INSTALL_TIMEOUT_ANNOTATION, InstallIntent};
use crate::external::ClusterVersion;
use crate::reconcile::conditions::{set_installed, set_installing, set_timed_out};
use crate::reconcile::credentials::KUBECONFIG_KEY;
use crate::reconcile::host::{get_host, set_detached};

use ibiop_k8s_util::parse::parse_duration;
use ibiop_operator::error::{Error, Result};
use ibiop_operator::telemetry;

use std::sync::Arc;

use jiff::SignedDuration;
use k8s_openapi::api::core::v1::{Node, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::jiff::Timestamp;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType};
use kube::{Config, Resource, ResourceExt};
use tokio::time::Duration;
use tracing::{Span, debug, field, info, instrument, warn};

/// Hard deadline for every read against the spoke cluster.
const SPOKE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Default installation budget, measured from bootTime.
const DEFAULT_INSTALL_TIMEOUT: SignedDuration = SignedDuration::from_secs(60 * 60);

const POLL_INTERVAL: Duration = Duration::from_secs(60);
const TIMED_OUT_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// What a single poll of the spoke cluster concluded.
#[derive(Debug, PartialEq, Eq)]
pub struct SpokeStatus {
    pub installed: bool,
    pub detail: String,
}

/// Installation budget: one hour unless overridden per intent.
pub fn install_timeout(intent: &InstallIntent) -> SignedDuration {
    match intent.annotations().get(INSTALL_TIMEOUT_ANNOTATION) {
        Some(raw) => parse_duration(raw).unwrap_or_else(|| {
            warn!(
                msg = "unparseable install timeout annotation, using default",
                value = raw.as_str()
            );
            DEFAULT_INSTALL_TIMEOUT
        }),
        None => DEFAULT_INSTALL_TIMEOUT,
    }
}

pub fn timeout_expired(boot_time: &Time, now: Timestamp, timeout: SignedDuration) -> bool {
    let elapsed = SignedDuration::from_secs(now.as_second() - boot_time.0.as_second());
    elapsed > timeout
}

pub fn cluster_version_available(cluster_version: &ClusterVersion) -> bool {
    cluster_version
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.condition_type == "Available" && c.status == "True")
        })
}

pub fn nodes_ready(nodes: &[Node]) -> (usize, usize) {
    let ready = nodes
        .iter()
        .filter(|node| {
            node.status
                .as_ref()
                .and_then(|s| s.conditions.as_ref())
                .is_some_and(|conditions| {
                    conditions
                        .iter()
                        .any(|c| c.type_ == "Ready" && c.status == "True")
                })
        })
        .count();
    (ready, nodes.len())
}

pub fn spoke_status(cluster_version_available: bool, ready: usize, total: usize) -> SpokeStatus {
    SpokeStatus {
        installed: cluster_version_available && total > 0 && ready == total,
        detail: format!(
            "ClusterVersion Available: {cluster_version_available}, Nodes ready: {ready}/{total}"
        ),
    }
}

/// Build a client against the spoke cluster from the issued admin
/// kubeconfig secret.
pub async fn build_spoke_client(
    client: Client,
    namespace: &str,
    intent: &InstallIntent,
) -> Result<Client> {
    let metadata = intent.spec.cluster_metadata.as_ref().ok_or_else(|| {
        Error::MissingData(format!(
            "InstallIntent {namespace}/{} has no cluster metadata",
            intent.name_any()
        ))
    })?;
    let secret_name = &metadata.admin_kubeconfig_secret_ref.name;
    let api = Api::<Secret>::namespaced(client, namespace);
    let secret = api.get(secret_name).await.map_err(|e| {
        Error::KubeError(
            format!("failed to get Secret {namespace}/{secret_name}"),
            Box::new(e),
        )
    })?;
    let raw = secret
        .data
        .as_ref()
        .and_then(|data| data.get(KUBECONFIG_KEY))
        .ok_or_else(|| {
            Error::MissingData(format!(
                "Secret {namespace}/{secret_name} has no '{KUBECONFIG_KEY}' key"
            ))
        })?;
    let raw = std::str::from_utf8(&raw.0).map_err(|_| {
        Error::ValidationError(format!(
            "Secret {namespace}/{secret_name} kubeconfig is not UTF-8"
        ))
    })?;
    let kubeconfig = Kubeconfig::from_yaml(raw)
        .map_err(|e| Error::ParseError(format!("failed to parse admin kubeconfig: {e}")))?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::ParseError(format!("failed to load admin kubeconfig: {e}")))?;
    config.connect_timeout = Some(SPOKE_REQUEST_TIMEOUT);
    config.read_timeout = Some(SPOKE_REQUEST_TIMEOUT);
    Client::try_from(config)
        .map_err(|e| Error::KubeError("failed to build spoke client".to_string(), Box::new(e)))
}

/// A failing read is a normal state while the cluster boots, so poll errors
/// degrade to "not installed" with the error in the status detail.
pub async fn poll_spoke(spoke: Client) -> SpokeStatus {
    let cluster_version_api = Api::<ClusterVersion>::all(spoke.clone());
    let available = match cluster_version_api.get_opt("version").await {
        Ok(cluster_version) => cluster_version
            .as_ref()
            .map(cluster_version_available)
            .unwrap_or(false),
        Err(e) => {
            debug!(msg = "spoke cluster version not readable", error = %e);
            return SpokeStatus {
                installed: false,
                detail: format!("failed to read ClusterVersion: {e}"),
            };
        }
    };

    let node_api = Api::<Node>::all(spoke);
    let nodes = match node_api.list(&ListParams::default()).await {
        Ok(list) => list.items,
        Err(e) => {
            debug!(msg = "spoke nodes not readable", error = %e);
            return SpokeStatus {
                installed: false,
                detail: format!("failed to list Nodes: {e}"),
            };
        }
    };
    let (ready, total) = nodes_ready(&nodes);
    spoke_status(available, ready, total)
}

/// Observe a booted intent until the cluster reports installed or the
/// timeout budget runs out. Timeout is a pessimistic signal, not a latch: a
/// successful poll after `InstallTimedOut` still flips the intent to
/// installed.
#[instrument(skip(ctx, intent), fields(trace_id))]
pub async fn reconcile_monitor(intent: Arc<InstallIntent>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.ibiop_ctx.metrics.reconcile_count_and_measure(&trace_id);

    let namespace = intent.get_namespace();
    let name = intent.name_any();
    let client = ctx.ibiop_ctx.client.clone();

    let Some(boot_time) = intent.status.as_ref().and_then(|s| s.boot_time.clone()) else {
        // the watch predicate filters these out; nothing to do
        return Ok(Action::await_change());
    };
    if intent.metadata.deletion_timestamp.is_some() {
        debug!(msg = "intent is being deleted, skipping monitor", namespace, name);
        return Ok(Action::await_change());
    }
    if intent.install_succeeded() {
        debug!(msg = "install already completed", namespace, name);
        return Ok(Action::await_change());
    }

    info!(msg = "monitoring cluster installation", namespace, name);
    let host_ref = intent
        .status
        .as_ref()
        .and_then(|s| s.host_ref.clone())
        .ok_or_else(|| {
            Error::MissingData(format!(
                "InstallIntent {namespace}/{name} has bootTime but no status.hostRef"
            ))
        })?;
    let host = get_host(client.clone(), &host_ref)
        .await?
        .ok_or_else(|| {
            Error::MissingData(format!(
                "HostDescriptor {}/{} vanished after boot",
                host_ref.namespace, host_ref.name
            ))
        })?;

    let timeout = install_timeout(&intent);

    if !host.powered_on() {
        if timeout_expired(&boot_time, Timestamp::now(), timeout) {
            return timed_out(&ctx, &intent, "Waiting for host to power on").await;
        }
        set_installing(
            client,
            &intent,
            "Waiting for host to power on".to_string(),
        )
        .await?;
        return Ok(Action::requeue(POLL_INTERVAL));
    }

    let spoke = build_spoke_client(client.clone(), &namespace, &intent).await?;
    let status = poll_spoke(spoke).await;

    if status.installed {
        info!(msg = "cluster installation succeeded", namespace, name);
        set_detached(client.clone(), &host_ref).await?;
        set_installed(client, &intent, status.detail.clone()).await?;
        publish_event(
            &ctx,
            &intent,
            EventType::Normal,
            "InstallSucceeded",
            status.detail,
        )
        .await;
        return Ok(Action::await_change());
    }

    if timeout_expired(&boot_time, Timestamp::now(), timeout) {
        return timed_out(&ctx, &intent, &status.detail).await;
    }
    set_installing(client, &intent, status.detail).await?;
    Ok(Action::requeue(POLL_INTERVAL))
}

async fn timed_out(ctx: &Context, intent: &InstallIntent, detail: &str) -> Result<Action> {
    let message = format!("Installation timed out: {detail}");
    warn!(
        msg = "install timeout budget exhausted",
        namespace = intent.get_namespace(),
        name = intent.name_any()
    );
    set_timed_out(ctx.ibiop_ctx.client.clone(), intent, message.clone()).await?;
    publish_event(ctx, intent, EventType::Warning, "InstallTimedOut", message).await;
    Ok(Action::requeue(TIMED_OUT_INTERVAL))
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
                action: "Monitor".to_string(),
                secondary: None,
            },
            &intent.object_ref(&()),
        )
        .await
    {
        warn!(msg = "failed to publish event", %e);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::InstallIntentSpec;
    use crate::external::{ClusterVersionStatus, OperatorCondition};
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};

    fn cluster_version(available: bool) -> ClusterVersion {
        let mut cluster_version = ClusterVersion::default();
        cluster_version.status = Some(ClusterVersionStatus {
            conditions: Some(vec![OperatorCondition {
                condition_type: "Available".to_string(),
                status: if available { "True" } else { "False" }.to_string(),
                message: None,
            }]),
        });
        cluster_version
    }

    fn node(ready: bool) -> Node {
        Node {
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..NodeCondition::default()
                }]),
                ..NodeStatus::default()
            }),
            ..Node::default()
        }
    }

    #[test]
    fn test_cluster_version_available() {
        assert!(cluster_version_available(&cluster_version(true)));
        assert!(!cluster_version_available(&cluster_version(false)));
        assert!(!cluster_version_available(&ClusterVersion::default()));
    }

    #[test]
    fn test_nodes_ready_counts() {
        assert_eq!(nodes_ready(&[]), (0, 0));
        assert_eq!(nodes_ready(&[node(true), node(false)]), (1, 2));
        assert_eq!(nodes_ready(&[node(true), node(true)]), (2, 2));
    }

    #[test]
    fn test_installed_requires_cv_and_all_nodes() {
        assert!(spoke_status(true, 1, 1).installed);
        assert!(spoke_status(true, 2, 2).installed);
        assert!(!spoke_status(true, 0, 0).installed);
        assert!(!spoke_status(true, 1, 2).installed);
        assert!(!spoke_status(false, 1, 1).installed);
    }

    #[test]
    fn test_spoke_status_detail_carries_both_substates() {
        let status = spoke_status(false, 0, 1);
        assert_eq!(
            status.detail,
            "ClusterVersion Available: false, Nodes ready: 0/1"
        );
    }

    fn intent_with_timeout(annotation: Option<&str>) -> InstallIntent {
        let mut intent = InstallIntent::new("cluster1", InstallIntentSpec::default());
        if let Some(value) = annotation {
            intent
                .metadata
                .annotations
                .get_or_insert_default()
                .insert(INSTALL_TIMEOUT_ANNOTATION.to_string(), value.to_string());
        }
        intent
    }

    #[test]
    fn test_install_timeout_default_and_override() {
        assert_eq!(
            install_timeout(&intent_with_timeout(None)),
            SignedDuration::from_secs(3600)
        );
        assert_eq!(
            install_timeout(&intent_with_timeout(Some("90m"))),
            SignedDuration::from_secs(5400)
        );
        // unparseable values fall back to the default
        assert_eq!(
            install_timeout(&intent_with_timeout(Some("soon"))),
            SignedDuration::from_secs(3600)
        );
    }

    #[test]
    fn test_negative_timeout_expires_immediately() {
        let boot = Time(Timestamp::from_second(1_000).unwrap());
        let now = Timestamp::from_second(1_001).unwrap();
        assert!(timeout_expired(
            &boot,
            now,
            SignedDuration::from_secs(-60)
        ));
    }

    #[test]
    fn test_timeout_budget_measured_from_boot() {
        let boot = Time(Timestamp::from_second(1_000).unwrap());
        let timeout = SignedDuration::from_secs(3600);
        assert!(!timeout_expired(
            &boot,
            Timestamp::from_second(1_000 + 3599).unwrap(),
            timeout
        ));
        assert!(timeout_expired(
            &boot,
            Timestamp::from_second(1_000 + 3601).unwrap(),
            timeout
        ));
    }
}
