use crate::context::Context;
use crate::crd::InstallIntent;
use crate::external::{DeploymentDescriptor, HostDescriptor};
use crate::image::ImageBuilder;
use crate::reconcile::monitor::reconcile_monitor;
use crate::reconcile::reconcile_intent;

use ibiop_operator::backoff_reconciler;
use ibiop_operator::controller::{ControllerId, State, check_api_queryable};
use ibiop_operator::error::Error;

use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use kube::ResourceExt;
use kube::client::Client;
use kube::runtime::controller::{self, Controller};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{WatchStreamExt, watcher};
use tokio::time::Duration;
use tracing::{error, info};

pub const INSTALL_CONTROLLER_ID: ControllerId = "install";
pub const MONITOR_CONTROLLER_ID: ControllerId = "monitor";
pub const CONTROLLER_IDS: [ControllerId; 2] = [INSTALL_CONTROLLER_ID, MONITOR_CONTROLLER_ID];

/// Reverse index from a host event to the intents referencing it.
///
/// More than one match is the ambiguous configuration the design warns
/// against: it is logged, and all matches are enqueued.
pub fn intents_for_host(
    intents: &[Arc<InstallIntent>],
    host: &HostDescriptor,
) -> Vec<ObjectRef<InstallIntent>> {
    let host_name = host.name_any();
    let host_namespace = host.get_namespace();
    let matches = intents
        .iter()
        .filter(|intent| {
            intent
                .spec
                .host_ref
                .as_ref()
                .is_some_and(|r| r.name == host_name && r.namespace == host_namespace)
        })
        .map(|intent| ObjectRef::from(intent.as_ref()))
        .collect::<Vec<_>>();
    if matches.len() > 1 {
        error!(
            msg = "multiple install intents reference the same host",
            host = format!("{host_namespace}/{host_name}"),
            intents = format!("{matches:?}")
        );
    }
    matches
}

/// A deployment event maps to the intent its clusterInstallRef targets.
pub fn intent_for_deployment(
    deployment: &DeploymentDescriptor,
) -> Option<ObjectRef<InstallIntent>> {
    let namespace = deployment.namespace()?;
    let install_ref = deployment.spec.cluster_install_ref.as_ref()?;
    if install_ref.group != "ibiop.rs" || install_ref.kind != "InstallIntent" {
        return None;
    }
    Some(ObjectRef::new(&install_ref.name).within(&namespace))
}

/// Run both controllers until shutdown: the install reconciler with its
/// host and deployment watches, and the monitor on intents whose boot time
/// is recorded.
pub async fn run(state: State, client: Client, image_builder: Arc<dyn ImageBuilder>) {
    let intent_api = check_api_queryable::<InstallIntent>(client.clone()).await;
    let host_api = check_api_queryable::<HostDescriptor>(client.clone()).await;
    let deployment_api = check_api_queryable::<DeploymentDescriptor>(client.clone()).await;

    let config = state.config();
    let controller_config = controller::Config::default()
        // debounce to filter out reconcile calls in quick succession (only taking the latest)
        .debounce(Duration::from_millis(500))
        .concurrency(config.max_concurrent_reconciles);

    let (intent_store, intent_writer) = reflector::store::<InstallIntent>();
    let intent_stream = watcher(intent_api.clone(), watcher::Config::default().any_semantic())
        .default_backoff()
        .reflect(intent_writer)
        .touched_objects();

    let install_ctx = Arc::new(Context::new(
        state.to_context(client.clone(), INSTALL_CONTROLLER_ID),
        image_builder.clone(),
    ));
    let host_mapper = {
        let store: Store<InstallIntent> = intent_store.clone();
        let metrics = install_ctx.ibiop_ctx.metrics.clone();
        move |host: HostDescriptor| {
            metrics.triggered_inc("HostDescriptor");
            intents_for_host(&store.state(), &host)
        }
    };
    let deployment_mapper = {
        let metrics = install_ctx.ibiop_ctx.metrics.clone();
        move |deployment: DeploymentDescriptor| {
            metrics.triggered_inc("DeploymentDescriptor");
            intent_for_deployment(&deployment)
        }
    };

    info!(msg = format!("starting {INSTALL_CONTROLLER_ID} controller"));
    let install_controller = Controller::for_stream(intent_stream, intent_store.clone())
        .with_config(controller_config.clone())
        .watches(
            host_api,
            watcher::Config::default().any_semantic(),
            host_mapper,
        )
        .watches(
            deployment_api,
            watcher::Config::default().any_semantic(),
            deployment_mapper,
        )
        .shutdown_on_signal()
        .run(
            backoff_reconciler!(reconcile_intent),
            |_obj, _error: &Error, _ctx| unreachable!(),
            install_ctx.clone(),
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    // The monitor subscribes only to intents that already booted; deletes
    // and everything pre-boot are filtered out of its trigger stream.
    let (monitor_store, monitor_writer) = reflector::store::<InstallIntent>();
    let monitor_stream = watcher(intent_api, watcher::Config::default().any_semantic())
        .default_backoff()
        .reflect(monitor_writer)
        .touched_objects()
        .try_filter(|intent| futures::future::ready(intent.boot_recorded()));

    let monitor_ctx = Arc::new(Context::new(
        state.to_context(client, MONITOR_CONTROLLER_ID),
        image_builder,
    ));

    info!(msg = format!("starting {MONITOR_CONTROLLER_ID} controller"));
    let monitor_controller = Controller::for_stream(monitor_stream, monitor_store)
        .with_config(controller_config)
        .shutdown_on_signal()
        .run(
            backoff_reconciler!(reconcile_monitor),
            |_obj, _error: &Error, _ctx| unreachable!(),
            monitor_ctx.clone(),
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    install_ctx.ibiop_ctx.metrics.ready_set(1);
    monitor_ctx.ibiop_ctx.metrics.ready_set(1);
    tokio::select! {
        _ = install_controller => {},
        _ = monitor_controller => {},
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::{HostRef, InstallIntentSpec};
    use crate::external::{ClusterInstallRef, DeploymentDescriptorSpec, HostDescriptorSpec};
    use kube::api::ObjectMeta;

    fn intent(name: &str, host: Option<(&str, &str)>) -> Arc<InstallIntent> {
        let mut intent = InstallIntent::new(
            name,
            InstallIntentSpec {
                host_ref: host.map(|(namespace, name)| HostRef {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                }),
                ..InstallIntentSpec::default()
            },
        );
        intent.metadata.namespace = Some("ns".to_string());
        Arc::new(intent)
    }

    fn host(namespace: &str, name: &str) -> HostDescriptor {
        let mut host = HostDescriptor::new(name, HostDescriptorSpec::default());
        host.metadata = ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        };
        host
    }

    #[test]
    fn test_host_event_maps_to_referencing_intent() {
        let intents = vec![
            intent("a", Some(("hns", "h1"))),
            intent("b", Some(("hns", "h2"))),
            intent("c", None),
        ];
        let refs = intents_for_host(&intents, &host("hns", "h1"));
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "a");
        assert_eq!(refs[0].namespace.as_deref(), Some("ns"));
    }

    #[test]
    fn test_namespace_is_part_of_the_index_key() {
        let intents = vec![intent("a", Some(("other", "h1")))];
        assert!(intents_for_host(&intents, &host("hns", "h1")).is_empty());
    }

    #[test]
    fn test_ambiguous_hosts_enqueue_all_matches() {
        let intents = vec![
            intent("a", Some(("hns", "h1"))),
            intent("b", Some(("hns", "h1"))),
        ];
        let refs = intents_for_host(&intents, &host("hns", "h1"));
        assert_eq!(refs.len(), 2);
    }

    fn deployment(install_ref: Option<ClusterInstallRef>) -> DeploymentDescriptor {
        let mut deployment = DeploymentDescriptor::new(
            "cluster1",
            DeploymentDescriptorSpec {
                cluster_install_ref: install_ref,
                ..DeploymentDescriptorSpec::default()
            },
        );
        deployment.metadata.namespace = Some("ns".to_string());
        deployment
    }

    #[test]
    fn test_deployment_event_maps_through_cluster_install_ref() {
        let mapped = intent_for_deployment(&deployment(Some(ClusterInstallRef {
            group: "ibiop.rs".to_string(),
            kind: "InstallIntent".to_string(),
            name: "cluster1".to_string(),
        })))
        .unwrap();
        assert_eq!(mapped.name, "cluster1");
        assert_eq!(mapped.namespace.as_deref(), Some("ns"));
    }

    #[test]
    fn test_foreign_install_refs_are_ignored() {
        assert!(intent_for_deployment(&deployment(None)).is_none());
        assert!(
            intent_for_deployment(&deployment(Some(ClusterInstallRef {
                group: "other.io".to_string(),
                kind: "SomethingElse".to_string(),
                name: "cluster1".to_string(),
            })))
            .is_none()
        );
    }
}
