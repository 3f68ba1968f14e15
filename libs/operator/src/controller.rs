use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::metrics::{ControllerMetrics, Metrics};

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use kube::Resource;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::controller::Action;
use kube::runtime::events::Recorder;
use kube::runtime::reflector::{Lookup, ObjectRef};
use prometheus_client::registry::Registry;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tokio::time::Duration;
use tracing::error;

pub type ControllerId = &'static str;
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// State shared between the controllers and the admin server
#[derive(Clone)]
pub struct State {
    /// Metrics
    metrics: Arc<Metrics>,
    /// Runtime configuration
    config: Arc<ServiceConfig>,
}

impl State {
    pub fn new(registry: Registry, controller_names: &[&'static str], config: ServiceConfig) -> Self {
        Self {
            metrics: Arc::new(Metrics::new(registry, controller_names)),
            config: Arc::new(config),
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Result<String> {
        let mut buffer = String::new();
        let registry = &*self.metrics.registry;
        prometheus_client::encoding::text::encode(&mut buffer, registry)
            .map_err(|e| Error::FormattingError("failed to encode metrics".to_string(), e))?;
        Ok(buffer)
    }

    pub fn config(&self) -> Arc<ServiceConfig> {
        self.config.clone()
    }

    /// Create a Controller Context that can update State
    pub fn to_context<K>(&self, client: Client, controller_id: ControllerId) -> Context<K>
    where
        K: Resource + Lookup + Clone + 'static,
        <K as Lookup>::DynamicType: Default + Eq + std::hash::Hash + Clone,
    {
        Context::new(
            controller_id,
            client.clone(),
            self.metrics
                .controllers
                .get(controller_id)
                .expect("all CONTROLLER_IDs have to be registered")
                .clone(),
            Recorder::new(client, controller_id.into()),
            self.config.clone(),
        )
    }
}

// Context for our reconcilers
#[derive(Clone)]
pub struct Context<K: Resource> {
    /// Controller ID
    pub controller_id: ControllerId,
    /// Kubernetes client
    pub client: Client,
    /// Prometheus metrics
    pub metrics: Arc<ControllerMetrics>,
    /// Event recorder
    pub recorder: Recorder,
    /// Runtime configuration
    pub config: Arc<ServiceConfig>,
    /// Requeue delay policy per failing object, dropped on the next success
    failure_backoffs: Arc<RwLock<HashMap<ObjectRef<K>, ExponentialBackoff>>>,
}

impl<K> Context<K>
where
    K: Resource + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Eq + std::hash::Hash + Clone,
{
    pub fn new(
        controller_id: ControllerId,
        client: Client,
        metrics: Arc<ControllerMetrics>,
        recorder: Recorder,
        config: Arc<ServiceConfig>,
    ) -> Self {
        Self {
            controller_id,
            client,
            metrics,
            recorder,
            config,
            failure_backoffs: Arc::default(),
        }
    }
}

#[allow(async_fn_in_trait)]
pub trait BackoffContext<K: Resource> {
    fn metrics(&self) -> &Arc<ControllerMetrics>;
    async fn get_backoff(&self, obj_ref: ObjectRef<K>) -> Duration;
    async fn reset_backoff(&self, obj_ref: ObjectRef<K>);
}

impl<K> BackoffContext<K> for Context<K>
where
    K: Resource<DynamicType = ()> + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Eq + std::hash::Hash + Clone,
{
    fn metrics(&self) -> &Arc<ControllerMetrics> {
        &self.metrics
    }

    /// Next requeue delay for an object whose reconcile just failed.
    ///
    /// A fresh policy starts at one second and doubles until it saturates
    /// at the regular reconcile interval.
    async fn get_backoff(&self, obj_ref: ObjectRef<K>) -> Duration {
        let mut backoffs = self.failure_backoffs.write().await;
        if let Some(duration) = backoffs.get_mut(&obj_ref).and_then(|b| b.next()) {
            return duration;
        }
        let mut backoff = ExponentialBuilder::default()
            .with_max_delay(DEFAULT_RECONCILE_INTERVAL)
            .without_max_times()
            .build();
        // safe unwrap: a fresh policy always yields its first step
        let duration = backoff.next().unwrap();
        backoffs.insert(obj_ref, backoff);
        duration
    }

    /// A successful reconcile forgets the object's failure history.
    async fn reset_backoff(&self, obj_ref: ObjectRef<K>) {
        self.failure_backoffs.write().await.remove(&obj_ref);
    }
}

pub async fn check_api_queryable<K>(client: Client) -> Api<K>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let kind = std::any::type_name::<K>()
        .rsplit("::")
        .next()
        .unwrap_or("resource");
    let api = Api::<K>::all(client.clone());
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("{kind} is not queryable; {e:?}. Check controller permissions");
        std::process::exit(1);
    }
    api
}

pub fn error_policy<K, C>(_obj: Arc<K>, _error: &Error, _ctx: Arc<C>) -> Action {
    unreachable!("Handle in backoff_reconciler macro")
}

/// Wrap a reconciler so that errors turn into per-object exponential
/// backoff requeues instead of reaching the controller's error policy.
#[macro_export]
macro_rules! backoff_reconciler {
    ($inner_reconciler:ident) => {
        |obj, ctx| async move {
            use $crate::controller::BackoffContext;
            let obj_ref = kube::runtime::reflector::ObjectRef::from(obj.as_ref());
            match $inner_reconciler(obj.clone(), ctx.clone()).await {
                Ok(action) => {
                    ctx.reset_backoff(obj_ref).await;
                    Ok(action)
                }
                Err(error) => {
                    tracing::error!(
                        msg = "failed reconciliation",
                        namespace = obj_ref.namespace.as_deref().unwrap_or_default(),
                        name = %obj_ref.name,
                        %error,
                    );
                    ctx.metrics().reconcile_failure_inc();
                    let delay = ctx.get_backoff(obj_ref).await;
                    Ok(kube::runtime::controller::Action::requeue(delay))
                }
            }
        }
    };
}
