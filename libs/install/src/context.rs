use crate::crd::InstallIntent;
use crate::image::ImageBuilder;

use ibiop_operator::controller::{BackoffContext, Context as IbiopContext};
use ibiop_operator::metrics::ControllerMetrics;

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::reflector::ObjectRef;

#[derive(Clone)]
pub struct Context {
    pub ibiop_ctx: IbiopContext<InstallIntent>,
    /// Seam to the external ISO assembly library
    pub image_builder: Arc<dyn ImageBuilder>,
}

impl Context {
    pub fn new(ibiop_ctx: IbiopContext<InstallIntent>, image_builder: Arc<dyn ImageBuilder>) -> Self {
        Context {
            ibiop_ctx,
            image_builder,
        }
    }
}

impl BackoffContext<InstallIntent> for Context {
    fn metrics(&self) -> &Arc<ControllerMetrics> {
        &self.ibiop_ctx.metrics
    }

    async fn get_backoff(&self, obj_ref: ObjectRef<InstallIntent>) -> Duration {
        self.ibiop_ctx.get_backoff(obj_ref).await
    }

    async fn reset_backoff(&self, obj_ref: ObjectRef<InstallIntent>) {
        self.ibiop_ctx.reset_backoff(obj_ref).await
    }
}
