//! Stage plugin seam
//!
//! The original system loaded stage callbacks by name at runtime; here the
//! registry is static, populated once at program initialization, and maps a
//! class's consume identifier to its callback. Stages own a RouterCore per
//! invocation and drive the route with its operations.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use sito_broker::{ConsumeCallback, ConsumeOutcome, Delivery, QueueBinding};
use sito_common::SitoReturn;
use sito_dbqueue::RequestUpdate;

use crate::core::{AbortArgs, RouterContext, RouterCore};
use crate::RouterError;

/// One processing stage. Returning an error diverts the packet through
/// publish_abort; a stage that handled routing itself (publish_next,
/// branch, notify) just returns Ok.
#[async_trait]
pub trait Stage: Send + Sync {
    async fn process(&self, router: &mut RouterCore) -> std::result::Result<(), SitoReturn>;
}

/// Static callback registry, read-only after initialization.
#[derive(Default)]
pub struct StageRegistry {
    stages: BTreeMap<String, Arc<dyn Stage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, stage: Arc<dyn Stage>) {
        self.stages.insert(name.into(), stage);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Stage>> {
        self.stages.get(name).cloned()
    }

    /// Build consume-loop bindings for every configured class whose queue
    /// and callback are both known. Classes without a registered callback
    /// are skipped with a warning so a partial worker can still run.
    pub fn bindings(&self, ctx: &RouterContext) -> Vec<QueueBinding> {
        let mut bindings = Vec::new();
        for (class_name, class) in ctx.config.registry.iter() {
            let Some(queue) = &class.queue else { continue };
            let callback_id = class.consume_pm.as_deref().unwrap_or(class_name);
            match self.get(callback_id) {
                Some(stage) => bindings.push(QueueBinding {
                    queue: queue.clone(),
                    callback: Arc::new(StageDispatch {
                        ctx: ctx.clone(),
                        class_name: class_name.to_string(),
                        stage,
                    }),
                }),
                None => warn!(
                    class = %class_name,
                    callback = %callback_id,
                    "No stage registered for class, queue not consumed"
                ),
            }
        }
        bindings
    }
}

/// Consume-side glue for one class: decode the packet, hand a RouterCore to
/// the stage, convert failures into abort/retry hops.
pub struct StageDispatch {
    ctx: RouterContext,
    class_name: String,
    stage: Arc<dyn Stage>,
}

impl StageDispatch {
    pub fn new(ctx: RouterContext, class_name: impl Into<String>, stage: Arc<dyn Stage>) -> Self {
        Self {
            ctx,
            class_name: class_name.into(),
            stage,
        }
    }
}

/// Terminal result stage: persists the final request record and tags in
/// one DB-queue transaction, then lets the route run out. Default target of
/// the global abort route.
pub struct RequestResultsStage;

#[async_trait]
impl Stage for RequestResultsStage {
    async fn process(&self, router: &mut RouterCore) -> std::result::Result<(), SitoReturn> {
        let persisted = {
            let packet = router
                .packet()
                .map_err(|e| SitoReturn::new("OUT_OF_SEQUENCE", e.to_string()))?;
            if packet.settings.record_id.is_none() {
                // Nothing to persist; never abort here or the abort route
                // would lead straight back.
                warn!("Result stage reached without a record id");
                None
            } else {
                Some(
                    router
                        .context()
                        .db
                        .publish_with_request(
                            RequestUpdate::new(packet).caller("RequestResults"),
                        )
                        .await,
                )
            }
        };
        if let Some(Err(e)) = persisted {
            return Err(SitoReturn::new("DB_UPDATE_FAILED", e.to_string()));
        }

        router
            .publish_next(None)
            .await
            .map(|_| ())
            .map_err(|e| SitoReturn::new("PUBLISH_FAILED", e.to_string()))
    }
}

#[async_trait]
impl ConsumeCallback for StageDispatch {
    async fn consume(&self, delivery: &Delivery) -> ConsumeOutcome {
        // An unparseable payload can never succeed; acknowledge and log.
        let packet = match self.ctx.codec().decode(&delivery.payload) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(
                    queue = %delivery.queue,
                    tag = delivery.tag,
                    error = %e,
                    "Unprocessable payload acknowledged"
                );
                return ConsumeOutcome::Ack;
            }
        };

        let mut router = RouterCore::new(self.ctx.clone());
        router.adopt(packet);

        match self.stage.process(&mut router).await {
            Ok(()) => ConsumeOutcome::Ack,
            Err(failure) => {
                warn!(class = %self.class_name, error = %failure, "Stage failed, diverting");
                let abort = AbortArgs::new(&self.class_name).sito_return(failure);
                match router.publish_abort(abort).await {
                    Ok(()) => ConsumeOutcome::Ack,
                    // Broker/DB-queue trouble: leave the message for
                    // redelivery rather than lose the hop.
                    Err(RouterError::Broker(e)) => {
                        error!(class = %self.class_name, error = %e, "Abort publish failed, requeueing");
                        ConsumeOutcome::Requeue
                    }
                    Err(RouterError::DbQueue(e)) => {
                        error!(class = %self.class_name, error = %e, "Abort persistence failed, requeueing");
                        ConsumeOutcome::Requeue
                    }
                    Err(e) => {
                        error!(class = %self.class_name, error = %e, "Abort impossible, acknowledging");
                        ConsumeOutcome::Ack
                    }
                }
            }
        }
    }
}
