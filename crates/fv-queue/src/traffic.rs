//! The concrete [`JobHandler`] the batch processor runs: dispatches queued
//! [`Payload`] variants onto a [`TrafficEngine`], so the collection cycle and
//! bulk monitor add/delete (spec §4.8: "used by the traffic pipeline and by
//! bulk add/delete of monitors") both flow through the same adaptive queue.

use std::sync::Arc;

use async_trait::async_trait;
use fv_core::error::CoreError;
use fv_storage::Storage;
use fv_traffic::TrafficEngine;
use tracing::warn;

use crate::batch::JobHandler;
use crate::queue::{Payload, QueueItem};

pub struct TrafficJobHandler<S: Storage> {
    engine: Arc<TrafficEngine<S>>,
}

impl<S: Storage> TrafficJobHandler<S> {
    pub fn new(engine: Arc<TrafficEngine<S>>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl<S: Storage + 'static> JobHandler for TrafficJobHandler<S> {
    async fn handle(&self, item: QueueItem) -> Result<(), CoreError> {
        match item.payload {
            Payload::CollectTraffic { node, monitor } => {
                let written = self.engine.collect_one(&node, &monitor).await?;
                if written == 0 {
                    warn!(instance_id = %monitor.instance_id, "collection cycle wrote no rows");
                }
                Ok(())
            }
            Payload::AddMonitor { node, instance, device } => self.engine.install(&node, &instance, &device).await,
            Payload::DeleteMonitor { mut monitor } => {
                monitor.is_enabled = false;
                self.engine.disable_monitor(monitor).await
            }
        }
    }
}
