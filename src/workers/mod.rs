//! Lifecycle workers.
//!
//! One worker family per queue, each applying a single idempotent state
//! transition. The shared loop gives every handler the same failure
//! contract: an error re-publishes the message with a bumped retry counter,
//! and exhausted retries land in the dead-letter queue. A worker that reads
//! an order whose status does not match its transition treats the message
//! as a replay and acks.

pub mod cancel;
pub mod close;
pub mod open;
pub mod reject;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use crate::error::EngineError;
use crate::provider::ExecutionReport;
use crate::queue::{self, QueueBus, QueueMessage};

pub const MAX_RETRIES: u32 = 3;

#[async_trait]
pub trait ReportHandler: Send + Sync {
    fn queue(&self) -> &'static str;
    async fn handle(&self, report: &ExecutionReport) -> Result<(), EngineError>;
}

/// Consume loop shared by every worker family.
pub async fn run_worker(bus: Arc<dyn QueueBus>, handler: Arc<dyn ReportHandler>) {
    let queue_name = handler.queue();
    loop {
        let msg = match bus.consume(queue_name).await {
            Ok(m) => m,
            Err(e) => {
                warn!(queue = queue_name, error = %e, "consume failed");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }
        };
        process_message(bus.as_ref(), handler.as_ref(), msg).await;
    }
}

/// One delivery: parse, handle, and apply the retry/dead-letter policy.
pub async fn process_message(
    bus: &dyn QueueBus,
    handler: &dyn ReportHandler,
    msg: QueueMessage,
) {
    let queue_name = handler.queue();
    let report: ExecutionReport = match serde_json::from_value(msg.body.clone()) {
        Ok(r) => r,
        Err(e) => {
            warn!(queue = queue_name, error = %e, "undecodable worker message");
            let _ = queue::publish_dlq(bus, queue_name, "malformed_payload", msg.body).await;
            return;
        }
    };
    match handler.handle(&report).await {
        Ok(()) => {}
        Err(e) => {
            let retries = msg.retries + 1;
            if retries >= MAX_RETRIES {
                error!(
                    queue = queue_name,
                    order_id = %report.order_id,
                    error = %e,
                    "retries exhausted, dead-lettering"
                );
                let _ = queue::publish_dlq(bus, queue_name, e.reason(), msg.body).await;
            } else {
                warn!(
                    queue = queue_name,
                    order_id = %report.order_id,
                    retries,
                    error = %e,
                    "handler failed, requeueing"
                );
                let _ = bus
                    .publish_message(
                        queue_name,
                        &QueueMessage {
                            retries,
                            body: msg.body,
                        },
                    )
                    .await;
            }
        }
    }
}
