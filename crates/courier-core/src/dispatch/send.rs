//! One message attempt: every undelivered payload item, in order, on one
//! profile

use super::context::EngineContext;
use crate::executor::{SendOutcome, SendRequest, SendResult, TypingSimulation};
use crate::pacing::Permit;
use courier_common::types::ProfileId;
use courier_storage::{Message, TemplateItem};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, warn};

pub(crate) struct SendJob {
    /// The claimed (PROCESSING) message
    pub message: Message,
    pub profile_id: ProfileId,
    pub permit: Permit,
    pub items: Arc<Vec<TemplateItem>>,
    pub typing: Option<TypingSimulation>,
    /// Delay before each item after the first one sent in this attempt
    pub item_delays: Vec<Duration>,
    pub client_lock: Option<String>,
}

pub(crate) struct SendReport {
    pub message: Message,
    pub profile_id: ProfileId,
    pub permit: Permit,
    pub result: SendResult,
    pub items_sent: i32,
    pub client_lock: Option<String>,
}

pub(crate) async fn execute(ctx: Arc<EngineContext>, job: SendJob) -> SendReport {
    let SendJob {
        message,
        profile_id,
        permit,
        items,
        typing,
        item_delays,
        client_lock,
    } = job;

    let count = items.len();
    let first = message.items_sent.max(0) as usize;
    let mut delivered = first;
    let mut result = SendResult::sent();

    while delivered < count {
        if delivered > first {
            let delay = item_delays
                .get(delivered - first - 1)
                .copied()
                .unwrap_or_default();
            sleep(delay).await;
        }

        let request = SendRequest {
            message_id: message.id,
            campaign_id: message.campaign_id,
            profile_id,
            channel: message.channel,
            contact: message.phone.clone(),
            item: items[delivered].clone(),
            item_index: delivered,
            item_count: count,
            typing,
        };

        result = send_one(&ctx, request).await;
        if result.outcome != SendOutcome::Sent {
            break;
        }

        delivered += 1;
        if let Err(e) = ctx
            .stores
            .messages
            .record_progress(message.id, delivered as i32, ctx.clock.now())
            .await
        {
            warn!(message_id = %message.id, "Failed to record item progress: {}", e);
        }
    }

    debug!(
        message_id = %message.id,
        profile_id = %profile_id,
        outcome = result.outcome.label(),
        items_sent = delivered,
        "Send attempt finished"
    );

    SendReport {
        message,
        profile_id,
        permit,
        result,
        items_sent: delivered as i32,
        client_lock,
    }
}

/// Single executor call, bounded by the send timeout. The executor runs on
/// its own task so a panic surfaces as a failed attempt.
async fn send_one(ctx: &EngineContext, request: SendRequest) -> SendResult {
    let executor = ctx.executor.clone();
    let message_id = request.message_id;
    let mut handle = tokio::spawn(async move { executor.send(request).await });

    match timeout(ctx.send_timeout(), &mut handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!(message_id = %message_id, "Executor task failed: {}", e);
            SendResult::failed(SendOutcome::TransientFailure, "executor task failed")
        }
        Err(_) => {
            handle.abort();
            warn!(message_id = %message_id, "Send timed out");
            SendResult::failed(SendOutcome::TransientFailure, "send timed out")
        }
    }
}
