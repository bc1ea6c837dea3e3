//! Per-client delivery plans
//!
//! A client's messages (one per channel step) are sent strictly one after
//! another. What follows a finished step depends on the messenger target.

use chrono::{DateTime, Utc};
use courier_common::types::{ClientId, MessengerTarget};
use courier_storage::Message;
use std::collections::VecDeque;

/// Pending steps of one admitted client
#[derive(Debug)]
pub(crate) struct ClientPlan {
    pub client_id: ClientId,
    pub steps: VecDeque<Message>,
    pub in_flight: bool,
    /// Not before this instant (client lock contention)
    pub blocked_until: Option<DateTime<Utc>>,
}

/// How a finished step ended, for plan purposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepResult {
    Sent,
    Failed,
    /// Back to PENDING, not before the given instant
    Retry(Option<DateTime<Utc>>),
}

impl ClientPlan {
    pub fn new(client_id: ClientId, steps: Vec<Message>) -> Self {
        Self {
            client_id,
            steps: steps.into(),
            in_flight: false,
            blocked_until: None,
        }
    }

    pub fn head(&self) -> Option<&Message> {
        self.steps.front()
    }

    pub fn is_done(&self) -> bool {
        self.steps.is_empty()
    }

    /// Earliest instant the head step may be attempted
    pub fn ready_at(&self) -> Option<DateTime<Utc>> {
        let head = self.head()?;
        match (head.next_attempt_at, self.blocked_until) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        !self.in_flight && self.head().is_some() && self.ready_at().map_or(true, |at| at <= now)
    }

    /// Apply the result of the head step; returns steps that are no longer
    /// needed and must be skipped
    pub fn finish_head(&mut self, result: StepResult, target: &MessengerTarget) -> Vec<Message> {
        self.in_flight = false;
        match result {
            StepResult::Retry(at) => {
                if let Some(head) = self.steps.front_mut() {
                    head.next_attempt_at = at;
                }
                Vec::new()
            }
            StepResult::Failed => {
                self.steps.pop_front();
                Vec::new()
            }
            StepResult::Sent => {
                self.steps.pop_front();
                if target.is_fallback() {
                    self.steps.drain(..).collect()
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Remove every remaining step
    pub fn take_all(&mut self) -> Vec<Message> {
        self.steps.drain(..).collect()
    }
}

/// Group a run's PENDING messages into plans, keeping admission order
pub(crate) fn group_pending(messages: Vec<Message>) -> Vec<ClientPlan> {
    let mut plans: Vec<ClientPlan> = Vec::new();
    for message in messages {
        match plans.iter_mut().find(|p| p.client_id == message.client_id) {
            Some(plan) => plan.steps.push_back(message),
            None => plans.push(ClientPlan::new(message.client_id, vec![message])),
        }
    }
    for plan in &mut plans {
        plan.steps.make_contiguous().sort_by_key(|m| m.step);
    }
    plans
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use courier_common::types::{Channel, UniversalOrder};
    use courier_storage::MessageStatus;
    use uuid::Uuid;

    fn message(client_id: ClientId, step: i16, channel: Channel) -> Message {
        let now = Utc::now();
        Message {
            id: Uuid::new_v4(),
            campaign_id: Uuid::nil(),
            run: 1,
            client_id,
            profile_id: None,
            channel,
            phone: "+70000000001".to_string(),
            step,
            status: MessageStatus::Pending,
            attempts: 0,
            items_sent: 0,
            claimed_by: None,
            last_error: None,
            next_attempt_at: None,
            created_at: now,
            updated_at: now,
            sent_at: None,
            archived: false,
        }
    }

    fn two_step(client: ClientId) -> ClientPlan {
        ClientPlan::new(
            client,
            vec![
                message(client, 0, Channel::Whatsapp),
                message(client, 1, Channel::Telegram),
            ],
        )
    }

    #[test]
    fn test_fallback_skips_after_sent() {
        let target = MessengerTarget::Universal {
            order: UniversalOrder::WhatsappFirst,
        };
        let mut plan = two_step(Uuid::new_v4());
        let skipped = plan.finish_head(StepResult::Sent, &target);
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].channel, Channel::Telegram);
        assert!(plan.is_done());
    }

    #[test]
    fn test_fallback_continues_after_failure() {
        let target = MessengerTarget::Universal {
            order: UniversalOrder::WhatsappFirst,
        };
        let mut plan = two_step(Uuid::new_v4());
        assert!(plan.finish_head(StepResult::Failed, &target).is_empty());
        assert_eq!(plan.head().unwrap().channel, Channel::Telegram);
    }

    #[test]
    fn test_both_sends_every_step() {
        let target = MessengerTarget::Universal {
            order: UniversalOrder::Both,
        };
        let mut plan = two_step(Uuid::new_v4());
        assert!(plan.finish_head(StepResult::Sent, &target).is_empty());
        assert_eq!(plan.head().unwrap().channel, Channel::Telegram);
    }

    #[test]
    fn test_retry_holds_head() {
        let now = Utc::now();
        let mut plan = two_step(Uuid::new_v4());
        plan.in_flight = true;
        assert!(!plan.is_ready(now));

        let later = now + Duration::minutes(1);
        plan.finish_head(StepResult::Retry(Some(later)), &MessengerTarget::WhatsappOnly);
        assert!(!plan.is_ready(now));
        assert!(plan.is_ready(later));
        assert_eq!(plan.head().unwrap().step, 0);
    }

    #[test]
    fn test_group_pending_keeps_order() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let plans = group_pending(vec![
            message(a, 1, Channel::Telegram),
            message(b, 0, Channel::Whatsapp),
            message(a, 0, Channel::Whatsapp),
        ]);
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].client_id, a);
        assert_eq!(plans[0].head().unwrap().step, 0);
        assert_eq!(plans[1].client_id, b);
    }
}
