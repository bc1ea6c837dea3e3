//! Interfaces to the profile workers that perform network sends

use async_trait::async_trait;
use courier_common::types::{Availability, CampaignId, Channel, MessageId, ProfileId};
use courier_storage::TemplateItem;
use serde::{Deserialize, Serialize};

/// Typing simulation parameters passed through to the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingSimulation {
    /// Characters per minute
    pub speed_cpm: u32,
}

/// One executor call: a single payload item to one contact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    pub message_id: MessageId,
    pub campaign_id: CampaignId,
    pub profile_id: ProfileId,
    pub channel: Channel,
    pub contact: String,
    pub item: TemplateItem,
    pub item_index: usize,
    pub item_count: usize,
    pub typing: Option<TypingSimulation>,
}

/// Why a profile is considered broken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticalCause {
    /// Session was logged out and needs operator action
    LoginRequired,
    /// Account restricted or banned by the messenger
    Blocked,
    /// Worker lost its session or browser
    SessionLost,
}

impl std::fmt::Display for CriticalCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CriticalCause::LoginRequired => write!(f, "login_required"),
            CriticalCause::Blocked => write!(f, "blocked"),
            CriticalCause::SessionLost => write!(f, "session_lost"),
        }
    }
}

/// Classified result of a send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    TransientFailure,
    PermanentFailure,
    CriticalFailure(CriticalCause),
}

impl SendOutcome {
    /// Label used for metrics and logs
    pub fn label(&self) -> &'static str {
        match self {
            SendOutcome::Sent => "sent",
            SendOutcome::TransientFailure => "transient",
            SendOutcome::PermanentFailure => "permanent",
            SendOutcome::CriticalFailure(_) => "critical",
        }
    }
}

/// Executor response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub outcome: SendOutcome,
    pub detail: Option<String>,
}

impl SendResult {
    pub fn sent() -> Self {
        Self {
            outcome: SendOutcome::Sent,
            detail: None,
        }
    }

    pub fn failed(outcome: SendOutcome, detail: impl Into<String>) -> Self {
        Self {
            outcome,
            detail: Some(detail.into()),
        }
    }
}

/// Performs the network send for one payload item.
///
/// Called at most once per message attempt and item, and never
/// concurrently for the same profile.
#[async_trait]
pub trait SendExecutor: Send + Sync {
    async fn send(&self, request: SendRequest) -> SendResult;
}

/// Reports a profile's availability
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check_profile_health(&self, profile_id: ProfileId) -> Availability;
}
