//! Courier Core - campaign dispatch engine
//!
//! This crate turns campaigns into paced, window-gated sends across a pool
//! of messenger profiles, including settings resolution, recipient
//! eligibility, retry handling and profile health monitoring.

pub mod campaign;
pub mod clock;
pub mod dispatch;
pub mod eligibility;
pub mod engine;
pub mod executor;
pub mod health;
pub mod metrics;
pub mod notify;
pub mod pacing;
pub mod retry;
pub mod settings;
pub mod window;
pub mod worker;

#[cfg(test)]
mod testing;

pub use campaign::{CampaignError, CampaignManager, RecoveryReport, Supervisor};
pub use clock::{Clock, SystemClock, TokioClock};
pub use dispatch::{Dispatcher, RunExit, RunSignal};
pub use engine::{Engine, EngineDeps};
pub use executor::{
    CriticalCause, HealthProbe, SendExecutor, SendOutcome, SendRequest, SendResult,
    TypingSimulation,
};
pub use health::{HealthMonitor, ProfileEvent, ProfileRegistry};
pub use metrics::DispatchMetrics;
pub use notify::{spawn_relay, Notification, NotificationSink, Notifier, TelegramRelay};
pub use settings::{ConfigError, EffectivePolicy, LimitViolation};
pub use worker::HttpWorkerClient;
