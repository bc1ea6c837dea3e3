//! Pacing: per-profile caps, warmup and inter-send spacing

mod delay;
mod governor;
mod warmup;

pub use delay::DelayRange;
pub use governor::{Acquire, PacingGovernor, PacingLimits, Permit};
pub use warmup::{CampaignRamp, WarmupPolicy};
