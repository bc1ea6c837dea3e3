//! Courier Common - Shared types, settings and configuration
//!
//! This crate provides the value types, operator settings, configuration
//! and error type shared across all Courier components.

pub mod config;
pub mod error;
pub mod settings;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use settings::{GlobalSettings, UserCampaignLimits, VersionedSettings};
