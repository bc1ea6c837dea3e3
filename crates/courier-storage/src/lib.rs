//! Courier Storage - persistence for the dispatch engine
//!
//! Repository traits with a PostgreSQL implementation and an in-memory
//! store used by tests and single-process deployments.

pub mod db;
pub mod memory;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use memory::MemoryStore;
pub use models::*;
pub use repository::*;
