pub mod config;
pub mod error;
pub mod idempotency;
pub mod observability;
