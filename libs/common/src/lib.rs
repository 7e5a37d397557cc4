//! Shared base library for the gateway services.
//!
//! Provides the pieces every binary needs:
//! - error type and `Result` alias
//! - tracing/logging setup (stdout or file)
//! - async Redis client used for the device settings cache
//! - hex formatting helpers for raw packet logging

pub mod error;
pub mod hex;
pub mod logging;
pub mod redis;

pub use error::{Error, Result};
pub use redis::RedisClient;

// Re-export common dependencies so downstream crates agree on versions
pub use anyhow;
pub use serde;
pub use serde_json;
pub use tokio;
