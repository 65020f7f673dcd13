//! Infrastructure transports.
//!
//! The bus/queue abstractions live in `stockflow-events` as pure mechanics.
//! This module provides infrastructure-backed implementations.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsError, RedisStreamsSettings, RedisStreamsTransport};
