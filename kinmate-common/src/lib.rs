//! # Kinmate Common Library
//!
//! Shared code for the Kinmate companion services:
//! - Shared key/value/list/stream store contract and backends
//! - Store key layout
//! - Event types (CompanionEvent) and EventBus
//! - Configuration loading
//! - Error and time utilities

pub mod config;
pub mod error;
pub mod events;
pub mod keys;
pub mod sse;
pub mod store;
pub mod time;

pub use error::{Error, Result};
pub use store::{Store, StreamEntry};
