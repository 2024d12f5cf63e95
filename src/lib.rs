//! Offline-durable drafts with reconciling background sync, and a
//! strategy-based HTTP cache for offline browsing.

pub mod cache;
pub mod clients;
pub mod config;
pub mod logging;
pub mod notify;
pub mod queue;
pub mod sync;
