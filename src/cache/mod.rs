//! Request caching at the network edge.
//!
//! Every outgoing request is classified into a strategy:
//! - app shell and static documents are served cache-first from the
//!   versioned static generation
//! - pages are fetched network-first, with successful HTML kept in the
//!   dynamic generation for offline use
//! - excluded file types always go to the network
//! - non-GET and API requests pass through untouched
//!
//! A new cache version installs its shell atomically and, on activation,
//! purges every older generation.

mod fetch;
mod router;
mod storage;
mod traits;

pub use fetch::HttpFetcher;
pub use router::{CacheStrategyRouter, CacheVersion, Route, RouteRules};
pub use storage::{CacheStorage, CachedResponse, MemoryCacheStorage, SqliteCacheStorage};
pub use traits::{
  Fetcher, RedirectMode, Request, RequestMode, Response, ResponseKind, ResponseSource, Served,
};
