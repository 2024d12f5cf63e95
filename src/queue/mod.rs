//! Durable local queue of draft records awaiting remote acceptance.
//!
//! Drafts are written here whenever the remote system of record cannot be
//! reached, and drained by the sync engine once connectivity returns.
//! The payload is opaque to the queue: any serde type can be stored, and
//! the engine reads drafts back as raw JSON.

mod record;
mod schema;
mod store;

pub use record::{generate_id, DraftRecord, Payload};
pub use store::{QueueStorage, SqliteQueueStore};
