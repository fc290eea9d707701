//! Provider adapters behind the [`RecordStore`](traits::RecordStore) contract.
//!
//! - [`redis`]: push-capable remote provider (pub/sub change feed)
//! - [`sql`]: poll-only remote provider over MySQL or SQLite
//! - [`memory`]: in-process provider with a configurable capability profile
//! - [`local`]: the durable local store exposed as the terminal fallback

pub mod local;
pub mod memory;
pub mod redis;
pub mod sql;
pub mod traits;
