//! Keeping reads and writes working when the remote provider is not.

pub mod fallback;
pub mod health;
pub mod local_store;
pub mod retry;
