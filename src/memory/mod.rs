//! In-process backends for embedding the engine in one process and for tests.
//!
//! Same contracts as the Postgres backend: late acknowledgement with
//! visibility timeouts, delayed delivery, atomic transitions, record expiry
//! and a TTL lease.

pub mod broker;
pub mod store;

pub use broker::{MemoryBroker, QueueDepth};
pub use store::MemoryStore;
