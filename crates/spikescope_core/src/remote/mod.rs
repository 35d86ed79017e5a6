//! Remote GPU execution.
//!
//! When a worker URL is configured, sorting runs ship the recording to an
//! external GPU service through shared object storage; otherwise sorting
//! runs in-process and this module stays unused.

mod client;
mod storage;

pub use client::RemoteExecutionClient;
pub use storage::{LocalDirStore, ObjectStore};
