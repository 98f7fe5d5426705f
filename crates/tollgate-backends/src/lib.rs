//! Concrete backends for the Tollgate ports.
//!
//! # Main types
//!
//! - [`MemoryDocumentStore`] — HashMap-backed document store for tests and single-process runs.
//! - [`FileDocumentStore`] — One JSON file per document on local disk.
//! - [`MemoryQueue`] — In-process FIFO topics.
//! - [`FileQueue`] — One JSON file per message on local disk.
//! - [`ProcessSandbox`] — Runs code in a local subprocess with a hard timeout.

/// File-backed message queue.
pub mod file_queue;
/// File-backed document store.
pub mod file_store;
/// In-memory message queue.
pub mod memory_queue;
/// In-memory document store.
pub mod memory_store;
/// Local-process sandbox.
pub mod process_sandbox;

pub use file_queue::FileQueue;
pub use file_store::FileDocumentStore;
pub use memory_queue::MemoryQueue;
pub use memory_store::MemoryDocumentStore;
pub use process_sandbox::ProcessSandbox;
