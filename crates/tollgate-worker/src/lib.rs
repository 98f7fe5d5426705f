//! Asynchronous worker framework and dead-letter pipeline for Tollgate.
//!
//! Workers consume one topic each. The [`WorkerRunner`] bounds concurrency,
//! isolates every job in its own task, requeues transient failures with their
//! failure history in message attributes, and hands exhausted jobs to the
//! dead-letter topic where the [`DeadLetterHandler`] records and alerts.
//!
//! # Main types
//!
//! - [`Worker`] — Trait implemented by job processors.
//! - [`WorkerRunner`] — Poll loop with bounded concurrency and retry routing.
//! - [`JobEnvelope`] — Envelope every job travels in.
//! - [`RetryPolicy`] — How many failures a job may accumulate.
//! - [`CircuitBreakers`] — Per-circuit breakers that suspend pulling.
//! - [`SlidingWindowCounter`] — Per-key event counter over a trailing window.
//! - [`DeadLetterHandler`] — Dead-letter recording, alerting, and triage.

/// Per-circuit failure breakers.
pub mod circuit;
/// Dead-letter handler, records, and alerts.
pub mod dead_letter;
/// Job envelopes and failure context.
pub mod job;
/// Retry policy.
pub mod retry;
/// Worker poll loop.
pub mod runner;
/// Sliding-window counter.
pub mod window;
/// Worker trait and configuration.
pub mod worker;

pub use circuit::{CircuitBreakers, CircuitState};
pub use dead_letter::{Alert, DeadLetterConfig, DeadLetterHandler, DeadLetterRecord, DeadLetterStatus};
pub use job::{DeadLetterEnvelope, FailureContext, JobEnvelope, JobMessage};
pub use retry::RetryPolicy;
pub use runner::{JobDisposition, PollReport, WorkerHandle, WorkerRunner};
pub use window::SlidingWindowCounter;
pub use worker::{ProcessOutcome, Worker, WorkerConfig};
