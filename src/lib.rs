//! # Beehive
//!
//! A distributed, priority-aware job scheduler for Rust. Producers submit jobs
//! to named queues; bees pull them, execute user workers and report results
//! back to every holder of a job handle, on any hive sharing the same
//! coordination store.
//!
//! ## Features
//!
//! - **Priorities**: strictly higher priority first, FIFO within a priority
//! - **Deduplication**: identical jobs run once; duplicates mirror the original's outcome
//! - **Delayed jobs**: run no earlier than a given delay after submission
//! - **Retries with backoff**: fixed or progressive retry delays, permanent errors
//! - **Dependencies**: gate a job on other jobs, by jid or by tags
//! - **Tags and search**: find jobs by the intersection of their tags
//! - **Cancellation**: immediate for waiting jobs, cooperative for running ones,
//!   cascading to sub-jobs
//! - **Crash recovery**: leases lapse when a bee dies and the job is redelivered
//! - **Async/await**: built on Tokio
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use beehive::{BeeSpec, Hive, HiveConfig, JobRequest, MemoryStore, WorkerError, worker::handler};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> beehive::Result<()> {
//!     let hive = Hive::new(Arc::new(MemoryStore::new()), HiveConfig::default())?;
//!
//!     hive.bee(
//!         "sum",
//!         BeeSpec::new(handler(|job, _| async move {
//!             let a: i64 = job.arg(0)?;
//!             let b: i64 = job.arg(1)?;
//!             if a < 0 || b < 0 {
//!                 return Err(WorkerError::permanent("Argument must be positive"));
//!             }
//!             Ok(json!(a + b))
//!         }))
//!         .with_concurrency(4),
//!     )
//!     .await?;
//!
//!     let job = hive.submit(JobRequest::new("sum").args([2, 3])).await?;
//!     assert_eq!(job.result().await?, json!(5));
//!
//!     hive.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Core Concepts
//!
//! ### Jobs
//!
//! A job has a time-ordered [`Jid`], a queue, an argument list, options
//! ([`JobOptions`]), a status and an append-only history. Submitting returns a
//! [`JobHandle`] whose [`result`](JobHandle::result) settles once the job
//! completes, fails, is canceled or expires.
//!
//! ### Bees
//!
//! A [`Bee`] serves one queue in one process. It leases jobs up to its
//! concurrency, fingerprints them for deduplication, runs the worker under a
//! timeout and commits the outcome. Its heartbeat keeps its leases alive; its
//! expiry sweep redelivers jobs whose lease lapsed.
//!
//! ### The engine
//!
//! All shared state lives in a [`CoordinationStore`] and only changes through
//! the atomic scripts of the [`engine`]. [`MemoryStore`] is the in-process
//! store; any backend that can run the scripts atomically can stand in.
//!
//! ## Delivery guarantees
//!
//! Delivery is at-least-once. A job whose bee dies is redelivered once its
//! lease lapses, and a timed-out worker keeps running; make workers idempotent
//! or rely on hash-based deduplication.

pub mod bee;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod handle;
pub mod hive;
pub mod job;
pub mod retry;
pub mod store;
pub mod worker;

pub use bee::{Bee, BeeSpec, HashMode};
pub use client::StoreClient;
pub use config::{BeeDefaults, HiveConfig, JobDefaults};
pub use dispatcher::{Dispatcher, JobRequest, SubmitOptions};
pub use error::{BeehiveError, JobFailure};
pub use events::QueueEvent;
pub use handle::{JobHandle, ProgressStream};
pub use hive::Hive;
pub use job::{
    DuplicateInfo, HistoryEntry, HistoryEvent, Jid, JobHash, JobOptions, JobRecord, JobStatus,
    Outcome,
};
pub use retry::WorkerError;
pub use store::{CoordinationStore, MemoryStore, MockClock};
pub use worker::{Handler, HashFn, WorkerJob};

pub type Result<T> = std::result::Result<T, BeehiveError>;
