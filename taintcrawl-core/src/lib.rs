//! # Taintcrawl Core
//!
//! Scheduling core of the taintcrawl distributed crawler. Many independent
//! worker processes coordinate exclusively through a shared Postgres
//! database: there is no coordinator process and no in-memory state shared
//! between workers.
//!
//! ## Overview
//!
//! - **Entity store**: [`store::EntityStore`] owns the pool and the row-level
//!   helpers (plain reads, `FOR UPDATE`, `FOR UPDATE SKIP LOCKED`) every
//!   transaction in this crate is built from.
//! - **Discovery**: [`discovery::SubjectFactory`] admits seeds and discovered
//!   links as urls and subjects, applying per-session deduplication and the
//!   per-domain url cap. [`discovery::links::LinkCollector`] filters the
//!   hrefs found on a page before admitting them.
//! - **Scheduling**: [`scheduler::Scheduler`] reserves work for a worker
//!   through an affinity cascade (same url, same domain, unclaimed) while
//!   lazily expiring sessions and domains that ran out of time.
//! - **Local queue**: [`queue::LocalTaskQueue`] buffers reserved tasks per
//!   worker.
//! - **Completion**: [`completion::CompletionPropagator`] reports subjects
//!   as VISITED or SKIP, completes urls bottom-up and schedules
//!   capture-after-visit work.
//! - **Lifecycle**: [`lifecycle::WorkerLifecycle`] registers workers and
//!   recovers their in-flight work on deregistration.
//! - **Runtime**: [`runtime::CrawlWorker`] ties the above into the worker
//!   loop around a [`runtime::executor::SubjectExecutor`].
//!
//! ## Database
//!
//! The schema ships with the crate; apply it with [`MIGRATOR`] (or
//! [`store::EntityStore::migrate`]) before constructing an
//! [`store::EntityStore`].
#![allow(missing_docs)]

pub mod completion;
pub mod discovery;
pub mod error;
pub mod lifecycle;
pub mod queue;
pub mod runtime;
pub mod scheduler;
pub mod store;

/// Embedded schema migrations.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub use completion::{CompletionPropagator, Settlement};
pub use discovery::links::{LinkCollector, LinkOrigin};
pub use discovery::{DiscoveryOutcome, SubjectFactory, UrlCandidate};
pub use error::{CrawlError, Result};
pub use lifecycle::{RecoveryReport, WorkerLifecycle};
pub use queue::{LocalTaskQueue, SubjectSource};
pub use runtime::executor::{CommandExecutor, ExecutionReport, SubjectExecutor};
pub use runtime::{CrawlWorker, ExitReason, WorkerExit};
pub use scheduler::{AffinityHints, Scheduler};
pub use store::EntityStore;

pub use taintcrawl_config as config;
pub use taintcrawl_model as model;
