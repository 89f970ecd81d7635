//! `feedsync-core`: domain building blocks for feed integration jobs.
//!
//! This crate contains **pure domain** types (no infrastructure concerns): the
//! durable `Integration` / `QueueEntry` records, their status machines and the
//! clock abstraction used to make time-dependent rules testable.

pub mod clock;
pub mod error;
pub mod id;
pub mod integration;
pub mod queue;

pub use clock::{Clock, ManualClock, SystemClock, to_chrono};
pub use error::{DomainError, DomainResult, TransitionError};
pub use id::{IntegrationId, UserId};
pub use integration::{Integration, IntegrationStatus};
pub use queue::{FailureRecord, QueueEntry, QueueStatus, RunStamp, TransitionCheck, TransitionPolicy};
