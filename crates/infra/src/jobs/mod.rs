//! Integration job execution.
//!
//! ## Components
//!
//! - `JobOrchestrator`: admission, status bookkeeping, processing, outcome
//! - `FeedProcessor`: the collaborator doing the actual feed work
//! - `SlotLease`: guaranteed slot/heartbeat release for one execution
//! - `JobOutcome`: what the queue consumer should do next

pub mod executor;
pub mod lease;
pub mod types;

pub use executor::{FeedProcessor, JobOrchestrator, OrchestratorError};
pub use lease::SlotLease;
pub use types::{ExecutionContext, FailureReport, JobOutcome, ProcessingResult};
