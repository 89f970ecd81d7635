//! Background workers.

pub mod maintenance;

pub use maintenance::{MaintenanceHandle, MaintenanceReport, MaintenanceWorker};
