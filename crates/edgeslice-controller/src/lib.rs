//! Edgeslice Controller - slice reservation and claim reconcilers
//!
//! This crate provides:
//! - A delayed, rate-limited work queue and the worker-pool driver
//! - Watch routing from store events to queue keys
//! - Candidate filters and random node selection
//! - The Slice and SliceClaim reconcilers
//! - An event recorder writing core/v1 Events, and a pruner expiring them

pub mod clients;
pub mod driver;
pub mod error;
pub mod queue;
pub mod recorder;
pub mod selection;
pub mod slice;
pub mod sliceclaim;

#[cfg(test)]
mod testutil;

// Re-export commonly used types
pub use clients::Clients;
pub use driver::{Driver, DriverConfig, Reconciler, WatchRouter};
pub use error::{ControllerError, Result};
pub use queue::{QueueConfig, WorkQueue};
pub use recorder::{EventPruner, EventPrunerConfig, EventRecorder, EventType};
pub use slice::{SliceReconciler, SliceReconcilerConfig};
pub use sliceclaim::{ProvisioningMode, SliceClaimReconciler, SliceClaimReconcilerConfig};
