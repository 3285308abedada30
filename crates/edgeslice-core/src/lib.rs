//! Edgeslice Core - resource model for the slice reservation controllers
//!
//! This crate provides:
//! - The `Resource` trait and the Slice / SliceClaim / SubNamespace kinds
//! - Exact quantity arithmetic over Kubernetes quantity strings
//! - The node label protocol and selector grammar
//! - Error types with miette diagnostics

pub mod error;
pub mod events;
pub mod labels;
pub mod quantity;
pub mod resources;
pub mod selector;
pub mod types;

// Re-export commonly used types
pub use error::{EdgesliceError, Result};
pub use events::{ResourceEvent, WatchEventType};
pub use labels::NodeLabelState;
pub use quantity::{ParsedQuantity, ResourceTotals};
pub use resources::{
    controller_of, is_valid_name, object_reference, owner_reference, Resource, ResourceError,
    Slice, SliceClaim, SliceClaimSpec, SliceClaimState, SliceClaimStatus, SliceNodeSelector,
    SliceSpec, SliceState, SliceStatus, SubNamespace, SubNamespaceSpec, SubNamespaceStatus,
};
pub use selector::{Requirement, Selector, SelectorOperator, TermSelectors};
pub use types::{queue_key, split_queue_key, GroupVersionKind, ResourceKey};

// Re-export k8s-openapi types for convenience
pub use k8s_openapi;
pub use k8s_openapi::api::core::v1::{Event, Namespace, Node, Pod, ResourceQuota};
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
