//! Edgeslice Store - object storage for the slice controllers
//!
//! This crate provides:
//! - KVStore trait for storage abstraction
//! - redb-based implementation
//! - A typed resource store with a watch event bus
//! - The per-kind ResourceGateway trait the reconcilers program against

pub mod encoding;
pub mod error;
pub mod gateway;
pub mod kv;
pub mod redb_backend;
pub mod store;

// Re-export commonly used types
pub use encoding::KeyEncoder;
pub use error::{Result, StorageError};
pub use gateway::{DeleteParams, ResourceGateway, StoreGateway};
pub use kv::{KVStore, Transaction};
pub use redb_backend::RedbBackend;
pub use store::{EventBusConfig, ListParams, ResourceStore};
