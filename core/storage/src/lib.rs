//! Durable persistence for offsync.
//!
//! This module provides a trait-based interface for the blob stores backing
//! the link oracle, the local resource cache and the pending-write queue,
//! plus a registry for resolving a backend by name and configuration.
//!
//! # Design Principles
//! - Backend isolation: no backend-specific logic in the sync core
//! - Async operations: all I/O operations are async
//! - Path-like keys: every blob lives under a `StorePath`
//! - Unified error semantics: missing keys are always `Error::NotFound`

pub mod local;
pub mod memory;
pub mod registry;
pub mod store;

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use registry::{create_default_registry, StoreFactory, StoreRegistry};
pub use store::{BlobStore, Entry, SharedStore};
