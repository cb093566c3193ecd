//! Common utilities and types shared across offsync modules.
//!
//! This module provides the foundational types used by the storage backends,
//! the link oracle and the pending-write queue: the error type, store keys,
//! and the tagged resource address model.

pub mod address;
pub mod error;
pub mod resource;
pub mod types;

pub use address::{LinkPair, ResourceAddress, ResourceKind};
pub use error::{Error, Result};
pub use resource::{validate_id, SystemProperties, MAX_ID_LENGTH};
pub use types::{Headers, StorePath, IF_MATCH};
