//! Results returned to callers of the sync client.

use serde_json::Value;

use offsync_common::{Result, SystemProperties};

/// HTTP-style status of a created resource.
pub const STATUS_CREATED: u16 = 201;
/// HTTP-style status of a read or replaced resource.
pub const STATUS_OK: u16 = 200;
/// HTTP-style status of a deleted resource.
pub const STATUS_NO_CONTENT: u16 = 204;

/// Outcome of a single-resource operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Serialized resource; empty for deletes.
    pub body: Vec<u8>,
    /// Status the operation reports.
    pub status: u16,
    /// Whether the result was produced locally rather than by the server.
    pub from_cache: bool,
}

impl Response {
    pub(crate) fn local(body: Vec<u8>, status: u16) -> Self {
        Self {
            body,
            status,
            from_cache: true,
        }
    }

    pub(crate) fn remote(body: Vec<u8>, status: u16) -> Self {
        Self {
            body,
            status,
            from_cache: false,
        }
    }

    /// Body as JSON.
    pub fn json(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// System properties of the returned resource.
    pub fn properties(&self) -> Result<SystemProperties> {
        SystemProperties::from_bytes(&self.body)
    }
}

/// Outcome of a feed listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListResponse {
    pub items: Vec<Vec<u8>>,
    pub from_cache: bool,
}
