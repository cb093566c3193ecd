//! Resource system properties and id validation.
//!
//! Resources are opaque JSON documents to the sync core. Only the system
//! properties assigned by the server are ever inspected.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Ids must be strictly shorter than this many characters.
pub const MAX_ID_LENGTH: usize = 255;

const RESERVED_ID_CHARACTERS: [char; 3] = ['/', '?', '#'];

/// Server-assigned properties carried by every resource body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemProperties {
    /// Client-assigned id.
    #[serde(default)]
    pub id: String,
    /// Server-assigned resource id.
    #[serde(rename = "_rid", default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    /// Server path of the resource.
    #[serde(rename = "_self", default, skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
    /// Version tag used for optimistic concurrency.
    #[serde(rename = "_etag", default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl SystemProperties {
    /// Read the system properties out of a serialized resource.
    pub fn from_bytes(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(Error::from)
    }

    /// Server path with surrounding slashes removed, if present and non-empty.
    pub fn server_path(&self) -> Option<&str> {
        self.self_link
            .as_deref()
            .map(|link| link.trim_matches('/'))
            .filter(|link| !link.is_empty())
    }

    /// Non-empty version tag.
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref().filter(|etag| !etag.is_empty())
    }
}

/// Check that a client-assigned id can be used in a resource path.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidId("id cannot be empty".to_string()));
    }
    if id.chars().count() >= MAX_ID_LENGTH {
        return Err(Error::InvalidId(format!(
            "id must be shorter than {} characters",
            MAX_ID_LENGTH
        )));
    }
    if id
        .chars()
        .any(|c| c.is_whitespace() || RESERVED_ID_CHARACTERS.contains(&c))
    {
        return Err(Error::InvalidId(format!(
            "id '{}' contains whitespace or a reserved character",
            id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_system_properties_from_bytes() {
        let body = br#"{"id":"Foo","_rid":"AAAA","_self":"dbs/AAAA/","_etag":"\"0001\"","extra":1}"#;
        let props = SystemProperties::from_bytes(body).unwrap();
        assert_eq!(props.id, "Foo");
        assert_eq!(props.resource_id.as_deref(), Some("AAAA"));
        assert_eq!(props.server_path(), Some("dbs/AAAA"));
        assert_eq!(props.etag(), Some("\"0001\""));
    }

    #[test]
    fn test_system_properties_missing_fields() {
        let props = SystemProperties::from_bytes(br#"{"id":"Foo","_etag":""}"#).unwrap();
        assert_eq!(props.server_path(), None);
        assert_eq!(props.etag(), None);
        assert!(SystemProperties::from_bytes(b"not json").is_err());
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("MyDocument-1").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("has space").is_err());
        assert!(validate_id("tab\there").is_err());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id("a?b").is_err());
        assert!(validate_id("a#b").is_err());
        assert!(validate_id(&"x".repeat(MAX_ID_LENGTH)).is_err());
        assert!(validate_id(&"x".repeat(MAX_ID_LENGTH - 1)).is_ok());
    }

    proptest! {
        #[test]
        fn prop_alphanumeric_ids_are_valid(id in "[A-Za-z0-9_-]{1,200}") {
            prop_assert!(validate_id(&id).is_ok());
        }

        #[test]
        fn prop_ids_with_whitespace_are_invalid(prefix in "[a-z]{0,10}", suffix in "[a-z]{0,10}") {
            let id = format!("{} {}", prefix, suffix);
            prop_assert!(validate_id(&id).is_err());
        }
    }
}
