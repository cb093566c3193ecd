//! Pending write intents and the coalescing table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use offsync_common::{Error, Headers, ResourceAddress, Result};

/// Type of a write operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteKind {
    /// New resource.
    Create,
    /// Existing resource replaced with a new body.
    Replace,
    /// Resource (and its subtree) removed.
    Delete,
}

impl fmt::Display for WriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriteKind::Create => "create",
            WriteKind::Replace => "replace",
            WriteKind::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// A write performed locally that still has to be replayed to the server.
///
/// Two writes with the same `local_cache_path` are the same intent and are
/// merged by [`coalesce`], never queued twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    /// Operation to replay.
    pub kind: WriteKind,
    /// Serialized resource; `None` for deletes.
    #[serde(with = "payload_base64", default)]
    pub payload: Option<Vec<u8>>,
    /// Item address of the target resource.
    pub address: ResourceAddress,
    /// Cache location of the target resource (its server path). Coalescing key.
    pub local_cache_path: String,
    /// Extra request headers to send on replay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_headers: Option<Headers>,
    /// When the intent was first queued.
    pub enqueued_at: DateTime<Utc>,
}

impl PendingWrite {
    /// Create a new pending write stamped with the current time.
    pub fn new(
        kind: WriteKind,
        payload: Option<Vec<u8>>,
        address: ResourceAddress,
        local_cache_path: impl Into<String>,
        extra_headers: Option<Headers>,
    ) -> Self {
        Self {
            kind,
            payload,
            address,
            local_cache_path: local_cache_path.into(),
            extra_headers,
            enqueued_at: Utc::now(),
        }
    }

    /// Headers to send on replay.
    pub fn headers(&self) -> Headers {
        self.extra_headers.clone().unwrap_or_default()
    }

    /// Whether this write targets `path` itself or something below it.
    pub fn is_within(&self, path: &str) -> bool {
        self.local_cache_path == path
            || self
                .local_cache_path
                .strip_prefix(path)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

/// Outcome of merging a new intent into an existing pending entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Coalesced {
    /// The entry becomes this write.
    Replace(PendingWrite),
    /// The entry is dropped; nothing needs to reach the server.
    Remove,
    /// The existing entry stays unchanged.
    KeepExisting,
}

/// Merge `new` into `existing`, both targeting the same local cache path.
///
/// # Errors
/// - `Conflict` for create after create, create after replace, and any
///   create or replace after a delete
pub fn coalesce(existing: &PendingWrite, new: PendingWrite) -> Result<Coalesced> {
    use WriteKind::*;

    match (existing.kind, new.kind) {
        // The server never saw the first body.
        (Create, Replace) => Ok(Coalesced::Replace(PendingWrite {
            kind: Create,
            payload: new.payload,
            address: existing.address.clone(),
            local_cache_path: existing.local_cache_path.clone(),
            extra_headers: existing.extra_headers.clone(),
            enqueued_at: existing.enqueued_at,
        })),
        (Create, Delete) => Ok(Coalesced::Remove),
        (Replace, Delete) | (Replace, Replace) => Ok(Coalesced::Replace(PendingWrite {
            enqueued_at: existing.enqueued_at,
            ..new
        })),
        (Delete, Delete) => Ok(Coalesced::KeepExisting),
        (existing_kind, new_kind) => Err(Error::Conflict(format!(
            "Cannot {} {}: a pending {} targets the same resource",
            new_kind, new.address, existing_kind
        ))),
    }
}

mod payload_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match payload {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn write(kind: WriteKind, body: &str) -> PendingWrite {
        let payload = (kind != WriteKind::Delete).then(|| body.as_bytes().to_vec());
        PendingWrite::new(
            kind,
            payload,
            ResourceAddress::document("d", "c", "x"),
            "dbs/A/colls/B/docs/C",
            None,
        )
    }

    #[test]
    fn test_create_then_replace_stays_create_with_new_body() {
        let existing = write(WriteKind::Create, "v1");
        match coalesce(&existing, write(WriteKind::Replace, "v2")).unwrap() {
            Coalesced::Replace(merged) => {
                assert_eq!(merged.kind, WriteKind::Create);
                assert_eq!(merged.payload.as_deref(), Some(&b"v2"[..]));
                assert_eq!(merged.enqueued_at, existing.enqueued_at);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_create_then_delete_cancels() {
        let outcome = coalesce(&write(WriteKind::Create, "v1"), write(WriteKind::Delete, "")).unwrap();
        assert_eq!(outcome, Coalesced::Remove);
    }

    #[test]
    fn test_replace_then_delete_becomes_delete() {
        match coalesce(&write(WriteKind::Replace, "v1"), write(WriteKind::Delete, "")).unwrap() {
            Coalesced::Replace(merged) => {
                assert_eq!(merged.kind, WriteKind::Delete);
                assert_eq!(merged.payload, None);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_replace_then_replace_takes_new_body() {
        match coalesce(&write(WriteKind::Replace, "v1"), write(WriteKind::Replace, "v2")).unwrap() {
            Coalesced::Replace(merged) => {
                assert_eq!(merged.kind, WriteKind::Replace);
                assert_eq!(merged.payload.as_deref(), Some(&b"v2"[..]));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_delete_then_delete_keeps_existing() {
        let outcome = coalesce(&write(WriteKind::Delete, ""), write(WriteKind::Delete, "")).unwrap();
        assert_eq!(outcome, Coalesced::KeepExisting);
    }

    #[test]
    fn test_collisions_are_conflicts() {
        for (existing, new) in [
            (WriteKind::Create, WriteKind::Create),
            (WriteKind::Replace, WriteKind::Create),
            (WriteKind::Delete, WriteKind::Create),
            (WriteKind::Delete, WriteKind::Replace),
        ] {
            let result = coalesce(&write(existing, "a"), write(new, "b"));
            assert!(matches!(result, Err(Error::Conflict(_))), "{existing} then {new}");
        }
    }

    #[test]
    fn test_payload_persists_as_base64() {
        let original = write(WriteKind::Create, "{\"id\":\"x\"}");
        let json = serde_json::to_value(&original).unwrap();
        assert_eq!(json["payload"], "eyJpZCI6IngifQ==");

        let restored: PendingWrite = serde_json::from_value(json).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn test_is_within_respects_segment_boundaries() {
        let w = write(WriteKind::Replace, "v");
        assert!(w.is_within("dbs/A/colls/B"));
        assert!(w.is_within("dbs/A/colls/B/docs/C"));
        assert!(!w.is_within("dbs/A/colls/BB"));
    }

    /// Queue entry for one resource plus whether its server path is known.
    #[derive(Clone)]
    struct Model {
        entry: Option<PendingWrite>,
        known: bool,
    }

    // Mirrors the local checks that run before coalescing: creates need an
    // unknown path, replaces and deletes a known one.
    fn apply(model: Model, new: PendingWrite) -> Model {
        let admissible = match new.kind {
            WriteKind::Create => !model.known,
            WriteKind::Replace | WriteKind::Delete => model.known,
        };
        if !admissible {
            return model;
        }
        match model.entry {
            None => Model {
                entry: Some(new),
                known: true,
            },
            Some(existing) => match coalesce(&existing, new) {
                Ok(Coalesced::Replace(merged)) => Model {
                    entry: Some(merged),
                    known: true,
                },
                Ok(Coalesced::Remove) => Model {
                    entry: None,
                    known: false,
                },
                Ok(Coalesced::KeepExisting) | Err(_) => Model {
                    entry: Some(existing),
                    known: model.known,
                },
            },
        }
    }

    fn arb_kind() -> impl Strategy<Value = WriteKind> {
        prop_oneof![
            Just(WriteKind::Create),
            Just(WriteKind::Replace),
            Just(WriteKind::Delete)
        ]
    }

    proptest! {
        // Repeating the last operation never changes the resulting entry.
        #[test]
        fn prop_coalescing_is_idempotent(
            known in any::<bool>(),
            kinds in proptest::collection::vec(arb_kind(), 1..12),
            repeats in 1usize..5,
        ) {
            let mut model = Model { entry: None, known };
            for (i, kind) in kinds.iter().enumerate() {
                model = apply(model, write(*kind, &format!("v{}", i)));
            }
            let last = *kinds.last().unwrap();
            let once = model.entry.clone();

            let mut repeated = model;
            for _ in 0..repeats {
                repeated = apply(repeated, write(last, &format!("v{}", kinds.len() - 1)));
            }

            prop_assert_eq!(
                repeated.entry.as_ref().map(|w| (w.kind, w.payload.clone())),
                once.as_ref().map(|w| (w.kind, w.payload.clone()))
            );
        }

        // A replace sequence ending in delete always queues a delete.
        #[test]
        fn prop_replaces_then_delete_is_delete(count in 1usize..8) {
            let mut model = Model { entry: None, known: true };
            for i in 0..count {
                model = apply(model, write(WriteKind::Replace, &format!("v{}", i)));
            }
            model = apply(model, write(WriteKind::Delete, ""));
            prop_assert_eq!(model.entry.map(|w| w.kind), Some(WriteKind::Delete));
        }
    }
}
