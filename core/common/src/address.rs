//! Resource addressing.
//!
//! Every resource lives in a variable-depth tree (database → collection →
//! document → attachment, database → user → permission, plus top-level
//! offers). A resource has two paths with identical shape:
//!
//! - the **client path**, built from ids chosen by the client
//!   (`dbs/MyDb/colls/MyColl`), known before the server ever sees the resource;
//! - the **server path**, built from server-assigned resource ids
//!   (`dbs/AAAA/colls/AAAAAB`), known only once the resource was created or fetched.
//!
//! Both alternate kind segments and id segments, so they always have the same
//! number of components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of a resource in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceKind {
    Database,
    User,
    Permission,
    Collection,
    StoredProcedure,
    Trigger,
    Function,
    Document,
    Attachment,
    Offer,
}

impl ResourceKind {
    /// Every kind, in declaration order.
    pub const ALL: [ResourceKind; 10] = [
        ResourceKind::Database,
        ResourceKind::User,
        ResourceKind::Permission,
        ResourceKind::Collection,
        ResourceKind::StoredProcedure,
        ResourceKind::Trigger,
        ResourceKind::Function,
        ResourceKind::Document,
        ResourceKind::Attachment,
        ResourceKind::Offer,
    ];

    /// Path segment naming a feed of this kind.
    pub fn segment(self) -> &'static str {
        match self {
            ResourceKind::Database => "dbs",
            ResourceKind::User => "users",
            ResourceKind::Permission => "permissions",
            ResourceKind::Collection => "colls",
            ResourceKind::StoredProcedure => "sprocs",
            ResourceKind::Trigger => "triggers",
            ResourceKind::Function => "udfs",
            ResourceKind::Document => "docs",
            ResourceKind::Attachment => "attachments",
            ResourceKind::Offer => "offers",
        }
    }

    /// Inverse of [`ResourceKind::segment`].
    pub fn from_segment(segment: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.segment() == segment)
    }

    /// Kinds that can live directly below a resource of this kind.
    pub fn children(self) -> &'static [ResourceKind] {
        match self {
            ResourceKind::Database => &[ResourceKind::Collection, ResourceKind::User],
            ResourceKind::User => &[ResourceKind::Permission],
            ResourceKind::Collection => &[
                ResourceKind::Document,
                ResourceKind::StoredProcedure,
                ResourceKind::Trigger,
                ResourceKind::Function,
            ],
            ResourceKind::Document => &[ResourceKind::Attachment],
            ResourceKind::Permission
            | ResourceKind::StoredProcedure
            | ResourceKind::Trigger
            | ResourceKind::Function
            | ResourceKind::Attachment
            | ResourceKind::Offer => &[],
        }
    }

    /// Kinds of the ancestors of a resource of this kind, root first.
    pub fn ancestor_kinds(self) -> &'static [ResourceKind] {
        match self {
            ResourceKind::Database | ResourceKind::Offer => &[],
            ResourceKind::User | ResourceKind::Collection => &[ResourceKind::Database],
            ResourceKind::Permission => &[ResourceKind::Database, ResourceKind::User],
            ResourceKind::StoredProcedure
            | ResourceKind::Trigger
            | ResourceKind::Function
            | ResourceKind::Document => &[ResourceKind::Database, ResourceKind::Collection],
            ResourceKind::Attachment => &[
                ResourceKind::Database,
                ResourceKind::Collection,
                ResourceKind::Document,
            ],
        }
    }

    /// Number of ancestors. Ancestors always have a strictly smaller depth.
    pub fn depth(self) -> usize {
        self.ancestor_kinds().len()
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Database => "database",
            ResourceKind::User => "user",
            ResourceKind::Permission => "permission",
            ResourceKind::Collection => "collection",
            ResourceKind::StoredProcedure => "storedProcedure",
            ResourceKind::Trigger => "trigger",
            ResourceKind::Function => "function",
            ResourceKind::Document => "document",
            ResourceKind::Attachment => "attachment",
            ResourceKind::Offer => "offer",
        };
        f.write_str(name)
    }
}

/// Location of a resource (item) or of a list of resources (feed).
///
/// A missing `id` denotes a feed address, a present one an item address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ResourceAddress {
    Database {
        id: Option<String>,
    },
    User {
        database_id: String,
        id: Option<String>,
    },
    Permission {
        database_id: String,
        user_id: String,
        id: Option<String>,
    },
    Collection {
        database_id: String,
        id: Option<String>,
    },
    StoredProcedure {
        database_id: String,
        collection_id: String,
        id: Option<String>,
    },
    Trigger {
        database_id: String,
        collection_id: String,
        id: Option<String>,
    },
    Function {
        database_id: String,
        collection_id: String,
        id: Option<String>,
    },
    Document {
        database_id: String,
        collection_id: String,
        id: Option<String>,
    },
    Attachment {
        database_id: String,
        collection_id: String,
        document_id: String,
        id: Option<String>,
    },
    Offer {
        id: Option<String>,
    },
    /// A concrete resource whose paths are already in hand.
    Resolved {
        kind: ResourceKind,
        client_path: String,
        server_path: Option<String>,
    },
}

impl ResourceAddress {
    /// Feed of all databases.
    pub fn databases() -> Self {
        ResourceAddress::Database { id: None }
    }

    /// A single database.
    pub fn database(id: impl Into<String>) -> Self {
        ResourceAddress::Database {
            id: Some(id.into()),
        }
    }

    /// Feed of the users of a database.
    pub fn users(database_id: impl Into<String>) -> Self {
        ResourceAddress::User {
            database_id: database_id.into(),
            id: None,
        }
    }

    /// Feed of the permissions of a user.
    pub fn permissions(database_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        ResourceAddress::Permission {
            database_id: database_id.into(),
            user_id: user_id.into(),
            id: None,
        }
    }

    /// Feed of the collections of a database.
    pub fn collections(database_id: impl Into<String>) -> Self {
        ResourceAddress::Collection {
            database_id: database_id.into(),
            id: None,
        }
    }

    /// A single collection.
    pub fn collection(database_id: impl Into<String>, id: impl Into<String>) -> Self {
        ResourceAddress::Collection {
            database_id: database_id.into(),
            id: Some(id.into()),
        }
    }

    /// Feed of the stored procedures of a collection.
    pub fn stored_procedures(
        database_id: impl Into<String>,
        collection_id: impl Into<String>,
    ) -> Self {
        ResourceAddress::StoredProcedure {
            database_id: database_id.into(),
            collection_id: collection_id.into(),
            id: None,
        }
    }

    /// Feed of the triggers of a collection.
    pub fn triggers(database_id: impl Into<String>, collection_id: impl Into<String>) -> Self {
        ResourceAddress::Trigger {
            database_id: database_id.into(),
            collection_id: collection_id.into(),
            id: None,
        }
    }

    /// Feed of the user-defined functions of a collection.
    pub fn functions(database_id: impl Into<String>, collection_id: impl Into<String>) -> Self {
        ResourceAddress::Function {
            database_id: database_id.into(),
            collection_id: collection_id.into(),
            id: None,
        }
    }

    /// Feed of the documents of a collection.
    pub fn documents(database_id: impl Into<String>, collection_id: impl Into<String>) -> Self {
        ResourceAddress::Document {
            database_id: database_id.into(),
            collection_id: collection_id.into(),
            id: None,
        }
    }

    /// A single document.
    pub fn document(
        database_id: impl Into<String>,
        collection_id: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        ResourceAddress::Document {
            database_id: database_id.into(),
            collection_id: collection_id.into(),
            id: Some(id.into()),
        }
    }

    /// Feed of the attachments of a document.
    pub fn attachments(
        database_id: impl Into<String>,
        collection_id: impl Into<String>,
        document_id: impl Into<String>,
    ) -> Self {
        ResourceAddress::Attachment {
            database_id: database_id.into(),
            collection_id: collection_id.into(),
            document_id: document_id.into(),
            id: None,
        }
    }

    /// Feed of all offers.
    pub fn offers() -> Self {
        ResourceAddress::Offer { id: None }
    }

    /// Address of a concrete resource whose paths are known.
    pub fn resolved(
        kind: ResourceKind,
        client_path: impl Into<String>,
        server_path: Option<String>,
    ) -> Self {
        ResourceAddress::Resolved {
            kind,
            client_path: trim_slashes(&client_path.into()).to_string(),
            server_path: server_path.map(|p| trim_slashes(&p).to_string()),
        }
    }

    /// Parse a client path (`dbs/A/colls/B` or the feed `dbs/A/colls`).
    ///
    /// Returns `None` when the segments do not describe a valid location in
    /// the resource tree.
    pub fn from_client_path(path: &str) -> Option<Self> {
        let segments = split_segments(path);
        if segments.is_empty() {
            return None;
        }

        let mut ancestors = Vec::new();
        let mut chunks = segments.chunks(2).peekable();
        while let Some(chunk) = chunks.next() {
            let kind = ResourceKind::from_segment(chunk[0])?;
            let id = chunk.get(1).map(|s| s.to_string());
            if chunks.peek().is_none() {
                let ids: Vec<String> = ancestors
                    .iter()
                    .map(|(_, id): &(ResourceKind, String)| id.clone())
                    .collect();
                let expected: Vec<ResourceKind> = ancestors.iter().map(|(k, _)| *k).collect();
                if expected.as_slice() != kind.ancestor_kinds() {
                    return None;
                }
                return Self::from_parts(kind, &ids, id);
            }
            ancestors.push((kind, id?));
        }
        None
    }

    fn from_parts(kind: ResourceKind, ancestor_ids: &[String], id: Option<String>) -> Option<Self> {
        if ancestor_ids.len() != kind.depth() {
            return None;
        }
        let a = |i: usize| ancestor_ids[i].clone();
        let address = match kind {
            ResourceKind::Database => ResourceAddress::Database { id },
            ResourceKind::Offer => ResourceAddress::Offer { id },
            ResourceKind::User => ResourceAddress::User {
                database_id: a(0),
                id,
            },
            ResourceKind::Collection => ResourceAddress::Collection {
                database_id: a(0),
                id,
            },
            ResourceKind::Permission => ResourceAddress::Permission {
                database_id: a(0),
                user_id: a(1),
                id,
            },
            ResourceKind::StoredProcedure => ResourceAddress::StoredProcedure {
                database_id: a(0),
                collection_id: a(1),
                id,
            },
            ResourceKind::Trigger => ResourceAddress::Trigger {
                database_id: a(0),
                collection_id: a(1),
                id,
            },
            ResourceKind::Function => ResourceAddress::Function {
                database_id: a(0),
                collection_id: a(1),
                id,
            },
            ResourceKind::Document => ResourceAddress::Document {
                database_id: a(0),
                collection_id: a(1),
                id,
            },
            ResourceKind::Attachment => ResourceAddress::Attachment {
                database_id: a(0),
                collection_id: a(1),
                document_id: a(2),
                id,
            },
        };
        Some(address)
    }

    /// Kind of the addressed resource (or of the feed's items).
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceAddress::Database { .. } => ResourceKind::Database,
            ResourceAddress::User { .. } => ResourceKind::User,
            ResourceAddress::Permission { .. } => ResourceKind::Permission,
            ResourceAddress::Collection { .. } => ResourceKind::Collection,
            ResourceAddress::StoredProcedure { .. } => ResourceKind::StoredProcedure,
            ResourceAddress::Trigger { .. } => ResourceKind::Trigger,
            ResourceAddress::Function { .. } => ResourceKind::Function,
            ResourceAddress::Document { .. } => ResourceKind::Document,
            ResourceAddress::Attachment { .. } => ResourceKind::Attachment,
            ResourceAddress::Offer { .. } => ResourceKind::Offer,
            ResourceAddress::Resolved { kind, .. } => *kind,
        }
    }

    /// Client-assigned id of the addressed item; `None` for feeds.
    pub fn id(&self) -> Option<&str> {
        let id = match self {
            ResourceAddress::Database { id }
            | ResourceAddress::Offer { id }
            | ResourceAddress::User { id, .. }
            | ResourceAddress::Permission { id, .. }
            | ResourceAddress::Collection { id, .. }
            | ResourceAddress::StoredProcedure { id, .. }
            | ResourceAddress::Trigger { id, .. }
            | ResourceAddress::Function { id, .. }
            | ResourceAddress::Document { id, .. }
            | ResourceAddress::Attachment { id, .. } => id.as_deref(),
            ResourceAddress::Resolved { client_path, .. } => client_path.rsplit('/').next(),
        };
        id.filter(|id| !id.is_empty())
    }

    /// Whether this address names a list of resources rather than one.
    pub fn is_feed(&self) -> bool {
        self.id().is_none()
    }

    /// Ancestor kind/id pairs, root first.
    pub fn ancestors(&self) -> Vec<(ResourceKind, String)> {
        match self {
            ResourceAddress::Database { .. } | ResourceAddress::Offer { .. } => Vec::new(),
            ResourceAddress::User { database_id, .. }
            | ResourceAddress::Collection { database_id, .. } => {
                vec![(ResourceKind::Database, database_id.clone())]
            }
            ResourceAddress::Permission {
                database_id,
                user_id,
                ..
            } => vec![
                (ResourceKind::Database, database_id.clone()),
                (ResourceKind::User, user_id.clone()),
            ],
            ResourceAddress::StoredProcedure {
                database_id,
                collection_id,
                ..
            }
            | ResourceAddress::Trigger {
                database_id,
                collection_id,
                ..
            }
            | ResourceAddress::Function {
                database_id,
                collection_id,
                ..
            }
            | ResourceAddress::Document {
                database_id,
                collection_id,
                ..
            } => vec![
                (ResourceKind::Database, database_id.clone()),
                (ResourceKind::Collection, collection_id.clone()),
            ],
            ResourceAddress::Attachment {
                database_id,
                collection_id,
                document_id,
                ..
            } => vec![
                (ResourceKind::Database, database_id.clone()),
                (ResourceKind::Collection, collection_id.clone()),
                (ResourceKind::Document, document_id.clone()),
            ],
            ResourceAddress::Resolved { client_path, .. } => {
                let segments = split_segments(client_path);
                let pairs = segments.len().saturating_sub(2) / 2;
                segments
                    .chunks(2)
                    .take(pairs)
                    .filter_map(|chunk| {
                        let kind = ResourceKind::from_segment(chunk[0])?;
                        Some((kind, chunk.get(1)?.to_string()))
                    })
                    .collect()
            }
        }
    }

    /// Feed-or-item path: `dbs/A/colls` for a feed, `dbs/A/colls/B` for an item.
    pub fn path(&self) -> String {
        if let ResourceAddress::Resolved { client_path, .. } = self {
            return client_path.clone();
        }
        let feed = self.feed_path();
        match self.id() {
            Some(id) => format!("{}/{}", feed, id),
            None => feed,
        }
    }

    /// Path of the feed containing this item (or of this feed).
    pub fn feed_path(&self) -> String {
        let mut path = self.ancestor_path();
        if !path.is_empty() {
            path.push('/');
        }
        path.push_str(self.kind().segment());
        path
    }

    /// Path of the resource the operation acts on: the item itself, or
    /// the parent item for a feed (empty for top-level feeds).
    pub fn link(&self) -> String {
        if self.is_feed() {
            self.ancestor_path()
        } else {
            self.path()
        }
    }

    /// Client path of the addressed item; `None` for feeds.
    pub fn client_path(&self) -> Option<String> {
        if self.is_feed() {
            None
        } else {
            Some(self.path())
        }
    }

    /// Server path carried by a resolved address.
    pub fn server_path(&self) -> Option<&str> {
        match self {
            ResourceAddress::Resolved { server_path, .. } => server_path.as_deref(),
            _ => None,
        }
    }

    /// Item address for `id` inside this address's feed.
    ///
    /// Resolved addresses already name a concrete resource and are returned as is.
    pub fn with_id(&self, id: impl Into<String>) -> Self {
        let new_id = Some(id.into());
        let mut address = self.clone();
        match &mut address {
            ResourceAddress::Database { id }
            | ResourceAddress::Offer { id }
            | ResourceAddress::User { id, .. }
            | ResourceAddress::Permission { id, .. }
            | ResourceAddress::Collection { id, .. }
            | ResourceAddress::StoredProcedure { id, .. }
            | ResourceAddress::Trigger { id, .. }
            | ResourceAddress::Function { id, .. }
            | ResourceAddress::Document { id, .. }
            | ResourceAddress::Attachment { id, .. } => *id = new_id,
            ResourceAddress::Resolved { .. } => {}
        }
        address
    }

    /// Feed address containing this item.
    pub fn feed(&self) -> Self {
        match self {
            ResourceAddress::Resolved { kind, .. } => {
                let ids: Vec<String> = self.ancestors().into_iter().map(|(_, id)| id).collect();
                Self::from_parts(*kind, &ids, None).unwrap_or_else(|| self.clone())
            }
            _ => {
                let mut address = self.clone();
                match &mut address {
                    ResourceAddress::Database { id }
                    | ResourceAddress::Offer { id }
                    | ResourceAddress::User { id, .. }
                    | ResourceAddress::Permission { id, .. }
                    | ResourceAddress::Collection { id, .. }
                    | ResourceAddress::StoredProcedure { id, .. }
                    | ResourceAddress::Trigger { id, .. }
                    | ResourceAddress::Function { id, .. }
                    | ResourceAddress::Document { id, .. }
                    | ResourceAddress::Attachment { id, .. } => *id = None,
                    ResourceAddress::Resolved { .. } => {}
                }
                address
            }
        }
    }

    /// Item address of the nearest ancestor.
    pub fn parent(&self) -> Option<Self> {
        let mut ancestors = self.ancestors();
        let (kind, id) = ancestors.pop()?;
        let ids: Vec<String> = ancestors.into_iter().map(|(_, id)| id).collect();
        Self::from_parts(kind, &ids, Some(id))
    }

    fn ancestor_path(&self) -> String {
        self.ancestors()
            .iter()
            .map(|(kind, id)| format!("{}/{}", kind.segment(), id))
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// The fact `client path ↔ server path` for one concrete resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkPair {
    pub client_path: String,
    pub server_path: String,
}

impl LinkPair {
    /// Create a pair, trimming surrounding slashes from both paths.
    pub fn new(client_path: impl AsRef<str>, server_path: impl AsRef<str>) -> Self {
        Self {
            client_path: trim_slashes(client_path.as_ref()).to_string(),
            server_path: trim_slashes(server_path.as_ref()).to_string(),
        }
    }

    /// Both paths are non-empty and have the same number of segments.
    pub fn is_well_formed(&self) -> bool {
        let client = split_segments(&self.client_path);
        let server = split_segments(&self.server_path);
        !client.is_empty() && client.len() == server.len()
    }
}

/// Strip leading and trailing slashes.
pub fn trim_slashes(path: &str) -> &str {
    path.trim_matches('/')
}

/// Split a path into its non-empty segments.
pub fn split_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_and_feed_paths() {
        let doc = ResourceAddress::document("MyDb", "MyColl", "MyDoc");
        assert_eq!(doc.path(), "dbs/MyDb/colls/MyColl/docs/MyDoc");
        assert_eq!(doc.link(), "dbs/MyDb/colls/MyColl/docs/MyDoc");
        assert!(!doc.is_feed());

        let docs = ResourceAddress::documents("MyDb", "MyColl");
        assert_eq!(docs.path(), "dbs/MyDb/colls/MyColl/docs");
        assert_eq!(docs.link(), "dbs/MyDb/colls/MyColl");
        assert!(docs.is_feed());
        assert_eq!(docs.client_path(), None);
    }

    #[test]
    fn test_top_level_feeds_have_empty_link() {
        assert_eq!(ResourceAddress::databases().path(), "dbs");
        assert_eq!(ResourceAddress::databases().link(), "");
        assert_eq!(ResourceAddress::offers().path(), "offers");
    }

    #[test]
    fn test_ancestors_are_root_first() {
        let attachments = ResourceAddress::attachments("d", "c", "doc").with_id("a");
        assert_eq!(
            attachments.ancestors(),
            vec![
                (ResourceKind::Database, "d".to_string()),
                (ResourceKind::Collection, "c".to_string()),
                (ResourceKind::Document, "doc".to_string()),
            ]
        );
        assert_eq!(attachments.kind().depth(), 3);
    }

    #[test]
    fn test_with_id_and_feed_are_inverse() {
        let feed = ResourceAddress::permissions("d", "u");
        let item = feed.with_id("p");
        assert_eq!(item.path(), "dbs/d/users/u/permissions/p");
        assert_eq!(item.feed(), feed);
    }

    #[test]
    fn test_parent() {
        let doc = ResourceAddress::document("d", "c", "x");
        assert_eq!(doc.parent(), Some(ResourceAddress::collection("d", "c")));
        assert_eq!(
            ResourceAddress::collection("d", "c").parent(),
            Some(ResourceAddress::database("d"))
        );
        assert_eq!(ResourceAddress::database("d").parent(), None);
    }

    #[test]
    fn test_from_client_path_round_trips() {
        for address in [
            ResourceAddress::database("d"),
            ResourceAddress::collections("d"),
            ResourceAddress::document("d", "c", "x"),
            ResourceAddress::triggers("d", "c").with_id("t"),
            ResourceAddress::permissions("d", "u"),
            ResourceAddress::offers().with_id("o"),
        ] {
            assert_eq!(
                ResourceAddress::from_client_path(&address.path()),
                Some(address.clone())
            );
        }
    }

    #[test]
    fn test_from_client_path_rejects_bad_shapes() {
        assert_eq!(ResourceAddress::from_client_path(""), None);
        assert_eq!(ResourceAddress::from_client_path("colls/c"), None);
        assert_eq!(ResourceAddress::from_client_path("dbs/d/docs/x"), None);
        assert_eq!(ResourceAddress::from_client_path("nope/x"), None);
    }

    #[test]
    fn test_resolved_address() {
        let address = ResourceAddress::resolved(
            ResourceKind::Document,
            "/dbs/d/colls/c/docs/x/",
            Some("dbs/AA/colls/BB/docs/CC/".to_string()),
        );
        assert_eq!(address.id(), Some("x"));
        assert_eq!(address.path(), "dbs/d/colls/c/docs/x");
        assert_eq!(address.server_path(), Some("dbs/AA/colls/BB/docs/CC"));
        assert_eq!(address.feed(), ResourceAddress::documents("d", "c"));
        assert_eq!(address.parent(), Some(ResourceAddress::collection("d", "c")));
    }

    #[test]
    fn test_kind_depth_orders_ancestors_first() {
        for kind in ResourceKind::ALL {
            for ancestor in kind.ancestor_kinds() {
                assert!(ancestor.depth() < kind.depth());
            }
            for child in kind.children() {
                assert_eq!(child.depth(), kind.depth() + 1);
            }
        }
    }

    #[test]
    fn test_link_pair_well_formed() {
        assert!(LinkPair::new("dbs/Foo", "/dbs/AAAA/").is_well_formed());
        assert!(!LinkPair::new("dbs/Foo/colls/Bar", "dbs/AAAA").is_well_formed());
        assert!(!LinkPair::new("", "").is_well_formed());
    }

    #[test]
    fn test_address_serialization() {
        let address = ResourceAddress::document("d", "c", "x");
        let json = serde_json::to_string(&address).unwrap();
        let restored: ResourceAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, address);
    }
}
