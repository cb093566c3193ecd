//! Bidirectional client-path ↔ server-path mapping.

use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use offsync_common::{
    address::{split_segments, trim_slashes},
    Error, LinkPair, ResourceAddress, Result, StorePath,
};
use offsync_storage::SharedStore;

const LINKS_DIR: &str = "links";
const CLIENT_BY_SERVER: &str = "client-by-server.json";
const SERVER_BY_CLIENT: &str = "server-by-client.json";

#[derive(Debug, Default)]
struct LinkMaps {
    client_by_server: HashMap<String, String>,
    server_by_client: HashMap<String, String>,
}

impl LinkMaps {
    fn insert(&mut self, client: String, server: String) {
        if let Some(previous) = self.server_by_client.insert(client.clone(), server.clone()) {
            if previous != server {
                self.client_by_server.remove(&previous);
            }
        }
        if let Some(previous) = self.client_by_server.insert(server, client.clone()) {
            if previous != client {
                self.server_by_client.remove(&previous);
            }
        }
    }
}

fn is_within(path: &str, prefix: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn non_empty(path: &str) -> Option<&str> {
    let path = trim_slashes(path);
    (!path.is_empty()).then_some(path)
}

/// Knows the server path of every resource the client has created or fetched.
///
/// Storing a pair also records every ancestor pair: both path schemes
/// alternate kind and id segments, so dropping an even number of trailing
/// segments from each side yields the ancestor's paths.
pub struct LinkOracle {
    store: SharedStore,
    maps: RwLock<LinkMaps>,
}

impl LinkOracle {
    /// Create an empty oracle persisting into `store`.
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            maps: RwLock::new(LinkMaps::default()),
        }
    }

    fn key(file: &str) -> Result<StorePath> {
        StorePath::root().join(LINKS_DIR)?.join(file)
    }

    async fn load_map(&self, file: &str) -> Result<HashMap<String, String>> {
        let key = Self::key(file)?;
        let bytes = match self.store.read(&key).await {
            Ok(bytes) => bytes,
            Err(Error::NotFound(_)) => return Ok(HashMap::new()),
            Err(e) => return Err(e),
        };
        match serde_json::from_slice(&bytes) {
            Ok(map) => Ok(map),
            Err(e) => {
                warn!("Discarding unreadable link map {}: {}", key, e);
                Ok(HashMap::new())
            }
        }
    }

    /// Load both maps from the store, replacing the in-memory state.
    ///
    /// Missing or unreadable map files yield empty maps.
    pub async fn restore(&self) -> Result<()> {
        let client_by_server = self.load_map(CLIENT_BY_SERVER).await?;
        let server_by_client = self.load_map(SERVER_BY_CLIENT).await?;
        debug!(
            "Restored {} server links and {} client links",
            client_by_server.len(),
            server_by_client.len()
        );

        let mut maps = self.maps.write().await;
        *maps = LinkMaps {
            client_by_server,
            server_by_client,
        };
        Ok(())
    }

    /// Write both maps to the store.
    pub async fn persist(&self) -> Result<()> {
        let (client_by_server, server_by_client) = {
            let maps = self.maps.read().await;
            let client_by_server: BTreeMap<_, _> = maps.client_by_server.iter().collect();
            let server_by_client: BTreeMap<_, _> = maps.server_by_client.iter().collect();
            (
                serde_json::to_vec_pretty(&client_by_server)?,
                serde_json::to_vec_pretty(&server_by_client)?,
            )
        };

        self.store
            .write(&Self::key(CLIENT_BY_SERVER)?, client_by_server)
            .await?;
        self.store
            .write(&Self::key(SERVER_BY_CLIENT)?, server_by_client)
            .await
    }

    /// Record a pair and all of its ancestor pairs.
    ///
    /// Returns `false` (and changes nothing) when the two paths do not have
    /// the same, even number of segments.
    pub async fn store(&self, pair: &LinkPair) -> bool {
        let client: Vec<&str> = split_segments(&pair.client_path);
        let server: Vec<&str> = split_segments(&pair.server_path);
        if client.is_empty() || client.len() != server.len() || client.len() % 2 != 0 {
            warn!(
                "Ignoring malformed link {} <-> {}",
                pair.client_path, pair.server_path
            );
            return false;
        }

        let count = client.len();
        let mut maps = self.maps.write().await;
        for dropped in (0..count).step_by(2) {
            maps.insert(
                client[..count - dropped].join("/"),
                server[..count - dropped].join("/"),
            );
        }
        true
    }

    /// Forget a resource and everything below it, on both sides.
    pub async fn remove(&self, pair: &LinkPair) {
        let client = trim_slashes(&pair.client_path);
        let server = trim_slashes(&pair.server_path);

        let mut maps = self.maps.write().await;
        let doomed = |c: &str, s: &str| {
            is_within(c, client) || (!server.is_empty() && is_within(s, server))
        };
        maps.server_by_client.retain(|c, s| !doomed(c.as_str(), s.as_str()));
        maps.client_by_server.retain(|s, c| !doomed(c.as_str(), s.as_str()));
    }

    /// Server path for a client path, if known.
    pub async fn server_path(&self, client_path: &str) -> Option<String> {
        let client_path = non_empty(client_path)?;
        self.maps
            .read()
            .await
            .server_by_client
            .get(client_path)
            .cloned()
    }

    /// Client path for a server path, if known.
    pub async fn client_path(&self, server_path: &str) -> Option<String> {
        let server_path = non_empty(server_path)?;
        self.maps
            .read()
            .await
            .client_by_server
            .get(server_path)
            .cloned()
    }

    /// Server path of the ancestor `levels` levels above `server_path`, if known.
    pub async fn ancestor_server_path(&self, server_path: &str, levels: usize) -> Option<String> {
        let segments = split_segments(server_path);
        let keep = segments.len().checked_sub(levels * 2)?;
        if keep == 0 {
            return None;
        }
        let ancestor = segments[..keep].join("/");
        self.maps
            .read()
            .await
            .client_by_server
            .contains_key(&ancestor)
            .then_some(ancestor)
    }

    /// Server path for an item that is about to be created under a known parent.
    ///
    /// Top-level items need no parent. Returns `None` when the parent's
    /// server path is unknown.
    pub async fn new_server_path(&self, address: &ResourceAddress, resource_id: &str) -> Option<String> {
        let segment = address.kind().segment();
        match address.parent() {
            None => Some(format!("{}/{}", segment, resource_id)),
            Some(parent) => {
                let parent_server = self.server_path(&parent.path()).await?;
                Some(format!("{}/{}/{}", parent_server, segment, resource_id))
            }
        }
    }

    /// Move every server path at or below `old_prefix` to `new_prefix`.
    pub async fn rebase(&self, old_prefix: &str, new_prefix: &str) {
        let old_prefix = trim_slashes(old_prefix);
        let new_prefix = trim_slashes(new_prefix);
        if old_prefix.is_empty() || old_prefix == new_prefix {
            return;
        }

        let mut maps = self.maps.write().await;
        let moved: Vec<(String, String)> = maps
            .server_by_client
            .iter()
            .filter(|(_, server)| is_within(server, old_prefix))
            .map(|(client, server)| {
                (
                    client.clone(),
                    format!("{}{}", new_prefix, &server[old_prefix.len()..]),
                )
            })
            .collect();

        debug!(
            "Rebasing {} links from {} to {}",
            moved.len(),
            old_prefix,
            new_prefix
        );
        for (client, server) in moved {
            maps.insert(client, server);
        }
    }

    /// Forget every link, in memory and on disk.
    pub async fn purge_all(&self) -> Result<()> {
        *self.maps.write().await = LinkMaps::default();
        self.store
            .delete_tree(&StorePath::root().join(LINKS_DIR)?)
            .await
    }

    /// Every known pair, sorted by client path.
    pub async fn pairs(&self) -> Vec<LinkPair> {
        let maps = self.maps.read().await;
        let mut pairs: Vec<LinkPair> = maps
            .server_by_client
            .iter()
            .map(|(client, server)| LinkPair::new(client, server))
            .collect();
        pairs.sort_by(|a, b| a.client_path.cmp(&b.client_path));
        pairs
    }

    /// Number of known client paths.
    pub async fn len(&self) -> usize {
        self.maps.read().await.server_by_client.len()
    }

    /// Whether no link is known.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsync_common::ResourceKind;
    use offsync_storage::{LocalStore, MemoryStore};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn oracle() -> LinkOracle {
        LinkOracle::new(Arc::new(MemoryStore::new()))
    }

    fn doc_pair() -> LinkPair {
        LinkPair::new(
            "dbs/MyDb/colls/MyColl/docs/MyDoc",
            "/dbs/AAAA/colls/BBBB/docs/CCCC/",
        )
    }

    #[tokio::test]
    async fn test_store_indexes_every_ancestor() {
        let oracle = oracle();
        assert!(oracle.store(&doc_pair()).await);

        assert_eq!(
            oracle.server_path("dbs/MyDb/colls/MyColl/docs/MyDoc").await.as_deref(),
            Some("dbs/AAAA/colls/BBBB/docs/CCCC")
        );
        assert_eq!(
            oracle.server_path("dbs/MyDb/colls/MyColl").await.as_deref(),
            Some("dbs/AAAA/colls/BBBB")
        );
        assert_eq!(oracle.server_path("/dbs/MyDb/").await.as_deref(), Some("dbs/AAAA"));
        assert_eq!(oracle.client_path("dbs/AAAA").await.as_deref(), Some("dbs/MyDb"));
        assert_eq!(oracle.len().await, 3);
    }

    #[tokio::test]
    async fn test_malformed_pair_is_ignored() {
        let oracle = oracle();
        assert!(!oracle.store(&LinkPair::new("dbs/MyDb/colls/MyColl", "dbs/AAAA")).await);
        assert!(!oracle.store(&LinkPair::new("dbs", "dbs")).await);
        assert!(oracle.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_and_empty_lookups() {
        let oracle = oracle();
        oracle.store(&doc_pair()).await;
        assert_eq!(oracle.server_path("dbs/Other").await, None);
        assert_eq!(oracle.server_path("").await, None);
        assert_eq!(oracle.client_path("/").await, None);
    }

    #[tokio::test]
    async fn test_ancestor_server_path() {
        let oracle = oracle();
        oracle.store(&doc_pair()).await;
        let doc = "dbs/AAAA/colls/BBBB/docs/CCCC";

        assert_eq!(oracle.ancestor_server_path(doc, 0).await.as_deref(), Some(doc));
        assert_eq!(
            oracle.ancestor_server_path(doc, 1).await.as_deref(),
            Some("dbs/AAAA/colls/BBBB")
        );
        assert_eq!(oracle.ancestor_server_path(doc, 2).await.as_deref(), Some("dbs/AAAA"));
        assert_eq!(oracle.ancestor_server_path(doc, 3).await, None);
        assert_eq!(oracle.ancestor_server_path("dbs/ZZZZ/colls/Y", 1).await, None);
    }

    #[tokio::test]
    async fn test_remove_drops_descendants_only() {
        let oracle = oracle();
        oracle.store(&doc_pair()).await;
        oracle
            .store(&LinkPair::new("dbs/MyDb/colls/Other", "dbs/AAAA/colls/DDDD"))
            .await;

        oracle
            .remove(&LinkPair::new("dbs/MyDb/colls/MyColl", "dbs/AAAA/colls/BBBB"))
            .await;

        assert_eq!(oracle.server_path("dbs/MyDb/colls/MyColl").await, None);
        assert_eq!(oracle.server_path("dbs/MyDb/colls/MyColl/docs/MyDoc").await, None);
        assert_eq!(oracle.client_path("dbs/AAAA/colls/BBBB/docs/CCCC").await, None);
        assert!(oracle.server_path("dbs/MyDb/colls/Other").await.is_some());
        assert!(oracle.server_path("dbs/MyDb").await.is_some());
    }

    #[tokio::test]
    async fn test_new_server_path_needs_known_parent() {
        let oracle = oracle();
        assert_eq!(
            oracle
                .new_server_path(&ResourceAddress::database("New"), "tmp")
                .await
                .as_deref(),
            Some("dbs/tmp")
        );
        assert_eq!(
            oracle
                .new_server_path(&ResourceAddress::collection("New", "c"), "tmp")
                .await,
            None
        );

        oracle.store(&doc_pair()).await;
        let address = ResourceAddress::resolved(
            ResourceKind::Document,
            "dbs/MyDb/colls/MyColl/docs/Fresh",
            None,
        );
        assert_eq!(
            oracle.new_server_path(&address, "tmp").await.as_deref(),
            Some("dbs/AAAA/colls/BBBB/docs/tmp")
        );
    }

    #[tokio::test]
    async fn test_rebase_moves_subtree() {
        let oracle = oracle();
        oracle
            .store(&LinkPair::new("dbs/MyDb/colls/MyColl/docs/MyDoc", "dbs/tmp/colls/t2/docs/t3"))
            .await;

        oracle.rebase("dbs/tmp", "dbs/AAAA").await;

        assert_eq!(
            oracle.server_path("dbs/MyDb/colls/MyColl/docs/MyDoc").await.as_deref(),
            Some("dbs/AAAA/colls/t2/docs/t3")
        );
        assert_eq!(oracle.client_path("dbs/tmp").await, None);
        assert_eq!(oracle.client_path("dbs/AAAA").await.as_deref(), Some("dbs/MyDb"));
    }

    #[tokio::test]
    async fn test_persist_and_restore() {
        let temp = TempDir::new().unwrap();
        let store: SharedStore = Arc::new(LocalStore::new(temp.path()).unwrap());

        let oracle = LinkOracle::new(store.clone());
        oracle.store(&doc_pair()).await;
        oracle.persist().await.unwrap();
        assert!(temp.path().join("links/client-by-server.json").is_file());
        assert!(temp.path().join("links/server-by-client.json").is_file());

        let restored = LinkOracle::new(store);
        restored.restore().await.unwrap();
        assert_eq!(restored.pairs().await, oracle.pairs().await);
    }

    #[tokio::test]
    async fn test_restore_tolerates_corrupt_maps() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        store
            .write(&StorePath::parse("links/server-by-client.json").unwrap(), b"{oops".to_vec())
            .await
            .unwrap();

        let oracle = LinkOracle::new(store);
        oracle.restore().await.unwrap();
        assert!(oracle.is_empty().await);
    }

    #[tokio::test]
    async fn test_purge_all() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let oracle = LinkOracle::new(store.clone());
        oracle.store(&doc_pair()).await;
        oracle.persist().await.unwrap();

        oracle.purge_all().await.unwrap();
        assert!(oracle.is_empty().await);
        assert!(!store.exists(&StorePath::parse("links").unwrap()).await.unwrap());
    }
}
