//! On-disk mirror of remote resources.
//!
//! A resource with server path `dbs/AAAA/colls/BBBB` is stored at
//! `dbs/AAAA/colls/BBBB/BBBB.json`, next to one directory per child feed
//! (`docs`, `sprocs`, ...). Those directories are created eagerly so an
//! empty feed can be told apart from one that was never fetched.

use std::sync::Arc;
use tracing::{debug, warn};

use offsync_common::{
    address::split_segments, Error, ResourceAddress, ResourceKind, Result, StorePath,
    SystemProperties,
};
use offsync_storage::SharedStore;

use crate::oracle::LinkOracle;

/// Top-level directories holding cached resources.
const ROOT_FEEDS: [ResourceKind; 2] = [ResourceKind::Database, ResourceKind::Offer];

/// Local cache of serialized resources, keyed through the [`LinkOracle`].
pub struct LocalCache {
    store: SharedStore,
    oracle: Arc<LinkOracle>,
}

impl LocalCache {
    /// Create a cache over `store`, resolving addresses through `oracle`.
    pub fn new(store: SharedStore, oracle: Arc<LinkOracle>) -> Self {
        Self { store, oracle }
    }

    /// Kind and resource id encoded in an item server path.
    fn parse_item(server_path: &str) -> Result<(ResourceKind, String)> {
        let segments = split_segments(server_path);
        let invalid = || Error::Internal(format!("{} is not a resource path", server_path));
        if segments.len() < 2 || segments.len() % 2 != 0 {
            return Err(invalid());
        }
        let kind = ResourceKind::from_segment(segments[segments.len() - 2]).ok_or_else(invalid)?;
        Ok((kind, segments[segments.len() - 1].to_string()))
    }

    fn item_file(server_path: &str) -> Result<StorePath> {
        let (_, resource_id) = Self::parse_item(server_path)?;
        StorePath::parse(server_path)?.join(&format!("{}.json", resource_id))
    }

    /// Server path of an item address, if known.
    pub async fn resolve(&self, address: &ResourceAddress) -> Option<String> {
        if let Some(server_path) = address.server_path() {
            return Some(server_path.to_string());
        }
        self.oracle.server_path(&address.client_path()?).await
    }

    /// Directory of a feed address, if its parent is known.
    pub async fn feed_dir(&self, feed: &ResourceAddress) -> Option<String> {
        let segment = feed.kind().segment();
        match feed.parent() {
            None => Some(segment.to_string()),
            Some(parent) => {
                let parent_server = self.oracle.server_path(&parent.path()).await?;
                Some(format!("{}/{}", parent_server, segment))
            }
        }
    }

    /// Store a serialized resource under its server path.
    ///
    /// # Postconditions
    /// - `get` for the same server path returns `body` byte for byte
    /// - every child feed directory of the resource exists
    pub async fn put(&self, body: &[u8], server_path: &str) -> Result<()> {
        let (kind, _) = Self::parse_item(server_path)?;
        let dir = StorePath::parse(server_path)?;

        self.store
            .write(&Self::item_file(server_path)?, body.to_vec())
            .await?;
        for child in kind.children() {
            self.store.create_dir(&dir.join(child.segment())?).await?;
        }
        debug!("Cached {}", server_path);
        Ok(())
    }

    /// Cached bytes at a server path.
    pub async fn get_at(&self, server_path: &str) -> Result<Option<Vec<u8>>> {
        match self.store.read(&Self::item_file(server_path)?).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Whether anything is cached at or below a server path.
    pub async fn contains_at(&self, server_path: &str) -> Result<bool> {
        Self::parse_item(server_path)?;
        self.store.exists(&StorePath::parse(server_path)?).await
    }

    /// Drop a resource and its whole subtree.
    pub async fn remove_at(&self, server_path: &str) -> Result<()> {
        Self::parse_item(server_path)?;
        self.store.delete_tree(&StorePath::parse(server_path)?).await
    }

    /// Cached bytes of an item address.
    pub async fn get(&self, address: &ResourceAddress) -> Result<Option<Vec<u8>>> {
        match self.resolve(address).await {
            Some(server_path) => self.get_at(&server_path).await,
            None => Ok(None),
        }
    }

    /// Remove an item address and its subtree. Unknown addresses are ignored.
    pub async fn remove(&self, address: &ResourceAddress) -> Result<()> {
        match self.resolve(address).await {
            Some(server_path) => self.remove_at(&server_path).await,
            None => Ok(()),
        }
    }

    /// Cached items of a feed.
    ///
    /// Returns `None` when the feed was never materialized locally and an
    /// empty list for a known empty feed.
    pub async fn list(&self, feed: &ResourceAddress) -> Result<Option<Vec<Vec<u8>>>> {
        let Some(dir) = self.feed_dir(feed).await else {
            return Ok(None);
        };
        let dir_key = StorePath::parse(&dir)?;

        let entries = match self.store.list(&dir_key).await {
            Ok(entries) => entries,
            Err(Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut items = Vec::new();
        for entry in entries.into_iter().filter(|e| e.is_dir) {
            if let Some(bytes) = self.get_at(&format!("{}/{}", dir, entry.name)).await? {
                items.push(bytes);
            }
        }
        Ok(Some(items))
    }

    /// Materialize a feed from an online listing.
    ///
    /// Items without a server path are skipped.
    pub async fn put_feed(&self, feed: &ResourceAddress, items: &[Vec<u8>]) -> Result<()> {
        match self.feed_dir(feed).await {
            Some(dir) => self.store.create_dir(&StorePath::parse(&dir)?).await?,
            None => debug!("Parent of {} unknown, feed directory not created", feed),
        }

        for item in items {
            let props = SystemProperties::from_bytes(item)?;
            match props.server_path() {
                Some(server_path) => self.put(item, server_path).await?,
                None => warn!("Listed {} item '{}' has no server path", feed.kind(), props.id),
            }
        }
        Ok(())
    }

    /// Move a provisional subtree to the server path assigned by the server.
    ///
    /// The resource file is renamed after the new resource id; descendants
    /// keep their files and follow the directory.
    pub async fn rebase(&self, old_server_path: &str, new_server_path: &str) -> Result<()> {
        if old_server_path == new_server_path {
            return Ok(());
        }
        let old_dir = StorePath::parse(old_server_path)?;
        let new_dir = StorePath::parse(new_server_path)?;
        if !self.store.exists(&old_dir).await? {
            return Ok(());
        }

        self.store.delete_tree(&new_dir).await?;
        self.store.rename(&old_dir, &new_dir).await?;

        let (_, old_id) = Self::parse_item(old_server_path)?;
        let stale = new_dir.join(&format!("{}.json", old_id))?;
        match self.store.read(&stale).await {
            Ok(bytes) => {
                self.store.delete(&stale).await?;
                self.store
                    .write(&Self::item_file(new_server_path)?, bytes)
                    .await?;
            }
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        debug!("Moved cache {} -> {}", old_server_path, new_server_path);
        Ok(())
    }

    /// Drop every cached resource. Links and pending writes are untouched.
    pub async fn purge_all(&self) -> Result<()> {
        for kind in ROOT_FEEDS {
            self.store
                .delete_tree(&StorePath::root().join(kind.segment())?)
                .await?;
        }
        Ok(())
    }
}
