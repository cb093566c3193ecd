//! Blob store trait definition.

use async_trait::async_trait;
use std::sync::Arc;

use offsync_common::{Result, StorePath};

/// A directory entry returned by [`BlobStore::list`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Entry {
    /// Last component of the entry's key.
    pub name: String,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

/// Shared handle to a blob store.
pub type SharedStore = Arc<dyn BlobStore>;

/// Durable byte-blob storage under path-like keys.
///
/// Directories are first-class: an empty directory is distinguishable from
/// a missing one, which the cache relies on to tell an empty feed apart from
/// a feed that was never fetched.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Get the backend name (e.g., "local", "memory").
    fn name(&self) -> &str;

    /// Write a blob, creating missing parent directories.
    ///
    /// # Postconditions
    /// - Any previous blob at `key` is replaced
    async fn write(&self, key: &StorePath, data: Vec<u8>) -> Result<()>;

    /// Read a blob.
    ///
    /// # Errors
    /// - `NotFound` if no blob exists at `key`
    /// - `InvalidInput` if `key` is a directory
    async fn read(&self, key: &StorePath) -> Result<Vec<u8>>;

    /// Check if a blob or directory exists.
    async fn exists(&self, key: &StorePath) -> Result<bool>;

    /// Delete a blob.
    ///
    /// # Errors
    /// - `NotFound` if no blob exists at `key`
    async fn delete(&self, key: &StorePath) -> Result<()>;

    /// Create a directory and its parents. Existing directories are left untouched.
    async fn create_dir(&self, key: &StorePath) -> Result<()>;

    /// Recursively delete a directory or blob. Missing keys are not an error.
    async fn delete_tree(&self, key: &StorePath) -> Result<()>;

    /// List the direct children of a directory, sorted by name.
    ///
    /// # Errors
    /// - `NotFound` if the directory does not exist
    async fn list(&self, key: &StorePath) -> Result<Vec<Entry>>;

    /// Move a blob or directory tree, creating the destination's parents.
    ///
    /// # Errors
    /// - `NotFound` if `from` does not exist
    /// - `Conflict` if `to` already exists
    async fn rename(&self, from: &StorePath, to: &StorePath) -> Result<()>;
}
