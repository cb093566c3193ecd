//! Local filesystem blob store.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

use crate::store::{BlobStore, Entry};
use offsync_common::{Error, Result, StorePath};

/// Local filesystem blob store.
///
/// Stores every blob as a file below a root directory, mirroring the key
/// structure one directory per component.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Create a new local store with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.exists() {
            std::fs::create_dir_all(&root)?;
            info!("Created store root {}", root.display());
        }

        Ok(Self { root })
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Convert a StorePath to a filesystem path.
    fn to_fs_path(&self, key: &StorePath) -> PathBuf {
        let mut fs_path = self.root.clone();
        for component in key.components() {
            fs_path.push(component);
        }
        fs_path
    }
}

fn not_found(key: &StorePath, err: std::io::Error) -> Error {
    if err.kind() == ErrorKind::NotFound {
        Error::NotFound(format!("Not found: {}", key))
    } else {
        Error::Io(err)
    }
}

#[async_trait]
impl BlobStore for LocalStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn write(&self, key: &StorePath, data: Vec<u8>) -> Result<()> {
        let fs_path = self.to_fs_path(key);

        if let Some(parent) = fs_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::write(&fs_path, &data).await?;
        Ok(())
    }

    async fn read(&self, key: &StorePath) -> Result<Vec<u8>> {
        let fs_path = self.to_fs_path(key);

        if fs_path.is_dir() {
            return Err(Error::InvalidInput(format!(
                "Cannot read directory: {}",
                key
            )));
        }

        fs::read(&fs_path).await.map_err(|e| not_found(key, e))
    }

    async fn exists(&self, key: &StorePath) -> Result<bool> {
        Ok(fs::try_exists(self.to_fs_path(key)).await?)
    }

    async fn delete(&self, key: &StorePath) -> Result<()> {
        let fs_path = self.to_fs_path(key);

        if fs_path.is_dir() {
            return Err(Error::InvalidInput(
                "Use delete_tree for directories".to_string(),
            ));
        }

        fs::remove_file(&fs_path)
            .await
            .map_err(|e| not_found(key, e))
    }

    async fn create_dir(&self, key: &StorePath) -> Result<()> {
        fs::create_dir_all(self.to_fs_path(key)).await?;
        Ok(())
    }

    async fn delete_tree(&self, key: &StorePath) -> Result<()> {
        let fs_path = self.to_fs_path(key);

        let result = if key.is_root() {
            // Keep the root itself, clear its contents.
            let mut entries = match fs::read_dir(&fs_path).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(Error::Io(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    fs::remove_dir_all(&path).await?;
                } else {
                    fs::remove_file(&path).await?;
                }
            }
            Ok(())
        } else if fs_path.is_dir() {
            fs::remove_dir_all(&fs_path).await
        } else {
            fs::remove_file(&fs_path).await
        };

        match result {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            other => Ok(other?),
        }
    }

    async fn list(&self, key: &StorePath) -> Result<Vec<Entry>> {
        let fs_path = self.to_fs_path(key);

        if fs_path.is_file() {
            return Err(Error::InvalidInput("Not a directory".to_string()));
        }

        let mut entries = fs::read_dir(&fs_path)
            .await
            .map_err(|e| not_found(key, e))?;

        let mut results = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            let is_dir = entry.file_type().await?.is_dir();
            results.push(Entry { name, is_dir });
        }
        results.sort();

        Ok(results)
    }

    async fn rename(&self, from: &StorePath, to: &StorePath) -> Result<()> {
        let from_path = self.to_fs_path(from);
        let to_path = self.to_fs_path(to);

        if !fs::try_exists(&from_path).await? {
            return Err(Error::NotFound(format!("Source not found: {}", from)));
        }

        if fs::try_exists(&to_path).await? {
            return Err(Error::Conflict(format!(
                "Destination already exists: {}",
                to
            )));
        }

        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::rename(&from_path, &to_path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(path: &str) -> StorePath {
        StorePath::parse(path).unwrap()
    }

    #[tokio::test]
    async fn test_local_write_read() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path()).unwrap();
        let data = b"Hello, Local!".to_vec();

        store.write(&key("dbs/AAAA/AAAA.json"), data.clone()).await.unwrap();
        let read = store.read(&key("dbs/AAAA/AAAA.json")).await.unwrap();

        assert_eq!(read, data);
        assert!(temp.path().join("dbs/AAAA/AAAA.json").is_file());
    }

    #[tokio::test]
    async fn test_local_missing_is_not_found() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path()).unwrap();

        assert!(matches!(
            store.read(&key("missing.json")).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            store.delete(&key("missing.json")).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            store.list(&key("missing")).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_local_list() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path()).unwrap();

        store.write(&key("dir/file1.json"), vec![1]).await.unwrap();
        store.write(&key("dir/file2.json"), vec![2]).await.unwrap();
        store.create_dir(&key("dir/empty")).await.unwrap();

        let contents = store.list(&key("dir")).await.unwrap();
        assert_eq!(contents.len(), 3);
        assert!(contents.contains(&Entry {
            name: "empty".into(),
            is_dir: true
        }));
        assert!(store.list(&key("dir/empty")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_delete_tree_and_rename() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path()).unwrap();

        store.write(&key("dbs/tmp/tmp.json"), vec![1]).await.unwrap();
        store.rename(&key("dbs/tmp"), &key("dbs/REAL")).await.unwrap();
        assert_eq!(store.read(&key("dbs/REAL/tmp.json")).await.unwrap(), vec![1]);

        store.delete_tree(&key("dbs")).await.unwrap();
        assert!(!store.exists(&key("dbs")).await.unwrap());
        store.delete_tree(&key("dbs")).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_delete_tree_root_keeps_root() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path()).unwrap();

        store.write(&key("a/b.json"), vec![1]).await.unwrap();
        store.write(&key("c.json"), vec![2]).await.unwrap();
        store.delete_tree(&StorePath::root()).await.unwrap();

        assert!(temp.path().is_dir());
        assert!(store.list(&StorePath::root()).await.unwrap().is_empty());
    }
}
