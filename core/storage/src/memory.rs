//! In-memory blob store for testing.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::store::{BlobStore, Entry};
use offsync_common::{Error, Result, StorePath};

/// In-memory storage node.
#[derive(Debug, Clone)]
enum Node {
    File(Vec<u8>),
    Directory,
}

/// In-memory blob store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop.
pub struct MemoryStore {
    nodes: RwLock<BTreeMap<StorePath, Node>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(StorePath::root(), Node::Directory);
        Self {
            nodes: RwLock::new(nodes),
        }
    }

    /// Insert directories for `key` and all of its ancestors.
    fn ensure_dirs(nodes: &mut BTreeMap<StorePath, Node>, key: &StorePath) -> Result<()> {
        let mut current = StorePath::root();
        for component in key.components() {
            current = current.join(component)?;
            match nodes.get(&current) {
                Some(Node::Directory) => {}
                Some(Node::File(_)) => {
                    return Err(Error::InvalidInput(format!("{} is a file", current)));
                }
                None => {
                    nodes.insert(current.clone(), Node::Directory);
                }
            }
        }
        Ok(())
    }

    fn subtree(nodes: &BTreeMap<StorePath, Node>, key: &StorePath) -> Vec<StorePath> {
        nodes
            .range(key.clone()..)
            .take_while(|(path, _)| path.starts_with(key))
            .map(|(path, _)| path.clone())
            .collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn write(&self, key: &StorePath, data: Vec<u8>) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        if let Some(parent) = key.parent() {
            Self::ensure_dirs(&mut nodes, &parent)?;
        }
        if let Some(Node::Directory) = nodes.get(key) {
            return Err(Error::InvalidInput(format!("{} is a directory", key)));
        }
        nodes.insert(key.clone(), Node::File(data));
        Ok(())
    }

    async fn read(&self, key: &StorePath) -> Result<Vec<u8>> {
        match self.nodes.read().await.get(key) {
            Some(Node::File(data)) => Ok(data.clone()),
            Some(Node::Directory) => Err(Error::InvalidInput(format!(
                "Cannot read directory: {}",
                key
            ))),
            None => Err(Error::NotFound(format!("Blob not found: {}", key))),
        }
    }

    async fn exists(&self, key: &StorePath) -> Result<bool> {
        Ok(self.nodes.read().await.contains_key(key))
    }

    async fn delete(&self, key: &StorePath) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        match nodes.get(key) {
            Some(Node::File(_)) => {
                nodes.remove(key);
                Ok(())
            }
            Some(Node::Directory) => Err(Error::InvalidInput(
                "Use delete_tree for directories".to_string(),
            )),
            None => Err(Error::NotFound(format!("Blob not found: {}", key))),
        }
    }

    async fn create_dir(&self, key: &StorePath) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        Self::ensure_dirs(&mut nodes, key)
    }

    async fn delete_tree(&self, key: &StorePath) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        for path in Self::subtree(&nodes, key) {
            if !path.is_root() {
                nodes.remove(&path);
            }
        }
        Ok(())
    }

    async fn list(&self, key: &StorePath) -> Result<Vec<Entry>> {
        let nodes = self.nodes.read().await;

        match nodes.get(key) {
            Some(Node::Directory) => {}
            Some(Node::File(_)) => {
                return Err(Error::InvalidInput("Not a directory".to_string()));
            }
            None => {
                return Err(Error::NotFound(format!("Directory not found: {}", key)));
            }
        }

        let depth = key.components().len() + 1;
        let mut entries: Vec<Entry> = nodes
            .range(key.clone()..)
            .take_while(|(path, _)| path.starts_with(key))
            .filter(|(path, _)| path.components().len() == depth)
            .filter_map(|(path, node)| {
                Some(Entry {
                    name: path.name()?.to_string(),
                    is_dir: matches!(node, Node::Directory),
                })
            })
            .collect();
        entries.sort();
        Ok(entries)
    }

    async fn rename(&self, from: &StorePath, to: &StorePath) -> Result<()> {
        let mut nodes = self.nodes.write().await;

        if !nodes.contains_key(from) {
            return Err(Error::NotFound(format!("Source not found: {}", from)));
        }
        if nodes.contains_key(to) {
            return Err(Error::Conflict(format!("Destination already exists: {}", to)));
        }
        if to.starts_with(from) {
            return Err(Error::InvalidInput(format!(
                "Cannot move {} below itself",
                from
            )));
        }
        if let Some(parent) = to.parent() {
            Self::ensure_dirs(&mut nodes, &parent)?;
        }

        let prefix_len = from.components().len();
        for path in Self::subtree(&nodes, from) {
            if let Some(node) = nodes.remove(&path) {
                let mut components = to.components().to_vec();
                components.extend_from_slice(&path.components()[prefix_len..]);
                nodes.insert(StorePath::from_components(components)?, node);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> StorePath {
        StorePath::parse(path).unwrap()
    }

    #[tokio::test]
    async fn test_memory_write_read() {
        let store = MemoryStore::new();
        let data = b"Hello, World!".to_vec();

        store.write(&key("dbs/AAAA/AAAA.json"), data.clone()).await.unwrap();
        assert_eq!(store.read(&key("dbs/AAAA/AAAA.json")).await.unwrap(), data);
        assert!(store.exists(&key("dbs/AAAA")).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_read_missing() {
        let store = MemoryStore::new();
        let result = store.read(&key("nope.json")).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_memory_list_direct_children_only() {
        let store = MemoryStore::new();
        store.write(&key("dir/a.json"), vec![1]).await.unwrap();
        store.write(&key("dir/sub/b.json"), vec![2]).await.unwrap();
        store.create_dir(&key("dir/empty")).await.unwrap();

        let entries = store.list(&key("dir")).await.unwrap();
        assert_eq!(
            entries,
            vec![
                Entry { name: "a.json".into(), is_dir: false },
                Entry { name: "empty".into(), is_dir: true },
                Entry { name: "sub".into(), is_dir: true },
            ]
        );
        assert!(store.list(&key("dir/empty")).await.unwrap().is_empty());
        assert!(matches!(
            store.list(&key("missing")).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_delete_tree() {
        let store = MemoryStore::new();
        store.write(&key("dbs/A/A.json"), vec![1]).await.unwrap();
        store.write(&key("dbs/A/colls/B/B.json"), vec![2]).await.unwrap();
        store.write(&key("dbs/AB/AB.json"), vec![3]).await.unwrap();

        store.delete_tree(&key("dbs/A")).await.unwrap();

        assert!(!store.exists(&key("dbs/A")).await.unwrap());
        assert!(!store.exists(&key("dbs/A/colls/B/B.json")).await.unwrap());
        assert!(store.exists(&key("dbs/AB/AB.json")).await.unwrap());
        store.delete_tree(&key("dbs/missing")).await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_rename_tree() {
        let store = MemoryStore::new();
        store.write(&key("dbs/tmp/tmp.json"), vec![1]).await.unwrap();
        store.write(&key("dbs/tmp/colls/c/c.json"), vec![2]).await.unwrap();

        store.rename(&key("dbs/tmp"), &key("dbs/REAL")).await.unwrap();

        assert!(!store.exists(&key("dbs/tmp")).await.unwrap());
        assert_eq!(store.read(&key("dbs/REAL/tmp.json")).await.unwrap(), vec![1]);
        assert_eq!(
            store.read(&key("dbs/REAL/colls/c/c.json")).await.unwrap(),
            vec![2]
        );
    }

    #[tokio::test]
    async fn test_memory_rename_onto_existing_fails() {
        let store = MemoryStore::new();
        store.create_dir(&key("a")).await.unwrap();
        store.create_dir(&key("b")).await.unwrap();
        assert!(matches!(
            store.rename(&key("a"), &key("b")).await,
            Err(Error::Conflict(_))
        ));
    }
}
