//! Remote transport interface and an in-memory server for tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use offsync_common::{
    address::split_segments, Error, Headers, ResourceAddress, Result, IF_MATCH,
};

use crate::write::WriteKind;

/// Shared handle to a transport.
pub type SharedTransport = Arc<dyn Transport>;

/// Network operations against the resource server.
///
/// Resources are addressed by client path; the server resolves ids itself.
/// Implementations must report a missing network as [`Error::Unreachable`]
/// so callers can fall back to offline semantics.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform a create, replace or delete.
    ///
    /// Returns the server's copy of the resource (empty for deletes).
    ///
    /// # Errors
    /// - `Unreachable` if the network is down
    /// - `PreconditionFailed` if an `If-Match` header does not match
    /// - `NotFound`, `Conflict` or `Transport` as reported by the server
    async fn perform_write(
        &self,
        kind: WriteKind,
        address: &ResourceAddress,
        payload: Option<&[u8]>,
        headers: &Headers,
    ) -> Result<Vec<u8>>;

    /// Fetch a single resource.
    async fn read(&self, address: &ResourceAddress, headers: &Headers) -> Result<Vec<u8>>;

    /// Fetch every resource of a feed.
    async fn list(&self, address: &ResourceAddress, headers: &Headers) -> Result<Vec<Vec<u8>>>;
}

/// A write received by [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub kind: WriteKind,
    pub client_path: String,
    pub if_match: Option<String>,
}

#[derive(Default)]
struct ServerState {
    /// Resources keyed by client path.
    resources: BTreeMap<String, Value>,
    /// Resource ids handed out before falling back to generated ones.
    queued_ids: VecDeque<String>,
    counter: u64,
    writes: Vec<RecordedWrite>,
}

impl ServerState {
    fn next_counter(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    fn etag(&mut self) -> String {
        format!("\"{:08x}\"", self.next_counter())
    }

    fn check_if_match(&self, client_path: &str, headers: &Headers) -> Result<()> {
        let Some(expected) = headers.get(IF_MATCH) else {
            return Ok(());
        };
        let current = self
            .resources
            .get(client_path)
            .and_then(|r| r.get("_etag"))
            .and_then(Value::as_str);
        if current != Some(expected.as_str()) {
            return Err(Error::PreconditionFailed(format!(
                "Version tag mismatch for {}",
                client_path
            )));
        }
        Ok(())
    }

    fn server_path_of(&self, client_path: &str) -> Option<String> {
        self.resources
            .get(client_path)
            .and_then(|r| r.get("_self"))
            .and_then(Value::as_str)
            .map(|s| s.trim_matches('/').to_string())
    }
}

/// In-memory resource server.
///
/// Assigns resource ids and version tags, enforces `If-Match`, parent
/// existence and unique ids, and can be switched unreachable. Every write it
/// receives is recorded, including rejected ones.
pub struct MemoryTransport {
    reachable: AtomicBool,
    state: Mutex<ServerState>,
}

impl MemoryTransport {
    /// Create a reachable server with no resources.
    pub fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            state: Mutex::new(ServerState::default()),
        }
    }

    /// Simulate network loss or recovery.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Whether the server currently answers.
    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Resource ids to assign to the next creates, in order.
    pub async fn queue_resource_ids<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state.lock().await;
        state.queued_ids.extend(ids.into_iter().map(Into::into));
    }

    /// Writes received so far.
    pub async fn writes(&self) -> Vec<RecordedWrite> {
        self.state.lock().await.writes.clone()
    }

    /// Server copy of a resource.
    pub async fn resource(&self, client_path: &str) -> Option<Value> {
        self.state.lock().await.resources.get(client_path).cloned()
    }

    /// Change a stored resource out of band, as another client would.
    ///
    /// A new version tag is assigned.
    pub async fn modify<F>(&self, client_path: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Value),
    {
        let mut state = self.state.lock().await;
        let etag = state.etag();
        let resource = state
            .resources
            .get_mut(client_path)
            .ok_or_else(|| Error::NotFound(client_path.to_string()))?;
        f(resource);
        resource["_etag"] = Value::String(etag);
        Ok(())
    }

    fn ensure_reachable(&self) -> Result<()> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(Error::Unreachable("Server is not reachable".to_string()))
        }
    }

    fn item_path(address: &ResourceAddress) -> Result<String> {
        address
            .client_path()
            .ok_or_else(|| Error::InvalidInput(format!("{} is not an item address", address)))
    }

    fn parse_body(payload: Option<&[u8]>) -> Result<Value> {
        let payload = payload
            .ok_or_else(|| Error::InvalidInput("Missing resource body".to_string()))?;
        let body: Value = serde_json::from_slice(payload)?;
        if !body.is_object() {
            return Err(Error::InvalidInput("Resource body must be an object".to_string()));
        }
        Ok(body)
    }

    fn create(
        state: &mut ServerState,
        address: &ResourceAddress,
        client_path: &str,
        payload: Option<&[u8]>,
    ) -> Result<Value> {
        let mut body = Self::parse_body(payload)?;

        if state.resources.contains_key(client_path) {
            return Err(Error::Conflict(format!("{} already exists", client_path)));
        }

        let parent_server_path = match address.parent() {
            Some(parent) => {
                let parent_path = parent.path();
                let server_path = state
                    .server_path_of(&parent_path)
                    .ok_or_else(|| Error::NotFound(format!("Parent {} not found", parent_path)))?;
                Some(server_path)
            }
            None => None,
        };

        let counter = state.next_counter();
        let resource_id = state
            .queued_ids
            .pop_front()
            .unwrap_or_else(|| format!("R{:07}", counter));
        let segment = address.kind().segment();
        let server_path = match parent_server_path {
            Some(parent) => format!("{}/{}/{}", parent, segment, resource_id),
            None => format!("{}/{}", segment, resource_id),
        };

        body["id"] = Value::String(address.id().unwrap_or_default().to_string());
        body["_rid"] = Value::String(resource_id);
        body["_self"] = Value::String(format!("{}/", server_path));
        body["_etag"] = Value::String(state.etag());
        state.resources.insert(client_path.to_string(), body.clone());
        Ok(body)
    }

    fn replace(
        state: &mut ServerState,
        client_path: &str,
        payload: Option<&[u8]>,
        headers: &Headers,
    ) -> Result<Value> {
        let mut body = Self::parse_body(payload)?;
        let current = state
            .resources
            .get(client_path)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{} not found", client_path)))?;
        state.check_if_match(client_path, headers)?;

        for key in ["id", "_rid", "_self"] {
            body[key] = current[key].clone();
        }
        body["_etag"] = Value::String(state.etag());
        state.resources.insert(client_path.to_string(), body.clone());
        Ok(body)
    }

    fn delete(state: &mut ServerState, client_path: &str, headers: &Headers) -> Result<()> {
        if !state.resources.contains_key(client_path) {
            return Err(Error::NotFound(format!("{} not found", client_path)));
        }
        state.check_if_match(client_path, headers)?;

        let prefix = format!("{}/", client_path);
        state
            .resources
            .retain(|path, _| path != client_path && !path.starts_with(&prefix));
        Ok(())
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn perform_write(
        &self,
        kind: WriteKind,
        address: &ResourceAddress,
        payload: Option<&[u8]>,
        headers: &Headers,
    ) -> Result<Vec<u8>> {
        self.ensure_reachable()?;
        let client_path = Self::item_path(address)?;

        let mut state = self.state.lock().await;
        state.writes.push(RecordedWrite {
            kind,
            client_path: client_path.clone(),
            if_match: headers.get(IF_MATCH).cloned(),
        });

        match kind {
            WriteKind::Create => {
                let body = Self::create(&mut state, address, &client_path, payload)?;
                Ok(serde_json::to_vec(&body)?)
            }
            WriteKind::Replace => {
                let body = Self::replace(&mut state, &client_path, payload, headers)?;
                Ok(serde_json::to_vec(&body)?)
            }
            WriteKind::Delete => {
                Self::delete(&mut state, &client_path, headers)?;
                Ok(Vec::new())
            }
        }
    }

    async fn read(&self, address: &ResourceAddress, _headers: &Headers) -> Result<Vec<u8>> {
        self.ensure_reachable()?;
        let client_path = Self::item_path(address)?;

        let state = self.state.lock().await;
        let resource = state
            .resources
            .get(&client_path)
            .ok_or_else(|| Error::NotFound(format!("{} not found", client_path)))?;
        Ok(serde_json::to_vec(resource)?)
    }

    async fn list(&self, address: &ResourceAddress, _headers: &Headers) -> Result<Vec<Vec<u8>>> {
        self.ensure_reachable()?;
        if !address.is_feed() {
            return Err(Error::InvalidInput(format!("{} is not a feed address", address)));
        }

        let state = self.state.lock().await;
        if let Some(parent) = address.parent() {
            let parent_path = parent.path();
            if !state.resources.contains_key(&parent_path) {
                return Err(Error::NotFound(format!("Parent {} not found", parent_path)));
            }
        }

        let feed_path = address.path();
        let depth = split_segments(&feed_path).len() + 1;
        let prefix = format!("{}/", feed_path);
        state
            .resources
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter(|(path, _)| split_segments(path).len() == depth)
            .map(|(_, resource)| serde_json::to_vec(resource).map_err(Error::from))
            .collect()
    }
}
