//! Persisted queue of writes performed while offline.
//!
//! Every mutation of the queue (append, coalesce, remove, and the mirror
//! under `writes/`) happens while holding one mutex, so coalescing decisions
//! are linearizable with respect to concurrent callers. The network is
//! never awaited with that mutex held.

use blake2::{Blake2s256, Digest};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use offsync_common::{
    validate_id, Error, Headers, LinkPair, ResourceAddress, Result, StorePath, SystemProperties,
};
use offsync_storage::SharedStore;

use crate::cache::LocalCache;
use crate::conflict::{replace_with_strategy, ConflictPolicies};
use crate::oracle::LinkOracle;
use crate::response::{Response, STATUS_CREATED, STATUS_NO_CONTENT, STATUS_OK};
use crate::transport::Transport;
use crate::write::{coalesce, Coalesced, PendingWrite, WriteKind};

const WRITES_DIR: &str = "writes";
const EVENT_CAPACITY: usize = 64;

/// Side-channel notification about replay progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A queued write reached the server.
    Succeeded { kind: WriteKind, client_path: String },
    /// A queued write was rejected or could not be sent; it stays queued.
    Failed {
        kind: WriteKind,
        client_path: String,
        error: String,
    },
    /// A sync cycle finished.
    QueueProcessed { replayed: usize, remaining: usize },
}

/// Summary of one sync cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub replayed: usize,
    pub failed: usize,
    pub remaining: usize,
}

/// Replay state of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    Replaying,
}

#[derive(Debug)]
struct QueueEntry {
    /// Insertion order; kept across coalescing.
    seq: u64,
    /// Bumped whenever coalescing changes the entry.
    revision: u64,
    state: EntryState,
    write: PendingWrite,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: Vec<QueueEntry>,
    next_seq: u64,
}

impl QueueState {
    fn position_of_key(&self, local_cache_path: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.write.local_cache_path == local_cache_path)
    }

    fn position_of_seq(&self, seq: u64) -> Option<usize> {
        self.entries.iter().position(|e| e.seq == seq)
    }

    fn push(&mut self, write: PendingWrite) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(QueueEntry {
            seq,
            revision: 0,
            state: EntryState::Pending,
            write,
        });
    }
}

/// Resets the in-progress flag when a sync cycle ends, however it ends.
struct SyncGuard<'a>(&'a AtomicBool);

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Store key of the persisted record for a coalescing key.
fn record_key(local_cache_path: &str) -> Result<StorePath> {
    let digest = Blake2s256::digest(local_cache_path.as_bytes());
    let name: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    StorePath::root()
        .join(WRITES_DIR)?
        .join(&format!("{}.json", name))
}

/// Ordered, coalescing log of writes waiting to be replayed.
pub struct PendingWriteQueue {
    store: SharedStore,
    oracle: Arc<LinkOracle>,
    cache: Arc<LocalCache>,
    state: Mutex<QueueState>,
    syncing: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
}

impl PendingWriteQueue {
    /// Load the queue persisted in `store`.
    ///
    /// Records that cannot be decoded are skipped and logged.
    pub async fn load(
        store: SharedStore,
        oracle: Arc<LinkOracle>,
        cache: Arc<LocalCache>,
    ) -> Result<Self> {
        let dir = StorePath::root().join(WRITES_DIR)?;
        let entries = match store.list(&dir).await {
            Ok(entries) => entries,
            Err(Error::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };

        let mut writes = Vec::new();
        for entry in entries {
            if entry.is_dir || !entry.name.ends_with(".json") {
                continue;
            }
            let key = dir.join(&entry.name)?;
            let bytes = store.read(&key).await?;
            match serde_json::from_slice::<PendingWrite>(&bytes) {
                Ok(write) => writes.push(write),
                Err(e) => warn!("Skipping unreadable pending write {}: {}", key, e),
            }
        }
        writes.sort_by_key(|w| w.enqueued_at);

        let mut state = QueueState::default();
        for write in writes {
            state.push(write);
        }
        info!("Loaded {} pending writes", state.entries.len());

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            store,
            oracle,
            cache,
            state: Mutex::new(state),
            syncing: AtomicBool::new(false),
            events,
        })
    }

    /// Subscribe to replay notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: SyncEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    async fn persist_record(&self, write: &PendingWrite) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(write)?;
        self.store
            .write(&record_key(&write.local_cache_path)?, bytes)
            .await
    }

    async fn remove_record(&self, local_cache_path: &str) -> Result<()> {
        match self.store.delete(&record_key(local_cache_path)?).await {
            Ok(()) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Coalescing decision for `new` against the entry with the same key, if any.
    fn plan(state: &QueueState, new: &PendingWrite) -> Result<Option<(usize, Coalesced)>> {
        match state.position_of_key(&new.local_cache_path) {
            Some(index) => Ok(Some((index, coalesce(&state.entries[index].write, new.clone())?))),
            None => Ok(None),
        }
    }

    /// Apply a coalescing decision. Returns `true` when the entry was dropped.
    async fn apply(
        &self,
        state: &mut QueueState,
        plan: Option<(usize, Coalesced)>,
        new: PendingWrite,
    ) -> Result<bool> {
        match plan {
            None => {
                debug!("Queued {} of {}", new.kind, new.address);
                self.persist_record(&new).await?;
                state.push(new);
                Ok(false)
            }
            Some((_, Coalesced::KeepExisting)) => Ok(false),
            Some((index, Coalesced::Replace(merged))) => {
                debug!("Coalesced {} of {} into {}", new.kind, new.address, merged.kind);
                self.persist_record(&merged).await?;
                let entry = &mut state.entries[index];
                entry.write = merged;
                entry.revision += 1;
                Ok(false)
            }
            Some((index, Coalesced::Remove)) => {
                let entry = &mut state.entries[index];
                if entry.state == EntryState::Replaying {
                    // The create is already on its way; undo it afterwards.
                    let delete = PendingWrite {
                        kind: WriteKind::Delete,
                        payload: None,
                        ..entry.write.clone()
                    };
                    self.persist_record(&delete).await?;
                    entry.write = delete;
                    entry.revision += 1;
                    return Ok(false);
                }
                debug!("{} of {} cancels the pending create", new.kind, new.address);
                let removed = state.entries.remove(index);
                self.remove_record(&removed.write.local_cache_path).await?;
                Ok(true)
            }
        }
    }

    /// Perform a create or replace against the cache and queue it for replay.
    ///
    /// The returned response is final from the caller's point of view and is
    /// tagged `from_cache`.
    ///
    /// # Errors
    /// - `InvalidId` if the resource id is malformed
    /// - `Conflict` when creating something whose server path is already
    ///   known, or when the write collides with a pending one
    /// - `NotFound` when replacing a resource that is not known locally, or
    ///   creating under a parent that is not
    pub async fn add_create_or_replace(
        &self,
        body: Vec<u8>,
        address: &ResourceAddress,
        replacing: bool,
        extra_headers: Option<Headers>,
    ) -> Result<Response> {
        let client_path = address
            .client_path()
            .ok_or_else(|| Error::InvalidInput(format!("{} is not an item address", address)))?;
        validate_id(address.id().unwrap_or_default())?;

        let mut state = self.state.lock().await;
        let known = self.oracle.server_path(&client_path).await;

        let (kind, server_path) = if replacing {
            let server_path = known.ok_or_else(|| {
                Error::NotFound(format!("{} has never been created or fetched", client_path))
            })?;
            (WriteKind::Replace, server_path)
        } else {
            if let Some(existing) = known {
                return Err(Error::Conflict(format!(
                    "{} already exists as {}",
                    client_path, existing
                )));
            }
            let surrogate = Uuid::new_v4().simple().to_string();
            let server_path = self
                .oracle
                .new_server_path(address, &surrogate)
                .await
                .ok_or_else(|| {
                    Error::NotFound(format!("Parent of {} is not known locally", client_path))
                })?;
            (WriteKind::Create, server_path)
        };

        let new = PendingWrite::new(
            kind,
            Some(body.clone()),
            address.clone(),
            server_path.clone(),
            extra_headers,
        );
        let plan = Self::plan(&state, &new)?;

        if replacing && !self.cache.contains_at(&server_path).await? {
            return Err(Error::NotFound(format!("{} is not cached locally", client_path)));
        }

        self.cache.put(&body, &server_path).await?;
        if kind == WriteKind::Create {
            if !self.oracle.store(&LinkPair::new(&client_path, &server_path)).await {
                return Err(Error::Internal(format!(
                    "Cannot link {} to {}",
                    client_path, server_path
                )));
            }
            self.oracle.persist().await?;
        }
        self.apply(&mut state, plan, new).await?;

        let status = if replacing { STATUS_OK } else { STATUS_CREATED };
        Ok(Response::local(body, status))
    }

    /// Perform a delete against the cache and queue it for replay.
    ///
    /// Pending writes below the deleted resource are dropped. Deleting a
    /// resource whose create was never replayed cancels both.
    ///
    /// # Errors
    /// - `NotFound` if the resource is not known locally
    /// - `Conflict` if the delete collides with a pending write
    pub async fn add_delete(
        &self,
        address: &ResourceAddress,
        extra_headers: Option<Headers>,
    ) -> Result<Response> {
        let client_path = address
            .client_path()
            .ok_or_else(|| Error::InvalidInput(format!("{} is not an item address", address)))?;

        let mut state = self.state.lock().await;
        let server_path = self.oracle.server_path(&client_path).await.ok_or_else(|| {
            Error::NotFound(format!("{} has never been created or fetched", client_path))
        })?;

        let new = PendingWrite::new(
            WriteKind::Delete,
            None,
            address.clone(),
            server_path.clone(),
            extra_headers,
        );
        let plan = Self::plan(&state, &new)?;

        if plan.is_none() && !self.cache.contains_at(&server_path).await? {
            return Err(Error::NotFound(format!("{} is not cached locally", client_path)));
        }

        self.cache.remove_at(&server_path).await?;

        if self.drop_descendants(&mut state, &server_path).await? {
            self.oracle.persist().await?;
        }

        // Entries only shifted down; re-resolve the plan's index.
        let plan = match plan {
            Some((_, outcome)) => state
                .position_of_key(&server_path)
                .map(|index| (index, outcome)),
            None => None,
        };

        if self.apply(&mut state, plan, new).await? {
            self.oracle
                .remove(&LinkPair::new(&client_path, &server_path))
                .await;
            self.oracle.persist().await?;
        }

        Ok(Response::local(Vec::new(), STATUS_NO_CONTENT))
    }

    /// Replay pending writes, ancestors before descendants, one at a time.
    ///
    /// A no-op while another sync is running. The first failure stops the
    /// cycle; the failed write and everything after it stay queued.
    pub async fn sync(
        &self,
        transport: &dyn Transport,
        policies: &ConflictPolicies,
    ) -> Result<SyncReport> {
        if self.syncing.swap(true, Ordering::SeqCst) {
            debug!("Sync already in progress");
            return Ok(SyncReport::default());
        }
        let _guard = SyncGuard(&self.syncing);

        let order: Vec<u64> = {
            let state = self.state.lock().await;
            if state.entries.is_empty() {
                return Ok(SyncReport::default());
            }
            let mut ranked: Vec<(usize, u64)> = state
                .entries
                .iter()
                .map(|e| (e.write.address.kind().depth(), e.seq))
                .collect();
            ranked.sort();
            ranked.into_iter().map(|(_, seq)| seq).collect()
        };
        info!("Replaying {} pending writes", order.len());

        let mut report = SyncReport::default();
        for seq in order {
            let (write, revision) = {
                let mut state = self.state.lock().await;
                let Some(index) = state.position_of_seq(seq) else {
                    continue;
                };
                let entry = &mut state.entries[index];
                entry.state = EntryState::Replaying;
                (entry.write.clone(), entry.revision)
            };
            let client_path = write.address.path();

            let outcome = match Self::replay(transport, policies, &write).await {
                Ok(body) => self.complete(seq, revision, &write, body).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {
                    debug!("Replayed {} of {}", write.kind, client_path);
                    report.replayed += 1;
                    self.notify(SyncEvent::Succeeded {
                        kind: write.kind,
                        client_path,
                    });
                }
                Err(e) => {
                    let mut state = self.state.lock().await;
                    if let Some(index) = state.position_of_seq(seq) {
                        state.entries[index].state = EntryState::Pending;
                    }
                    drop(state);

                    if e.is_connectivity_error() {
                        info!("Replay of {} {} deferred: {}", write.kind, client_path, e);
                    } else {
                        error!("Replay of {} {} failed: {}", write.kind, client_path, e);
                    }
                    report.failed += 1;
                    self.notify(SyncEvent::Failed {
                        kind: write.kind,
                        client_path,
                        error: e.to_string(),
                    });
                    break;
                }
            }
        }

        report.remaining = self.len().await;
        self.notify(SyncEvent::QueueProcessed {
            replayed: report.replayed,
            remaining: report.remaining,
        });
        info!(
            "Sync finished: {} replayed, {} failed, {} remaining",
            report.replayed, report.failed, report.remaining
        );
        Ok(report)
    }

    async fn replay(
        transport: &dyn Transport,
        policies: &ConflictPolicies,
        write: &PendingWrite,
    ) -> Result<Vec<u8>> {
        let headers = write.headers();
        match write.kind {
            WriteKind::Create => {
                transport
                    .perform_write(WriteKind::Create, &write.address, write.payload.as_deref(), &headers)
                    .await
            }
            WriteKind::Replace => {
                let payload = write.payload.as_deref().ok_or_else(|| {
                    Error::Internal(format!("Pending replace of {} has no body", write.address))
                })?;
                let strategy = policies.strategy_for(write.address.kind());
                replace_with_strategy(transport, strategy, &write.address, payload, &headers).await
            }
            WriteKind::Delete => {
                match transport
                    .perform_write(WriteKind::Delete, &write.address, None, &headers)
                    .await
                {
                    Err(Error::NotFound(_)) => {
                        debug!("{} was already gone on the server", write.address);
                        Ok(Vec::new())
                    }
                    other => other,
                }
            }
        }
    }

    /// Record a successful replay.
    async fn complete(
        &self,
        seq: u64,
        revision: u64,
        write: &PendingWrite,
        body: Vec<u8>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let unchanged = state
            .position_of_seq(seq)
            .is_some_and(|index| state.entries[index].revision == revision);
        let client_path = write.address.path();

        match write.kind {
            WriteKind::Create | WriteKind::Replace => {
                let props = SystemProperties::from_bytes(&body)?;
                let server_path = props
                    .server_path()
                    .unwrap_or(write.local_cache_path.as_str())
                    .to_string();

                if write.kind == WriteKind::Create && server_path != write.local_cache_path {
                    self.rebase(&mut state, &write.local_cache_path, &server_path)
                        .await?;
                }
                self.oracle
                    .store(&LinkPair::new(&client_path, &server_path))
                    .await;
                self.oracle.persist().await?;
                if unchanged {
                    self.cache.put(&body, &server_path).await?;
                }
            }
            WriteKind::Delete => {
                // Descendants that were in flight when the delete was queued.
                self.drop_descendants(&mut state, &write.local_cache_path)
                    .await?;
                self.oracle
                    .remove(&LinkPair::new(&client_path, &write.local_cache_path))
                    .await;
                self.oracle.persist().await?;
                self.cache.remove_at(&write.local_cache_path).await?;
            }
        }

        let Some(index) = state.position_of_seq(seq) else {
            return Ok(());
        };
        if unchanged {
            let removed = state.entries.remove(index);
            self.remove_record(&removed.write.local_cache_path).await?;
        } else {
            let entry = &mut state.entries[index];
            entry.state = EntryState::Pending;
            if write.kind == WriteKind::Create && entry.write.kind == WriteKind::Create {
                // The server has it now; later bodies must replace it.
                entry.write.kind = WriteKind::Replace;
                let updated = entry.write.clone();
                self.persist_record(&updated).await?;
            }
        }
        Ok(())
    }

    /// Drop idle entries strictly below `server_path`, with their records.
    ///
    /// Links of dropped creates are forgotten, since the server never saw
    /// them. Returns `true` when a link was removed.
    async fn drop_descendants(&self, state: &mut QueueState, server_path: &str) -> Result<bool> {
        let mut unlinked = false;
        let mut index = 0;
        while index < state.entries.len() {
            let entry = &state.entries[index];
            let is_descendant = entry.write.local_cache_path != server_path
                && entry.write.is_within(server_path);
            if !is_descendant || entry.state != EntryState::Pending {
                index += 1;
                continue;
            }
            let removed = state.entries.remove(index);
            debug!("Dropping pending {} of {}", removed.write.kind, removed.write.address);
            self.remove_record(&removed.write.local_cache_path).await?;
            if removed.write.kind == WriteKind::Create {
                self.oracle
                    .remove(&LinkPair::new(
                        removed.write.address.path(),
                        &removed.write.local_cache_path,
                    ))
                    .await;
                unlinked = true;
            }
        }
        Ok(unlinked)
    }

    /// Move provisional state from a surrogate server path to the real one.
    async fn rebase(&self, state: &mut QueueState, old: &str, new: &str) -> Result<()> {
        info!("Server assigned {} to provisional {}", new, old);
        self.oracle.rebase(old, new).await;
        self.cache.rebase(old, new).await?;

        for entry in state.entries.iter_mut().filter(|e| e.write.is_within(old)) {
            let old_key = entry.write.local_cache_path.clone();
            entry.write.local_cache_path = format!("{}{}", new, &old_key[old.len()..]);
            self.remove_record(&old_key).await?;
            self.persist_record(&entry.write).await?;
        }
        Ok(())
    }

    /// Whether a pending write targets `client_path` or one of its ancestors.
    pub async fn has_pending_for(&self, client_path: &str) -> bool {
        let state = self.state.lock().await;
        state.entries.iter().any(|e| {
            let target = e.write.address.path();
            client_path == target
                || client_path
                    .strip_prefix(&target)
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    /// Pending writes in insertion order.
    pub async fn pending(&self) -> Vec<PendingWrite> {
        let state = self.state.lock().await;
        state.entries.iter().map(|e| e.write.clone()).collect()
    }

    /// Pending writes with their replay state.
    pub async fn entries(&self) -> Vec<(EntryState, PendingWrite)> {
        let state = self.state.lock().await;
        state
            .entries
            .iter()
            .map(|e| (e.state, e.write.clone()))
            .collect()
    }

    /// Number of pending writes.
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// Whether nothing is waiting to be replayed.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether a sync cycle is running.
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Drop every pending write and its persisted record.
    pub async fn purge(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let dropped = state.entries.len();
        state.entries.clear();
        self.store
            .delete_tree(&StorePath::root().join(WRITES_DIR)?)
            .await?;
        warn!("Purged {} pending writes", dropped);
        Ok(())
    }
}
