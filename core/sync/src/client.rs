//! Read/write entry point that switches between the server and the local
//! cache depending on reachability.

use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use offsync_common::{
    validate_id, Error, Headers, LinkPair, ResourceAddress, Result, SystemProperties,
};
use offsync_storage::{SharedStore, StoreRegistry};

use crate::cache::LocalCache;
use crate::config::SyncConfig;
use crate::conflict::{replace_with_strategy, ConflictPolicies};
use crate::oracle::LinkOracle;
use crate::queue::{PendingWriteQueue, SyncEvent, SyncReport};
use crate::response::{ListResponse, Response, STATUS_CREATED, STATUS_NO_CONTENT, STATUS_OK};
use crate::scheduler::ReachabilityStatus;
use crate::transport::SharedTransport;
use crate::write::WriteKind;

/// Offline-capable client over a [`Transport`](crate::transport::Transport).
pub struct SyncClient {
    oracle: Arc<LinkOracle>,
    cache: Arc<LocalCache>,
    queue: Arc<PendingWriteQueue>,
    transport: SharedTransport,
    policies: Arc<ConflictPolicies>,
    status: watch::Sender<ReachabilityStatus>,
    sync_on_reachable: bool,
}

impl SyncClient {
    /// Open a client over `store`, restoring links and pending writes.
    pub async fn open(
        store: SharedStore,
        transport: SharedTransport,
        policies: ConflictPolicies,
    ) -> Result<Self> {
        let oracle = Arc::new(LinkOracle::new(store.clone()));
        oracle.restore().await?;
        let cache = Arc::new(LocalCache::new(store.clone(), oracle.clone()));
        let queue = Arc::new(PendingWriteQueue::load(store, oracle.clone(), cache.clone()).await?);

        let (status, _) = watch::channel(ReachabilityStatus::Unknown);
        Ok(Self {
            oracle,
            cache,
            queue,
            transport,
            policies: Arc::new(policies),
            status,
            sync_on_reachable: true,
        })
    }

    /// Open a client as described by `config`.
    ///
    /// The conflict policies apply the configured default strategy to
    /// every kind.
    pub async fn from_config(
        config: &SyncConfig,
        registry: &StoreRegistry,
        transport: SharedTransport,
    ) -> Result<Self> {
        let store = config.open_store(registry)?;
        let client = Self::open(store, transport, config.policies()).await?;
        Ok(client.with_sync_on_reachable(config.sync_on_reachable))
    }

    /// Whether regaining the network starts a sync.
    pub fn with_sync_on_reachable(mut self, enabled: bool) -> Self {
        self.sync_on_reachable = enabled;
        self
    }

    /// Replace the conflict policies.
    pub fn with_policies(mut self, policies: ConflictPolicies) -> Self {
        self.policies = Arc::new(policies);
        self
    }

    pub fn oracle(&self) -> &Arc<LinkOracle> {
        &self.oracle
    }

    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<PendingWriteQueue> {
        &self.queue
    }

    pub fn policies(&self) -> &ConflictPolicies {
        &self.policies
    }

    /// Current reachability.
    pub fn reachability(&self) -> ReachabilityStatus {
        *self.status.borrow()
    }

    /// Watch reachability changes applied to this client.
    pub fn watch_reachability(&self) -> watch::Receiver<ReachabilityStatus> {
        self.status.subscribe()
    }

    /// Whether requests go to the server.
    pub fn is_online(&self) -> bool {
        self.reachability().is_online()
    }

    /// Subscribe to replay notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.queue.subscribe()
    }

    /// Record the current reachability.
    pub fn set_reachability(&self, status: ReachabilityStatus) -> ReachabilityStatus {
        let previous = self.status.send_replace(status);
        if previous != status {
            info!("Reachability changed: {:?} -> {:?}", previous, status);
        }
        previous
    }

    /// Record the current reachability and start a sync on reconnect.
    ///
    /// Returns the spawned sync task, if any.
    pub fn reachability_changed(
        self: &Arc<Self>,
        status: ReachabilityStatus,
    ) -> Option<JoinHandle<Result<SyncReport>>> {
        let previous = self.set_reachability(status);
        if status != ReachabilityStatus::Reachable
            || previous == ReachabilityStatus::Reachable
            || !self.sync_on_reachable
        {
            return None;
        }
        let client = Arc::clone(self);
        Some(tokio::spawn(async move { client.sync().await }))
    }

    /// Replay pending writes.
    pub async fn sync(&self) -> Result<SyncReport> {
        self.queue.sync(self.transport.as_ref(), &self.policies).await
    }

    /// Drop every pending write, cached resource and link.
    pub async fn purge(&self) -> Result<()> {
        self.queue.purge().await?;
        self.cache.purge_all().await?;
        self.oracle.purge_all().await?;
        warn!("Purged local state");
        Ok(())
    }

    /// Writes and reads of `client_path` stay local while offline or while
    /// the path (or an ancestor) has writes waiting.
    async fn stays_local(&self, client_path: &str) -> bool {
        !self.is_online() || self.queue.has_pending_for(client_path).await
    }

    /// Remember a resource returned by the server.
    async fn record(&self, address: &ResourceAddress, body: &[u8]) -> Result<()> {
        let props = SystemProperties::from_bytes(body)?;
        let Some(server_path) = props.server_path() else {
            warn!("Response for {} carries no server path", address);
            return Ok(());
        };
        self.oracle
            .store(&LinkPair::new(address.path(), server_path))
            .await;
        self.oracle.persist().await?;
        self.cache.put(body, server_path).await
    }

    /// Forget a resource the server no longer has.
    async fn forget(&self, address: &ResourceAddress) -> Result<()> {
        let client_path = address.path();
        if let Some(server_path) = self.oracle.server_path(&client_path).await {
            self.cache.remove_at(&server_path).await?;
            self.oracle
                .remove(&LinkPair::new(&client_path, &server_path))
                .await;
            self.oracle.persist().await?;
        }
        Ok(())
    }

    fn item_address(address: &ResourceAddress) -> Result<()> {
        if address.is_feed() {
            return Err(Error::InvalidInput(format!(
                "{} is a feed, expected an item",
                address
            )));
        }
        validate_id(address.id().unwrap_or_default())
    }

    /// Create a resource in `feed`. The id is taken from the body.
    ///
    /// # Errors
    /// - `InvalidId` if the body's id is malformed
    /// - `Conflict` if the resource already exists
    /// - `NotFound` if the parent does not exist
    pub async fn create(
        &self,
        body: Vec<u8>,
        feed: &ResourceAddress,
        extra_headers: Option<Headers>,
    ) -> Result<Response> {
        if !feed.is_feed() {
            return Err(Error::InvalidInput(format!("{} is not a feed", feed)));
        }
        let id = SystemProperties::from_bytes(&body)?.id;
        validate_id(&id)?;
        let address = feed.with_id(id);

        if self.stays_local(&address.path()).await {
            return self
                .queue
                .add_create_or_replace(body, &address, false, extra_headers)
                .await;
        }

        let headers = extra_headers.clone().unwrap_or_default();
        match self
            .transport
            .perform_write(WriteKind::Create, &address, Some(&body), &headers)
            .await
        {
            Ok(created) => {
                self.record(&address, &created).await?;
                Ok(Response::remote(created, STATUS_CREATED))
            }
            Err(e) if e.is_connectivity_error() => {
                info!("Create of {} queued: {}", address, e);
                self.queue
                    .add_create_or_replace(body, &address, false, extra_headers)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// Replace an existing resource.
    ///
    /// A version mismatch is handled by the conflict strategy registered
    /// for the resource kind.
    pub async fn replace(
        &self,
        body: Vec<u8>,
        address: &ResourceAddress,
        extra_headers: Option<Headers>,
    ) -> Result<Response> {
        Self::item_address(address)?;

        if self.stays_local(&address.path()).await {
            return self
                .queue
                .add_create_or_replace(body, address, true, extra_headers)
                .await;
        }

        let headers = extra_headers.clone().unwrap_or_default();
        let strategy = self.policies.strategy_for(address.kind());
        match replace_with_strategy(self.transport.as_ref(), strategy, address, &body, &headers).await
        {
            Ok(replaced) => {
                self.record(address, &replaced).await?;
                Ok(Response::remote(replaced, STATUS_OK))
            }
            Err(e) if e.is_connectivity_error() => {
                info!("Replace of {} queued: {}", address, e);
                self.queue
                    .add_create_or_replace(body, address, true, extra_headers)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a resource and everything below it.
    pub async fn delete(
        &self,
        address: &ResourceAddress,
        extra_headers: Option<Headers>,
    ) -> Result<Response> {
        Self::item_address(address)?;

        if self.stays_local(&address.path()).await {
            return self.queue.add_delete(address, extra_headers).await;
        }

        let headers = extra_headers.clone().unwrap_or_default();
        match self
            .transport
            .perform_write(WriteKind::Delete, address, None, &headers)
            .await
        {
            Ok(_) => {
                self.forget(address).await?;
                Ok(Response::remote(Vec::new(), STATUS_NO_CONTENT))
            }
            Err(Error::NotFound(message)) => {
                self.forget(address).await?;
                Err(Error::NotFound(message))
            }
            Err(e) if e.is_connectivity_error() => {
                info!("Delete of {} queued: {}", address, e);
                self.queue.add_delete(address, extra_headers).await
            }
            Err(e) => Err(e),
        }
    }

    async fn cached(&self, address: &ResourceAddress) -> Result<Response> {
        match self.cache.get(address).await? {
            Some(body) => Ok(Response::local(body, STATUS_OK)),
            None if self.is_online() => Err(Error::NotFound(format!("{} is not cached", address))),
            None => Err(Error::Unreachable(format!(
                "{} is not cached and the server is unreachable",
                address
            ))),
        }
    }

    /// Read a resource.
    pub async fn get(
        &self,
        address: &ResourceAddress,
        extra_headers: Option<Headers>,
    ) -> Result<Response> {
        Self::item_address(address)?;

        if self.stays_local(&address.path()).await {
            return self.cached(address).await;
        }

        let headers = extra_headers.unwrap_or_default();
        match self.transport.read(address, &headers).await {
            Ok(body) => {
                self.record(address, &body).await?;
                Ok(Response::remote(body, STATUS_OK))
            }
            Err(Error::NotFound(message)) => {
                self.forget(address).await?;
                Err(Error::NotFound(message))
            }
            Err(e) if e.is_connectivity_error() => {
                debug!("Serving {} from cache: {}", address, e);
                self.cached(address).await
            }
            Err(e) => Err(e),
        }
    }

    async fn cached_feed(&self, feed: &ResourceAddress) -> Result<ListResponse> {
        match self.cache.list(feed).await? {
            Some(items) => Ok(ListResponse {
                items,
                from_cache: true,
            }),
            None => Err(Error::Unreachable(format!("{} has not been listed before", feed))),
        }
    }

    /// List the items of a feed.
    pub async fn list(
        &self,
        feed: &ResourceAddress,
        extra_headers: Option<Headers>,
    ) -> Result<ListResponse> {
        if !feed.is_feed() {
            return Err(Error::InvalidInput(format!("{} is not a feed", feed)));
        }

        if self.stays_local(&feed.path()).await {
            return self.cached_feed(feed).await;
        }

        let headers = extra_headers.unwrap_or_default();
        match self.transport.list(feed, &headers).await {
            Ok(items) => {
                for item in &items {
                    let props = SystemProperties::from_bytes(item)?;
                    if let Some(server_path) = props.server_path() {
                        self.oracle
                            .store(&LinkPair::new(feed.with_id(&props.id).path(), server_path))
                            .await;
                    }
                }
                self.oracle.persist().await?;
                self.cache.put_feed(feed, &items).await?;
                Ok(ListResponse {
                    items,
                    from_cache: false,
                })
            }
            Err(e) if e.is_connectivity_error() => {
                debug!("Serving {} from cache: {}", feed, e);
                self.cached_feed(feed).await
            }
            Err(e) => Err(e),
        }
    }
}
