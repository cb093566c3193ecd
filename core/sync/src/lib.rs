//! Offline-first sync core.
//!
//! This crate lets an application keep reading and writing hierarchical
//! resources while the server is unreachable:
//! - `LinkOracle`: bidirectional client path ↔ server path mapping
//! - `LocalCache`: resources stored under their server paths
//! - `PendingWriteQueue`: coalescing, persisted log of offline writes,
//!   replayed ancestors first once the network returns
//! - `ConflictStrategy`: what to do when a replayed replace hits a newer
//!   server version
//! - `SyncClient`: routes each call to the server or to the local side
//! - `SyncScheduler`: drives sync from reachability changes

pub mod cache;
pub mod client;
pub mod config;
pub mod conflict;
pub mod oracle;
pub mod queue;
pub mod response;
pub mod scheduler;
pub mod transport;
pub mod write;

pub use cache::LocalCache;
pub use client::SyncClient;
pub use config::SyncConfig;
pub use conflict::{
    replace_with_strategy, ConflictPolicies, ConflictResolverFn, ConflictStrategy, StrategyKind,
};
pub use oracle::LinkOracle;
pub use queue::{EntryState, PendingWriteQueue, SyncEvent, SyncReport};
pub use response::{ListResponse, Response, STATUS_CREATED, STATUS_NO_CONTENT, STATUS_OK};
pub use scheduler::{ReachabilityStatus, SchedulerRequest, SyncScheduler, SyncSchedulerHandle};
pub use transport::{MemoryTransport, RecordedWrite, SharedTransport, Transport};
pub use write::{coalesce, Coalesced, PendingWrite, WriteKind};
