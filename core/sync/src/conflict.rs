//! Optimistic-concurrency conflict resolution for replaces.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use offsync_common::{Error, Headers, ResourceAddress, ResourceKind, Result, SystemProperties, IF_MATCH};

use crate::transport::Transport;
use crate::write::WriteKind;

/// Resolver for [`ConflictStrategy::Custom`]: `(local, remote) -> resolved`.
pub type ConflictResolverFn = Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>;

/// What to do when a replace is rejected because the server holds a newer version.
#[derive(Clone)]
pub enum ConflictStrategy {
    /// Surface the mismatch as `Error::Conflict`.
    None,
    /// Retry once without a version precondition; the local body wins.
    Overwrite,
    /// Fetch the remote body, resolve, and retry once against the remote version.
    Custom(ConflictResolverFn),
}

impl ConflictStrategy {
    /// Build a custom strategy from a closure.
    pub fn custom<F>(resolve: F) -> Self
    where
        F: Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    {
        ConflictStrategy::Custom(Arc::new(resolve))
    }
}

impl fmt::Debug for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictStrategy::None => f.write_str("None"),
            ConflictStrategy::Overwrite => f.write_str("Overwrite"),
            ConflictStrategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Serializable subset of [`ConflictStrategy`], used in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    None,
    Overwrite,
}

impl From<StrategyKind> for ConflictStrategy {
    fn from(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::None => ConflictStrategy::None,
            StrategyKind::Overwrite => ConflictStrategy::Overwrite,
        }
    }
}

/// Conflict strategies registered per resource kind.
///
/// Set up once when the client is built and only read afterwards.
#[derive(Debug, Clone)]
pub struct ConflictPolicies {
    default: ConflictStrategy,
    by_kind: HashMap<ResourceKind, ConflictStrategy>,
}

impl ConflictPolicies {
    /// Policies applying `default` to every kind.
    pub fn new(default: ConflictStrategy) -> Self {
        Self {
            default,
            by_kind: HashMap::new(),
        }
    }

    /// Register a strategy for one resource kind.
    pub fn with(mut self, kind: ResourceKind, strategy: ConflictStrategy) -> Self {
        self.by_kind.insert(kind, strategy);
        self
    }

    /// Strategy for a resource kind.
    pub fn strategy_for(&self, kind: ResourceKind) -> &ConflictStrategy {
        self.by_kind.get(&kind).unwrap_or(&self.default)
    }
}

impl Default for ConflictPolicies {
    fn default() -> Self {
        Self::new(ConflictStrategy::None)
    }
}

/// Replace a resource, resolving a version mismatch with `strategy`.
///
/// When `body` carries an `_etag`, the replace is sent with `If-Match` and
/// a precondition failure is handled by the strategy. Without a version tag
/// the replace is sent unconditionally.
///
/// # Errors
/// - `Conflict` if the mismatch is unresolved (strategy `None`, or a
///   second mismatch after resolving)
/// - any transport error
pub async fn replace_with_strategy(
    transport: &dyn Transport,
    strategy: &ConflictStrategy,
    address: &ResourceAddress,
    body: &[u8],
    headers: &Headers,
) -> Result<Vec<u8>> {
    let props = SystemProperties::from_bytes(body)?;
    let Some(etag) = props.etag() else {
        return transport
            .perform_write(WriteKind::Replace, address, Some(body), headers)
            .await;
    };

    let mut conditional = headers.clone();
    conditional.insert(IF_MATCH.to_string(), etag.to_string());

    match transport
        .perform_write(WriteKind::Replace, address, Some(body), &conditional)
        .await
    {
        Err(e) if e.is_precondition_failure() => {
            debug!("Replace of {} rejected: {}", address, e);
        }
        other => return other,
    }

    match strategy {
        ConflictStrategy::None => Err(Error::Conflict(format!(
            "{} was modified on the server",
            address
        ))),
        ConflictStrategy::Overwrite => {
            info!("Overwriting remote version of {}", address);
            let mut unconditional = headers.clone();
            unconditional.remove(IF_MATCH);
            transport
                .perform_write(WriteKind::Replace, address, Some(body), &unconditional)
                .await
        }
        ConflictStrategy::Custom(resolve) => {
            let remote_bytes = transport.read(address, headers).await?;
            let remote: Value = serde_json::from_slice(&remote_bytes)?;
            let local: Value = serde_json::from_slice(body)?;

            let remote_etag = SystemProperties::from_bytes(&remote_bytes)?
                .etag()
                .map(String::from)
                .ok_or_else(|| {
                    Error::Internal(format!("Remote copy of {} has no version tag", address))
                })?;

            let mut resolved = resolve(&local, &remote);
            if !resolved.is_object() {
                return Err(Error::InvalidInput(
                    "Conflict resolver must return an object".to_string(),
                ));
            }
            resolved["_etag"] = Value::String(remote_etag.clone());
            let resolved_bytes = serde_json::to_vec(&resolved)?;

            let mut retry = headers.clone();
            retry.insert(IF_MATCH.to_string(), remote_etag);
            match transport
                .perform_write(WriteKind::Replace, address, Some(&resolved_bytes), &retry)
                .await
            {
                Err(e) if e.is_precondition_failure() => {
                    warn!("Resolved replace of {} conflicted again", address);
                    Err(Error::Conflict(format!(
                        "{} was modified again while resolving",
                        address
                    )))
                }
                other => other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use async_trait::async_trait;
    use serde_json::json;

    async fn setup() -> (MemoryTransport, ResourceAddress, Value) {
        let transport = MemoryTransport::new();
        let address = ResourceAddress::database("Foo");
        let created = transport
            .perform_write(
                WriteKind::Create,
                &address,
                Some(br#"{"id":"Foo","count":1}"#),
                &Headers::new(),
            )
            .await
            .unwrap();
        let stale: Value = serde_json::from_slice(&created).unwrap();

        // Another writer moves the server copy forward.
        transport
            .modify("dbs/Foo", |r| r["count"] = json!(10))
            .await
            .unwrap();
        (transport, address, stale)
    }

    fn with_count(base: &Value, count: i64) -> Vec<u8> {
        let mut body = base.clone();
        body["count"] = json!(count);
        serde_json::to_vec(&body).unwrap()
    }

    #[tokio::test]
    async fn test_none_surfaces_conflict() {
        let (transport, address, stale) = setup().await;
        let result = replace_with_strategy(
            &transport,
            &ConflictStrategy::None,
            &address,
            &with_count(&stale, 2),
            &Headers::new(),
        )
        .await;

        assert!(matches!(result, Err(Error::Conflict(_))));
        assert_eq!(transport.writes().await.len(), 2);
    }

    #[tokio::test]
    async fn test_overwrite_retries_once_without_precondition() {
        let (transport, address, stale) = setup().await;
        replace_with_strategy(
            &transport,
            &ConflictStrategy::Overwrite,
            &address,
            &with_count(&stale, 2),
            &Headers::new(),
        )
        .await
        .unwrap();

        let writes = transport.writes().await;
        let replaces: Vec<_> = writes.iter().filter(|w| w.kind == WriteKind::Replace).collect();
        assert_eq!(replaces.len(), 2);
        assert!(replaces[0].if_match.is_some());
        assert_eq!(replaces[1].if_match, None);
        assert_eq!(transport.resource("dbs/Foo").await.unwrap()["count"], 2);
    }

    #[tokio::test]
    async fn test_custom_resolves_against_remote_version() {
        let (transport, address, stale) = setup().await;
        let strategy = ConflictStrategy::custom(|local, remote| {
            let mut merged = remote.clone();
            let sum = local["count"].as_i64().unwrap_or(0) + remote["count"].as_i64().unwrap_or(0);
            merged["count"] = json!(sum);
            merged
        });

        let response =
            replace_with_strategy(&transport, &strategy, &address, &with_count(&stale, 2), &Headers::new())
                .await
                .unwrap();

        let stored: Value = serde_json::from_slice(&response).unwrap();
        assert_eq!(stored["count"], 12);
        let writes = transport.writes().await;
        let last = writes.last().unwrap();
        assert!(last.if_match.is_some());
        assert_ne!(last.if_match.as_deref(), stale["_etag"].as_str());
    }

    /// Moves the server copy forward right after every read.
    struct RacingTransport {
        inner: MemoryTransport,
    }

    #[async_trait]
    impl Transport for RacingTransport {
        async fn perform_write(
            &self,
            kind: WriteKind,
            address: &ResourceAddress,
            payload: Option<&[u8]>,
            headers: &Headers,
        ) -> Result<Vec<u8>> {
            self.inner.perform_write(kind, address, payload, headers).await
        }

        async fn read(&self, address: &ResourceAddress, headers: &Headers) -> Result<Vec<u8>> {
            let current = self.inner.read(address, headers).await?;
            self.inner
                .modify(&address.path(), |r| r["count"] = json!(100))
                .await?;
            Ok(current)
        }

        async fn list(&self, address: &ResourceAddress, headers: &Headers) -> Result<Vec<Vec<u8>>> {
            self.inner.list(address, headers).await
        }
    }

    #[tokio::test]
    async fn test_custom_gives_up_after_second_conflict() {
        let (inner, address, stale) = setup().await;
        let transport = RacingTransport { inner };
        let strategy = ConflictStrategy::custom(|_, remote| remote.clone());

        let result =
            replace_with_strategy(&transport, &strategy, &address, &with_count(&stale, 2), &Headers::new())
                .await;

        assert!(matches!(result, Err(Error::Conflict(_))));
        let writes = transport.inner.writes().await;
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[0].kind, WriteKind::Create);
        assert!(writes[1..].iter().all(|w| w.kind == WriteKind::Replace));
        assert_eq!(transport.inner.resource("dbs/Foo").await.unwrap()["count"], 100);
    }

    #[tokio::test]
    async fn test_without_etag_replaces_unconditionally() {
        let (transport, address, _) = setup().await;
        replace_with_strategy(
            &transport,
            &ConflictStrategy::None,
            &address,
            br#"{"id":"Foo","count":3}"#,
            &Headers::new(),
        )
        .await
        .unwrap();
        assert_eq!(transport.writes().await.last().unwrap().if_match, None);
    }

    #[test]
    fn test_policies_fall_back_to_default() {
        let policies = ConflictPolicies::new(ConflictStrategy::None)
            .with(ResourceKind::Document, ConflictStrategy::Overwrite);
        assert!(matches!(
            policies.strategy_for(ResourceKind::Document),
            ConflictStrategy::Overwrite
        ));
        assert!(matches!(
            policies.strategy_for(ResourceKind::Collection),
            ConflictStrategy::None
        ));
    }

    #[test]
    fn test_strategy_kind_serialization() {
        let kind: StrategyKind = serde_json::from_str("\"overwrite\"").unwrap();
        assert_eq!(kind, StrategyKind::Overwrite);
        assert!(matches!(ConflictStrategy::from(kind), ConflictStrategy::Overwrite));
    }
}
