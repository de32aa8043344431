//! Version-aware entry point for every cluster operation.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use console_core::options::{
    Consistency, DeleteOptions, GetOptions, ListOptions, PutOptions, PutRequest, RangeRequest,
};
use console_core::types::{
    ClusterVersion, EndpointStatus, Generation, KeepAliveAck, KeyValue, LeaseGrant, LeaseId,
    LeaseTimeToLive, Member,
};
use console_core::{ClusterError, ConsoleError, OpContext, Result};

use crate::generation::{Connector, CurrentKv, LegacyKv};
use crate::legacy::{LegacyDeleteRequest, LegacyGetRequest, LegacySetRequest, flatten_listing};
use crate::probe;

/// Keep-alive acknowledgements buffered ahead of a slow consumer.
const KEEP_ALIVE_BUFFER: usize = 16;

/// Key read by the per-member health check.
const HEALTH_KEY: &str = "health";

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Wait between client construction attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(2),
        }
    }
}

/// The single client the facade holds, chosen by the probed version.
pub enum ClusterClient {
    Legacy(Arc<dyn LegacyKv>),
    Current {
        kv: Arc<dyn CurrentKv>,
        connector: Arc<dyn Connector>,
    },
}

pub enum KeepAlive {
    Once(KeepAliveAck),
    /// Acknowledgements until the lease expires or the context ends.
    Stream(mpsc::Receiver<Result<KeepAliveAck>>),
}

pub struct ClientFacade {
    version: ClusterVersion,
    endpoints: Vec<String>,
    client: ClusterClient,
}

impl ClientFacade {
    /// Probe the cluster version, then build the matching client.
    ///
    /// Construction is retried every `policy.backoff` until it succeeds or `cancel` fires.
    pub async fn connect(
        connector: Arc<dyn Connector>,
        endpoints: &[String],
        policy: RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(ConsoleError::Config("cannot get etcd endpoints".into()));
        }

        let version = tokio::select! {
            _ = cancel.cancelled() => return Err(ConsoleError::Cancelled),
            probed = probe::probe_version(connector.as_ref(), endpoints) => probed?,
        };
        let generation = version.generation()?;
        info!("etcd {version} detected, using the {generation} client");

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let built = tokio::select! {
                _ = cancel.cancelled() => return Err(ConsoleError::Cancelled),
                built = Self::build(&connector, generation, endpoints) => built,
            };
            match built {
                Ok(client) => {
                    info!("etcd client ready after {attempt} attempt(s)");
                    return Ok(Self {
                        version,
                        endpoints: endpoints.to_vec(),
                        client,
                    });
                }
                Err(e) => {
                    warn!(
                        attempt,
                        error = %e,
                        "{}",
                        ConsoleError::ConnectionPending(endpoints.to_vec())
                    );
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ConsoleError::Cancelled),
                _ = tokio::time::sleep(policy.backoff) => {}
            }
        }
    }

    async fn build(
        connector: &Arc<dyn Connector>,
        generation: Generation,
        endpoints: &[String],
    ) -> Result<ClusterClient> {
        Ok(match generation {
            Generation::Legacy => ClusterClient::Legacy(connector.connect_legacy(endpoints).await?),
            Generation::Current => ClusterClient::Current {
                kv: connector.connect_current(endpoints).await?,
                connector: Arc::clone(connector),
            },
        })
    }

    pub fn version(&self) -> ClusterVersion {
        self.version
    }

    pub fn generation(&self) -> Generation {
        match self.client {
            ClusterClient::Legacy(_) => Generation::Legacy,
            ClusterClient::Current { .. } => Generation::Current,
        }
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    fn unsupported(&self, operation: &'static str) -> ConsoleError {
        ConsoleError::UnsupportedForVersion {
            operation,
            version: self.version,
        }
    }

    fn current(&self, operation: &'static str) -> Result<&Arc<dyn CurrentKv>> {
        match &self.client {
            ClusterClient::Current { kv, .. } => Ok(kv),
            ClusterClient::Legacy(_) => Err(self.unsupported(operation)),
        }
    }

    fn legacy(&self, operation: &'static str) -> Result<&Arc<dyn LegacyKv>> {
        match &self.client {
            ClusterClient::Legacy(kv) => Ok(kv),
            ClusterClient::Current { .. } => Err(self.unsupported(operation)),
        }
    }

    pub async fn get(
        &self,
        key: &str,
        opts: &GetOptions,
        ctx: &OpContext,
    ) -> Result<Vec<KeyValue>> {
        let req = opts.resolve(key)?;
        match &self.client {
            ClusterClient::Current { kv, .. } => {
                ctx.run(async { kv.range(&req).await.map_err(ConsoleError::from) }).await
            }
            ClusterClient::Legacy(kv) => {
                if opts.uses_range_options() {
                    return Err(self.unsupported("range get"));
                }
                let req = LegacyGetRequest {
                    key: key.to_string(),
                    quorum: opts.consistency == Consistency::Linearizable,
                    ..Default::default()
                };
                let resp = ctx.run(async { kv.get(&req).await.map_err(ConsoleError::from) }).await?;
                if resp.node.dir {
                    return Err(ClusterError::Call(format!("{key}: is a directory")).into());
                }
                Ok(vec![resp.node.to_key_value()])
            }
        }
    }

    /// Write `value` under `key`. Returns the previous entry when one was requested.
    pub async fn put(
        &self,
        key: &str,
        value: &str,
        opts: &PutOptions,
        ctx: &OpContext,
    ) -> Result<Option<KeyValue>> {
        if key.is_empty() {
            return Err(ConsoleError::Validation("key is required".into()));
        }
        if value.is_empty() && !opts.ignore_value {
            return Err(ConsoleError::Validation("value is required".into()));
        }
        match &self.client {
            ClusterClient::Current { kv, .. } => {
                if opts.uses_legacy_options() {
                    return Err(self.unsupported("ttl or compare-and-swap put"));
                }
                let req = PutRequest {
                    key: key.as_bytes().to_vec(),
                    value: if opts.ignore_value {
                        Vec::new()
                    } else {
                        value.as_bytes().to_vec()
                    },
                    lease: opts.lease,
                    prev_kv: opts.prev_kv,
                    ignore_value: opts.ignore_value,
                    ignore_lease: opts.ignore_lease,
                };
                let prev = ctx.run(async { kv.put(&req).await.map_err(ConsoleError::from) }).await?;
                Ok(prev.filter(|_| opts.prev_kv).map(|mut kv| {
                    if opts.ignore_value {
                        kv.value.clear();
                    }
                    kv
                }))
            }
            ClusterClient::Legacy(kv) => {
                if opts.uses_current_options() {
                    return Err(self.unsupported("lease put"));
                }
                let req = LegacySetRequest {
                    key: key.to_string(),
                    value: value.to_string(),
                    ttl: opts.ttl,
                    prev_value: opts.prev_value.clone(),
                    prev_index: opts.prev_index,
                };
                let resp = ctx.run(async { kv.set(&req).await.map_err(ConsoleError::from) }).await?;
                Ok(resp.prev_node.map(|n| n.to_key_value()))
            }
        }
    }

    /// Delete `key` (or a range). Returns the removed entries when they were requested.
    pub async fn delete(
        &self,
        key: &str,
        opts: &DeleteOptions,
        ctx: &OpContext,
    ) -> Result<Vec<KeyValue>> {
        let req = opts.resolve(key)?;
        match &self.client {
            ClusterClient::Current { kv, .. } => {
                if opts.uses_legacy_options() {
                    return Err(self.unsupported("directory delete"));
                }
                ctx.run(async { kv.delete_range(&req).await.map_err(ConsoleError::from) }).await
            }
            ClusterClient::Legacy(kv) => {
                if opts.uses_current_options() {
                    return Err(self.unsupported("range delete"));
                }
                let req = LegacyDeleteRequest {
                    key: key.to_string(),
                    dir: opts.dir,
                    recursive: opts.recursive,
                    prev_value: opts.prev_value.clone(),
                    prev_index: opts.prev_index,
                };
                let resp = ctx
                    .run(async { kv.delete(&req).await.map_err(ConsoleError::from) })
                    .await?;
                Ok(resp.prev_node.map(|n| n.to_key_value()).into_iter().collect())
            }
        }
    }

    /// Directory listing, flattened depth first. An empty key lists the root.
    pub async fn list(&self, key: &str, opts: ListOptions, ctx: &OpContext) -> Result<Vec<String>> {
        let kv = self.legacy("ls")?;
        let req = LegacyGetRequest {
            key: if key.is_empty() { "/".into() } else { key.to_string() },
            recursive: opts.recursive,
            sorted: opts.sorted,
            quorum: opts.quorum,
        };
        let resp = ctx.run(async { kv.get(&req).await.map_err(ConsoleError::from) }).await?;
        Ok(flatten_listing(&resp.node, opts.fill_path))
    }

    pub async fn lease_grant(&self, ttl: i64, ctx: &OpContext) -> Result<LeaseGrant> {
        let kv = self.current("lease grant")?;
        if ttl <= 0 {
            return Err(ConsoleError::Validation(format!("bad TTL ({ttl})")));
        }
        ctx.run(async { kv.lease_grant(ttl).await.map_err(ConsoleError::from) }).await
    }

    pub async fn lease_revoke(&self, id: LeaseId, ctx: &OpContext) -> Result<()> {
        let kv = self.current("lease revoke")?;
        if id.is_none() {
            return Err(ConsoleError::Validation("lease ID is required".into()));
        }
        ctx.run(async { kv.lease_revoke(id).await.map_err(ConsoleError::from) }).await
    }

    pub async fn lease_time_to_live(
        &self,
        id: LeaseId,
        with_keys: bool,
        ctx: &OpContext,
    ) -> Result<LeaseTimeToLive> {
        let kv = self.current("lease timetolive")?;
        if id.is_none() {
            return Err(ConsoleError::Validation("lease ID is required".into()));
        }
        ctx.run(async { kv.lease_time_to_live(id, with_keys).await.map_err(ConsoleError::from) })
            .await
    }

    /// Refresh a lease once, or keep refreshing it on a background task.
    ///
    /// The background task stops when `ctx` ends, the receiver is dropped, or the
    /// lease can no longer be refreshed.
    pub async fn lease_keep_alive(
        &self,
        id: LeaseId,
        once: bool,
        ctx: &OpContext,
    ) -> Result<KeepAlive> {
        let kv = self.current("lease keep-alive")?;
        if id.is_none() {
            return Err(ConsoleError::Validation("lease ID is required".into()));
        }
        if once {
            let ack = ctx
                .run(async { kv.lease_keep_alive_once(id).await.map_err(ConsoleError::from) })
                .await?;
            return Ok(KeepAlive::Once(ack));
        }

        let mut acks = ctx
            .run(async { kv.lease_keep_alive(id).await.map_err(ConsoleError::from) })
            .await?;
        let (tx, rx) = mpsc::channel(KEEP_ALIVE_BUFFER);
        let ctx = ctx.child();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ctx.done() => break,
                    _ = tx.closed() => break,
                    next = acks.next() => match next {
                        Some(ack) => {
                            if tx.send(ack.map_err(ConsoleError::from)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            debug!("keep-alive for lease {id} finished");
        });
        Ok(KeepAlive::Stream(rx))
    }

    pub async fn member_list(&self, ctx: &OpContext) -> Result<Vec<Member>> {
        match &self.client {
            ClusterClient::Current { kv, .. } => {
                ctx.run(async { kv.member_list().await.map_err(ConsoleError::from) })
                    .await
            }
            ClusterClient::Legacy(kv) => {
                ctx.run(async { kv.members().await.map_err(ConsoleError::from) })
                    .await
            }
        }
    }

    pub async fn status(&self, endpoint: &str, ctx: &OpContext) -> Result<EndpointStatus> {
        let kv = self.current("status")?;
        ctx.run(async { kv.status(endpoint).await.map_err(ConsoleError::from) }).await
    }

    /// Health of one member through a client pinned to its endpoint.
    ///
    /// A permission-denied answer still proves the member is serving requests.
    pub async fn member_health(&self, endpoint: &str, ctx: &OpContext) -> Result<bool> {
        let ClusterClient::Current { connector, .. } = &self.client else {
            return Err(self.unsupported("member health"));
        };
        let connector = Arc::clone(connector);
        let endpoints = [endpoint.to_string()];
        ctx.run(async move {
            let scoped = match connector.connect_current(&endpoints).await {
                Ok(scoped) => scoped,
                Err(e) => {
                    debug!("Cannot reach member {}: {e}", endpoints[0]);
                    return Ok(false);
                }
            };
            let healthy = match scoped.range(&RangeRequest::single(HEALTH_KEY)).await {
                Ok(_) => true,
                Err(e) if e.is_permission_denied() => true,
                Err(e) => {
                    debug!("Member {} is unhealthy: {e}", endpoints[0]);
                    false
                }
            };
            scoped.close().await;
            Ok(healthy)
        })
        .await
    }

    /// Stream of snapshot chunks from the cluster.
    pub async fn snapshot(&self, ctx: &OpContext) -> Result<BoxStream<'static, Result<Bytes>>> {
        let kv = self.current("snapshot")?;
        let chunks = ctx.run(async { kv.snapshot().await.map_err(ConsoleError::from) }).await?;
        Ok(chunks.map(|chunk| chunk.map_err(ConsoleError::from)).boxed())
    }

    pub async fn close(self) {
        match self.client {
            ClusterClient::Legacy(kv) => kv.close().await,
            ClusterClient::Current { kv, .. } => kv.close().await,
        }
        debug!("etcd client closed");
    }
}
