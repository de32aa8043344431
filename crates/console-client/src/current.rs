//! etcd v3 gRPC client and the production [`Connector`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tracing::debug;

use etcd_client::{
    Client, ConnectOptions, DeleteOptions as EtcdDeleteOptions, GetOptions as EtcdGetOptions,
    LeaseKeepAliveStream, LeaseKeeper, LeaseTimeToLiveOptions, PutOptions as EtcdPutOptions,
    SortOrder as EtcdSortOrder, SortTarget as EtcdSortTarget,
};

use console_core::options::{
    DeleteRequest, PutRequest, RangeMode, RangeRequest, SortOrder, SortTarget,
};
use console_core::types::{
    EndpointStatus, KeepAliveAck, KeyValue, LeaseGrant, LeaseId, LeaseTimeToLive, Member,
};
use console_core::{ClusterError, ProbeError};

use crate::generation::{Connector, CurrentKv, KeepAliveAcks, LegacyKv, SnapshotChunks};
use crate::legacy::HttpLegacyKv;

/// Map an etcd client failure onto the console's cluster error.
pub fn cluster_error(err: etcd_client::Error) -> ClusterError {
    match err {
        etcd_client::Error::GRpcStatus(status) => match status.code() {
            tonic::Code::PermissionDenied | tonic::Code::Unauthenticated => {
                ClusterError::PermissionDenied(status.message().to_string())
            }
            tonic::Code::Unavailable => ClusterError::Unavailable(status.message().to_string()),
            _ => ClusterError::Call(status.message().to_string()),
        },
        etcd_client::Error::TransportError(e) => ClusterError::Unavailable(e.to_string()),
        other => ClusterError::Call(other.to_string()),
    }
}

fn etcd_sort(order: SortOrder, target: SortTarget) -> (EtcdSortTarget, EtcdSortOrder) {
    let target = match target {
        SortTarget::Key => EtcdSortTarget::Key,
        SortTarget::Create => EtcdSortTarget::Create,
        SortTarget::Modify => EtcdSortTarget::Mod,
        SortTarget::Value => EtcdSortTarget::Value,
        SortTarget::Version => EtcdSortTarget::Version,
    };
    let order = match order {
        SortOrder::None => EtcdSortOrder::None,
        SortOrder::Ascend => EtcdSortOrder::Ascend,
        SortOrder::Descend => EtcdSortOrder::Descend,
    };
    (target, order)
}

fn key_value(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: String::from_utf8_lossy(kv.value()).into_owned(),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
        version: kv.version(),
        lease: LeaseId(kv.lease()),
    }
}

/// Interval between refreshes for a lease with `ttl` seconds left.
fn refresh_interval(ttl: i64) -> Duration {
    Duration::from_secs((ttl / 3).max(1) as u64)
}

/// v3 client over `etcd-client`.
pub struct EtcdCurrentKv {
    client: Client,
    options: ConnectOptions,
}

impl EtcdCurrentKv {
    pub async fn connect(
        endpoints: &[String],
        dial_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, ClusterError> {
        let options = ConnectOptions::new()
            .with_connect_timeout(dial_timeout)
            .with_timeout(request_timeout);
        let client = Client::connect(endpoints, Some(options.clone()))
            .await
            .map_err(cluster_error)?;
        let kv = Self { client, options };
        kv.ready().await?;
        Ok(kv)
    }

    /// The channel connects lazily; one round trip proves an endpoint answers.
    async fn ready(&self) -> Result<(), ClusterError> {
        match self.client.clone().status().await.map_err(cluster_error) {
            Ok(_) => Ok(()),
            Err(e) if e.is_permission_denied() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

struct KeepAliveState {
    keeper: LeaseKeeper,
    stream: LeaseKeepAliveStream,
    delay: Duration,
    finished: bool,
}

async fn refresh_once(
    keeper: &mut LeaseKeeper,
    stream: &mut LeaseKeepAliveStream,
    id: LeaseId,
) -> Result<KeepAliveAck, ClusterError> {
    keeper.keep_alive().await.map_err(cluster_error)?;
    match stream.message().await.map_err(cluster_error)? {
        Some(resp) => Ok(KeepAliveAck {
            id: LeaseId(resp.id()),
            ttl: resp.ttl(),
        }),
        None => Err(ClusterError::Call(format!(
            "keep-alive stream for lease {id} closed"
        ))),
    }
}

#[async_trait]
impl CurrentKv for EtcdCurrentKv {
    async fn range(&self, req: &RangeRequest) -> Result<Vec<KeyValue>, ClusterError> {
        let mut opts = EtcdGetOptions::new();
        opts = match &req.range.mode {
            RangeMode::Single => opts,
            RangeMode::Prefix => opts.with_prefix(),
            RangeMode::FromKey => opts.with_from_key(),
            RangeMode::Until(end) => opts.with_range(end.clone()),
        };
        if req.limit > 0 {
            opts = opts.with_limit(req.limit);
        }
        if req.revision > 0 {
            opts = opts.with_revision(req.revision);
        }
        let (target, order) = etcd_sort(req.sort_order, req.sort_target);
        opts = opts.with_sort(target, order);
        if req.keys_only {
            opts = opts.with_keys_only();
        }
        if req.serializable {
            opts = opts.with_serializable();
        }
        let resp = self
            .client
            .clone()
            .get(req.range.key.clone(), Some(opts))
            .await
            .map_err(cluster_error)?;
        Ok(resp.kvs().iter().map(key_value).collect())
    }

    async fn put(&self, req: &PutRequest) -> Result<Option<KeyValue>, ClusterError> {
        let mut opts = EtcdPutOptions::new();
        if !req.lease.is_none() {
            opts = opts.with_lease(req.lease.0);
        }
        if req.prev_kv {
            opts = opts.with_prev_key();
        }
        if req.ignore_value {
            opts = opts.with_ignore_value();
        }
        if req.ignore_lease {
            opts = opts.with_ignore_lease();
        }
        let resp = self
            .client
            .clone()
            .put(req.key.clone(), req.value.clone(), Some(opts))
            .await
            .map_err(cluster_error)?;
        Ok(resp.prev_key().map(key_value))
    }

    async fn delete_range(&self, req: &DeleteRequest) -> Result<Vec<KeyValue>, ClusterError> {
        let mut opts = EtcdDeleteOptions::new();
        opts = match &req.range.mode {
            RangeMode::Single => opts,
            RangeMode::Prefix => opts.with_prefix(),
            RangeMode::FromKey => opts.with_from_key(),
            RangeMode::Until(end) => opts.with_range(end.clone()),
        };
        if req.prev_kv {
            opts = opts.with_prev_key();
        }
        let resp = self
            .client
            .clone()
            .delete(req.range.key.clone(), Some(opts))
            .await
            .map_err(cluster_error)?;
        Ok(resp.prev_kvs().iter().map(key_value).collect())
    }

    async fn lease_grant(&self, ttl: i64) -> Result<LeaseGrant, ClusterError> {
        let resp = self
            .client
            .clone()
            .lease_grant(ttl, None)
            .await
            .map_err(cluster_error)?;
        Ok(LeaseGrant {
            id: LeaseId(resp.id()),
            ttl: resp.ttl(),
        })
    }

    async fn lease_revoke(&self, id: LeaseId) -> Result<(), ClusterError> {
        self.client
            .clone()
            .lease_revoke(id.0)
            .await
            .map_err(cluster_error)?;
        Ok(())
    }

    async fn lease_time_to_live(
        &self,
        id: LeaseId,
        with_keys: bool,
    ) -> Result<LeaseTimeToLive, ClusterError> {
        let opts = with_keys.then(|| LeaseTimeToLiveOptions::new().with_keys());
        let resp = self
            .client
            .clone()
            .lease_time_to_live(id.0, opts)
            .await
            .map_err(cluster_error)?;
        Ok(LeaseTimeToLive {
            id: LeaseId(resp.id()),
            granted_ttl: resp.granted_ttl(),
            ttl: resp.ttl(),
            keys: resp
                .keys()
                .iter()
                .map(|k| String::from_utf8_lossy(k).into_owned())
                .collect(),
        })
    }

    async fn lease_keep_alive_once(&self, id: LeaseId) -> Result<KeepAliveAck, ClusterError> {
        let (mut keeper, mut stream) = self
            .client
            .clone()
            .lease_keep_alive(id.0)
            .await
            .map_err(cluster_error)?;
        let ack = refresh_once(&mut keeper, &mut stream, id).await?;
        if ack.ttl <= 0 {
            return Err(ClusterError::Call(format!(
                "lease {id} expired or has been revoked"
            )));
        }
        Ok(ack)
    }

    async fn lease_keep_alive(&self, id: LeaseId) -> Result<KeepAliveAcks, ClusterError> {
        let (keeper, stream) = self
            .client
            .clone()
            .lease_keep_alive(id.0)
            .await
            .map_err(cluster_error)?;
        let state = KeepAliveState {
            keeper,
            stream,
            delay: Duration::ZERO,
            finished: false,
        };
        let acks = futures::stream::unfold(state, move |mut st| async move {
            if st.finished {
                return None;
            }
            tokio::time::sleep(st.delay).await;
            match refresh_once(&mut st.keeper, &mut st.stream, id).await {
                Ok(ack) => {
                    if ack.ttl <= 0 {
                        st.finished = true;
                    } else {
                        st.delay = refresh_interval(ack.ttl);
                    }
                    Some((Ok(ack), st))
                }
                Err(e) => {
                    st.finished = true;
                    Some((Err(e), st))
                }
            }
        });
        Ok(acks.boxed())
    }

    async fn member_list(&self) -> Result<Vec<Member>, ClusterError> {
        let resp = self
            .client
            .clone()
            .member_list()
            .await
            .map_err(cluster_error)?;
        Ok(resp
            .members()
            .iter()
            .map(|m| Member {
                id: m.id(),
                name: m.name().to_string(),
                client_urls: m.client_urls().to_vec(),
            })
            .collect())
    }

    async fn status(&self, endpoint: &str) -> Result<EndpointStatus, ClusterError> {
        let mut scoped = Client::connect([endpoint], Some(self.options.clone()))
            .await
            .map_err(cluster_error)?;
        let resp = scoped.status().await.map_err(cluster_error)?;
        Ok(EndpointStatus {
            member_id: resp.header().map(|h| h.member_id()).unwrap_or_default(),
            leader: resp.leader(),
            version: resp.version().to_string(),
            db_size: resp.db_size(),
            raft_index: resp.raft_index(),
            raft_term: resp.raft_term(),
        })
    }

    async fn snapshot(&self) -> Result<SnapshotChunks, ClusterError> {
        let streaming = self
            .client
            .clone()
            .snapshot()
            .await
            .map_err(cluster_error)?;
        let chunks = futures::stream::unfold(Some(streaming), |state| async move {
            let mut streaming = state?;
            match streaming.message().await {
                Ok(Some(resp)) => Some((Ok(Bytes::copy_from_slice(resp.blob())), Some(streaming))),
                Ok(None) => None,
                Err(e) => Some((Err(cluster_error(e)), None)),
            }
        });
        Ok(chunks.boxed())
    }
}

/// Production connector: reqwest for `/version` and v2, etcd-client for v3.
pub struct EtcdConnector {
    http: reqwest::Client,
    dial_timeout: Duration,
    request_timeout: Duration,
}

impl EtcdConnector {
    pub fn new(dial_timeout: Duration, request_timeout: Duration) -> Result<Self, ClusterError> {
        let http = reqwest::Client::builder()
            .connect_timeout(dial_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| ClusterError::Call(e.to_string()))?;
        Ok(Self {
            http,
            dial_timeout,
            request_timeout,
        })
    }
}

#[async_trait]
impl Connector for EtcdConnector {
    async fn fetch_version(&self, endpoint: &str) -> Result<Vec<u8>, ProbeError> {
        let mut url = url::Url::parse(endpoint)
            .map_err(|e| ProbeError::InvalidEndpoint(format!("{endpoint}: {e}")))?;
        url.set_path("/version");
        debug!("Probing {url}");
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ProbeError::Unreachable(format!("{endpoint}: {e}")))?;
        if !resp.status().is_success() {
            return Err(ProbeError::Malformed(format!(
                "{endpoint} answered {}",
                resp.status()
            )));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| ProbeError::Unreachable(format!("{endpoint}: {e}")))?;
        Ok(body.to_vec())
    }

    async fn connect_legacy(
        &self,
        endpoints: &[String],
    ) -> Result<Arc<dyn LegacyKv>, ClusterError> {
        let kv = HttpLegacyKv::new(endpoints, self.request_timeout)?;
        kv.ping().await?;
        Ok(Arc::new(kv))
    }

    async fn connect_current(
        &self,
        endpoints: &[String],
    ) -> Result<Arc<dyn CurrentKv>, ClusterError> {
        let kv = EtcdCurrentKv::connect(endpoints, self.dial_timeout, self.request_timeout).await?;
        Ok(Arc::new(kv))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_status_is_recognised() {
        let err = cluster_error(etcd_client::Error::GRpcStatus(tonic::Status::permission_denied(
            "etcdserver: permission denied",
        )));
        assert!(err.is_permission_denied());
    }

    #[test]
    fn other_status_codes_carried_verbatim() {
        let err = cluster_error(etcd_client::Error::GRpcStatus(tonic::Status::not_found(
            "etcdserver: requested lease not found",
        )));
        assert_eq!(err.to_string(), "etcdserver: requested lease not found");
    }

    #[test]
    fn refresh_every_third_of_ttl() {
        assert_eq!(refresh_interval(30), Duration::from_secs(10));
        assert_eq!(refresh_interval(2), Duration::from_secs(1));
    }

    #[test]
    fn sort_mapping() {
        let (target, order) = etcd_sort(SortOrder::Descend, SortTarget::Modify);
        assert!(matches!(target, EtcdSortTarget::Mod));
        assert!(matches!(order, EtcdSortOrder::Descend));
    }
}
