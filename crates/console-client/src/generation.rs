//! Client surfaces of the two etcd protocol generations.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use console_core::ClusterError;
use console_core::ProbeError;
use console_core::options::{DeleteRequest, PutRequest, RangeRequest};
use console_core::types::{
    EndpointStatus, KeepAliveAck, KeyValue, LeaseGrant, LeaseId, LeaseTimeToLive, Member,
};

use crate::legacy::{LegacyDeleteRequest, LegacyGetRequest, LegacyResponse, LegacySetRequest};

pub type SnapshotChunks = BoxStream<'static, Result<Bytes, ClusterError>>;
pub type KeepAliveAcks = BoxStream<'static, Result<KeepAliveAck, ClusterError>>;

/// Operations of the current (v3) generation.
#[async_trait]
pub trait CurrentKv: Send + Sync {
    async fn range(&self, req: &RangeRequest) -> Result<Vec<KeyValue>, ClusterError>;

    /// Returns the previous entry when `req.prev_kv` is set and the key existed.
    async fn put(&self, req: &PutRequest) -> Result<Option<KeyValue>, ClusterError>;

    async fn delete_range(&self, req: &DeleteRequest) -> Result<Vec<KeyValue>, ClusterError>;

    async fn lease_grant(&self, ttl: i64) -> Result<LeaseGrant, ClusterError>;

    async fn lease_revoke(&self, id: LeaseId) -> Result<(), ClusterError>;

    async fn lease_time_to_live(
        &self,
        id: LeaseId,
        with_keys: bool,
    ) -> Result<LeaseTimeToLive, ClusterError>;

    async fn lease_keep_alive_once(&self, id: LeaseId) -> Result<KeepAliveAck, ClusterError>;

    /// Refresh the lease until it expires or the stream is dropped.
    async fn lease_keep_alive(&self, id: LeaseId) -> Result<KeepAliveAcks, ClusterError>;

    async fn member_list(&self) -> Result<Vec<Member>, ClusterError>;

    /// Status of one member, addressed by its client endpoint.
    async fn status(&self, endpoint: &str) -> Result<EndpointStatus, ClusterError>;

    /// Consistent point-in-time snapshot of the whole keyspace.
    async fn snapshot(&self) -> Result<SnapshotChunks, ClusterError>;

    async fn close(&self) {}
}

/// Operations of the legacy (v2) generation.
#[async_trait]
pub trait LegacyKv: Send + Sync {
    async fn get(&self, req: &LegacyGetRequest) -> Result<LegacyResponse, ClusterError>;

    async fn set(&self, req: &LegacySetRequest) -> Result<LegacyResponse, ClusterError>;

    async fn delete(&self, req: &LegacyDeleteRequest) -> Result<LegacyResponse, ClusterError>;

    async fn members(&self) -> Result<Vec<Member>, ClusterError>;

    async fn close(&self) {}
}

/// Builds client handles for a cluster.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Raw body of `GET <endpoint>/version`.
    async fn fetch_version(&self, endpoint: &str) -> Result<Vec<u8>, ProbeError>;

    async fn connect_legacy(&self, endpoints: &[String])
    -> Result<Arc<dyn LegacyKv>, ClusterError>;

    async fn connect_current(
        &self,
        endpoints: &[String],
    ) -> Result<Arc<dyn CurrentKv>, ClusterError>;
}
