//! In-memory cluster for local testing.
//!
//! Both client generations are served from one keyspace. Members can be marked
//! unreachable or stalled, and the snapshot stream can be slowed down or cut short.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use console_core::options::{
    DeleteRequest, KeyRange, PutRequest, RangeMode, RangeRequest, SortOrder, SortTarget,
};
use console_core::types::{
    EndpointStatus, KeepAliveAck, KeyValue, LeaseGrant, LeaseId, LeaseTimeToLive, Member,
};
use console_core::{ClusterError, ProbeError};

use crate::generation::{Connector, CurrentKv, KeepAliveAcks, LegacyKv, SnapshotChunks};
use crate::legacy::{
    LegacyDeleteRequest, LegacyGetRequest, LegacyNode, LegacyResponse, LegacySetRequest,
};

const SNAPSHOT_CHUNK: usize = 1024;
const FIRST_LEASE_ID: i64 = 0x694d_7a1b_0000_0001;

/// How a member answers the `health` key read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberHealth {
    Serving,
    PermissionDenied,
    Failing,
}

struct MemoryMember {
    member: Member,
    reachable: bool,
    stalled: bool,
    health: MemberHealth,
}

#[derive(Clone)]
struct Entry {
    value: Vec<u8>,
    create_revision: i64,
    mod_revision: i64,
    version: i64,
    lease: i64,
}

struct State {
    version: String,
    members: Vec<MemoryMember>,
    leader: u64,
    kv: BTreeMap<Vec<u8>, Entry>,
    revision: i64,
    leases: BTreeMap<i64, i64>,
    next_lease: i64,
    snapshot: Vec<u8>,
    snapshot_fail_after: Option<usize>,
    snapshot_chunk_delay: Duration,
    keep_alive_interval: Duration,
    connect_failures: usize,
    member_list_fails: bool,
}

pub struct MemoryCluster {
    state: Mutex<State>,
    calls: AtomicUsize,
}

impl MemoryCluster {
    /// Empty cluster reporting `version` from `/version`.
    pub fn new(version: &str) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                version: version.to_string(),
                members: Vec::new(),
                leader: 0,
                kv: BTreeMap::new(),
                revision: 1,
                leases: BTreeMap::new(),
                next_lease: FIRST_LEASE_ID,
                snapshot: Vec::new(),
                snapshot_fail_after: None,
                snapshot_chunk_delay: Duration::ZERO,
                keep_alive_interval: Duration::from_millis(10),
                connect_failures: 0,
                member_list_fails: false,
            }),
            calls: AtomicUsize::new(0),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of key, lease and cluster calls served so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn add_member(&self, id: u64, name: &str, endpoint: &str) {
        let mut state = self.state();
        if state.members.is_empty() {
            state.leader = id;
        }
        state.members.push(MemoryMember {
            member: Member {
                id,
                name: name.to_string(),
                client_urls: vec![endpoint.to_string()],
            },
            reachable: true,
            stalled: false,
            health: MemberHealth::Serving,
        });
    }

    pub fn set_leader(&self, id: u64) {
        self.state().leader = id;
    }

    pub fn set_unreachable(&self, endpoint: &str) {
        self.with_member(endpoint, |m| m.reachable = false);
    }

    /// Status calls to this member never answer.
    pub fn set_stalled(&self, endpoint: &str) {
        self.with_member(endpoint, |m| m.stalled = true);
    }

    pub fn set_health(&self, endpoint: &str, health: MemberHealth) {
        self.with_member(endpoint, |m| m.health = health);
    }

    fn with_member(&self, endpoint: &str, f: impl FnOnce(&mut MemoryMember)) {
        let mut state = self.state();
        if let Some(m) = state
            .members
            .iter_mut()
            .find(|m| m.member.client_endpoint() == Some(endpoint))
        {
            f(m);
        }
    }

    pub fn set_snapshot(&self, data: Vec<u8>) {
        self.state().snapshot = data;
    }

    /// The snapshot stream errors once `bytes` have been sent.
    pub fn fail_snapshot_after(&self, bytes: usize) {
        self.state().snapshot_fail_after = Some(bytes);
    }

    pub fn set_snapshot_chunk_delay(&self, delay: Duration) {
        self.state().snapshot_chunk_delay = delay;
    }

    pub fn set_keep_alive_interval(&self, interval: Duration) {
        self.state().keep_alive_interval = interval;
    }

    /// The next `n` client constructions fail as unavailable.
    pub fn fail_connects(&self, n: usize) {
        self.state().connect_failures = n;
    }

    /// Membership listings fail as unavailable from now on.
    pub fn fail_member_list(&self) {
        self.state().member_list_fails = true;
    }

    pub fn insert(&self, key: &str, value: &str) {
        let mut state = self.state();
        state.revision += 1;
        let revision = state.revision;
        state.kv.insert(
            key.as_bytes().to_vec(),
            Entry {
                value: value.as_bytes().to_vec(),
                create_revision: revision,
                mod_revision: revision,
                version: 1,
                lease: 0,
            },
        );
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.state()
            .kv
            .get(key.as_bytes())
            .map(|e| String::from_utf8_lossy(&e.value).into_owned())
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            cluster: Arc::clone(self),
        })
    }

    fn member_state(&self, endpoint: &str) -> Option<(bool, bool, MemberHealth)> {
        self.state()
            .members
            .iter()
            .find(|m| m.member.client_endpoint() == Some(endpoint))
            .map(|m| (m.reachable, m.stalled, m.health))
    }

    fn members(&self) -> Result<Vec<Member>, ClusterError> {
        let state = self.state();
        if state.member_list_fails {
            return Err(ClusterError::Unavailable("etcdserver: no leader".into()));
        }
        Ok(state.members.iter().map(|m| m.member.clone()).collect())
    }

    fn take_connect_failure(&self) -> bool {
        let mut state = self.state();
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return true;
        }
        false
    }
}

fn key_value(key: &[u8], entry: &Entry) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(key).into_owned(),
        value: String::from_utf8_lossy(&entry.value).into_owned(),
        create_revision: entry.create_revision,
        mod_revision: entry.mod_revision,
        version: entry.version,
        lease: LeaseId(entry.lease),
    }
}

fn in_range(key: &[u8], range: &KeyRange) -> bool {
    match &range.mode {
        RangeMode::Single => key == range.key.as_slice(),
        RangeMode::Prefix => key.starts_with(&range.key),
        RangeMode::FromKey => key >= range.key.as_slice(),
        RangeMode::Until(end) => key >= range.key.as_slice() && key < end.as_slice(),
    }
}

fn lease_not_found() -> ClusterError {
    ClusterError::Call("etcdserver: requested lease not found".into())
}

pub struct MemoryConnector {
    cluster: Arc<MemoryCluster>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn fetch_version(&self, endpoint: &str) -> Result<Vec<u8>, ProbeError> {
        if let Some((false, _, _)) = self.cluster.member_state(endpoint) {
            return Err(ProbeError::Unreachable(format!(
                "{endpoint}: connection refused"
            )));
        }
        let version = self.cluster.state().version.clone();
        Ok(format!(r#"{{"etcdserver":"{version}","etcdcluster":"{version}"}}"#).into_bytes())
    }

    async fn connect_legacy(
        &self,
        _endpoints: &[String],
    ) -> Result<Arc<dyn LegacyKv>, ClusterError> {
        if self.cluster.take_connect_failure() {
            return Err(ClusterError::Unavailable("connection refused".into()));
        }
        Ok(Arc::new(MemoryLegacyKv {
            cluster: Arc::clone(&self.cluster),
        }))
    }

    async fn connect_current(
        &self,
        endpoints: &[String],
    ) -> Result<Arc<dyn CurrentKv>, ClusterError> {
        if self.cluster.take_connect_failure() {
            return Err(ClusterError::Unavailable("connection refused".into()));
        }
        let scope = match endpoints {
            [single] => {
                if let Some((false, _, _)) = self.cluster.member_state(single) {
                    return Err(ClusterError::Unavailable(format!(
                        "{single}: connection refused"
                    )));
                }
                Some(single.clone())
            }
            _ => None,
        };
        Ok(Arc::new(MemoryCurrentKv {
            cluster: Arc::clone(&self.cluster),
            scope,
        }))
    }
}

/// v3 view of the cluster, optionally pinned to one member.
pub struct MemoryCurrentKv {
    cluster: Arc<MemoryCluster>,
    scope: Option<String>,
}

impl MemoryCurrentKv {
    fn scoped_health(&self, req: &RangeRequest) -> Option<Result<Vec<KeyValue>, ClusterError>> {
        let endpoint = self.scope.as_deref()?;
        if req.range.key != b"health" {
            return None;
        }
        let (_, _, health) = self.cluster.member_state(endpoint)?;
        Some(match health {
            MemberHealth::Serving => Ok(Vec::new()),
            MemberHealth::PermissionDenied => Err(ClusterError::PermissionDenied(
                "etcdserver: permission denied".into(),
            )),
            MemberHealth::Failing => {
                Err(ClusterError::Call("etcdserver: unhealthy cluster".into()))
            }
        })
    }
}

#[async_trait]
impl CurrentKv for MemoryCurrentKv {
    async fn range(&self, req: &RangeRequest) -> Result<Vec<KeyValue>, ClusterError> {
        self.cluster.record_call();
        if let Some(answer) = self.scoped_health(req) {
            return answer;
        }
        let state = self.cluster.state();
        let mut kvs: Vec<KeyValue> = state
            .kv
            .iter()
            .filter(|(k, _)| in_range(k, &req.range))
            .map(|(k, e)| key_value(k, e))
            .collect();
        match req.sort_target {
            SortTarget::Key => {}
            SortTarget::Create => kvs.sort_by_key(|kv| kv.create_revision),
            SortTarget::Modify => kvs.sort_by_key(|kv| kv.mod_revision),
            SortTarget::Value => kvs.sort_by(|a, b| a.value.cmp(&b.value)),
            SortTarget::Version => kvs.sort_by_key(|kv| kv.version),
        }
        if req.sort_order == SortOrder::Descend {
            kvs.reverse();
        }
        if req.limit > 0 {
            kvs.truncate(req.limit as usize);
        }
        if req.keys_only {
            for kv in &mut kvs {
                kv.value.clear();
            }
        }
        Ok(kvs)
    }

    async fn put(&self, req: &PutRequest) -> Result<Option<KeyValue>, ClusterError> {
        self.cluster.record_call();
        let mut state = self.cluster.state();
        if !req.lease.is_none() && !state.leases.contains_key(&req.lease.0) {
            return Err(lease_not_found());
        }
        let prev = state.kv.get(&req.key).cloned();
        if (req.ignore_value || req.ignore_lease) && prev.is_none() {
            return Err(ClusterError::Call("etcdserver: key not found".into()));
        }
        state.revision += 1;
        let revision = state.revision;
        let entry = Entry {
            value: match (&prev, req.ignore_value) {
                (Some(p), true) => p.value.clone(),
                _ => req.value.clone(),
            },
            create_revision: prev.as_ref().map_or(revision, |p| p.create_revision),
            mod_revision: revision,
            version: prev.as_ref().map_or(1, |p| p.version + 1),
            lease: match (&prev, req.ignore_lease) {
                (Some(p), true) => p.lease,
                _ => req.lease.0,
            },
        };
        state.kv.insert(req.key.clone(), entry);
        Ok(prev
            .filter(|_| req.prev_kv)
            .map(|p| key_value(&req.key, &p)))
    }

    async fn delete_range(&self, req: &DeleteRequest) -> Result<Vec<KeyValue>, ClusterError> {
        self.cluster.record_call();
        let mut state = self.cluster.state();
        let doomed: Vec<Vec<u8>> = state
            .kv
            .keys()
            .filter(|k| in_range(k, &req.range))
            .cloned()
            .collect();
        if !doomed.is_empty() {
            state.revision += 1;
        }
        let mut prev = Vec::new();
        for key in doomed {
            if let Some(entry) = state.kv.remove(&key) {
                prev.push(key_value(&key, &entry));
            }
        }
        Ok(if req.prev_kv { prev } else { Vec::new() })
    }

    async fn lease_grant(&self, ttl: i64) -> Result<LeaseGrant, ClusterError> {
        self.cluster.record_call();
        let mut state = self.cluster.state();
        let id = state.next_lease;
        state.next_lease += 1;
        state.leases.insert(id, ttl);
        Ok(LeaseGrant {
            id: LeaseId(id),
            ttl,
        })
    }

    async fn lease_revoke(&self, id: LeaseId) -> Result<(), ClusterError> {
        self.cluster.record_call();
        let mut state = self.cluster.state();
        if state.leases.remove(&id.0).is_none() {
            return Err(lease_not_found());
        }
        state.kv.retain(|_, e| e.lease != id.0);
        Ok(())
    }

    async fn lease_time_to_live(
        &self,
        id: LeaseId,
        with_keys: bool,
    ) -> Result<LeaseTimeToLive, ClusterError> {
        self.cluster.record_call();
        let state = self.cluster.state();
        let Some(granted) = state.leases.get(&id.0).copied() else {
            return Ok(LeaseTimeToLive {
                id,
                granted_ttl: 0,
                ttl: -1,
                keys: Vec::new(),
            });
        };
        let keys = if with_keys {
            state
                .kv
                .iter()
                .filter(|(_, e)| e.lease == id.0)
                .map(|(k, _)| String::from_utf8_lossy(k).into_owned())
                .collect()
        } else {
            Vec::new()
        };
        Ok(LeaseTimeToLive {
            id,
            granted_ttl: granted,
            ttl: granted,
            keys,
        })
    }

    async fn lease_keep_alive_once(&self, id: LeaseId) -> Result<KeepAliveAck, ClusterError> {
        self.cluster.record_call();
        match self.cluster.state().leases.get(&id.0) {
            Some(ttl) => Ok(KeepAliveAck { id, ttl: *ttl }),
            None => Err(ClusterError::Call(format!(
                "lease {id} expired or has been revoked"
            ))),
        }
    }

    async fn lease_keep_alive(&self, id: LeaseId) -> Result<KeepAliveAcks, ClusterError> {
        self.cluster.record_call();
        let interval = self.cluster.state().keep_alive_interval;
        let cluster = Arc::clone(&self.cluster);
        let acks = futures::stream::unfold(Some(cluster), move |state| async move {
            let cluster = state?;
            tokio::time::sleep(interval).await;
            let ttl = cluster.state().leases.get(&id.0).copied();
            match ttl {
                Some(ttl) => Some((Ok(KeepAliveAck { id, ttl }), Some(cluster))),
                None => Some((Ok(KeepAliveAck { id, ttl: 0 }), None)),
            }
        });
        Ok(acks.boxed())
    }

    async fn member_list(&self) -> Result<Vec<Member>, ClusterError> {
        self.cluster.record_call();
        self.cluster.members()
    }

    async fn status(&self, endpoint: &str) -> Result<EndpointStatus, ClusterError> {
        self.cluster.record_call();
        let status = {
            let state = self.cluster.state();
            state
                .members
                .iter()
                .find(|m| m.member.client_endpoint() == Some(endpoint))
                .map(|m| {
                    let status = EndpointStatus {
                        member_id: m.member.id,
                        leader: state.leader,
                        version: state.version.clone(),
                        db_size: state.kv.values().map(|e| e.value.len() as i64).sum(),
                        raft_index: state.revision as u64,
                        raft_term: 2,
                    };
                    (m.reachable, m.stalled, status)
                })
        };
        match status {
            Some((_, true, _)) => std::future::pending().await,
            Some((true, false, status)) => Ok(status),
            _ => Err(ClusterError::Unavailable(format!(
                "{endpoint}: connection refused"
            ))),
        }
    }

    async fn snapshot(&self) -> Result<SnapshotChunks, ClusterError> {
        self.cluster.record_call();
        let (data, fail_after, delay) = {
            let state = self.cluster.state();
            (
                Bytes::from(state.snapshot.clone()),
                state.snapshot_fail_after,
                state.snapshot_chunk_delay,
            )
        };
        let chunks = futures::stream::unfold(Some(0usize), move |offset| {
            let data = data.clone();
            async move {
                let offset = offset?;
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if fail_after.is_some_and(|limit| offset >= limit) {
                    return Some((
                        Err(ClusterError::Call("snapshot stream interrupted".into())),
                        None,
                    ));
                }
                if offset >= data.len() {
                    return None;
                }
                let mut end = (offset + SNAPSHOT_CHUNK).min(data.len());
                if let Some(limit) = fail_after {
                    end = end.min(limit.max(offset + 1));
                }
                Some((Ok(data.slice(offset..end)), Some(end)))
            }
        });
        Ok(chunks.boxed())
    }
}

/// v2 view of the cluster, with directories implied by `/` in key names.
pub struct MemoryLegacyKv {
    cluster: Arc<MemoryCluster>,
}

fn dir_prefix(key: &str) -> String {
    if key.ends_with('/') {
        key.to_string()
    } else {
        format!("{key}/")
    }
}

fn leaf_node(key: &str, entry: &Entry) -> LegacyNode {
    LegacyNode {
        key: key.to_string(),
        value: Some(String::from_utf8_lossy(&entry.value).into_owned()),
        created_index: entry.create_revision as u64,
        modified_index: entry.mod_revision as u64,
        ..Default::default()
    }
}

fn dir_node(kv: &BTreeMap<Vec<u8>, Entry>, key: &str, recursive: bool) -> LegacyNode {
    let prefix = dir_prefix(key);
    let mut children: BTreeMap<String, bool> = BTreeMap::new();
    for stored in kv.keys() {
        let stored = String::from_utf8_lossy(stored);
        if let Some(rest) = stored.strip_prefix(prefix.as_str()) {
            match rest.split_once('/') {
                Some((name, _)) => {
                    children.insert(name.to_string(), true);
                }
                None => {
                    children.entry(rest.to_string()).or_insert(false);
                }
            }
        }
    }
    let nodes = children
        .into_iter()
        .filter_map(|(name, is_dir)| {
            let child = format!("{prefix}{name}");
            if is_dir {
                Some(if recursive {
                    dir_node(kv, &child, true)
                } else {
                    LegacyNode {
                        key: child,
                        dir: true,
                        ..Default::default()
                    }
                })
            } else {
                kv.get(child.as_bytes()).map(|e| leaf_node(&child, e))
            }
        })
        .collect();
    LegacyNode {
        key: if key == "/" {
            key.to_string()
        } else {
            key.trim_end_matches('/').to_string()
        },
        dir: true,
        nodes,
        ..Default::default()
    }
}

fn is_dir(kv: &BTreeMap<Vec<u8>, Entry>, key: &str) -> bool {
    let prefix = dir_prefix(key);
    kv.keys().any(|k| k.starts_with(prefix.as_bytes()))
}

fn key_not_found(key: &str) -> ClusterError {
    ClusterError::Call(format!("100: Key not found ({key})"))
}

#[async_trait]
impl LegacyKv for MemoryLegacyKv {
    async fn get(&self, req: &LegacyGetRequest) -> Result<LegacyResponse, ClusterError> {
        self.cluster.record_call();
        let state = self.cluster.state();
        let node = if let Some(entry) = state.kv.get(req.key.as_bytes()) {
            leaf_node(&req.key, entry)
        } else if req.key == "/" || is_dir(&state.kv, &req.key) {
            dir_node(&state.kv, &req.key, req.recursive)
        } else {
            return Err(key_not_found(&req.key));
        };
        Ok(LegacyResponse {
            action: "get".into(),
            node,
            prev_node: None,
        })
    }

    async fn set(&self, req: &LegacySetRequest) -> Result<LegacyResponse, ClusterError> {
        self.cluster.record_call();
        let mut state = self.cluster.state();
        let prev = state.kv.get(req.key.as_bytes()).cloned();
        if let Some(expected) = &req.prev_value {
            let current = prev
                .as_ref()
                .map(|p| String::from_utf8_lossy(&p.value).into_owned());
            if current.as_deref() != Some(expected.as_str()) {
                return Err(ClusterError::Call(format!(
                    "101: Compare failed ([{expected}]) ({})",
                    req.key
                )));
            }
        }
        state.revision += 1;
        let revision = state.revision;
        let entry = Entry {
            value: req.value.as_bytes().to_vec(),
            create_revision: prev.as_ref().map_or(revision, |p| p.create_revision),
            mod_revision: revision,
            version: prev.as_ref().map_or(1, |p| p.version + 1),
            lease: 0,
        };
        let node = leaf_node(&req.key, &entry);
        state.kv.insert(req.key.as_bytes().to_vec(), entry);
        Ok(LegacyResponse {
            action: "set".into(),
            node,
            prev_node: prev.map(|p| leaf_node(&req.key, &p)),
        })
    }

    async fn delete(&self, req: &LegacyDeleteRequest) -> Result<LegacyResponse, ClusterError> {
        self.cluster.record_call();
        let mut state = self.cluster.state();
        if let Some(entry) = state.kv.remove(req.key.as_bytes()) {
            let prev = leaf_node(&req.key, &entry);
            return Ok(LegacyResponse {
                action: "delete".into(),
                node: LegacyNode {
                    key: req.key.clone(),
                    ..Default::default()
                },
                prev_node: Some(prev),
            });
        }
        if !is_dir(&state.kv, &req.key) {
            return Err(key_not_found(&req.key));
        }
        if !req.dir && !req.recursive {
            return Err(ClusterError::Call(format!("102: Not a file ({})", req.key)));
        }
        if !req.recursive {
            return Err(ClusterError::Call(format!(
                "108: Directory not empty ({})",
                req.key
            )));
        }
        let prefix = dir_prefix(&req.key);
        state.kv.retain(|k, _| !k.starts_with(prefix.as_bytes()));
        state.revision += 1;
        Ok(LegacyResponse {
            action: "delete".into(),
            node: LegacyNode {
                key: req.key.clone(),
                dir: true,
                ..Default::default()
            },
            prev_node: Some(LegacyNode {
                key: req.key.clone(),
                dir: true,
                ..Default::default()
            }),
        })
    }

    async fn members(&self) -> Result<Vec<Member>, ClusterError> {
        self.cluster.record_call();
        self.cluster.members()
    }
}
