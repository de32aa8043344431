use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::error::{ConsoleError, ProbeError, Result};

/// Semantic version reported by the cluster's `/version` endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl ClusterVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Client generation spoken by a cluster of this version.
    pub fn generation(&self) -> std::result::Result<Generation, ProbeError> {
        match self.major {
            2 => Ok(Generation::Legacy),
            m if m >= 3 => Ok(Generation::Current),
            m => Err(ProbeError::UnsupportedMajor(m)),
        }
    }
}

impl fmt::Display for ClusterVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Generation {
    /// etcd v2 key tree API.
    Legacy,
    /// etcd v3 gRPC API.
    Current,
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Generation::Legacy => write!(f, "v2"),
            Generation::Current => write!(f, "v3"),
        }
    }
}

/// 64-bit lease identifier, rendered as zero-padded hex.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub i64);

impl LeaseId {
    pub const NONE: LeaseId = LeaseId(0);

    /// Parse a hex lease id. An empty string means "no lease".
    pub fn from_hex(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(LeaseId::NONE);
        }
        i64::from_str_radix(raw, 16).map(LeaseId).map_err(|_| {
            ConsoleError::Validation(format!("bad lease ID ({raw}), expecting ID in hex"))
        })
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Key/value entry in a shape shared by both client generations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    pub create_revision: i64,
    pub mod_revision: i64,
    pub version: i64,
    pub lease: LeaseId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: u64,
    pub name: String,
    pub client_urls: Vec<String>,
}

impl Member {
    /// Endpoint used to reach this member, if it advertises one.
    pub fn client_endpoint(&self) -> Option<&str> {
        self.client_urls.first().map(String::as_str)
    }

    pub fn hex_id(&self) -> String {
        format!("{:x}", self.id)
    }
}

/// Status reported by a single member endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStatus {
    pub member_id: u64,
    pub leader: u64,
    pub version: String,
    pub db_size: i64,
    pub raft_index: u64,
    pub raft_term: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberStatus {
    pub id: String,
    pub name: String,
    pub endpoint: String,
    pub is_leader: bool,
    pub is_healthy: bool,
    pub is_connected: bool,
    pub db_size: i64,
    pub version: String,
}

impl MemberStatus {
    /// Record carrying only the member's identity.
    pub fn identity(member: &Member) -> Self {
        Self {
            id: member.hex_id(),
            name: member.name.clone(),
            endpoint: member.client_endpoint().unwrap_or_default().to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub total: usize,
    pub connected: usize,
    pub healthy: usize,
    pub leader: Option<String>,
}

impl StatusSummary {
    pub fn from_statuses(statuses: &[MemberStatus]) -> Self {
        Self {
            total: statuses.len(),
            connected: statuses.iter().filter(|s| s.is_connected).count(),
            healthy: statuses.iter().filter(|s| s.is_healthy).count(),
            leader: statuses
                .iter()
                .find(|s| s.is_leader)
                .map(|s| s.name.clone()),
        }
    }
}

impl fmt::Display for StatusSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} members reporting",
            self.connected, self.total
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseGrant {
    pub id: LeaseId,
    pub ttl: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseTimeToLive {
    pub id: LeaseId,
    pub granted_ttl: i64,
    pub ttl: i64,
    pub keys: Vec<String>,
}

impl LeaseTimeToLive {
    pub fn is_expired(&self) -> bool {
        self.granted_ttl == 0 && self.ttl == -1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveAck {
    pub id: LeaseId,
    pub ttl: i64,
}

/// A backup archive present in the catalog directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub name: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Local>,
}

/// Newest first, the order the console renders backups in.
pub fn sort_newest_first(backups: &mut [BackupArtifact]) {
    backups.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.name.cmp(&b.name))
    });
}
