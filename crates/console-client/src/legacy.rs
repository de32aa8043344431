//! etcd v2 key tree API over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use console_core::ClusterError;
use console_core::types::{KeyValue, Member};

use crate::generation::LegacyKv;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LegacyNode {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub dir: bool,
    #[serde(default)]
    pub nodes: Vec<LegacyNode>,
    #[serde(default, rename = "createdIndex")]
    pub created_index: u64,
    #[serde(default, rename = "modifiedIndex")]
    pub modified_index: u64,
    #[serde(default)]
    pub ttl: Option<i64>,
}

impl LegacyNode {
    pub fn to_key_value(&self) -> KeyValue {
        KeyValue {
            key: self.key.clone(),
            value: self.value.clone().unwrap_or_default(),
            create_revision: self.created_index as i64,
            mod_revision: self.modified_index as i64,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LegacyResponse {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub node: LegacyNode,
    #[serde(default, rename = "prevNode")]
    pub prev_node: Option<LegacyNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyGetRequest {
    pub key: String,
    pub recursive: bool,
    pub sorted: bool,
    pub quorum: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacySetRequest {
    pub key: String,
    pub value: String,
    pub ttl: Option<u64>,
    pub prev_value: Option<String>,
    pub prev_index: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyDeleteRequest {
    pub key: String,
    pub dir: bool,
    pub recursive: bool,
    pub prev_value: Option<String>,
    pub prev_index: Option<u64>,
}

/// Flatten a listing into key paths, depth first in response order.
///
/// The listed directory itself is not part of the result. With `fill_path`,
/// directory entries end in `/`.
pub fn flatten_listing(root: &LegacyNode, fill_path: bool) -> Vec<String> {
    fn walk(node: &LegacyNode, fill_path: bool, out: &mut Vec<String>) {
        for child in &node.nodes {
            if child.dir && fill_path {
                out.push(format!("{}/", child.key));
            } else {
                out.push(child.key.clone());
            }
            walk(child, fill_path, out);
        }
    }

    if !root.dir {
        return vec![root.key.clone()];
    }
    let mut out = Vec::new();
    walk(root, fill_path, &mut out);
    out
}

fn key_path(key: &str) -> String {
    if key.starts_with('/') {
        key.to_string()
    } else {
        format!("/{key}")
    }
}

#[derive(Debug, Deserialize)]
struct LegacyErrorBody {
    #[serde(rename = "errorCode")]
    error_code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    cause: String,
}

#[derive(Debug, Deserialize)]
struct LegacyMembers {
    #[serde(default)]
    members: Vec<LegacyMember>,
}

#[derive(Debug, Deserialize)]
struct LegacyMember {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default, rename = "clientURLs")]
    client_urls: Vec<String>,
}

/// v2 client that fails over across endpoints in order.
pub struct HttpLegacyKv {
    http: reqwest::Client,
    endpoints: Vec<String>,
}

impl HttpLegacyKv {
    pub fn new(endpoints: &[String], request_timeout: Duration) -> Result<Self, ClusterError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ClusterError::Call(e.to_string()))?;
        Ok(Self {
            http,
            endpoints: endpoints
                .iter()
                .map(|e| e.trim_end_matches('/').to_string())
                .collect(),
        })
    }

    /// Succeeds once any endpoint answers `/version`.
    pub async fn ping(&self) -> Result<(), ClusterError> {
        self.send(|http, base| http.get(format!("{base}/version")))
            .await
            .map(|_| ())
    }

    async fn send<F>(&self, build: F) -> Result<reqwest::Response, ClusterError>
    where
        F: Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder,
    {
        let mut last = None;
        for base in &self.endpoints {
            match build(&self.http, base).send().await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_connect() || e.is_timeout() => {
                    debug!("etcd endpoint {base} unreachable: {e}");
                    last = Some(ClusterError::Unavailable(format!("{base}: {e}")));
                }
                Err(e) => return Err(ClusterError::Call(e.to_string())),
            }
        }
        Err(last.unwrap_or_else(|| ClusterError::Unavailable("no endpoints configured".into())))
    }

    async fn keys_call<F>(&self, build: F) -> Result<LegacyResponse, ClusterError>
    where
        F: Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder,
    {
        let resp = self.send(build).await?;
        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| ClusterError::Call(e.to_string()))?;
        if status.is_success() {
            return serde_json::from_slice(&body)
                .map_err(|e| ClusterError::Call(format!("bad v2 response: {e}")));
        }
        let message = match serde_json::from_slice::<LegacyErrorBody>(&body) {
            Ok(err) if err.cause.is_empty() => format!("{}: {}", err.error_code, err.message),
            Ok(err) => format!("{}: {} ({})", err.error_code, err.message, err.cause),
            Err(_) => format!("etcd answered {status}"),
        };
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ClusterError::PermissionDenied(message));
        }
        Err(ClusterError::Call(message))
    }
}

#[async_trait]
impl LegacyKv for HttpLegacyKv {
    async fn get(&self, req: &LegacyGetRequest) -> Result<LegacyResponse, ClusterError> {
        let path = key_path(&req.key);
        self.keys_call(|http, base| {
            http.get(format!("{base}/v2/keys{path}")).query(&[
                ("recursive", req.recursive),
                ("sorted", req.sorted),
                ("quorum", req.quorum),
            ])
        })
        .await
    }

    async fn set(&self, req: &LegacySetRequest) -> Result<LegacyResponse, ClusterError> {
        let path = key_path(&req.key);
        let mut form = vec![("value", req.value.clone())];
        if let Some(ttl) = req.ttl {
            form.push(("ttl", ttl.to_string()));
        }
        let mut query = Vec::new();
        if let Some(prev) = &req.prev_value {
            query.push(("prevValue", prev.clone()));
        }
        if let Some(index) = req.prev_index {
            query.push(("prevIndex", index.to_string()));
        }
        self.keys_call(|http, base| {
            http.put(format!("{base}/v2/keys{path}"))
                .query(&query)
                .form(&form)
        })
        .await
    }

    async fn delete(&self, req: &LegacyDeleteRequest) -> Result<LegacyResponse, ClusterError> {
        let path = key_path(&req.key);
        let mut query = vec![
            ("dir", req.dir.to_string()),
            ("recursive", req.recursive.to_string()),
        ];
        if let Some(prev) = &req.prev_value {
            query.push(("prevValue", prev.clone()));
        }
        if let Some(index) = req.prev_index {
            query.push(("prevIndex", index.to_string()));
        }
        self.keys_call(|http, base| http.delete(format!("{base}/v2/keys{path}")).query(&query))
            .await
    }

    async fn members(&self) -> Result<Vec<Member>, ClusterError> {
        let resp = self
            .send(|http, base| http.get(format!("{base}/v2/members")))
            .await?;
        if !resp.status().is_success() {
            return Err(ClusterError::Call(format!(
                "member list answered {}",
                resp.status()
            )));
        }
        let body: LegacyMembers = resp
            .json()
            .await
            .map_err(|e| ClusterError::Call(format!("bad member list: {e}")))?;
        body.members
            .into_iter()
            .map(|m| {
                let id = u64::from_str_radix(&m.id, 16)
                    .map_err(|_| ClusterError::Call(format!("bad member id {}", m.id)))?;
                Ok(Member {
                    id,
                    name: m.name,
                    client_urls: m.client_urls,
                })
            })
            .collect()
    }
}
