//! Version probe and legacy key API against a canned HTTP responder on localhost.

use std::time::Duration;

use console_client::{ClientFacade, Connector, EtcdConnector, RetryPolicy};
use console_core::options::{GetOptions, ListOptions};
use console_core::types::{ClusterVersion, Generation};
use console_core::{OpContext, ProbeError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const LISTING: &str = r#"{"action":"get","node":{"key":"/app","dir":true,"nodes":[
    {"key":"/app/config","dir":true,"nodes":[{"key":"/app/config/port","value":"8080"}]},
    {"key":"/app/name","value":"web","createdIndex":6,"modifiedIndex":6}]}}"#;

const LEAF: &str = r#"{"action":"get","node":
    {"key":"/app/name","value":"web","createdIndex":6,"modifiedIndex":9}}"#;

/// Serve `route(path)` to every connection with `Connection: close`.
async fn serve(route: fn(&str) -> (u16, String)) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                let head = String::from_utf8_lossy(&buf);
                let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                let (status, body) = route(&path);
                let reply = format!(
                    "HTTP/1.1 {status} OK\r\n\
                     Content-Type: application/json\r\n\
                     Content-Length: {}\r\n\
                     Connection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    format!("http://{addr}")
}

fn etcd2(path: &str) -> (u16, String) {
    if path.starts_with("/version") {
        (200, r#"{"etcdserver":"2.3.8","etcdcluster":"2.3.0"}"#.into())
    } else if path.starts_with("/v2/keys/app/name") {
        (200, LEAF.into())
    } else if path.starts_with("/v2/keys/app") {
        (200, LISTING.into())
    } else {
        (
            404,
            r#"{"errorCode":100,"message":"Key not found","cause":"/missing","index":9}"#.into(),
        )
    }
}

fn prefixed_version(_path: &str) -> (u16, String) {
    (200, r#"{"etcdserver":"v3.5","etcdcluster":"3.5.0"}"#.into())
}

fn connector() -> EtcdConnector {
    EtcdConnector::new(Duration::from_secs(2), Duration::from_secs(2)).unwrap()
}

#[tokio::test]
async fn fetches_version_body() {
    let endpoint = serve(prefixed_version).await;
    let body = connector().fetch_version(&endpoint).await.unwrap();
    let version = console_client::probe::parse_version_payload(&body).unwrap();
    assert_eq!(version, ClusterVersion::new(3, 5, 0));
}

#[tokio::test]
async fn probe_skips_unreachable_endpoint() {
    let live = serve(etcd2).await;
    let dead = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        format!("http://{}", listener.local_addr().unwrap())
    };
    let version = console_client::probe::probe_version(&connector(), &[dead, live])
        .await
        .unwrap();
    assert_eq!(version.major, 2);
}

#[tokio::test]
async fn invalid_endpoint_rejected() {
    let err = connector().fetch_version("not a url").await.unwrap_err();
    assert!(matches!(err, ProbeError::InvalidEndpoint(_)));
}

#[tokio::test]
async fn legacy_cluster_over_http() {
    let endpoint = serve(etcd2).await;
    let facade = ClientFacade::connect(
        std::sync::Arc::new(connector()),
        &[endpoint],
        RetryPolicy::default(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(facade.generation(), Generation::Legacy);

    let ctx = OpContext::with_timeout(Duration::from_secs(5));
    let opts = ListOptions {
        recursive: true,
        fill_path: true,
        ..Default::default()
    };
    let keys = facade.list("/app", opts, &ctx).await.unwrap();
    assert_eq!(keys, vec!["/app/config/", "/app/config/port", "/app/name"]);

    let kvs = facade
        .get("/app/name", &GetOptions::default(), &ctx)
        .await
        .unwrap();
    assert_eq!(kvs[0].value, "web");
    assert_eq!(kvs[0].mod_revision, 9);

    let err = facade
        .get("/missing", &GetOptions::default(), &ctx)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Key not found"));
}
