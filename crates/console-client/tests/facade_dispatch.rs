//! Version dispatch, validation and keep-alive behaviour of the client facade,
//! exercised against the in-memory cluster.

use std::sync::Arc;
use std::time::Duration;

use console_client::{ClientFacade, KeepAlive, MemoryCluster, RetryPolicy};
use console_core::options::{Consistency, DeleteOptions, GetOptions, ListOptions, PutOptions};
use console_core::types::{Generation, LeaseId};
use console_core::{ClusterError, ConsoleError, OpContext};
use tokio_util::sync::CancellationToken;

const EP0: &str = "http://10.0.0.1:2379";

fn ctx() -> OpContext {
    OpContext::with_timeout(Duration::from_secs(5))
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        backoff: Duration::from_millis(10),
    }
}

async fn facade_for(cluster: &Arc<MemoryCluster>) -> ClientFacade {
    ClientFacade::connect(
        cluster.connector(),
        &[EP0.to_string()],
        fast_retry(),
        &CancellationToken::new(),
    )
    .await
    .unwrap()
}

fn current_cluster() -> Arc<MemoryCluster> {
    let cluster = MemoryCluster::new("3.4.0");
    cluster.add_member(0x8e9e05c52164694d, "infra0", EP0);
    cluster
}

fn legacy_cluster() -> Arc<MemoryCluster> {
    let cluster = MemoryCluster::new("2.3.8");
    cluster.add_member(0x272e204152, "infra0", EP0);
    cluster
}

#[tokio::test]
async fn current_cluster_selects_current_client() {
    let cluster = current_cluster();
    let facade = facade_for(&cluster).await;
    assert_eq!(facade.generation(), Generation::Current);
    assert_eq!(facade.version().to_string(), "3.4.0");
}

#[tokio::test]
async fn ls_is_unsupported_on_current_cluster() {
    let cluster = current_cluster();
    let facade = facade_for(&cluster).await;
    let err = facade
        .list("/", ListOptions::default(), &ctx())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ConsoleError::UnsupportedForVersion {
            operation: "ls",
            ..
        }
    ));
    assert_eq!(cluster.call_count(), 0);
}

#[tokio::test]
async fn lease_ops_are_unsupported_on_legacy_cluster() {
    let cluster = legacy_cluster();
    let facade = facade_for(&cluster).await;
    assert_eq!(facade.generation(), Generation::Legacy);
    let err = facade.lease_grant(30, &ctx()).await.unwrap_err();
    assert!(matches!(err, ConsoleError::UnsupportedForVersion { .. }));
    let err = facade.snapshot(&ctx()).await.err().unwrap();
    assert!(matches!(err, ConsoleError::UnsupportedForVersion { .. }));
}

#[tokio::test]
async fn zero_ttl_rejected_before_any_call() {
    let cluster = current_cluster();
    let facade = facade_for(&cluster).await;
    let err = facade.lease_grant(0, &ctx()).await.unwrap_err();
    assert!(matches!(err, ConsoleError::Validation(_)));
    assert_eq!(cluster.call_count(), 0);
}

#[tokio::test]
async fn prefix_with_from_key_rejected_before_any_call() {
    for cluster in [current_cluster(), legacy_cluster()] {
        let facade = facade_for(&cluster).await;
        let get = GetOptions {
            prefix: true,
            from_key: true,
            ..Default::default()
        };
        let err = facade.get("/app", &get, &ctx()).await.unwrap_err();
        assert!(matches!(err, ConsoleError::Validation(_)));

        let del = DeleteOptions {
            prefix: true,
            from_key: true,
            ..Default::default()
        };
        let err = facade.delete("/app", &del, &ctx()).await.unwrap_err();
        assert!(matches!(err, ConsoleError::Validation(_)));
        assert_eq!(cluster.call_count(), 0);
    }
}

#[tokio::test]
async fn put_requires_key_and_value() {
    let cluster = current_cluster();
    let facade = facade_for(&cluster).await;
    let opts = PutOptions::default();
    assert!(matches!(
        facade.put("", "v", &opts, &ctx()).await,
        Err(ConsoleError::Validation(_))
    ));
    assert!(matches!(
        facade.put("k", "", &opts, &ctx()).await,
        Err(ConsoleError::Validation(_))
    ));
    assert_eq!(cluster.call_count(), 0);
}

#[tokio::test]
async fn current_put_get_delete() {
    let cluster = current_cluster();
    let facade = facade_for(&cluster).await;

    let opts = PutOptions {
        prev_kv: true,
        ..Default::default()
    };
    let prev = facade.put("/app/a", "1", &opts, &ctx()).await.unwrap();
    assert!(prev.is_none());
    let prev = facade.put("/app/a", "2", &opts, &ctx()).await.unwrap();
    assert_eq!(prev.unwrap().value, "1");
    facade
        .put("/app/b", "3", &PutOptions::default(), &ctx())
        .await
        .unwrap();

    let all = GetOptions {
        prefix: true,
        ..Default::default()
    };
    let kvs = facade.get("/app/", &all, &ctx()).await.unwrap();
    let keys: Vec<_> = kvs.iter().map(|kv| kv.key.as_str()).collect();
    assert_eq!(keys, vec!["/app/a", "/app/b"]);
    assert_eq!(kvs[0].version, 2);

    let del = DeleteOptions {
        prefix: true,
        prev_kv: true,
        ..Default::default()
    };
    let removed = facade.delete("/app/", &del, &ctx()).await.unwrap();
    assert_eq!(removed.len(), 2);
    assert!(cluster.value("/app/a").is_none());
}

#[tokio::test]
async fn empty_prefix_reads_whole_keyspace() {
    let cluster = current_cluster();
    cluster.insert("a", "1");
    cluster.insert("z", "2");
    let facade = facade_for(&cluster).await;
    let opts = GetOptions {
        prefix: true,
        ..Default::default()
    };
    let kvs = facade.get("", &opts, &ctx()).await.unwrap();
    assert_eq!(kvs.len(), 2);
}

#[tokio::test]
async fn legacy_options_rejected_on_current_cluster() {
    let cluster = current_cluster();
    let facade = facade_for(&cluster).await;
    let opts = PutOptions {
        ttl: Some(10),
        ..Default::default()
    };
    let err = facade.put("k", "v", &opts, &ctx()).await.unwrap_err();
    assert!(matches!(err, ConsoleError::UnsupportedForVersion { .. }));
    assert_eq!(cluster.call_count(), 0);
}

#[tokio::test]
async fn legacy_range_get_rejected() {
    let cluster = legacy_cluster();
    let facade = facade_for(&cluster).await;
    let opts = GetOptions {
        prefix: true,
        ..Default::default()
    };
    let err = facade.get("/app", &opts, &ctx()).await.unwrap_err();
    assert!(matches!(err, ConsoleError::UnsupportedForVersion { .. }));
}

#[tokio::test]
async fn legacy_serializable_get_rejected() {
    let cluster = legacy_cluster();
    cluster.insert("/app/name", "web");
    let facade = facade_for(&cluster).await;
    let opts = GetOptions {
        consistency: Consistency::Serializable,
        ..Default::default()
    };
    let err = facade.get("/app/name", &opts, &ctx()).await.unwrap_err();
    assert!(matches!(
        err,
        ConsoleError::UnsupportedForVersion {
            operation: "range get",
            ..
        }
    ));
    assert_eq!(cluster.call_count(), 0);
}

#[tokio::test]
async fn legacy_listing_flattens_tree() {
    let cluster = legacy_cluster();
    cluster.insert("/app/config/port", "8080");
    cluster.insert("/app/name", "web");
    let facade = facade_for(&cluster).await;

    let opts = ListOptions {
        recursive: true,
        fill_path: true,
        ..Default::default()
    };
    let keys = facade.list("", opts, &ctx()).await.unwrap();
    assert_eq!(
        keys,
        vec!["/app/", "/app/config/", "/app/config/port", "/app/name"]
    );

    let shallow = facade
        .list("/app", ListOptions::default(), &ctx())
        .await
        .unwrap();
    assert_eq!(shallow, vec!["/app/config", "/app/name"]);
}

#[tokio::test]
async fn legacy_set_and_get() {
    let cluster = legacy_cluster();
    let facade = facade_for(&cluster).await;
    facade
        .put("/app/name", "web", &PutOptions::default(), &ctx())
        .await
        .unwrap();
    let prev = facade
        .put("/app/name", "api", &PutOptions::default(), &ctx())
        .await
        .unwrap();
    assert_eq!(prev.unwrap().value, "web");
    let kvs = facade
        .get("/app/name", &GetOptions::default(), &ctx())
        .await
        .unwrap();
    assert_eq!(kvs[0].value, "api");
}

#[tokio::test]
async fn legacy_get_on_directory_fails() {
    let cluster = legacy_cluster();
    cluster.insert("/app/name", "web");
    let facade = facade_for(&cluster).await;
    let err = facade
        .get("/app", &GetOptions::default(), &ctx())
        .await
        .unwrap_err();
    match err {
        ConsoleError::Cluster(ClusterError::Call(msg)) => assert_eq!(msg, "/app: is a directory"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn lease_lifecycle() {
    let cluster = current_cluster();
    let facade = facade_for(&cluster).await;

    let grant = facade.lease_grant(60, &ctx()).await.unwrap();
    assert_eq!(grant.ttl, 60);
    let opts = PutOptions {
        lease: grant.id,
        ..Default::default()
    };
    facade.put("/svc/a", "up", &opts, &ctx()).await.unwrap();

    let ttl = facade
        .lease_time_to_live(grant.id, true, &ctx())
        .await
        .unwrap();
    assert_eq!(ttl.granted_ttl, 60);
    assert_eq!(ttl.keys, vec!["/svc/a"]);

    facade.lease_revoke(grant.id, &ctx()).await.unwrap();
    let ttl = facade
        .lease_time_to_live(grant.id, false, &ctx())
        .await
        .unwrap();
    assert!(ttl.is_expired());
    assert!(cluster.value("/svc/a").is_none());
}

#[tokio::test]
async fn keep_alive_once_and_stream() {
    let cluster = current_cluster();
    let facade = facade_for(&cluster).await;
    let grant = facade.lease_grant(30, &ctx()).await.unwrap();

    match facade.lease_keep_alive(grant.id, true, &ctx()).await.unwrap() {
        KeepAlive::Once(ack) => assert_eq!(ack.ttl, 30),
        KeepAlive::Stream(_) => panic!("expected a single acknowledgement"),
    }

    let KeepAlive::Stream(mut acks) = facade
        .lease_keep_alive(grant.id, false, &ctx())
        .await
        .unwrap()
    else {
        panic!("expected a stream");
    };
    let first = acks.recv().await.unwrap().unwrap();
    assert_eq!(first.id, grant.id);

    facade.lease_revoke(grant.id, &ctx()).await.unwrap();
    let mut last_ttl = first.ttl;
    while let Some(ack) = acks.recv().await {
        last_ttl = ack.unwrap().ttl;
    }
    assert_eq!(last_ttl, 0);
}

#[tokio::test]
async fn keep_alive_stream_stops_with_context() {
    let cluster = current_cluster();
    let facade = facade_for(&cluster).await;
    let grant = facade.lease_grant(30, &ctx()).await.unwrap();
    let op = ctx();
    let KeepAlive::Stream(mut acks) = facade
        .lease_keep_alive(grant.id, false, &op)
        .await
        .unwrap()
    else {
        panic!("expected a stream");
    };
    acks.recv().await.unwrap().unwrap();
    op.cancel();
    let drained = tokio::time::timeout(Duration::from_secs(2), async {
        while acks.recv().await.is_some() {}
    })
    .await;
    assert!(drained.is_ok());
}

#[tokio::test]
async fn bad_lease_id_is_validation_error() {
    assert!(matches!(
        LeaseId::from_hex("not-hex"),
        Err(ConsoleError::Validation(_))
    ));
}

#[tokio::test]
async fn connect_retries_until_client_builds() {
    let cluster = current_cluster();
    cluster.fail_connects(3);
    let facade = facade_for(&cluster).await;
    assert_eq!(facade.generation(), Generation::Current);
}

#[tokio::test]
async fn connect_gives_up_when_cancelled() {
    let cluster = current_cluster();
    cluster.fail_connects(usize::MAX);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let res = ClientFacade::connect(cluster.connector(), &[EP0.to_string()], fast_retry(), &cancel)
        .await;
    assert!(matches!(res, Err(ConsoleError::Cancelled)));
}

#[tokio::test]
async fn unsupported_major_version_fails_probe() {
    let cluster = MemoryCluster::new("1.0.0");
    let res = ClientFacade::connect(
        cluster.connector(),
        &[EP0.to_string()],
        fast_retry(),
        &CancellationToken::new(),
    )
    .await;
    assert!(matches!(res, Err(ConsoleError::Probe(_))));
}

#[tokio::test]
async fn operation_times_out_with_context() {
    let cluster = current_cluster();
    cluster.set_stalled(EP0);
    let facade = facade_for(&cluster).await;
    let short = OpContext::with_timeout(Duration::from_millis(50));
    let err = facade.status(EP0, &short).await.unwrap_err();
    assert!(matches!(err, ConsoleError::Timeout));
}
