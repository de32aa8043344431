use anyhow::Result;
use std::time::Duration;

use console_client::KeepAlive;
use console_core::types::LeaseId;

use crate::session::Session;

/// How long `keep-alive` runs without `--timeout` when not interrupted.
const KEEP_ALIVE_HORIZON: Duration = Duration::from_secs(24 * 60 * 60);

pub async fn grant(session: &Session, ttl: i64) -> Result<()> {
    let facade = session.connect().await?;
    let lease = facade.lease_grant(ttl, &session.request_ctx()).await?;
    facade.close().await;
    println!("lease {} granted with TTL({}s)", lease.id, lease.ttl);
    Ok(())
}

pub async fn revoke(session: &Session, id: &str) -> Result<()> {
    let id = LeaseId::from_hex(id)?;
    let facade = session.connect().await?;
    facade.lease_revoke(id, &session.request_ctx()).await?;
    facade.close().await;
    println!("lease {id} revoked");
    Ok(())
}

pub async fn time_to_live(session: &Session, id: &str, with_keys: bool) -> Result<()> {
    let id = LeaseId::from_hex(id)?;
    let facade = session.connect().await?;
    let ttl = facade
        .lease_time_to_live(id, with_keys, &session.request_ctx())
        .await?;
    facade.close().await;

    if ttl.is_expired() {
        println!("lease {id} already expired");
        return Ok(());
    }
    println!(
        "lease {} granted with TTL({}s), remaining({}s)",
        ttl.id, ttl.granted_ttl, ttl.ttl
    );
    if with_keys {
        println!("attached keys: [{}]", ttl.keys.join(", "));
    }
    Ok(())
}

pub async fn keep_alive(session: &Session, id: &str, once: bool) -> Result<()> {
    let id = LeaseId::from_hex(id)?;
    let facade = session.connect().await?;
    let ctx = if once {
        session.request_ctx()
    } else {
        session.ctx(session.timeout_or(KEEP_ALIVE_HORIZON))
    };

    match facade.lease_keep_alive(id, once, &ctx).await? {
        KeepAlive::Once(ack) => println!("lease {} keepalived with TTL({})", ack.id, ack.ttl),
        KeepAlive::Stream(mut acks) => {
            while let Some(ack) = acks.recv().await {
                let ack = ack?;
                if ack.ttl <= 0 {
                    println!("lease {id} expired or revoked");
                    break;
                }
                println!("lease {} keepalived with TTL({})", ack.id, ack.ttl);
            }
        }
    }
    facade.close().await;
    Ok(())
}
