use anyhow::Result;

use console_core::options::{DeleteOptions, GetParams, ListOptions, PutOptions};
use console_core::types::KeyValue;

use crate::session::Session;

fn print_table(kvs: &[KeyValue]) {
    println!(
        "{:<40} {:>8} {:>8} {:>7} {:<16} {}",
        "KEY", "CREATE", "MOD", "VERSION", "LEASE", "VALUE"
    );
    println!("{}", "-".repeat(100));
    for kv in kvs {
        let lease = if kv.lease.is_none() {
            String::new()
        } else {
            kv.lease.to_string()
        };
        println!(
            "{:<40} {:>8} {:>8} {:>7} {:<16} {}",
            kv.key, kv.create_revision, kv.mod_revision, kv.version, lease, kv.value
        );
    }
}

pub async fn get(session: &Session, key: &str, params: &GetParams) -> Result<()> {
    let opts = params.parse()?;
    let facade = session.connect().await?;
    let kvs = facade.get(key, &opts, &session.request_ctx()).await?;
    facade.close().await;

    if kvs.is_empty() {
        println!("No keys found.");
        return Ok(());
    }
    print_table(&kvs);
    Ok(())
}

pub async fn put(session: &Session, key: &str, value: &str, opts: &PutOptions) -> Result<()> {
    let facade = session.connect().await?;
    let prev = facade.put(key, value, opts, &session.request_ctx()).await?;
    facade.close().await;

    println!("OK");
    if let Some(prev) = prev {
        println!("\nPrevious value:");
        print_table(&[prev]);
    }
    Ok(())
}

pub async fn del(session: &Session, key: &str, opts: &DeleteOptions) -> Result<()> {
    let facade = session.connect().await?;
    let removed = facade.delete(key, opts, &session.request_ctx()).await?;
    facade.close().await;

    println!("OK");
    if !removed.is_empty() {
        println!("\nDeleted:");
        print_table(&removed);
    }
    Ok(())
}

pub async fn ls(session: &Session, key: &str, opts: ListOptions) -> Result<()> {
    let facade = session.connect().await?;
    let keys = facade.list(key, opts, &session.request_ctx()).await?;
    facade.close().await;

    for key in keys {
        println!("{key}");
    }
    Ok(())
}
