use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;

use console_core::types::sort_newest_first;

use super::format_bytes;
use crate::session::Session;

pub async fn list(session: &Session) -> Result<()> {
    let catalog = session.catalog();
    let ctx = session.ctx(session.timeout_or(session.config.timeouts.backup_list()));
    let mut backups = catalog.list(&ctx).await?;

    if backups.is_empty() {
        println!("No backups found in {}.", catalog.dir().display());
        return Ok(());
    }
    sort_newest_first(&mut backups);

    println!("{:<70} {:>12} {}", "NAME", "SIZE", "CREATED");
    println!("{}", "-".repeat(105));
    for b in &backups {
        println!(
            "{:<70} {:>12} {}",
            b.name,
            format_bytes(b.size_bytes),
            b.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

pub async fn create(session: &Session) -> Result<()> {
    let catalog = session.catalog();
    let facade = session.connect().await?;

    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {elapsed} {msg}")?);
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_message("Taking snapshot...");

    let ctx = session.ctx(session.timeout_or(session.config.timeouts.backup_create()));
    let created = catalog.create(&facade, &ctx).await;
    facade.close().await;

    match created {
        Ok(artifact) => {
            pb.finish_with_message("Snapshot stored");
            println!("\nBackup created:");
            println!("  Name:    {}", artifact.name);
            println!("  Size:    {}", format_bytes(artifact.size_bytes));
            println!("  Created: {}", artifact.created_at.format("%Y-%m-%d %H:%M:%S"));
            Ok(())
        }
        Err(e) => {
            pb.abandon_with_message("Backup failed");
            Err(e.into())
        }
    }
}

pub async fn delete(session: &Session, name: &str) -> Result<()> {
    session.catalog().delete(name, &session.request_ctx()).await?;
    println!("Backup {name} deleted");
    Ok(())
}

pub async fn download(session: &Session, name: &str, output: Option<PathBuf>) -> Result<()> {
    let output = output.unwrap_or_else(|| PathBuf::from(name));
    let ctx = session.ctx(session.timeout_or(session.config.timeouts.backup_create()));
    let mut file = tokio::fs::File::create(&output).await?;
    match session.catalog().retrieve(name, &mut file, &ctx).await {
        Ok(bytes) => {
            println!("Wrote {} to {}", format_bytes(bytes), output.display());
            Ok(())
        }
        Err(e) => {
            drop(file);
            if let Err(rm) = tokio::fs::remove_file(&output).await {
                tracing::debug!("Cannot remove {}: {rm}", output.display());
            }
            Err(e.into())
        }
    }
}
