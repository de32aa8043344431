use anyhow::Result;
use std::sync::Arc;

use console_cluster::aggregate;
use console_core::types::StatusSummary;

use super::format_bytes;
use crate::session::Session;

fn mark(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}

pub async fn run(session: &Session) -> Result<()> {
    let facade = Arc::new(session.connect().await?);
    let ctx = session.ctx(session.timeout_or(session.config.timeouts.status()));
    let mut statuses = aggregate(&facade, &ctx).await?;
    statuses.sort_by(|a, b| a.name.cmp(&b.name));

    println!(
        "{:<18} {:<12} {:<28} {:<7} {:<8} {:<10} {:>10} {}",
        "ID", "NAME", "ENDPOINT", "LEADER", "HEALTHY", "CONNECTED", "DB SIZE", "VERSION"
    );
    println!("{}", "-".repeat(110));
    for s in &statuses {
        println!(
            "{:<18} {:<12} {:<28} {:<7} {:<8} {:<10} {:>10} {}",
            s.id,
            s.name,
            s.endpoint,
            mark(s.is_leader),
            mark(s.is_healthy),
            mark(s.is_connected),
            format_bytes(s.db_size.max(0) as u64),
            s.version,
        );
    }
    println!("\n{}", StatusSummary::from_statuses(&statuses));

    if let Ok(facade) = Arc::try_unwrap(facade) {
        facade.close().await;
    }
    Ok(())
}
