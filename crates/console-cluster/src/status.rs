use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::debug;

use console_client::ClientFacade;
use console_core::types::{Generation, Member, MemberStatus};
use console_core::{ConsoleError, OpContext, Result};

/// Collect one status record per cluster member.
///
/// Members are probed concurrently under `ctx`. A member that cannot be probed is
/// reported with its identity only and `is_connected = false`; only a failed
/// membership listing fails the call. The result is unordered.
pub async fn aggregate(facade: &Arc<ClientFacade>, ctx: &OpContext) -> Result<Vec<MemberStatus>> {
    if facade.generation() != Generation::Current {
        return Err(ConsoleError::UnsupportedForVersion {
            operation: "status",
            version: facade.version(),
        });
    }

    let members = facade.member_list(ctx).await?;
    let mut statuses: Vec<MemberStatus> = members.iter().map(MemberStatus::identity).collect();

    let mut probes = JoinSet::new();
    for (index, member) in members.into_iter().enumerate() {
        let Some(endpoint) = member.client_endpoint().map(String::from) else {
            debug!("Member {} advertises no client URL", member.name);
            continue;
        };
        let facade = Arc::clone(facade);
        let ctx = ctx.child();
        probes.spawn(async move {
            let status = probe_member(&facade, &member, &endpoint, &ctx).await;
            (index, status)
        });
    }

    while let Some(joined) = probes.join_next().await {
        match joined {
            Ok((index, status)) => statuses[index] = status,
            Err(e) => debug!("Member probe task failed: {e}"),
        }
    }
    Ok(statuses)
}

async fn probe_member(
    facade: &ClientFacade,
    member: &Member,
    endpoint: &str,
    ctx: &OpContext,
) -> MemberStatus {
    let mut record = MemberStatus::identity(member);
    let status = match facade.status(endpoint, ctx).await {
        Ok(status) => status,
        Err(e) => {
            debug!("Member {} ({endpoint}) did not report status: {e}", member.name);
            return record;
        }
    };
    record.is_connected = true;
    record.is_leader = status.leader == member.id;
    record.db_size = status.db_size;
    record.version = status.version;
    record.is_healthy = match facade.member_health(endpoint, ctx).await {
        Ok(healthy) => healthy,
        Err(e) => {
            debug!("Health check of {endpoint} abandoned: {e}");
            false
        }
    };
    record
}
