use std::sync::Arc;

use tracing::{info, warn};

use crate::scheduler::Scheduler;
use crate::stats::{PollStats, StatsSnapshot};

/// Heartbeat: periodically log what the polling loop has been doing.
pub async fn register_heartbeat(
    scheduler: &Scheduler,
    stats: Arc<PollStats>,
    cron_expr: &str,
) -> anyhow::Result<()> {
    scheduler
        .add_cron_job(cron_expr, "heartbeat", move || {
            let stats = stats.clone();
            Box::pin(async move {
                log_heartbeat(&stats.snapshot());
            })
        })
        .await?;

    Ok(())
}

fn log_heartbeat(snap: &StatsSnapshot) {
    if snap.consecutive_fetch_failures > 0 {
        warn!(
            "Heartbeat: {} consecutive fetch failures ({} total), cursor {:?}",
            snap.consecutive_fetch_failures, snap.fetch_failures, snap.cursor
        );
    } else {
        info!(
            "Heartbeat: bot is alive, {} cycles, {} updates handled, {} failed, cursor {:?}",
            snap.cycles, snap.updates_handled, snap.update_failures, snap.cursor
        );
    }
}
