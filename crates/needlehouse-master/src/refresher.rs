//! Background topology maintenance.
//!
//! One task per master, pulsing at the heartbeat period:
//! - demote volumes that grew past the size limit or turned read-only
//! - evict volume servers silent for more than four pulses
//! - trigger vacuum on volumes whose garbage ratio crossed the threshold
//!
//! Followers keep the task alive but skip the work; only the leader
//! mutates shared cluster state. Errors are logged and the loop goes on —
//! a missed cycle heals on the next pulse.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::server::Master;

/// Heartbeats tolerated to go missing before a node is declared dead.
const DEAD_NODE_PULSES: u32 = 4;

pub fn start_refresh(master: Arc<Master>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let pulse = master.config.pulse;
        loop {
            tokio::time::sleep(pulse).await;
            if !master.consensus.is_leader() {
                continue;
            }

            let deltas = {
                let mut topology = master.topology.write().await;
                topology.refresh_writable();
                topology.purge_dead_nodes(pulse * DEAD_NODE_PULSES)
            };
            for delta in &deltas {
                master.notifications.publish(delta);
            }
            if !deltas.is_empty() {
                debug!(evicted = deltas.len(), "purged dead volume servers");
            }

            if let Err(err) = master.vacuum(master.config.garbage_threshold).await {
                warn!(error = %err, "background vacuum failed");
            }
        }
    })
}
