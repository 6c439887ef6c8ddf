//! Idle sweep and periodic counter logging
//!
//! One task, one period (`stats_interval`). Each tick snapshots both
//! tables outside their locks, evicts TCP origins that have sat empty for
//! `idle_timeout`, signals eviction to UDP flows idle for `idle_timeout`,
//! and logs the counters.

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::proxy::Shared;
use crate::tcp::TcpOriginTable;
use crate::udp::UdpFlowTable;

pub(crate) async fn reaper_task(
    tcp: Arc<TcpOriginTable>,
    udp: Arc<UdpFlowTable>,
    shared: Arc<Shared>,
) {
    let idle_timeout = shared.opts.idle_timeout;
    let mut ticker = tokio::time::interval(shared.opts.stats_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut shutdown = shared.shutdown_rx();

    loop {
        tokio::select! {
            _ = Shared::wait_for_shutdown(&mut shutdown) => break,
            _ = ticker.tick() => {
                for origin in tcp.snapshot() {
                    if origin.num_clients() == 0 && origin.idle_for() >= idle_timeout {
                        tcp.remove_origin(origin.dest());
                    }
                }
                for flow in udp.snapshot() {
                    if flow.activity.idle_for() >= idle_timeout {
                        flow.request_evict();
                    }
                }
                debug!(
                    "TCP origins: {}   TCP clients: {}   UDP flows: {}",
                    tcp.num_origins(),
                    tcp.num_clients(),
                    udp.num_flows()
                );
                debug!(
                    "accepted packets: {}   rejected packets: {}",
                    shared.stats.accepted_packets(),
                    shared.stats.rejected_packets()
                );
            }
        }
    }

    debug!("idle reaper stopped");
}
