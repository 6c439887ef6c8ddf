//! UDP flow tracking
//!
//! UDP flows are keyed by the full 4-tuple. The stack's demultiplexer
//! hands the table one datagram stream per unseen tuple; the table dials
//! the upstream, inserts the flow, and spawns its relay task. The relay
//! forwards inbound datagrams upstream and upstream datagrams back through
//! the stack, refreshing the activity stamp in both directions, and removes
//! the flow from the table when it exits for any reason.
//!
//! The table lock is held for map mutations only; dialing and relaying
//! happen outside it.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::config::DATAGRAM_BUFFER_SIZE;
use crate::dial::{AsyncStream, BoxDatagram};
use crate::proxy::Shared;
use crate::stats::Activity;

/// The datagram stream the stack delivers for one 4-tuple
type InboundStream = Box<dyn AsyncStream>;

/// The 4-tuple identifying a UDP flow
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub(crate) struct FlowKey {
    /// Source as observed on the TUN
    pub(crate) src: SocketAddr,
    /// Intercepted destination
    pub(crate) dst: SocketAddr,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// One UDP flow: the upstream connection lives in its relay task
pub(crate) struct UdpFlow {
    key: FlowKey,
    pub(crate) activity: Activity,
    evict: Notify,
}

impl UdpFlow {
    fn new(key: FlowKey) -> Self {
        Self {
            key,
            activity: Activity::new(),
            evict: Notify::new(),
        }
    }

    pub(crate) fn key(&self) -> FlowKey {
        self.key
    }

    /// Ask the relay task to wind the flow down. Used by the idle sweep.
    pub(crate) fn request_evict(&self) {
        self.evict.notify_one();
    }
}

/// 4-tuple-keyed index of UDP flows
#[derive(Default)]
pub(crate) struct UdpFlowTable {
    flows: Mutex<HashMap<FlowKey, Arc<UdpFlow>>>,
}

impl UdpFlowTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Handle the first datagram of an unseen tuple: dial the upstream,
    /// insert the flow, and start its relay. A dial failure counts the
    /// packet as rejected and drops the flow entirely.
    pub(crate) async fn admit(
        self: &Arc<Self>,
        src: SocketAddr,
        dst: SocketAddr,
        inbound: InboundStream,
        shared: &Arc<Shared>,
    ) {
        let key = FlowKey { src, dst };
        if self.flows.lock().contains_key(&key) {
            trace!("duplicate UDP flow {}, dropping stream", key);
            return;
        }

        let mut shutdown = shared.shutdown_rx();
        let dialed = tokio::select! {
            _ = Shared::wait_for_shutdown(&mut shutdown) => return,
            result = shared.opts.dial_udp.dial(dst) => result,
        };
        let upstream = match dialed {
            Ok(conn) => conn,
            Err(e) => {
                debug!("upstream UDP dial for {} failed: {}", dst, e);
                shared.stats.dial_failure();
                shared.stats.rejected_packet();
                return;
            }
        };

        let flow = Arc::new(UdpFlow::new(key));
        {
            let mut flows = self.flows.lock();
            if flows.contains_key(&key) {
                // lost the insert race; the existing flow wins
                return;
            }
            flows.insert(key, Arc::clone(&flow));
        }
        debug!("new UDP flow {}", key);

        shared.tracker.spawn(relay_flow(
            Arc::clone(self),
            flow,
            inbound,
            upstream,
            Arc::clone(shared),
        ));
    }

    fn remove(&self, key: FlowKey) {
        if self.flows.lock().remove(&key).is_some() {
            debug!("removed UDP flow {}", key);
        }
    }

    /// Copy the current flows out under the table lock.
    pub(crate) fn snapshot(&self) -> Vec<Arc<UdpFlow>> {
        self.flows.lock().values().cloned().collect()
    }

    pub(crate) fn num_flows(&self) -> usize {
        self.flows.lock().len()
    }

    /// Drop every flow entry regardless of idleness. Part of proxy close;
    /// the relay tasks exit on the shutdown signal.
    pub(crate) fn clear(&self) {
        self.flows.lock().clear();
    }
}

/// The flow's single relay task: pumps both directions until EOF, error,
/// eviction, or shutdown, then removes the flow and drops the upstream.
async fn relay_flow(
    table: Arc<UdpFlowTable>,
    flow: Arc<UdpFlow>,
    mut inbound: InboundStream,
    upstream: BoxDatagram,
    shared: Arc<Shared>,
) {
    let mut shutdown = shared.shutdown_rx();
    let mut in_buf = vec![0u8; DATAGRAM_BUFFER_SIZE];
    let mut up_buf = vec![0u8; DATAGRAM_BUFFER_SIZE];

    loop {
        tokio::select! {
            _ = Shared::wait_for_shutdown(&mut shutdown) => break,
            () = flow.evict.notified() => {
                debug!("UDP flow {} evicted after idle timeout", flow.key);
                break;
            }
            result = inbound.read(&mut in_buf) => match result {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = upstream.send(&in_buf[..n]).await {
                        debug!("UDP flow {} upstream send error: {}", flow.key, e);
                        break;
                    }
                    flow.activity.touch();
                }
                Err(e) => {
                    debug!("UDP flow {} inbound read error: {}", flow.key, e);
                    break;
                }
            },
            result = upstream.recv(&mut up_buf) => match result {
                Ok(n) => {
                    if let Err(e) = inbound.write_all(&up_buf[..n]).await {
                        debug!("UDP flow {} inbound write error: {}", flow.key, e);
                        break;
                    }
                    flow.activity.touch();
                }
                Err(e) => {
                    debug!("UDP flow {} upstream recv error: {}", flow.key, e);
                    break;
                }
            },
        }
    }

    table.remove(flow.key);
}
