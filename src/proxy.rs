//! The proxy root object and its lifecycle supervisor
//!
//! `Proxy` owns the TUN device, the user-space stack, both flow tables,
//! the counters, and the shutdown machinery. `serve` wires the pipeline:
//!
//! ```text
//! TUN read half --ingress--> PacketChannel --> ipstack --accept--+
//! TUN write half <--injector-- PacketChannel <-- ipstack         |
//!                                                                v
//!                  TcpOriginTable / UdpFlowTable <---- stack demultiplexer
//! ```
//!
//! Cancellation has a single source: the shutdown watch channel. Fatal
//! errors and device EOF trip it; `close` trips it and then joins every
//! spawned task through the `TaskTracker` before declaring the proxy
//! closed.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::config::{Options, PACKET_CHANNEL_CAPACITY, STACK_ACCEPT_FAILURE_LIMIT};
use crate::device::TunDevice;
use crate::error::{ProxyError, Result};
use crate::link::{self, PacketChannel};
use crate::reaper;
use crate::stats::{ProxyStats, StatsSnapshot};
use crate::tcp::TcpOriginTable;
use crate::udp::UdpFlowTable;

/// Lifecycle of a proxy instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LifecycleState {
    Created,
    Running,
    Closing,
    Closed,
}

/// State shared between the proxy handle and every spawned task
pub(crate) struct Shared {
    pub(crate) opts: Options,
    pub(crate) stats: ProxyStats,
    pub(crate) tracker: TaskTracker,
    shutdown_tx: watch::Sender<bool>,
    state_tx: watch::Sender<LifecycleState>,
    fatal: Mutex<Option<ProxyError>>,
}

impl Shared {
    pub(crate) fn new(opts: Options) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (state_tx, _) = watch::channel(LifecycleState::Created);
        Self {
            opts,
            stats: ProxyStats::default(),
            tracker: TaskTracker::new(),
            shutdown_tx,
            state_tx,
            fatal: Mutex::new(None),
        }
    }

    /// Subscribe to the shutdown signal. Every task loop selects on this.
    pub(crate) fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Await the shutdown signal without holding a non-`Send` watch
    /// guard across the select branches that drive it.
    pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            if shutdown.changed().await.is_err() {
                return;
            }
        }
    }

    /// Trip the shutdown signal without recording an error.
    pub(crate) fn request_close(&self) {
        let _ = self.shutdown_tx.send_replace(true);
    }

    /// Whether shutdown has been signalled. Lets tasks tell an expected
    /// teardown-time queue closure apart from a mid-run stack failure.
    pub(crate) fn shutdown_requested(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Record a fatal error (first one wins) and trip shutdown.
    pub(crate) fn fail(&self, err: ProxyError) {
        warn!("fatal proxy error: {}", err);
        {
            let mut slot = self.fatal.lock();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.request_close();
    }

    pub(crate) fn take_fatal(&self) -> Option<ProxyError> {
        self.fatal.lock().take()
    }

    fn begin_running(&self) -> bool {
        self.state_tx.send_if_modified(|s| {
            if *s == LifecycleState::Created {
                *s = LifecycleState::Running;
                true
            } else {
                false
            }
        })
    }

    fn begin_close(&self) -> bool {
        self.state_tx.send_if_modified(|s| {
            if matches!(*s, LifecycleState::Created | LifecycleState::Running) {
                *s = LifecycleState::Closing;
                true
            } else {
                false
            }
        })
    }

    fn set_closed(&self) {
        let _ = self.state_tx.send_replace(LifecycleState::Closed);
    }

    fn state_rx(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }
}

/// User-space TCP/UDP proxy for a TUN device
///
/// See the crate docs for the data flow. All methods take `&self`; wrap
/// the proxy in an `Arc` to drive `serve` and `close` from different
/// tasks.
pub struct Proxy<D> {
    device: Mutex<Option<D>>,
    shared: Arc<Shared>,
    tcp: Arc<TcpOriginTable>,
    udp: Arc<UdpFlowTable>,
}

impl<D: TunDevice> Proxy<D> {
    /// Create a proxy over `device` with the given options.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Config` if the options fail validation.
    pub fn new(device: D, options: Options) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            device: Mutex::new(Some(device)),
            shared: Arc::new(Shared::new(options)),
            tcp: Arc::new(TcpOriginTable::new()),
            udp: Arc::new(UdpFlowTable::new()),
        })
    }

    /// Run the proxy until it is closed.
    ///
    /// Spawns the packet ingress, link injector, stack demultiplexer, and
    /// idle reaper, then blocks until shutdown is signalled, by [`close`],
    /// by device EOF, or by a fatal error. Returns the first fatal error
    /// observed, if any.
    ///
    /// # Errors
    ///
    /// `ProxyError::Closed` when invoked on a proxy that is not freshly
    /// created; otherwise whatever fatal error ended the run.
    ///
    /// [`close`]: Proxy::close
    pub async fn serve(&self) -> Result<()> {
        if !self.shared.begin_running() {
            return Err(ProxyError::Closed);
        }
        let device = self.device.lock().take().ok_or(ProxyError::Closed)?;

        let (tun_read, tun_write) = tokio::io::split(device);
        let (channel, stack_in_tx, stack_out_rx) =
            PacketChannel::create_pair(PACKET_CHANNEL_CAPACITY);

        let mut stack_config = ipstack::IpStackConfig::default();
        stack_config.mtu(self.shared.opts.mtu);
        // The stack's own expiry must never preempt the reaper's verdict
        let stack_timeout = self.shared.opts.idle_timeout.saturating_mul(2);
        stack_config.tcp_timeout(stack_timeout);
        stack_config.udp_timeout(stack_timeout);
        let stack = ipstack::IpStack::new(stack_config, channel);

        info!(
            "proxy serving (mtu {}, idle timeout {:?})",
            self.shared.opts.mtu, self.shared.opts.idle_timeout
        );

        self.shared.tracker.spawn(link::ingress_task(
            tun_read,
            stack_in_tx,
            Arc::clone(&self.shared),
        ));
        self.shared.tracker.spawn(link::injector_task(
            tun_write,
            stack_out_rx,
            Arc::clone(&self.shared),
        ));
        self.shared.tracker.spawn(demux_task(
            stack,
            Arc::clone(&self.tcp),
            Arc::clone(&self.udp),
            Arc::clone(&self.shared),
        ));
        self.shared.tracker.spawn(reaper::reaper_task(
            Arc::clone(&self.tcp),
            Arc::clone(&self.udp),
            Arc::clone(&self.shared),
        ));

        let mut shutdown = self.shared.shutdown_rx();
        let _ = shutdown.wait_for(|stop| *stop).await;

        self.close().await?;
        match self.shared.take_fatal() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Close the proxy and release every owned resource.
    ///
    /// Idempotent: the first call signals shutdown, joins every spawned
    /// task, and empties both tables; later (or concurrent) calls wait for
    /// that work to finish and return success.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` keeps the seam for device close
    /// errors.
    pub async fn close(&self) -> Result<()> {
        if self.shared.begin_close() {
            debug!("closing proxy");
            self.shared.request_close();
            // A device that never served closes here
            self.device.lock().take();
            self.shared.tracker.close();
            self.shared.tracker.wait().await;
            self.tcp.clear();
            self.udp.clear();
            self.shared.set_closed();
            debug!("proxy closed");
        } else {
            let mut state = self.shared.state_rx();
            let _ = state.wait_for(|s| *s == LifecycleState::Closed).await;
        }
        Ok(())
    }

    /// Number of TCP origins currently tracked.
    pub fn num_tcp_origins(&self) -> usize {
        self.tcp.num_origins()
    }

    /// Number of TCP clients summed over all origins.
    pub fn num_tcp_clients(&self) -> usize {
        self.tcp.num_clients()
    }

    /// Number of UDP flows currently tracked.
    pub fn num_udp_flows(&self) -> usize {
        self.udp.num_flows()
    }

    /// All three gauges from one pass over the tables.
    pub fn conn_counts(&self) -> (usize, usize, usize) {
        let origins = self.tcp.snapshot();
        let clients = origins.iter().map(|o| o.num_clients()).sum();
        (origins.len(), clients, self.udp.num_flows())
    }

    /// IP packets successfully handed to the stack so far.
    pub fn accepted_packets(&self) -> u64 {
        self.shared.stats.accepted_packets()
    }

    /// Packets rejected by the stack plus flows dropped on dial failure.
    pub fn rejected_packets(&self) -> u64 {
        self.shared.stats.rejected_packets()
    }

    /// Upstream dials that have failed so far.
    pub fn dial_failures(&self) -> u64 {
        self.shared.stats.dial_failures()
    }

    /// Counters and gauges in one serializable snapshot.
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        let (num_tcp_origins, num_tcp_clients, num_udp_flows) = self.conn_counts();
        StatsSnapshot {
            accepted_packets: self.shared.stats.accepted_packets(),
            rejected_packets: self.shared.stats.rejected_packets(),
            dial_failures: self.shared.stats.dial_failures(),
            num_tcp_origins,
            num_tcp_clients,
            num_udp_flows,
        }
    }
}

/// Dispatch flows accepted by the stack to their tables.
///
/// A run of consecutive `accept` failures means the stack itself is gone;
/// that is an emission failure and is escalated as fatal.
async fn demux_task(
    mut stack: ipstack::IpStack,
    tcp: Arc<TcpOriginTable>,
    udp: Arc<UdpFlowTable>,
    shared: Arc<Shared>,
) {
    let mut shutdown = shared.shutdown_rx();
    let mut accept_failures: usize = 0;

    loop {
        tokio::select! {
            _ = Shared::wait_for_shutdown(&mut shutdown) => break,
            accepted = stack.accept() => match accepted {
                Ok(stream) => {
                    accept_failures = 0;
                    match stream {
                        ipstack::stream::IpStackStream::Tcp(stream) => {
                            let src = stream.local_addr();
                            let dst = stream.peer_addr();
                            trace!("accepted TCP stream {} -> {}", src, dst);
                            tcp.dispatch(src, dst, Box::new(stream), &shared).await;
                        }
                        ipstack::stream::IpStackStream::Udp(stream) => {
                            let src = stream.local_addr();
                            let dst = stream.peer_addr();
                            trace!("accepted UDP stream {} -> {}", src, dst);
                            udp.admit(src, dst, Box::new(stream), &shared).await;
                        }
                        ipstack::stream::IpStackStream::UnknownTransport(pkt) => {
                            trace!(
                                "unknown transport packet {} -> {}",
                                pkt.src_addr(),
                                pkt.dst_addr()
                            );
                            shared.stats.rejected_packet();
                        }
                        ipstack::stream::IpStackStream::UnknownNetwork(pkt) => {
                            trace!("unknown network packet of {} bytes", pkt.len());
                            shared.stats.rejected_packet();
                        }
                    }
                }
                Err(e) => {
                    accept_failures += 1;
                    if accept_failures >= STACK_ACCEPT_FAILURE_LIMIT {
                        shared.fail(ProxyError::stack(format!(
                            "stack accept failed {accept_failures} times in a row: {e:?}"
                        )));
                        break;
                    }
                    warn!("stack accept error: {:?}", e);
                    // Errors must not spin the loop
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }

    debug!("stack demultiplexer stopped");
}
