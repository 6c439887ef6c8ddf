//! TCP origin and client tracking
//!
//! Intercepted TCP flows are indexed at two levels: a [`TcpOriginTable`]
//! maps each distinct destination to a [`TcpOrigin`], and each origin owns
//! the set of [`TcpClient`]s currently relaying to that destination.
//!
//! The stack's demultiplexer delivers every accepted byte-stream to its
//! origin's accept queue. The origin's accept task dials the upstream and,
//! on success, registers a client and launches one relay task per
//! direction. When the last client leaves, the origin stamps the departure
//! time so the idle sweep can collect it after the idle timeout.
//!
//! Lock ordering is table before origin, never the reverse; neither lock
//! is held across an await point.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::config::{ACCEPT_QUEUE_CAPACITY, RELAY_BUFFER_SIZE};
use crate::dial::BoxTcpStream;
use crate::proxy::Shared;
use crate::stats::Activity;

/// An accepted byte-stream tagged with its original source
type Accepted = (SocketAddr, BoxTcpStream);

/// Destination-keyed index of TCP origins
#[derive(Default)]
pub(crate) struct TcpOriginTable {
    origins: Mutex<HashMap<SocketAddr, Arc<TcpOrigin>>>,
}

impl TcpOriginTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Deliver an accepted stream to its destination's origin, creating the
    /// origin if this is the first flow toward `dst`.
    ///
    /// A freshly retired origin can race the delivery; in that case the
    /// entry is already gone from the table and a retry creates a new one.
    pub(crate) async fn dispatch(
        &self,
        src: SocketAddr,
        dst: SocketAddr,
        stream: BoxTcpStream,
        shared: &Arc<Shared>,
    ) {
        let mut stream = Some(stream);
        for _ in 0..2 {
            let origin = self.ensure_origin(dst, shared);
            let Some(tx) = origin.sender() else { continue };
            let Some(taken) = stream.take() else { return };
            match tx.send((src, taken)).await {
                Ok(()) => return,
                Err(mpsc::error::SendError((_, returned))) => stream = Some(returned),
            }
        }
        warn!("dropping accepted stream for {}: accept queue unavailable", dst);
    }

    /// Get or create the origin for `dest`.
    ///
    /// Exactly one origin per destination exists at any instant; creation
    /// races resolve under the table lock. On create, the origin's accept
    /// task is started.
    pub(crate) fn ensure_origin(&self, dest: SocketAddr, shared: &Arc<Shared>) -> Arc<TcpOrigin> {
        let (origin, accept_rx) = {
            let mut map = self.origins.lock();
            if let Some(origin) = map.get(&dest) {
                return Arc::clone(origin);
            }
            let (tx, rx) = mpsc::channel(ACCEPT_QUEUE_CAPACITY);
            let origin = Arc::new(TcpOrigin::new(dest, tx));
            map.insert(dest, Arc::clone(&origin));
            (origin, rx)
        };
        debug!("new TCP origin {}", dest);
        shared.tracker.spawn(accept_loop(
            Arc::clone(&origin),
            Arc::clone(shared),
            accept_rx,
        ));
        origin
    }

    /// Remove the origin for `dest` iff it has no clients; no-op otherwise.
    pub(crate) fn remove_origin(&self, dest: SocketAddr) {
        let mut map = self.origins.lock();
        if let Some(origin) = map.get(&dest) {
            if origin.clients.lock().is_empty() {
                origin.retire();
                map.remove(&dest);
                debug!("removed idle TCP origin {}", dest);
            }
        }
    }

    /// Copy the current origins out under the table lock.
    pub(crate) fn snapshot(&self) -> Vec<Arc<TcpOrigin>> {
        self.origins.lock().values().cloned().collect()
    }

    pub(crate) fn num_origins(&self) -> usize {
        self.origins.lock().len()
    }

    /// Total clients across all origins, via the snapshot idiom.
    pub(crate) fn num_clients(&self) -> usize {
        self.snapshot().iter().map(|o| o.num_clients()).sum()
    }

    /// Drop every origin regardless of idleness. Part of proxy close.
    pub(crate) fn clear(&self) {
        let mut map = self.origins.lock();
        for origin in map.values() {
            origin.retire();
            origin.clients.lock().clear();
        }
        map.clear();
    }
}

/// One intercepted TCP destination and its active clients
pub(crate) struct TcpOrigin {
    dest: SocketAddr,
    /// The origin's endpoint in the demultiplexed stack: accepted streams
    /// for `dest` are queued here. Taken on retirement.
    accept_tx: Mutex<Option<mpsc::Sender<Accepted>>>,
    clients: Mutex<HashMap<SocketAddr, Arc<TcpClient>>>,
    retired: AtomicBool,
    /// When the client set last became (or started) empty
    last_empty: Mutex<Instant>,
}

impl TcpOrigin {
    fn new(dest: SocketAddr, accept_tx: mpsc::Sender<Accepted>) -> Self {
        Self {
            dest,
            accept_tx: Mutex::new(Some(accept_tx)),
            clients: Mutex::new(HashMap::new()),
            retired: AtomicBool::new(false),
            last_empty: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn dest(&self) -> SocketAddr {
        self.dest
    }

    fn sender(&self) -> Option<mpsc::Sender<Accepted>> {
        self.accept_tx.lock().clone()
    }

    /// Mark the origin dead: no further registrations, accept queue closed.
    fn retire(&self) {
        self.retired.store(true, Ordering::Release);
        self.accept_tx.lock().take();
    }

    fn register(&self, src: SocketAddr, client: Arc<TcpClient>) -> bool {
        let mut clients = self.clients.lock();
        if self.retired.load(Ordering::Acquire) {
            return false;
        }
        clients.insert(src, client);
        true
    }

    /// Remove `client` from the set; stamps `last_empty` when the set
    /// becomes empty so the idle sweep can collect the origin later.
    fn deregister(&self, src: SocketAddr, client: &Arc<TcpClient>) {
        let mut clients = self.clients.lock();
        match clients.get(&src) {
            Some(existing) if Arc::ptr_eq(existing, client) => {
                clients.remove(&src);
                if clients.is_empty() {
                    *self.last_empty.lock() = Instant::now();
                }
            }
            _ => {}
        }
    }

    pub(crate) fn num_clients(&self) -> usize {
        self.clients.lock().len()
    }

    /// How long the origin has been without clients. Only meaningful while
    /// the client set is empty.
    pub(crate) fn idle_for(&self) -> Duration {
        self.last_empty.lock().elapsed()
    }
}

#[cfg(test)]
impl TcpOrigin {
    /// Register a synthetic client so sibling-module tests can pin an
    /// origin as busy.
    pub(crate) fn register_for_test(&self, src: SocketAddr) {
        self.register(src, Arc::new(TcpClient::new(src)));
    }
}

/// Termination state of a TCP client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientState {
    /// Both directions relaying
    Active,
    /// One direction finished; its FIN has been propagated
    HalfClosed,
    /// Both directions finished; the client has left its origin
    Closed,
}

/// One accepted byte-stream paired with its dialed upstream
pub(crate) struct TcpClient {
    src: SocketAddr,
    pub(crate) activity: Activity,
    /// Counts down 2 -> 1 -> 0 as relay directions finish
    open_directions: AtomicU8,
}

impl TcpClient {
    fn new(src: SocketAddr) -> Self {
        Self {
            src,
            activity: Activity::new(),
            open_directions: AtomicU8::new(2),
        }
    }

    pub(crate) fn state(&self) -> ClientState {
        match self.open_directions.load(Ordering::Acquire) {
            2 => ClientState::Active,
            1 => ClientState::HalfClosed,
            _ => ClientState::Closed,
        }
    }

    /// Called at the tail of each relay task. The second caller observes
    /// the transition to `Closed` and deregisters the client; at that
    /// point both relay tasks have finished their copies.
    fn direction_finished(self: &Arc<Self>, label: &'static str, origin: &TcpOrigin) {
        let remaining = self.open_directions.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            debug!("TCP client {} -> {} closed", self.src, origin.dest);
            origin.deregister(self.src, self);
        } else {
            trace!(
                "TCP client {} now {:?} ({} finished)",
                self.src,
                self.state(),
                label
            );
        }
    }
}

/// Per-origin accept task: dials the upstream for every accepted stream.
async fn accept_loop(
    origin: Arc<TcpOrigin>,
    shared: Arc<Shared>,
    mut accept_rx: mpsc::Receiver<Accepted>,
) {
    let mut shutdown = shared.shutdown_rx();
    loop {
        tokio::select! {
            _ = Shared::wait_for_shutdown(&mut shutdown) => break,
            item = accept_rx.recv() => {
                let Some((src, downstream)) = item else { break };
                let mut dial_shutdown = shared.shutdown_rx();
                let dialed = tokio::select! {
                    _ = Shared::wait_for_shutdown(&mut dial_shutdown) => break,
                    result = shared.opts.dial_tcp.dial(origin.dest) => result,
                };
                match dialed {
                    Ok(upstream) => spawn_client(&origin, &shared, src, downstream, upstream),
                    Err(e) => {
                        debug!("upstream dial for {} failed: {}", origin.dest, e);
                        shared.stats.dial_failure();
                        shared.stats.rejected_packet();
                        // dropping the accepted stream resets the flow
                    }
                }
            }
        }
    }
    trace!("accept task for {} stopped", origin.dest);
}

/// Register a client and launch its two relay directions.
fn spawn_client(
    origin: &Arc<TcpOrigin>,
    shared: &Arc<Shared>,
    src: SocketAddr,
    downstream: BoxTcpStream,
    upstream: BoxTcpStream,
) {
    let client = Arc::new(TcpClient::new(src));
    if !origin.register(src, Arc::clone(&client)) {
        debug!("origin {} retired before client {} registered", origin.dest, src);
        return;
    }
    debug!("TCP client {} -> {} established", src, origin.dest);

    let (down_read, down_write) = tokio::io::split(downstream);
    let (up_read, up_write) = tokio::io::split(upstream);

    shared.tracker.spawn(relay_direction(
        down_read,
        up_write,
        "downstream->upstream",
        Arc::clone(&client),
        Arc::clone(origin),
        Arc::clone(shared),
    ));
    shared.tracker.spawn(relay_direction(
        up_read,
        down_write,
        "upstream->downstream",
        client,
        Arc::clone(origin),
        Arc::clone(shared),
    ));
}

/// One direction of a client relay: copy until EOF, error, or shutdown,
/// then half-close the destination of this direction.
async fn relay_direction<R, W>(
    mut reader: R,
    mut writer: W,
    label: &'static str,
    client: Arc<TcpClient>,
    origin: Arc<TcpOrigin>,
    shared: Arc<Shared>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut shutdown = shared.shutdown_rx();
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    loop {
        tokio::select! {
            _ = Shared::wait_for_shutdown(&mut shutdown) => break,
            result = reader.read(&mut buf) => match result {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = writer.write_all(&buf[..n]).await {
                        debug!("TCP relay {} ({}) write error: {}", client.src, label, e);
                        break;
                    }
                    client.activity.touch();
                }
                Err(e) => {
                    debug!("TCP relay {} ({}) read error: {}", client.src, label, e);
                    break;
                }
            }
        }
    }

    // Propagate the FIN so the peer direction can drain and finish
    let _ = writer.shutdown().await;
    client.direction_finished(label, &origin);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::dial::{AsyncStream, TcpDialer};
    use async_trait::async_trait;
    use std::io;
    use std::time::Duration;
    use tokio::io::duplex;

    fn test_addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 9, 1], port))
    }

    fn src_addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 9, 2], port))
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within timeout");
    }

    /// Dialer handing out pre-built streams, oldest first.
    struct QueueDialer(Mutex<Vec<BoxTcpStream>>);

    impl QueueDialer {
        fn new(streams: Vec<BoxTcpStream>) -> Self {
            Self(Mutex::new(streams))
        }
    }

    #[async_trait]
    impl TcpDialer for QueueDialer {
        async fn dial(&self, _dst: SocketAddr) -> io::Result<BoxTcpStream> {
            self.0
                .lock()
                .pop()
                .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "exhausted"))
        }
    }

    /// Echo every byte back until EOF, then propagate the close.
    fn spawn_echo(stream: impl AsyncStream + 'static) {
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(stream);
            let mut buf = [0u8; 1024];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if writer.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = writer.shutdown().await;
        });
    }

    #[tokio::test]
    async fn test_ensure_origin_is_unique_per_destination() {
        let shared = Arc::new(Shared::new(Options::default()));
        let table = TcpOriginTable::new();

        let first = table.ensure_origin(test_addr(80), &shared);
        let second = table.ensure_origin(test_addr(80), &shared);
        let other = table.ensure_origin(test_addr(443), &shared);

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(table.num_origins(), 2);

        shared.request_close();
        shared.tracker.close();
        shared.tracker.wait().await;
    }

    #[tokio::test]
    async fn test_remove_origin_is_noop_with_clients() {
        let shared = Arc::new(Shared::new(Options::default()));
        let table = TcpOriginTable::new();

        let origin = table.ensure_origin(test_addr(80), &shared);
        let client = Arc::new(TcpClient::new(src_addr(1000)));
        assert!(origin.register(src_addr(1000), Arc::clone(&client)));

        table.remove_origin(test_addr(80));
        assert_eq!(table.num_origins(), 1, "origin with clients must stay");

        origin.deregister(src_addr(1000), &client);
        assert_eq!(origin.num_clients(), 0);
        table.remove_origin(test_addr(80));
        assert_eq!(table.num_origins(), 0);

        shared.request_close();
        shared.tracker.close();
        shared.tracker.wait().await;
    }

    #[tokio::test]
    async fn test_relay_echo_and_teardown() {
        let (upstream_local, upstream_peer) = duplex(4096);
        spawn_echo(upstream_peer);

        let opts = Options::default()
            .dial_tcp(QueueDialer::new(vec![Box::new(upstream_local) as BoxTcpStream]));
        let shared = Arc::new(Shared::new(opts));
        let table = Arc::new(TcpOriginTable::new());

        let (client_side, accepted) = duplex(4096);
        table
            .dispatch(src_addr(40000), test_addr(7777), Box::new(accepted), &shared)
            .await;

        let t = Arc::clone(&table);
        wait_until(move || t.num_clients() == 1).await;

        let (mut read_half, mut write_half) = tokio::io::split(client_side);
        write_half.write_all(b"hellotcp").await.unwrap();
        let mut buf = [0u8; 8];
        read_half.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hellotcp");

        // Closing our write side runs the half-close chain through the
        // upstream echo and back; the client must then leave its origin.
        write_half.shutdown().await.unwrap();
        let t = Arc::clone(&table);
        wait_until(move || t.num_clients() == 0).await;

        // The origin lingers for the idle sweep, freshly stamped.
        assert_eq!(table.num_origins(), 1);
        let origin = &table.snapshot()[0];
        assert!(origin.idle_for() < Duration::from_secs(1));

        shared.request_close();
        shared.tracker.close();
        shared.tracker.wait().await;
    }

    #[tokio::test]
    async fn test_dial_failure_drops_flow_and_counts() {
        let opts = Options::default().dial_tcp(QueueDialer::new(Vec::new()));
        let shared = Arc::new(Shared::new(opts));
        let table = Arc::new(TcpOriginTable::new());

        let (_client_side, accepted) = duplex(256);
        table
            .dispatch(src_addr(40001), test_addr(80), Box::new(accepted), &shared)
            .await;

        let s = Arc::clone(&shared);
        wait_until(move || s.stats.dial_failures() == 1).await;
        assert_eq!(shared.stats.rejected_packets(), 1);
        assert_eq!(table.num_clients(), 0);
        assert_eq!(table.num_origins(), 1, "origin exists; dial failure drops only the flow");

        shared.request_close();
        shared.tracker.close();
        shared.tracker.wait().await;
    }

    #[tokio::test]
    async fn test_client_state_countdown() {
        let shared = Arc::new(Shared::new(Options::default()));
        let table = TcpOriginTable::new();
        let origin = table.ensure_origin(test_addr(80), &shared);

        let client = Arc::new(TcpClient::new(src_addr(1)));
        assert!(origin.register(src_addr(1), Arc::clone(&client)));
        assert_eq!(client.state(), ClientState::Active);

        client.direction_finished("downstream->upstream", &origin);
        assert_eq!(client.state(), ClientState::HalfClosed);
        assert_eq!(origin.num_clients(), 1, "half-closed client stays registered");

        client.direction_finished("upstream->downstream", &origin);
        assert_eq!(client.state(), ClientState::Closed);
        assert_eq!(origin.num_clients(), 0);

        shared.request_close();
        shared.tracker.close();
        shared.tracker.wait().await;
    }

    #[tokio::test]
    async fn test_clear_drops_everything() {
        let shared = Arc::new(Shared::new(Options::default()));
        let table = TcpOriginTable::new();
        table.ensure_origin(test_addr(80), &shared);
        let origin = table.ensure_origin(test_addr(443), &shared);
        origin.register(src_addr(5), Arc::new(TcpClient::new(src_addr(5))));

        table.clear();
        assert_eq!(table.num_origins(), 0);
        assert_eq!(table.num_clients(), 0);

        shared.request_close();
        shared.tracker.close();
        shared.tracker.wait().await;
    }
}
