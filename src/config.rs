//! Proxy options and tuning constants
//!
//! `Options` carries everything the proxy needs besides the TUN device:
//! flow timeouts, the stats period, the TUN MTU, and the two upstream
//! dialers. Validation happens once at construction.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::dial::{DirectTcpDialer, DirectUdpDialer, TcpDialer, UdpDialer};
use crate::error::{ProxyError, Result};

// =============================================================================
// Defaults
// =============================================================================

/// Default idle timeout before an inactive flow or empty origin is evicted
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Default period of the reaper/stats task
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(15);

/// Default TUN MTU: the largest IP packet read from the device
pub const DEFAULT_MTU: u16 = 1500;

// =============================================================================
// Tuning
// =============================================================================

/// Capacity of the packet queues between the TUN and the stack
///
/// Large enough to absorb bursts; when full, the TUN read loop stalls,
/// which pushes backpressure into the kernel's TUN queue.
pub(crate) const PACKET_CHANNEL_CAPACITY: usize = 1024;

/// Capacity of each origin's accept queue
pub(crate) const ACCEPT_QUEUE_CAPACITY: usize = 64;

/// Buffer size for one direction of a TCP relay
pub(crate) const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Consecutive stack accept failures tolerated before the stack is
/// declared dead and the proxy shuts down with a fatal error
pub(crate) const STACK_ACCEPT_FAILURE_LIMIT: usize = 16;

/// Buffer size for a single UDP datagram in either direction
pub(crate) const DATAGRAM_BUFFER_SIZE: usize = 64 * 1024;

/// Options for [`Proxy::new`](crate::Proxy::new)
///
/// All fields have defaults; tests and embedders typically override the
/// timeouts and the dialers.
#[derive(Clone)]
pub struct Options {
    /// A flow is evictable once no payload has crossed it for this long
    pub idle_timeout: Duration,
    /// Period of the idle sweep and counter logging
    pub stats_interval: Duration,
    /// Maximum IP packet size read from the TUN
    pub mtu: u16,
    /// Dialer used to re-originate intercepted TCP flows
    pub dial_tcp: Arc<dyn TcpDialer>,
    /// Dialer used to re-originate intercepted UDP flows
    pub dial_udp: Arc<dyn UdpDialer>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            stats_interval: DEFAULT_STATS_INTERVAL,
            mtu: DEFAULT_MTU,
            dial_tcp: Arc::new(DirectTcpDialer),
            dial_udp: Arc::new(DirectUdpDialer),
        }
    }
}

impl Options {
    /// Create options with the default direct dialers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the idle timeout
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the stats/reaper interval
    #[must_use]
    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    /// Set the TUN MTU
    #[must_use]
    pub fn mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    /// Set the upstream TCP dialer
    #[must_use]
    pub fn dial_tcp(mut self, dialer: impl TcpDialer + 'static) -> Self {
        self.dial_tcp = Arc::new(dialer);
        self
    }

    /// Set the upstream UDP dialer
    #[must_use]
    pub fn dial_udp(mut self, dialer: impl UdpDialer + 'static) -> Self {
        self.dial_udp = Arc::new(dialer);
        self
    }

    /// Validate the options
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Config` for zero durations or a zero MTU.
    pub fn validate(&self) -> Result<()> {
        if self.idle_timeout.is_zero() {
            return Err(ProxyError::config("idle_timeout must be non-zero"));
        }
        if self.stats_interval.is_zero() {
            return Err(ProxyError::config("stats_interval must be non-zero"));
        }
        if self.mtu == 0 {
            return Err(ProxyError::config("mtu must be non-zero"));
        }
        Ok(())
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("idle_timeout", &self.idle_timeout)
            .field("stats_interval", &self.stats_interval)
            .field("mtu", &self.mtu)
            .finish_non_exhaustive()
    }
}
