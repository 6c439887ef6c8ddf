//! tunproxy: user-space TCP/UDP proxy for TUN devices
//!
//! This crate terminates TCP and UDP flows arriving on a TUN interface in
//! a user-space TCP/IP stack and re-originates each flow through a
//! caller-supplied dialer, relaying bytes in both directions until the
//! flow ends, goes idle, or the proxy closes.
//!
//! # Architecture
//!
//! ```text
//! TUN device ──ingress──> link channel ──> user-space stack
//!                                               │ accept
//!                                               v
//!                        ┌── TCP origin table ── per-destination accept
//!              demux ────┤        │               task, dial_tcp, two
//!                        │     clients            relay tasks per client
//!                        │
//!                        └── UDP flow table ──── per-tuple flow, dial_udp,
//!                                                 one relay task per flow
//! ```
//!
//! Reply packets produced by the stack flow back through the link channel
//! and a single injector task onto the TUN. An idle reaper sweeps empty
//! origins and inactive flows every `stats_interval`; `close` tears the
//! whole pipeline down and joins every task it spawned.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tunproxy::{Options, Proxy};
//!
//! # #[cfg(target_os = "linux")]
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let device = tunproxy::open_tun("", "10.0.1.2".parse()?, "255.255.255.0".parse()?, 1500)?;
//! let proxy = Arc::new(Proxy::new(device, Options::default())?);
//!
//! let server = tokio::spawn({
//!     let proxy = Arc::clone(&proxy);
//!     async move { proxy.serve().await }
//! });
//!
//! // ... traffic routed into the TUN is proxied ...
//!
//! proxy.close().await?;
//! server.await??;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: options and validation
//! - [`device`]: TUN device layer
//! - [`dial`]: upstream dialer interfaces
//! - [`error`]: error types
//! - [`link`]: packet pumps between the TUN and the stack

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod device;
pub mod dial;
pub mod error;
pub mod link;
mod proxy;
mod reaper;
mod stats;
mod tcp;
mod udp;

pub use config::Options;
#[cfg(target_os = "linux")]
pub use device::open_tun;
pub use device::TunDevice;
pub use dial::{
    AsyncStream, BoxDatagram, BoxTcpStream, DirectTcpDialer, DirectUdpDialer, OutboundDatagram,
    TcpDialer, UdpDialer,
};
pub use error::{ProxyError, Result};
pub use link::PacketChannel;
pub use proxy::Proxy;
pub use stats::StatsSnapshot;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
