//! TUN device layer
//!
//! The proxy consumes the TUN as an async packet device: every `read`
//! returns exactly one raw IP packet and every `write` emits one. Anything
//! satisfying [`TunDevice`] works, which is how tests substitute an
//! in-memory device (see [`PacketChannel`](crate::link::PacketChannel)).
//!
//! On Linux, [`open_tun`] creates a real kernel interface. This requires
//! CAP_NET_ADMIN.

use tokio::io::{AsyncRead, AsyncWrite};

/// An async packet device with one-packet-per-read semantics
pub trait TunDevice: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> TunDevice for T {}

#[cfg(target_os = "linux")]
pub use linux::open_tun;

#[cfg(target_os = "linux")]
mod linux {
    use std::io;
    use std::net::Ipv4Addr;

    use tun::AbstractDevice;
    use tracing::info;

    /// Create a TUN interface and return its async device handle.
    ///
    /// # Arguments
    ///
    /// * `name_hint` - Interface name (e.g. "tun0"); empty lets the system
    ///   assign one.
    /// * `address` - IP address assigned to the interface.
    /// * `netmask` - Netmask of the interface.
    /// * `mtu` - Maximum transmission unit.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be created, which usually
    /// means missing privileges.
    pub fn open_tun(
        name_hint: &str,
        address: Ipv4Addr,
        netmask: Ipv4Addr,
        mtu: u16,
    ) -> io::Result<tun::AsyncDevice> {
        let mut config = tun::Configuration::default();
        config.address(address).netmask(netmask).mtu(mtu).up();
        if !name_hint.is_empty() {
            config.tun_name(name_hint);
        }

        let device = tun::create_as_async(&config).map_err(|e| {
            io::Error::other(format!(
                "could not bring up TUN interface (CAP_NET_ADMIN missing?): {e}"
            ))
        })?;

        // The kernel may have picked its own name; best-effort readback
        let name = device
            .tun_name()
            .unwrap_or_else(|_| String::from("<unnamed>"));
        info!("TUN interface {} up: {}/{}, mtu {}", name, address, netmask, mtu);

        Ok(device)
    }

    // Creating a real device needs CAP_NET_ADMIN; covered by the
    // root-gated integration tests.
}
