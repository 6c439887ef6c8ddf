//! Link layer between the TUN device and the user-space stack
//!
//! Two pump tasks move raw IP packets: ingress reads one packet per call
//! from the TUN read half and queues it for the stack, counting each
//! accepted packet; the injector drains the stack's outbound queue and
//! writes each packet to the TUN write half, serializing all TUN writes
//! through the single task.
//!
//! [`PacketChannel`] adapts the packet queues to the
//! `AsyncRead + AsyncWrite` link endpoint the stack consumes. One `read`
//! yields one queued packet; one `write` queues one packet. It doubles as
//! an in-memory TUN device in tests.
//!
//! The two queues are deliberately asymmetric. The inbound queue is
//! bounded: when the stack stops draining it, the TUN read loop stalls and
//! backpressure lands in the kernel's TUN queue. The outbound queue is
//! unbounded so the stack's packet emission never blocks mid-poll; the
//! amount in flight is already bounded by the relay windows, and the
//! injector drains it continuously.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ProxyError;
use crate::proxy::Shared;

/// Packet-framed `AsyncRead + AsyncWrite` over a pair of queues
pub struct PacketChannel {
    /// Packets to surface from `read`
    inbound: mpsc::Receiver<BytesMut>,
    /// Packets queued by `write`
    outbound: mpsc::UnboundedSender<BytesMut>,
    /// Unread remainder of the packet currently being surfaced
    carry: BytesMut,
}

impl PacketChannel {
    /// Build a channel from existing queue ends.
    pub fn new(
        inbound: mpsc::Receiver<BytesMut>,
        outbound: mpsc::UnboundedSender<BytesMut>,
    ) -> Self {
        Self {
            inbound,
            outbound,
            carry: BytesMut::new(),
        }
    }

    /// Create a channel plus the far ends of its two queues.
    ///
    /// Returns `(channel, inbound_tx, outbound_rx)`: packets sent on
    /// `inbound_tx` surface from the channel's reads, and packets written
    /// to the channel arrive on `outbound_rx`. `capacity` bounds the
    /// inbound queue only.
    pub fn create_pair(
        capacity: usize,
    ) -> (
        Self,
        mpsc::Sender<BytesMut>,
        mpsc::UnboundedReceiver<BytesMut>,
    ) {
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (Self::new(in_rx, out_tx), in_tx, out_rx)
    }
}

impl AsyncRead for PacketChannel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // Refill the carry from the queue, skipping zero-length packets so
        // they never read as EOF.
        while this.carry.is_empty() {
            match this.inbound.poll_recv(cx) {
                Poll::Ready(Some(packet)) => this.carry = packet,
                // Queue closed: a zero-byte read is the device's EOF
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }

        let n = this.carry.len().min(buf.remaining());
        buf.put_slice(&this.carry[..n]);
        this.carry.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for PacketChannel {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        // One write, one packet; the unbounded queue accepts or is closed.
        match self.outbound.send(BytesMut::from(buf)) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "packet queue closed",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Writes land in the queue immediately; nothing to flush
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Read IP packets from the TUN and hand them to the stack.
///
/// A zero-length read is device EOF and triggers orderly shutdown; a read
/// error while running is fatal, and so is the stack's side of the link
/// closing before shutdown was requested.
pub(crate) async fn ingress_task<R>(
    mut tun: R,
    stack_tx: mpsc::Sender<BytesMut>,
    shared: Arc<Shared>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; usize::from(shared.opts.mtu)];
    let mut shutdown = shared.shutdown_rx();

    loop {
        tokio::select! {
            _ = Shared::wait_for_shutdown(&mut shutdown) => break,
            result = tun.read(&mut buf) => match result {
                Ok(0) => {
                    debug!("TUN device reached EOF, shutting down");
                    shared.request_close();
                    break;
                }
                Ok(n) => {
                    if stack_tx.send(BytesMut::from(&buf[..n])).await.is_err() {
                        if !shared.shutdown_requested() {
                            shared.fail(ProxyError::stack(
                                "link queue into the stack closed while running",
                            ));
                        }
                        break;
                    }
                    shared.stats.accepted_packet();
                }
                Err(e) => {
                    shared.fail(ProxyError::Device(e));
                    break;
                }
            }
        }
    }

    debug!("packet ingress stopped");
}

/// Write stack-emitted IP packets back to the TUN.
///
/// The single task serializes all TUN writes. A write error is fatal, and
/// so is the stack's emission queue closing before shutdown was requested.
pub(crate) async fn injector_task<W>(
    mut tun: W,
    mut stack_rx: mpsc::UnboundedReceiver<BytesMut>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Unpin,
{
    let mut shutdown = shared.shutdown_rx();

    loop {
        tokio::select! {
            _ = Shared::wait_for_shutdown(&mut shutdown) => break,
            packet = stack_rx.recv() => match packet {
                None => {
                    if !shared.shutdown_requested() {
                        shared.fail(ProxyError::stack(
                            "stack stopped emitting packets while running",
                        ));
                    }
                    break;
                }
                Some(packet) => {
                    if let Err(e) = tun.write_all(&packet).await {
                        shared.fail(ProxyError::Device(e));
                        break;
                    }
                }
            }
        }
    }

    debug!("link injector stopped");
}
