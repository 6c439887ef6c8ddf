//! Shared helpers for the integration tests: raw packet construction,
//! parsing, and echo servers.

#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Once;

use tokio::net::UdpSocket;

static TRACING: Once = Once::new();

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Internet ones'-complement checksum.
fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += u32::from(word);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Build a checksummed IPv4 UDP packet.
pub fn build_udp_packet(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let udp_len = 8 + payload.len();
    let total_len = 20 + udp_len;

    let mut packet = Vec::with_capacity(total_len);

    // IPv4 header, no options
    packet.push(0x45);
    packet.push(0x00);
    packet.extend_from_slice(&u16::try_from(total_len).unwrap().to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x00]); // identification
    packet.extend_from_slice(&[0x40, 0x00]); // DF, no fragment offset
    packet.push(64); // TTL
    packet.push(17); // UDP
    packet.extend_from_slice(&[0x00, 0x00]); // header checksum placeholder
    packet.extend_from_slice(&src.ip().octets());
    packet.extend_from_slice(&dst.ip().octets());
    let ip_csum = checksum(&packet[..20]);
    packet[10..12].copy_from_slice(&ip_csum.to_be_bytes());

    // UDP header
    packet.extend_from_slice(&src.port().to_be_bytes());
    packet.extend_from_slice(&dst.port().to_be_bytes());
    packet.extend_from_slice(&u16::try_from(udp_len).unwrap().to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x00]); // UDP checksum placeholder
    packet.extend_from_slice(payload);

    // UDP checksum over pseudo-header + header + payload
    let mut pseudo = Vec::with_capacity(12 + udp_len);
    pseudo.extend_from_slice(&src.ip().octets());
    pseudo.extend_from_slice(&dst.ip().octets());
    pseudo.push(0);
    pseudo.push(17);
    pseudo.extend_from_slice(&u16::try_from(udp_len).unwrap().to_be_bytes());
    pseudo.extend_from_slice(&packet[20..]);
    let udp_csum = match checksum(&pseudo) {
        0 => 0xffff,
        c => c,
    };
    packet[26..28].copy_from_slice(&udp_csum.to_be_bytes());

    packet
}

/// Parse an IPv4 UDP packet into `(src, dst, payload)`.
pub fn parse_udp_packet(packet: &[u8]) -> Option<(SocketAddr, SocketAddr, Vec<u8>)> {
    if packet.len() < 20 || packet[0] >> 4 != 4 {
        return None;
    }
    let ihl = usize::from(packet[0] & 0x0f) * 4;
    if packet[9] != 17 || packet.len() < ihl + 8 {
        return None;
    }

    let src_ip = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
    let dst_ip = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
    let src_port = u16::from_be_bytes([packet[ihl], packet[ihl + 1]]);
    let dst_port = u16::from_be_bytes([packet[ihl + 2], packet[ihl + 3]]);
    let udp_len = usize::from(u16::from_be_bytes([packet[ihl + 4], packet[ihl + 5]]));
    if udp_len < 8 || packet.len() < ihl + udp_len {
        return None;
    }
    let payload = packet[ihl + 8..ihl + udp_len].to_vec();

    Some((
        SocketAddr::new(src_ip.into(), src_port),
        SocketAddr::new(dst_ip.into(), dst_port),
        payload,
    ))
}

/// Spawn a UDP echo server on localhost; returns its address.
pub async fn udp_echo_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            if socket.send_to(&buf[..n], peer).await.is_err() {
                break;
            }
        }
    });
    addr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_packet_roundtrip() {
        let src = SocketAddrV4::new(Ipv4Addr::new(10, 0, 1, 2), 40000);
        let dst = SocketAddrV4::new(Ipv4Addr::new(10, 0, 1, 1), 7777);
        let packet = build_udp_packet(src, dst, b"helloudp");

        let (parsed_src, parsed_dst, payload) = parse_udp_packet(&packet).unwrap();
        assert_eq!(parsed_src, SocketAddr::from(src));
        assert_eq!(parsed_dst, SocketAddr::from(dst));
        assert_eq!(payload, b"helloudp");
    }
}
