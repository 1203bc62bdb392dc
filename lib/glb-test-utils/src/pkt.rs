// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Routines for generating inner TCP and UDP packets.

use glb_api::IpAddr;
use glb_redirect::engine::tcp::TcpFlags;
use smoltcp::phy::ChecksumCapabilities as CsumCapab;
use smoltcp::wire::IpAddress;
use smoltcp::wire::IpProtocol;
use smoltcp::wire::Ipv4Packet;
use smoltcp::wire::Ipv4Repr;
use smoltcp::wire::Ipv6Packet;
use smoltcp::wire::Ipv6Repr;
use smoltcp::wire::TcpPacket;
use smoltcp::wire::TcpSeqNumber;
use smoltcp::wire::UdpPacket;

pub const TCP_HDR_LEN: usize = 20;
pub const UDP_HDR_LEN: usize = 8;

pub(crate) fn smol(ip: IpAddr) -> IpAddress {
    match ip {
        IpAddr::Ip4(ip4) => IpAddress::Ipv4(ip4.into()),
        IpAddr::Ip6(ip6) => IpAddress::Ipv6(ip6.into()),
    }
}

/// Wrap an upper-layer payload in an IP header of the family of `src`.
pub fn ip_pkt(
    src: IpAddr,
    dst: IpAddr,
    proto: IpProtocol,
    ulp: &[u8],
) -> Vec<u8> {
    match (src, dst) {
        (IpAddr::Ip4(src), IpAddr::Ip4(dst)) => {
            let ip = Ipv4Repr {
                src_addr: src.into(),
                dst_addr: dst.into(),
                next_header: proto,
                payload_len: ulp.len(),
                hop_limit: 64,
            };
            let mut bytes = vec![0u8; ip.buffer_len() + ulp.len()];
            let mut pkt = Ipv4Packet::new_unchecked(&mut bytes);
            ip.emit(&mut pkt, &CsumCapab::default());
            bytes[ip.buffer_len()..].copy_from_slice(ulp);
            bytes
        }

        (IpAddr::Ip6(src), IpAddr::Ip6(dst)) => {
            let ip = Ipv6Repr {
                src_addr: src.into(),
                dst_addr: dst.into(),
                next_header: proto,
                payload_len: ulp.len(),
                hop_limit: 64,
            };
            let mut bytes = vec![0u8; ip.buffer_len() + ulp.len()];
            let mut pkt = Ipv6Packet::new_unchecked(&mut bytes);
            ip.emit(&mut pkt);
            bytes[ip.buffer_len()..].copy_from_slice(ulp);
            bytes
        }

        (_, _) => panic!("IP src and dst versions must match"),
    }
}

/// Generate a TCP segment from `src` to `dst`.
pub fn tcp_pkt(
    src: (IpAddr, u16),
    dst: (IpAddr, u16),
    flags: TcpFlags,
    body: &[u8],
) -> Vec<u8> {
    let mut seg = vec![0u8; TCP_HDR_LEN + body.len()];
    let mut tcp = TcpPacket::new_unchecked(&mut seg);
    tcp.set_src_port(src.1);
    tcp.set_dst_port(dst.1);
    tcp.set_seq_number(TcpSeqNumber(0x4C_9A_28_1D));
    tcp.set_header_len(TCP_HDR_LEN as u8);
    tcp.set_fin(flags.contains(TcpFlags::FIN));
    tcp.set_syn(flags.contains(TcpFlags::SYN));
    tcp.set_rst(flags.contains(TcpFlags::RST));
    tcp.set_psh(flags.contains(TcpFlags::PSH));
    tcp.set_ack(flags.contains(TcpFlags::ACK));
    if flags.contains(TcpFlags::ACK) {
        tcp.set_ack_number(TcpSeqNumber(1));
    }
    tcp.set_window_len(64240);
    tcp.payload_mut().copy_from_slice(body);
    tcp.fill_checksum(&smol(src.0), &smol(dst.0));

    ip_pkt(src.0, dst.0, IpProtocol::Tcp, &seg)
}

pub fn tcp_syn(src: (IpAddr, u16), dst: (IpAddr, u16)) -> Vec<u8> {
    tcp_pkt(src, dst, TcpFlags::SYN, &[])
}

pub fn tcp_ack(src: (IpAddr, u16), dst: (IpAddr, u16)) -> Vec<u8> {
    tcp_pkt(src, dst, TcpFlags::ACK, &[])
}

pub fn tcp_rst(src: (IpAddr, u16), dst: (IpAddr, u16)) -> Vec<u8> {
    tcp_pkt(src, dst, TcpFlags::RST, &[])
}

/// Generate a UDP datagram from `src` to `dst`.
pub fn udp_pkt(src: (IpAddr, u16), dst: (IpAddr, u16), body: &[u8]) -> Vec<u8> {
    let len = UDP_HDR_LEN + body.len();
    let mut dgram = vec![0u8; len];
    let mut udp = UdpPacket::new_unchecked(&mut dgram);
    udp.set_src_port(src.1);
    udp.set_dst_port(dst.1);
    udp.set_len(len as u16);
    udp.payload_mut().copy_from_slice(body);
    udp.fill_checksum(&smol(src.0), &smol(dst.0));

    ip_pkt(src.0, dst.0, IpProtocol::Udp, &dgram)
}
