// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Routines for ICMP testing.

use crate::pkt::ip_pkt;
use crate::pkt::smol;
use glb_api::IpAddr;
use smoltcp::phy::ChecksumCapabilities as CsumCapab;
use smoltcp::wire::Icmpv4DstUnreachable;
use smoltcp::wire::Icmpv4Packet;
use smoltcp::wire::Icmpv4Repr;
use smoltcp::wire::Icmpv6DstUnreachable;
use smoltcp::wire::Icmpv6Packet;
use smoltcp::wire::Icmpv6Repr;
use smoltcp::wire::IpProtocol;
use smoltcp::wire::Ipv4Packet;
use smoltcp::wire::Ipv4Repr;
use smoltcp::wire::Ipv6Packet;
use smoltcp::wire::Ipv6Repr;

/// The number of bytes past the IP header an ICMP error quotes.
pub const QUOTE_LEN: usize = 8;

pub enum IcmpEchoType {
    Req,
    Reply,
}

pub fn gen_icmp_echo(
    etype: IcmpEchoType,
    src: IpAddr,
    dst: IpAddr,
    ident: u16,
    seq_no: u16,
    data: &[u8],
) -> Vec<u8> {
    match (src, dst) {
        (IpAddr::Ip4(_), IpAddr::Ip4(_)) => {
            let icmp = match etype {
                IcmpEchoType::Req => {
                    Icmpv4Repr::EchoRequest { ident, seq_no, data }
                }
                IcmpEchoType::Reply => {
                    Icmpv4Repr::EchoReply { ident, seq_no, data }
                }
            };
            let mut body = vec![0u8; icmp.buffer_len()];
            let mut req = Icmpv4Packet::new_unchecked(&mut body);
            icmp.emit(&mut req, &CsumCapab::default());
            ip_pkt(src, dst, IpProtocol::Icmp, &body)
        }

        (IpAddr::Ip6(_), IpAddr::Ip6(_)) => {
            let icmp = match etype {
                IcmpEchoType::Req => {
                    Icmpv6Repr::EchoRequest { ident, seq_no, data }
                }
                IcmpEchoType::Reply => {
                    Icmpv6Repr::EchoReply { ident, seq_no, data }
                }
            };
            let mut body = vec![0u8; icmp.buffer_len()];
            let mut req = Icmpv6Packet::new_unchecked(&mut body);
            icmp.emit(&smol(src), &smol(dst), &mut req, &CsumCapab::default());
            ip_pkt(src, dst, IpProtocol::Icmpv6, &body)
        }

        (_, _) => panic!("IP src and dst versions must match"),
    }
}

pub fn gen_icmp_echo_req(src: IpAddr, dst: IpAddr, data: &[u8]) -> Vec<u8> {
    gen_icmp_echo(IcmpEchoType::Req, src, dst, 7, 1, data)
}

/// The kinds of error a router or host may send about `orig`.
#[derive(Clone, Copy, Debug)]
pub enum IcmpErrorKind {
    PortUnreachable,

    /// Fragmentation needed (IPv4) or packet too big (IPv6).
    TooBig { mtu: u16 },
}

/// Generate the ICMP error `from` would send back to the source of
/// `orig`, quoting its IP header and first eight bytes of payload.
pub fn gen_icmp_error(
    from: IpAddr,
    kind: IcmpErrorKind,
    orig: &[u8],
) -> Vec<u8> {
    match from {
        IpAddr::Ip4(_) => gen_icmpv4_error(from, kind, orig),
        IpAddr::Ip6(_) => gen_icmpv6_error(from, kind, orig),
    }
}

fn gen_icmpv4_error(from: IpAddr, kind: IcmpErrorKind, orig: &[u8]) -> Vec<u8> {
    let orig = Ipv4Packet::new_checked(orig).unwrap();
    let header = Ipv4Repr::parse(&orig, &CsumCapab::default()).unwrap();
    let data = &orig.payload()[..QUOTE_LEN];

    let reason = match kind {
        IcmpErrorKind::PortUnreachable => {
            Icmpv4DstUnreachable::PortUnreachable
        }
        IcmpErrorKind::TooBig { .. } => Icmpv4DstUnreachable::FragRequired,
    };
    let icmp = Icmpv4Repr::DstUnreachable { reason, header, data };

    let mut body = vec![0u8; icmp.buffer_len()];
    let mut err = Icmpv4Packet::new_unchecked(&mut body);
    icmp.emit(&mut err, &CsumCapab::default());

    // The next-hop MTU lives in the otherwise unused second half of
    // the header.
    if let IcmpErrorKind::TooBig { mtu } = kind {
        body[6..8].copy_from_slice(&mtu.to_be_bytes());
        Icmpv4Packet::new_unchecked(&mut body).fill_checksum();
    }

    let to = IpAddr::Ip4(header.src_addr.into());
    ip_pkt(from, to, IpProtocol::Icmp, &body)
}

fn gen_icmpv6_error(from: IpAddr, kind: IcmpErrorKind, orig: &[u8]) -> Vec<u8> {
    let orig = Ipv6Packet::new_checked(orig).unwrap();
    let header = Ipv6Repr::parse(&orig).unwrap();
    let data = &orig.payload()[..QUOTE_LEN];

    let icmp = match kind {
        IcmpErrorKind::PortUnreachable => Icmpv6Repr::DstUnreachable {
            reason: Icmpv6DstUnreachable::PortUnreachable,
            header,
            data,
        },
        IcmpErrorKind::TooBig { mtu } => {
            Icmpv6Repr::PktTooBig { mtu: u32::from(mtu), header, data }
        }
    };

    let to = IpAddr::Ip6(header.src_addr.into());
    let mut body = vec![0u8; icmp.buffer_len()];
    let mut err = Icmpv6Packet::new_unchecked(&mut body);
    icmp.emit(&smol(from), &smol(to), &mut err, &CsumCapab::default());
    ip_pkt(from, to, IpProtocol::Icmpv6, &body)
}
