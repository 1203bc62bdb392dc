// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The outer envelope: IP, UDP, GUE, and the hop chain, wrapped around
//! an inner packet that is carried opaquely.

use super::gue::GueHdr;
use super::gue::GueHdrError;
use super::gue::GueMeta;
use super::hop_chain::HopChain;
use super::ip4;
use super::ip4::Ipv4Hdr;
use super::ip4::Ipv4Push;
use super::ip6;
use super::ip6::Ipv6Hdr;
use super::ip6::Ipv6Push;
use super::packet::PacketReader;
use super::packet::ParseError;
use super::udp;
use super::udp::UdpHdr;
use super::udp::UdpHdrError;
use crate::api::AddrFamily;
use crate::api::DEFAULT_TTL;
use crate::api::GUE_PORT;
use crate::api::GUE_PROTO_IPV4;
use crate::api::GUE_PROTO_IPV6;
use crate::api::IpAddr;
use crate::api::Ipv4Addr;
use crate::api::Ipv6Addr;
use crate::api::PROTO_UDP;
use crate::api::Protocol;
use crate::d_error::DError;
use core::fmt;
use core::fmt::Display;

/// The outer IP header of an encapsulated packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OuterIp {
    V4 { src: Ipv4Addr, dst: Ipv4Addr, tos: u8, ttl: u8, ident: u16 },
    V6 {
        src: Ipv6Addr,
        dst: Ipv6Addr,
        traffic_class: u8,
        flow_label: u32,
        hop_limit: u8,
    },
}

impl OuterIp {
    pub fn src(&self) -> IpAddr {
        match self {
            Self::V4 { src, .. } => (*src).into(),
            Self::V6 { src, .. } => (*src).into(),
        }
    }

    pub fn dst(&self) -> IpAddr {
        match self {
            Self::V4 { dst, .. } => (*dst).into(),
            Self::V6 { dst, .. } => (*dst).into(),
        }
    }

    pub fn family(&self) -> AddrFamily {
        match self {
            Self::V4 { .. } => AddrFamily::V4,
            Self::V6 { .. } => AddrFamily::V6,
        }
    }

    pub fn ttl(&self) -> u8 {
        match self {
            Self::V4 { ttl, .. } => *ttl,
            Self::V6 { hop_limit, .. } => *hop_limit,
        }
    }

    fn hdr_len(&self) -> usize {
        match self {
            Self::V4 { .. } => Ipv4Hdr::BASE_SIZE,
            Self::V6 { .. } => Ipv6Hdr::BASE_SIZE,
        }
    }

    /// The same header with new endpoints and a fresh TTL. The
    /// addresses must be of this header's family.
    fn readdress(
        &self,
        new_src: IpAddr,
        new_dst: IpAddr,
    ) -> Result<Self, EncapBuildError> {
        match (*self, new_src, new_dst) {
            (
                Self::V4 { tos, ident, .. },
                IpAddr::Ip4(src),
                IpAddr::Ip4(dst),
            ) => Ok(Self::V4 { src, dst, tos, ttl: DEFAULT_TTL, ident }),
            (
                Self::V6 { traffic_class, flow_label, .. },
                IpAddr::Ip6(src),
                IpAddr::Ip6(dst),
            ) => Ok(Self::V6 {
                src,
                dst,
                traffic_class,
                flow_label,
                hop_limit: DEFAULT_TTL,
            }),
            _ => Err(EncapBuildError::FamilyMismatch),
        }
    }
}

/// Errors building an envelope, as opposed to reading one off the
/// wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq, DError)]
pub enum EncapBuildError {
    /// The outer addresses are not all of one family, or differ from
    /// the family of the hop chain.
    FamilyMismatch,
    EmptyInner,
    BadInnerVersion { vsn: u8 },

    /// The frame would not fit the outer IP or UDP length fields.
    TooLong { len: usize },
    Gue(GueHdrError),
}

impl Display for EncapBuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FamilyMismatch => write!(f, "address family mismatch"),
            Self::EmptyInner => write!(f, "no inner packet"),
            Self::BadInnerVersion { vsn } => {
                write!(f, "inner packet has IP version {vsn}")
            }
            Self::TooLong { len } => {
                write!(f, "{len} bytes exceeds the IP length limit")
            }
            Self::Gue(e) => write!(f, "GUE header: {e:?}"),
        }
    }
}

/// A decoded encapsulated datagram.
///
/// The inner packet is borrowed from the received frame and is never
/// modified; only the envelope around it is rebuilt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EncapPacket<'a> {
    pub outer: OuterIp,
    pub udp_src: u16,
    pub udp_dst: u16,
    pub gue: GueMeta,
    pub chain: HopChain,
    pub inner: &'a [u8],
}

impl<'a> EncapPacket<'a> {
    /// Wrap `inner` in a fresh envelope, as an encapsulating node
    /// would.
    pub fn new(
        src: IpAddr,
        dst: IpAddr,
        udp_src: u16,
        chain: HopChain,
        inner: &'a [u8],
    ) -> Result<Self, EncapBuildError> {
        let vsn = inner.first().ok_or(EncapBuildError::EmptyInner)? >> 4;
        let gue_proto = match vsn {
            4 => GUE_PROTO_IPV4,
            6 => GUE_PROTO_IPV6,
            _ => return Err(EncapBuildError::BadInnerVersion { vsn }),
        };

        let outer = match (src, dst) {
            (IpAddr::Ip4(src), IpAddr::Ip4(dst)) => OuterIp::V4 {
                src,
                dst,
                tos: 0,
                ttl: DEFAULT_TTL,
                ident: 0,
            },
            (IpAddr::Ip6(src), IpAddr::Ip6(dst)) => OuterIp::V6 {
                src,
                dst,
                traffic_class: 0,
                flow_label: 0,
                hop_limit: DEFAULT_TTL,
            },
            _ => return Err(EncapBuildError::FamilyMismatch),
        };

        if chain.family() != outer.family() {
            return Err(EncapBuildError::FamilyMismatch);
        }

        let gue = GueMeta::new(gue_proto, chain.wire_len())
            .map_err(EncapBuildError::Gue)?;

        let pkt =
            Self { outer, udp_src, udp_dst: GUE_PORT, gue, chain, inner };
        pkt.check_len()?;
        Ok(pkt)
    }

    /// Decode a frame that starts at the outer IP header.
    pub fn parse(
        frame: &'a [u8],
        max_hops: u8,
    ) -> Result<Self, ParseError> {
        let vsn = PacketReader::new(frame).peek_u8()? >> 4;

        let (outer, proto, payload) = match vsn {
            4 => {
                let (ip, payload) = Ipv4Hdr::parse_datagram(frame)?;
                if ip.is_fragment() {
                    return Err(ParseError::OuterFragment);
                }
                let outer = OuterIp::V4 {
                    src: ip.src(),
                    dst: ip.dst(),
                    tos: ip.tos(),
                    ttl: ip.ttl(),
                    ident: ip.ident(),
                };
                (outer, ip.proto_raw(), payload)
            }

            6 => {
                let (ip, payload) = Ipv6Hdr::parse_datagram(frame)?;
                if ip.frag_offset().is_some() {
                    return Err(ParseError::OuterFragment);
                }
                let outer = OuterIp::V6 {
                    src: ip.src(),
                    dst: ip.dst(),
                    traffic_class: ip.traffic_class(),
                    flow_label: ip.flow_label(),
                    hop_limit: ip.hop_limit(),
                };
                (outer, ip.proto_raw(), payload)
            }

            _ => return Err(ParseError::BadIpVersion { vsn }),
        };

        if proto != PROTO_UDP {
            return Err(ParseError::NotUdp { proto });
        }

        let mut rdr = PacketReader::new(payload);
        let udp = UdpHdr::parse(&mut rdr)?;
        let udp_len = usize::from(udp.len());
        if udp_len > payload.len() {
            return Err(UdpHdrError::BadLength { length: udp.len() }.into());
        }

        let dst_port = udp.dst_port();
        if dst_port != GUE_PORT {
            return Err(ParseError::NotGue { dst_port });
        }

        // Anything past the UDP length is not ours.
        let mut rdr = PacketReader::new(&payload[UdpHdr::SIZE..udp_len]);
        let gue = GueHdr::parse(&mut rdr)?;
        let opts = rdr
            .slice(gue.opt_len())
            .map_err(GueHdrError::from)?;
        let chain = HopChain::parse(opts, outer.family(), max_hops)?;

        let inner = rdr.rest();
        let inner_vsn = match inner.first() {
            Some(b) => b >> 4,
            None => return Err(ParseError::EmptyInner),
        };

        let expected = match gue.proto() {
            GUE_PROTO_IPV4 => 4,
            _ => 6,
        };
        if inner_vsn != expected {
            return Err(ParseError::InnerVersionMismatch {
                gue_proto: gue.proto(),
                vsn: inner_vsn,
            });
        }

        Ok(Self {
            outer,
            udp_src: udp.src_port(),
            udp_dst: dst_port,
            gue: gue.meta(),
            chain,
            inner,
        })
    }

    /// The same inner packet in a new envelope. UDP ports and GUE
    /// fields carry over; the outer TTL starts fresh.
    pub fn reencap(
        &self,
        src: IpAddr,
        dst: IpAddr,
        chain: HopChain,
    ) -> Result<EncapPacket<'a>, EncapBuildError> {
        if chain.family() != self.outer.family() {
            return Err(EncapBuildError::FamilyMismatch);
        }

        let pkt = EncapPacket {
            outer: self.outer.readdress(src, dst)?,
            udp_src: self.udp_src,
            udp_dst: self.udp_dst,
            gue: self.gue,
            chain,
            inner: self.inner,
        };
        pkt.check_len()?;
        Ok(pkt)
    }

    /// The envelope may grow on the way out: a received frame without
    /// a chain block gains one.
    fn check_len(&self) -> Result<(), EncapBuildError> {
        let len = self.emit_len();
        // The IPv4 total length covers the header; IPv6's payload
        // length, like the UDP length, does not.
        let ip_len = match self.outer {
            OuterIp::V4 { .. } => len,
            OuterIp::V6 { .. } => len - self.outer.hdr_len(),
        };

        if ip_len > usize::from(u16::MAX) {
            return Err(EncapBuildError::TooLong { len: ip_len });
        }
        Ok(())
    }

    pub fn family(&self) -> AddrFamily {
        self.outer.family()
    }

    /// The length of the GUE option area as emitted: the received
    /// length is kept if it was longer than the chain needs.
    fn opt_len(&self) -> usize {
        self.chain.wire_len().max(self.gue.opt_len())
    }

    /// The length of the frame [`Self::emit`] produces.
    pub fn emit_len(&self) -> usize {
        self.outer.hdr_len()
            + UdpHdr::SIZE
            + GueHdr::SIZE
            + self.opt_len()
            + self.inner.len()
    }

    /// Serialize the envelope and inner packet into a complete frame,
    /// with every length and checksum recomputed.
    pub fn emit(&self) -> Vec<u8> {
        let opt_len = self.opt_len();
        let gue = GueMeta { hlen: opt_len.div_ceil(4) as u8, ..self.gue };

        let mut body = Vec::with_capacity(GueHdr::SIZE + opt_len);
        gue.emit(&mut body);
        self.chain.emit_into(&mut body);
        body.resize(GueHdr::SIZE + opt_len, 0);

        let udp_len = UdpHdr::SIZE + body.len() + self.inner.len();
        let mut out = Vec::with_capacity(self.emit_len());
        let pseudo = match self.outer {
            OuterIp::V4 { src, dst, tos, ttl, ident } => {
                let push = Ipv4Push {
                    src,
                    dst,
                    proto: PROTO_UDP,
                    tos,
                    ttl,
                    ident,
                };
                push.emit(udp_len, &mut out);
                ip4::pseudo_csum(src, dst, PROTO_UDP, udp_len as u16)
            }

            OuterIp::V6 { src, dst, traffic_class, flow_label, hop_limit } => {
                let push = Ipv6Push {
                    src,
                    dst,
                    next_hdr: PROTO_UDP,
                    traffic_class,
                    flow_label,
                    hop_limit,
                };
                push.emit(udp_len, &mut out);
                ip6::pseudo_csum(src, dst, PROTO_UDP, udp_len as u32)
            }
        };

        udp::emit_datagram(
            self.udp_src,
            self.udp_dst,
            pseudo,
            &[&body, self.inner],
            &mut out,
        );
        out
    }
}

impl Display for EncapPacket<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {} {}:{} chain {}",
            Protocol::UDP,
            self.outer.src(),
            self.outer.dst(),
            self.udp_src,
            self.udp_dst,
            self.chain,
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::DEF_MAX_HOPS;
    use crate::engine::checksum::Checksum;
    use crate::engine::hop_chain::HopChainError;
    use crate::engine::packet::ReadErr;

    #[rustfmt::skip]
    const FRAME: [u8; 60] = [
        // IPv4: total length 60, DF, TTL 63, UDP
        0x45, 0x00, 0x00, 0x3c,
        0x00, 0x07, 0x40, 0x00,
        0x3f, 0x11, 0x00, 0x00,
        // 192.168.50.5 -> 192.168.50.10
        0xc0, 0xa8, 0x32, 0x05,
        0xc0, 0xa8, 0x32, 0x0a,
        // UDP 12345 -> 19523, length 40, no checksum
        0x30, 0x39, 0x4c, 0x43,
        0x00, 0x28, 0x00, 0x00,
        // GUE hlen 2, proto IPv4
        0x02, 0x04, 0x00, 0x00,
        // chain: next hop 0, one hop, 192.168.50.11
        0x00, 0x00, 0x00, 0x01,
        0xc0, 0xa8, 0x32, 0x0b,
        // Inner IPv4 header, ICMP, 20 bytes, the payload is never read
        // by the codec.
        0x45, 0x00, 0x00, 0x14,
        0x00, 0x00, 0x00, 0x00,
        0x40, 0x01, 0x00, 0x00,
        0x0a, 0x00, 0x00, 0x01,
        0x0a, 0x00, 0x00, 0x02,
    ];

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn parse_frame() {
        let pkt = EncapPacket::parse(&FRAME, DEF_MAX_HOPS).unwrap();
        assert_eq!(pkt.outer.src(), ip("192.168.50.5"));
        assert_eq!(pkt.outer.dst(), ip("192.168.50.10"));
        assert_eq!(pkt.outer.ttl(), 63);
        assert_eq!(pkt.udp_src, 12345);
        assert_eq!(pkt.udp_dst, GUE_PORT);
        assert_eq!(pkt.gue, GueMeta { hlen: 2, proto: 4, flags: 0 });
        assert_eq!(pkt.chain.remaining(), &[ip("192.168.50.11")]);
        assert_eq!(pkt.inner, &FRAME[40..]);
        assert_eq!(pkt.emit_len(), FRAME.len());
    }

    #[test]
    fn reencap_rewrites_only_the_envelope() {
        let pkt = EncapPacket::parse(&FRAME, DEF_MAX_HOPS).unwrap();
        let (head, rest) = pkt.chain.pop_head().unwrap();
        let fwd = pkt.reencap(ip("192.168.50.10"), head, rest).unwrap();
        let out = fwd.emit();

        assert_eq!(out.len(), FRAME.len());
        // New TTL, new endpoints.
        assert_eq!(out[8], DEFAULT_TTL);
        assert_eq!(&out[12..16], &[0xc0, 0xa8, 0x32, 0x0a]);
        assert_eq!(&out[16..20], &[0xc0, 0xa8, 0x32, 0x0b]);
        // Same ports and GUE header, next hop advanced.
        assert_eq!(&out[20..24], &FRAME[20..24]);
        assert_eq!(&out[28..32], &FRAME[28..32]);
        assert_eq!(&out[32..36], &[0x00, 0x00, 0x01, 0x01]);
        assert_eq!(&out[40..], &FRAME[40..]);

        // Both checksums verify.
        assert_eq!(Checksum::compute(&out[..20]).finalize(), 0xFFFF);
        let mut csum = ip4::pseudo_csum(
            "192.168.50.10".parse().unwrap(),
            "192.168.50.11".parse().unwrap(),
            PROTO_UDP,
            40,
        );
        csum.add_bytes(&out[20..]);
        assert_eq!(csum.finalize(), 0xFFFF);

        let back = EncapPacket::parse(&out, DEF_MAX_HOPS).unwrap();
        assert_eq!(back, fwd);
        assert!(back.chain.is_exhausted());
    }

    #[test]
    fn padding_in_options_is_kept() {
        let mut frame = FRAME.to_vec();
        // Grow hlen to 3 with a trailing zero word.
        frame[3] = 64;
        frame[25] = 44;
        frame[28] = 0x03;
        frame.splice(40..40, [0, 0, 0, 0]);

        let pkt = EncapPacket::parse(&frame, DEF_MAX_HOPS).unwrap();
        assert_eq!(pkt.inner, &FRAME[40..]);
        let out = pkt.emit();
        assert_eq!(out.len(), frame.len());
        assert_eq!(&out[28..44], &frame[28..44]);
    }

    #[test]
    fn trailing_link_padding_ignored() {
        let mut frame = FRAME.to_vec();
        frame.extend_from_slice(&[0; 6]);
        let pkt = EncapPacket::parse(&frame, DEF_MAX_HOPS).unwrap();
        assert_eq!(pkt.inner, &FRAME[40..]);
    }

    #[test]
    fn rejects() {
        fn check(f: impl Fn(&mut Vec<u8>), expected: ParseError) {
            let mut frame = FRAME.to_vec();
            f(&mut frame);
            assert_eq!(
                EncapPacket::parse(&frame, DEF_MAX_HOPS).unwrap_err(),
                expected
            );
        }

        check(|f| f[0] = 0x55, ParseError::BadIpVersion { vsn: 5 });
        check(|f| f[9] = 6, ParseError::NotUdp { proto: 6 });
        check(|f| f[22] = 0x00, ParseError::NotGue { dst_port: 0x0043 });
        check(|f| f[6] = 0x20, ParseError::OuterFragment);
        check(|f| f[25] = 0x40, UdpHdrError::BadLength { length: 0x40 }.into());
        check(|f| f[28] = 0x42, GueHdrError::BadVersion { vsn: 1 }.into());
        // hlen 8 claims more option bytes than the datagram holds.
        check(
            |f| f[28] = 0x08,
            GueHdrError::ReadError(ReadErr::NotEnoughBytes).into(),
        );
        check(
            |f| f[34] = 0x02,
            HopChainError::NextHopOutOfRange { next_hop: 2, hop_count: 1 }
                .into(),
        );
        check(
            |f| f[29] = GUE_PROTO_IPV6,
            ParseError::InnerVersionMismatch { gue_proto: 41, vsn: 4 },
        );
        check(
            |f| {
                f.truncate(40);
                f[3] = 40;
                f[25] = 20;
            },
            ParseError::EmptyInner,
        );
    }

    #[test]
    fn build_checks_families() {
        let chain = HopChain::empty(AddrFamily::V4);
        let inner = &FRAME[40..];
        let res =
            EncapPacket::new(ip("10.0.0.1"), ip("fd00::1"), 1, chain.clone(), inner);
        assert_eq!(res, Err(EncapBuildError::FamilyMismatch));
        // The chain must match the outer family too.
        let res =
            EncapPacket::new(ip("fd00::2"), ip("fd00::1"), 1, chain.clone(), inner);
        assert_eq!(res, Err(EncapBuildError::FamilyMismatch));
        assert_eq!(
            EncapPacket::new(ip("10.0.0.1"), ip("10.0.0.2"), 1, chain, &[]),
            Err(EncapBuildError::EmptyInner)
        );
    }

    #[test]
    fn reencap_stays_within_length_fields() {
        // A maximum sized datagram that arrived without a chain block
        // gains four bytes on the way back out.
        let inner = vec![0x45u8; 65535 - 20 - 8 - 4];
        let pkt = EncapPacket {
            outer: OuterIp::V4 {
                src: "192.168.50.5".parse().unwrap(),
                dst: "192.168.50.10".parse().unwrap(),
                tos: 0,
                ttl: 64,
                ident: 0,
            },
            udp_src: 12345,
            udp_dst: GUE_PORT,
            gue: GueMeta { hlen: 0, proto: GUE_PROTO_IPV4, flags: 0 },
            chain: HopChain::empty(AddrFamily::V4),
            inner: &inner,
        };

        let (me, next) = (ip("192.168.50.10"), ip("192.168.50.11"));
        let chain = HopChain::empty(AddrFamily::V4);
        assert_eq!(
            pkt.reencap(me, next, chain.clone()),
            Err(EncapBuildError::TooLong { len: 65539 })
        );

        let pkt = EncapPacket { inner: &inner[4..], ..pkt };
        let out = pkt.reencap(me, next, chain).unwrap();
        assert_eq!(out.emit().len(), 65535);
    }
}
