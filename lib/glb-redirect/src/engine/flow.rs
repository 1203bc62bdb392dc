// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Finding the connection an inner packet belongs to.
//!
//! Most packets name their connection in their own headers. An ICMP
//! error instead quotes the start of the packet that provoked it, and
//! belongs to the connection of that quoted packet.

use super::icmp::IcmpClass;
use super::icmp::IcmpHdr;
use super::ip4::Ipv4Hdr;
use super::ip4::Ipv4HdrError;
use super::ip6::Ipv6Hdr;
use super::ip6::Ipv6HdrError;
use super::packet::PacketReader;
use super::packet::ParseError;
use super::packet::ReadErr;
use super::tcp::TcpFlags;
use super::tcp::TcpHdr;
use super::udp::UdpHdr;
use crate::api::AddrFamily;
use crate::api::AddrPair;
use crate::api::FlowKey;
use crate::api::IpAddr;
use crate::api::Protocol;
use core::fmt;
use core::fmt::Display;

/// The transport layer of an inner packet, reduced to what the
/// redirect decision needs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InnerUlp {
    Tcp { src_port: u16, dst_port: u16, flags: TcpFlags },
    Udp { src_port: u16, dst_port: u16 },
    IcmpInfo { ty: u8, code: u8 },
    IcmpError { ty: u8, code: u8, embedded: FlowKey },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InnerPacket {
    pub addrs: AddrPair,
    pub ulp: InnerUlp,
}

impl InnerPacket {
    /// Parse the inner IP datagram and its transport header.
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let vsn = PacketReader::new(bytes).peek_u8()? >> 4;

        let (addrs, proto, ulp) = match vsn {
            4 => {
                let (ip, ulp) = Ipv4Hdr::parse_datagram(bytes)?;
                if ip.frag_offset() != 0 {
                    return Err(ParseError::NonFirstFragment);
                }
                let addrs = AddrPair::V4 { src: ip.src(), dst: ip.dst() };
                (addrs, ip.proto(), ulp)
            }

            6 => {
                let (ip, ulp) = Ipv6Hdr::parse_datagram(bytes)?;
                if ip.frag_offset().is_some_and(|off| off != 0) {
                    return Err(ParseError::NonFirstFragment);
                }
                let addrs = AddrPair::V6 { src: ip.src(), dst: ip.dst() };
                (addrs, ip.proto(), ulp)
            }

            _ => return Err(ParseError::BadIpVersion { vsn }),
        };

        let family = family_of(&addrs);
        let mut rdr = PacketReader::new(ulp);

        let ulp = match (family, proto) {
            (_, Protocol::TCP) => {
                let tcp = TcpHdr::parse(&mut rdr)?;
                InnerUlp::Tcp {
                    src_port: tcp.src_port(),
                    dst_port: tcp.dst_port(),
                    flags: tcp.flags(),
                }
            }

            (_, Protocol::UDP) => {
                let udp = UdpHdr::parse(&mut rdr)?;
                InnerUlp::Udp {
                    src_port: udp.src_port(),
                    dst_port: udp.dst_port(),
                }
            }

            (AddrFamily::V4, Protocol::ICMP)
            | (AddrFamily::V6, Protocol::ICMPv6) => {
                let icmp = IcmpHdr::parse(&mut rdr)?;
                let (ty, code) = (icmp.ty(), icmp.code());
                match IcmpClass::of(family, ty) {
                    IcmpClass::Informational => InnerUlp::IcmpInfo { ty, code },
                    IcmpClass::Error => {
                        let embedded = parse_embedded(rdr.rest())?;
                        InnerUlp::IcmpError { ty, code, embedded }
                    }
                }
            }

            (_, proto) => {
                return Err(ParseError::UnsupportedProtocol {
                    proto: u8::from(proto),
                });
            }
        };

        Ok(Self { addrs, ulp })
    }

    pub fn family(&self) -> AddrFamily {
        family_of(&self.addrs)
    }

    pub fn proto(&self) -> Protocol {
        match (self.ulp, self.family()) {
            (InnerUlp::Tcp { .. }, _) => Protocol::TCP,
            (InnerUlp::Udp { .. }, _) => Protocol::UDP,
            (_, AddrFamily::V4) => Protocol::ICMP,
            (_, AddrFamily::V6) => Protocol::ICMPv6,
        }
    }

    /// The connection this packet belongs to.
    ///
    /// For an ICMP error this is the quoted packet's flow, with its
    /// source and destination as they appear in the quote. It is
    /// `None` for informational ICMP, which belongs to no connection.
    pub fn flow_key(&self) -> Option<FlowKey> {
        match self.ulp {
            InnerUlp::Tcp { src_port, dst_port, .. } => Some(FlowKey {
                proto: Protocol::TCP,
                addrs: self.addrs,
                src_port,
                dst_port,
            }),

            InnerUlp::Udp { src_port, dst_port } => Some(FlowKey {
                proto: Protocol::UDP,
                addrs: self.addrs,
                src_port,
                dst_port,
            }),

            InnerUlp::IcmpInfo { .. } => None,

            InnerUlp::IcmpError { embedded, .. } => Some(embedded),
        }
    }

    /// Is this the first packet of a new TCP connection?
    pub fn is_establishing(&self) -> bool {
        match self.ulp {
            InnerUlp::Tcp { flags, .. } => flags.is_establishing(),
            _ => false,
        }
    }

    pub fn is_reset(&self) -> bool {
        match self.ulp {
            InnerUlp::Tcp { flags, .. } => flags.contains(TcpFlags::RST),
            _ => false,
        }
    }

    pub fn is_icmp_error(&self) -> bool {
        matches!(self.ulp, InnerUlp::IcmpError { .. })
    }
}

impl Display for InnerPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (src, dst) = match self.addrs {
            AddrPair::V4 { src, dst } => (IpAddr::from(src), IpAddr::from(dst)),
            AddrPair::V6 { src, dst } => (IpAddr::from(src), IpAddr::from(dst)),
        };

        match self.ulp {
            InnerUlp::Tcp { src_port, dst_port, flags } => write!(
                f,
                "TCP {src}:{src_port} -> {dst}:{dst_port} [{flags}]"
            ),
            InnerUlp::Udp { src_port, dst_port } => {
                write!(f, "UDP {src}:{src_port} -> {dst}:{dst_port}")
            }
            InnerUlp::IcmpInfo { ty, code } => {
                write!(f, "{} {src} -> {dst} {ty}/{code}", self.proto())
            }
            InnerUlp::IcmpError { ty, code, embedded } => write!(
                f,
                "{} {src} -> {dst} {ty}/{code} about {embedded}",
                self.proto()
            ),
        }
    }
}

fn family_of(addrs: &AddrPair) -> AddrFamily {
    match addrs {
        AddrPair::V4 { .. } => AddrFamily::V4,
        AddrPair::V6 { .. } => AddrFamily::V6,
    }
}

/// Anything that ran out of bytes inside a quoted packet means the
/// error did not quote enough of it.
fn truncated<E>(e: E, read_err: impl Fn(&E) -> Option<ReadErr>) -> ParseError
where
    ParseError: From<E>,
{
    match read_err(&e) {
        Some(ReadErr::NotEnoughBytes) => ParseError::TruncatedEmbeddedHeader,
        _ => ParseError::from(e),
    }
}

/// Read the flow out of the packet quoted by an ICMP error: its IP
/// header, any options or extension headers, and the port pair at the
/// start of its transport header.
fn parse_embedded(quote: &[u8]) -> Result<FlowKey, ParseError> {
    let mut rdr = PacketReader::new(quote);
    let vsn = rdr.peek_u8().map_err(|_| ParseError::TruncatedEmbeddedHeader)?
        >> 4;

    let (addrs, proto, first_frag) = match vsn {
        4 => {
            let ip = Ipv4Hdr::parse(&mut rdr).map_err(|e| {
                truncated(e, |e| match e {
                    Ipv4HdrError::ReadError(r) => Some(*r),
                    _ => None,
                })
            })?;
            let addrs = AddrPair::V4 { src: ip.src(), dst: ip.dst() };
            (addrs, ip.proto(), ip.frag_offset() == 0)
        }

        6 => {
            let ip = Ipv6Hdr::parse(&mut rdr).map_err(|e| {
                truncated(e, |e| match e {
                    Ipv6HdrError::ReadError(r) => Some(*r),
                    _ => None,
                })
            })?;
            let addrs = AddrPair::V6 { src: ip.src(), dst: ip.dst() };
            let first = ip.frag_offset().is_none_or(|off| off == 0);
            (addrs, ip.proto(), first)
        }

        _ => return Err(ParseError::BadIpVersion { vsn }),
    };

    if !proto.has_ports() {
        return Err(ParseError::UnsupportedEmbeddedProtocol {
            proto: u8::from(proto),
        });
    }

    if !first_frag {
        return Err(ParseError::NonFirstFragment);
    }

    let ports =
        rdr.slice(4).map_err(|_| ParseError::TruncatedEmbeddedHeader)?;

    Ok(FlowKey {
        proto,
        addrs,
        src_port: u16::from_be_bytes([ports[0], ports[1]]),
        dst_port: u16::from_be_bytes([ports[2], ports[3]]),
    })
}
