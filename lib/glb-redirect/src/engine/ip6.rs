// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! IPv6 headers and the extension headers that may sit between them
//! and the upper layer protocol.

use super::checksum::Checksum;
use super::packet::PacketReader;
use super::packet::ReadErr;
use crate::api::Ipv6Addr;
use crate::api::Protocol;
use crate::d_error::DError;
use core::mem;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Ref;
use zerocopy::Unaligned;

pub const IPV6_VERSION: u8 = 6;

pub const IPV6_EXT_HOP_BY_HOP: u8 = 0;
pub const IPV6_EXT_ROUTING: u8 = 43;
pub const IPV6_EXT_FRAGMENT: u8 = 44;
pub const IPV6_EXT_AH: u8 = 51;
pub const IPV6_EXT_DEST_OPTS: u8 = 60;

/// The most extension headers we will walk before giving up.
pub const IPV6_MAX_EXT_HDRS: usize = 8;

/// A parsed view of an IPv6 header and its extension headers.
#[derive(Debug)]
pub struct Ipv6Hdr<'a> {
    base: Ref<&'a [u8], Ipv6HdrRaw>,
    ulp_proto: u8,
    ext_len: usize,
    frag_offset: Option<u16>,
}

impl<'a> Ipv6Hdr<'a> {
    pub const BASE_SIZE: usize = Ipv6HdrRaw::SIZE;

    /// Parse the fixed header and walk any extension headers that
    /// follow, leaving the reader at the upper layer protocol.
    ///
    /// As with IPv4, the payload length is not checked here.
    pub fn parse(rdr: &mut PacketReader<'a>) -> Result<Self, Ipv6HdrError> {
        let src = rdr.slice(Ipv6HdrRaw::SIZE)?;
        let base = Ref::<_, Ipv6HdrRaw>::from_bytes(src)
            .map_err(|_| ReadErr::BadLayout)?;

        let vsn = base.vtc_flow[0] >> 4;
        if vsn != IPV6_VERSION {
            return Err(Ipv6HdrError::BadVersion { vsn });
        }

        let mut next_hdr = base.next_hdr;
        let mut ext_len = 0;
        let mut frag_offset = None;
        let mut walked = 0;

        while is_ext_hdr(next_hdr) {
            if walked == IPV6_MAX_EXT_HDRS {
                return Err(Ipv6HdrError::TooManyExtHdrs);
            }

            let fixed = rdr.slice(2)?;
            let len = match next_hdr {
                IPV6_EXT_FRAGMENT => 8,
                IPV6_EXT_AH => (usize::from(fixed[1]) + 2) * 4,
                _ => (usize::from(fixed[1]) + 1) * 8,
            };
            let body = rdr.slice(len - 2)?;

            if next_hdr == IPV6_EXT_FRAGMENT {
                frag_offset =
                    Some(u16::from_be_bytes([body[0], body[1]]) >> 3);
            }

            next_hdr = fixed[0];
            ext_len += len;
            walked += 1;
        }

        Ok(Self { base, ulp_proto: next_hdr, ext_len, frag_offset })
    }

    /// Parse a complete datagram, returning the header and the upper
    /// layer bytes covered by the payload length.
    pub fn parse_datagram(
        bytes: &'a [u8],
    ) -> Result<(Self, &'a [u8]), Ipv6HdrError> {
        let mut rdr = PacketReader::new(bytes);
        let hdr = Self::parse(&mut rdr)?;
        let pay_len = hdr.pay_len();

        if usize::from(pay_len) < hdr.ext_len
            || Self::BASE_SIZE + usize::from(pay_len) > bytes.len()
        {
            return Err(Ipv6HdrError::BadPayloadLen { pay_len });
        }

        let ulp = rdr.slice(usize::from(pay_len) - hdr.ext_len)?;
        Ok((hdr, ulp))
    }

    pub fn src(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.base.src)
    }

    pub fn dst(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.base.dst)
    }

    /// The protocol found after all extension headers.
    pub fn proto(&self) -> Protocol {
        Protocol::from(self.ulp_proto)
    }

    pub fn proto_raw(&self) -> u8 {
        self.ulp_proto
    }

    pub fn hop_limit(&self) -> u8 {
        self.base.hop_limit
    }

    pub fn traffic_class(&self) -> u8 {
        (self.base.vtc_flow[0] << 4) | (self.base.vtc_flow[1] >> 4)
    }

    pub fn flow_label(&self) -> u32 {
        let [_, b1, b2, b3] = self.base.vtc_flow;
        u32::from_be_bytes([0, b1 & 0x0F, b2, b3])
    }

    pub fn pay_len(&self) -> u16 {
        u16::from_be_bytes(self.base.payload_len)
    }

    /// Length of all extension headers, in bytes.
    pub fn ext_len(&self) -> usize {
        self.ext_len
    }

    /// Length of the fixed header plus extension headers.
    pub fn hdr_len(&self) -> usize {
        Self::BASE_SIZE + self.ext_len
    }

    /// The fragment offset, if a fragment header is present.
    pub fn frag_offset(&self) -> Option<u16> {
        self.frag_offset
    }
}

fn is_ext_hdr(next_hdr: u8) -> bool {
    matches!(
        next_hdr,
        IPV6_EXT_HOP_BY_HOP
            | IPV6_EXT_ROUTING
            | IPV6_EXT_FRAGMENT
            | IPV6_EXT_AH
            | IPV6_EXT_DEST_OPTS
    )
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, DError)]
pub enum Ipv6HdrError {
    BadVersion { vsn: u8 },
    BadPayloadLen { pay_len: u16 },
    TooManyExtHdrs,
    ReadError(ReadErr),
}

impl From<ReadErr> for Ipv6HdrError {
    fn from(error: ReadErr) -> Self {
        Ipv6HdrError::ReadError(error)
    }
}

/// The fields needed to write a fresh IPv6 header with no extension
/// headers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Ipv6Push {
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub next_hdr: u8,
    pub traffic_class: u8,
    pub flow_label: u32,
    pub hop_limit: u8,
}

impl Ipv6Push {
    pub fn emit(&self, pay_len: usize, dst: &mut Vec<u8>) {
        let label = (self.flow_label & 0x000F_FFFF).to_be_bytes();
        let raw = Ipv6HdrRaw {
            vtc_flow: [
                (IPV6_VERSION << 4) | (self.traffic_class >> 4),
                (self.traffic_class << 4) | label[1],
                label[2],
                label[3],
            ],
            payload_len: (pay_len as u16).to_be_bytes(),
            next_hdr: self.next_hdr,
            hop_limit: self.hop_limit,
            src: self.src.bytes(),
            dst: self.dst.bytes(),
        };
        dst.extend_from_slice(raw.as_bytes());
    }
}

/// The sum of the IPv6 pseudo header (RFC 8200 §8.1).
pub fn pseudo_csum(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    next_hdr: u8,
    ulp_len: u32,
) -> Checksum {
    let mut csum = Checksum::compute(&src.bytes());
    csum.add_bytes(&dst.bytes());
    csum.add_bytes(&ulp_len.to_be_bytes());
    csum.add_bytes(&[0, 0, 0, next_hdr]);
    csum
}

#[repr(C)]
#[derive(
    Clone, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
pub struct Ipv6HdrRaw {
    pub vtc_flow: [u8; 4],
    pub payload_len: [u8; 2],
    pub next_hdr: u8,
    pub hop_limit: u8,
    pub src: [u8; 16],
    pub dst: [u8; 16],
}

impl Ipv6HdrRaw {
    pub const SIZE: usize = mem::size_of::<Self>();
}

#[cfg(test)]
mod test {
    use super::*;

    fn base(next_hdr: u8, pay_len: u16) -> Vec<u8> {
        let push = Ipv6Push {
            src: "fd33:75c6:d3f2:7e9f::10".parse().unwrap(),
            dst: "fd2c:394c:33a3:26bf::1".parse().unwrap(),
            next_hdr,
            traffic_class: 0xb8,
            flow_label: 0x12345,
            hop_limit: 64,
        };
        let mut out = vec![];
        push.emit(usize::from(pay_len), &mut out);
        out
    }

    #[test]
    fn fields_survive_emit() {
        let mut frame = base(17, 8);
        frame.extend_from_slice(&[0; 8]);
        let (hdr, ulp) = Ipv6Hdr::parse_datagram(&frame).unwrap();
        assert_eq!(hdr.traffic_class(), 0xb8);
        assert_eq!(hdr.flow_label(), 0x12345);
        assert_eq!(hdr.proto(), Protocol::UDP);
        assert_eq!(hdr.src(), "fd33:75c6:d3f2:7e9f::10".parse().unwrap());
        assert_eq!(ulp.len(), 8);
        assert_eq!(hdr.frag_offset(), None);
    }

    #[test]
    fn extension_headers_are_walked() {
        let mut frame = base(IPV6_EXT_HOP_BY_HOP, 8 + 16 + 8 + 8);
        // Hop-by-hop, 8 bytes, next is routing.
        #[rustfmt::skip]
        frame.extend_from_slice(&[
            IPV6_EXT_ROUTING, 0, 1, 4, 0, 0, 0, 0,
        ]);
        // Routing, 16 bytes, next is fragment.
        frame.extend_from_slice(&[IPV6_EXT_FRAGMENT, 1]);
        frame.extend_from_slice(&[0; 14]);
        // Fragment, first fragment with more to come, next is TCP.
        frame.extend_from_slice(&[6, 0, 0x00, 0x01, 0, 0, 0, 7]);
        frame.extend_from_slice(&[0; 8]);

        let (hdr, ulp) = Ipv6Hdr::parse_datagram(&frame).unwrap();
        assert_eq!(hdr.ext_len(), 32);
        assert_eq!(hdr.hdr_len(), 72);
        assert_eq!(hdr.proto(), Protocol::TCP);
        assert_eq!(hdr.frag_offset(), Some(0));
        assert_eq!(ulp.len(), 8);
    }

    #[test]
    fn truncated_extension_header() {
        let mut frame = base(IPV6_EXT_DEST_OPTS, 16);
        frame.extend_from_slice(&[17, 1, 0, 0]);
        let mut rdr = PacketReader::new(&frame);
        assert_eq!(
            Ipv6Hdr::parse(&mut rdr).unwrap_err(),
            Ipv6HdrError::ReadError(ReadErr::NotEnoughBytes)
        );
    }

    #[test]
    fn bad_payload_len() {
        let frame = base(17, 100);
        assert_eq!(
            Ipv6Hdr::parse_datagram(&frame).unwrap_err(),
            Ipv6HdrError::BadPayloadLen { pay_len: 100 }
        );
    }
}
