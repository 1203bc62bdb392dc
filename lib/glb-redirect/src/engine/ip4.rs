// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! IPv4 headers.

use super::checksum::Checksum;
use super::checksum::HeaderChecksum;
use super::packet::PacketReader;
use super::packet::ReadErr;
use crate::api::Ipv4Addr;
use crate::api::Protocol;
use crate::d_error::DError;
use core::mem;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Ref;
use zerocopy::Unaligned;

pub const IPV4_HDR_LEN_MASK: u8 = 0x0F;
pub const IPV4_HDR_VER_SHIFT: u8 = 4;
pub const IPV4_VERSION: u8 = 4;

const IPV4_FRAG_OFFSET_MASK: u16 = 0x1FFF;
const IPV4_MORE_FRAGS: u16 = 0x2000;
const IPV4_DONT_FRAG: u16 = 0x4000;

/// A parsed view of an IPv4 header, options included.
#[derive(Debug)]
pub struct Ipv4Hdr<'a> {
    base: Ref<&'a [u8], Ipv4HdrRaw>,
    options: &'a [u8],
}

impl<'a> Ipv4Hdr<'a> {
    pub const BASE_SIZE: usize = Ipv4HdrRaw::SIZE;

    /// Parse the header at the reader's position.
    ///
    /// Only the header itself is validated. The total length is
    /// checked by [`Self::parse_datagram`], since a header quoted
    /// inside an ICMP error legitimately claims more bytes than
    /// follow it.
    pub fn parse(rdr: &mut PacketReader<'a>) -> Result<Self, Ipv4HdrError> {
        let src = rdr.slice(Ipv4HdrRaw::SIZE)?;
        let base = Ref::<_, Ipv4HdrRaw>::from_bytes(src)
            .map_err(|_| ReadErr::BadLayout)?;

        let vsn = base.ver_hdr_len >> IPV4_HDR_VER_SHIFT;
        if vsn != IPV4_VERSION {
            return Err(Ipv4HdrError::BadVersion { vsn });
        }

        let hdr_len = usize::from(base.ver_hdr_len & IPV4_HDR_LEN_MASK) * 4;
        if hdr_len < Self::BASE_SIZE {
            return Err(Ipv4HdrError::HeaderTruncated { hdr_len: hdr_len as u16 });
        }

        let options = rdr.slice(hdr_len - Self::BASE_SIZE)?;
        Ok(Self { base, options })
    }

    /// Parse a complete datagram, returning the header and exactly the
    /// payload its total length covers. Bytes past the total length
    /// (link padding) are ignored.
    pub fn parse_datagram(
        bytes: &'a [u8],
    ) -> Result<(Self, &'a [u8]), Ipv4HdrError> {
        let mut rdr = PacketReader::new(bytes);
        let hdr = Self::parse(&mut rdr)?;
        let total_len = hdr.total_len();

        if usize::from(total_len) < hdr.hdr_len()
            || usize::from(total_len) > bytes.len()
        {
            return Err(Ipv4HdrError::BadTotalLen { total_len });
        }

        let payload = rdr.slice(usize::from(total_len) - hdr.hdr_len())?;
        Ok((hdr, payload))
    }

    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.base.src)
    }

    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.base.dst)
    }

    pub fn proto(&self) -> Protocol {
        Protocol::from(self.base.proto)
    }

    pub fn proto_raw(&self) -> u8 {
        self.base.proto
    }

    pub fn ttl(&self) -> u8 {
        self.base.ttl
    }

    pub fn tos(&self) -> u8 {
        self.base.dscp_ecn
    }

    pub fn ident(&self) -> u16 {
        u16::from_be_bytes(self.base.ident)
    }

    /// Header length in bytes, options included.
    pub fn hdr_len(&self) -> usize {
        Self::BASE_SIZE + self.options.len()
    }

    pub fn total_len(&self) -> u16 {
        u16::from_be_bytes(self.base.total_len)
    }

    pub fn csum(&self) -> [u8; 2] {
        self.base.csum
    }

    /// The fragment offset, in 8-byte units.
    pub fn frag_offset(&self) -> u16 {
        u16::from_be_bytes(self.base.frag_and_flags) & IPV4_FRAG_OFFSET_MASK
    }

    pub fn more_frags(&self) -> bool {
        u16::from_be_bytes(self.base.frag_and_flags) & IPV4_MORE_FRAGS != 0
    }

    /// Is this datagram any piece of a fragmented one?
    pub fn is_fragment(&self) -> bool {
        self.more_frags() || self.frag_offset() != 0
    }

    pub fn bytes(&self) -> &[u8] {
        self.base.as_bytes()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, DError)]
#[derror(leaf_data = Ipv4HdrError::derror_data)]
pub enum Ipv4HdrError {
    BadTotalLen { total_len: u16 },
    BadVersion { vsn: u8 },
    HeaderTruncated { hdr_len: u16 },
    ReadError(ReadErr),
}

impl From<ReadErr> for Ipv4HdrError {
    fn from(error: ReadErr) -> Self {
        Ipv4HdrError::ReadError(error)
    }
}

impl Ipv4HdrError {
    fn derror_data(&self, data: &mut [u64]) {
        data[0] = match self {
            Self::BadTotalLen { total_len } => *total_len as u64,
            Self::BadVersion { vsn } => *vsn as u64,
            Self::HeaderTruncated { hdr_len } => *hdr_len as u64,
            _ => 0,
        }
    }
}

/// The fields needed to write a fresh option-less IPv4 header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Ipv4Push {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: u8,
    pub tos: u8,
    pub ttl: u8,
    pub ident: u16,
}

impl Ipv4Push {
    /// Append a header for a datagram carrying `pay_len` bytes, with
    /// its total length and checksum filled in.
    pub fn emit(&self, pay_len: usize, dst: &mut Vec<u8>) {
        let total_len = (Ipv4HdrRaw::SIZE + pay_len) as u16;
        let mut raw = Ipv4HdrRaw {
            ver_hdr_len: (IPV4_VERSION << IPV4_HDR_VER_SHIFT)
                | (Ipv4HdrRaw::SIZE / 4) as u8,
            dscp_ecn: self.tos,
            total_len: total_len.to_be_bytes(),
            ident: self.ident.to_be_bytes(),
            frag_and_flags: IPV4_DONT_FRAG.to_be_bytes(),
            ttl: self.ttl,
            proto: self.proto,
            csum: [0; 2],
            src: self.src.bytes(),
            dst: self.dst.bytes(),
        };
        raw.csum = HeaderChecksum::from(Checksum::compute(raw.as_bytes())).bytes();
        dst.extend_from_slice(raw.as_bytes());
    }
}

/// The sum of the IPv4 pseudo header used by UDP and TCP checksums.
pub fn pseudo_csum(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    proto: u8,
    ulp_len: u16,
) -> Checksum {
    let mut csum = Checksum::compute(&src.bytes());
    csum.add_bytes(&dst.bytes());
    csum.add_bytes(&[0, proto]);
    csum.add_bytes(&ulp_len.to_be_bytes());
    csum
}

/// Note: For now we keep this unaligned to be safe.
#[repr(C)]
#[derive(
    Clone, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
pub struct Ipv4HdrRaw {
    pub ver_hdr_len: u8,
    pub dscp_ecn: u8,
    pub total_len: [u8; 2],
    pub ident: [u8; 2],
    pub frag_and_flags: [u8; 2],
    pub ttl: u8,
    pub proto: u8,
    pub csum: [u8; 2],
    pub src: [u8; 4],
    pub dst: [u8; 4],
}

impl Ipv4HdrRaw {
    pub const SIZE: usize = mem::size_of::<Self>();
}

#[cfg(test)]
mod test {
    use super::*;

    #[rustfmt::skip]
    const HDR: [u8; 28] = [
        // version + IHL, DSCP/ECN, total length
        0x45, 0x00, 0x00, 0x1c,
        // ident, flags + fragment offset
        0x12, 0x34, 0x40, 0x00,
        // TTL, protocol (UDP), checksum
        0x40, 0x11, 0x00, 0x00,
        // source
        0xc0, 0xa8, 0x32, 0x05,
        // destination
        0xc0, 0xa8, 0x32, 0x0a,
        // 8 bytes of payload
        0xde, 0xad, 0xbe, 0xef, 0xde, 0xad, 0xbe, 0xef,
    ];

    #[test]
    fn parse_datagram_trims_padding() {
        let mut frame = HDR.to_vec();
        frame.extend_from_slice(&[0; 6]);
        let (hdr, payload) = Ipv4Hdr::parse_datagram(&frame).unwrap();
        assert_eq!(hdr.src(), "192.168.50.5".parse().unwrap());
        assert_eq!(hdr.dst(), "192.168.50.10".parse().unwrap());
        assert_eq!(hdr.proto(), Protocol::UDP);
        assert_eq!(hdr.hdr_len(), 20);
        assert_eq!(payload.len(), 8);
        assert!(!hdr.is_fragment());
    }

    #[test]
    fn bad_version_and_lengths() {
        let mut bad = HDR;
        bad[0] = 0x65;
        assert_eq!(
            Ipv4Hdr::parse_datagram(&bad).unwrap_err(),
            Ipv4HdrError::BadVersion { vsn: 6 }
        );

        let mut bad = HDR;
        bad[0] = 0x44;
        assert_eq!(
            Ipv4Hdr::parse_datagram(&bad).unwrap_err(),
            Ipv4HdrError::HeaderTruncated { hdr_len: 16 }
        );

        let mut bad = HDR;
        bad[3] = 0x40;
        assert_eq!(
            Ipv4Hdr::parse_datagram(&bad).unwrap_err(),
            Ipv4HdrError::BadTotalLen { total_len: 0x40 }
        );

        assert_eq!(
            Ipv4Hdr::parse_datagram(&HDR[..12]).unwrap_err(),
            Ipv4HdrError::ReadError(ReadErr::NotEnoughBytes)
        );
    }

    #[test]
    fn options_are_skipped() {
        let mut frame = HDR.to_vec();
        frame[0] = 0x46;
        frame[3] = 0x20;
        // A single NOP-padded option word right after the base header.
        frame.splice(20..20, [0x01, 0x01, 0x01, 0x00]);
        let (hdr, payload) = Ipv4Hdr::parse_datagram(&frame).unwrap();
        assert_eq!(hdr.hdr_len(), 24);
        assert_eq!(payload, &HDR[20..]);
    }

    #[test]
    fn emit_fills_checksum() {
        let push = Ipv4Push {
            src: "192.168.50.5".parse().unwrap(),
            dst: "192.168.50.10".parse().unwrap(),
            proto: 17,
            tos: 0,
            ttl: 64,
            ident: 0x1234,
        };
        let mut out = vec![];
        push.emit(8, &mut out);
        assert_eq!(out.len(), 20);
        assert_eq!(&out[..10], &HDR[..10]);
        assert_eq!(&out[12..20], &HDR[12..20]);
        let mut csum = Checksum::compute(&out);
        assert_eq!(csum.finalize(), 0xFFFF);
    }
}
