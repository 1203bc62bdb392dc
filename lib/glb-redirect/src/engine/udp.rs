// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! UDP headers.

use super::checksum::Checksum;
use super::checksum::HeaderChecksum;
use super::packet::PacketReader;
use super::packet::ReadErr;
use crate::d_error::DError;
use core::mem;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Ref;
use zerocopy::Unaligned;

#[derive(Debug)]
pub struct UdpHdr<'a> {
    base: Ref<&'a [u8], UdpHdrRaw>,
}

impl<'a> UdpHdr<'a> {
    pub const SIZE: usize = UdpHdrRaw::SIZE;
    pub const CSUM_OFFSET: usize = 6;

    pub fn parse(rdr: &mut PacketReader<'a>) -> Result<Self, UdpHdrError> {
        let src = rdr.slice(UdpHdrRaw::SIZE)?;
        let base = Ref::<_, UdpHdrRaw>::from_bytes(src)
            .map_err(|_| ReadErr::BadLayout)?;
        let udp = Self { base };

        let length = udp.len();
        if usize::from(length) < Self::SIZE {
            return Err(UdpHdrError::BadLength { length });
        }

        Ok(udp)
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes(self.base.src_port)
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes(self.base.dst_port)
    }

    /// The UDP length, header included.
    pub fn len(&self) -> u16 {
        u16::from_be_bytes(self.base.length)
    }

    pub fn csum_bytes(&self) -> [u8; 2] {
        self.base.csum
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, DError)]
#[derror(leaf_data = UdpHdrError::derror_data)]
pub enum UdpHdrError {
    BadLength { length: u16 },
    ReadError(ReadErr),
}

impl UdpHdrError {
    fn derror_data(&self, data: &mut [u64]) {
        if let Self::BadLength { length } = self {
            data[0] = *length as u64;
        }
    }
}

impl From<ReadErr> for UdpHdrError {
    fn from(error: ReadErr) -> Self {
        UdpHdrError::ReadError(error)
    }
}

/// Append a UDP header and `payload` to `dst`, with the length and
/// checksum filled in.
///
/// `pseudo` is the pseudo header sum of the enclosing IP header. A
/// computed checksum of zero is sent as all ones, since zero means
/// "no checksum" on the wire.
pub fn emit_datagram(
    src_port: u16,
    dst_port: u16,
    pseudo: Checksum,
    payload: &[&[u8]],
    dst: &mut Vec<u8>,
) {
    let length: usize =
        UdpHdrRaw::SIZE + payload.iter().map(|p| p.len()).sum::<usize>();
    let raw = UdpHdrRaw {
        src_port: src_port.to_be_bytes(),
        dst_port: dst_port.to_be_bytes(),
        length: (length as u16).to_be_bytes(),
        csum: [0; 2],
    };

    let hdr_at = dst.len();
    dst.extend_from_slice(raw.as_bytes());
    for p in payload {
        dst.extend_from_slice(p);
    }

    // Sum the datagram once it is contiguous; the payload pieces may
    // have odd lengths.
    let mut csum = pseudo;
    csum.add_bytes(&dst[hdr_at..]);
    let csum = match HeaderChecksum::from(csum).bytes() {
        [0, 0] => [0xFF, 0xFF],
        bytes => bytes,
    };
    dst[hdr_at + UdpHdr::CSUM_OFFSET..hdr_at + UdpHdrRaw::SIZE]
        .copy_from_slice(&csum);
}

/// Note: For now we keep this unaligned to be safe.
#[repr(C)]
#[derive(
    Clone, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
pub struct UdpHdrRaw {
    pub src_port: [u8; 2],
    pub dst_port: [u8; 2],
    pub length: [u8; 2],
    pub csum: [u8; 2],
}

impl UdpHdrRaw {
    pub const SIZE: usize = mem::size_of::<Self>();
}
