// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! TCP headers.
//!
//! The redirect path never rewrites TCP; it only needs the ports and
//! the flags that tell a connection-opening SYN from the rest.

use super::packet::PacketReader;
use super::packet::ReadErr;
use crate::d_error::DError;
use bitflags::bitflags;
use core::fmt;
use core::mem;
use serde::Deserialize;
use serde::Serialize;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Ref;
use zerocopy::Unaligned;

pub const TCP_HDR_OFFSET_MASK: u8 = 0xF0;
pub const TCP_HDR_OFFSET_SHIFT: u8 = 4;

bitflags! {
    #[derive(
        Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
    )]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
        const ECE = 0x40;
        const CWR = 0x80;
    }
}

impl TcpFlags {
    /// A SYN without an ACK: the first packet of a new connection.
    pub fn is_establishing(&self) -> bool {
        self.contains(Self::SYN) && !self.contains(Self::ACK)
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::SYN, 'S'),
            (Self::ACK, 'A'),
            (Self::FIN, 'F'),
            (Self::RST, 'R'),
            (Self::PSH, 'P'),
            (Self::URG, 'U'),
        ];
        for (flag, c) in names {
            if self.contains(flag) {
                write!(f, "{c}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct TcpHdr<'a> {
    base: Ref<&'a [u8], TcpHdrRaw>,
}

impl<'a> TcpHdr<'a> {
    pub const BASE_SIZE: usize = TcpHdrRaw::SIZE;

    /// Parse the fixed part of a TCP header. Options, if any, are left
    /// unread.
    pub fn parse(rdr: &mut PacketReader<'a>) -> Result<Self, TcpHdrError> {
        let src = rdr.slice(TcpHdrRaw::SIZE)?;
        let base = Ref::<_, TcpHdrRaw>::from_bytes(src)
            .map_err(|_| ReadErr::BadLayout)?;
        let tcp = Self { base };

        let offset = tcp.base.offset >> TCP_HDR_OFFSET_SHIFT;
        if usize::from(offset) * 4 < Self::BASE_SIZE {
            return Err(TcpHdrError::BadOffset { offset });
        }

        Ok(tcp)
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes(self.base.src_port)
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes(self.base.dst_port)
    }

    pub fn seq(&self) -> u32 {
        u32::from_be_bytes(self.base.seq)
    }

    pub fn flags(&self) -> TcpFlags {
        TcpFlags::from_bits_retain(self.base.flags)
    }

    /// Header length in bytes, options included.
    pub fn hdr_len(&self) -> usize {
        usize::from(self.base.offset >> TCP_HDR_OFFSET_SHIFT) * 4
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, DError)]
pub enum TcpHdrError {
    BadOffset { offset: u8 },
    ReadError(ReadErr),
}

impl From<ReadErr> for TcpHdrError {
    fn from(error: ReadErr) -> Self {
        TcpHdrError::ReadError(error)
    }
}

/// Note: For now we keep this unaligned to be safe.
#[repr(C)]
#[derive(
    Clone, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
pub struct TcpHdrRaw {
    pub src_port: [u8; 2],
    pub dst_port: [u8; 2],
    pub seq: [u8; 4],
    pub ack: [u8; 4],
    pub offset: u8,
    pub flags: u8,
    pub win: [u8; 2],
    pub csum: [u8; 2],
    pub urg: [u8; 2],
}

impl TcpHdrRaw {
    pub const SIZE: usize = mem::size_of::<Self>();
}

#[cfg(test)]
mod test {
    use super::*;

    #[rustfmt::skip]
    const SYN: [u8; 20] = [
        // source port 41234, dest port 22
        0xA1, 0x12, 0x00, 0x16,
        // sequence number
        0x00, 0x00, 0x04, 0xD2,
        // ack number
        0x00, 0x00, 0x00, 0x00,
        // data offset, flags (SYN), window
        0x50, 0x02, 0xFF, 0xFF,
        // checksum, urgent pointer
        0x00, 0x00, 0x00, 0x00,
    ];

    #[test]
    fn parse_syn() {
        let mut rdr = PacketReader::new(&SYN);
        let tcp = TcpHdr::parse(&mut rdr).unwrap();
        assert_eq!(tcp.src_port(), 41234);
        assert_eq!(tcp.dst_port(), 22);
        assert_eq!(tcp.seq(), 1234);
        assert_eq!(tcp.hdr_len(), 20);
        assert!(tcp.flags().is_establishing());
        assert_eq!(tcp.flags().to_string(), "S");
    }

    #[test]
    fn syn_ack_does_not_establish() {
        let flags = TcpFlags::SYN | TcpFlags::ACK;
        assert!(!flags.is_establishing());
        assert!(!TcpFlags::ACK.is_establishing());
        assert_eq!(flags.to_string(), "SA");
    }

    #[test]
    fn bad_offset() {
        let mut bytes = SYN;
        bytes[12] = 0x40;
        let mut rdr = PacketReader::new(&bytes);
        assert_eq!(
            TcpHdr::parse(&mut rdr).unwrap_err(),
            TcpHdrError::BadOffset { offset: 4 }
        );
    }
}
