// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! ICMPv4 and ICMPv6 headers.
//!
//! Both families share the same 8-byte leading layout: type, code,
//! checksum, and four bytes whose meaning depends on the type. For
//! error messages the body that follows is the start of the packet
//! that caused the error.

use super::packet::PacketReader;
use super::packet::ReadErr;
use crate::api::AddrFamily;
use crate::d_error::DError;
use core::mem;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Ref;
use zerocopy::Unaligned;

pub const ICMP4_ECHO_REPLY: u8 = 0;
pub const ICMP4_DEST_UNREACHABLE: u8 = 3;
pub const ICMP4_SOURCE_QUENCH: u8 = 4;
pub const ICMP4_ECHO_REQUEST: u8 = 8;
pub const ICMP4_TIME_EXCEEDED: u8 = 11;
pub const ICMP4_PARAM_PROBLEM: u8 = 12;

pub const ICMP6_DEST_UNREACHABLE: u8 = 1;
pub const ICMP6_PACKET_TOO_BIG: u8 = 2;
pub const ICMP6_TIME_EXCEEDED: u8 = 3;
pub const ICMP6_PARAM_PROBLEM: u8 = 4;
pub const ICMP6_ECHO_REQUEST: u8 = 128;
pub const ICMP6_ECHO_REPLY: u8 = 129;

/// Whether an ICMP message reports a problem with some other packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IcmpClass {
    /// The message quotes the packet it is about, and belongs to that
    /// packet's connection.
    Error,

    /// Echo, neighbor discovery, and everything else not tied to a
    /// transport connection.
    Informational,
}

impl IcmpClass {
    pub fn of(family: AddrFamily, ty: u8) -> Self {
        let is_err = match family {
            AddrFamily::V4 => matches!(
                ty,
                ICMP4_DEST_UNREACHABLE
                    | ICMP4_SOURCE_QUENCH
                    | ICMP4_TIME_EXCEEDED
                    | ICMP4_PARAM_PROBLEM
            ),
            AddrFamily::V6 => matches!(
                ty,
                ICMP6_DEST_UNREACHABLE
                    | ICMP6_PACKET_TOO_BIG
                    | ICMP6_TIME_EXCEEDED
                    | ICMP6_PARAM_PROBLEM
            ),
        };

        if is_err { Self::Error } else { Self::Informational }
    }
}

#[derive(Debug)]
pub struct IcmpHdr<'a> {
    base: Ref<&'a [u8], IcmpHdrRaw>,
}

impl<'a> IcmpHdr<'a> {
    pub const SIZE: usize = IcmpHdrRaw::SIZE;

    pub fn parse(rdr: &mut PacketReader<'a>) -> Result<Self, IcmpHdrError> {
        let src = rdr.slice(IcmpHdrRaw::SIZE)?;
        let base = Ref::<_, IcmpHdrRaw>::from_bytes(src)
            .map_err(|_| ReadErr::BadLayout)?;
        Ok(Self { base })
    }

    pub fn ty(&self) -> u8 {
        self.base.ty
    }

    pub fn code(&self) -> u8 {
        self.base.code
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, DError)]
pub enum IcmpHdrError {
    ReadError(ReadErr),
}

impl From<ReadErr> for IcmpHdrError {
    fn from(error: ReadErr) -> Self {
        IcmpHdrError::ReadError(error)
    }
}

#[repr(C)]
#[derive(
    Clone, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
pub struct IcmpHdrRaw {
    pub ty: u8,
    pub code: u8,
    pub csum: [u8; 2],
    pub rest: [u8; 4],
}

impl IcmpHdrRaw {
    pub const SIZE: usize = mem::size_of::<Self>();
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classification() {
        use AddrFamily::*;
        use IcmpClass::*;

        assert_eq!(IcmpClass::of(V4, ICMP4_DEST_UNREACHABLE), Error);
        assert_eq!(IcmpClass::of(V4, ICMP4_TIME_EXCEEDED), Error);
        assert_eq!(IcmpClass::of(V4, ICMP4_ECHO_REQUEST), Informational);
        // Redirect is not tied to a connection.
        assert_eq!(IcmpClass::of(V4, 5), Informational);

        assert_eq!(IcmpClass::of(V6, ICMP6_PACKET_TOO_BIG), Error);
        assert_eq!(IcmpClass::of(V6, ICMP6_PARAM_PROBLEM), Error);
        assert_eq!(IcmpClass::of(V6, ICMP6_ECHO_REPLY), Informational);
        // Neighbor solicitation.
        assert_eq!(IcmpClass::of(V6, 135), Informational);
        // The same number means different things per family: type 2 is
        // unassigned in ICMPv4, and ICMPv6 echo request is out of range.
        assert_eq!(IcmpClass::of(V4, ICMP6_PACKET_TOO_BIG), Informational);
        assert_eq!(IcmpClass::of(V4, ICMP6_ECHO_REQUEST), Informational);
    }

    #[test]
    fn header_covers_type_specific_word() {
        #[rustfmt::skip]
        let bytes = [
            // type, code, checksum
            0x02, 0x00, 0x00, 0x00,
            // MTU 1400
            0x00, 0x00, 0x05, 0x78,
            // start of the quoted packet
            0x60,
        ];
        let mut rdr = PacketReader::new(&bytes);
        let icmp = IcmpHdr::parse(&mut rdr).unwrap();
        assert_eq!(icmp.ty(), ICMP6_PACKET_TOO_BIG);
        assert_eq!(icmp.code(), 0);
        assert_eq!(rdr.offset(), IcmpHdr::SIZE);
        assert_eq!(rdr.peek_u8().unwrap(), 0x60);
    }
}
