// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Generic UDP Encapsulation (GUE) headers.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Ver|C|  Hlen   |  Proto/ctype  |             Flags             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                                                               |
//! ~                 Optional data (Hlen 32-bit words)             ~
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! We only accept variant 0 data messages. The optional data is where
//! the hop chain lives, see [`super::hop_chain`].

use super::packet::PacketReader;
use super::packet::ReadErr;
use crate::api::GUE_MAX_OPT_LEN;
use crate::api::GUE_PROTO_IPV4;
use crate::api::GUE_PROTO_IPV6;
use crate::api::GUE_VERSION;
use crate::d_error::DError;
use core::mem;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Ref;
use zerocopy::Unaligned;

const GUE_VER_SHIFT: u8 = 6;
const GUE_CTRL_BIT: u8 = 0x20;
const GUE_HLEN_MASK: u8 = 0x1F;

#[derive(Debug)]
pub struct GueHdr<'a> {
    base: Ref<&'a [u8], GueHdrRaw>,
}

impl<'a> GueHdr<'a> {
    pub const SIZE: usize = GueHdrRaw::SIZE;

    pub fn parse(rdr: &mut PacketReader<'a>) -> Result<Self, GueHdrError> {
        let src = rdr.slice(GueHdrRaw::SIZE)?;
        let base = Ref::<_, GueHdrRaw>::from_bytes(src)
            .map_err(|_| ReadErr::BadLayout)?;
        let gue = Self { base };

        let vsn = gue.version();
        if vsn != GUE_VERSION {
            return Err(GueHdrError::BadVersion { vsn });
        }

        if gue.is_control() {
            return Err(GueHdrError::ControlMessage);
        }

        let proto = gue.proto();
        if proto != GUE_PROTO_IPV4 && proto != GUE_PROTO_IPV6 {
            return Err(GueHdrError::UnsupportedProto { proto });
        }

        Ok(gue)
    }

    pub fn version(&self) -> u8 {
        self.base.ver_c_hlen >> GUE_VER_SHIFT
    }

    pub fn is_control(&self) -> bool {
        self.base.ver_c_hlen & GUE_CTRL_BIT != 0
    }

    /// Length of the optional data, in 32-bit words.
    pub fn hlen(&self) -> u8 {
        self.base.ver_c_hlen & GUE_HLEN_MASK
    }

    /// Length of the optional data, in bytes.
    pub fn opt_len(&self) -> usize {
        usize::from(self.hlen()) * 4
    }

    pub fn proto(&self) -> u8 {
        self.base.proto
    }

    pub fn flags(&self) -> u16 {
        u16::from_be_bytes(self.base.flags)
    }

    pub fn meta(&self) -> GueMeta {
        GueMeta { hlen: self.hlen(), proto: self.proto(), flags: self.flags() }
    }
}

/// The values of a GUE header, detached from any frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GueMeta {
    pub hlen: u8,
    pub proto: u8,
    pub flags: u16,
}

impl GueMeta {
    /// A header announcing `opt_len` bytes of optional data, rounded
    /// up to whole words.
    pub fn new(proto: u8, opt_len: usize) -> Result<Self, GueHdrError> {
        if opt_len > GUE_MAX_OPT_LEN {
            return Err(GueHdrError::OptionsTooLong { len: opt_len as u16 });
        }

        Ok(Self { hlen: opt_len.div_ceil(4) as u8, proto, flags: 0 })
    }

    pub fn opt_len(&self) -> usize {
        usize::from(self.hlen) * 4
    }

    pub fn emit(&self, dst: &mut Vec<u8>) {
        let raw = GueHdrRaw {
            ver_c_hlen: (GUE_VERSION << GUE_VER_SHIFT)
                | (self.hlen & GUE_HLEN_MASK),
            proto: self.proto,
            flags: self.flags.to_be_bytes(),
        };
        dst.extend_from_slice(raw.as_bytes());
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, DError)]
#[derror(leaf_data = GueHdrError::derror_data)]
pub enum GueHdrError {
    BadVersion { vsn: u8 },
    ControlMessage,
    UnsupportedProto { proto: u8 },
    OptionsTooLong { len: u16 },
    ReadError(ReadErr),
}

impl GueHdrError {
    fn derror_data(&self, data: &mut [u64]) {
        data[0] = match self {
            Self::BadVersion { vsn } => *vsn as u64,
            Self::UnsupportedProto { proto } => *proto as u64,
            Self::OptionsTooLong { len } => *len as u64,
            _ => 0,
        }
    }
}

impl From<ReadErr> for GueHdrError {
    fn from(error: ReadErr) -> Self {
        GueHdrError::ReadError(error)
    }
}

#[repr(C)]
#[derive(
    Clone, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
pub struct GueHdrRaw {
    pub ver_c_hlen: u8,
    pub proto: u8,
    pub flags: [u8; 2],
}

impl GueHdrRaw {
    pub const SIZE: usize = mem::size_of::<Self>();
}
