// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Reading headers out of a received frame.

use super::gue::GueHdrError;
use super::hop_chain::HopChainError;
use super::icmp::IcmpHdrError;
use super::ip4::Ipv4HdrError;
use super::ip6::Ipv6HdrError;
use super::tcp::TcpHdrError;
use super::udp::UdpHdrError;
use crate::d_error::DError;
use core::fmt;
use core::fmt::Display;

#[derive(Clone, Copy, Debug, Eq, PartialEq, DError)]
pub enum ReadErr {
    BadLayout,
    NotEnoughBytes,
}

/// A cursor over the bytes of a single frame.
///
/// Header parsers pull fixed-size slices off the front. Everything
/// handed out borrows from the frame, so parsed views live as long as
/// the frame itself rather than the reader.
#[derive(Clone, Debug)]
pub struct PacketReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// The current offset from the start of the frame.
    pub fn offset(&self) -> usize {
        self.pos
    }

    /// The number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn peek_u8(&self) -> Result<u8, ReadErr> {
        self.bytes.get(self.pos).copied().ok_or(ReadErr::NotEnoughBytes)
    }

    /// Take the next `len` bytes.
    pub fn slice(&mut self, len: usize) -> Result<&'a [u8], ReadErr> {
        if len > self.remaining() {
            return Err(ReadErr::NotEnoughBytes);
        }

        let start = self.pos;
        self.pos += len;
        Ok(&self.bytes[start..self.pos])
    }

    /// Skip the next `len` bytes.
    pub fn seek(&mut self, len: usize) -> Result<(), ReadErr> {
        self.slice(len).map(|_| ())
    }

    /// Take everything left.
    pub fn rest(&mut self) -> &'a [u8] {
        let start = self.pos;
        self.pos = self.bytes.len();
        &self.bytes[start..]
    }
}

/// Why a frame, or the packet it carries, could not be understood.
#[derive(Clone, Copy, Debug, Eq, PartialEq, DError)]
#[derror(leaf_data = ParseError::data)]
pub enum ParseError {
    Read(ReadErr),
    Ipv4(Ipv4HdrError),
    Ipv6(Ipv6HdrError),
    Udp(UdpHdrError),
    Tcp(TcpHdrError),
    Icmp(IcmpHdrError),
    Gue(GueHdrError),
    Chain(HopChainError),
    BadIpVersion { vsn: u8 },
    NotUdp { proto: u8 },
    NotGue { dst_port: u16 },
    OuterFragment,
    EmptyInner,
    InnerVersionMismatch { gue_proto: u8, vsn: u8 },
    UnsupportedProtocol { proto: u8 },
    NonFirstFragment,
    TruncatedEmbeddedHeader,
    UnsupportedEmbeddedProtocol { proto: u8 },
}

impl ParseError {
    fn data(&self, data: &mut [u64]) {
        data[0] = match self {
            Self::BadIpVersion { vsn } => *vsn as u64,
            Self::NotUdp { proto } => *proto as u64,
            Self::NotGue { dst_port } => *dst_port as u64,
            Self::InnerVersionMismatch { gue_proto, vsn } => {
                data[1] = *vsn as u64;
                *gue_proto as u64
            }
            Self::UnsupportedProtocol { proto } => *proto as u64,
            Self::UnsupportedEmbeddedProtocol { proto } => *proto as u64,
            _ => 0,
        }
    }

    /// Is this a quoted packet that ran out before its port pair?
    pub fn is_truncated_embedded(&self) -> bool {
        matches!(self, Self::TruncatedEmbeddedHeader)
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read(e) => write!(f, "read error: {e:?}"),
            Self::Ipv4(e) => write!(f, "bad IPv4 header: {e:?}"),
            Self::Ipv6(e) => write!(f, "bad IPv6 header: {e:?}"),
            Self::Udp(e) => write!(f, "bad UDP header: {e:?}"),
            Self::Tcp(e) => write!(f, "bad TCP header: {e:?}"),
            Self::Icmp(e) => write!(f, "bad ICMP header: {e:?}"),
            Self::Gue(e) => write!(f, "bad GUE header: {e:?}"),
            Self::Chain(e) => write!(f, "bad hop chain: {e:?}"),
            Self::BadIpVersion { vsn } => write!(f, "bad IP version {vsn}"),
            Self::NotUdp { proto } => write!(f, "outer protocol {proto}"),
            Self::NotGue { dst_port } => {
                write!(f, "UDP destination port {dst_port} is not GUE")
            }
            Self::OuterFragment => write!(f, "fragmented outer datagram"),
            Self::EmptyInner => write!(f, "no inner packet"),
            Self::InnerVersionMismatch { gue_proto, vsn } => write!(
                f,
                "GUE proto {gue_proto} carries IP version {vsn}"
            ),
            Self::UnsupportedProtocol { proto } => {
                write!(f, "unsupported inner protocol {proto}")
            }
            Self::NonFirstFragment => write!(f, "non-first inner fragment"),
            Self::TruncatedEmbeddedHeader => {
                write!(f, "ICMP error quotes too little of its packet")
            }
            Self::UnsupportedEmbeddedProtocol { proto } => {
                write!(f, "ICMP error quotes protocol {proto}")
            }
        }
    }
}

impl From<ReadErr> for ParseError {
    fn from(error: ReadErr) -> Self {
        Self::Read(error)
    }
}

impl From<Ipv4HdrError> for ParseError {
    fn from(error: Ipv4HdrError) -> Self {
        Self::Ipv4(error)
    }
}

impl From<Ipv6HdrError> for ParseError {
    fn from(error: Ipv6HdrError) -> Self {
        Self::Ipv6(error)
    }
}

impl From<UdpHdrError> for ParseError {
    fn from(error: UdpHdrError) -> Self {
        Self::Udp(error)
    }
}

impl From<TcpHdrError> for ParseError {
    fn from(error: TcpHdrError) -> Self {
        Self::Tcp(error)
    }
}

impl From<IcmpHdrError> for ParseError {
    fn from(error: IcmpHdrError) -> Self {
        Self::Icmp(error)
    }
}

impl From<GueHdrError> for ParseError {
    fn from(error: GueHdrError) -> Self {
        Self::Gue(error)
    }
}

impl From<HopChainError> for ParseError {
    fn from(error: HopChainError) -> Self {
        Self::Chain(error)
    }
}
