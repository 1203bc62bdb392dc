// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The raw-socket shim between the engine and the host network stack.
//!
//! Frames are read with their outer IP header attached from a raw UDP
//! socket, and written back out through `IPPROTO_RAW` sockets, which
//! take the IP header from the frame itself. Delivering an inner
//! packet locally is the same write, addressed to the inner
//! destination, which the host routes to itself.

use glb_api::GUE_PORT;
use glb_api::IpAddr;
use glb_redirect::engine::LocalDelivery;
use glb_redirect::engine::Transport;
use socket2::Domain;
use socket2::Protocol;
use socket2::SockAddr;
use socket2::Socket;
use socket2::Type;
use std::io;
use std::io::Read;
use std::net::SocketAddr;

const IPPROTO_RAW: i32 = 255;

/// The largest frame we read.
pub const RX_BUF_LEN: usize = 65535;

const IPV4_PROTO_OFF: usize = 9;
const UDP_PROTO: u8 = 17;

/// Receives every UDP datagram addressed to this host, outer IPv4
/// header included.
pub struct GueReceiver {
    raw: Socket,

    // Held so that the kernel considers the GUE port open and does not
    // answer encapsulated traffic with port unreachable.
    _port: Socket,
}

impl GueReceiver {
    pub fn bind(local: IpAddr) -> io::Result<Self> {
        let raw = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::UDP))?;
        let port = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        port.set_reuse_address(true)?;
        let addr = SocketAddr::new(local.into(), GUE_PORT);
        port.bind(&SockAddr::from(addr))?;
        port.set_recv_buffer_size(0)?;

        Ok(Self { raw, _port: port })
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        let raw = self.raw.try_clone()?;
        Ok(Self { raw, _port: self._port.try_clone()? })
    }

    /// Read the next GUE frame into `buf`, skipping everything else.
    pub fn recv<'a>(&self, buf: &'a mut [u8]) -> io::Result<&'a [u8]> {
        loop {
            let n = (&self.raw).read(buf)?;
            if is_gue(&buf[..n]) {
                return Ok(&buf[..n]);
            }
        }
    }
}

/// A cheap look at the UDP destination port, so that the engine only
/// sees traffic meant for it.
fn is_gue(frame: &[u8]) -> bool {
    let Some(&ver_ihl) = frame.first() else {
        return false;
    };
    let ihl = usize::from(ver_ihl & 0x0F) * 4;

    frame.get(IPV4_PROTO_OFF) == Some(&UDP_PROTO)
        && frame
            .get(ihl + 2..ihl + 4)
            .is_some_and(|p| u16::from_be_bytes([p[0], p[1]]) == GUE_PORT)
}

/// Sends complete IP packets, header and all.
pub struct RawSender {
    v4: Socket,
    v6: Socket,
}

impl RawSender {
    pub fn new() -> io::Result<Self> {
        let v4 = Socket::new(
            Domain::IPV4,
            Type::RAW,
            Some(Protocol::from(IPPROTO_RAW)),
        )?;
        v4.set_header_included_v4(true)?;

        let v6 = Socket::new(
            Domain::IPV6,
            Type::RAW,
            Some(Protocol::from(IPPROTO_RAW)),
        )?;

        Ok(Self { v4, v6 })
    }

    fn send_ip(&self, dst: IpAddr, pkt: &[u8]) -> io::Result<()> {
        let sock = match dst {
            IpAddr::Ip4(_) => &self.v4,
            IpAddr::Ip6(_) => &self.v6,
        };

        let addr = SockAddr::from(SocketAddr::new(dst.into(), 0));
        let n = sock.send_to(pkt, &addr)?;
        if n != pkt.len() {
            return Err(io::Error::other(format!(
                "short send to {dst}: {n} of {} bytes",
                pkt.len()
            )));
        }

        Ok(())
    }
}

impl Transport for RawSender {
    fn send(&self, dst: IpAddr, frame: &[u8]) -> io::Result<()> {
        self.send_ip(dst, frame)
    }
}

impl LocalDelivery for RawSender {
    fn deliver(&self, inner: &[u8]) -> io::Result<()> {
        let dst = inner_dst(inner).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "inner has no address")
        })?;
        self.send_ip(dst, inner)
    }
}

fn inner_dst(pkt: &[u8]) -> Option<IpAddr> {
    match pkt.first()? >> 4 {
        4 => {
            let b: [u8; 4] = pkt.get(16..20)?.try_into().ok()?;
            Some(IpAddr::from(glb_api::Ipv4Addr::from(b)))
        }
        6 => {
            let b: [u8; 16] = pkt.get(24..40)?.try_into().ok()?;
            Some(IpAddr::from(glb_api::Ipv6Addr::from(b)))
        }
        _ => None,
    }
}
