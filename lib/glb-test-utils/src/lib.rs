// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Common routines for integration tests.

// This type of pedantry is more trouble than it's worth here.
#![allow(dead_code)]

pub mod icmp;
pub mod pcap;
pub mod pkt;

// Let's make our lives easier and pub use a bunch of stuff.
pub use glb_api::AddrFamily;
pub use glb_api::DEF_MAX_HOPS;
pub use glb_api::FlowKey;
pub use glb_api::GUE_PORT;
pub use glb_api::IpAddr;
pub use glb_api::Ipv4Addr;
pub use glb_api::Ipv6Addr;
pub use glb_api::Listener;
pub use glb_api::Ownership;
pub use glb_api::Protocol;
pub use glb_redirect::engine::LocalDelivery;
pub use glb_redirect::engine::OwnershipOracle;
pub use glb_redirect::engine::Transport;
pub use glb_redirect::engine::conn_table::ConnTable;
pub use glb_redirect::engine::conn_table::ConnTableCfg;
pub use glb_redirect::engine::encap::EncapPacket;
pub use glb_redirect::engine::flow::InnerPacket;
pub use glb_redirect::engine::hop_chain::HopChain;
pub use glb_redirect::engine::packet::ParseError;
pub use glb_redirect::engine::redirect::Decision;
pub use glb_redirect::engine::redirect::DeliverReason;
pub use glb_redirect::engine::redirect::DropReason;
pub use glb_redirect::engine::redirect::RedirectCfg;
pub use glb_redirect::engine::redirect::Redirector;
pub use glb_redirect::engine::tcp::TcpFlags;
pub use glb_redirect::print::print_conn_table;
pub use glb_redirect::print::print_stats;
pub use glb_redirect::sync::KMutex;
pub use icmp::*;
pub use pcap::*;
pub use pkt::*;
use slog::Drain;
use slog::Logger;
use slog::o;
use std::io;

pub const PROXY_IP4: &str = "192.168.50.10";
pub const ALT_IP4: &str = "192.168.50.11";
pub const SELF_IP4: &str = "192.168.50.5";

pub const PROXY_IP6: &str = "fd2c:4c0c:6f5e::10";
pub const ALT_IP6: &str = "fd2c:4c0c:6f5e::11";
pub const SELF_IP6: &str = "fd2c:4c0c:6f5e::5";

/// The service every test connects to, and the port it listens on.
pub const VIP4: &str = "10.10.10.10";
pub const VIP6: &str = "fd00:10::10";
pub const SVC_PORT: u16 = 22;

pub const CLIENT_IP4: &str = "172.16.99.7";
pub const CLIENT_IP6: &str = "fd00:99::7";

/// The GUE source port of frames the test host originates.
pub const TEST_GUE_SPORT: u16 = 51515;

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

/// A logger printing through the test harness, so output is only shown
/// for failing tests.
pub fn test_logger() -> Logger {
    let decorator =
        slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!("unit" => "test"))
}

/// Encapsulate `inner` from `src` to `dst`, carrying `hops` with none
/// yet consumed.
pub fn encap(
    src: IpAddr,
    dst: IpAddr,
    hops: &[IpAddr],
    inner: &[u8],
) -> Vec<u8> {
    encap_at(src, dst, hops, 0, inner)
}

/// Like [`encap`], but with the first `consumed` hops already behind
/// the chain cursor.
pub fn encap_at(
    src: IpAddr,
    dst: IpAddr,
    hops: &[IpAddr],
    consumed: usize,
    inner: &[u8],
) -> Vec<u8> {
    let mut chain = HopChain::new(src.family(), hops).unwrap();
    for _ in 0..consumed {
        chain = chain.pop_head().unwrap().1;
    }

    EncapPacket::new(src, dst, TEST_GUE_SPORT, chain, inner).unwrap().emit()
}

/// A [`Transport`] that keeps everything sent through it.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: KMutex<Vec<(IpAddr, Vec<u8>)>>,
}

impl RecordingTransport {
    pub fn take(&self) -> Vec<(IpAddr, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl Transport for RecordingTransport {
    fn send(&self, dst: IpAddr, frame: &[u8]) -> io::Result<()> {
        self.sent.lock().push((dst, frame.to_vec()));
        Ok(())
    }
}

/// A [`LocalDelivery`] that keeps everything delivered through it.
#[derive(Debug, Default)]
pub struct RecordingDelivery {
    delivered: KMutex<Vec<Vec<u8>>>,
}

impl RecordingDelivery {
    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.delivered.lock())
    }
}

impl LocalDelivery for RecordingDelivery {
    fn deliver(&self, inner: &[u8]) -> io::Result<()> {
        self.delivered.lock().push(inner.to_vec());
        Ok(())
    }
}

/// One redirect node of a [`Fleet`].
pub struct Node {
    pub name: &'static str,
    pub addr: IpAddr,
    pub redirector: Redirector<ConnTable>,
    pub local: RecordingDelivery,
}

impl Node {
    pub fn conns(&self) -> &ConnTable {
        self.redirector.oracle()
    }
}

/// What one node did with a frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Step {
    Deliver { at: &'static str, reason: DeliverReason },
    Forward { at: &'static str, to: IpAddr },
    Bounce { at: &'static str, to: IpAddr },
    Drop { at: &'static str, reason: DropReason },
}

/// The path of one injected frame through a [`Fleet`].
#[derive(Debug, Default)]
pub struct Trace {
    pub steps: Vec<Step>,

    /// The frame, if it was sent to an address outside the fleet.
    pub egress: Option<(IpAddr, Vec<u8>)>,
}

impl Trace {
    /// The last step taken.
    pub fn last(&self) -> &Step {
        self.steps.last().unwrap()
    }

    /// The egress frame, decoded.
    pub fn egress_pkt(&self) -> EncapPacket<'_> {
        let (_, frame) = self.egress.as_ref().unwrap();
        EncapPacket::parse(frame, DEF_MAX_HOPS).unwrap()
    }
}

/// A set of redirect nodes wired together by an in-memory network.
///
/// Frames sent to a node's address are handled by that node; frames
/// sent anywhere else leave the fleet and end the trace.
pub struct Fleet {
    pub nodes: Vec<Node>,
    net: RecordingTransport,
    pcap: Option<PcapBuilder>,
}

/// Any frame that takes more steps than this is looping.
pub const FLEET_MAX_STEPS: usize = 64;

impl Fleet {
    /// Build a fleet of nodes `(name, addr)`, each listening on
    /// `listeners`.
    pub fn new(
        nodes: &[(&'static str, &str)],
        listeners: &[Listener],
    ) -> Self {
        let nodes: Vec<_> =
            nodes.iter().map(|(name, addr)| (*name, *addr, listeners)).collect();
        Self::with_listeners(&nodes)
    }

    /// Build a fleet of nodes `(name, addr, listeners)`, where each node
    /// accepts new connections only on its own listeners.
    pub fn with_listeners(
        nodes: &[(&'static str, &str, &[Listener])],
    ) -> Self {
        let log = test_logger();
        let nodes = nodes
            .iter()
            .map(|(name, addr, listeners)| {
                let addr = ip(addr);
                let conns = ConnTable::new(ConnTableCfg {
                    listeners: listeners.to_vec(),
                    ..Default::default()
                });
                let log = log.new(o!("node" => *name));
                Node {
                    name: *name,
                    addr,
                    redirector: Redirector::new(
                        RedirectCfg::new(addr),
                        conns,
                        &log,
                    ),
                    local: RecordingDelivery::default(),
                }
            })
            .collect();

        Self { nodes, net: RecordingTransport::default(), pcap: None }
    }

    /// The standard pair of nodes, PROXY and ALT, in the given outer
    /// family.
    pub fn proxy_alt(family: AddrFamily, listeners: &[Listener]) -> Self {
        match family {
            AddrFamily::V4 => {
                Self::new(&[("proxy", PROXY_IP4), ("alt", ALT_IP4)], listeners)
            }
            AddrFamily::V6 => {
                Self::new(&[("proxy", PROXY_IP6), ("alt", ALT_IP6)], listeners)
            }
        }
    }

    /// Record every frame seen on the network to `path`.
    pub fn capture(&mut self, path: &str) {
        self.pcap = Some(PcapBuilder::new(path));
    }

    pub fn node(&self, name: &str) -> &Node {
        self.nodes
            .iter()
            .find(|n| n.name == name)
            .unwrap_or_else(|| panic!("no node named {name}"))
    }

    /// Send `frame` onto the network and follow it until it is
    /// delivered, dropped, or leaves the fleet.
    ///
    /// The frame is routed on its outer destination alone, so frames the
    /// nodes themselves cannot decode still reach them. A frame with no
    /// readable destination takes no steps.
    pub fn inject(&mut self, frame: Vec<u8>) -> Trace {
        let mut trace = Trace::default();
        let mut next = outer_dst(&frame).map(|dst| (dst, frame));

        while let Some((dst, frame)) = next.take() {
            if let Some(pcap) = self.pcap.as_mut() {
                pcap.add_pkt(&frame);
            }

            let Some(node) = self.nodes.iter().find(|n| n.addr == dst) else {
                trace.egress = Some((dst, frame));
                break;
            };

            assert!(
                trace.steps.len() < FLEET_MAX_STEPS,
                "frame is looping: {:?}",
                trace.steps
            );

            let at = node.name;
            let decision =
                node.redirector.handle(&frame, &self.net, &node.local);
            let step = match decision {
                Decision::DeliverLocal { reason, .. } => {
                    Step::Deliver { at, reason }
                }
                Decision::Forward { next_hop, .. } => {
                    Step::Forward { at, to: next_hop }
                }
                Decision::Bounce { to, .. } => Step::Bounce { at, to },
                Decision::Drop { reason } => Step::Drop { at, reason },
            };
            trace.steps.push(step);

            let mut sent = self.net.take();
            assert!(sent.len() <= 1);
            next = sent.pop();
        }

        trace
    }
}

/// Read the destination address straight out of an IP header.
pub fn outer_dst(frame: &[u8]) -> Option<IpAddr> {
    match frame.first()? >> 4 {
        4 => {
            let dst: [u8; 4] = frame.get(16..20)?.try_into().ok()?;
            Some(Ipv4Addr::from(dst).into())
        }
        6 => {
            let dst: [u8; 16] = frame.get(24..40)?.try_into().ok()?;
            Some(Ipv6Addr::from(dst).into())
        }
        _ => None,
    }
}

#[macro_export]
macro_rules! assert_drop {
    ($trace:expr, $expected:expr) => {
        match $trace.last() {
            $crate::Step::Drop { reason, .. } => {
                assert_eq!(*reason, $expected);
            }

            step => panic!("expected drop, but got: {:?}", step),
        }
    };
}
