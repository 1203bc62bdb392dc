// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The redirect decision.
//!
//! Each received frame ends in exactly one of four ways:
//!
//! * **Deliver** the inner packet to the local stack. This happens for
//!   informational ICMP, for connections this node owns or adopts, and
//!   for TCP/UDP whose chain has run out (default acceptance).
//!
//! * **Forward** to the head of the remaining hop chain, with the chain
//!   advanced by one.
//!
//! * **Bounce** an ICMP error that nobody in the chain claimed back to
//!   the node it came from. ICMP errors are never accepted by default,
//!   since no local socket would make sense of them.
//!
//! * **Drop**, silently, anything that cannot be decoded or has nowhere
//!   left to go.
//!
//! A bounce arriving back at a node is recognized by its chain: the
//! last hop consumed is the node that sent it, rather than this node.
//! Such a packet is delivered if owned here and dropped otherwise; it
//! is never bounced again.

use super::LocalDelivery;
use super::OwnershipOracle;
use super::Transport;
use super::encap::EncapBuildError;
use super::encap::EncapPacket;
use super::flow::InnerPacket;
use super::hop_chain::HopChain;
use super::packet::ParseError;
use super::stat::RedirectStats;
use crate::api::DEF_MAX_HOPS;
use crate::api::FlowKey;
use crate::api::IpAddr;
use crate::api::Ownership;
use crate::d_error::DError;
use crate::d_error::ErrorChain;
use core::fmt;
use core::fmt::Display;
use slog::Logger;
use slog::debug;
use slog::o;
use slog::trace;
use slog::warn;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RedirectCfg {
    /// This node's address on the encapsulation network. It is the
    /// outer source of everything this node sends.
    pub local_addr: IpAddr,

    /// The longest chain accepted on decode.
    pub max_hops: u8,
}

impl RedirectCfg {
    pub fn new(local_addr: IpAddr) -> Self {
        Self { local_addr, max_hops: DEF_MAX_HOPS }
    }
}

/// Why an inner packet was handed to the local stack.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeliverReason {
    IcmpInfo,
    Owned,
    Adopted,
    DefaultAccept,
}

impl Display for DeliverReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::IcmpInfo => "icmp-info",
            Self::Owned => "owned",
            Self::Adopted => "adopted",
            Self::DefaultAccept => "default-accept",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, DError)]
pub enum DropReason {
    /// The frame is not a well-formed encapsulated packet.
    Parse(ParseError),

    /// The inner packet could not be mapped to a flow.
    Flow(ParseError),

    /// The outer header is not of this node's address family.
    FamilyMismatch,

    /// The bounce target is this node.
    SelfBounce,

    /// A bounce came back and this node does not own the flow either.
    BounceUnresolved,

    Reencap(EncapBuildError),
}

impl Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chain: ErrorChain<8> = ErrorChain::from_err(self);
        write!(f, "{chain}")
    }
}

/// The outcome for one frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Decision<'a> {
    DeliverLocal { inner: &'a [u8], reason: DeliverReason },
    Forward { next_hop: IpAddr, frame: Vec<u8> },
    Bounce { to: IpAddr, frame: Vec<u8> },
    Drop { reason: DropReason },
}

impl Decision<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DeliverLocal { .. } => "deliver",
            Self::Forward { .. } => "forward",
            Self::Bounce { .. } => "bounce",
            Self::Drop { .. } => "drop",
        }
    }
}

pub struct Redirector<O: OwnershipOracle> {
    cfg: RedirectCfg,
    oracle: O,
    stats: RedirectStats,
    log: Logger,
}

impl<O: OwnershipOracle> Redirector<O> {
    pub fn new(cfg: RedirectCfg, oracle: O, log: &Logger) -> Self {
        let log = log.new(o!("local_addr" => cfg.local_addr.to_string()));
        Self { cfg, oracle, stats: RedirectStats::default(), log }
    }

    pub fn cfg(&self) -> &RedirectCfg {
        &self.cfg
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    pub fn stats(&self) -> &RedirectStats {
        &self.stats
    }

    /// Decide what to do with `frame`, without doing it.
    ///
    /// The oracle is still consulted and updated: adoption and release
    /// happen here.
    pub fn process<'a>(&self, frame: &'a [u8]) -> Decision<'a> {
        RedirectStats::incr(&self.stats.rx);
        let decision = self.decide(frame);

        match &decision {
            Decision::DeliverLocal { reason, .. } => {
                RedirectStats::incr(&self.stats.delivered);
                match reason {
                    DeliverReason::IcmpInfo => {
                        RedirectStats::incr(&self.stats.delivered_icmp_info)
                    }
                    DeliverReason::Adopted => {
                        RedirectStats::incr(&self.stats.adopted)
                    }
                    DeliverReason::DefaultAccept => {
                        RedirectStats::incr(&self.stats.default_accepted)
                    }
                    DeliverReason::Owned => {}
                }
            }
            Decision::Forward { .. } => {
                RedirectStats::incr(&self.stats.forwarded)
            }
            Decision::Bounce { .. } => RedirectStats::incr(&self.stats.bounced),
            Decision::Drop { reason } => {
                RedirectStats::incr(&self.stats.dropped);
                debug!(self.log, "drop"; "reason" => %reason);
            }
        }

        decision
    }

    /// Decide what to do with `frame`, and do it.
    ///
    /// Sends are fire and forget: a failure is counted and logged,
    /// never retried.
    pub fn handle<'a, T, L>(
        &self,
        frame: &'a [u8],
        transport: &T,
        local: &L,
    ) -> Decision<'a>
    where
        T: Transport + ?Sized,
        L: LocalDelivery + ?Sized,
    {
        let decision = self.process(frame);

        let (res, dst) = match &decision {
            Decision::DeliverLocal { inner, .. } => {
                (local.deliver(inner), self.cfg.local_addr)
            }
            Decision::Forward { next_hop, frame } => {
                (transport.send(*next_hop, frame), *next_hop)
            }
            Decision::Bounce { to, frame } => (transport.send(*to, frame), *to),
            Decision::Drop { .. } => return decision,
        };

        if let Err(e) = res {
            RedirectStats::incr(&self.stats.send_errors);
            warn!(
                self.log, "send failed";
                "action" => decision.kind(),
                "dst" => %dst,
                "error" => %e,
            );
        }

        decision
    }

    fn decide<'a>(&self, frame: &'a [u8]) -> Decision<'a> {
        let pkt = match EncapPacket::parse(frame, self.cfg.max_hops) {
            Ok(pkt) => pkt,
            Err(e) => return Decision::Drop { reason: DropReason::Parse(e) },
        };

        if pkt.family() != self.cfg.local_addr.family() {
            return Decision::Drop { reason: DropReason::FamilyMismatch };
        }

        let inner = match InnerPacket::parse(pkt.inner) {
            Ok(inner) => inner,
            Err(e) => return Decision::Drop { reason: DropReason::Flow(e) },
        };

        trace!(self.log, "rx"; "outer" => %pkt, "inner" => %inner);

        let Some(flow) = inner.flow_key() else {
            return self.deliver(&pkt, DeliverReason::IcmpInfo);
        };

        // An ICMP error quotes a packet sent by the connection's owner,
        // so the connection as it arrives at the owner is the mirror.
        let flow = if inner.is_icmp_error() { flow.mirror() } else { flow };

        match self.lookup(&flow) {
            Ownership::Owned => {
                if inner.is_reset() {
                    self.oracle.release(&flow);
                }
                return self.deliver(&pkt, DeliverReason::Owned);
            }

            // A connection this node failed to record is not its own,
            // so the packet carries on down the chain.
            Ownership::Adopt if inner.is_establishing() => {
                match self.oracle.adopt(&flow) {
                    Ok(()) => {
                        return self.deliver(&pkt, DeliverReason::Adopted);
                    }
                    Err(e) => {
                        RedirectStats::incr(&self.stats.oracle_errors);
                        warn!(
                            self.log, "adopt failed";
                            "flow" => %flow,
                            "error" => %e,
                        );
                    }
                }
            }

            Ownership::Adopt | Ownership::NotOwned => {}
        }

        if inner.is_icmp_error()
            && pkt.chain.last_consumed() == Some(pkt.outer.src())
        {
            return Decision::Drop { reason: DropReason::BounceUnresolved };
        }

        self.resolve(&pkt, &inner, &flow)
    }

    /// Oracle failures count as not owned.
    fn lookup(&self, flow: &FlowKey) -> Ownership {
        match self.oracle.lookup(flow) {
            Ok(ownership) => ownership,
            Err(e) => {
                RedirectStats::incr(&self.stats.oracle_errors);
                warn!(
                    self.log, "lookup failed";
                    "flow" => %flow,
                    "error" => %e,
                );
                Ownership::NotOwned
            }
        }
    }

    fn resolve<'a>(
        &self,
        pkt: &EncapPacket<'a>,
        inner: &InnerPacket,
        flow: &FlowKey,
    ) -> Decision<'a> {
        let local = self.cfg.local_addr;

        // A head naming this node is as good as no head at all.
        let head = pkt.chain.pop_head().ok().filter(|(hop, _)| *hop != local);
        if let Some((next_hop, rest)) = head {
            return match pkt.reencap(local, next_hop, rest) {
                Ok(fwd) => {
                    debug!(
                        self.log, "forward";
                        "flow" => %flow,
                        "next_hop" => %next_hop,
                    );
                    Decision::Forward { next_hop, frame: fwd.emit() }
                }
                Err(e) => Decision::Drop { reason: DropReason::Reencap(e) },
            };
        }

        if !inner.is_icmp_error() {
            return self.deliver(pkt, DeliverReason::DefaultAccept);
        }

        let to = pkt.outer.src();
        if to == local {
            return Decision::Drop { reason: DropReason::SelfBounce };
        }

        self.bounce(pkt, to, pkt.chain.clone(), flow)
    }

    fn bounce<'a>(
        &self,
        pkt: &EncapPacket<'a>,
        to: IpAddr,
        chain: HopChain,
        flow: &FlowKey,
    ) -> Decision<'a> {
        match pkt.reencap(self.cfg.local_addr, to, chain) {
            Ok(back) => {
                debug!(self.log, "bounce"; "flow" => %flow, "to" => %to);
                Decision::Bounce { to, frame: back.emit() }
            }
            Err(e) => Decision::Drop { reason: DropReason::Reencap(e) },
        }
    }

    fn deliver<'a>(
        &self,
        pkt: &EncapPacket<'a>,
        reason: DeliverReason,
    ) -> Decision<'a> {
        trace!(self.log, "deliver"; "reason" => %reason);
        Decision::DeliverLocal { inner: pkt.inner, reason }
    }
}
