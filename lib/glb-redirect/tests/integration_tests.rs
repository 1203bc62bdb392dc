// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Integration tests.
//!
//! Each test drives a pair of redirect nodes, PROXY and ALT, through
//! the in-memory fleet. Frames are injected the way a director would
//! send them, from the test host (SELF), and followed hop by hop until
//! they are delivered, dropped, or sent back out of the fleet.

use glb_test_utils as common;

use common::*;
use glb_redirect::engine::flow_table::FLOW_DEF_EXPIRE_SECS;
use glb_redirect::time::Moment;
use rand::Rng;
use std::time::Duration;

const ROUTER_IP4: &str = "10.99.0.1";
const ROUTER_IP6: &str = "fd00:98::1";

/// The addresses of one test topology.
struct Topo {
    proxy: IpAddr,
    alt: IpAddr,
    tester: IpAddr,
    client: IpAddr,
    vip: IpAddr,
    router: IpAddr,
    cport: u16,
}

impl Topo {
    fn new(outer: AddrFamily, inner: AddrFamily) -> Self {
        let (proxy, alt, tester) = match outer {
            AddrFamily::V4 => (PROXY_IP4, ALT_IP4, SELF_IP4),
            AddrFamily::V6 => (PROXY_IP6, ALT_IP6, SELF_IP6),
        };
        let (client, vip, router) = match inner {
            AddrFamily::V4 => (CLIENT_IP4, VIP4, ROUTER_IP4),
            AddrFamily::V6 => (CLIENT_IP6, VIP6, ROUTER_IP6),
        };

        Self {
            proxy: ip(proxy),
            alt: ip(alt),
            tester: ip(tester),
            client: ip(client),
            vip: ip(vip),
            router: ip(router),
            cport: rand::rng().random_range(32768..61000),
        }
    }

    fn client(&self) -> (IpAddr, u16) {
        (self.client, self.cport)
    }

    fn svc(&self) -> (IpAddr, u16) {
        (self.vip, SVC_PORT)
    }

    /// A frame from the test host to PROXY.
    fn via_proxy(&self, hops: &[IpAddr], inner: &[u8]) -> Vec<u8> {
        encap(self.tester, self.proxy, hops, inner)
    }

    fn conn(&self) -> FlowKey {
        let inner = tcp_syn(self.client(), self.svc());
        InnerPacket::parse(&inner).unwrap().flow_key().unwrap()
    }
}

fn fleet(outer: AddrFamily) -> Fleet {
    Fleet::proxy_alt(outer, &[Listener::any(SVC_PORT)])
}

// A new connection is taken by the first node willing to accept it.
fn syn_adopted_by_first_hop(outer: AddrFamily, inner: AddrFamily) {
    let t = Topo::new(outer, inner);
    let mut fleet = fleet(outer);

    let syn = tcp_syn(t.client(), t.svc());
    let trace = fleet.inject(t.via_proxy(&[t.alt], &syn));

    assert_eq!(
        trace.steps,
        vec![Step::Deliver { at: "proxy", reason: DeliverReason::Adopted }]
    );
    assert_eq!(fleet.node("proxy").local.take(), vec![syn]);
    assert_eq!(fleet.node("proxy").conns().num_flows(), 1);
    assert_eq!(fleet.node("alt").conns().num_flows(), 0);
}

#[test]
fn syn_adopted_by_first_hop_v4() {
    syn_adopted_by_first_hop(AddrFamily::V4, AddrFamily::V4);
}

#[test]
fn syn_adopted_by_first_hop_v6_inner() {
    syn_adopted_by_first_hop(AddrFamily::V4, AddrFamily::V6);
}

// A node with no listener for the service passes a new connection on to
// the next hop, which takes it.
fn syn_adopted_by_listening_hop(outer: AddrFamily, inner: AddrFamily) {
    let t = Topo::new(outer, inner);
    let (proxy, alt) = match outer {
        AddrFamily::V4 => (PROXY_IP4, ALT_IP4),
        AddrFamily::V6 => (PROXY_IP6, ALT_IP6),
    };
    let none: &[Listener] = &[];
    let svc: &[Listener] = &[Listener::any(SVC_PORT)];
    let mut fleet =
        Fleet::with_listeners(&[("proxy", proxy, none), ("alt", alt, svc)]);

    let syn = tcp_syn(t.client(), t.svc());
    let trace = fleet.inject(t.via_proxy(&[t.alt], &syn));

    assert_eq!(
        trace.steps,
        vec![
            Step::Forward { at: "proxy", to: t.alt },
            Step::Deliver { at: "alt", reason: DeliverReason::Adopted },
        ]
    );
    assert!(trace.egress.is_none());
    assert_eq!(fleet.node("alt").local.take(), vec![syn]);
    assert!(fleet.node("proxy").local.take().is_empty());
    assert_eq!(fleet.node("alt").conns().num_flows(), 1);
    assert_eq!(fleet.node("proxy").conns().num_flows(), 0);

    // The rest of the connection follows the SYN to ALT.
    let ack = tcp_ack(t.client(), t.svc());
    let trace = fleet.inject(t.via_proxy(&[t.alt], &ack));
    assert_eq!(
        trace.steps,
        vec![
            Step::Forward { at: "proxy", to: t.alt },
            Step::Deliver { at: "alt", reason: DeliverReason::Owned },
        ]
    );
}

#[test]
fn syn_adopted_by_listening_hop_v4() {
    syn_adopted_by_listening_hop(AddrFamily::V4, AddrFamily::V4);
}

#[test]
fn syn_adopted_by_listening_hop_v6_inner() {
    syn_adopted_by_listening_hop(AddrFamily::V4, AddrFamily::V6);
}

#[test]
fn syn_adopted_by_listening_hop_v6_outer() {
    syn_adopted_by_listening_hop(AddrFamily::V6, AddrFamily::V4);
}

// A stray packet nobody owns walks the entire chain, and the envelope
// is rebuilt at every hop.
fn unowned_walks_the_chain(outer: AddrFamily, inner: AddrFamily) {
    let t = Topo::new(outer, inner);
    let mut fleet = fleet(outer);

    let ack = tcp_ack(t.client(), t.svc());
    let trace = fleet.inject(t.via_proxy(&[t.alt, t.tester], &ack));

    assert_eq!(
        trace.steps,
        vec![
            Step::Forward { at: "proxy", to: t.alt },
            Step::Forward { at: "alt", to: t.tester },
        ]
    );

    let out = trace.egress_pkt();
    assert_eq!(out.outer.src(), t.alt);
    assert_eq!(out.outer.dst(), t.tester);
    assert_eq!(out.outer.ttl(), 64);
    assert_eq!(out.udp_src, TEST_GUE_SPORT);
    assert_eq!(out.udp_dst, GUE_PORT);
    assert_eq!(out.chain.hops(), &[t.alt, t.tester]);
    assert_eq!(out.chain.next_hop(), 2);
    assert!(out.chain.remaining().is_empty());
    assert_eq!(out.inner, &ack[..]);

    // Passing through adopts nothing.
    assert_eq!(fleet.node("proxy").conns().num_flows(), 0);
    assert_eq!(fleet.node("alt").conns().num_flows(), 0);
    assert!(fleet.node("alt").local.take().is_empty());
}

#[test]
fn unowned_walks_the_chain_v4() {
    unowned_walks_the_chain(AddrFamily::V4, AddrFamily::V4);
}

#[test]
fn unowned_walks_the_chain_v6_inner() {
    unowned_walks_the_chain(AddrFamily::V4, AddrFamily::V6);
}

#[test]
fn unowned_walks_the_chain_v6_outer() {
    unowned_walks_the_chain(AddrFamily::V6, AddrFamily::V4);
}

// A connection established on ALT keeps landing on ALT, wherever the
// director sends it first.
fn established_conn_follows_its_owner(outer: AddrFamily, inner: AddrFamily) {
    let t = Topo::new(outer, inner);
    let mut fleet = fleet(outer);

    // Out of the blue, with nowhere else to go: accepted so the local
    // stack can answer it.
    let rst = tcp_rst(t.client(), t.svc());
    let trace = fleet.inject(encap(t.tester, t.alt, &[], &rst));
    assert_eq!(
        trace.steps,
        vec![Step::Deliver { at: "alt", reason: DeliverReason::DefaultAccept }]
    );
    assert_eq!(fleet.node("alt").conns().num_flows(), 0);

    let syn = tcp_syn(t.client(), t.svc());
    let trace = fleet.inject(encap(t.tester, t.alt, &[], &syn));
    assert_eq!(
        trace.steps,
        vec![Step::Deliver { at: "alt", reason: DeliverReason::Adopted }]
    );

    let ack = tcp_ack(t.client(), t.svc());
    let trace = fleet.inject(t.via_proxy(&[t.alt, t.tester], &ack));
    assert_eq!(
        trace.steps,
        vec![
            Step::Forward { at: "proxy", to: t.alt },
            Step::Deliver { at: "alt", reason: DeliverReason::Owned },
        ]
    );
    assert_eq!(fleet.node("alt").local.take(), vec![rst, syn, ack]);
    assert_eq!(fleet.node("alt").conns().dump()[0].0, t.conn());
}

#[test]
fn established_conn_follows_its_owner_v4() {
    established_conn_follows_its_owner(AddrFamily::V4, AddrFamily::V4);
}

#[test]
fn established_conn_follows_its_owner_v6_inner() {
    established_conn_follows_its_owner(AddrFamily::V4, AddrFamily::V6);
}

// An ICMP error about one of ALT's connections reaches ALT even though
// the quoted packet runs server to client.
fn icmp_error_reaches_conn_owner(outer: AddrFamily, inner: AddrFamily) {
    let t = Topo::new(outer, inner);
    let mut fleet = fleet(outer);

    let syn = tcp_syn(t.client(), t.svc());
    fleet.inject(encap(t.tester, t.alt, &[], &syn));

    let reply = tcp_pkt(t.svc(), t.client(), TcpFlags::ACK, &[0xAA; 1400]);
    let too_big =
        gen_icmp_error(t.router, IcmpErrorKind::TooBig { mtu: 1280 }, &reply);
    let trace = fleet.inject(t.via_proxy(&[t.alt, t.tester], &too_big));

    assert_eq!(
        trace.steps,
        vec![
            Step::Forward { at: "proxy", to: t.alt },
            Step::Deliver { at: "alt", reason: DeliverReason::Owned },
        ]
    );
    assert_eq!(fleet.node("alt").local.take().last(), Some(&too_big));
}

#[test]
fn icmp_error_reaches_conn_owner_v4() {
    icmp_error_reaches_conn_owner(AddrFamily::V4, AddrFamily::V4);
}

#[test]
fn icmp_error_reaches_conn_owner_v6_inner() {
    icmp_error_reaches_conn_owner(AddrFamily::V4, AddrFamily::V6);
}

// An ICMP error nobody claims goes back once to the node that sent it,
// and no further.
#[test]
fn unclaimed_icmp_error_bounces_once() {
    let t = Topo::new(AddrFamily::V4, AddrFamily::V4);
    let mut fleet = fleet(AddrFamily::V4);

    let reply = tcp_ack(t.svc(), t.client());
    let unreach =
        gen_icmp_error(t.router, IcmpErrorKind::PortUnreachable, &reply);
    let trace = fleet.inject(t.via_proxy(&[t.alt], &unreach));

    assert_eq!(trace.steps.len(), 3);
    assert_eq!(trace.steps[0], Step::Forward { at: "proxy", to: t.alt });
    assert_eq!(trace.steps[1], Step::Bounce { at: "alt", to: t.proxy });
    assert_drop!(trace, DropReason::BounceUnresolved);

    let alt = fleet.node("alt").redirector.stats().snapshot();
    assert_eq!(alt.bounced, 1);
    let proxy = fleet.node("proxy").redirector.stats().snapshot();
    assert_eq!(proxy.dropped, 1);
    assert_eq!(proxy.forwarded, 1);
}

#[test]
fn icmp_info_is_never_redirected() {
    let t = Topo::new(AddrFamily::V4, AddrFamily::V6);
    let mut fleet = fleet(AddrFamily::V4);

    let echo = gen_icmp_echo_req(t.client, t.vip, b"ping");
    let trace = fleet.inject(t.via_proxy(&[t.alt, t.tester], &echo));
    assert_eq!(
        trace.steps,
        vec![Step::Deliver { at: "proxy", reason: DeliverReason::IcmpInfo }]
    );
}

#[test]
fn udp_is_not_adopted() {
    let t = Topo::new(AddrFamily::V4, AddrFamily::V4);
    let mut fleet = fleet(AddrFamily::V4);

    let dgram = udp_pkt(t.client(), t.svc(), b"hello");
    let trace = fleet.inject(t.via_proxy(&[t.alt], &dgram));
    assert_eq!(
        trace.steps,
        vec![
            Step::Forward { at: "proxy", to: t.alt },
            Step::Deliver { at: "alt", reason: DeliverReason::DefaultAccept },
        ]
    );
}

#[test]
fn reset_releases_conn() {
    let t = Topo::new(AddrFamily::V4, AddrFamily::V4);
    let mut fleet = fleet(AddrFamily::V4);

    fleet.inject(t.via_proxy(&[t.alt], &tcp_syn(t.client(), t.svc())));
    assert_eq!(fleet.node("proxy").conns().num_flows(), 1);

    let rst = tcp_rst(t.client(), t.svc());
    let trace = fleet.inject(t.via_proxy(&[t.alt], &rst));
    assert_eq!(
        trace.steps,
        vec![Step::Deliver { at: "proxy", reason: DeliverReason::Owned }]
    );
    assert_eq!(fleet.node("proxy").conns().num_flows(), 0);

    // The next stray segment is no longer ours.
    let ack = tcp_ack(t.client(), t.svc());
    let trace = fleet.inject(t.via_proxy(&[t.alt], &ack));
    assert_eq!(trace.steps[0], Step::Forward { at: "proxy", to: t.alt });
}

#[test]
fn idle_conn_expires() {
    let t = Topo::new(AddrFamily::V4, AddrFamily::V4);
    let mut fleet = fleet(AddrFamily::V4);

    fleet.inject(t.via_proxy(&[t.alt], &tcp_syn(t.client(), t.svc())));
    let conns = fleet.node("proxy").conns();
    let now = Moment::now();
    assert_eq!(conns.expire_flows(now), 0);
    let later = now + Duration::from_secs(FLOW_DEF_EXPIRE_SECS);
    assert_eq!(conns.expire_flows(later), 1);
    assert_eq!(conns.num_flows(), 0);
}

#[test]
fn garbage_is_dropped_not_forwarded() {
    let t = Topo::new(AddrFamily::V4, AddrFamily::V4);
    let mut fleet = fleet(AddrFamily::V4);

    let ack = tcp_ack(t.client(), t.svc());
    let mut frame = t.via_proxy(&[t.alt], &ack);
    // Claim a private data type nobody understands.
    frame[33] = 0x01;
    let trace = fleet.inject(frame);
    assert_eq!(trace.steps.len(), 1);
    match trace.last() {
        Step::Drop { at: "proxy", reason: DropReason::Parse(_) } => (),
        step => panic!("expected parse drop, but got: {step:?}"),
    }
}

#[test]
fn truncated_frame_is_dropped() {
    let t = Topo::new(AddrFamily::V4, AddrFamily::V4);
    let mut fleet = fleet(AddrFamily::V4);

    let ack = tcp_ack(t.client(), t.svc());
    let mut frame = t.via_proxy(&[t.alt], &ack);
    // Cut it off inside the GUE header.
    frame.truncate(30);
    let trace = fleet.inject(frame);
    assert_eq!(trace.steps.len(), 1);
    match trace.last() {
        Step::Drop { at: "proxy", reason: DropReason::Parse(_) } => (),
        step => panic!("expected parse drop, but got: {step:?}"),
    }
    assert!(trace.egress.is_none());
}

#[test]
fn capture_scenario() {
    let t = Topo::new(AddrFamily::V4, AddrFamily::V4);
    let mut fleet = fleet(AddrFamily::V4);
    let path = "glb_redirect_walk.pcap";
    fleet.capture(path);

    let ack = tcp_ack(t.client(), t.svc());
    fleet.inject(t.via_proxy(&[t.alt, t.tester], &ack));
    drop(fleet);

    let frames = read_pcap(&std::fs::read(path).unwrap());
    assert_eq!(frames.len(), 3);
    let dsts: Vec<_> = frames
        .iter()
        .map(|f| EncapPacket::parse(f, DEF_MAX_HOPS).unwrap().outer.dst())
        .collect();
    assert_eq!(dsts, vec![t.proxy, t.alt, t.tester]);
}
