// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Offline tools: decode the encapsulated frames in a capture, or replay
//! a capture through a redirector and report what it decided.

use glb_api::IpAddr;
use glb_redirect::engine::LocalDelivery;
use glb_redirect::engine::Transport;
use glb_redirect::engine::conn_table::ConnTable;
use glb_redirect::engine::conn_table::ConnTableCfg;
use glb_redirect::engine::encap::EncapPacket;
use glb_redirect::engine::redirect::Decision;
use glb_redirect::engine::redirect::RedirectCfg;
use glb_redirect::engine::redirect::Redirector;
use glb_redirect::print::print_conn_table_into;
use glb_redirect::print::print_frame_header;
use glb_redirect::print::print_frame_into;
use glb_redirect::print::print_stats_into;
use glb_redirect::print::write_hr;
use glb_redirect::print::write_hrb;
use pcap_parser::Linktype;
use pcap_parser::pcap;
use slog::Logger;
use std::io;
use std::io::Write;
use tabwriter::TabWriter;
use thiserror::Error;

const ETHER_HDR_LEN: usize = 14;
const ETHER_TYPE_IPV4: u16 = 0x0800;
const ETHER_TYPE_IPV6: u16 = 0x86DD;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("bad capture header: {0}")]
    Header(String),

    #[error("bad record {num}: {msg}")]
    Record { num: usize, msg: String },

    #[error("unsupported link type {0}")]
    Linktype(i32),
}

/// Pull the IP frames out of a pcap file.
///
/// Raw IP captures are taken as is. Ethernet captures have their link
/// header stripped, and non-IP frames are skipped.
pub fn read_frames(bytes: &[u8]) -> Result<Vec<Vec<u8>>, CaptureError> {
    let (mut rest, hdr) = pcap::parse_pcap_header(bytes)
        .map_err(|e| CaptureError::Header(format!("{e:?}")))?;

    let strip_ether = if hdr.network == Linktype::ETHERNET {
        true
    } else if hdr.network == Linktype::RAW
        || hdr.network == Linktype::IPV4
        || hdr.network == Linktype::IPV6
    {
        false
    } else {
        return Err(CaptureError::Linktype(hdr.network.0));
    };

    let mut frames = vec![];
    let mut num = 0;
    while !rest.is_empty() {
        num += 1;
        let res = if hdr.is_bigendian() {
            pcap::parse_pcap_frame_be(rest)
        } else {
            pcap::parse_pcap_frame(rest)
        };
        let (next, block) = res.map_err(|e| CaptureError::Record {
            num,
            msg: format!("{e:?}"),
        })?;
        rest = next;

        if !strip_ether {
            frames.push(block.data.to_vec());
            continue;
        }

        let Some(et) = block.data.get(12..ETHER_HDR_LEN) else {
            continue;
        };
        let et = u16::from_be_bytes([et[0], et[1]]);
        if et == ETHER_TYPE_IPV4 || et == ETHER_TYPE_IPV6 {
            frames.push(block.data[ETHER_HDR_LEN..].to_vec());
        }
    }

    Ok(frames)
}

/// Print one row per frame: outer addresses, remaining chain, and the
/// inner flow.
pub fn decode(
    out: &mut impl Write,
    frames: &[Vec<u8>],
    max_hops: u8,
) -> io::Result<()> {
    let mut t = TabWriter::new(out);
    print_frame_header(&mut t)?;

    for (i, frame) in frames.iter().enumerate() {
        let parsed = EncapPacket::parse(frame, max_hops);
        print_frame_into(&mut t, i + 1, parsed.as_ref())?;
    }

    t.flush()
}

/// Swallows everything a replay sends.
struct Discard;

impl Transport for Discard {
    fn send(&self, _dst: IpAddr, _frame: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

impl LocalDelivery for Discard {
    fn deliver(&self, _inner: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

/// Run every frame through a fresh redirector acting as `rcfg.local_addr`
/// and print each decision, then the counters and the connections it
/// ended up owning.
pub fn replay(
    out: &mut impl Write,
    frames: &[Vec<u8>],
    rcfg: RedirectCfg,
    ct_cfg: ConnTableCfg,
    log: &Logger,
) -> io::Result<()> {
    let r = Redirector::new(rcfg, ConnTable::new(ct_cfg), log);

    {
        let mut t = TabWriter::new(&mut *out);
        writeln!(t, "NUM\tDECISION\tDETAIL")?;
        write_hr(&mut t)?;

        for (i, frame) in frames.iter().enumerate() {
            let num = i + 1;
            match r.handle(frame, &Discard, &Discard) {
                Decision::DeliverLocal { reason, .. } => {
                    writeln!(t, "{num}\tDELIVER\t{reason}")?
                }
                Decision::Forward { next_hop, .. } => {
                    writeln!(t, "{num}\tFORWARD\t{next_hop}")?
                }
                Decision::Bounce { to, .. } => {
                    writeln!(t, "{num}\tBOUNCE\t{to}")?
                }
                Decision::Drop { reason } => {
                    writeln!(t, "{num}\tDROP\t{reason}")?
                }
            }
        }
        t.flush()?;
    }

    writeln!(out)?;
    write_hrb(out)?;
    print_stats_into(out, &r.stats().snapshot())?;
    writeln!(out)?;
    print_conn_table_into(out, &r.oracle().dump())
}

#[cfg(test)]
mod test {
    use super::*;
    use glb_test_utils::*;

    fn frames() -> Vec<Vec<u8>> {
        let client = (ip(CLIENT_IP4), 40000);
        let svc = (ip(VIP4), SVC_PORT);
        let other = (ip(CLIENT_IP4), 1);
        let (src, me, alt) = (ip(SELF_IP4), ip(PROXY_IP4), ip(ALT_IP4));

        vec![
            encap(src, me, &[alt], &tcp_syn(client, svc)),
            encap(src, me, &[alt], &tcp_ack(client, svc)),
            encap(src, me, &[alt], &tcp_ack(other, svc)),
            vec![0x45, 0, 0, 20],
        ]
    }

    #[test]
    fn capture_round_trip() {
        let dir = std::env::temp_dir();
        let name = format!("glb-decode-{}.pcap", std::process::id());
        let path = dir.join(name);
        let path_str = path.to_str().unwrap();

        let frames = frames();
        let mut cap = PcapBuilder::new(path_str);
        for f in &frames {
            cap.add_pkt(f);
        }
        drop(cap);

        let bytes = std::fs::read(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(read_frames(&bytes).unwrap(), frames);
    }

    #[test]
    fn decode_marks_bad_frames() {
        let mut out = vec![];
        decode(&mut out, &frames(), DEF_MAX_HOPS).unwrap();
        let out = String::from_utf8(out).unwrap();
        let lines: Vec<_> = out.lines().collect();

        assert_eq!(lines.len(), 5);
        assert!(lines[0].starts_with("NUM"));
        assert!(lines[1].contains("192.168.50.5 -> 192.168.50.10"));
        assert!(lines[4].contains('<'));
    }

    #[test]
    fn replay_reports_decisions() {
        let ct_cfg = ConnTableCfg {
            listeners: vec![Listener::any(SVC_PORT)],
            ..Default::default()
        };
        let mut out = vec![];
        replay(
            &mut out,
            &frames(),
            RedirectCfg::new(ip(PROXY_IP4)),
            ct_cfg,
            &test_logger(),
        )
        .unwrap();
        let out = String::from_utf8(out).unwrap();
        let lines: Vec<_> = out.lines().collect();

        assert!(lines[2].contains("DELIVER"));
        assert!(lines[3].contains("DELIVER"));
        assert!(lines[4].contains("FORWARD"));
        assert!(lines[4].contains("192.168.50.11"));
        assert!(lines[5].contains("DROP"));
        assert!(out.contains("Connections: 1"));
    }
}
