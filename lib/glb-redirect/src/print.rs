// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Print engine state in a human-friendly manner.
//!
//! This is mostly just a place to hang printing routines so that they
//! can be used by both glb-redirectd and integration tests.

use crate::engine::conn_table::ConnDump;
use crate::engine::encap::EncapPacket;
use crate::engine::flow::InnerPacket;
use crate::engine::flow_table::FlowTableDump;
use crate::engine::packet::ParseError;
use crate::engine::stat::RedirectStatsSnapshot;
use std::io::Write;
use tabwriter::TabWriter;

/// Print the owned connections.
pub fn print_conn_table(
    flows: &FlowTableDump<ConnDump>,
) -> std::io::Result<()> {
    print_conn_table_into(&mut std::io::stdout(), flows)
}

/// Print the owned connections into a given writer.
pub fn print_conn_table_into(
    writer: &mut impl Write,
    flows: &FlowTableDump<ConnDump>,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "Connections: {}", flows.len())?;
    write_hr(&mut t)?;
    writeln!(t, "PROTO\tSRC IP\tSPORT\tDST IP\tDPORT\tHITS\tAGE (ms)")?;
    for (flow, dump) in flows {
        writeln!(
            t,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            flow.proto,
            flow.src_ip(),
            flow.src_port,
            flow.dst_ip(),
            flow.dst_port,
            dump.hits,
            dump.age_ms,
        )?;
    }
    t.flush()
}

/// Print a [`RedirectStatsSnapshot`].
pub fn print_stats(stats: &RedirectStatsSnapshot) -> std::io::Result<()> {
    print_stats_into(&mut std::io::stdout(), stats)
}

/// Print a [`RedirectStatsSnapshot`] into a given writer.
pub fn print_stats_into(
    writer: &mut impl Write,
    stats: &RedirectStatsSnapshot,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "COUNTER\tVALUE")?;
    for (name, val) in stats.fields() {
        writeln!(t, "{name}\t{val}")?;
    }
    t.flush()
}

/// Print the header for [`print_frame_into`].
pub fn print_frame_header(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "NUM\tOUTER\tCHAIN\tINNER")
}

/// Print one decoded frame, or why it could not be decoded.
pub fn print_frame_into(
    t: &mut impl Write,
    num: usize,
    frame: Result<&EncapPacket<'_>, &ParseError>,
) -> std::io::Result<()> {
    let pkt = match frame {
        Ok(pkt) => pkt,
        Err(e) => return writeln!(t, "{num}\t<{e}>\t\t"),
    };

    let outer = format!("{} -> {}", pkt.outer.src(), pkt.outer.dst());
    match InnerPacket::parse(pkt.inner) {
        Ok(inner) => {
            writeln!(t, "{num}\t{outer}\t{}\t{inner}", pkt.chain)
        }
        Err(e) => writeln!(t, "{num}\t{outer}\t{}\t<{e}>", pkt.chain),
    }
}

/// Output a horizontal rule in bold to the given writer.
pub fn write_hrb(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:=<70}", "=")
}

/// Output a horizontal rule to the given writer.
pub fn write_hr(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:-<70}", "-")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stats_are_aligned() {
        let stats = RedirectStatsSnapshot {
            rx: 12,
            forwarded: 3,
            ..Default::default()
        };
        let mut out = vec![];
        print_stats_into(&mut out, &stats).unwrap();
        let out = String::from_utf8(out).unwrap();

        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 11);
        // Padded to the longest name, delivered_icmp_info, plus two.
        assert_eq!(lines[1], format!("{:<21}12", "rx"));
        assert_eq!(lines[6], format!("{:<21}3", "forwarded"));
    }
}
