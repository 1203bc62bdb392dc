// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The long-running redirect service.

use crate::config::Config;
use crate::net::GueReceiver;
use crate::net::RX_BUF_LEN;
use crate::net::RawSender;
use anyhow::Context;
use glb_redirect::engine::conn_table::ConnTable;
use glb_redirect::engine::redirect::Redirector;
use glb_redirect::time::Moment;
use slog::Drain;
use slog::Logger;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

/// How often idle connections are swept.
pub const EXPIRE_INTERVAL: Duration = Duration::from_secs(1);

/// Build the root logger: terminal output, filtered by `RUST_LOG` when
/// set and by `level` otherwise, written from a background thread.
pub fn logger(level: &str) -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| level.into());
    let drain =
        slog_envlogger::LogBuilder::new(drain).parse(&filter).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    Logger::root(drain, o!("component" => "glb-redirectd"))
}

pub fn run(cfg: Config, log: &Logger) -> anyhow::Result<()> {
    cfg.validate()?;
    let rcfg = cfg.redirect_cfg()?;
    let conns = ConnTable::new(cfg.conn_table_cfg()?);

    info!(log, "starting";
        "local_addr" => %rcfg.local_addr,
        "max_hops" => rcfg.max_hops,
        "workers" => cfg.workers,
        "listeners" => conns.listeners().len(),
    );

    let redirector = Arc::new(Redirector::new(rcfg, conns, log));
    let rx = GueReceiver::bind(rcfg.local_addr)
        .context("failed to open receive sockets")?;
    let tx = Arc::new(RawSender::new().context("failed to open raw sockets")?);

    let mut workers = Vec::with_capacity(cfg.workers);
    for id in 0..cfg.workers {
        let redirector = Arc::clone(&redirector);
        let tx = Arc::clone(&tx);
        let rx = rx.try_clone()?;
        let log = log.new(o!("worker" => id));

        let handle = thread::Builder::new()
            .name(format!("redirect-{id}"))
            .spawn(move || worker(&redirector, &rx, &tx, &log))?;
        workers.push(handle);
    }

    let stats_every = Duration::from_secs(cfg.stats_interval_secs);
    {
        let redirector = Arc::clone(&redirector);
        let log = log.new(o!("task" => "housekeeping"));
        thread::Builder::new()
            .name("housekeeping".into())
            .spawn(move || housekeeping(&redirector, stats_every, &log))?;
    }

    // Workers only return on a fatal socket error.
    for handle in workers {
        if handle.join().is_err() {
            error!(log, "worker panicked");
        }
    }

    anyhow::bail!("all workers exited")
}

fn worker(
    redirector: &Redirector<ConnTable>,
    rx: &GueReceiver,
    tx: &RawSender,
    log: &Logger,
) {
    let mut buf = vec![0u8; RX_BUF_LEN];

    loop {
        let frame = match rx.recv(&mut buf) {
            Ok(frame) => frame,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(log, "receive failed"; "error" => %e);
                return;
            }
        };

        redirector.handle(frame, tx, tx);
    }
}

fn housekeeping(
    redirector: &Redirector<ConnTable>,
    stats_every: Duration,
    log: &Logger,
) {
    let mut last_stats = Instant::now();

    loop {
        thread::sleep(EXPIRE_INTERVAL);

        let expired = redirector.oracle().expire_flows(Moment::now());
        if expired > 0 {
            debug!(log, "expired connections"; "count" => expired);
        }

        if !stats_every.is_zero() && last_stats.elapsed() >= stats_every {
            last_stats = Instant::now();
            let stats = redirector.stats().snapshot();
            let conns = redirector.oracle().num_flows();
            info!(log, "stats";
                "conns" => conns,
                "rx" => stats.rx,
                "delivered" => stats.delivered,
                "adopted" => stats.adopted,
                "forwarded" => stats.forwarded,
                "bounced" => stats.bounced,
                "dropped" => stats.dropped,
                "send_errors" => stats.send_errors,
                "oracle_errors" => stats.oracle_errors,
            );
        }
    }
}
