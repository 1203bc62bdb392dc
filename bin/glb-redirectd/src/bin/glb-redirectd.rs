// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use clap::Parser;

use glb_api::Listener;
use glb_redirect::engine::conn_table::ConnTableCfg;
use glb_redirect::engine::redirect::RedirectCfg;
use glb_redirectd::config::Config;
use glb_redirectd::daemon;
use glb_redirectd::decode;

/// Redirect GUE-encapsulated traffic along its hop chain to the proxy
/// that owns each connection.
#[derive(Debug, Parser)]
#[command(version)]
enum Command {
    /// Run the redirector.
    Run {
        #[command(flatten)]
        opts: RunOpts,
    },

    /// Print the GUE frames in a packet capture.
    Decode {
        file: PathBuf,

        #[arg(long, default_value_t = glb_api::DEF_MAX_HOPS)]
        max_hops: u8,
    },

    /// Replay a packet capture through a redirector acting as the given
    /// node, and print what it decided.
    Replay {
        file: PathBuf,

        #[arg(long)]
        local_addr: IpAddr,

        /// Ports new connections may be adopted for.
        #[arg(long = "listen")]
        listen: Vec<u16>,
    },

    /// Validate a config file and print it with defaults filled in.
    CheckConfig { file: PathBuf },
}

#[derive(Args, Debug)]
struct RunOpts {
    /// Path to a TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the node's own address.
    #[arg(long)]
    local_addr: Option<IpAddr>,

    /// Override the number of worker threads.
    #[arg(long)]
    workers: Option<usize>,
}

impl RunOpts {
    fn into_config(self) -> anyhow::Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some(addr) = self.local_addr {
            cfg.local_addr = Some(addr);
        }

        if let Some(workers) = self.workers {
            cfg.workers = workers;
        }

        Ok(cfg)
    }
}

fn read_capture(file: &PathBuf) -> anyhow::Result<Vec<Vec<u8>>> {
    let bytes = std::fs::read(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    Ok(decode::read_frames(&bytes)?)
}

fn main() -> anyhow::Result<()> {
    let cmd = Command::parse();
    match cmd {
        Command::Run { opts } => {
            let cfg = opts.into_config()?;
            cfg.validate()?;
            let log = daemon::logger(&cfg.log_level);
            daemon::run(cfg, &log)?;
        }

        Command::Decode { file, max_hops } => {
            let frames = read_capture(&file)?;
            decode::decode(&mut std::io::stdout(), &frames, max_hops)?;
        }

        Command::Replay { file, local_addr, listen } => {
            let frames = read_capture(&file)?;
            let log = daemon::logger("warn");
            let ct_cfg = ConnTableCfg {
                listeners: listen.into_iter().map(Listener::any).collect(),
                ..Default::default()
            };
            decode::replay(
                &mut std::io::stdout(),
                &frames,
                RedirectCfg::new(local_addr.into()),
                ct_cfg,
                &log,
            )?;
        }

        Command::CheckConfig { file } => {
            let cfg = Config::load(&file)?;
            cfg.validate()?;
            println!("{}", serde_json::to_string_pretty(&cfg)?);
        }
    }

    Ok(())
}
