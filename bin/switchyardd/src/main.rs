// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use std::io::Write;
use std::net::TcpListener;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use slog::Drain;
use slog::Logger;
use slog::error;
use slog::info;
use slog::warn;
use tabwriter::TabWriter;

use switchyard::engine::SwitchManager;
use switchyard::engine::conn::TcpConn;
use switchyard::persist::JsonFilePersister;
use switchyard::persist::MemoryPersister;
use switchyard::persist::Persister;
use switchyard::print::print_networks_into;
use switchyard::print::print_route_config_into;
use switchyard::print::write_hr;
use switchyard::registry::MechanismRegistry;

mod config;

use config::Config;

/// OpenFlow 1.3 controller for Ethernet/IPv4 switches
#[derive(Debug, Parser)]
#[command(version)]
enum Command {
    /// Listen for switches and manage them.
    Run {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Parse a configuration file and print what it would seed.
    CheckConfig {
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    match Command::parse() {
        Command::Run { config } => {
            let cfg = Config::from_file(&config)?;
            run(cfg)
        }

        Command::CheckConfig { config } => {
            let cfg = Config::from_file(&config)?;
            check_config(&cfg, &mut std::io::stdout())
        }
    }
}

/// Build the root logger. `RUST_LOG` wins over the configured level.
fn init_logger(level: &str) -> Logger {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| level.into());
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::LogBuilder::new(drain)
        .parse(&filter)
        .build()
        .fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, slog::o!("component" => "switchyardd"))
}

fn open_persister(
    cfg: &Config,
    log: &Logger,
) -> anyhow::Result<Arc<dyn Persister>> {
    match &cfg.state_dir {
        Some(dir) => {
            info!(log, "persisting state"; "dir" => %dir.display());
            let p = JsonFilePersister::new(dir).with_context(|| {
                format!("opening state directory {}", dir.display())
            })?;
            Ok(Arc::new(p))
        }

        None => {
            warn!(log, "no state_dir configured, state is not persisted");
            Ok(Arc::new(MemoryPersister::new()))
        }
    }
}

fn run(cfg: Config) -> anyhow::Result<()> {
    let log = init_logger(&cfg.log_level);
    info!(log, "starting"; "config" => ?cfg);

    let persist = open_persister(&cfg, &log)?;
    cfg.seed(&*persist)?;

    let mgr = Arc::new(
        SwitchManager::new(MechanismRegistry::with_defaults(), persist, &log)
            .with_arp_timeout(cfg.arp_timeout()),
    );

    let listener = TcpListener::bind(cfg.listen_addr)
        .with_context(|| format!("binding {}", cfg.listen_addr))?;
    info!(log, "listening for switches"; "addr" => %cfg.listen_addr);

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => accept(&mgr, stream, &log),
            Err(e) => warn!(log, "accept failed"; "err" => %e),
        }
    }

    Ok(())
}

/// Boot the switch on `stream` in its own thread; booting blocks until
/// the handshake completes.
fn accept(mgr: &Arc<SwitchManager>, stream: TcpStream, log: &Logger) {
    let mgr = mgr.clone();
    let thread_log = log.clone();
    let spawned = std::thread::Builder::new()
        .name("switch-boot".into())
        .spawn(move || {
            let log = thread_log;
            let conn = match TcpConn::new(stream) {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(log, "failed to set up connection"; "err" => %e);
                    return;
                }
            };

            let peer = conn.peer();
            match mgr.create_switch(Arc::new(conn)) {
                Ok(sc) => {
                    info!(log, "switch connected";
                        "peer" => %peer, "dpid" => %sc.dpid());
                }
                Err(e) => {
                    error!(log, "switch failed to boot";
                        "peer" => %peer, "err" => %e);
                }
            }
        });

    if let Err(e) = spawned {
        error!(log, "failed to spawn boot thread"; "err" => %e);
    }
}

fn check_config(cfg: &Config, out: &mut impl Write) -> anyhow::Result<()> {
    {
        let mut t = TabWriter::new(&mut *out);
        writeln!(t, "LISTEN\tSTATE DIR\tLOG LEVEL\tARP TIMEOUT")?;
        write_hr(&mut t)?;
        writeln!(
            t,
            "{}\t{}\t{}\t{}ms",
            cfg.listen_addr,
            cfg.state_dir
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_else(|| "-".into()),
            cfg.log_level,
            cfg.arp_timeout_ms,
        )?;
        t.flush()?;
    }

    for sw in &cfg.switches {
        writeln!(out)?;
        print_networks_into(out, &sw.network_context())?;
        writeln!(out)?;
        print_route_config_into(out, &sw.routing_context())?;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn check_config_lists_seeded_state() {
        let cfg = Config::parse(
            r#"
[[switch]]
dpid = "00:00:00:00:00:00:00:07"
networks = [{ port = 3, address = "192.168.3.1/24" }]
routes = [{ network = "172.16.0.0/12", next_hop = "192.168.3.9", port = 3 }]
"#,
        )
        .unwrap();

        let mut out = vec![];
        check_config(&cfg, &mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("0.0.0.0:6653"));
        assert!(out.contains("00:00:00:00:00:00:00:07"));
        assert!(out.contains("192.168.3.1/24"));
        assert!(out.contains("172.16.0.0/12"));
        assert!(out.contains("192.168.3.9"));
    }
}
