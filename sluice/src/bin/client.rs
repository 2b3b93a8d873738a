//! The client endpoint: accepts local TCP connections and forwards each one
//! as a multiplexed stream over the encrypted UDP tunnel.

use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sluice::config::{parse_multi_port, Config, Flags};
use sluice::endpoint::{spawn_snmp_dump, TunnelPool};
use sluice_mux::pipe;

fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();
    let cfg = Config::resolve(flags)?;
    init_logging(cfg.quiet);

    let listen = parse_multi_port(&cfg.listen)?;
    if listen.min != listen.max {
        anyhow::bail!("client listen address must name a single port");
    }
    let listener = TcpListener::bind(listen.addr(listen.min))
        .with_context(|| format!("binding {}", cfg.listen))?;
    info!(listen = %cfg.listen, remote = %cfg.remoteaddr, "client up");

    if let Some(template) = cfg.snmplog.clone() {
        spawn_snmp_dump(template, Duration::from_secs(cfg.snmpperiod.max(1)));
    }

    let close_wait = Duration::from_secs(cfg.closewait);
    let pool = TunnelPool::new(cfg)?;

    for inbound in listener.incoming() {
        let tcp = match inbound {
            Ok(tcp) => tcp,
            Err(e) => {
                // Accept failures are transient (fd pressure, resets); the
                // service keeps running.
                warn!(?e, "accept failed");
                continue;
            }
        };
        let _ = tcp.set_nodelay(true);
        let pool = pool.clone();
        thread::spawn(move || {
            let stream = match pool.pick().and_then(|mux| {
                mux.open_stream().map_err(|e| anyhow::anyhow!("{e}"))
            }) {
                Ok(stream) => stream,
                Err(e) => {
                    error!(?e, "cannot open tunnel stream");
                    return;
                }
            };
            let (up, down) = pipe(&tcp, &*stream, close_wait);
            info!(?up, ?down, "stream finished");
        });
    }
    Ok(())
}

fn init_logging(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}
