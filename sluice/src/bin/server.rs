//! The server endpoint: accepts tunnel conversations over UDP and forwards
//! each multiplexed stream to the upstream TCP (or Unix-socket) target.

use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sluice::config::{parse_multi_port, Config, Flags};
use sluice::endpoint::{qpp_pad, spawn_snmp_dump, wrap_conn};
use sluice_mux::{pipe, MuxSession, QppPad};
use sluice_net::Listener;

fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();
    let cfg = Config::resolve(flags)?;
    init_logging(cfg.quiet);

    if let Some(template) = cfg.snmplog.clone() {
        spawn_snmp_dump(template, Duration::from_secs(cfg.snmpperiod.max(1)));
    }

    let listen = parse_multi_port(&cfg.listen)?;
    let sess_cfg = cfg.session_config()?;
    let pad = qpp_pad(&cfg);

    let mut handles = Vec::new();
    for port in listen.ports() {
        let addr = listen.addr(port);
        let listener = Listener::bind(&addr, &sess_cfg)
            .map_err(|e| anyhow::anyhow!("binding {addr}: {e}"))?;
        if cfg.dscp > 0 {
            if let Err(e) = listener.set_dscp(cfg.dscp) {
                warn!(?e, "failed to set dscp");
            }
        }
        if let Err(e) = listener
            .set_read_buffer(cfg.sockbuf)
            .and_then(|_| listener.set_write_buffer(cfg.sockbuf))
        {
            warn!(?e, "failed to size socket buffers");
        }
        info!(%addr, target = %cfg.target, "server up");

        let cfg = cfg.clone();
        let pad = pad.clone();
        handles.push(thread::spawn(move || accept_loop(listener, cfg, pad)));
    }

    for h in handles {
        let _ = h.join();
    }
    Ok(())
}

fn accept_loop(listener: Listener, cfg: Config, pad: Option<Arc<QppPad>>) {
    loop {
        let sess = match listener.accept() {
            Ok(sess) => sess,
            Err(e) => {
                error!(?e, "listener terminated");
                return;
            }
        };
        info!(conv = sess.conv(), remote = %sess.remote_addr(), "conversation accepted");
        let cfg = cfg.clone();
        let pad = pad.clone();
        thread::spawn(move || {
            let conn = wrap_conn(sess, &cfg, pad.as_ref(), false);
            let mux = match MuxSession::server(conn, cfg.mux_config()) {
                Ok(mux) => mux,
                Err(e) => {
                    error!(?e, "mux setup failed");
                    return;
                }
            };
            let close_wait = Duration::from_secs(cfg.closewait);
            loop {
                let stream = match mux.accept_stream() {
                    Ok(stream) => stream,
                    Err(_) => return,
                };
                let target = cfg.target.clone();
                thread::spawn(move || forward(stream, &target, close_wait));
            }
        });
    }
}

/// Joins one tunnel stream to the upstream target.
fn forward(stream: Arc<sluice_mux::MuxStream>, target: &str, close_wait: Duration) {
    #[cfg(unix)]
    if let Some(path) = target.strip_prefix("unix://") {
        match std::os::unix::net::UnixStream::connect(path) {
            Ok(upstream) => {
                let (up, down) = pipe(&*stream, &upstream, close_wait);
                info!(?up, ?down, "unix stream finished");
            }
            Err(e) => {
                error!(?e, %path, "upstream connect failed");
                stream.close();
            }
        }
        return;
    }

    match TcpStream::connect(target).context("upstream connect") {
        Ok(upstream) => {
            let _ = upstream.set_nodelay(true);
            let (up, down) = pipe(&*stream, &upstream, close_wait);
            info!(?up, ?down, "stream finished");
        }
        Err(e) => {
            error!(?e, %target, "upstream connect failed");
            stream.close();
        }
    }
}

fn init_logging(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}
