use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};

use sluice_mux::{Conn, MuxConfig, MuxSession, QppConn, QppPad, SnappyConn};
use sluice_net::{Session, SessionConfig};

use crate::config::{parse_multi_port, Config};

/// Stacks the optional byte-stream filters over a session: obfuscation
/// closest to the wire, compression above it, the multiplexer on top.
pub fn wrap_conn(
    sess: Arc<Session>,
    cfg: &Config,
    pad: Option<&Arc<QppPad>>,
    is_client: bool,
) -> Arc<dyn Conn> {
    let seed = sess.conv() as u64;
    let mut conn: Arc<dyn Conn> = sess;
    if let Some(pad) = pad {
        conn = Arc::new(QppConn::new(conn, pad.clone(), seed, is_client));
    }
    if !cfg.nocomp {
        conn = Arc::new(SnappyConn::new(conn));
    }
    conn
}

pub fn qpp_pad(cfg: &Config) -> Option<Arc<QppPad>> {
    cfg.qpp
        .then(|| Arc::new(QppPad::new(&cfg.qpp_key(), cfg.qpp_count)))
}

fn apply_socket_options(sess: &Session, cfg: &Config) {
    if cfg.dscp > 0 {
        if let Err(e) = sess.set_dscp(cfg.dscp) {
            warn!(?e, "failed to set dscp");
        }
    }
    if let Err(e) = sess
        .set_read_buffer(cfg.sockbuf)
        .and_then(|_| sess.set_write_buffer(cfg.sockbuf))
    {
        warn!(?e, "failed to size socket buffers");
    }
}

struct PoolEntry {
    mux: Arc<MuxSession>,
    created: Instant,
}

struct Retired {
    mux: Arc<MuxSession>,
    at: Instant,
}

/// The client's set of parallel conversations. `conn` slots are filled
/// lazily and picked round-robin; a conversation older than `autoexpire`
/// is retired for new streams and scavenged once its streams drain or
/// `scavengettl` passes.
pub struct TunnelPool {
    cfg: Config,
    sess_cfg: SessionConfig,
    mux_cfg: MuxConfig,
    pad: Option<Arc<QppPad>>,
    entries: Mutex<Vec<Option<PoolEntry>>>,
    retired: Arc<Mutex<Vec<Retired>>>,
    rr: AtomicUsize,
}

impl TunnelPool {
    pub fn new(cfg: Config) -> anyhow::Result<Arc<TunnelPool>> {
        let sess_cfg = cfg.session_config()?;
        let mux_cfg = cfg.mux_config();
        let pad = qpp_pad(&cfg);
        let slots = cfg.conn;
        let pool = Arc::new(TunnelPool {
            cfg,
            sess_cfg,
            mux_cfg,
            pad,
            entries: Mutex::new((0..slots).map(|_| None).collect()),
            retired: Arc::new(Mutex::new(Vec::new())),
            rr: AtomicUsize::new(0),
        });

        let retired = pool.retired.clone();
        let ttl = Duration::from_secs(pool.cfg.scavengettl.max(1));
        thread::spawn(move || loop {
            thread::sleep(Duration::from_secs(5));
            let mut retired = retired.lock();
            retired.retain(|r| {
                if r.mux.num_streams() == 0 || r.at.elapsed() >= ttl {
                    debug!("scavenging retired conversation");
                    r.mux.close();
                    false
                } else {
                    true
                }
            });
        });

        Ok(pool)
    }

    fn dial_once(&self) -> anyhow::Result<Arc<MuxSession>> {
        let range = parse_multi_port(&self.cfg.remoteaddr)?;
        let addr = range.choose(&mut rand::thread_rng());
        info!(%addr, "dialing");
        let sess = Session::dial(&addr, &self.sess_cfg)
            .with_context(|| format!("dialing {addr}"))?;
        apply_socket_options(&sess, &self.cfg);
        let conn = wrap_conn(sess, &self.cfg, self.pad.as_ref(), true);
        MuxSession::client(conn, self.mux_cfg.clone()).map_err(|e| anyhow::anyhow!("{e}"))
    }

    /// Picks a live conversation, rotating expired ones out.
    pub fn pick(&self) -> anyhow::Result<Arc<MuxSession>> {
        let idx = self.rr.fetch_add(1, Ordering::Relaxed) % self.cfg.conn.max(1);
        let mut entries = self.entries.lock();
        let slot = &mut entries[idx];

        let expired = |e: &PoolEntry| {
            self.cfg.autoexpire > 0
                && e.created.elapsed() >= Duration::from_secs(self.cfg.autoexpire)
        };

        if let Some(entry) = slot {
            if entry.mux.is_closed() {
                *slot = None;
            } else if expired(entry) {
                debug!(slot = idx, "conversation expired, rotating");
                let old = slot.take().unwrap();
                self.retired.lock().push(Retired {
                    mux: old.mux,
                    at: Instant::now(),
                });
            }
        }

        if slot.is_none() {
            *slot = Some(PoolEntry {
                mux: self.dial_once()?,
                created: Instant::now(),
            });
        }
        Ok(slot.as_ref().unwrap().mux.clone())
    }
}

/// Periodic SNMP counter dump: the path is a chrono time-format template
/// expanded at every flush, one CSV header plus one row per file write.
pub fn spawn_snmp_dump(template: String, period: Duration) {
    thread::spawn(move || loop {
        thread::sleep(period);
        let path = chrono::Local::now().format(&template).to_string();
        let snmp = sluice_net::snmp::get();
        let body = format!("{}\n{}\n", sluice_net::Snmp::header(), snmp.row());
        if let Err(e) = std::fs::write(&path, body) {
            warn!(?e, %path, "snmp dump failed");
        }
    });
}

