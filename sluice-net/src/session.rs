use std::cmp;
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tracing::{debug, trace, warn};

use sluice_kcp::pool;
use sluice_kcp::{Conversation, KCP_OVERHEAD};

use crate::crypt::{BlockCrypt, NonceGenerator, CRYPT_HEADER_SIZE, NONCE_SIZE};
use crate::error::NetError;
use crate::fec::{FecDecoder, FecEncoder, FEC_HEADER_SIZE_PLUS2, TYPE_DATA, TYPE_PARITY};
use crate::scheduler;
use crate::snmp;

/// Depth of a listener's accept backlog; connections arriving past this are
/// dropped until `accept` drains the queue.
const ACCEPT_BACKLOG: usize = 128;

/// How often blocked socket reads wake up to observe session death.
const SOCKET_POLL: Duration = Duration::from_millis(500);

/// Knobs fixed at session creation. The tunnel binaries fill this from the
/// user configuration; tests mostly take the defaults.
#[derive(Clone)]
pub struct SessionConfig {
    pub data_shards: usize,
    pub parity_shards: usize,
    pub block: Option<Arc<dyn BlockCrypt>>,
    pub mtu: usize,
    pub snd_wnd: u16,
    pub rcv_wnd: u16,
    pub nodelay: bool,
    pub interval: u32,
    pub resend: u32,
    pub nc: bool,
    pub ack_nodelay: bool,
    /// Defer flushing written data to the next scheduler tick instead of
    /// flushing on every write.
    pub write_delay: bool,
    /// Outbound byte-per-second cap; 0 disables pacing.
    pub rate_limit: u64,
    pub stream: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            data_shards: 0,
            parity_shards: 0,
            block: None,
            mtu: sluice_kcp::MTU_DEF,
            snd_wnd: sluice_kcp::WND_SND,
            rcv_wnd: sluice_kcp::WND_RCV,
            nodelay: false,
            interval: 100,
            resend: 0,
            nc: false,
            ack_nodelay: false,
            write_delay: false,
            rate_limit: 0,
            stream: true,
        }
    }
}

struct Spill {
    buf: Vec<u8>,
    pos: usize,
}

struct RateState {
    tokens: f64,
    last: Instant,
}

/// One reliable conversation bound to a UDP socket.
///
/// Dialed sessions own their socket and a reader thread; accepted sessions
/// share the listener's socket and are fed by its demultiplexer. Either way
/// the session posts its own periodic flush to the shared timer scheduler,
/// so no per-session thread exists for timing.
pub struct Session {
    conv: u32,
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    owns_socket: bool,

    kcp: Mutex<Conversation>,
    fec_encoder: Option<Mutex<FecEncoder>>,
    fec_decoder: Mutex<Option<FecDecoder>>,
    block: Option<Arc<dyn BlockCrypt>>,
    nonce: Mutex<NonceGenerator>,

    /// Sealed datagrams awaiting the uncork step. Drained to the socket only
    /// while no session lock is held.
    txqueue: Mutex<Vec<Vec<u8>>>,

    recv_spill: Mutex<Spill>,

    rd_deadline: Mutex<Option<Instant>>,
    wr_deadline: Mutex<Option<Instant>>,

    ch_read_tx: Sender<()>,
    ch_read_rx: Receiver<()>,
    ch_write_tx: Sender<()>,
    ch_write_rx: Receiver<()>,
    die_rx: Receiver<()>,
    die_tx: Mutex<Option<Sender<()>>>,
    dead: AtomicBool,

    sock_err: Mutex<Option<NetError>>,

    ack_nodelay: bool,
    write_delay: bool,
    rate_limit: AtomicU64,
    rate_state: Mutex<RateState>,

    /// Transmit each outbound datagram this many extra times; a testing aid
    /// for loss experiments.
    dup: AtomicU32,

    start: Instant,
    listener: Weak<ListenerInner>,
}

impl Session {
    fn new(
        conv: u32,
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
        owns_socket: bool,
        cfg: &SessionConfig,
        listener: Weak<ListenerInner>,
    ) -> Arc<Session> {
        let crypt_header = if cfg.block.is_some() {
            CRYPT_HEADER_SIZE
        } else {
            0
        };
        let fec_active = cfg.data_shards > 0 && cfg.parity_shards > 0;
        let fec_header = if fec_active { FEC_HEADER_SIZE_PLUS2 } else { 0 };
        let headroom = crypt_header + fec_header;
        let tailroom = cfg
            .block
            .as_ref()
            .map(|b| b.tail_overhead())
            .unwrap_or(0);

        let mut kcp = Conversation::new(conv, cfg.stream);
        // Errors are impossible here: config validation bounds the MTU.
        let _ = kcp.set_mtu(cfg.mtu - tailroom);
        let _ = kcp.set_reserved(headroom);
        kcp.set_wndsize(cfg.snd_wnd, cfg.rcv_wnd);
        kcp.set_nodelay(cfg.nodelay, cfg.interval, cfg.resend, cfg.nc);

        let fec_encoder = if fec_active {
            FecEncoder::new(cfg.data_shards, cfg.parity_shards, crypt_header)
                .ok()
                .map(Mutex::new)
        } else {
            None
        };
        let fec_decoder = if fec_active {
            FecDecoder::new(cfg.data_shards, cfg.parity_shards).ok()
        } else {
            None
        };

        let (ch_read_tx, ch_read_rx) = bounded(1);
        let (ch_write_tx, ch_write_rx) = bounded(1);
        let (die_tx, die_rx) = bounded::<()>(0);

        let sess = Arc::new(Session {
            conv,
            socket,
            remote,
            owns_socket,
            kcp: Mutex::new(kcp),
            fec_encoder,
            fec_decoder: Mutex::new(fec_decoder),
            block: cfg.block.clone(),
            nonce: Mutex::new(NonceGenerator::new()),
            txqueue: Mutex::new(Vec::new()),
            recv_spill: Mutex::new(Spill {
                buf: Vec::new(),
                pos: 0,
            }),
            rd_deadline: Mutex::new(None),
            wr_deadline: Mutex::new(None),
            ch_read_tx,
            ch_read_rx,
            ch_write_tx,
            ch_write_rx,
            die_rx,
            die_tx: Mutex::new(Some(die_tx)),
            dead: AtomicBool::new(false),
            sock_err: Mutex::new(None),
            ack_nodelay: cfg.ack_nodelay,
            write_delay: cfg.write_delay,
            rate_limit: AtomicU64::new(cfg.rate_limit),
            rate_state: Mutex::new(RateState {
                tokens: 0.0,
                last: Instant::now(),
            }),
            dup: AtomicU32::new(0),
            start: Instant::now(),
            listener,
        });

        sess.schedule_update(Instant::now());
        sess
    }

    /// Opens a conversation with a random id towards `remote`.
    pub fn dial(remote: &str, cfg: &SessionConfig) -> Result<Arc<Session>, NetError> {
        Self::dial_conv(rand::thread_rng().gen(), remote, cfg)
    }

    /// Opens a conversation with an explicit id; the dialer picks the id, the
    /// accepting side adopts it.
    pub fn dial_conv(conv: u32, remote: &str, cfg: &SessionConfig) -> Result<Arc<Session>, NetError> {
        let remote_addr = remote
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| NetError::Io(std::io::Error::other("unresolvable address")))?;
        let bind_addr: SocketAddr = if remote_addr.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_read_timeout(Some(SOCKET_POLL))?;

        let sess = Session::new(conv, Arc::new(socket), remote_addr, true, cfg, Weak::new());
        let reader = sess.clone();
        thread::spawn(move || reader.read_loop());

        snmp::get().active_opens.fetch_add(1, Ordering::Relaxed);
        snmp::get().curr_estab.fetch_add(1, Ordering::Relaxed);
        Ok(sess)
    }

    #[inline]
    pub fn conv(&self) -> u32 {
        self.conv
    }

    #[inline]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        Ok(self.socket.local_addr()?)
    }

    #[inline]
    fn now_ms(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.rd_deadline.lock() = deadline;
        self.notify_read();
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        *self.wr_deadline.lock() = deadline;
        self.notify_write();
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// Outbound duplication factor for loss testing.
    pub fn set_dup(&self, dup: u32) {
        self.dup.store(dup, Ordering::Relaxed);
    }

    pub fn set_rate_limit(&self, bytes_per_sec: u64) {
        self.rate_limit.store(bytes_per_sec, Ordering::Relaxed);
    }

    /// Sets the DSCP codepoint. Accepted sessions share the listener socket
    /// and must refuse per-session socket options.
    pub fn set_dscp(&self, dscp: u8) -> Result<(), NetError> {
        if !self.owns_socket {
            return Err(NetError::InvalidOperation);
        }
        socket2::SockRef::from(&*self.socket)
            .set_tos((dscp as u32) << 2)
            .map_err(|_| NetError::InvalidOperation)
    }

    pub fn set_read_buffer(&self, bytes: usize) -> Result<(), NetError> {
        if !self.owns_socket {
            return Err(NetError::InvalidOperation);
        }
        socket2::SockRef::from(&*self.socket)
            .set_recv_buffer_size(bytes)
            .map_err(|_| NetError::InvalidOperation)
    }

    pub fn set_write_buffer(&self, bytes: usize) -> Result<(), NetError> {
        if !self.owns_socket {
            return Err(NetError::InvalidOperation);
        }
        socket2::SockRef::from(&*self.socket)
            .set_send_buffer_size(bytes)
            .map_err(|_| NetError::InvalidOperation)
    }

    #[inline]
    fn notify_read(&self) {
        let _ = self.ch_read_tx.try_send(());
    }

    #[inline]
    fn notify_write(&self) {
        let _ = self.ch_write_tx.try_send(());
    }

    fn store_error(&self, err: NetError) {
        let mut slot = self.sock_err.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
        drop(slot);
        self.notify_read();
        self.notify_write();
    }

    fn pending_error(&self) -> Option<NetError> {
        self.sock_err.lock().as_ref().map(|e| e.duplicate())
    }

    // ------------------------------------------------------------------
    // Read / write
    // ------------------------------------------------------------------

    /// Blocking, deadline-aware read of ordered stream bytes.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, NetError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut spill = self.recv_spill.lock();
                if spill.pos < spill.buf.len() {
                    let n = cmp::min(buf.len(), spill.buf.len() - spill.pos);
                    buf[..n].copy_from_slice(&spill.buf[spill.pos..spill.pos + n]);
                    spill.pos += n;
                    if spill.pos >= spill.buf.len() {
                        spill.buf.clear();
                        spill.pos = 0;
                    }
                    snmp::get().bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                    return Ok(n);
                }
            }

            {
                let mut kcp = self.kcp.lock();
                if let Ok(size) = kcp.peek_size() {
                    if size <= buf.len() {
                        if let Ok(n) = kcp.recv(buf) {
                            drop(kcp);
                            snmp::get().bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                            return Ok(n);
                        }
                    } else {
                        // Caller's buffer is smaller than the message: pull
                        // the whole message aside and serve it in pieces.
                        let mut spill = self.recv_spill.lock();
                        spill.buf.resize(size, 0);
                        if let Ok(n) = kcp.recv(&mut spill.buf) {
                            spill.buf.truncate(n);
                            spill.pos = 0;
                            continue;
                        }
                        spill.buf.clear();
                    }
                }
            }

            if let Some(err) = self.pending_error() {
                return Err(err);
            }
            if self.dead.load(Ordering::Acquire) {
                return Err(NetError::ClosedPipe);
            }

            self.wait_event(&self.ch_read_rx, *self.rd_deadline.lock())?;
        }
    }

    /// Blocking, deadline-aware write. The whole buffer is accepted once the
    /// transmit window has room; fragmentation happens inside the ARQ core.
    pub fn write(&self, buf: &[u8]) -> Result<usize, NetError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(err) = self.pending_error() {
                return Err(err);
            }
            if self.dead.load(Ordering::Acquire) {
                return Err(NetError::ClosedPipe);
            }

            {
                let mut kcp = self.kcp.lock();
                let window = cmp::min(kcp.snd_wnd(), kcp.rmt_wnd()) as usize;
                if kcp.wait_snd() < window {
                    let mss = kcp.mss();
                    for chunk in buf.chunks(mss) {
                        // A chunk is at most one MSS so this cannot fail on
                        // fragment-count grounds.
                        let _ = kcp.send(chunk);
                    }
                    let pending = if !self.write_delay {
                        Some(self.flush_locked(&mut kcp, false))
                    } else {
                        None
                    };
                    drop(kcp);
                    if let Some((pkts, rto)) = pending {
                        self.post_process(pkts, rto);
                        self.uncork();
                    }
                    snmp::get().bytes_sent.fetch_add(buf.len() as u64, Ordering::Relaxed);
                    return Ok(buf.len());
                }
            }

            self.wait_event(&self.ch_write_rx, *self.wr_deadline.lock())?;
        }
    }

    fn wait_event(
        &self,
        event: &Receiver<()>,
        deadline: Option<Instant>,
    ) -> Result<(), NetError> {
        match deadline {
            Some(d) => match d.checked_duration_since(Instant::now()) {
                None => Err(NetError::Timeout),
                Some(timeout) => {
                    crossbeam_channel::select! {
                        recv(event) -> _ => Ok(()),
                        recv(self.die_rx) -> _ => Ok(()),
                        default(timeout) => Err(NetError::Timeout),
                    }
                }
            },
            None => {
                crossbeam_channel::select! {
                    recv(event) -> _ => Ok(()),
                    recv(self.die_rx) -> _ => Ok(()),
                }
            }
        }
    }

    /// Closes the session: one final flush, then every blocked caller is
    /// released with `ClosedPipe`.
    pub fn close(&self) -> Result<(), NetError> {
        if self.dead.swap(true, Ordering::AcqRel) {
            return Err(NetError::ClosedPipe);
        }
        debug!(conv = self.conv, remote = %self.remote, "session closed");

        let (pkts, rto) = {
            let mut kcp = self.kcp.lock();
            self.flush_locked(&mut kcp, false)
        };
        self.post_process(pkts, rto);
        self.uncork();

        self.die_tx.lock().take();
        snmp::get().curr_estab.fetch_sub(1, Ordering::Relaxed);

        if let Some(listener) = self.listener.upgrade() {
            listener.close_session(self.remote);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Packet pipeline
    // ------------------------------------------------------------------

    /// Flushes under the lock, collecting emitted packets for sealing after
    /// the lock is released. Returns the packets and the current RTO, which
    /// gates FEC parity generation.
    fn flush_locked(&self, kcp: &mut Conversation, ack_only: bool) -> (Vec<Vec<u8>>, u32) {
        let mut pending: Vec<Vec<u8>> = Vec::new();
        kcp.flush(ack_only, &mut |pkt| {
            let mut owned = pool::get();
            owned.extend_from_slice(pkt);
            pending.push(owned);
        });
        let stats = kcp.take_stats();
        let snmp = snmp::get();
        snmp.out_segs.fetch_add(stats.out_segs, Ordering::Relaxed);
        snmp.retrans_segs.fetch_add(stats.retrans_segs, Ordering::Relaxed);
        snmp.fast_retrans_segs
            .fetch_add(stats.fast_retrans_segs, Ordering::Relaxed);
        snmp.lost_segs.fetch_add(stats.lost_segs, Ordering::Relaxed);
        (pending, kcp.rto())
    }

    /// Applies FEC marking and the crypto frame to flushed packets, then
    /// stages them on the txqueue.
    fn post_process(&self, pkts: Vec<Vec<u8>>, rto: u32) {
        if pkts.is_empty() {
            return;
        }
        let now = self.now_ms();
        let mut out: Vec<Vec<u8>> = Vec::with_capacity(pkts.len());
        for mut pkt in pkts {
            if let Some(enc) = &self.fec_encoder {
                let parity = enc.lock().encode(&mut pkt, rto, now);
                out.push(pkt);
                out.extend(parity);
            } else {
                out.push(pkt);
            }
        }

        if let Some(block) = &self.block {
            let mut nonce = self.nonce.lock();
            for pkt in out.iter_mut() {
                nonce.fill(&mut pkt[..NONCE_SIZE]);
                let crc = crc32fast::hash(&pkt[CRYPT_HEADER_SIZE..]);
                pkt[NONCE_SIZE..CRYPT_HEADER_SIZE].copy_from_slice(&crc.to_le_bytes());
                block.encrypt(pkt);
            }
        }

        let dup = self.dup.load(Ordering::Relaxed);
        let mut q = self.txqueue.lock();
        for pkt in out {
            for _ in 0..dup {
                q.push(pkt.clone());
            }
            q.push(pkt);
        }
    }

    /// Drains staged datagrams to the socket. Never called with a session
    /// lock held; pacing postpones completion when a rate cap is set.
    fn uncork(&self) {
        let pkts = std::mem::take(&mut *self.txqueue.lock());
        for pkt in pkts {
            self.pace(pkt.len());
            match self.socket.send_to(&pkt, self.remote) {
                Ok(_) => {
                    let snmp = snmp::get();
                    snmp.out_pkts.fetch_add(1, Ordering::Relaxed);
                    snmp.out_bytes.fetch_add(pkt.len() as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    self.store_error(NetError::SocketWrite(e));
                    return;
                }
            }
            pool::put(pkt);
        }
    }

    fn pace(&self, len: usize) {
        let limit = self.rate_limit.load(Ordering::Relaxed);
        if limit == 0 {
            return;
        }
        let mut state = self.rate_state.lock();
        let now = Instant::now();
        state.tokens = (state.tokens + now.duration_since(state.last).as_secs_f64() * limit as f64)
            .min(limit as f64);
        state.last = now;
        if state.tokens < len as f64 {
            let wait = (len as f64 - state.tokens) / limit as f64;
            state.tokens = 0.0;
            drop(state);
            thread::sleep(Duration::from_secs_f64(wait));
        } else {
            state.tokens -= len as f64;
        }
    }

    /// Ingests one raw datagram from the socket: crypto unwrap, checksum,
    /// then the FEC/ARQ pipeline.
    pub(crate) fn packet_input(&self, pkt: &mut [u8]) {
        if let Some((start, len)) = open_frame(&self.block, pkt) {
            self.kcp_input(&pkt[start..start + len]);
        }
    }

    /// Ingests one decrypted payload (FEC frame or raw segment stream).
    pub(crate) fn kcp_input(&self, data: &[u8]) {
        if data.len() < KCP_OVERHEAD && data.len() < FEC_HEADER_SIZE_PLUS2 {
            snmp::get().in_errs.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut recovered: Vec<Vec<u8>> = Vec::new();
        let mut direct: Option<&[u8]> = None;

        let fec_flag = u16::from_le_bytes([data[4], data[5]]);
        if fec_flag == TYPE_DATA || fec_flag == TYPE_PARITY {
            let mut guard = self.fec_decoder.lock();
            // A FEC-framed packet on a session configured without FEC means
            // the peer enabled it; learn the parameters on the fly.
            let dec = guard.get_or_insert_with(|| {
                FecDecoder::new(1, 1).expect("1/1 codec is always valid")
            });
            recovered = dec.decode(data);
            if fec_flag == TYPE_DATA && data.len() > FEC_HEADER_SIZE_PLUS2 {
                direct = Some(&data[FEC_HEADER_SIZE_PLUS2..]);
            }
        } else {
            direct = Some(data);
        }

        let (pending, readable) = {
            let mut kcp = self.kcp.lock();
            let snmp = snmp::get();
            if let Some(direct) = direct {
                match kcp.input(direct, true) {
                    Ok((segs, repeats)) => {
                        snmp.in_segs.fetch_add(segs as u64, Ordering::Relaxed);
                        snmp.repeat_segs.fetch_add(repeats as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        trace!(?e, "kcp rejected datagram");
                        snmp.kcp_in_errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            for r in &recovered {
                match kcp.input(r, false) {
                    Ok((segs, repeats)) => {
                        snmp.in_segs.fetch_add(segs as u64, Ordering::Relaxed);
                        snmp.repeat_segs.fetch_add(repeats as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        trace!(?e, "kcp rejected recovered payload");
                        snmp.kcp_in_errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            let readable = kcp.peek_size().is_ok();
            let window_open =
                kcp.wait_snd() < cmp::min(kcp.snd_wnd(), kcp.rmt_wnd()) as usize;
            let pending = if self.ack_nodelay {
                Some(self.flush_locked(&mut kcp, true))
            } else {
                None
            };
            if window_open {
                self.notify_write();
            }
            (pending, readable)
        };

        if readable {
            self.notify_read();
        }
        if let Some((pkts, rto)) = pending {
            self.post_process(pkts, rto);
            self.uncork();
        }
    }

    /// The dialed session's socket reader.
    fn read_loop(self: Arc<Self>) {
        let mut buf = [0u8; pool::MTU_LIMIT];
        loop {
            if self.dead.load(Ordering::Acquire) {
                return;
            }
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    if from != self.remote {
                        continue;
                    }
                    let snmp = snmp::get();
                    snmp.in_pkts.fetch_add(1, Ordering::Relaxed);
                    snmp.in_bytes.fetch_add(n as u64, Ordering::Relaxed);
                    self.packet_input(&mut buf[..n]);
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    warn!(?e, "socket read failed");
                    self.store_error(NetError::SocketRead(e));
                    return;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Scheduler integration
    // ------------------------------------------------------------------

    fn schedule_update(self: &Arc<Self>, when: Instant) {
        let weak = Arc::downgrade(self);
        scheduler::SYSTEM.put(
            move || {
                if let Some(sess) = weak.upgrade() {
                    sess.periodic_update();
                }
            },
            when,
        );
    }

    /// The scheduler callback: flush, uncork, repost.
    fn periodic_update(self: &Arc<Self>) {
        if self.dead.load(Ordering::Acquire) {
            return;
        }
        let now = self.now_ms();
        let (pkts, rto, interval, window_open) = {
            let mut kcp = self.kcp.lock();
            let mut pending: Vec<Vec<u8>> = Vec::new();
            let interval = kcp.update_now(now, &mut |pkt| {
                let mut owned = pool::get();
                owned.extend_from_slice(pkt);
                pending.push(owned);
            });
            let stats = kcp.take_stats();
            let snmp = snmp::get();
            snmp.out_segs.fetch_add(stats.out_segs, Ordering::Relaxed);
            snmp.retrans_segs.fetch_add(stats.retrans_segs, Ordering::Relaxed);
            snmp.fast_retrans_segs
                .fetch_add(stats.fast_retrans_segs, Ordering::Relaxed);
            snmp.lost_segs.fetch_add(stats.lost_segs, Ordering::Relaxed);
            let window_open =
                kcp.wait_snd() < cmp::min(kcp.snd_wnd(), kcp.rmt_wnd()) as usize;
            if kcp.is_dead_link() {
                drop(kcp);
                self.store_error(NetError::SocketWrite(std::io::Error::other(
                    "peer unreachable: retransmission limit hit",
                )));
                return;
            }
            (pending, kcp.rto(), interval, window_open)
        };

        self.post_process(pkts, rto);
        self.uncork();
        if window_open {
            self.notify_write();
        }
        self.schedule_update(Instant::now() + Duration::from_millis(interval as u64));
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.dead.swap(true, Ordering::AcqRel) {
            self.die_tx.lock().take();
            snmp::get().curr_estab.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// Decrypts and checksums a raw datagram in place. Returns `(offset, len)`
/// of the inner payload, or `None` for packets that fail authentication or
/// checksum (counted, dropped).
fn open_frame(block: &Option<Arc<dyn BlockCrypt>>, pkt: &mut [u8]) -> Option<(usize, usize)> {
    match block {
        Some(block) => {
            if pkt.len() < CRYPT_HEADER_SIZE + block.tail_overhead() {
                snmp::get().in_errs.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            let valid = match block.decrypt(pkt) {
                Ok(v) => v,
                Err(_) => {
                    snmp::get().in_csum_errors.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            };
            let crc_stored = u32::from_le_bytes([
                pkt[NONCE_SIZE],
                pkt[NONCE_SIZE + 1],
                pkt[NONCE_SIZE + 2],
                pkt[NONCE_SIZE + 3],
            ]);
            if crc32fast::hash(&pkt[CRYPT_HEADER_SIZE..valid]) != crc_stored {
                snmp::get().in_csum_errors.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some((CRYPT_HEADER_SIZE, valid - CRYPT_HEADER_SIZE))
        }
        None => Some((0, pkt.len())),
    }
}

// ----------------------------------------------------------------------
// Listener
// ----------------------------------------------------------------------

pub(crate) struct ListenerInner {
    socket: Arc<UdpSocket>,
    cfg: SessionConfig,
    sessions: RwLock<HashMap<SocketAddr, Arc<Session>>>,
    accept_tx: Sender<Arc<Session>>,
    accept_rx: Receiver<Arc<Session>>,
    die_rx: Receiver<()>,
    die_tx: Mutex<Option<Sender<()>>>,
    dead: AtomicBool,
    accept_deadline: Mutex<Option<Instant>>,
}

/// Accepts conversations over one shared UDP socket, demultiplexing inbound
/// datagrams by remote address.
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl Listener {
    pub fn bind(addr: &str, cfg: &SessionConfig) -> Result<Listener, NetError> {
        let socket = UdpSocket::bind(addr)?;
        Self::from_socket(socket, cfg)
    }

    pub fn from_socket(socket: UdpSocket, cfg: &SessionConfig) -> Result<Listener, NetError> {
        socket.set_read_timeout(Some(SOCKET_POLL))?;
        let (accept_tx, accept_rx) = bounded(ACCEPT_BACKLOG);
        let (die_tx, die_rx) = bounded::<()>(0);
        let inner = Arc::new(ListenerInner {
            socket: Arc::new(socket),
            cfg: cfg.clone(),
            sessions: RwLock::new(HashMap::new()),
            accept_tx,
            accept_rx,
            die_rx,
            die_tx: Mutex::new(Some(die_tx)),
            dead: AtomicBool::new(false),
            accept_deadline: Mutex::new(None),
        });

        let monitor = inner.clone();
        thread::spawn(move || monitor.monitor());
        Ok(Listener { inner })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        Ok(self.inner.socket.local_addr()?)
    }

    pub fn set_accept_deadline(&self, deadline: Option<Instant>) {
        *self.inner.accept_deadline.lock() = deadline;
    }

    pub fn set_dscp(&self, dscp: u8) -> Result<(), NetError> {
        socket2::SockRef::from(&*self.inner.socket)
            .set_tos((dscp as u32) << 2)
            .map_err(|_| NetError::InvalidOperation)
    }

    pub fn set_read_buffer(&self, bytes: usize) -> Result<(), NetError> {
        socket2::SockRef::from(&*self.inner.socket)
            .set_recv_buffer_size(bytes)
            .map_err(|_| NetError::InvalidOperation)
    }

    pub fn set_write_buffer(&self, bytes: usize) -> Result<(), NetError> {
        socket2::SockRef::from(&*self.inner.socket)
            .set_send_buffer_size(bytes)
            .map_err(|_| NetError::InvalidOperation)
    }

    /// Blocks until a fresh conversation arrives.
    pub fn accept(&self) -> Result<Arc<Session>, NetError> {
        let deadline = *self.inner.accept_deadline.lock();
        match deadline {
            Some(d) => match d.checked_duration_since(Instant::now()) {
                None => Err(NetError::Timeout),
                Some(timeout) => {
                    crossbeam_channel::select! {
                        recv(self.inner.accept_rx) -> s => s.map_err(|_| NetError::ClosedPipe),
                        recv(self.inner.die_rx) -> _ => Err(NetError::ClosedPipe),
                        default(timeout) => Err(NetError::Timeout),
                    }
                }
            },
            None => {
                crossbeam_channel::select! {
                    recv(self.inner.accept_rx) -> s => s.map_err(|_| NetError::ClosedPipe),
                    recv(self.inner.die_rx) -> _ => Err(NetError::ClosedPipe),
                }
            }
        }
    }

    /// Stops accepting and releases sessions to observe end-of-stream on
    /// their next read; individual sessions are not torn down here.
    pub fn close(&self) {
        if self.inner.dead.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.die_tx.lock().take();
        let sessions: Vec<_> = self.inner.sessions.read().values().cloned().collect();
        for s in sessions {
            s.store_error(NetError::ClosedPipe);
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

impl ListenerInner {
    fn monitor(self: Arc<Self>) {
        let mut buf = [0u8; pool::MTU_LIMIT];
        loop {
            if self.dead.load(Ordering::Acquire) {
                return;
            }
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    let snmp = snmp::get();
                    snmp.in_pkts.fetch_add(1, Ordering::Relaxed);
                    snmp.in_bytes.fetch_add(n as u64, Ordering::Relaxed);
                    self.packet_input(&mut buf[..n], from);
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    warn!(?e, "listener socket read failed");
                    let sessions: Vec<_> = self.sessions.read().values().cloned().collect();
                    for s in sessions {
                        s.store_error(NetError::SocketRead(std::io::Error::new(
                            e.kind(),
                            e.to_string(),
                        )));
                    }
                    return;
                }
            }
        }
    }

    fn packet_input(self: &Arc<Self>, pkt: &mut [u8], from: SocketAddr) {
        let (start, len) = match open_frame(&self.cfg.block, pkt) {
            Some(span) => span,
            None => return,
        };
        let data = &pkt[start..start + len];
        if data.len() < KCP_OVERHEAD {
            snmp::get().in_errs.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // Locate the conversation id: FEC DATA frames carry the segment
        // stream behind the FEC header, parity frames hide it entirely. The
        // FEC type field cannot collide with a bare segment stream because
        // cmd/frg bytes never form 0xF1/0xF2.
        let fec_flag = u16::from_le_bytes([data[4], data[5]]);
        let (conv, sn, conv_known) = if fec_flag == TYPE_DATA || fec_flag == TYPE_PARITY {
            if fec_flag == TYPE_DATA && data.len() >= FEC_HEADER_SIZE_PLUS2 + KCP_OVERHEAD {
                let seg = &data[FEC_HEADER_SIZE_PLUS2..];
                (sluice_kcp::conv_of(seg), sluice_kcp::sn_of(seg), true)
            } else {
                (0, 1, false)
            }
        } else {
            (sluice_kcp::conv_of(data), sluice_kcp::sn_of(data), true)
        };

        let existing = self.sessions.read().get(&from).cloned();
        if let Some(sess) = existing {
            if !conv_known || conv == sess.conv() {
                let data = data.to_vec();
                sess.kcp_input(&data);
                return;
            }
            if sn == 0 {
                // A fresh conversation from the same remote replaces the
                // stale one; the old session observes ClosedPipe.
                debug!(old = sess.conv(), new = conv, %from, "conversation reset");
                let _ = sess.close();
            } else {
                return;
            }
        }

        if conv_known && sn == 0 && !self.dead.load(Ordering::Acquire) {
            if self.accept_tx.is_full() {
                debug!(%from, "accept backlog full, dropping connection attempt");
                return;
            }
            let sess = Session::new(
                conv,
                self.socket.clone(),
                from,
                false,
                &self.cfg,
                Arc::downgrade(self),
            );
            let data = data.to_vec();
            sess.kcp_input(&data);
            self.sessions.write().insert(from, sess.clone());
            let snmp = snmp::get();
            snmp.passive_opens.fetch_add(1, Ordering::Relaxed);
            snmp.curr_estab.fetch_add(1, Ordering::Relaxed);
            let estab = snmp.curr_estab.load(Ordering::Relaxed);
            snmp.max_conn.fetch_max(estab, Ordering::Relaxed);
            let _ = self.accept_tx.try_send(sess);
        }
    }

    fn close_session(&self, remote: SocketAddr) -> bool {
        self.sessions.write().remove(&remote).is_some()
    }
}
