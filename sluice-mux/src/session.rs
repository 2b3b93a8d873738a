use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, tick, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::conn::Conn;
use crate::error::MuxError;
use crate::frame::{Header, CMD_FIN, CMD_NOP, CMD_PSH, CMD_SYN, CMD_UPD, HEADER_SIZE};
use crate::stream::MuxStream;

/// Streams that arrived before anyone called `accept_stream`.
const ACCEPT_BACKLOG: usize = 1024;

#[derive(Clone, Debug)]
pub struct MuxConfig {
    /// Protocol version, 1 or 2. Version 2 adds per-stream flow control.
    pub version: u8,
    /// Idle NOP cadence.
    pub keep_alive_interval: Duration,
    /// A peer silent for this long tears the session down.
    pub keep_alive_timeout: Duration,
    /// Largest PSH payload; longer writes are split.
    pub max_frame_size: usize,
    /// Aggregate receive budget across all streams.
    pub max_receive_buffer: usize,
    /// Per-stream receive budget (version 2).
    pub max_stream_buffer: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        let keep_alive_interval = Duration::from_secs(10);
        MuxConfig {
            version: 1,
            keep_alive_interval,
            keep_alive_timeout: keep_alive_interval * 2,
            max_frame_size: 32768,
            max_receive_buffer: 4 * 1024 * 1024,
            max_stream_buffer: 65536,
        }
    }
}

impl MuxConfig {
    pub fn validate(&self) -> Result<(), MuxError> {
        if !(1..=2).contains(&self.version) {
            return Err(MuxError::InvalidVersion(self.version));
        }
        if self.max_frame_size == 0
            || self.max_frame_size > u16::MAX as usize
            || self.max_receive_buffer == 0
            || self.max_stream_buffer == 0
            || self.keep_alive_timeout <= self.keep_alive_interval
        {
            return Err(MuxError::InvalidProtocol);
        }
        Ok(())
    }
}

/// Multiplexes logical streams over one [`Conn`].
///
/// The server role accepts streams, the client role opens them; stream ids
/// are allocated monotonically by the opener with parity fixed by role so
/// the two sides can never collide.
pub struct MuxSession {
    conn: Arc<dyn Conn>,
    config: MuxConfig,

    next_sid: Mutex<u32>,
    streams: Mutex<HashMap<u32, Arc<MuxStream>>>,

    accept_tx: Sender<Arc<MuxStream>>,
    accept_rx: Receiver<Arc<MuxStream>>,
    accept_deadline: Mutex<Option<Instant>>,

    /// Remaining aggregate receive budget; the receive loop stalls while
    /// this is exhausted.
    bucket: AtomicIsize,
    bucket_tx: Sender<()>,
    bucket_rx: Receiver<()>,

    send_mu: Mutex<()>,

    data_seen: AtomicBool,
    dead: AtomicBool,
    die_rx: Receiver<()>,
    die_tx: Mutex<Option<Sender<()>>>,
}

impl MuxSession {
    /// Client role: opens streams with odd ids.
    pub fn client(conn: Arc<dyn Conn>, config: MuxConfig) -> Result<Arc<MuxSession>, MuxError> {
        Self::new(conn, config, true)
    }

    /// Server role: accepts streams, opens with even ids.
    pub fn server(conn: Arc<dyn Conn>, config: MuxConfig) -> Result<Arc<MuxSession>, MuxError> {
        Self::new(conn, config, false)
    }

    fn new(conn: Arc<dyn Conn>, config: MuxConfig, client: bool) -> Result<Arc<MuxSession>, MuxError> {
        config.validate()?;
        let (accept_tx, accept_rx) = bounded(ACCEPT_BACKLOG);
        let (bucket_tx, bucket_rx) = bounded(1);
        let (die_tx, die_rx) = bounded::<()>(0);

        let sess = Arc::new(MuxSession {
            conn,
            bucket: AtomicIsize::new(config.max_receive_buffer as isize),
            config,
            next_sid: Mutex::new(if client { 1 } else { 2 }),
            streams: Mutex::new(HashMap::new()),
            accept_tx,
            accept_rx,
            accept_deadline: Mutex::new(None),
            bucket_tx,
            bucket_rx,
            send_mu: Mutex::new(()),
            data_seen: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            die_rx,
            die_tx: Mutex::new(Some(die_tx)),
        });

        let recv = sess.clone();
        thread::spawn(move || recv.recv_loop());
        let keepalive = sess.clone();
        thread::spawn(move || keepalive.keepalive_loop());
        Ok(sess)
    }

    pub fn is_closed(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub fn num_streams(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn set_accept_deadline(&self, deadline: Option<Instant>) {
        *self.accept_deadline.lock() = deadline;
    }

    /// Opens a new stream towards the peer.
    pub fn open_stream(self: &Arc<Self>) -> Result<Arc<MuxStream>, MuxError> {
        if self.dead.load(Ordering::Acquire) {
            return Err(MuxError::ClosedPipe);
        }
        let sid = {
            let mut next = self.next_sid.lock();
            let sid = *next;
            *next = next.wrapping_add(2);
            sid
        };
        self.write_frame(CMD_SYN, sid, &[])?;
        let stream = MuxStream::new(
            sid,
            Arc::downgrade(self),
            self.config.version,
            self.config.max_frame_size,
            self.config.max_stream_buffer,
        );
        self.streams.lock().insert(sid, stream.clone());
        trace!(sid, "stream opened");
        Ok(stream)
    }

    /// Waits for the peer to open a stream.
    pub fn accept_stream(&self) -> Result<Arc<MuxStream>, MuxError> {
        let deadline = *self.accept_deadline.lock();
        match deadline {
            Some(d) => match d.checked_duration_since(Instant::now()) {
                None => Err(MuxError::Timeout),
                Some(timeout) => {
                    crossbeam_channel::select! {
                        recv(self.accept_rx) -> s => s.map_err(|_| MuxError::ClosedPipe),
                        recv(self.die_rx) -> _ => Err(MuxError::ClosedPipe),
                        default(timeout) => Err(MuxError::Timeout),
                    }
                }
            },
            None => {
                crossbeam_channel::select! {
                    recv(self.accept_rx) -> s => s.map_err(|_| MuxError::ClosedPipe),
                    recv(self.die_rx) -> _ => Err(MuxError::ClosedPipe),
                }
            }
        }
    }

    /// Tears down the session and every stream in it.
    pub fn close(&self) {
        if self.dead.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("mux session closed");
        self.die_tx.lock().take();
        for (_, stream) in self.streams.lock().drain() {
            stream.session_closed();
        }
        self.conn.close();
    }

    // ------------------------------------------------------------------
    // Internals shared with streams
    // ------------------------------------------------------------------

    pub(crate) fn write_frame(&self, cmd: u8, sid: u32, payload: &[u8]) -> io::Result<()> {
        if self.dead.load(Ordering::Acquire) {
            return Err(MuxError::ClosedPipe.into());
        }
        debug_assert!(payload.len() <= u16::MAX as usize);
        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        Header {
            version: self.config.version,
            cmd,
            length: payload.len() as u16,
            sid,
        }
        .encode(&mut frame);
        frame.extend_from_slice(payload);

        let _sender = self.send_mu.lock();
        self.conn.write_all(&frame)
    }

    pub(crate) fn remove_stream(&self, sid: u32, unread: usize) {
        if self.streams.lock().remove(&sid).is_some() {
            self.return_tokens(unread);
        }
    }

    pub(crate) fn return_tokens(&self, n: usize) {
        if self.bucket.fetch_add(n as isize, Ordering::AcqRel) <= 0 {
            let _ = self.bucket_tx.try_send(());
        }
    }

    fn recv_loop(self: Arc<Self>) {
        let mut hdr = [0u8; HEADER_SIZE];
        loop {
            if self.dead.load(Ordering::Acquire) {
                return;
            }
            // Aggregate receive budget: stop pulling frames off the session
            // until readers hand tokens back.
            while self.bucket.load(Ordering::Acquire) <= 0 && !self.dead.load(Ordering::Acquire) {
                crossbeam_channel::select! {
                    recv(self.bucket_rx) -> _ => {}
                    recv(self.die_rx) -> _ => {}
                }
            }

            if read_full(&*self.conn, &mut hdr).is_err() {
                self.close();
                return;
            }
            let header = Header::decode(&hdr);
            if header.version != self.config.version {
                warn!(got = header.version, "peer speaks a different mux version");
                self.close();
                return;
            }
            self.data_seen.store(true, Ordering::Release);

            match header.cmd {
                CMD_NOP => {}
                CMD_SYN => {
                    let mut streams = self.streams.lock();
                    if !streams.contains_key(&header.sid) {
                        let stream = MuxStream::new(
                            header.sid,
                            Arc::downgrade(&self),
                            self.config.version,
                            self.config.max_frame_size,
                            self.config.max_stream_buffer,
                        );
                        streams.insert(header.sid, stream.clone());
                        drop(streams);
                        if self.accept_tx.try_send(stream).is_err() {
                            debug!(sid = header.sid, "accept backlog full, stream dropped");
                        }
                    }
                }
                CMD_FIN => {
                    let stream = self.streams.lock().get(&header.sid).cloned();
                    if let Some(stream) = stream {
                        stream.handle_fin();
                    }
                }
                CMD_PSH => {
                    let mut data = vec![0u8; header.length as usize];
                    if read_full(&*self.conn, &mut data).is_err() {
                        self.close();
                        return;
                    }
                    let stream = self.streams.lock().get(&header.sid).cloned();
                    match stream {
                        Some(stream) => {
                            self.bucket
                                .fetch_sub(data.len() as isize, Ordering::AcqRel);
                            stream.push_bytes(data);
                        }
                        None => {
                            trace!(sid = header.sid, "data for unknown stream dropped");
                        }
                    }
                }
                CMD_UPD if self.config.version >= 2 => {
                    let mut data = [0u8; 8];
                    if read_full(&*self.conn, &mut data).is_err() {
                        self.close();
                        return;
                    }
                    let consumed = u32::from_le_bytes(data[..4].try_into().unwrap());
                    let window = u32::from_le_bytes(data[4..].try_into().unwrap());
                    let stream = self.streams.lock().get(&header.sid).cloned();
                    if let Some(stream) = stream {
                        stream.handle_update(consumed, window);
                    }
                }
                _ => {
                    warn!(cmd = header.cmd, "invalid mux command");
                    self.close();
                    return;
                }
            }
        }
    }

    fn keepalive_loop(self: Arc<Self>) {
        let ping = tick(self.config.keep_alive_interval);
        let check = tick(self.config.keep_alive_timeout);
        loop {
            crossbeam_channel::select! {
                recv(ping) -> _ => {
                    if self.write_frame(CMD_NOP, 0, &[]).is_err() {
                        self.close();
                        return;
                    }
                }
                recv(check) -> _ => {
                    if !self.data_seen.swap(false, Ordering::AcqRel) {
                        warn!("keepalive timeout, tearing session down");
                        self.close();
                        return;
                    }
                }
                recv(self.die_rx) -> _ => return,
            }
        }
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        if !self.dead.swap(true, Ordering::AcqRel) {
            self.die_tx.lock().take();
        }
    }
}

fn read_full(conn: &dyn Conn, buf: &mut [u8]) -> io::Result<()> {
    let mut pos = 0;
    while pos < buf.len() {
        let n = conn.read(&mut buf[pos..])?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        pos += n;
    }
    Ok(())
}
