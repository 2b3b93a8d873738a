use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::MuxError;
use crate::frame::{CMD_FIN, CMD_PSH, CMD_UPD};
use crate::session::MuxSession;

struct RecvBuf {
    chunks: VecDeque<Vec<u8>>,
    /// Read offset into the front chunk.
    head: usize,
    bytes: usize,
}

/// One logical stream inside a [`MuxSession`].
///
/// Reads pop from a per-stream chunk queue fed by the session's receive
/// loop; writes frame the bytes and go out through the shared connection.
/// Version 2 adds a credit window in each direction.
pub struct MuxStream {
    sid: u32,
    session: Weak<MuxSession>,
    version: u8,
    max_frame_size: usize,
    max_stream_buffer: usize,

    recv: Mutex<RecvBuf>,

    ch_read_tx: Sender<()>,
    ch_read_rx: Receiver<()>,
    ch_window_tx: Sender<()>,
    ch_window_rx: Receiver<()>,
    die_rx: Receiver<()>,
    die_tx: Mutex<Option<Sender<()>>>,

    /// Peer sent FIN; reads drain and then report end-of-stream.
    fin: AtomicBool,
    /// Locally closed.
    dead: AtomicBool,
    /// Session torn down underneath us.
    sess_dead: AtomicBool,

    rd_deadline: Mutex<Option<Instant>>,
    wr_deadline: Mutex<Option<Instant>>,

    // Version 2 credit accounting, all wrapping u32 totals.
    num_read: AtomicU32,
    incr: AtomicU32,
    num_sent: AtomicU32,
    peer_consumed: AtomicU32,
    peer_window: AtomicU32,
}

impl MuxStream {
    pub(crate) fn new(
        sid: u32,
        session: Weak<MuxSession>,
        version: u8,
        max_frame_size: usize,
        max_stream_buffer: usize,
    ) -> Arc<MuxStream> {
        let (ch_read_tx, ch_read_rx) = bounded(1);
        let (ch_window_tx, ch_window_rx) = bounded(1);
        let (die_tx, die_rx) = bounded::<()>(0);
        Arc::new(MuxStream {
            sid,
            session,
            version,
            max_frame_size,
            max_stream_buffer,
            recv: Mutex::new(RecvBuf {
                chunks: VecDeque::new(),
                head: 0,
                bytes: 0,
            }),
            ch_read_tx,
            ch_read_rx,
            ch_window_tx,
            ch_window_rx,
            die_rx,
            die_tx: Mutex::new(Some(die_tx)),
            fin: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            sess_dead: AtomicBool::new(false),
            rd_deadline: Mutex::new(None),
            wr_deadline: Mutex::new(None),
            num_read: AtomicU32::new(0),
            incr: AtomicU32::new(0),
            num_sent: AtomicU32::new(0),
            peer_consumed: AtomicU32::new(0),
            peer_window: AtomicU32::new(max_stream_buffer as u32),
        })
    }

    #[inline]
    pub fn sid(&self) -> u32 {
        self.sid
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.rd_deadline.lock() = deadline;
        let _ = self.ch_read_tx.try_send(());
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        *self.wr_deadline.lock() = deadline;
        let _ = self.ch_window_tx.try_send(());
    }

    /// Blocking read; `Ok(0)` after the peer's FIN has drained.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.dead.load(Ordering::Acquire) {
                return Err(MuxError::ClosedPipe.into());
            }

            let popped = {
                let mut recv = self.recv.lock();
                if recv.bytes > 0 {
                    let mut n = 0;
                    while n < buf.len() {
                        let Some(front) = recv.chunks.front() else { break };
                        let avail = front.len() - recv.head;
                        let take = avail.min(buf.len() - n);
                        buf[n..n + take]
                            .copy_from_slice(&recv.chunks[0][recv.head..recv.head + take]);
                        n += take;
                        recv.head += take;
                        if recv.head >= recv.chunks[0].len() {
                            recv.chunks.pop_front();
                            recv.head = 0;
                        }
                    }
                    recv.bytes -= n;
                    Some(n)
                } else {
                    None
                }
            };

            if let Some(n) = popped {
                self.on_consumed(n)?;
                return Ok(n);
            }

            if self.fin.load(Ordering::Acquire) {
                return Ok(0);
            }
            if self.sess_dead.load(Ordering::Acquire) {
                return Err(MuxError::ClosedPipe.into());
            }

            self.wait(&self.ch_read_rx, *self.rd_deadline.lock())?;
        }
    }

    /// Returns receive credit to the session's aggregate budget and, on
    /// version 2, announces per-stream credit to the peer.
    fn on_consumed(&self, n: usize) -> io::Result<()> {
        let Some(sess) = self.session.upgrade() else {
            return Ok(());
        };
        sess.return_tokens(n);
        if self.version == 1 {
            return Ok(());
        }
        let consumed = self.num_read.fetch_add(n as u32, Ordering::AcqRel) + n as u32;
        let incr = self.incr.fetch_add(n as u32, Ordering::AcqRel) + n as u32;
        // Announce new credit only once the consumer has drained a
        // meaningful share of the window.
        if incr as usize >= self.max_stream_buffer / 2 {
            self.incr.store(0, Ordering::Release);
            let mut payload = [0u8; 8];
            payload[..4].copy_from_slice(&consumed.to_le_bytes());
            payload[4..].copy_from_slice(&(self.max_stream_buffer as u32).to_le_bytes());
            sess.write_frame(CMD_UPD, self.sid, &payload)?;
        }
        Ok(())
    }

    /// Blocking write; splits into `max_frame_size` PSH frames. Version 2
    /// waits for peer credit before each frame.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        for chunk in buf.chunks(self.max_frame_size) {
            if self.version >= 2 {
                self.wait_for_credit(chunk.len())?;
            }
            if self.dead.load(Ordering::Acquire) || self.sess_dead.load(Ordering::Acquire) {
                return Err(MuxError::ClosedPipe.into());
            }
            let sess = self
                .session
                .upgrade()
                .ok_or_else(|| io::Error::from(MuxError::ClosedPipe))?;
            sess.write_frame(CMD_PSH, self.sid, chunk)?;
            self.num_sent.fetch_add(chunk.len() as u32, Ordering::AcqRel);
        }
        Ok(buf.len())
    }

    fn wait_for_credit(&self, need: usize) -> io::Result<()> {
        loop {
            if self.dead.load(Ordering::Acquire) || self.sess_dead.load(Ordering::Acquire) {
                return Err(MuxError::ClosedPipe.into());
            }
            let inflight = self
                .num_sent
                .load(Ordering::Acquire)
                .wrapping_sub(self.peer_consumed.load(Ordering::Acquire));
            let window = self.peer_window.load(Ordering::Acquire);
            if inflight as usize + need <= window as usize {
                return Ok(());
            }
            self.wait(&self.ch_window_rx, *self.wr_deadline.lock())?;
        }
    }

    fn wait(&self, event: &Receiver<()>, deadline: Option<Instant>) -> io::Result<()> {
        match deadline {
            Some(d) => match d.checked_duration_since(Instant::now()) {
                None => Err(MuxError::Timeout.into()),
                Some(timeout) => {
                    crossbeam_channel::select! {
                        recv(event) -> _ => Ok(()),
                        recv(self.die_rx) -> _ => Ok(()),
                        default(timeout) => Err(MuxError::Timeout.into()),
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

    /// Half-closes towards the peer and detaches from the session.
    pub fn close(&self) {
        if self.dead.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(sess) = self.session.upgrade() {
            let _ = sess.write_frame(CMD_FIN, self.sid, &[]);
            sess.remove_stream(self.sid, self.buffered());
        }
        self.die_tx.lock().take();
    }

    fn buffered(&self) -> usize {
        let recv = self.recv.lock();
        recv.bytes
    }

    // ------------------------------------------------------------------
    // Session-side entry points
    // ------------------------------------------------------------------

    pub(crate) fn push_bytes(&self, data: Vec<u8>) {
        let mut recv = self.recv.lock();
        recv.bytes += data.len();
        recv.chunks.push_back(data);
        drop(recv);
        let _ = self.ch_read_tx.try_send(());
    }

    pub(crate) fn handle_fin(&self) {
        self.fin.store(true, Ordering::Release);
        let _ = self.ch_read_tx.try_send(());
    }

    pub(crate) fn handle_update(&self, consumed: u32, window: u32) {
        self.peer_consumed.store(consumed, Ordering::Release);
        self.peer_window.store(window, Ordering::Release);
        let _ = self.ch_window_tx.try_send(());
    }

    pub(crate) fn session_closed(&self) {
        self.sess_dead.store(true, Ordering::Release);
        self.die_tx.lock().take();
    }
}

impl crate::conn::Conn for MuxStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        MuxStream::read(self, buf)
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        MuxStream::write(self, buf).map(|_| ())
    }

    fn close(&self) {
        MuxStream::close(self)
    }
}
