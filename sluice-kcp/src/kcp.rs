use std::cmp;

use bytes::{Buf, BytesMut};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::error::KcpError;
use crate::pool;
use crate::segment::{Segment, HEADER_LEN};

pub const CMD_PUSH: u8 = 81;
pub const CMD_ACK: u8 = 82;
pub const CMD_WASK: u8 = 83;
pub const CMD_WINS: u8 = 84;

const RTO_NDL: u32 = 30;
const RTO_MIN: u32 = 100;
const RTO_DEF: u32 = 200;
const RTO_MAX: u32 = 60000;

const ASK_SEND: u32 = 1;
const ASK_TELL: u32 = 2;

pub const WND_SND: u16 = 32;
pub const WND_RCV: u16 = 32;

pub const MTU_DEF: usize = 1400;
pub const KCP_OVERHEAD: usize = HEADER_LEN;

const INTERVAL: u32 = 100;
const DEADLINK: u32 = 20;

const THRESH_INIT: u16 = 2;
const THRESH_MIN: u16 = 2;

const PROBE_INIT: u32 = 7000;
const PROBE_LIMIT: u32 = 120000;
const FASTACK_LIMIT: u32 = 5;

#[inline]
fn bound(lower: u32, v: u32, upper: u32) -> u32 {
    cmp::min(cmp::max(lower, v), upper)
}

/// Signed distance between two wrapping 32-bit timestamps or sequence numbers.
#[inline]
fn timediff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}

/// The ARQ state block for one conversation.
///
/// All methods take and release no locks; the owning session serialises
/// access. Outbound packets are handed to the `emit` sink passed into
/// [`Conversation::update`] / [`Conversation::flush`]; each emitted slice is at
/// most `mtu` bytes and begins with `reserved` bytes of headroom the outer
/// layers (FEC, crypto) fill in before the datagram leaves the socket.
pub struct Conversation {
    conv: u32,
    mtu: usize,
    mss: usize,
    state: i32,

    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,

    ssthresh: u16,

    rx_rttvar: u32,
    rx_srtt: u32,
    rx_rto: u32,
    rx_minrto: u32,

    snd_wnd: u16,
    rcv_wnd: u16,
    rmt_wnd: u16,
    cwnd: u16,
    probe: u32,

    current: u32,
    interval: u32,
    ts_flush: u32,
    xmit: u32,

    nodelay: bool,
    updated: bool,

    ts_probe: u32,
    probe_wait: u32,

    dead_link: u32,
    incr: usize,

    // Ring-backed queues; the send buffer in particular must stay contiguous
    // because interval-driven flushes walk it for every active conversation.
    snd_queue: std::collections::VecDeque<Segment>,
    rcv_queue: std::collections::VecDeque<Segment>,
    snd_buf: std::collections::VecDeque<Segment>,
    rcv_buf: std::collections::VecDeque<Segment>,

    acklist: SmallVec<[(u32, u32); 16]>,

    buf: Vec<u8>,
    reserved: usize,

    fastresend: u32,
    fastlimit: u32,
    nocwnd: bool,
    stream: bool,

    stats: FlushStats,
}

/// Transmission counters accumulated across flushes, drained by the session
/// into the process-wide counter block.
#[derive(Default, Clone, Copy, Debug)]
pub struct FlushStats {
    pub out_segs: u64,
    pub retrans_segs: u64,
    pub fast_retrans_segs: u64,
    pub lost_segs: u64,
}

impl Conversation {
    pub fn new(conv: u32, stream: bool) -> Self {
        Conversation {
            conv,
            mtu: MTU_DEF,
            mss: MTU_DEF - KCP_OVERHEAD,
            state: 0,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            ssthresh: THRESH_INIT,
            rx_rttvar: 0,
            rx_srtt: 0,
            rx_rto: RTO_DEF,
            rx_minrto: RTO_MIN,
            snd_wnd: WND_SND,
            rcv_wnd: WND_RCV,
            rmt_wnd: WND_RCV,
            cwnd: 0,
            probe: 0,
            current: 0,
            interval: INTERVAL,
            ts_flush: INTERVAL,
            xmit: 0,
            nodelay: false,
            updated: false,
            ts_probe: 0,
            probe_wait: 0,
            dead_link: DEADLINK,
            incr: 0,
            snd_queue: Default::default(),
            rcv_queue: Default::default(),
            snd_buf: Default::default(),
            rcv_buf: Default::default(),
            acklist: SmallVec::new(),
            buf: pool::get(),
            reserved: 0,
            fastresend: 0,
            fastlimit: FASTACK_LIMIT,
            nocwnd: false,
            stream,
            stats: FlushStats::default(),
        }
    }

    /// Drains the accumulated transmission counters.
    pub fn take_stats(&mut self) -> FlushStats {
        std::mem::take(&mut self.stats)
    }

    /// Current retransmission timeout in ms; the FEC encoder uses it to gate
    /// parity generation on time-correlated data.
    #[inline]
    pub fn rto(&self) -> u32 {
        self.rx_rto
    }

    #[inline]
    pub fn conv(&self) -> u32 {
        self.conv
    }

    #[inline]
    pub fn mss(&self) -> usize {
        self.mss
    }

    /// Number of segments queued or in flight; backpressure threshold for the
    /// session's write path.
    #[inline]
    pub fn wait_snd(&self) -> usize {
        self.snd_buf.len() + self.snd_queue.len()
    }

    /// True once any segment has been retransmitted `dead_link` times; the
    /// peer is assumed gone.
    #[inline]
    pub fn is_dead_link(&self) -> bool {
        self.state != 0
    }

    /// Effective transmit window right now, in segments.
    #[inline]
    pub fn send_window(&self) -> u16 {
        let mut w = cmp::min(self.snd_wnd, self.rmt_wnd);
        if !self.nocwnd {
            w = cmp::min(self.cwnd, w);
        }
        w
    }

    pub fn set_mtu(&mut self, mtu: usize) -> Result<(), KcpError> {
        if mtu < 50 || mtu < KCP_OVERHEAD + self.reserved || mtu > pool::MTU_LIMIT {
            return Err(KcpError::InvalidMtu(mtu));
        }
        self.mtu = mtu;
        self.mss = self.mtu - KCP_OVERHEAD - self.reserved;
        Ok(())
    }

    /// Reserves `n` bytes of headroom at the front of every emitted packet for
    /// the FEC and crypto headers.
    pub fn set_reserved(&mut self, n: usize) -> Result<(), KcpError> {
        if n >= self.mtu - KCP_OVERHEAD {
            return Err(KcpError::InvalidMtu(self.mtu));
        }
        self.reserved = n;
        self.mss = self.mtu - KCP_OVERHEAD - n;
        Ok(())
    }

    pub fn set_wndsize(&mut self, sndwnd: u16, rcvwnd: u16) {
        if sndwnd > 0 {
            self.snd_wnd = sndwnd;
        }
        if rcvwnd > 0 {
            self.rcv_wnd = rcvwnd;
        }
    }

    /// Tunes latency/throughput: `nodelay` shrinks the minimum RTO and slows
    /// RTO growth to 1.5x, `interval` is the flush cadence in ms, `resend`
    /// enables fast retransmit after that many straddling ACKs, `nc` disables
    /// congestion window limiting.
    pub fn set_nodelay(&mut self, nodelay: bool, interval: u32, resend: u32, nc: bool) {
        self.nodelay = nodelay;
        self.rx_minrto = if nodelay { RTO_NDL } else { RTO_MIN };
        self.interval = bound(10, interval, 5000);
        self.fastresend = resend;
        self.nocwnd = nc;
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// Queues application bytes for transmission.
    ///
    /// Stream mode glues the bytes onto the last unsent segment when it has
    /// spare MSS capacity and never sets `frg`; datagram mode fragments with
    /// `frg` counting down to zero on the final piece so the receiver can
    /// reassemble message boundaries.
    pub fn send(&mut self, mut buf: &[u8]) -> Result<usize, KcpError> {
        let mut sent = 0;

        if self.stream {
            if let Some(old) = self.snd_queue.back_mut() {
                if old.data.len() < self.mss {
                    let extend = cmp::min(buf.len(), self.mss - old.data.len());
                    let (head, tail) = buf.split_at(extend);
                    old.data.extend_from_slice(head);
                    old.frg = 0;
                    buf = tail;
                    sent += extend;
                }
            }
            if buf.is_empty() {
                return Ok(sent);
            }
        }

        let count = cmp::max(1, buf.len().div_ceil(self.mss));
        if count >= self.rcv_wnd as usize {
            return Err(KcpError::SendPayloadTooBig(buf.len()));
        }

        for i in 0..count {
            let size = cmp::min(self.mss, buf.len());
            let (head, tail) = buf.split_at(size);
            let mut seg = Segment::with_data(BytesMut::from(head));
            seg.frg = if self.stream { 0 } else { (count - i - 1) as u8 };
            self.snd_queue.push_back(seg);
            buf = tail;
            sent += size;
        }
        Ok(sent)
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Size of the next complete message, or an error if none is ready.
    pub fn peek_size(&self) -> Result<usize, KcpError> {
        let seg = self.rcv_queue.front().ok_or(KcpError::RecvQueueEmpty)?;
        if seg.frg == 0 {
            return Ok(seg.data.len());
        }
        if self.rcv_queue.len() < (seg.frg + 1) as usize {
            return Err(KcpError::ExpectingFragment);
        }
        let mut len = 0;
        for seg in &self.rcv_queue {
            len += seg.data.len();
            if seg.frg == 0 {
                break;
            }
        }
        Ok(len)
    }

    /// Pops the next complete message into `buf`.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize, KcpError> {
        let peeksize = self.peek_size()?;
        if peeksize > buf.len() {
            return Err(KcpError::RecvBufTooSmall(peeksize));
        }

        let fast_recover = self.rcv_queue.len() >= self.rcv_wnd as usize;

        let mut n = 0;
        while let Some(seg) = self.rcv_queue.pop_front() {
            buf[n..n + seg.data.len()].copy_from_slice(&seg.data);
            n += seg.data.len();
            trace!(sn = seg.sn, "recv");
            if seg.frg == 0 {
                break;
            }
        }
        debug_assert_eq!(n, peeksize);

        self.shift_rcv_buf();

        // The window was exhausted before this call freed space; schedule a
        // window-size announcement so the peer resumes.
        if self.rcv_queue.len() < self.rcv_wnd as usize && fast_recover {
            self.probe |= ASK_TELL;
        }

        Ok(n)
    }

    fn shift_rcv_buf(&mut self) {
        while let Some(seg) = self.rcv_buf.front() {
            if seg.sn == self.rcv_nxt && self.rcv_queue.len() < self.rcv_wnd as usize {
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
                let seg = self.rcv_buf.pop_front().unwrap();
                self.rcv_queue.push_back(seg);
            } else {
                break;
            }
        }
    }

    // ------------------------------------------------------------------
    // Input path
    // ------------------------------------------------------------------

    fn update_ack(&mut self, rtt: u32) {
        if self.rx_srtt == 0 {
            self.rx_srtt = rtt;
            self.rx_rttvar = rtt / 2;
        } else {
            let delta = rtt.abs_diff(self.rx_srtt);
            self.rx_rttvar = (3 * self.rx_rttvar + delta) / 4;
            self.rx_srtt = cmp::max(1, (7 * self.rx_srtt + rtt) / 8);
        }
        let rto = self.rx_srtt + cmp::max(self.interval, 4 * self.rx_rttvar);
        self.rx_rto = bound(self.rx_minrto, rto, RTO_MAX);
    }

    #[inline]
    fn shrink_snd_buf(&mut self) {
        self.snd_una = match self.snd_buf.front() {
            Some(seg) => seg.sn,
            None => self.snd_nxt,
        };
    }

    fn parse_ack(&mut self, sn: u32) {
        if timediff(sn, self.snd_una) < 0 || timediff(sn, self.snd_nxt) >= 0 {
            return;
        }
        for i in 0..self.snd_buf.len() {
            match timediff(sn, self.snd_buf[i].sn) {
                0 => {
                    self.snd_buf.remove(i);
                    break;
                }
                d if d < 0 => break,
                _ => {}
            }
        }
    }

    fn parse_una(&mut self, una: u32) {
        while let Some(seg) = self.snd_buf.front() {
            if timediff(una, seg.sn) > 0 {
                self.snd_buf.pop_front();
            } else {
                break;
            }
        }
    }

    fn parse_fastack(&mut self, sn: u32, ts: u32) {
        if timediff(sn, self.snd_una) < 0 || timediff(sn, self.snd_nxt) >= 0 {
            return;
        }
        for seg in &mut self.snd_buf {
            if timediff(sn, seg.sn) < 0 {
                break;
            } else if sn != seg.sn && timediff(ts, seg.ts) >= 0 {
                seg.fastack += 1;
            }
        }
    }

    fn parse_data(&mut self, new_seg: Segment) -> bool {
        let sn = new_seg.sn;
        if timediff(sn, self.rcv_nxt.wrapping_add(self.rcv_wnd as u32)) >= 0
            || timediff(sn, self.rcv_nxt) < 0
        {
            return true;
        }

        let mut repeat = false;
        let mut insert_at = self.rcv_buf.len();
        for seg in self.rcv_buf.iter().rev() {
            if seg.sn == sn {
                repeat = true;
                break;
            }
            if timediff(sn, seg.sn) > 0 {
                break;
            }
            insert_at -= 1;
        }
        if !repeat {
            self.rcv_buf.insert(insert_at, new_seg);
        }
        self.shift_rcv_buf();
        repeat
    }

    /// Feeds one decrypted, FEC-unwrapped datagram into the state machine.
    ///
    /// `regular` is false for payloads recovered by FEC: they still carry
    /// data and ACK information but their timestamps are stale, so they must
    /// not feed the RTT estimator or the remote-window tracker.
    ///
    /// Returns `(segments, duplicates)`: how many segments the datagram
    /// carried and how many PUSH segments were repeats, for the session's
    /// counters.
    pub fn input(&mut self, data: &[u8], regular: bool) -> Result<(usize, usize), KcpError> {
        if data.len() < HEADER_LEN {
            return Err(KcpError::ShortDatagram(data.len()));
        }
        trace!(len = data.len(), regular, "kcp input");

        let snd_una_prior = self.snd_una;
        let mut latest_ts = 0u32;
        let mut max_ack = 0u32;
        let mut has_ack = false;
        let mut segs = 0;
        let mut repeats = 0;

        let mut buf = data;
        while buf.len() >= HEADER_LEN {
            segs += 1;
            let conv = buf.get_u32_le();
            if conv != self.conv {
                return Err(KcpError::ConvMismatch {
                    expected: self.conv,
                    got: conv,
                });
            }
            let cmd = buf.get_u8();
            let frg = buf.get_u8();
            let wnd = buf.get_u16_le();
            let ts = buf.get_u32_le();
            let sn = buf.get_u32_le();
            let una = buf.get_u32_le();
            let len = buf.get_u32_le() as usize;

            if buf.remaining() < len {
                return Err(KcpError::TruncatedSegment {
                    declared: len,
                    remaining: buf.remaining(),
                });
            }

            if regular {
                self.rmt_wnd = wnd;
            }
            self.parse_una(una);
            self.shrink_snd_buf();

            match cmd {
                CMD_ACK => {
                    if timediff(self.current, ts) >= 0 && regular {
                        self.update_ack(timediff(self.current, ts) as u32);
                    }
                    self.parse_ack(sn);
                    self.shrink_snd_buf();
                    if !has_ack {
                        has_ack = true;
                        max_ack = sn;
                        latest_ts = ts;
                    } else if timediff(sn, max_ack) > 0 && timediff(ts, latest_ts) > 0 {
                        max_ack = sn;
                        latest_ts = ts;
                    }
                    trace!(sn, rto = self.rx_rto, "input ack");
                }
                CMD_PUSH => {
                    if timediff(sn, self.rcv_nxt.wrapping_add(self.rcv_wnd as u32)) < 0 {
                        self.acklist.push((sn, ts));
                        if timediff(sn, self.rcv_nxt) >= 0 {
                            let mut seg = Segment::with_data(BytesMut::from(&buf[..len]));
                            seg.conv = conv;
                            seg.cmd = cmd;
                            seg.frg = frg;
                            seg.wnd = wnd;
                            seg.ts = ts;
                            seg.sn = sn;
                            seg.una = una;
                            if self.parse_data(seg) {
                                repeats += 1;
                            }
                        } else {
                            repeats += 1;
                        }
                    }
                }
                CMD_WASK => {
                    self.probe |= ASK_TELL;
                }
                CMD_WINS => {
                    trace!(wnd, "input wins");
                }
                _ => return Err(KcpError::UnknownCommand(cmd)),
            }
            buf.advance(len);
        }

        if has_ack {
            self.parse_fastack(max_ack, latest_ts);
        }

        // Congestion window growth on forward progress, clamped by the
        // remote window: classic slow start below ssthresh, then additive
        // increase driven by `incr`.
        if timediff(self.snd_una, snd_una_prior) > 0 && self.cwnd < self.rmt_wnd {
            let mss = self.mss;
            if self.cwnd < self.ssthresh {
                self.cwnd += 1;
                self.incr += mss;
            } else {
                if self.incr < mss {
                    self.incr = mss;
                }
                self.incr += (mss * mss) / self.incr + (mss / 16);
                if (self.cwnd as usize + 1) * mss <= self.incr {
                    self.cwnd = ((self.incr + mss - 1) / cmp::max(1, mss)) as u16;
                }
            }
            if self.cwnd > self.rmt_wnd {
                self.cwnd = self.rmt_wnd;
                self.incr = self.rmt_wnd as usize * mss;
            }
        }

        Ok((segs, repeats))
    }

    #[inline]
    pub fn snd_wnd(&self) -> u16 {
        self.snd_wnd
    }

    #[inline]
    pub fn rmt_wnd(&self) -> u16 {
        self.rmt_wnd
    }

    // ------------------------------------------------------------------
    // Flush path
    // ------------------------------------------------------------------

    #[inline]
    fn wnd_unused(&self) -> u16 {
        (self.rcv_wnd as usize).saturating_sub(self.rcv_queue.len()) as u16
    }

    /// Emits pending ACKs, window probes and data within the current window,
    /// packing segments into MTU-sized slices handed to `emit`.
    ///
    /// With `ack_only` the data path is skipped entirely; the session uses
    /// that for the acknowledge-without-delay mode. Returns the suggested
    /// delay in ms until the next flush.
    pub fn flush(&mut self, ack_only: bool, emit: &mut dyn FnMut(&[u8])) -> u32 {
        let mut buf = std::mem::take(&mut self.buf);
        if buf.len() < self.reserved {
            buf.resize(self.reserved, 0);
        }
        let reserved = self.reserved;
        let mtu = self.mtu;

        let mut seg = Segment {
            conv: self.conv,
            cmd: CMD_ACK,
            wnd: self.wnd_unused(),
            una: self.rcv_nxt,
            ..Default::default()
        };

        fn make_space(buf: &mut Vec<u8>, need: usize, mtu: usize, reserved: usize, emit: &mut dyn FnMut(&[u8])) {
            if buf.len() + need > mtu {
                emit(buf);
                buf.truncate(reserved);
            }
        }

        for &(sn, ts) in &self.acklist {
            make_space(&mut buf, HEADER_LEN, mtu, reserved, emit);
            seg.sn = sn;
            seg.ts = ts;
            seg.encode(&mut buf);
        }
        self.acklist.clear();

        if ack_only {
            if buf.len() > reserved {
                emit(&buf);
                buf.truncate(reserved);
            }
            self.buf = buf;
            return self.interval;
        }

        // Window probing: once the remote window reaches zero, ask for its
        // size with exponential backoff between PROBE_INIT and PROBE_LIMIT.
        if self.rmt_wnd == 0 {
            if self.probe_wait == 0 {
                self.probe_wait = PROBE_INIT;
                self.ts_probe = self.current.wrapping_add(self.probe_wait);
            } else if timediff(self.current, self.ts_probe) >= 0 {
                if self.probe_wait < PROBE_INIT {
                    self.probe_wait = PROBE_INIT;
                }
                self.probe_wait += self.probe_wait / 2;
                if self.probe_wait > PROBE_LIMIT {
                    self.probe_wait = PROBE_LIMIT;
                }
                self.ts_probe = self.current.wrapping_add(self.probe_wait);
                self.probe |= ASK_SEND;
            }
        } else {
            self.ts_probe = 0;
            self.probe_wait = 0;
        }

        if self.probe & ASK_SEND != 0 {
            seg.cmd = CMD_WASK;
            make_space(&mut buf, HEADER_LEN, mtu, reserved, emit);
            seg.encode(&mut buf);
        }
        if self.probe & ASK_TELL != 0 {
            seg.cmd = CMD_WINS;
            make_space(&mut buf, HEADER_LEN, mtu, reserved, emit);
            seg.encode(&mut buf);
        }
        self.probe = 0;

        let cwnd = self.send_window();

        // Admit queued segments into the send buffer while window space
        // remains, stamping sequence numbers on the way in.
        while timediff(self.snd_nxt, self.snd_una.wrapping_add(cwnd as u32)) < 0 {
            match self.snd_queue.pop_front() {
                Some(mut new_seg) => {
                    new_seg.conv = self.conv;
                    new_seg.cmd = CMD_PUSH;
                    new_seg.sn = self.snd_nxt;
                    self.snd_nxt = self.snd_nxt.wrapping_add(1);
                    self.snd_buf.push_back(new_seg);
                }
                None => break,
            }
        }

        let resent = if self.fastresend > 0 {
            self.fastresend
        } else {
            u32::MAX
        };
        let rtomin = if self.nodelay { 0 } else { self.rx_rto >> 3 };

        let mut lost = false;
        let mut change = false;
        let mut min_resend_delta = self.interval;

        let wnd = self.wnd_unused();
        for snd_seg in &mut self.snd_buf {
            let mut need_send = false;

            if snd_seg.xmit == 0 {
                // First transmission.
                need_send = true;
                snd_seg.rto = self.rx_rto;
                snd_seg.resendts = self.current.wrapping_add(snd_seg.rto + rtomin);
            } else if snd_seg.fastack >= resent
                && (snd_seg.xmit <= self.fastlimit || self.fastlimit == 0)
            {
                // Enough later ACKs straddled this segment: fast retransmit.
                need_send = true;
                snd_seg.fastack = 0;
                snd_seg.resendts = self.current.wrapping_add(snd_seg.rto);
                change = true;
                self.stats.fast_retrans_segs += 1;
                self.stats.retrans_segs += 1;
            } else if timediff(self.current, snd_seg.resendts) >= 0 {
                // Retransmission timeout; grow the RTO 1.5x (nodelay) or 2x.
                need_send = true;
                self.xmit += 1;
                if self.nodelay {
                    snd_seg.rto += snd_seg.rto / 2;
                } else {
                    snd_seg.rto += cmp::max(snd_seg.rto, self.rx_rto);
                }
                snd_seg.rto = cmp::min(snd_seg.rto, RTO_MAX);
                snd_seg.resendts = self.current.wrapping_add(snd_seg.rto);
                lost = true;
                self.stats.lost_segs += 1;
                self.stats.retrans_segs += 1;
            }

            if need_send {
                self.stats.out_segs += 1;
                snd_seg.xmit += 1;
                snd_seg.ts = self.current;
                snd_seg.wnd = wnd;
                snd_seg.una = self.rcv_nxt;

                make_space(&mut buf, snd_seg.wire_len(), mtu, reserved, emit);
                snd_seg.encode(&mut buf);

                if snd_seg.xmit >= self.dead_link {
                    self.state = -1;
                    debug!(sn = snd_seg.sn, xmit = snd_seg.xmit, "dead link");
                }
            }

            let delta = timediff(snd_seg.resendts, self.current);
            if delta > 0 && (delta as u32) < min_resend_delta {
                min_resend_delta = delta as u32;
            }
        }

        if buf.len() > reserved {
            emit(&buf);
            buf.truncate(reserved);
        }
        self.buf = buf;

        // Congestion response. Fast retransmit halves the pipe estimate;
        // a timeout collapses the window to one segment.
        if change {
            let inflight = self.snd_nxt.wrapping_sub(self.snd_una);
            self.ssthresh = cmp::max((inflight / 2) as u16, THRESH_MIN);
            self.cwnd = self.ssthresh + resent.min(u16::MAX as u32) as u16;
            self.incr = self.cwnd as usize * self.mss;
        }
        if lost {
            self.ssthresh = cmp::max(cwnd / 2, THRESH_MIN);
            self.cwnd = 1;
            self.incr = self.mss;
        }
        if self.cwnd < 1 {
            self.cwnd = 1;
            self.incr = self.mss;
        }

        min_resend_delta
    }

    /// Advances the clock and flushes when the interval elapses. `current` is
    /// a caller-supplied monotonic millisecond counter.
    pub fn update(&mut self, current: u32, emit: &mut dyn FnMut(&[u8])) {
        self.current = current;

        if !self.updated {
            self.updated = true;
            self.ts_flush = self.current;
        }

        let mut slap = timediff(self.current, self.ts_flush);
        if !(-10000..10000).contains(&slap) {
            self.ts_flush = self.current;
            slap = 0;
        }

        if slap >= 0 {
            self.ts_flush = self.ts_flush.wrapping_add(self.interval);
            if timediff(self.current, self.ts_flush) >= 0 {
                self.ts_flush = self.current.wrapping_add(self.interval);
            }
            self.flush(false, emit);
        }
    }

    /// Flush driven externally at a fixed cadence (the shared scheduler
    /// path): stamps the clock and flushes unconditionally.
    pub fn update_now(&mut self, current: u32, emit: &mut dyn FnMut(&[u8])) -> u32 {
        self.current = current;
        self.updated = true;
        self.flush(false, emit)
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        pool::put(std::mem::take(&mut self.buf));
    }
}
